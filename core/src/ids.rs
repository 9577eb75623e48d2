//! Identifiers and addressing.
//!
//! Contexts, spaces and participants are named by 128-bit UUIDs. A [`SpaceId`]
//! additionally carries the [`SpaceSpecification`] naming the behavioral variant
//! of the space, and an [`Address`] pins a participant inside one space.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Topic on which every space of this context is multicast between kernels.
    pub fn topic(&self) -> Vec<u8> {
        self.0.hyphenated().to_string().into_bytes()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of an entity taking part in one or more spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Behavioral variant of a space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum SpaceSpecification {
    /// Every participant may emit, every matching participant receives.
    #[default]
    OpenEvent,
    /// Application-defined variant, delivered like an open event space by the core.
    Named(String),
}

impl fmt::Display for SpaceSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceSpecification::OpenEvent => f.write_str("open-event-space"),
            SpaceSpecification::Named(name) => f.write_str(name),
        }
    }
}

/// Full identifier of a space: owning context, space uuid and specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpaceId {
    pub context_id: ContextId,
    pub id: Uuid,
    pub specification: SpaceSpecification,
}

impl SpaceId {
    pub fn new(context_id: ContextId, id: Uuid, specification: SpaceSpecification) -> Self {
        Self {
            context_id,
            id,
            specification,
        }
    }

    /// Open event space with the given uuid inside `context_id`.
    pub fn open(context_id: ContextId, id: Uuid) -> Self {
        Self::new(context_id, id, SpaceSpecification::OpenEvent)
    }

    /// Open event space with a fresh uuid.
    pub fn random(context_id: ContextId) -> Self {
        Self::open(context_id, Uuid::new_v4())
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}[{}]", self.context_id, self.id, self.specification)
    }
}

/// Location of a participant inside a space.
///
/// An address is only meaningful relative to the space it names; a participant
/// holds one address per joined space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub space_id: SpaceId,
    pub participant_id: ParticipantId,
}

impl Address {
    pub fn new(space_id: SpaceId, participant_id: ParticipantId) -> Self {
        Self {
            space_id,
            participant_id,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.participant_id, self.space_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_the_hyphenated_context_uuid() {
        let ctx = ContextId::new_v4();
        assert_eq!(ctx.topic(), ctx.to_string().into_bytes());
        assert_eq!(ctx.topic().len(), 36);
    }

    #[test]
    fn space_ids_differ_by_specification() {
        let ctx = ContextId::new_v4();
        let id = Uuid::new_v4();
        let open = SpaceId::open(ctx, id);
        let named = SpaceId::new(ctx, id, SpaceSpecification::Named("restricted".into()));
        assert_ne!(open, named);
        assert_eq!(open.specification.to_string(), "open-event-space");
    }

    #[test]
    fn address_json_shape_is_stable() {
        let ctx = ContextId::new_v4();
        let addr = Address::new(SpaceId::random(ctx), ParticipantId::new_v4());
        let json = serde_json::to_value(&addr).unwrap();
        assert_eq!(json["space_id"]["context_id"], ctx.to_string());
        let back: Address = serde_json::from_value(json).unwrap();
        assert_eq!(back, addr);
    }
}
