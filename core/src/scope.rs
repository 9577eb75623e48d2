//! Delivery scopes.
//!
//! A [`Scope`] selects which addresses of a space receive an emitted event.
//! Scopes cross the wire inside envelopes, so custom predicates are built by
//! composing the serializable variants instead of arbitrary closures.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::{Address, ParticipantId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Scope {
    /// Every participant of the space.
    #[default]
    All,
    /// Exactly these addresses.
    Addresses(BTreeSet<Address>),
    /// Participants with these identities, whatever space the address names.
    Participants(BTreeSet<ParticipantId>),
    /// Everybody but these addresses.
    Except(BTreeSet<Address>),
    /// Matches when any inner scope matches.
    AnyOf(Vec<Scope>),
    Not(Box<Scope>),
}

impl Scope {
    pub fn all() -> Self {
        Scope::All
    }

    pub fn addresses<I>(addresses: I) -> Self
    where
        I: IntoIterator<Item = Address>,
    {
        Scope::Addresses(addresses.into_iter().collect())
    }

    pub fn participants<I>(participants: I) -> Self
    where
        I: IntoIterator<Item = ParticipantId>,
    {
        Scope::Participants(participants.into_iter().collect())
    }

    pub fn except<I>(addresses: I) -> Self
    where
        I: IntoIterator<Item = Address>,
    {
        Scope::Except(addresses.into_iter().collect())
    }

    pub fn matches(&self, address: &Address) -> bool {
        match self {
            Scope::All => true,
            Scope::Addresses(set) => set.contains(address),
            Scope::Participants(set) => set.contains(&address.participant_id),
            Scope::Except(set) => !set.contains(address),
            Scope::AnyOf(scopes) => scopes.iter().any(|s| s.matches(address)),
            Scope::Not(inner) => !inner.matches(address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ContextId, SpaceId};

    fn addr(space: &SpaceId) -> Address {
        Address::new(space.clone(), ParticipantId::new_v4())
    }

    #[test]
    fn address_scope_is_exact() {
        let space = SpaceId::random(ContextId::new_v4());
        let (a, b) = (addr(&space), addr(&space));
        let scope = Scope::addresses([a.clone()]);
        assert!(scope.matches(&a));
        assert!(!scope.matches(&b));
        assert!(Scope::except([a.clone()]).matches(&b));
        assert!(!Scope::except([a.clone()]).matches(&a));
    }

    #[test]
    fn composed_scopes() {
        let space = SpaceId::random(ContextId::new_v4());
        let (a, b, c) = (addr(&space), addr(&space), addr(&space));
        let scope = Scope::AnyOf(vec![
            Scope::addresses([a.clone()]),
            Scope::participants([b.participant_id]),
        ]);
        assert!(scope.matches(&a));
        assert!(scope.matches(&b));
        assert!(!scope.matches(&c));
        assert!(Scope::Not(Box::new(scope)).matches(&c));
    }

    #[test]
    fn participant_scope_ignores_space() {
        let ctx = ContextId::new_v4();
        let pid = ParticipantId::new_v4();
        let other = Address::new(SpaceId::random(ctx), pid);
        assert!(Scope::participants([pid]).matches(&other));
    }
}
