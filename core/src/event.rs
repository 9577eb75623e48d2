// Event model
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::Address;

/// Reserved event type names.
pub mod types {
    /// Lifecycle marker delivered through immediate dispatch when an entity starts.
    pub const INITIALIZE: &str = "lifecycle.initialize";
    /// Lifecycle marker delivered through immediate dispatch when an entity stops.
    pub const DESTROY: &str = "lifecycle.destroy";
    /// Common supertype of the lifecycle markers.
    pub const LIFECYCLE: &str = "lifecycle";
    /// Wrapper for an event that no guard evaluator matched.
    pub const DEAD_EVENT: &str = "dead_event";
    /// A participant joined a space.
    pub const PARTICIPANT_JOINED: &str = "space.participant_joined";
    /// A participant left a space.
    pub const PARTICIPANT_LEFT: &str = "space.participant_left";
}

/// Reserved metadata keys.
pub mod keys {
    /// Type of the event wrapped by a dead event.
    pub const DEAD_ORIGINAL_TYPE: &str = "dead.original_type";
}

/// An immutable payload routed through spaces and dispatchers.
///
/// `r#type` is a dotted name; `a.b.c` is also an instance of its supertypes
/// `a.b` and `a` (see [`Event::type_hierarchy`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub r#type: String,
    /// Emitter address, set when the event is emitted into a space.
    pub source: Option<Address>,
    pub metadata: HashMap<String, String>,
    pub payload: serde_json::Value,
    pub timestamp_ms: i64,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            r#type: event_type.into(),
            source: None,
            metadata: HashMap::new(),
            payload,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Event without payload.
    pub fn signal(event_type: impl Into<String>) -> Self {
        Self::new(event_type, serde_json::Value::Null)
    }

    pub fn with_source(mut self, source: Address) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Iterates over the event type followed by each of its supertypes.
    ///
    /// ```
    /// use loom_kernel::Event;
    ///
    /// let evt = Event::signal("sensor.audio.chunk");
    /// let chain: Vec<&str> = evt.type_hierarchy().collect();
    /// assert_eq!(chain, vec!["sensor.audio.chunk", "sensor.audio", "sensor"]);
    /// ```
    pub fn type_hierarchy(&self) -> impl Iterator<Item = &str> + '_ {
        let ty = self.r#type.as_str();
        std::iter::successors(Some(ty), |current| {
            let current: &str = current;
            current.rfind('.').map(|idx| &current[..idx])
        })
        .filter(|s| !s.is_empty())
    }

    pub fn is_instance_of(&self, event_type: &str) -> bool {
        self.type_hierarchy().any(|t| t == event_type)
    }

    /// Lifecycle markers go through immediate dispatch.
    pub fn is_lifecycle_marker(&self) -> bool {
        self.r#type == types::INITIALIZE || self.r#type == types::DESTROY
    }

    pub fn initialize(params: serde_json::Value) -> Self {
        Self::new(types::INITIALIZE, params)
    }

    pub fn destroy() -> Self {
        Self::signal(types::DESTROY)
    }

    pub fn is_dead_event(&self) -> bool {
        self.r#type == types::DEAD_EVENT
    }

    /// Wraps an event that nobody listened to.
    pub fn dead_letter_of(original: &Event) -> Self {
        let payload = serde_json::to_value(original).unwrap_or(serde_json::Value::Null);
        let mut dead = Self::new(types::DEAD_EVENT, payload);
        dead.source = original.source.clone();
        dead.metadata
            .insert(keys::DEAD_ORIGINAL_TYPE.into(), original.r#type.clone());
        dead
    }

    /// The event wrapped by a dead event, if this is one.
    pub fn wrapped_event(&self) -> Option<Event> {
        if !self.is_dead_event() {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_of_flat_type_is_itself() {
        let evt = Event::signal("ping");
        assert_eq!(evt.type_hierarchy().collect::<Vec<_>>(), vec!["ping"]);
        assert!(evt.is_instance_of("ping"));
        assert!(!evt.is_instance_of("pin"));
    }

    #[test]
    fn lifecycle_markers_share_supertype() {
        assert!(Event::initialize(serde_json::json!({})).is_instance_of(types::LIFECYCLE));
        assert!(Event::destroy().is_lifecycle_marker());
        assert!(!Event::signal("lifecycle").is_lifecycle_marker());
    }

    #[test]
    fn dead_letter_keeps_original() {
        let original = Event::new("ping", serde_json::json!({"n": 3})).with_metadata("k", "v");
        let dead = Event::dead_letter_of(&original);
        assert!(dead.is_dead_event());
        assert_eq!(
            dead.metadata.get(keys::DEAD_ORIGINAL_TYPE),
            Some(&"ping".to_string())
        );
        assert_eq!(dead.wrapped_event(), Some(original.clone()));
        assert_eq!(original.wrapped_event(), None);
    }
}
