// Space: membership and local delivery
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::event::Event;
use crate::ids::{Address, ParticipantId, SpaceId};
use crate::scope::Scope;
use crate::{KernelError, Result};

/// Receiving side of a participant.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Identity under which the listener joins spaces.
    fn participant_id(&self) -> ParticipantId;

    /// Called once per delivered event, in delivery order for this space.
    async fn receive_event(&self, event: Event);
}

/// Cross-kernel publication seam used by spaces.
#[cfg_attr(test, mockall::automock)]
pub trait SpaceNetwork: Send + Sync {
    /// A space of this kernel became live.
    fn register(&self, space: &SpaceId);
    /// A space of this kernel was destroyed.
    fn unregister(&self, space: &SpaceId);
    /// Multicasts an event emitted locally into `space`.
    fn publish(&self, space: &SpaceId, scope: &Scope, event: &Event) -> Result<()>;
}

/// Membership change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantChange {
    Joined(Address),
    Left(Address),
}

/// The forwarder task drains the queue and exits once `sender` is dropped.
struct Participant {
    address: Address,
    sender: mpsc::UnboundedSender<Event>,
}

/// Addressable delivery and membership unit inside a context.
pub struct Space {
    id: SpaceId,
    participants: DashMap<ParticipantId, Participant>,
    network: Option<Arc<dyn SpaceNetwork>>,
    changes: broadcast::Sender<ParticipantChange>,
}

impl Space {
    pub fn new(id: SpaceId, network: Option<Arc<dyn SpaceNetwork>>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            id,
            participants: DashMap::new(),
            network,
            changes,
        }
    }

    pub fn id(&self) -> &SpaceId {
        &self.id
    }

    /// Joins `listener` to the space.
    ///
    /// A listener whose identity already holds an address here is rejected
    /// with [`KernelError::DuplicateParticipant`].
    pub fn register(&self, listener: Arc<dyn EventListener>) -> Result<Address> {
        let participant_id = listener.participant_id();
        let address = match self.participants.entry(participant_id) {
            Entry::Occupied(_) => {
                return Err(KernelError::DuplicateParticipant {
                    participant: participant_id,
                    space: self.id.clone(),
                })
            }
            Entry::Vacant(slot) => {
                let address = Address::new(self.id.clone(), participant_id);
                let (sender, mut rx) = mpsc::unbounded_channel::<Event>();
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        listener.receive_event(event).await;
                    }
                });
                slot.insert(Participant {
                    address: address.clone(),
                    sender,
                });
                address
            }
        };

        info!(target: "space", space = %self.id, participant = %participant_id, "Participant joined");
        let _ = self.changes.send(ParticipantChange::Joined(address.clone()));
        Ok(address)
    }

    /// Removes a participant. Events already queued for it are still delivered.
    pub fn unregister(&self, participant_id: ParticipantId) -> Result<Address> {
        let (_, participant) =
            self.participants
                .remove(&participant_id)
                .ok_or_else(|| KernelError::NotAParticipant {
                    participant: participant_id,
                    space: self.id.clone(),
                })?;

        info!(target: "space", space = %self.id, participant = %participant_id, "Participant left");
        let _ = self
            .changes
            .send(ParticipantChange::Left(participant.address.clone()));
        Ok(participant.address)
    }

    pub fn address_of(&self, participant_id: ParticipantId) -> Option<Address> {
        self.participants
            .get(&participant_id)
            .map(|p| p.address.clone())
    }

    pub fn participants(&self) -> Vec<Address> {
        self.participants
            .iter()
            .map(|p| p.address.clone())
            .collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ParticipantChange> {
        self.changes.subscribe()
    }

    /// Emits an event to every participant matching `scope`, here and on
    /// the other kernels.
    ///
    /// Returns the number of local recipients.
    ///
    /// # Panics
    ///
    /// When the event has no source or its source lies in another space.
    pub fn emit(&self, event: Event, scope: Scope) -> usize {
        let source_space = event.source.as_ref().map(|s| &s.space_id);
        assert!(
            source_space == Some(&self.id),
            "event {} emitted into space {} with source space {:?}",
            event.id,
            self.id,
            source_space
        );

        if let Some(network) = &self.network {
            if let Err(e) = network.publish(&self.id, &scope, &event) {
                warn!(target: "space", space = %self.id, event_id = %event.id, error = %e, "Network publication failed");
            }
        }
        self.fan_out(&scope, event)
    }

    /// Emits to every participant.
    pub fn emit_to_all(&self, event: Event) -> usize {
        self.emit(event, Scope::All)
    }

    /// Local fan-out of an event received from another kernel.
    pub fn deliver_from_network(&self, scope: &Scope, event: Event) -> usize {
        self.fan_out(scope, event)
    }

    fn fan_out(&self, scope: &Scope, event: Event) -> usize {
        let mut delivered = 0;
        for participant in self.participants.iter() {
            if !scope.matches(&participant.address) {
                continue;
            }
            if participant.sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                warn!(target: "space", space = %self.id, participant = %participant.address.participant_id, "Participant mailbox closed");
            }
        }
        debug!(target: "space", space = %self.id, event_id = %event.id, delivered, "Local fan-out");
        delivered
    }

    /// Drops every participant; called when the owning context goes away.
    pub(crate) fn close(&self) {
        let ids: Vec<ParticipantId> = self.participants.iter().map(|p| *p.key()).collect();
        for id in ids {
            if let Some((_, participant)) = self.participants.remove(&id) {
                let _ = self.changes.send(ParticipantChange::Left(participant.address));
            }
        }
        debug!(target: "space", space = %self.id, "Space closed");
    }
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("id", &self.id)
            .field("participants", &self.participants.len())
            .field("networked", &self.network.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ContextId;
    use std::time::Duration;

    struct Recorder {
        id: ParticipantId,
        tx: mpsc::UnboundedSender<Event>,
    }

    #[async_trait]
    impl EventListener for Recorder {
        fn participant_id(&self) -> ParticipantId {
            self.id
        }

        async fn receive_event(&self, event: Event) {
            let _ = self.tx.send(event);
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                id: ParticipantId::new_v4(),
                tx,
            }),
            rx,
        )
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Option<Event> {
        tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn local_space() -> Space {
        Space::new(SpaceId::random(ContextId::new_v4()), None)
    }

    #[tokio::test]
    async fn register_unregister_restores_count() {
        let space = local_space();
        let (x, _rx) = recorder();
        let before = space.participant_count();

        let address = space.register(x.clone()).unwrap();
        assert_eq!(address.space_id, *space.id());
        assert_eq!(space.participant_count(), before + 1);
        assert!(matches!(
            space.register(x.clone()),
            Err(KernelError::DuplicateParticipant { .. })
        ));

        assert_eq!(space.unregister(x.id).unwrap(), address);
        assert_eq!(space.participant_count(), before);
        assert!(matches!(
            space.unregister(x.id),
            Err(KernelError::NotAParticipant { .. })
        ));
    }

    #[tokio::test]
    async fn scoped_emit_reaches_only_selected_address() {
        let space = local_space();
        let (x, mut x_rx) = recorder();
        let (y, mut y_rx) = recorder();
        let ax = space.register(x).unwrap();
        let _ay = space.register(y).unwrap();

        let evt = Event::signal("hello").with_source(ax.clone());
        assert_eq!(space.emit(evt.clone(), Scope::addresses([ax])), 1);

        assert_eq!(next(&mut x_rx).await.map(|e| e.id), Some(evt.id));
        assert!(next(&mut y_rx).await.is_none());
    }

    #[tokio::test]
    async fn late_participant_gets_no_retro_delivery() {
        let space = local_space();
        let (x, mut x_rx) = recorder();
        let ax = space.register(x).unwrap();
        space.emit_to_all(Event::signal("early").with_source(ax));

        let (late, mut late_rx) = recorder();
        space.register(late).unwrap();
        assert!(next(&mut x_rx).await.is_some());
        assert!(next(&mut late_rx).await.is_none());
    }

    #[tokio::test]
    async fn emit_publishes_and_network_delivery_does_not() {
        let mut network = MockSpaceNetwork::new();
        network.expect_publish().times(1).returning(|_, _, _| Ok(()));
        let space = Space::new(SpaceId::random(ContextId::new_v4()), Some(Arc::new(network)));
        let (x, mut x_rx) = recorder();
        let ax = space.register(x).unwrap();

        space.emit_to_all(Event::signal("local").with_source(ax.clone()));
        space.deliver_from_network(&Scope::All, Event::signal("remote").with_source(ax));

        assert_eq!(next(&mut x_rx).await.map(|e| e.r#type), Some("local".into()));
        assert_eq!(next(&mut x_rx).await.map(|e| e.r#type), Some("remote".into()));
    }

    #[tokio::test]
    async fn publication_failure_keeps_local_delivery() {
        let mut network = MockSpaceNetwork::new();
        network
            .expect_publish()
            .returning(|_, _, _| Err(KernelError::Serialization("nope".into())));
        let space = Space::new(SpaceId::random(ContextId::new_v4()), Some(Arc::new(network)));
        let (x, mut x_rx) = recorder();
        let ax = space.register(x).unwrap();

        assert_eq!(space.emit_to_all(Event::signal("still").with_source(ax)), 1);
        assert!(next(&mut x_rx).await.is_some());
    }

    #[tokio::test]
    #[should_panic(expected = "emitted into space")]
    async fn foreign_source_is_fatal() {
        let space = local_space();
        let elsewhere = Address::new(SpaceId::random(ContextId::new_v4()), ParticipantId::new_v4());
        space.emit_to_all(Event::signal("bad").with_source(elsewhere));
    }

    #[tokio::test]
    #[should_panic(expected = "emitted into space")]
    async fn missing_source_is_fatal() {
        let space = local_space();
        space.emit_to_all(Event::signal("anonymous"));
    }

    #[tokio::test]
    async fn membership_changes_are_broadcast() {
        let space = local_space();
        let mut changes = space.subscribe_changes();
        let (x, _rx) = recorder();
        let ax = space.register(x.clone()).unwrap();
        space.unregister(x.id).unwrap();

        assert_eq!(changes.recv().await.unwrap(), ParticipantChange::Joined(ax.clone()));
        assert_eq!(changes.recv().await.unwrap(), ParticipantChange::Left(ax));
    }

    #[tokio::test]
    async fn events_per_participant_keep_emission_order() {
        let space = local_space();
        let (x, mut x_rx) = recorder();
        let ax = space.register(x).unwrap();
        let ids: Vec<_> = (0..20)
            .map(|i| {
                let evt = Event::new("seq", serde_json::json!(i)).with_source(ax.clone());
                let id = evt.id;
                space.emit_to_all(evt);
                id
            })
            .collect();
        for id in ids {
            assert_eq!(next(&mut x_rx).await.map(|e| e.id), Some(id));
        }
    }

    #[tokio::test]
    async fn forwarder_drains_then_releases_the_listener() {
        let space = local_space();
        let (x, mut x_rx) = recorder();
        let (y, mut y_rx) = recorder();
        let ax = space.register(x.clone()).unwrap();
        space.register(y.clone()).unwrap();
        assert!(Arc::strong_count(&x) > 1);

        let queued = Event::signal("last").with_source(ax);
        space.emit_to_all(queued.clone());
        space.unregister(x.id).unwrap();
        space.close();

        assert_eq!(next(&mut x_rx).await.map(|e| e.id), Some(queued.id));
        assert_eq!(next(&mut y_rx).await.map(|e| e.id), Some(queued.id));
        let released = tokio::time::timeout(Duration::from_secs(1), async {
            while Arc::strong_count(&x) > 1 || Arc::strong_count(&y) > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(released.is_ok());
        assert_eq!(space.participant_count(), 0);
    }
}
