// Agent entity: a space participant backed by its own dispatcher
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, error, info};

use crate::dispatcher::{EntityState, InternalDispatcher};
use crate::event::{types, Event};
use crate::ids::{Address, ContextId, ParticipantId, SpaceId};
use crate::scope::Scope;
use crate::space::{EventListener, Space};
use crate::{KernelError, Result};

const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// External collaborator that creates and kills agents.
#[async_trait]
pub trait SpawnService: Send + Sync {
    async fn spawn(
        &self,
        context_id: ContextId,
        agent_type: &str,
        params: serde_json::Value,
    ) -> Result<ParticipantId>;

    async fn kill(&self, participant: ParticipantId) -> Result<()>;
}

/// Participant whose behaviors are registered in an [`InternalDispatcher`].
///
/// Lifecycle markers are dispatched immediately, every other received event
/// asynchronously. Behaviors are plain [`PerceptionGuards`](crate::PerceptionGuards)
/// objects registered through [`Agent::dispatcher`].
pub struct Agent {
    id: ParticipantId,
    dispatcher: InternalDispatcher,
    joined: DashMap<SpaceId, (Address, Weak<Space>)>,
    grace: Duration,
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_id(ParticipantId::new_v4(), name)
    }

    pub fn with_id(id: ParticipantId, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            dispatcher: InternalDispatcher::new(name),
            joined: DashMap::new(),
            grace: DEFAULT_GRACE,
        })
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn dispatcher(&self) -> &InternalDispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> EntityState {
        self.dispatcher.state()
    }

    /// Runs the initialize handlers to completion, then starts async delivery.
    pub async fn initialize(&self, params: serde_json::Value) -> Result<()> {
        self.dispatcher
            .immediate_dispatch(Event::initialize(params))
            .await?;
        self.dispatcher.start();
        info!(target: "dispatcher", agent = %self.id, name = self.dispatcher.name(), "Agent initialized");
        Ok(())
    }

    /// Leaves every joined space, runs the destroy handlers, then stops the dispatcher.
    pub async fn destroy(&self) -> Result<()> {
        let spaces: Vec<Arc<Space>> = self
            .joined
            .iter()
            .filter_map(|entry| entry.value().1.upgrade())
            .collect();
        for space in spaces {
            if let Err(e) = self.leave(&space) {
                debug!(target: "space", agent = %self.id, error = %e, "Leave during destroy failed");
            }
        }

        let result = self.dispatcher.immediate_dispatch(Event::destroy()).await;
        self.dispatcher.shutdown(self.grace).await;
        info!(target: "dispatcher", agent = %self.id, "Agent destroyed");
        result
    }

    /// Joins `space` and tells its participants.
    pub fn join(self: &Arc<Self>, space: &Arc<Space>) -> Result<Address> {
        let address = space.register(self.clone())?;
        self.joined.insert(
            space.id().clone(),
            (address.clone(), Arc::downgrade(space)),
        );
        let joined = Event::new(types::PARTICIPANT_JOINED, json!({ "participant": self.id }))
            .with_source(address.clone());
        space.emit(joined, Scope::All);
        Ok(address)
    }

    /// Tells the other participants, then leaves `space`.
    pub fn leave(&self, space: &Arc<Space>) -> Result<Address> {
        let (_, (address, _)) =
            self.joined
                .remove(space.id())
                .ok_or_else(|| KernelError::NotAParticipant {
                    participant: self.id,
                    space: space.id().clone(),
                })?;
        let left = Event::new(types::PARTICIPANT_LEFT, json!({ "participant": self.id }))
            .with_source(address.clone());
        space.emit(left, Scope::except([address]));
        space.unregister(self.id)
    }

    pub fn address_in(&self, space_id: &SpaceId) -> Option<Address> {
        self.joined.get(space_id).map(|entry| entry.value().0.clone())
    }

    /// Emits into a joined space with this agent's address as source.
    pub fn emit(&self, space: &Space, event: Event, scope: Scope) -> Result<usize> {
        let address = self
            .address_in(space.id())
            .ok_or_else(|| KernelError::NotAParticipant {
                participant: self.id,
                space: space.id().clone(),
            })?;
        Ok(space.emit(event.with_source(address), scope))
    }
}

#[async_trait]
impl EventListener for Agent {
    fn participant_id(&self) -> ParticipantId {
        self.id
    }

    async fn receive_event(&self, event: Event) {
        if event.is_lifecycle_marker() {
            if let Err(e) = self.dispatcher.immediate_dispatch(event).await {
                error!(target: "dispatcher", agent = %self.id, error = %e, "Lifecycle handler failed");
            }
        } else {
            self.dispatcher.async_dispatch(event);
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.dispatcher.name())
            .field("spaces", &self.joined.len())
            .finish()
    }
}
