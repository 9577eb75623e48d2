//! Cluster-synchronized catalog of contexts and spaces.
//!
//! Every kernel owns a [`SpaceDirectory`]. Local creations are pushed into the
//! shared [`ClusterDirectory`]; a listener task watches the replicated
//! structures and materialises, on this kernel, whatever the other kernels
//! created. Replication is not transactional with local construction, so a
//! replicated entry may exist before its local object. Readers treat that as
//! "not yet visible", and the transport materialises spaces on demand through
//! [`SpaceDirectory::ensure_space`].

use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterDirectory, MapEvent, SetEvent};
use crate::context::Context;
use crate::ids::{ContextId, SpaceId};
use crate::space::{Space, SpaceNetwork};
use crate::{KernelError, Result};

/// Local lifecycle notification for collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    ContextCreated(ContextId),
    ContextDestroyed(ContextId),
    SpaceCreated(SpaceId),
    SpaceDestroyed(SpaceId),
}

/// Synchronous hook on local space creation and destruction.
///
/// `space_created` runs before any network event is delivered into a space
/// materialised on demand, so a collaborator can populate it first.
pub trait SpaceRepositoryListener: Send + Sync {
    fn space_created(&self, space: &Arc<Space>);

    fn space_destroyed(&self, _space_id: &SpaceId) {}
}

pub struct SpaceDirectory {
    contexts: DashMap<ContextId, Arc<Context>>,
    repository_listeners: RwLock<Vec<Arc<dyn SpaceRepositoryListener>>>,
    cluster: ClusterDirectory,
    network: Option<Arc<dyn SpaceNetwork>>,
    events: broadcast::Sender<DirectoryEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SpaceDirectory {
    pub fn new(cluster: ClusterDirectory, network: Option<Arc<dyn SpaceNetwork>>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            contexts: DashMap::new(),
            repository_listeners: RwLock::new(Vec::new()),
            cluster,
            network,
            events,
            listener: Mutex::new(None),
        }
    }

    pub fn cluster(&self) -> &ClusterDirectory {
        &self.cluster
    }

    /// Creates a context with its default space and publishes it to the cluster.
    ///
    /// Idempotent. If the cluster already knows the context, the replicated
    /// default space wins over `default_space_id` and is never overwritten.
    /// A local instance materialised on demand adopts that default.
    ///
    /// # Panics
    ///
    /// When `default_space_id` belongs to another context.
    #[tracing::instrument(skip_all, fields(context = %context_id))]
    pub fn create_context(
        &self,
        context_id: ContextId,
        default_space_id: SpaceId,
    ) -> Arc<Context> {
        assert_eq!(
            default_space_id.context_id, context_id,
            "default space {} does not belong to context {}",
            default_space_id, context_id
        );

        // never overwrite the default another kernel already published
        let default_space_id = self
            .cluster
            .contexts
            .put_if_absent(context_id, default_space_id.clone())
            .unwrap_or(default_space_id);
        let context = self.materialize_context(context_id, default_space_id.clone());
        self.align_default(&context, &default_space_id);
        context
    }

    /// Removes the context from the cluster and destroys the local instance.
    ///
    /// Returns false when there was nothing to remove.
    pub fn remove_context(&self, context_id: ContextId) -> bool {
        let replicated = self.cluster.contexts.remove(&context_id).is_some();
        for space in self.cluster.spaces.elements() {
            if space.context_id == context_id {
                self.cluster.spaces.remove(&space);
            }
        }
        let local = self.destroy_local_context(context_id);
        replicated || local
    }

    /// Creates a non-default space inside a local context and replicates it.
    pub fn create_space(&self, space_id: SpaceId) -> Result<Arc<Space>> {
        let context = self
            .context(space_id.context_id)
            .ok_or(KernelError::UnknownContext(space_id.context_id))?;
        let space = context.create_space(space_id.clone())?;
        self.cluster.spaces.insert(space_id.clone());
        self.space_created(&space);
        Ok(space)
    }

    /// Removes a non-default space everywhere. Double removal is a no-op.
    pub fn remove_space(&self, space_id: &SpaceId) -> bool {
        let replicated = self.cluster.spaces.remove(space_id);
        let local = self.destroy_local_space(space_id);
        replicated || local
    }

    /// Returns the local space, materialising it and its context when absent.
    ///
    /// For an unknown context the replicated default space is used; when the
    /// cluster has not replicated the context yet, the referenced space is
    /// taken as its default.
    pub fn ensure_space(&self, space_id: &SpaceId) -> Arc<Space> {
        let context = match self.context(space_id.context_id) {
            Some(context) => context,
            None => {
                let default = self
                    .cluster
                    .contexts
                    .get(&space_id.context_id)
                    .unwrap_or_else(|| space_id.clone());
                debug!(target: "directory", space = %space_id, default = %default, "Materialising context on demand");
                self.materialize_context(space_id.context_id, default)
            }
        };

        let (space, created) = context.get_or_create_space(space_id.clone());
        if created {
            self.space_created(&space);
        }
        space
    }

    pub fn context(&self, context_id: ContextId) -> Option<Arc<Context>> {
        self.contexts.get(&context_id).map(|c| c.clone())
    }

    pub fn contains_context(&self, context_id: ContextId) -> bool {
        self.contexts.contains_key(&context_id)
    }

    pub fn contexts(&self) -> Vec<Arc<Context>> {
        self.contexts.iter().map(|c| c.clone()).collect()
    }

    pub fn space(&self, space_id: &SpaceId) -> Option<Arc<Space>> {
        self.context(space_id.context_id)?.space(space_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn SpaceRepositoryListener>) {
        self.repository_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn repository_listeners(&self) -> Vec<Arc<dyn SpaceRepositoryListener>> {
        self.repository_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts following the cluster. Entries already replicated are adopted first.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let mut context_changes = self.cluster.contexts.subscribe();
        let mut space_changes = self.cluster.spaces.subscribe();
        self.reconcile();

        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = context_changes.recv() => {
                        let Some(directory) = weak.upgrade() else { break };
                        match change {
                            Ok(change) => directory.on_context_change(change),
                            Err(RecvError::Lagged(missed)) => {
                                warn!(target: "directory", missed, "Context feed lagged, reconciling");
                                directory.reconcile();
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                    change = space_changes.recv() => {
                        let Some(directory) = weak.upgrade() else { break };
                        match change {
                            Ok(change) => directory.on_space_change(change),
                            Err(RecvError::Lagged(missed)) => {
                                warn!(target: "directory", missed, "Space feed lagged, reconciling");
                                directory.reconcile();
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
            debug!(target: "directory", "Replication listener stopped");
        }));
        info!(target: "directory", "Space directory started");
    }

    pub fn stop(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!(target: "directory", "Space directory stopped");
        }
    }

    fn on_context_change(&self, change: MapEvent<ContextId, SpaceId>) {
        match change {
            MapEvent::Added { key, value } => {
                let context = self.materialize_context(key, value.clone());
                self.align_default(&context, &value);
            }
            MapEvent::Updated { key, old, value } => {
                warn!(target: "directory", context = %key, old = %old, new = %value, "Replicated default space changed after creation");
                let context = self.materialize_context(key, value.clone());
                self.align_default(&context, &value);
            }
            MapEvent::Removed { key, .. } => {
                self.destroy_local_context(key);
            }
        }
    }

    fn on_space_change(&self, change: SetEvent<SpaceId>) {
        match change {
            SetEvent::Added(space_id) => {
                if self.contains_context(space_id.context_id)
                    || self.cluster.contexts.contains_key(&space_id.context_id)
                {
                    self.ensure_space(&space_id);
                } else {
                    debug!(target: "directory", space = %space_id, "Space replicated before its context");
                }
            }
            SetEvent::Removed(space_id) => {
                self.destroy_local_space(&space_id);
            }
        }
    }

    fn reconcile(&self) {
        for (context_id, default) in self.cluster.contexts.entries() {
            let context = self.materialize_context(context_id, default.clone());
            self.align_default(&context, &default);
        }
        for space_id in self.cluster.spaces.elements() {
            if self.contains_context(space_id.context_id) {
                self.ensure_space(&space_id);
            }
        }
    }

    /// Makes the replicated default the local one when they differ, which
    /// happens after a context was materialised from one of its other spaces.
    fn align_default(&self, context: &Context, replicated: &SpaceId) {
        if context.is_default(replicated) {
            return;
        }
        let previous = context.default_space().id().clone();
        let (space, created) = context.adopt_default(replicated.clone());
        if created {
            self.space_created(&space);
        }
        info!(target: "directory", context = %context.id(), previous = %previous, default_space = %replicated, "Adopted replicated default space");
    }

    /// Local construction of a context and its default space, if absent.
    fn materialize_context(&self, context_id: ContextId, default_space_id: SpaceId) -> Arc<Context> {
        let context = match self.contexts.entry(context_id) {
            Entry::Occupied(existing) => return existing.get().clone(),
            Entry::Vacant(slot) => {
                let context = Arc::new(Context::new(
                    context_id,
                    default_space_id.clone(),
                    self.network.clone(),
                ));
                slot.insert(context.clone());
                context
            }
        };

        info!(target: "directory", context = %context_id, default_space = %default_space_id, "Context created");
        let _ = self.events.send(DirectoryEvent::ContextCreated(context_id));
        self.space_created(&context.default_space());

        // non-default spaces replicated before the context showed up
        for space_id in self.cluster.spaces.elements() {
            if space_id.context_id == context_id && !context.is_default(&space_id) {
                let (space, created) = context.get_or_create_space(space_id.clone());
                if created {
                    self.space_created(&space);
                }
            }
        }
        context
    }

    fn space_created(&self, space: &Arc<Space>) {
        let space_id = space.id();
        if let Some(network) = &self.network {
            network.register(space_id);
        }
        for listener in self.repository_listeners() {
            listener.space_created(space);
        }
        debug!(target: "directory", space = %space_id, "Space created");
        let _ = self.events.send(DirectoryEvent::SpaceCreated(space_id.clone()));
    }

    fn destroy_local_context(&self, context_id: ContextId) -> bool {
        let Some((_, context)) = self.contexts.remove(&context_id) else {
            return false;
        };
        for space_id in context.destroy() {
            self.space_destroyed(&space_id);
        }
        info!(target: "directory", context = %context_id, "Context destroyed");
        let _ = self.events.send(DirectoryEvent::ContextDestroyed(context_id));
        true
    }

    fn destroy_local_space(&self, space_id: &SpaceId) -> bool {
        let removed = self
            .context(space_id.context_id)
            .and_then(|context| context.remove_space(space_id))
            .is_some();
        if removed {
            self.space_destroyed(space_id);
        }
        removed
    }

    fn space_destroyed(&self, space_id: &SpaceId) {
        if let Some(network) = &self.network {
            network.unregister(space_id);
        }
        for listener in self.repository_listeners() {
            listener.space_destroyed(space_id);
        }
        debug!(target: "directory", space = %space_id, "Space destroyed");
        let _ = self.events.send(DirectoryEvent::SpaceDestroyed(space_id.clone()));
    }
}

impl Drop for SpaceDirectory {
    fn drop(&mut self) {
        if let Some(handle) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SpaceDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceDirectory")
            .field("contexts", &self.contexts.len())
            .field("networked", &self.network.is_some())
            .finish()
    }
}
