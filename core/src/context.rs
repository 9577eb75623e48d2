// Context: default space plus space repository
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::ids::{ContextId, SpaceId};
use crate::space::{Space, SpaceNetwork};
use crate::{KernelError, Result};

/// A logical grouping owning one default space and any number of others.
///
/// The default space is created together with the context and lives as long
/// as it does. A kernel that materialised the context on demand may later
/// adopt the default replicated by the cluster instead.
pub struct Context {
    id: ContextId,
    default_space: RwLock<Arc<Space>>,
    spaces: DashMap<SpaceId, Arc<Space>>,
    network: Option<Arc<dyn SpaceNetwork>>,
}

impl Context {
    pub fn new(
        id: ContextId,
        default_space_id: SpaceId,
        network: Option<Arc<dyn SpaceNetwork>>,
    ) -> Self {
        debug_assert_eq!(default_space_id.context_id, id);
        let default_space = Arc::new(Space::new(default_space_id.clone(), network.clone()));
        let spaces = DashMap::new();
        spaces.insert(default_space_id, default_space.clone());
        Self {
            id,
            default_space: RwLock::new(default_space),
            spaces,
            network,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn default_space(&self) -> Arc<Space> {
        self.default_space
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_default(&self, space_id: &SpaceId) -> bool {
        self.default_space().id() == space_id
    }

    /// Makes `space_id` the default space, creating it when absent.
    ///
    /// The previous default stays as an ordinary space. The flag tells whether
    /// the space was created by this call.
    pub(crate) fn adopt_default(&self, space_id: SpaceId) -> (Arc<Space>, bool) {
        let (space, created) = self.get_or_create_space(space_id);
        *self
            .default_space
            .write()
            .unwrap_or_else(PoisonError::into_inner) = space.clone();
        (space, created)
    }

    pub fn space(&self, space_id: &SpaceId) -> Option<Arc<Space>> {
        self.spaces.get(space_id).map(|s| s.clone())
    }

    pub fn spaces(&self) -> Vec<Arc<Space>> {
        self.spaces.iter().map(|s| s.clone()).collect()
    }

    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    /// Creates a new space, failing if one with that id already lives here.
    pub fn create_space(&self, space_id: SpaceId) -> Result<Arc<Space>> {
        match self.get_or_create_space(space_id.clone()) {
            (space, true) => Ok(space),
            (_, false) => Err(KernelError::SpaceAlreadyExists(space_id)),
        }
    }

    /// Returns the space with that id, creating it when absent.
    ///
    /// The flag tells whether this call created it.
    pub fn get_or_create_space(&self, space_id: SpaceId) -> (Arc<Space>, bool) {
        match self.spaces.entry(space_id.clone()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                let space = Arc::new(Space::new(space_id.clone(), self.network.clone()));
                slot.insert(space.clone());
                debug!(target: "space", context = %self.id, space = %space_id, "Space materialised");
                (space, true)
            }
        }
    }

    /// Removes a non-default space. The default space goes away only with the context.
    pub fn remove_space(&self, space_id: &SpaceId) -> Option<Arc<Space>> {
        if self.is_default(space_id) {
            return None;
        }
        let (_, space) = self.spaces.remove(space_id)?;
        space.close();
        Some(space)
    }

    /// Tears down every space; returns their ids.
    pub(crate) fn destroy(&self) -> Vec<SpaceId> {
        let ids: Vec<SpaceId> = self.spaces.iter().map(|s| s.key().clone()).collect();
        for id in &ids {
            if let Some((_, space)) = self.spaces.remove(id) {
                space.close();
            }
        }
        debug!(target: "space", context = %self.id, spaces = ids.len(), "Context destroyed");
        ids
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("default_space", self.default_space().id())
            .field("spaces", &self.spaces.len())
            .finish()
    }
}
