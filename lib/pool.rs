//! Id-indexed storage of every live object.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, trace};

use crate::config::RegistryConfig;
use crate::error::{Exhaustion, RegistryError};
use crate::gap_tree::GapTree;
use crate::object::{ObjectCell, ObjectId, ObjectInfo, ObjectKind, ObjectState};

/// Aggregate counters over the pool, as reported by [`crate::Registry::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PoolStats {
    /// Objects currently indexed.
    pub live: usize,
    /// Live objects of kind [`ObjectKind::Node`].
    pub nodes: usize,
    /// Live objects of kind [`ObjectKind::Bookkeeping`].
    pub bookkeeping: usize,
    /// Live objects with no outstanding handles.
    pub idle: usize,
    /// Live objects waiting for their last handle before being erased.
    pub destroy_pending: usize,
    /// Live objects in the `Error` state.
    pub errored: usize,
}

/// A failed [`ObjectPool::create`], carrying back the payload it was given.
#[derive(Debug)]
pub(crate) struct Rejected<P> {
    pub(crate) error: RegistryError,
    pub(crate) payload: Option<P>,
}

impl<P> Rejected<P> {
    fn new(exhausted: Exhaustion, payload: Option<P>) -> Self {
        Self {
            error: exhausted.into(),
            payload,
        }
    }
}

/// Owns all live objects, indexed by a [`GapTree`].
///
/// Not synchronized; the registry wraps it in its index lock.
pub(crate) struct ObjectPool<P> {
    tree: GapTree<Arc<ObjectCell<P>>>,
    config: RegistryConfig,
}

impl<P> ObjectPool<P> {
    pub(crate) fn new(config: RegistryConfig) -> Self {
        Self {
            tree: GapTree::new(),
            config,
        }
    }

    pub(crate) fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Allocates the smallest free id and indexes a new object under it with one reference.
    ///
    /// On failure the payload is handed back untouched, so the caller can drop it once the
    /// index lock is released.
    pub(crate) fn create(
        &mut self,
        kind: ObjectKind,
        payload: Option<P>,
    ) -> Result<Arc<ObjectCell<P>>, Rejected<P>> {
        if let Some(max_objects) = self.config.max_objects {
            if self.tree.len() >= max_objects {
                return Err(Rejected::new(Exhaustion::Capacity { max_objects }, payload));
            }
        }

        let limit = self.config.id_limit;
        let mut payload = payload;
        let Some(id) = self.tree.insert_smallest_free(limit, |id| {
            Arc::new(ObjectCell::new(ObjectId(id), kind, payload.take()))
        }) else {
            return Err(Rejected::new(Exhaustion::IdSpace { limit }, payload));
        };

        let cell = self
            .lookup(ObjectId(id))
            .map_err(|error| Rejected { error, payload: None })?;
        trace!(id, ?kind, "created object");
        Ok(Arc::clone(cell))
    }

    /// Finds a live object. Does not take a reference.
    pub(crate) fn lookup(&self, id: ObjectId) -> Result<&Arc<ObjectCell<P>>, RegistryError> {
        self.tree.get(id.get()).ok_or(RegistryError::NotFound(id))
    }

    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.tree.contains(id.get())
    }

    /// Removes an object from the index, making its id available again.
    ///
    /// The object must have no references and must not be locked.
    pub(crate) fn erase(&mut self, id: ObjectId) -> Result<Arc<ObjectCell<P>>, RegistryError> {
        let cell = self.lookup(id)?;
        let violation = if cell.refcount() != 0 {
            Some("erase with outstanding references")
        } else if cell.state() == ObjectState::Locked {
            Some("erase while locked")
        } else {
            None
        };
        if let Some(reason) = violation {
            error!(%id, refcount = cell.refcount(), reason, "refusing to erase object");
            return Err(RegistryError::InvariantViolated { id, reason });
        }

        let cell = self.tree.remove(id.get()).ok_or(RegistryError::NotFound(id))?;
        debug!(%id, kind = ?cell.kind(), "erased object");
        Ok(cell)
    }

    pub(crate) fn len(&self) -> usize {
        self.tree.len()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        self.tree
            .iter()
            .fold(PoolStats::default(), |mut stats, (_, cell)| {
                stats.live += 1;
                match cell.kind() {
                    ObjectKind::Node => stats.nodes += 1,
                    ObjectKind::Bookkeeping => stats.bookkeeping += 1,
                }
                if cell.refcount() == 0 {
                    stats.idle += 1;
                }
                if cell.is_destroy_pending() {
                    stats.destroy_pending += 1;
                }
                if cell.state() == ObjectState::Error {
                    stats.errored += 1;
                }
                stats
            })
    }

    /// Snapshots every live object in id order.
    pub(crate) fn objects(&self) -> Vec<ObjectInfo> {
        self.tree.iter().map(|(_, cell)| cell.info()).collect()
    }
}
