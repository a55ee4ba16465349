//! The registry façade: the only surface the rest of the filesystem touches.
//!
//! # Locking
//!
//! The pool sits behind a single index lock. Structural changes (`create`, erasing an object)
//! and the final `1 -> 0` reference drop happen under the write side; `get` takes its reference
//! under the read side. Since a reference count can only reach zero while the write lock is
//! held, and can only leave zero while the read lock is held, a lookup never hands out an
//! object that is concurrently being erased.
//!
//! Per-object payload locks ([`crate::ObjectGuard`]) are independent of the index lock and are
//! never acquired while it is held.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, error, info, trace};

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::handle::Handle;
use crate::object::{ObjectCell, ObjectId, ObjectInfo, ObjectKind};
use crate::pool::{ObjectPool, PoolStats};

pub(crate) struct Shared<P> {
    pool: RwLock<ObjectPool<P>>,
}

impl<P> Shared<P> {
    /// Drops one reference held by a [`Handle`], erasing the object if that was the last one and
    /// the object is not meant to stay resident.
    pub(crate) fn release(&self, cell: &Arc<ObjectCell<P>>) {
        if cell.try_release_shared() {
            trace!(id = %cell.id(), "released handle");
            return;
        }

        let mut pool = self.pool.write();
        let remaining = cell.release_last();
        debug_assert!(
            remaining.is_some(),
            "handle released on object {} with no references",
            cell.id()
        );
        let Some(remaining) = remaining else {
            error!(id = %cell.id(), "handle released on object with no references");
            return;
        };
        trace!(id = %cell.id(), rc = remaining, "released handle");

        let reclaim = cell.is_destroy_pending() || !cell.kind().resident_when_idle();
        if remaining != 0 || !reclaim {
            return;
        }
        let erased = pool.erase(cell.id());
        drop(pool);
        if let Err(e) = &erased {
            error!(error = %e, "failed to erase released object");
        }
        debug_assert!(erased.is_ok(), "erase on final release of {} failed", cell.id());
    }
}

/// Shared, process-wide pool of filesystem objects.
///
/// Cloning a `Registry` is cheap and yields another view of the same pool.
pub struct Registry<P> {
    shared: Arc<Shared<P>>,
}

impl<P> Clone for Registry<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P> Default for Registry<P> {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl<P> Registry<P> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool: RwLock::new(ObjectPool::new(config)),
            }),
        }
    }

    /// Installs a fresh registry into `slot`, the single process-wide initialization point.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyInitialized`] if `slot` already holds a registry. The existing
    /// registry is left untouched.
    pub fn init(slot: &OnceLock<Self>, config: RegistryConfig) -> Result<&Self, RegistryError> {
        let mut installed = false;
        let registry = slot.get_or_init(|| {
            installed = true;
            Self::new(config)
        });
        if !installed {
            return Err(RegistryError::AlreadyInitialized);
        }
        info!(config = ?registry.config(), "object registry initialized");
        Ok(registry)
    }

    /// The limits this registry was built with.
    #[must_use]
    pub fn config(&self) -> RegistryConfig {
        self.shared.pool.read().config().clone()
    }

    /// Creates an object with no payload under the smallest free id.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ResourceExhausted`] if no id can be allocated.
    pub fn create(&self, kind: ObjectKind) -> Result<Handle<P>, RegistryError> {
        self.create_inner(kind, None)
    }

    /// Creates an object with `payload` attached before it becomes visible to lookups.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ResourceExhausted`] if no id can be allocated.
    pub fn create_with(&self, kind: ObjectKind, payload: P) -> Result<Handle<P>, RegistryError> {
        self.create_inner(kind, Some(payload))
    }

    fn create_inner(
        &self,
        kind: ObjectKind,
        payload: Option<P>,
    ) -> Result<Handle<P>, RegistryError> {
        let mut pool = self.shared.pool.write();
        let created = pool.create(kind, payload);
        drop(pool);
        match created {
            Ok(cell) => Ok(Handle::new(cell, Arc::clone(&self.shared))),
            Err(rejected) => {
                // The payload may own handles into this registry; drop it only now that the
                // index lock is released.
                drop(rejected.payload);
                debug!(?kind, error = %rejected.error, "create failed");
                Err(rejected.error)
            }
        }
    }

    /// Takes a new reference to the object named `id`.
    ///
    /// Succeeds for objects with a pending destroy as long as they have not been erased yet.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if no live object has this id.
    pub fn get(&self, id: ObjectId) -> Result<Handle<P>, RegistryError> {
        let pool = self.shared.pool.read();
        let cell = Arc::clone(pool.lookup(id)?);
        let rc = cell.acquire();
        drop(pool);
        trace!(%id, rc, "acquired handle");
        Ok(Handle::new(cell, Arc::clone(&self.shared)))
    }

    /// Releases `handle`. Equivalent to dropping it.
    pub fn put(&self, handle: Handle<P>) {
        debug_assert!(
            Arc::ptr_eq(&handle.shared, &self.shared),
            "handle {} belongs to another registry",
            handle.id()
        );
        drop(handle);
    }

    /// Requests destruction of the object behind `handle`.
    ///
    /// The object stays reachable until its last handle is released, at which point it is
    /// erased and its id becomes reusable. Repeated requests are no-ops.
    pub fn destroy(&self, handle: &Handle<P>) {
        if handle.cell.mark_destroy() {
            debug!(id = %handle.id(), rc = handle.refcount(), "destroy requested");
        } else {
            trace!(id = %handle.id(), "destroy already pending");
        }
    }

    /// Requests destruction of the object named `id`, erasing it right away if nobody holds it.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] if no live object has this id.
    pub fn destroy_id(&self, id: ObjectId) -> Result<(), RegistryError> {
        let mut pool = self.shared.pool.write();
        let (newly_marked, rc) = {
            let cell = pool.lookup(id)?;
            (cell.mark_destroy(), cell.refcount())
        };
        if rc != 0 {
            if newly_marked {
                debug!(%id, rc, "destroy deferred until last handle is released");
            } else {
                trace!(%id, "destroy already pending");
            }
            return Ok(());
        }
        // An idle object that is still indexed has not been reclaimed yet, whether or not a
        // destroy was requested before.
        let erased = pool.erase(id)?;
        drop(pool);
        debug!(%id, "destroyed idle object");
        drop(erased);
        Ok(())
    }

    /// Whether an object named `id` is currently indexed.
    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.shared.pool.read().contains(id)
    }

    /// Number of indexed objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.pool.read().len()
    }

    /// Whether no objects are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate counters over all indexed objects.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.pool.read().stats()
    }

    /// Snapshot of every indexed object, in id order.
    #[must_use]
    pub fn objects(&self) -> Vec<ObjectInfo> {
        self.shared.pool.read().objects()
    }
}

impl<P> fmt::Debug for Registry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("live", &self.len())
            .finish_non_exhaustive()
    }
}
