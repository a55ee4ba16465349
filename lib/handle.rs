//! Reference-counted handles to pooled objects.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::error::RegistryError;
use crate::object::{ObjectCell, ObjectGuard, ObjectId, ObjectKind, ObjectState};
use crate::registry::Shared;

/// One counted reference to a live object.
///
/// Obtained from [`crate::Registry::create`] or [`crate::Registry::get`]. Cloning takes another
/// reference; dropping (or [`Handle::put`]) releases it. Once the last handle of a
/// destroy-pending object goes away, the object is erased and its id becomes reusable.
pub struct Handle<P> {
    pub(crate) cell: Arc<ObjectCell<P>>,
    pub(crate) shared: Arc<Shared<P>>,
}

impl<P> Handle<P> {
    pub(crate) fn new(cell: Arc<ObjectCell<P>>, shared: Arc<Shared<P>>) -> Self {
        Self { cell, shared }
    }

    /// The object's id.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.cell.id()
    }

    /// The object's kind.
    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        self.cell.kind()
    }

    /// Current number of outstanding handles, including this one.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.cell.refcount()
    }

    /// Current lock state.
    #[must_use]
    pub fn state(&self) -> ObjectState {
        self.cell.state()
    }

    /// Whether [`crate::Registry::destroy`] has been requested for this object.
    #[must_use]
    pub fn is_destroy_pending(&self) -> bool {
        self.cell.is_destroy_pending()
    }

    /// Locks the payload, blocking while another guard holds it.
    ///
    /// The registry's index lock is never held while waiting here, so lookups and reference
    /// changes on other objects proceed while the payload is held.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Corrupted`] if the object is, or while waiting becomes, marked as
    /// errored.
    pub fn lock(&self) -> Result<ObjectGuard<'_, P>, RegistryError> {
        self.cell.lock()
    }

    /// Locks the payload if it is free. Returns `Ok(None)` when another guard holds it.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Corrupted`] if the object is marked as errored.
    pub fn try_lock(&self) -> Result<Option<ObjectGuard<'_, P>>, RegistryError> {
        self.cell.try_lock()
    }

    /// Marks the payload as inconsistent. Irreversible for this object.
    pub fn mark_error(&self) {
        self.cell.mark_error();
    }

    /// Releases this reference.
    pub fn put(self) {
        drop(self);
    }
}

impl<P> Clone for Handle<P> {
    fn clone(&self) -> Self {
        let rc = self.cell.acquire();
        trace!(id = %self.cell.id(), rc, "cloned handle");
        Self {
            cell: Arc::clone(&self.cell),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P> Drop for Handle<P> {
    fn drop(&mut self) {
        self.shared.release(&self.cell);
    }
}

impl<P> fmt::Debug for Handle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.cell.id())
            .field("kind", &self.cell.kind())
            .field("refcount", &self.cell.refcount())
            .finish_non_exhaustive()
    }
}
