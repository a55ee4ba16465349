//! Pooled objects and their per-object lock.
//!
//! Each [`ObjectCell`] carries two independent pieces of synchronization:
//!
//! - an atomic reference count plus a destroy flag, which govern *visibility* and are only ever
//!   driven to zero under the registry's index lock;
//! - a small `Unlocked`/`Locked`/`Error` state machine guarding the *payload*, which may be held
//!   across slow storage calls without touching the index at all.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{trace, warn};

use crate::error::RegistryError;

/// Dense identifier naming a live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// The raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for ObjectId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Category of a pooled object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    /// A filesystem node. Stays resident with no references until explicitly destroyed.
    Node,
    /// Pool-internal scratch object. Released as soon as its last reference goes away.
    Bookkeeping,
}

impl ObjectKind {
    /// Whether an object of this kind survives reaching a reference count of zero.
    #[must_use]
    pub fn resident_when_idle(self) -> bool {
        matches!(self, Self::Node)
    }
}

/// Lock state of an object's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectState {
    /// Nobody holds the payload.
    Unlocked,
    /// A guard holds the payload.
    Locked,
    /// The payload is inconsistent. Terminal.
    Error,
}

/// Snapshot of an object's bookkeeping, as reported by [`crate::Registry::objects`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ObjectInfo {
    /// The object's id.
    pub id: u32,
    /// The object's kind.
    pub kind: ObjectKind,
    /// Outstanding handles at the time of the snapshot.
    pub refcount: usize,
    /// Lock state at the time of the snapshot.
    pub state: ObjectState,
    /// Whether a destroy has been requested.
    pub destroy_pending: bool,
}

pub(crate) struct ObjectCell<P> {
    id: ObjectId,
    kind: ObjectKind,
    refs: AtomicUsize,
    destroy_pending: AtomicBool,
    state: Mutex<ObjectState>,
    unlocked: Condvar,
    /// Only ever locked by the holder of `state == Locked`, so it is uncontended outside of the
    /// brief hand-off between two guards.
    payload: Mutex<Option<P>>,
}

impl<P> ObjectCell<P> {
    /// A fresh, unlocked object holding one reference.
    pub(crate) fn new(id: ObjectId, kind: ObjectKind, payload: Option<P>) -> Self {
        Self {
            id,
            kind,
            refs: AtomicUsize::new(1),
            destroy_pending: AtomicBool::new(false),
            state: Mutex::new(ObjectState::Unlocked),
            unlocked: Condvar::new(),
            payload: Mutex::new(payload),
        }
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub(crate) fn refcount(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> ObjectState {
        *self.state.lock()
    }

    pub(crate) fn is_destroy_pending(&self) -> bool {
        self.destroy_pending.load(Ordering::Acquire)
    }

    pub(crate) fn info(&self) -> ObjectInfo {
        ObjectInfo {
            id: self.id.get(),
            kind: self.kind,
            refcount: self.refcount(),
            state: self.state(),
            destroy_pending: self.is_destroy_pending(),
        }
    }

    /// Takes a reference. Returns the count after incrementing.
    pub(crate) fn acquire(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops a reference if that does not bring the count to zero.
    ///
    /// The last reference must be dropped through [`Self::release_last`] under the index lock.
    pub(crate) fn try_release_shared(&self) -> bool {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |rc| {
                (rc > 1).then(|| rc - 1)
            })
            .is_ok()
    }

    /// Drops a reference unconditionally. Returns the count after decrementing, or `None` if
    /// the count was already zero.
    pub(crate) fn release_last(&self) -> Option<usize> {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |rc| rc.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    /// Flags the object for destruction. Returns `false` if it was already flagged.
    pub(crate) fn mark_destroy(&self) -> bool {
        !self.destroy_pending.swap(true, Ordering::AcqRel)
    }

    /// Blocks until the payload is available, then takes it.
    pub(crate) fn lock(&self) -> Result<ObjectGuard<'_, P>, RegistryError> {
        let mut state = self.state.lock();
        loop {
            let current = *state;
            match current {
                ObjectState::Error => return Err(RegistryError::Corrupted(self.id)),
                ObjectState::Locked => self.unlocked.wait(&mut state),
                ObjectState::Unlocked => break,
            }
        }
        *state = ObjectState::Locked;
        drop(state);
        trace!(id = %self.id, "locked object");
        Ok(ObjectGuard {
            cell: self,
            payload: self.payload.lock(),
        })
    }

    /// Takes the payload if nobody holds it. Never waits for another guard to be released,
    /// though it may briefly contend on the payload mutex while a previous guard is still being
    /// dropped.
    pub(crate) fn try_lock(&self) -> Result<Option<ObjectGuard<'_, P>>, RegistryError> {
        let mut state = self.state.lock();
        let current = *state;
        match current {
            ObjectState::Error => Err(RegistryError::Corrupted(self.id)),
            ObjectState::Locked => Ok(None),
            ObjectState::Unlocked => {
                *state = ObjectState::Locked;
                drop(state);
                Ok(Some(ObjectGuard {
                    cell: self,
                    payload: self.payload.lock(),
                }))
            }
        }
    }

    /// Moves the object into the terminal `Error` state and fails every waiter.
    pub(crate) fn mark_error(&self) {
        let mut state = self.state.lock();
        if *state != ObjectState::Error {
            warn!(id = %self.id, previous = ?*state, "object marked as corrupted");
            *state = ObjectState::Error;
        }
        drop(state);
        self.unlocked.notify_all();
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        if *state == ObjectState::Locked {
            *state = ObjectState::Unlocked;
            drop(state);
            trace!(id = %self.id, "unlocked object");
            self.unlocked.notify_one();
        }
    }
}

/// Exclusive access to an object's payload.
///
/// Dropping the guard (or calling [`ObjectGuard::unlock`]) releases the object and wakes one
/// waiter. The guard borrows its [`crate::Handle`], so the handle cannot be put while the object
/// is locked through it.
pub struct ObjectGuard<'a, P> {
    cell: &'a ObjectCell<P>,
    payload: MutexGuard<'a, Option<P>>,
}

impl<P> ObjectGuard<'_, P> {
    /// Id of the locked object.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.cell.id()
    }

    /// The payload, if one has been attached.
    #[must_use]
    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }

    /// Mutable access to the payload, if one has been attached.
    pub fn payload_mut(&mut self) -> Option<&mut P> {
        self.payload.as_mut()
    }

    /// Attaches `payload`, returning the previous one.
    pub fn replace_payload(&mut self, payload: P) -> Option<P> {
        self.payload.replace(payload)
    }

    /// Detaches and returns the payload.
    pub fn take_payload(&mut self) -> Option<P> {
        self.payload.take()
    }

    /// Marks the object as corrupted. Later lockers fail with [`RegistryError::Corrupted`].
    pub fn mark_error(&self) {
        self.cell.mark_error();
    }

    /// Releases the lock.
    pub fn unlock(self) {
        drop(self);
    }
}

impl<P> Drop for ObjectGuard<'_, P> {
    fn drop(&mut self) {
        self.cell.unlock();
    }
}

impl<P> fmt::Debug for ObjectGuard<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectGuard")
            .field("id", &self.cell.id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;

    fn cell() -> ObjectCell<u32> {
        ObjectCell::new(ObjectId(3), ObjectKind::Node, Some(7))
    }

    #[test]
    fn new_object_is_unlocked_with_one_ref() {
        let cell = cell();
        assert_eq!(cell.refcount(), 1);
        assert_eq!(cell.state(), ObjectState::Unlocked);
        assert!(!cell.is_destroy_pending());
    }

    #[test]
    fn guard_transitions_state() {
        let cell = cell();
        let mut guard = cell.lock().expect("unlocked object");
        assert_eq!(cell.state(), ObjectState::Locked);
        *guard.payload_mut().expect("payload attached") += 1;
        guard.unlock();
        assert_eq!(cell.state(), ObjectState::Unlocked);
        assert_eq!(cell.lock().expect("unlocked").payload(), Some(&8));
    }

    #[test]
    fn try_lock_reports_contention() {
        let cell = cell();
        let guard = cell.lock().expect("unlocked object");
        assert!(cell.try_lock().expect("not corrupted").is_none());
        drop(guard);
        assert!(cell.try_lock().expect("not corrupted").is_some());
    }

    #[test]
    fn error_is_sticky() {
        let cell = cell();
        let guard = cell.lock().expect("unlocked object");
        guard.mark_error();
        drop(guard);
        assert_eq!(cell.state(), ObjectState::Error);
        assert_eq!(
            cell.lock().map(|_| ()),
            Err(RegistryError::Corrupted(ObjectId(3)))
        );
        assert_eq!(
            cell.try_lock().map(|_| ()),
            Err(RegistryError::Corrupted(ObjectId(3)))
        );
    }

    #[test]
    fn waiter_fails_when_holder_marks_error() {
        let cell = Arc::new(cell());
        let guard = cell.lock().expect("unlocked object");

        std::thread::scope(|s| {
            let waiter = s.spawn(|| cell.lock().map(|_| ()));
            std::thread::sleep(Duration::from_millis(20));
            guard.mark_error();
            drop(guard);
            assert_eq!(
                waiter.join().expect("waiter panicked"),
                Err(RegistryError::Corrupted(ObjectId(3)))
            );
        });
    }

    #[test]
    fn lock_blocks_until_unlock() {
        let cell = cell();
        let released = AtomicBool::new(false);
        let guard = cell.lock().expect("unlocked object");

        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let guard = cell.lock().expect("not corrupted");
                assert!(released.load(Ordering::SeqCst), "acquired before unlock");
                drop(guard);
            });
            std::thread::sleep(Duration::from_millis(20));
            released.store(true, Ordering::SeqCst);
            drop(guard);
            waiter.join().expect("waiter panicked");
        });
        assert_eq!(cell.state(), ObjectState::Unlocked);
    }

    #[test]
    fn shared_release_never_reaches_zero() {
        let cell = cell();
        assert!(!cell.try_release_shared(), "last ref must take the slow path");
        assert_eq!(cell.acquire(), 2);
        assert!(cell.try_release_shared());
        assert_eq!(cell.refcount(), 1);
        assert_eq!(cell.release_last(), Some(0));
        assert_eq!(cell.release_last(), None);
    }

    #[test]
    fn destroy_flag_is_idempotent() {
        let cell = cell();
        assert!(cell.mark_destroy());
        assert!(!cell.mark_destroy());
        assert!(cell.is_destroy_pending());
    }
}
