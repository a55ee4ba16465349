#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use flash_registry::{
    Exhaustion, Handle, ObjectId, ObjectKind, ObjectState, Registry, RegistryConfig, RegistryError,
};

use common::{DropCounter, bounded_registry, registry};

/// Walks through deferred destruction end to end: a pending destroy keeps the object reachable
/// until its last handle goes away, after which the id is the first one handed out again.
#[test]
fn deferred_destroy_frees_id_for_reuse() {
    let registry: Registry<()> = registry();
    let a = registry.create(ObjectKind::Node).unwrap();
    let b = registry.create(ObjectKind::Node).unwrap();
    assert_eq!(a.id(), ObjectId(0));
    assert_eq!(b.id(), ObjectId(1));

    registry.destroy_id(ObjectId(0)).unwrap();
    assert!(a.is_destroy_pending());
    assert!(registry.contains(ObjectId(0)), "still referenced by `a`");

    let again = registry.get(ObjectId(0)).expect("pending object is still reachable");
    assert_eq!(again.refcount(), 2);
    registry.put(again);

    registry.put(a);
    assert!(!registry.contains(ObjectId(0)));
    assert_eq!(
        registry.get(ObjectId(0)).map(|_| ()),
        Err(RegistryError::NotFound(ObjectId(0)))
    );

    let c = registry.create(ObjectKind::Node).unwrap();
    assert_eq!(c.id(), ObjectId(0), "smallest free id is reused");
    assert_eq!(registry.len(), 2);
    drop(b);
}

#[test]
fn smallest_free_id_fills_interior_hole() {
    let registry: Registry<()> = registry();
    let handles: Vec<_> = (0..3)
        .map(|_| registry.create(ObjectKind::Node).unwrap())
        .collect();
    let middle = handles[1].clone();
    registry.destroy(&middle);
    registry.put(middle);
    drop(handles);

    assert_eq!(
        registry.objects().iter().map(|o| o.id).collect::<Vec<_>>(),
        vec![0, 2]
    );
    assert_eq!(registry.create(ObjectKind::Node).unwrap().id(), ObjectId(1));
    assert_eq!(registry.create(ObjectKind::Node).unwrap().id(), ObjectId(3));
}

#[test]
fn error_state_is_sticky_until_destroyed() {
    let registry: Registry<u32> = registry();
    let handle = registry.create_with(ObjectKind::Node, 5).unwrap();
    let id = handle.id();

    {
        let guard = handle.lock().unwrap();
        guard.mark_error();
    }
    assert_eq!(handle.state(), ObjectState::Error);
    assert_eq!(handle.lock().map(|_| ()), Err(RegistryError::Corrupted(id)));

    let other = registry.get(id).expect("errored objects stay reachable");
    assert_eq!(other.try_lock().map(|_| ()), Err(RegistryError::Corrupted(id)));
    assert_eq!(registry.stats().errored, 1);
    drop(other);

    registry.destroy(&handle);
    registry.put(handle);
    assert!(!registry.contains(id));

    let fresh = registry.create_with(ObjectKind::Node, 6).unwrap();
    assert_eq!(fresh.id(), id);
    assert_eq!(fresh.state(), ObjectState::Unlocked, "reused id starts clean");
    assert_eq!(fresh.lock().unwrap().payload(), Some(&6));
}

#[test]
fn lookups_of_unknown_ids_fail() {
    let registry: Registry<()> = registry();
    assert_eq!(
        registry.get(ObjectId(42)).map(|_| ()),
        Err(RegistryError::NotFound(ObjectId(42)))
    );
    assert_eq!(
        registry.destroy_id(ObjectId(42)),
        Err(RegistryError::NotFound(ObjectId(42)))
    );
}

#[test]
fn exhausted_id_space_reports_resource_exhausted() {
    let registry: Registry<()> = bounded_registry(2);
    let _a = registry.create(ObjectKind::Node).unwrap();
    let b = registry.create(ObjectKind::Node).unwrap();
    assert_eq!(
        registry.create(ObjectKind::Node).map(|_| ()),
        Err(RegistryError::ResourceExhausted(Exhaustion::IdSpace {
            limit: 2
        }))
    );
    assert_eq!(registry.len(), 2, "failed create leaves the pool unchanged");

    registry.destroy(&b);
    registry.put(b);
    assert_eq!(registry.create(ObjectKind::Node).unwrap().id(), ObjectId(1));
}

#[test]
fn exhausted_capacity_reports_resource_exhausted() {
    let registry: Registry<()> = Registry::new(RegistryConfig {
        id_limit: u32::MAX,
        max_objects: Some(3),
    });
    let handles: Vec<_> = (0..3)
        .map(|_| registry.create(ObjectKind::Node).unwrap())
        .collect();
    let err = registry.create(ObjectKind::Bookkeeping).map(|_| ()).unwrap_err();
    assert_eq!(
        err,
        RegistryError::ResourceExhausted(Exhaustion::Capacity { max_objects: 3 })
    );
    assert!(!err.is_fatal());
    drop(handles);
}

#[test]
fn refcount_tracks_outstanding_handles() {
    let registry: Registry<()> = registry();
    let first = registry.create(ObjectKind::Node).unwrap();
    let id = first.id();

    let mut extra: Vec<_> = (0..5).map(|_| registry.get(id).unwrap()).collect();
    extra.push(first.clone());
    assert_eq!(first.refcount(), 7);

    for handle in extra.drain(..3) {
        registry.put(handle);
    }
    assert_eq!(first.refcount(), 4);

    drop(extra);
    drop(first);
    let info = registry.objects()[0];
    assert_eq!(info.refcount, 0);
    assert_eq!(registry.stats().idle, 1, "nodes stay resident when idle");
}

#[test]
fn payload_dropped_exactly_once_on_erase() {
    let drops = Arc::new(AtomicUsize::new(0));
    let registry: Registry<DropCounter> = registry();

    let handle = registry
        .create_with(ObjectKind::Node, DropCounter::new(1, &drops))
        .unwrap();
    let clone = handle.clone();
    registry.destroy(&handle);
    registry.put(handle);
    assert_eq!(drops.load(Ordering::SeqCst), 0, "clone still alive");

    assert_eq!(clone.lock().unwrap().payload().map(|p| p.tag), Some(1));
    registry.put(clone);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(registry.is_empty());
}

#[test]
fn bookkeeping_payload_dropped_on_last_put() {
    let drops = Arc::new(AtomicUsize::new(0));
    let registry: Registry<DropCounter> = registry();

    let handle = registry
        .create_with(ObjectKind::Bookkeeping, DropCounter::new(2, &drops))
        .unwrap();
    registry.put(handle);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(registry.is_empty());
}

#[test]
fn replaced_payload_is_returned_not_leaked() {
    let drops = Arc::new(AtomicUsize::new(0));
    let registry: Registry<DropCounter> = registry();
    let handle = registry.create(ObjectKind::Node).unwrap();

    {
        let mut guard = handle.lock().unwrap();
        assert!(guard.payload().is_none());
        assert!(guard.replace_payload(DropCounter::new(1, &drops)).is_none());
        let old = guard.replace_payload(DropCounter::new(2, &drops));
        assert_eq!(old.map(|p| p.tag), Some(1));
    }
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    let taken = handle.lock().unwrap().take_payload();
    assert_eq!(taken.as_ref().map(|p| p.tag), Some(2));
    drop(taken);
    assert_eq!(drops.load(Ordering::SeqCst), 2);

    registry.destroy(&handle);
    drop(handle);
    assert_eq!(drops.load(Ordering::SeqCst), 2, "no payload left to drop");
}

#[test]
fn repeated_destroy_is_a_noop() {
    let registry: Registry<()> = registry();
    let handle = registry.create(ObjectKind::Node).unwrap();
    let id = handle.id();
    registry.destroy(&handle);
    registry.destroy(&handle);
    registry.destroy_id(id).unwrap();
    assert_eq!(registry.stats().destroy_pending, 1);
    handle.put();
    assert!(registry.is_empty());
}

/// Payload owning a handle into the registry it lives in, like an inode pinning its parent.
struct Holder(#[allow(dead_code)] Option<Handle<Holder>>);

/// Runs `create_with` on another thread, failing instead of hanging if it never returns.
fn create_with_deadline(
    registry: &Registry<Holder>,
    payload: Holder,
) -> Result<ObjectId, RegistryError> {
    let registry = registry.clone();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let created = registry
            .create_with(ObjectKind::Node, payload)
            .map(|handle| handle.id());
        tx.send(created).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(3))
        .expect("create_with did not return")
}

#[test]
fn rejected_payload_holding_a_handle_is_released_after_id_space_exhaustion() {
    let registry: Registry<Holder> = bounded_registry(1);
    let parent = registry.create(ObjectKind::Bookkeeping).unwrap();
    let parent_id = parent.id();

    let result = create_with_deadline(&registry, Holder(Some(parent)));
    assert_eq!(
        result,
        Err(RegistryError::ResourceExhausted(Exhaustion::IdSpace {
            limit: 1
        }))
    );
    assert!(
        !registry.contains(parent_id),
        "handle inside the rejected payload was released"
    );
    assert!(registry.is_empty());
}

#[test]
fn rejected_payload_holding_a_handle_is_released_after_capacity_exhaustion() {
    let registry: Registry<Holder> = Registry::new(RegistryConfig {
        id_limit: u32::MAX,
        max_objects: Some(1),
    });
    let parent = registry.create(ObjectKind::Bookkeeping).unwrap();

    let result = create_with_deadline(&registry, Holder(Some(parent)));
    assert_eq!(
        result,
        Err(RegistryError::ResourceExhausted(Exhaustion::Capacity {
            max_objects: 1
        }))
    );
    assert!(registry.is_empty());

    let id = create_with_deadline(&registry, Holder(None)).expect("capacity freed");
    assert_eq!(id, ObjectId(0));
}
