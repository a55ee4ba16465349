#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use flash_registry::{Registry, RegistryConfig};

/// Payload that counts how many times it has been dropped.
#[derive(Debug)]
pub struct DropCounter {
    pub tag: u32,
    drops: Arc<AtomicUsize>,
}

impl DropCounter {
    pub fn new(tag: u32, drops: &Arc<AtomicUsize>) -> Self {
        Self {
            tag,
            drops: Arc::clone(drops),
        }
    }
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// A registry with default limits.
pub fn registry<P>() -> Registry<P> {
    Registry::new(RegistryConfig::default())
}

/// A registry whose ids stay below `id_limit`.
pub fn bounded_registry<P>(id_limit: u32) -> Registry<P> {
    Registry::new(RegistryConfig {
        id_limit,
        max_objects: None,
    })
}
