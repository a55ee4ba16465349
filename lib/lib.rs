//! Object registry for flash filesystem nodes.
//!
//! Open filesystem nodes live in a [`Registry`] as reference-counted objects, each named by a
//! dense [`ObjectId`] and guarded by its own payload lock. Ids are handed out smallest-first by
//! an augmented balanced tree ([`gap_tree::GapTree`]), so ids freed by destroyed objects are
//! reused before the id space grows.

/// Registry sizing configuration.
pub mod config;
/// Registry error taxonomy.
pub mod error;
pub mod gap_tree;
mod handle;
mod object;
mod pool;
mod registry;

pub use config::RegistryConfig;
pub use error::{Exhaustion, RegistryError};
pub use handle::Handle;
pub use object::{ObjectGuard, ObjectId, ObjectInfo, ObjectKind, ObjectState};
pub use pool::PoolStats;
pub use registry::Registry;
