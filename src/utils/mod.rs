//! Shared helpers.

pub mod keyed_lock;
pub mod serde;

pub use keyed_lock::{KeyedGuard, KeyedLocks};
