//! Persisted scheduler state.
//!
//! Queue and pool snapshots are written in full after every mutation
//! through a [`StateStore`], so the process can restart without losing
//! queue contents.

mod snapshot;
mod store;

pub use snapshot::{PoolSnapshot, QueueSnapshot};
pub use store::{JsonFileStore, MemoryStore, StateStore};
