//! Local store
//!
//! This module provides:
//! - [`LocalStore`] trait for the replica the workers write into
//! - [`InMemoryLocalStore`] for testing, with the same write semantics as the
//!   production document database (revision checks, stale-write rejection)

mod memory;
mod traits;

pub use memory::InMemoryLocalStore;
pub use traits::{BulkWriteResult, LocalStore, StoreError, WriteError};
