//! `db` crate: pure persistence layer.
//!
//! Provides a connection pool, typed row structs, repository functions for
//! the run-history tables, and the [`RunStore`] seam the engine records run
//! state through. No business logic lives here.

pub mod error;
pub mod pool;
pub mod repository;
pub mod models;
pub mod store;

pub use pool::DbPool;
pub use error::DbError;
pub use store::{MemoryRunStore, PgRunStore, RunStore};
