//! Document store backends and path layout.
//!
//! `SqliteStore` is the durable backend; `MemoryStore` keeps everything in
//! process and exposes a manual clock for tests.

mod catalog;
mod db;
mod memory;
mod sqlite;

pub use catalog::{Catalog, CatalogError, DESCRIPTOR_FIELDS};
pub use db::{Database, DatabaseError};
pub use memory::{DEFAULT_START, MemoryStore};
pub use sqlite::{DEFAULT_MAX_ATTEMPTS, DEFAULT_OP_TIMEOUT, SqliteStore, VersionedDocument};
