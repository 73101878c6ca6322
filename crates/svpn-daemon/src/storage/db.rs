//! Database connection and initialization.

pub use svpn_core::db::DatabaseError;

svpn_core::define_database!(Database, "Document store migrations complete");
