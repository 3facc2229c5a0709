//! Persistence layer: libSQL-backed rule storage.

pub mod libsql_backend;
pub mod migrations;

pub use libsql_backend::LibSqlRuleStore;
