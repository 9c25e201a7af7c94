//! Relational layer: table catalog, SQL dialect strategy, tenant store.

pub mod dialect;
mod store;

pub use dialect::{SchemaDialect, SqliteDialect, TableDef, SCHEMA_VERSION, TABLES};
pub use store::TenantStore;
