//! mnemo-core - Core library for Mnemo
//!
//! This crate contains the tenant store, collection model, scheduler counts,
//! and the sync/snapshot/media engines used by the sync server.

pub mod collection;
pub mod db;
pub mod defaults;
pub mod error;
pub mod media;
pub mod models;
pub mod sched;
pub mod snapshot;
pub mod sync;
pub mod text;

pub use collection::Collection;
pub use db::{SchemaDialect, SqliteDialect, TenantStore};
pub use error::{Error, Result};
