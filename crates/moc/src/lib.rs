pub mod api;
pub mod config;
mod db;
pub mod migration;
pub mod store;

pub use api::{IngestApi, ReadApi, SchemaAdminApi};
pub use config::{DatabaseConfig, MocConfig, PoolConfig};
pub use store::{BackendCapabilities, MocStore};

pub use moc_core::*;
