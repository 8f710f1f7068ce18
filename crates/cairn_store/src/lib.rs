pub mod config;
pub mod datastore;
mod db;
pub mod memory;
pub mod migration;
pub mod sql;
pub mod store;

pub use cairn_core::*;
pub use config::{
    LimitsConfig, PoolConfig, RepositoryConfig, StoreConfig, ValidationMode,
};
pub use datastore::{
    default_sqlite_path, load_or_init_config, load_registry, open_repository, open_store,
    open_store_with,
};
pub use memory::MemoryRepository;
pub use sql::SqlRepository;
pub use store::{GraphStore, StoreDiagnostics, StoreLimits, substitute_placeholders};
