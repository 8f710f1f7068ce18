use std::path::Path;
use std::sync::Arc;

use crate::{GraphStore, MemoryRepository, RepositoryConfig, SqlRepository, StoreConfig};
use cairn_core::{GraphResult, Repository, TypeCatalog};

pub use crate::config::default_sqlite_path;

pub fn load_or_init_config(base: &Path) -> GraphResult<StoreConfig> {
    StoreConfig::load_or_init(base)
}

pub async fn open_repository(
    config: &StoreConfig,
    base: &Path,
) -> GraphResult<Arc<dyn Repository>> {
    Ok(match config.repository {
        RepositoryConfig::Memory => Arc::new(MemoryRepository::new()),
        _ => Arc::new(SqlRepository::connect(config, base).await?),
    })
}

/// Built-in types, extended by the configured catalog file when there is one.
pub fn load_registry(config: &StoreConfig, base: &Path) -> GraphResult<TypeCatalog> {
    match config.type_catalog_path(base) {
        Some(path) => TypeCatalog::load_extending_builtins(&path),
        None => TypeCatalog::with_builtins(),
    }
}

pub async fn open_store_with(config: &StoreConfig, base: &Path) -> GraphResult<GraphStore> {
    let registry = load_registry(config, base)?;
    let repo = open_repository(config, base).await?;
    log::info!(
        "cairn store open backend={} types={} catalog={} fingerprint={}",
        config.backend_name(),
        registry.len(),
        registry.manifest_version(),
        registry.fingerprint()?
    );
    Ok(GraphStore::from_config(config, repo, Arc::new(registry)))
}

/// Open the store described by `cairn.json` under `base`, creating a SQLite
/// configuration there on first use.
pub async fn open_store(base: &Path) -> GraphResult<GraphStore> {
    let config = load_or_init_config(base)?;
    open_store_with(&config, base).await
}
