use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cairn_core::{GraphError, GraphResult};

const DEFAULT_CONFIG_NAME: &str = "cairn.json";
const DEFAULT_DB_NAME: &str = "cairn.sqlite";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum RepositoryConfig {
    Memory,
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitsConfig {
    pub max_page_size: Option<u32>,
    pub max_traversal_depth: Option<u32>,
    pub max_cascade_members: Option<usize>,
    pub max_cascade_rounds: Option<u32>,
}

impl LimitsConfig {
    pub fn with_defaults() -> Self {
        Self {
            max_page_size: Some(500),
            max_traversal_depth: Some(16),
            max_cascade_members: Some(10_000),
            max_cascade_rounds: Some(3),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Off,
    Warn,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub repository: RepositoryConfig,
    pub pool: Option<PoolConfig>,
    pub limits: Option<LimitsConfig>,
    pub validation_mode: Option<ValidationMode>,
    pub operation_timeout_ms: Option<u64>,
    /// JSON type manifest layered over the built-in types.
    pub type_catalog_path: Option<String>,
}

impl StoreConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            repository: RepositoryConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
            limits: Some(LimitsConfig::with_defaults()),
            validation_mode: Some(ValidationMode::Error),
            operation_timeout_ms: Some(30_000),
            type_catalog_path: None,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            repository: RepositoryConfig::Memory,
            ..Self::default_sqlite(DEFAULT_DB_NAME)
        }
    }

    /// Read `cairn.json` from `base_dir`, writing the SQLite defaults on
    /// first use.
    pub fn load_or_init(base_dir: &Path) -> GraphResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| GraphError::unavailable(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| GraphError::unavailable(format!("read config: {err}")))?;
            return serde_json::from_str(&raw)
                .map_err(|err| GraphError::invalid(format!("config: {err}")));
        }
        let default = StoreConfig::default_sqlite(DEFAULT_DB_NAME);
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| GraphError::unavailable(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| GraphError::unavailable(format!("write config: {err}")))?;
        Ok(default)
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> GraphResult<PathBuf> {
        match &self.repository {
            RepositoryConfig::Sqlite { path } => {
                let path = path.clone().unwrap_or_else(|| DEFAULT_DB_NAME.to_string());
                Ok(resolve_against(base_dir, &path))
            }
            _ => Err(GraphError::invalid("config is not sqlite backend")),
        }
    }

    pub fn type_catalog_path(&self, base_dir: &Path) -> Option<PathBuf> {
        self.type_catalog_path
            .as_deref()
            .map(|path| resolve_against(base_dir, path))
    }

    pub fn backend_name(&self) -> &'static str {
        match self.repository {
            RepositoryConfig::Memory => "memory",
            RepositoryConfig::Sqlite { .. } => "sqlite",
            RepositoryConfig::Postgres { .. } => "postgres",
            RepositoryConfig::Mysql { .. } => "mysql",
        }
    }

    pub fn connection_url(&self) -> Option<&str> {
        match &self.repository {
            RepositoryConfig::Memory | RepositoryConfig::Sqlite { .. } => None,
            RepositoryConfig::Postgres { url } | RepositoryConfig::Mysql { url } => {
                Some(url.as_str())
            }
        }
    }
}

fn resolve_against(base_dir: &Path, path: &str) -> PathBuf {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        candidate
    } else {
        base_dir.join(candidate)
    }
}

pub fn default_sqlite_path(base_dir: &Path) -> PathBuf {
    base_dir.join(DEFAULT_DB_NAME)
}
