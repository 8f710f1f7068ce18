use serde::{Deserialize, Serialize};

use crate::{GraphError, GraphResult, TypeDef};

/// On-disk shape of a type catalog: the built-in set ships as one of these,
/// and hosts may load their own from `type_catalog_path`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypeManifest {
    pub manifest_version: String,
    pub types: Vec<TypeDef>,
}

pub fn builtin_manifest_json() -> &'static str {
    include_str!("../builtin_types.json")
}

pub fn load_builtin_manifest() -> GraphResult<TypeManifest> {
    parse_manifest(builtin_manifest_json())
}

pub fn parse_manifest(raw: &str) -> GraphResult<TypeManifest> {
    serde_json::from_str(raw).map_err(|err| GraphError::invalid(format!("type manifest parse: {err}")))
}
