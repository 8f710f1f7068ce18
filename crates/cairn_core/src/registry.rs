use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    GraphError, GraphResult, PropertyBag, TypeManifest, ValueType, load_builtin_manifest,
    parse_manifest,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeCategory {
    Entity,
    Relationship,
    Classification,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub category: TypeCategory,
    #[serde(default)]
    pub super_type: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
    /// Relationships: `[end1, end2]` entity types. Classifications: entity
    /// types the classification may be attached to (empty means any).
    #[serde(default)]
    pub valid_end_types: Vec<String>,
    /// Relationships only: end1 owns end2, so end2 shares end1's anchor.
    #[serde(default)]
    pub ownership: bool,
    /// Relationships only: at most one edge per unordered pair of ends.
    #[serde(default)]
    pub undirected: bool,
}

impl TypeDef {
    pub fn is_classification(&self) -> bool {
        self.category == TypeCategory::Classification
    }

    pub fn end_types(&self) -> Option<(&str, &str)> {
        match self.valid_end_types.as_slice() {
            [end1, end2] if self.category == TypeCategory::Relationship => {
                Some((end1.as_str(), end2.as_str()))
            }
            _ => None,
        }
    }
}

/// Read-only view of the type schema the store validates against.
pub trait TypeRegistry: Send + Sync {
    fn resolve_type(&self, name: &str) -> Option<TypeDef>;

    fn type_names(&self) -> Vec<String>;

    fn is_subtype_of(&self, name: &str, ancestor: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(name.to_string());
        while let Some(candidate) = current {
            if candidate == ancestor {
                return true;
            }
            if !seen.insert(candidate.clone()) {
                return false;
            }
            current = self.resolve_type(&candidate).and_then(|def| def.super_type);
        }
        false
    }

    /// `name` and every type that inherits from it.
    fn type_and_subtypes(&self, name: &str) -> Vec<String> {
        self.type_names()
            .into_iter()
            .filter(|candidate| self.is_subtype_of(candidate, name))
            .collect()
    }

    /// Attributes declared on the type and all of its supertypes.
    fn effective_attributes(&self, name: &str) -> Vec<AttributeDef> {
        let mut seen = HashSet::new();
        let mut attributes: Vec<AttributeDef> = Vec::new();
        let mut current = Some(name.to_string());
        while let Some(candidate) = current {
            if !seen.insert(candidate.clone()) {
                break;
            }
            let Some(def) = self.resolve_type(&candidate) else {
                break;
            };
            for attribute in def.attributes {
                if !attributes.iter().any(|known| known.name == attribute.name) {
                    attributes.push(attribute);
                }
            }
            current = def.super_type;
        }
        attributes
    }

    /// Problems found checking `properties` against the type's attributes.
    fn check_properties(&self, name: &str, properties: &PropertyBag) -> Vec<String> {
        let attributes = self.effective_attributes(name);
        let mut problems = Vec::new();
        for (property, value) in properties.iter() {
            match attributes.iter().find(|attr| &attr.name == property) {
                None => problems.push(format!("{name} has no attribute '{property}'")),
                Some(attr) if attr.value_type != value.value_type() => problems.push(format!(
                    "attribute '{property}' of {name} expects {:?}, got {:?}",
                    attr.value_type,
                    value.value_type()
                )),
                Some(_) => {}
            }
        }
        for attr in attributes.iter().filter(|attr| attr.required) {
            if !properties.contains(&attr.name) {
                problems.push(format!("{name} requires attribute '{}'", attr.name));
            }
        }
        problems
    }
}

/// In-memory registry seeded from a manifest.
#[derive(Clone, Debug, Default)]
pub struct TypeCatalog {
    manifest_version: String,
    types: BTreeMap<String, TypeDef>,
}

impl TypeCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> GraphResult<Self> {
        Self::from_manifest(load_builtin_manifest()?)
    }

    pub fn from_manifest(manifest: TypeManifest) -> GraphResult<Self> {
        let mut catalog = Self {
            manifest_version: manifest.manifest_version,
            types: BTreeMap::new(),
        };
        for def in manifest.types {
            catalog.register(def)?;
        }
        Ok(catalog)
    }

    pub fn from_json(raw: &str) -> GraphResult<Self> {
        Self::from_manifest(parse_manifest(raw)?)
    }

    /// Built-ins extended (and overridden by name) with the types in `path`.
    pub fn load_extending_builtins(path: &Path) -> GraphResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| GraphError::invalid(format!("read type catalog: {err}")))?;
        let extra = parse_manifest(&raw)?;
        let mut catalog = Self::with_builtins()?;
        catalog.manifest_version = format!("{}+{}", catalog.manifest_version, extra.manifest_version);
        for def in extra.types {
            catalog.register(def)?;
        }
        Ok(catalog)
    }

    /// Add or replace a type. Supertypes must already be registered and share
    /// the type's category.
    pub fn register(&mut self, def: TypeDef) -> GraphResult<()> {
        if def.name.trim().is_empty() {
            return Err(GraphError::invalid("type name must not be empty"));
        }
        if let Some(parent) = &def.super_type {
            let Some(parent_def) = self.types.get(parent) else {
                return Err(GraphError::invalid(format!(
                    "type {} extends unknown type {parent}",
                    def.name
                )));
            };
            if parent_def.category != def.category {
                return Err(GraphError::invalid(format!(
                    "type {} and its supertype {parent} differ in category",
                    def.name
                )));
            }
            if self.is_subtype_of(parent, &def.name) {
                return Err(GraphError::invalid(format!(
                    "type {} would inherit from itself",
                    def.name
                )));
            }
        }
        if def.category == TypeCategory::Relationship && def.end_types().is_none() {
            return Err(GraphError::invalid(format!(
                "relationship type {} must name exactly two end types",
                def.name
            )));
        }
        self.types.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn manifest_version(&self) -> &str {
        &self.manifest_version
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Stable content hash, logged when a store opens so two hosts can tell
    /// whether they validate against the same schema.
    pub fn fingerprint(&self) -> GraphResult<String> {
        let defs: Vec<&TypeDef> = self.types.values().collect();
        let payload = serde_json::to_vec(&defs)?;
        Ok(blake3::hash(&payload).to_hex().to_string())
    }
}

impl TypeRegistry for TypeCatalog {
    fn resolve_type(&self, name: &str) -> Option<TypeDef> {
        self.types.get(name).cloned()
    }

    fn type_names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{AttributeDef, TypeCatalog, TypeCategory, TypeDef, TypeRegistry};
    use crate::{ElementKind, PropertyBag, ValueType};

    fn custom_entity(name: &str, super_type: Option<&str>) -> TypeDef {
        TypeDef {
            name: name.to_string(),
            category: TypeCategory::Entity,
            super_type: super_type.map(str::to_string),
            attributes: vec![AttributeDef {
                name: "region".to_string(),
                value_type: ValueType::Str,
                required: false,
            }],
            valid_end_types: Vec::new(),
            ownership: false,
            undirected: false,
        }
    }

    #[test]
    fn every_builtin_kind_resolves() {
        let catalog = TypeCatalog::with_builtins().expect("catalog");
        for kind in ElementKind::BUILTIN.iter() {
            let def = catalog.resolve_type(kind.type_name()).expect("builtin kind");
            assert_eq!(def.category, TypeCategory::Entity);
            assert_eq!(def.super_type, kind.super_type().map(|k| k.to_string()));
        }
    }

    #[test]
    fn subtypes_include_transitive_descendants() {
        let catalog = TypeCatalog::with_builtins().expect("catalog");
        let subtypes = catalog.type_and_subtypes("Asset");
        for name in ["Asset", "DataSet", "DataFile", "CSVFile"] {
            assert!(subtypes.iter().any(|s| s == name), "missing {name}");
        }
        assert!(!subtypes.iter().any(|s| s == "Comment"));
    }

    #[test]
    fn register_rejects_unknown_supertype_and_category_mismatch() {
        let mut catalog = TypeCatalog::with_builtins().expect("catalog");
        assert!(catalog.register(custom_entity("Lake", Some("Nope"))).is_err());
        let mut wrong = custom_entity("Odd", Some("ImplementedBy"));
        wrong.category = TypeCategory::Entity;
        assert!(catalog.register(wrong).is_err());
        catalog
            .register(custom_entity("DataLake", Some("Asset")))
            .expect("register");
        assert!(catalog.is_subtype_of("DataLake", "Referenceable"));
    }

    #[test]
    fn check_properties_reports_unknown_mistyped_and_missing() {
        let catalog = TypeCatalog::with_builtins().expect("catalog");
        let props = PropertyBag::new()
            .with("name", 5_i64)
            .with("colour", "blue");
        let problems = catalog.check_properties("Asset", &props);
        assert_eq!(problems.len(), 3, "{problems:?}");
        let ok = PropertyBag::new().with("qualifiedName", "asset::1");
        assert!(catalog.check_properties("Asset", &ok).is_empty());
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let mut catalog = TypeCatalog::with_builtins().expect("catalog");
        let before = catalog.fingerprint().expect("hash");
        catalog
            .register(custom_entity("DataLake", Some("Asset")))
            .expect("register");
        assert_ne!(before, catalog.fingerprint().expect("hash"));
    }
}
