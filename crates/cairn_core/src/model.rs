use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{EffectivityWindow, GraphError, Guid, PropertyBag, Timestamp};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Draft,
    Prepared,
    Proposed,
    Approved,
    Rejected,
    Active,
    Disabled,
    Deprecated,
    Other,
    Deleted,
}

impl InstanceStatus {
    pub fn is_deleted(self) -> bool {
        self == InstanceStatus::Deleted
    }
}

/// Which statuses a read accepts. An empty filter accepts every live
/// status; `Deleted` is only returned when asked for by name or when the
/// read is made for lineage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFilter(pub Vec<InstanceStatus>);

impl StatusFilter {
    pub fn any() -> Self {
        Self(Vec::new())
    }

    pub fn only(statuses: impl IntoIterator<Item = InstanceStatus>) -> Self {
        Self(statuses.into_iter().collect())
    }

    pub fn accepts(&self, status: InstanceStatus, for_lineage: bool) -> bool {
        if self.0.is_empty() {
            return !status.is_deleted() || for_lineage;
        }
        self.0.contains(&status)
    }
}

/// Built-in element kinds known to every catalog, plus an open slot for
/// types contributed by hosting services.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Referenceable,
    Asset,
    DataSet,
    DataFile,
    CsvFile,
    SchemaType,
    SchemaAttribute,
    Collection,
    Comment,
    GovernanceDefinition,
    GovernancePolicy,
    SolutionBlueprint,
    SolutionComponent,
    SurveyReport,
    Annotation,
    Custom(String),
}

impl ElementKind {
    pub const BUILTIN: [ElementKind; 15] = [
        ElementKind::Referenceable,
        ElementKind::Asset,
        ElementKind::DataSet,
        ElementKind::DataFile,
        ElementKind::CsvFile,
        ElementKind::SchemaType,
        ElementKind::SchemaAttribute,
        ElementKind::Collection,
        ElementKind::Comment,
        ElementKind::GovernanceDefinition,
        ElementKind::GovernancePolicy,
        ElementKind::SolutionBlueprint,
        ElementKind::SolutionComponent,
        ElementKind::SurveyReport,
        ElementKind::Annotation,
    ];

    pub fn type_name(&self) -> &str {
        match self {
            ElementKind::Referenceable => "Referenceable",
            ElementKind::Asset => "Asset",
            ElementKind::DataSet => "DataSet",
            ElementKind::DataFile => "DataFile",
            ElementKind::CsvFile => "CSVFile",
            ElementKind::SchemaType => "SchemaType",
            ElementKind::SchemaAttribute => "SchemaAttribute",
            ElementKind::Collection => "Collection",
            ElementKind::Comment => "Comment",
            ElementKind::GovernanceDefinition => "GovernanceDefinition",
            ElementKind::GovernancePolicy => "GovernancePolicy",
            ElementKind::SolutionBlueprint => "SolutionBlueprint",
            ElementKind::SolutionComponent => "SolutionComponent",
            ElementKind::SurveyReport => "SurveyReport",
            ElementKind::Annotation => "Annotation",
            ElementKind::Custom(name) => name.as_str(),
        }
    }

    /// The kind's direct supertype among the built-ins.
    pub fn super_type(&self) -> Option<ElementKind> {
        match self {
            ElementKind::Referenceable | ElementKind::Custom(_) => None,
            ElementKind::DataSet | ElementKind::DataFile => Some(ElementKind::Asset),
            ElementKind::CsvFile => Some(ElementKind::DataFile),
            ElementKind::GovernancePolicy => Some(ElementKind::GovernanceDefinition),
            _ => Some(ElementKind::Referenceable),
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

impl FromStr for ElementKind {
    type Err = GraphError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Err(GraphError::invalid("type name must not be empty"));
        }
        Ok(ElementKind::BUILTIN
            .iter()
            .find(|kind| kind.type_name() == value)
            .cloned()
            .unwrap_or_else(|| ElementKind::Custom(value.to_string())))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditHeader {
    pub created_by: String,
    pub created_at: Timestamp,
    pub updated_by: String,
    pub updated_at: Timestamp,
    pub version: u64,
}

impl AuditHeader {
    pub fn new(actor: &str, at: Timestamp) -> Self {
        Self {
            created_by: actor.to_string(),
            created_at: at,
            updated_by: actor.to_string(),
            updated_at: at,
            version: 1,
        }
    }

    pub fn touched(&self, actor: &str, at: Timestamp) -> Self {
        Self {
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            updated_by: actor.to_string(),
            updated_at: at,
            version: self.version + 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub name: String,
    pub properties: PropertyBag,
    pub effectivity: EffectivityWindow,
    pub header: AuditHeader,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataElement {
    pub guid: Guid,
    pub type_name: String,
    pub status: InstanceStatus,
    pub effectivity: EffectivityWindow,
    pub anchor_guid: Option<Guid>,
    pub anchor_type_name: Option<String>,
    pub anchor_scope_guid: Option<Guid>,
    pub classifications: BTreeMap<String, Classification>,
    pub properties: PropertyBag,
    pub header: AuditHeader,
}

impl MetadataElement {
    pub fn kind(&self) -> ElementKind {
        self.type_name
            .parse()
            .unwrap_or_else(|_| ElementKind::Custom(self.type_name.clone()))
    }

    pub fn is_own_anchor(&self) -> bool {
        self.anchor_guid == Some(self.guid)
    }

    pub fn is_classified(&self, name: &str) -> bool {
        self.classifications.contains_key(name)
    }

    pub fn display_name(&self) -> Option<&str> {
        self.properties
            .get_str("displayName")
            .or_else(|| self.properties.get_str("name"))
            .or_else(|| self.properties.get_str("qualifiedName"))
    }

    pub fn summary(&self) -> ElementSummary {
        ElementSummary {
            guid: self.guid,
            type_name: self.type_name.clone(),
            qualified_name: self.properties.get_str("qualifiedName").map(str::to_string),
            display_name: self.display_name().map(str::to_string),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub guid: Guid,
    pub type_name: String,
    pub end1_guid: Guid,
    pub end1_type_name: String,
    pub end2_guid: Guid,
    pub end2_type_name: String,
    pub status: InstanceStatus,
    pub properties: PropertyBag,
    pub effectivity: EffectivityWindow,
    pub header: AuditHeader,
}

impl Relationship {
    pub fn touches(&self, guid: Guid) -> bool {
        self.end1_guid == guid || self.end2_guid == guid
    }

    /// The end opposite `guid`, if `guid` is one of the ends.
    pub fn other_end(&self, guid: Guid) -> Option<Guid> {
        if self.end1_guid == guid {
            Some(self.end2_guid)
        } else if self.end2_guid == guid {
            Some(self.end1_guid)
        } else {
            None
        }
    }

    pub fn connects(&self, a: Guid, b: Guid, either_order: bool) -> bool {
        (self.end1_guid == a && self.end2_guid == b)
            || (either_order && self.end1_guid == b && self.end2_guid == a)
    }
}

/// Header-level description of an element used inside derived views.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSummary {
    pub guid: Guid,
    pub type_name: String,
    pub qualified_name: Option<String>,
    pub display_name: Option<String>,
}
