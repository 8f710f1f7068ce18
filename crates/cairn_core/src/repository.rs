//! Contract with the backing repository that owns durability.
//!
//! The store never mutates records in place: every write appends a version
//! to a record and hands the whole record back through [`Repository::apply`].
//! A batch is applied all-or-nothing, and each mutation can carry an
//! expectation about the version it replaces so concurrent writers surface as
//! conflicts instead of lost updates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{AuditHeader, GraphError, GraphResult, Guid, MetadataElement, Relationship, Timestamp};

pub trait Versioned {
    fn guid(&self) -> Guid;
    fn header(&self) -> &AuditHeader;
}

impl Versioned for MetadataElement {
    fn guid(&self) -> Guid {
        self.guid
    }

    fn header(&self) -> &AuditHeader {
        &self.header
    }
}

impl Versioned for Relationship {
    fn guid(&self) -> Guid {
        self.guid
    }

    fn header(&self) -> &AuditHeader {
        &self.header
    }
}

/// Every version of one element or relationship, oldest first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord<T> {
    pub guid: Guid,
    versions: Vec<T>,
}

pub type ElementRecord = VersionedRecord<MetadataElement>;
pub type RelationshipRecord = VersionedRecord<Relationship>;

impl<T: Versioned + Clone> VersionedRecord<T> {
    pub fn new(first: T) -> Self {
        Self {
            guid: first.guid(),
            versions: vec![first],
        }
    }

    pub fn latest(&self) -> &T {
        // `new` seeds one version and versions are only ever appended.
        &self.versions[self.versions.len() - 1]
    }

    pub fn version(&self) -> u64 {
        self.latest().header().version
    }

    /// The version that was current at `at`; `None` means now.
    pub fn as_of(&self, at: Option<Timestamp>) -> Option<&T> {
        match at {
            None => Some(self.latest()),
            Some(at) => self
                .versions
                .iter()
                .rev()
                .find(|version| version.header().updated_at <= at),
        }
    }

    pub fn versions(&self) -> &[T] {
        &self.versions
    }

    pub fn with_version(&self, next: T) -> Self {
        let mut versions = self.versions.clone();
        versions.push(next);
        Self {
            guid: self.guid,
            versions,
        }
    }
}

impl ElementRecord {
    pub fn type_name(&self) -> &str {
        &self.latest().type_name
    }

    pub fn anchor_guid(&self) -> Option<Guid> {
        self.latest().anchor_guid
    }
}

impl RelationshipRecord {
    pub fn type_name(&self) -> &str {
        &self.latest().type_name
    }

    pub fn end1_guid(&self) -> Guid {
        self.latest().end1_guid
    }

    pub fn end2_guid(&self) -> Guid {
        self.latest().end2_guid
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expectation {
    Any,
    Absent,
    Version(u64),
}

impl Expectation {
    pub fn check(self, what: &str, guid: Guid, current: Option<u64>) -> GraphResult<()> {
        match (self, current) {
            (Expectation::Any, _) => Ok(()),
            (Expectation::Absent, None) => Ok(()),
            (Expectation::Absent, Some(_)) => {
                Err(GraphError::conflict(format!("{what} {guid} already exists")))
            }
            (Expectation::Version(expected), Some(actual)) if expected == actual => Ok(()),
            (Expectation::Version(expected), Some(actual)) => Err(GraphError::conflict(format!(
                "{what} {guid} changed concurrently (expected version {expected}, found {actual})"
            ))),
            (Expectation::Version(_), None) => Err(GraphError::conflict(format!(
                "{what} {guid} was removed concurrently"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    PutElement {
        record: ElementRecord,
        expect: Expectation,
    },
    RemoveElement {
        guid: Guid,
        expect: Expectation,
    },
    PutRelationship {
        record: RelationshipRecord,
        expect: Expectation,
    },
    RemoveRelationship {
        guid: Guid,
        expect: Expectation,
    },
}

/// Pre-filter for element scans, applied to each record's latest version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ElementScan {
    pub type_names: Option<Vec<String>>,
    pub anchor_guid: Option<Guid>,
}

impl ElementScan {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn anchored_by(anchor: Guid) -> Self {
        Self {
            type_names: None,
            anchor_guid: Some(anchor),
        }
    }

    pub fn admits(&self, record: &ElementRecord) -> bool {
        let type_ok = self
            .type_names
            .as_ref()
            .is_none_or(|names| names.iter().any(|name| name == record.type_name()));
        let anchor_ok = self
            .anchor_guid
            .is_none_or(|anchor| record.anchor_guid() == Some(anchor));
        type_ok && anchor_ok
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub elements: u64,
    pub relationships: u64,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn element(&self, guid: Guid) -> GraphResult<Option<ElementRecord>>;
    async fn relationship(&self, guid: Guid) -> GraphResult<Option<RelationshipRecord>>;
    async fn scan_elements(&self, scan: &ElementScan) -> GraphResult<Vec<ElementRecord>>;
    /// Relationships with `guid` at either end.
    async fn relationships_for(&self, guid: Guid) -> GraphResult<Vec<RelationshipRecord>>;
    /// Apply every mutation or none of them. Expectations are checked against
    /// the state produced by the earlier mutations of the same batch.
    async fn apply(&self, batch: Vec<Mutation>) -> GraphResult<()>;
    async fn stats(&self) -> GraphResult<RepositoryStats>;
}

#[cfg(test)]
mod tests {
    use super::{ElementRecord, ElementScan, Expectation};
    use crate::{
        AuditHeader, EffectivityWindow, GraphError, Guid, InstanceStatus, MetadataElement,
        PropertyBag, Timestamp,
    };
    use std::collections::BTreeMap;

    fn element(at: i64) -> MetadataElement {
        let guid = Guid::new();
        MetadataElement {
            guid,
            type_name: "Asset".to_string(),
            status: InstanceStatus::Active,
            effectivity: EffectivityWindow::always(),
            anchor_guid: Some(guid),
            anchor_type_name: Some("Asset".to_string()),
            anchor_scope_guid: None,
            classifications: BTreeMap::new(),
            properties: PropertyBag::new().with("qualifiedName", "a"),
            header: AuditHeader::new("tester", Timestamp(at)),
        }
    }

    #[test]
    fn as_of_selects_version_current_at_time() {
        let first = element(10);
        let mut second = first.clone();
        second.properties.insert("name", "renamed");
        second.header = first.header.touched("tester", Timestamp(20));
        let record = ElementRecord::new(first).with_version(second);
        assert!(record.as_of(Some(Timestamp(5))).is_none());
        assert_eq!(record.as_of(Some(Timestamp(15))).unwrap().header.version, 1);
        assert_eq!(record.as_of(Some(Timestamp(20))).unwrap().header.version, 2);
        assert_eq!(record.as_of(None).unwrap().header.version, 2);
        assert_eq!(record.version(), 2);
    }

    #[test]
    fn expectations() {
        let guid = Guid::new();
        assert!(Expectation::Absent.check("element", guid, None).is_ok());
        assert!(matches!(
            Expectation::Absent.check("element", guid, Some(1)),
            Err(GraphError::Conflict { .. })
        ));
        assert!(Expectation::Version(2).check("element", guid, Some(2)).is_ok());
        assert!(Expectation::Version(2).check("element", guid, Some(3)).is_err());
        assert!(Expectation::Version(2).check("element", guid, None).is_err());
        assert!(Expectation::Any.check("element", guid, None).is_ok());
    }

    #[test]
    fn scan_filters_on_latest_version() {
        let record = ElementRecord::new(element(1));
        assert!(ElementScan::all().admits(&record));
        assert!(ElementScan::anchored_by(record.guid).admits(&record));
        assert!(!ElementScan::anchored_by(Guid::new()).admits(&record));
        let scan = ElementScan {
            type_names: Some(vec!["Comment".to_string()]),
            anchor_guid: None,
        };
        assert!(!scan.admits(&record));
    }
}
