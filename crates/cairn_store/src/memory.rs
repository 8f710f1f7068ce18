use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use cairn_core::{
    ElementRecord, ElementScan, GraphError, GraphResult, Guid, Mutation, RelationshipRecord,
    Repository, RepositoryStats,
};

#[derive(Default)]
struct MemoryState {
    elements: HashMap<Guid, ElementRecord>,
    relationships: HashMap<Guid, RelationshipRecord>,
    /// Element guid to the relationships that have it at either end.
    ends: HashMap<Guid, BTreeSet<Guid>>,
}

impl MemoryState {
    fn index_ends(&mut self, record: &RelationshipRecord) {
        for end in [record.end1_guid(), record.end2_guid()] {
            self.ends.entry(end).or_default().insert(record.guid);
        }
    }

    fn unindex_ends(&mut self, record: &RelationshipRecord) {
        for end in [record.end1_guid(), record.end2_guid()] {
            if let Some(set) = self.ends.get_mut(&end) {
                set.remove(&record.guid);
                if set.is_empty() {
                    self.ends.remove(&end);
                }
            }
        }
    }

    fn put_relationship(&mut self, record: RelationshipRecord) {
        if let Some(previous) = self.relationships.remove(&record.guid) {
            self.unindex_ends(&previous);
        }
        self.index_ends(&record);
        self.relationships.insert(record.guid, record);
    }

    fn remove_relationship(&mut self, guid: Guid) {
        if let Some(previous) = self.relationships.remove(&guid) {
            self.unindex_ends(&previous);
        }
    }
}

/// Process-local repository. Each batch is applied under one write lock, so
/// readers see either none or all of it.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> GraphError {
    GraphError::unavailable("memory repository poisoned")
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn element(&self, guid: Guid) -> GraphResult<Option<ElementRecord>> {
        let guard = self.state.read().map_err(poisoned)?;
        Ok(guard.elements.get(&guid).cloned())
    }

    async fn relationship(&self, guid: Guid) -> GraphResult<Option<RelationshipRecord>> {
        let guard = self.state.read().map_err(poisoned)?;
        Ok(guard.relationships.get(&guid).cloned())
    }

    async fn scan_elements(&self, scan: &ElementScan) -> GraphResult<Vec<ElementRecord>> {
        let guard = self.state.read().map_err(poisoned)?;
        let mut records: Vec<ElementRecord> = guard
            .elements
            .values()
            .filter(|record| scan.admits(record))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.guid);
        Ok(records)
    }

    async fn relationships_for(&self, guid: Guid) -> GraphResult<Vec<RelationshipRecord>> {
        let guard = self.state.read().map_err(poisoned)?;
        let Some(ids) = guard.ends.get(&guid) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| guard.relationships.get(id).cloned())
            .collect())
    }

    async fn apply(&self, batch: Vec<Mutation>) -> GraphResult<()> {
        let mut guard = self.state.write().map_err(poisoned)?;
        let mut staged_elements: HashMap<Guid, Option<ElementRecord>> = HashMap::new();
        let mut staged_relationships: HashMap<Guid, Option<RelationshipRecord>> = HashMap::new();
        let mut element_order = Vec::new();
        let mut relationship_order = Vec::new();

        for mutation in batch {
            match mutation {
                Mutation::PutElement { record, expect } => {
                    let current = match staged_elements.get(&record.guid) {
                        Some(staged) => staged.as_ref().map(ElementRecord::version),
                        None => guard.elements.get(&record.guid).map(ElementRecord::version),
                    };
                    expect.check("element", record.guid, current)?;
                    element_order.push(record.guid);
                    staged_elements.insert(record.guid, Some(record));
                }
                Mutation::RemoveElement { guid, expect } => {
                    let current = match staged_elements.get(&guid) {
                        Some(staged) => staged.as_ref().map(ElementRecord::version),
                        None => guard.elements.get(&guid).map(ElementRecord::version),
                    };
                    expect.check("element", guid, current)?;
                    element_order.push(guid);
                    staged_elements.insert(guid, None);
                }
                Mutation::PutRelationship { record, expect } => {
                    let current = match staged_relationships.get(&record.guid) {
                        Some(staged) => staged.as_ref().map(RelationshipRecord::version),
                        None => guard
                            .relationships
                            .get(&record.guid)
                            .map(RelationshipRecord::version),
                    };
                    expect.check("relationship", record.guid, current)?;
                    relationship_order.push(record.guid);
                    staged_relationships.insert(record.guid, Some(record));
                }
                Mutation::RemoveRelationship { guid, expect } => {
                    let current = match staged_relationships.get(&guid) {
                        Some(staged) => staged.as_ref().map(RelationshipRecord::version),
                        None => guard.relationships.get(&guid).map(RelationshipRecord::version),
                    };
                    expect.check("relationship", guid, current)?;
                    relationship_order.push(guid);
                    staged_relationships.insert(guid, None);
                }
            }
        }

        for guid in relationship_order {
            match staged_relationships.remove(&guid) {
                Some(Some(record)) => guard.put_relationship(record),
                Some(None) => guard.remove_relationship(guid),
                None => {}
            }
        }
        for guid in element_order {
            match staged_elements.remove(&guid) {
                Some(Some(record)) => {
                    guard.elements.insert(guid, record);
                }
                Some(None) => {
                    guard.elements.remove(&guid);
                }
                None => {}
            }
        }
        Ok(())
    }

    async fn stats(&self) -> GraphResult<RepositoryStats> {
        let guard = self.state.read().map_err(poisoned)?;
        Ok(RepositoryStats {
            elements: guard.elements.len() as u64,
            relationships: guard.relationships.len() as u64,
        })
    }
}
