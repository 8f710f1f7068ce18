use std::collections::HashSet;

use async_trait::async_trait;

use super::anchors::archived_relationship;
use super::{GraphStore, paginate, read_time, relationship_visible};
use cairn_core::{
    AuditHeader, CreateRelationshipInput, DetachInput, Expectation, FindRelationshipsInput,
    GraphError, GraphResult, Guid, InstanceStatus, MetadataElement, Mutation, PageCursor,
    QueryOptions, Relationship, RelationshipApi, RelationshipPage, RelationshipRecord,
    StatusFilter, Timestamp, UpdateRelationshipInput, decode_cursor,
};

impl GraphStore {
    async fn require_live_end(&self, guid: Guid, end: &str) -> GraphResult<MetadataElement> {
        self.fetch_element(guid)
            .await?
            .filter(|record| !record.latest().status.is_deleted())
            .map(|record| record.latest().clone())
            .ok_or_else(|| {
                GraphError::invalid(format!("{end} element {guid} does not exist"))
            })
    }

    async fn require_live_relationship(&self, guid: Guid) -> GraphResult<RelationshipRecord> {
        self.fetch_relationship(guid)
            .await?
            .filter(|record| !record.latest().status.is_deleted())
            .ok_or_else(|| GraphError::not_found(format!("relationship {guid}")))
    }

    /// Live relationships of exactly `type_name` joining the two ends. Both
    /// orders match when `either_order` is set.
    async fn live_links_between(
        &self,
        type_name: &str,
        end1: Guid,
        end2: Guid,
        either_order: bool,
    ) -> GraphResult<Vec<RelationshipRecord>> {
        Ok(self
            .relationships_of(end1)
            .await?
            .into_iter()
            .filter(|record| {
                let latest = record.latest();
                !latest.status.is_deleted()
                    && latest.type_name == type_name
                    && latest.connects(end1, end2, either_order)
            })
            .collect())
    }
}

#[async_trait]
impl RelationshipApi for GraphStore {
    async fn create_relationship(&self, input: CreateRelationshipInput) -> GraphResult<Guid> {
        let def = self.relationship_type(&input.type_name)?;
        input.effectivity.validate()?;
        let end1 = self.require_live_end(input.end1_guid, "end1").await?;
        let end2 = self.require_live_end(input.end2_guid, "end2").await?;
        self.check_end_types(&def, &end1.type_name, &end2.type_name)?;
        self.check_properties(&def.name, &input.properties)?;

        if !input.allow_duplicates {
            let existing = self
                .live_links_between(&def.name, end1.guid, end2.guid, def.undirected)
                .await?;
            if let Some(existing) = existing.first() {
                return Err(GraphError::conflict(format!(
                    "{} between {} and {} already exists as {}",
                    def.name, end1.guid, end2.guid, existing.guid
                )));
            }
        }

        let now = Timestamp::now();
        let relationship = Relationship {
            guid: Guid::new(),
            type_name: def.name.clone(),
            end1_guid: end1.guid,
            end1_type_name: end1.type_name,
            end2_guid: end2.guid,
            end2_type_name: end2.type_name,
            status: InstanceStatus::Active,
            properties: input.properties,
            effectivity: input.effectivity,
            header: AuditHeader::new(&input.actor, now),
        };
        let guid = relationship.guid;
        self.commit(vec![Mutation::PutRelationship {
            record: RelationshipRecord::new(relationship),
            expect: Expectation::Absent,
        }])
        .await?;
        log::debug!("cairn relationship created guid={guid} type={}", def.name);
        Ok(guid)
    }

    async fn get_relationship(
        &self,
        guid: Guid,
        options: QueryOptions,
    ) -> GraphResult<Option<Relationship>> {
        let at = read_time(&options);
        Ok(self.fetch_relationship(guid).await?.and_then(|record| {
            relationship_visible(&record, &options, &StatusFilter::any(), at)
        }))
    }

    async fn update_relationship(&self, input: UpdateRelationshipInput) -> GraphResult<()> {
        let record = self.require_live_relationship(input.guid).await?;
        let current = record.latest();
        if let Some(effectivity) = &input.effectivity {
            effectivity.validate()?;
        }
        let properties = if input.replace_all {
            input.properties
        } else {
            current.properties.merged(&input.properties)
        };
        self.check_properties(&current.type_name, &properties)?;

        let mut next = current.clone();
        next.properties = properties;
        next.effectivity = input.effectivity.unwrap_or(current.effectivity);
        next.header = current.header.touched(&input.actor, Timestamp::now());
        self.commit(vec![Mutation::PutRelationship {
            record: record.with_version(next),
            expect: Expectation::Version(record.version()),
        }])
        .await
    }

    async fn find_relationships(
        &self,
        input: FindRelationshipsInput,
    ) -> GraphResult<RelationshipPage> {
        let limit = self.page_limit(input.page.limit)?;
        let after = input.page.cursor.as_deref().map(decode_cursor).transpose()?;
        let type_names: Option<HashSet<String>> = match &input.type_name {
            Some(name) => Some(self.expand_relationship_types(std::slice::from_ref(name))?),
            None => None,
        };
        let at = read_time(&input.options);

        let mut relationships: Vec<Relationship> = self
            .relationships_of(input.guid)
            .await?
            .iter()
            .filter_map(|record| {
                relationship_visible(record, &input.options, &input.status_filter, at)
            })
            .filter(|relationship| input.direction.admits(relationship, input.guid))
            .filter(|relationship| {
                type_names
                    .as_ref()
                    .is_none_or(|names| names.contains(&relationship.type_name))
            })
            .filter(|relationship| after.as_ref().is_none_or(|cursor| relationship.guid > cursor.guid))
            .collect();
        relationships.sort_by_key(|relationship| relationship.guid);

        let (relationships, next_cursor) = paginate(relationships, limit, |relationship| {
            PageCursor {
                key: None,
                guid: relationship.guid,
            }
        })?;
        Ok(RelationshipPage {
            relationships,
            next_cursor,
        })
    }

    async fn delete_relationship(&self, actor: &str, guid: Guid) -> GraphResult<()> {
        let record = self.require_live_relationship(guid).await?;
        self.commit(vec![Mutation::PutRelationship {
            record: archived_relationship(&record, actor, Timestamp::now()),
            expect: Expectation::Version(record.version()),
        }])
        .await?;
        log::debug!("cairn relationship removed guid={guid}");
        Ok(())
    }

    async fn detach(&self, input: DetachInput) -> GraphResult<usize> {
        let def = self.relationship_type(&input.type_name)?;
        let mut matches = self
            .live_links_between(&def.name, input.end1_guid, input.end2_guid, true)
            .await?;
        if def.undirected {
            matches.truncate(1);
        }
        let now = Timestamp::now();
        let batch: Vec<Mutation> = matches
            .iter()
            .map(|record| Mutation::PutRelationship {
                record: archived_relationship(record, &input.actor, now),
                expect: Expectation::Version(record.version()),
            })
            .collect();
        let removed = batch.len();
        self.commit(batch).await?;
        log::debug!(
            "cairn detach type={} end1={} end2={} removed={removed}",
            def.name,
            input.end1_guid,
            input.end2_guid
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use crate::GraphStore;
    use cairn_core::{
        CreateElementInput, CreateRelationshipInput, DetachInput, Direction, ElementApi,
        FindRelationshipsInput, GraphError, Guid, PageRequest, PropertyBag, QueryOptions,
        RelationshipApi, StatusFilter,
    };

    async fn component(store: &GraphStore, name: &str) -> Guid {
        store
            .create_element(CreateElementInput::root(
                "tester",
                "SolutionComponent",
                PropertyBag::new().with("qualifiedName", name),
            ))
            .await
            .expect("component")
    }

    fn find(guid: Guid, direction: Direction) -> FindRelationshipsInput {
        FindRelationshipsInput {
            guid,
            direction,
            type_name: None,
            status_filter: StatusFilter::any(),
            options: QueryOptions::now(),
            page: PageRequest::first(50),
        }
    }

    #[tokio::test]
    async fn end_types_are_checked() {
        let store = GraphStore::in_memory().expect("store");
        let component = component(&store, "c").await;
        let comment = store
            .create_element(CreateElementInput::root(
                "tester",
                "Comment",
                PropertyBag::new().with("qualifiedName", "note"),
            ))
            .await
            .expect("comment");
        let err = store
            .create_relationship(CreateRelationshipInput::new(
                "tester",
                "SolutionCompositionLink",
                component,
                comment,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidParameter { .. }));
        let missing = store
            .create_relationship(CreateRelationshipInput::new(
                "tester",
                "ImplementedBy",
                component,
                Guid::new(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(missing, GraphError::InvalidParameter { .. }));
    }

    #[tokio::test]
    async fn undirected_types_conflict_in_reverse_order() {
        let store = GraphStore::in_memory().expect("store");
        let a = component(&store, "a").await;
        let b = component(&store, "b").await;
        store
            .create_relationship(CreateRelationshipInput::new("tester", "PeerDuplicateLink", a, b))
            .await
            .expect("first");
        let err = store
            .create_relationship(CreateRelationshipInput::new("tester", "PeerDuplicateLink", b, a))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Conflict { .. }));
        // Directed types only conflict in the same order.
        store
            .create_relationship(CreateRelationshipInput::new("tester", "ImplementedBy", a, b))
            .await
            .expect("forward");
        store
            .create_relationship(CreateRelationshipInput::new("tester", "ImplementedBy", b, a))
            .await
            .expect("reverse");
    }

    #[tokio::test]
    async fn detach_removes_every_duplicate_in_either_order() {
        let store = GraphStore::in_memory().expect("store");
        let a = component(&store, "a").await;
        let b = component(&store, "b").await;
        for (end1, end2) in [(a, b), (a, b), (b, a)] {
            let mut input = CreateRelationshipInput::new("tester", "ImplementedBy", end1, end2);
            input.allow_duplicates = true;
            store.create_relationship(input).await.expect("create");
        }
        let removed = store
            .detach(DetachInput {
                actor: "tester".to_string(),
                type_name: "ImplementedBy".to_string(),
                end1_guid: a,
                end2_guid: b,
            })
            .await
            .expect("detach");
        assert_eq!(removed, 3);
        let page = store
            .find_relationships(find(a, Direction::Both))
            .await
            .expect("find");
        assert!(page.relationships.is_empty());
    }

    #[tokio::test]
    async fn find_filters_direction_and_pages_by_guid() {
        let store = GraphStore::in_memory().expect("store");
        let hub = component(&store, "hub").await;
        for index in 0..5 {
            let spoke = component(&store, &format!("spoke-{index}")).await;
            store
                .create_relationship(CreateRelationshipInput::new(
                    "tester",
                    "ImplementedBy",
                    hub,
                    spoke,
                ))
                .await
                .expect("link");
        }
        let incoming = store
            .find_relationships(find(hub, Direction::Incoming))
            .await
            .expect("incoming");
        assert!(incoming.relationships.is_empty());

        let mut input = find(hub, Direction::Outgoing);
        input.page = PageRequest::first(2);
        let mut seen = Vec::new();
        loop {
            let page = store.find_relationships(input.clone()).await.expect("page");
            seen.extend(page.relationships.iter().map(|rel| rel.guid));
            match page.next_cursor {
                Some(cursor) => input.page = PageRequest::after(cursor, 2),
                None => break,
            }
        }
        assert_eq!(seen.len(), 5);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn deleted_relationship_remains_visible_to_lineage_reads() {
        let store = GraphStore::in_memory().expect("store");
        let a = component(&store, "a").await;
        let b = component(&store, "b").await;
        let guid = store
            .create_relationship(CreateRelationshipInput::new("tester", "ImplementedBy", a, b))
            .await
            .expect("create");
        store.delete_relationship("tester", guid).await.expect("delete");
        assert!(
            store
                .get_relationship(guid, QueryOptions::now())
                .await
                .expect("read")
                .is_none()
        );
        assert!(
            store
                .get_relationship(guid, QueryOptions::lineage())
                .await
                .expect("read")
                .is_some()
        );
        assert!(matches!(
            store.delete_relationship("tester", guid).await,
            Err(GraphError::NotFound { .. })
        ));
    }
}
