use std::collections::BTreeMap;

use async_trait::async_trait;

use super::anchors::Removal;
use super::{GraphStore, element_visible, read_time};
use cairn_core::{
    AuditHeader, Classification, ClassifyInput, CreateElementInput, DeclassifyInput, ElementApi,
    ElementRecord, Expectation, GraphError, GraphResult, Guid, MetadataElement, Mutation,
    QueryOptions, RelationshipRecord, RemoveElementInput, StatusFilter, Timestamp,
    UpdateElementInput,
};

#[async_trait]
impl ElementApi for GraphStore {
    async fn create_element(&self, input: CreateElementInput) -> GraphResult<Guid> {
        let def = self.entity_type(&input.type_name)?;
        input.effectivity.validate()?;
        if input.status.is_deleted() {
            return Err(GraphError::invalid("cannot create an element as DELETED"));
        }
        self.check_properties(&def.name, &input.properties)?;

        let guid = Guid::new();
        let parent = match &input.parent_link {
            Some(link) => Some(self.resolve_parent(link).await?),
            None => None,
        };
        let anchor = self
            .resolve_anchor(
                guid,
                &def.name,
                input.anchor_guid,
                input.is_own_anchor,
                input.anchor_scope_guid,
                parent.as_ref().zip(input.parent_link.as_ref()),
            )
            .await?;

        let now = Timestamp::now();
        let mut batch = Vec::new();
        if let (Some(parent), Some(link)) = (&parent, &input.parent_link) {
            let relationship =
                self.parent_relationship(parent, link, guid, &def.name, &input.actor, now)?;
            batch.push(Mutation::PutRelationship {
                record: RelationshipRecord::new(relationship),
                expect: Expectation::Absent,
            });
        }
        let element = MetadataElement {
            guid,
            type_name: def.name.clone(),
            status: input.status,
            effectivity: input.effectivity,
            anchor_guid: Some(anchor.anchor_guid),
            anchor_type_name: Some(anchor.anchor_type_name),
            anchor_scope_guid: anchor.scope,
            classifications: BTreeMap::new(),
            properties: input.properties,
            header: AuditHeader::new(&input.actor, now),
        };
        batch.insert(
            0,
            Mutation::PutElement {
                record: ElementRecord::new(element),
                expect: Expectation::Absent,
            },
        );
        self.commit(batch).await?;
        log::debug!("cairn element created guid={guid} type={}", def.name);
        Ok(guid)
    }

    async fn get_element(
        &self,
        guid: Guid,
        options: QueryOptions,
    ) -> GraphResult<Option<MetadataElement>> {
        let at = read_time(&options);
        Ok(self
            .fetch_element(guid)
            .await?
            .and_then(|record| element_visible(&record, &options, &StatusFilter::any(), at)))
    }

    async fn update_element(&self, input: UpdateElementInput) -> GraphResult<()> {
        let record = self.require_live_element(input.guid).await?;
        let current = record.latest();
        if let Some(effectivity) = &input.effectivity {
            effectivity.validate()?;
        }
        if input.status.is_some_and(|status| status.is_deleted()) {
            return Err(GraphError::invalid(
                "status DELETED is set by archive_element, not update_element",
            ));
        }
        let properties = if input.replace_all {
            input.properties
        } else {
            current.properties.merged(&input.properties)
        };
        self.check_properties(&current.type_name, &properties)?;

        let now = Timestamp::now();
        let mut next = current.clone();
        next.properties = properties;
        next.effectivity = input.effectivity.unwrap_or(current.effectivity);
        next.status = input.status.unwrap_or(current.status);
        next.header = current.header.touched(&input.actor, now);
        self.commit(vec![Mutation::PutElement {
            record: record.with_version(next),
            expect: Expectation::Version(record.version()),
        }])
        .await?;
        log::debug!(
            "cairn element updated guid={} version={}",
            input.guid,
            record.version() + 1
        );
        Ok(())
    }

    async fn archive_element(&self, input: RemoveElementInput) -> GraphResult<()> {
        self.remove_element(input, Removal::Archive).await
    }

    async fn delete_element(&self, input: RemoveElementInput) -> GraphResult<()> {
        self.remove_element(input, Removal::Delete).await
    }

    async fn reclassify(&self, input: ClassifyInput) -> GraphResult<()> {
        let def = self.classification_type(&input.classification_name)?;
        input.effectivity.validate()?;
        let record = self.require_live_element(input.guid).await?;
        let current = record.latest();
        if !def.valid_end_types.is_empty()
            && !def
                .valid_end_types
                .iter()
                .any(|allowed| self.registry.is_subtype_of(&current.type_name, allowed))
        {
            return Err(GraphError::invalid(format!(
                "classification {} does not apply to {}",
                def.name, current.type_name
            )));
        }
        self.check_properties(&def.name, &input.properties)?;

        let now = Timestamp::now();
        let header = match current.classifications.get(&def.name) {
            Some(existing) => existing.header.touched(&input.actor, now),
            None => AuditHeader::new(&input.actor, now),
        };
        let mut next = current.clone();
        next.classifications.insert(
            def.name.clone(),
            Classification {
                name: def.name.clone(),
                properties: input.properties,
                effectivity: input.effectivity,
                header,
            },
        );
        next.header = current.header.touched(&input.actor, now);
        self.commit(vec![Mutation::PutElement {
            record: record.with_version(next),
            expect: Expectation::Version(record.version()),
        }])
        .await?;
        log::debug!("cairn element classified guid={} as {}", input.guid, def.name);
        Ok(())
    }

    async fn declassify(&self, input: DeclassifyInput) -> GraphResult<()> {
        let record = self.require_live_element(input.guid).await?;
        let current = record.latest();
        if !current.is_classified(&input.classification_name) {
            return Err(GraphError::not_found(format!(
                "classification {} on element {}",
                input.classification_name, input.guid
            )));
        }
        let mut next = current.clone();
        next.classifications.remove(&input.classification_name);
        next.header = current.header.touched(&input.actor, Timestamp::now());
        self.commit(vec![Mutation::PutElement {
            record: record.with_version(next),
            expect: Expectation::Version(record.version()),
        }])
        .await
    }
}
