use std::collections::{BTreeMap, HashSet, VecDeque};

use async_trait::async_trait;

use super::{GraphStore, element_visible, read_time};
use cairn_core::{
    AnchorApi, ElementRecord, ElementScan, Expectation, GraphError, GraphResult, Guid,
    InstanceStatus, MetadataElement, Mutation, ParentLink, QueryOptions, ReanchorInput,
    Relationship, RelationshipRecord, RemoveElementInput, StatusFilter, Timestamp, TypeDef,
};

/// Where a new element hangs: its anchor root and the search scope it
/// inherits from that root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct AnchorAssignment {
    pub anchor_guid: Guid,
    pub anchor_type_name: String,
    pub scope: Option<Guid>,
}

/// A live parent named by a [`ParentLink`], with the link's type resolved.
pub(super) struct ResolvedParent {
    pub element: MetadataElement,
    pub link_type: TypeDef,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Removal {
    /// Append a `Deleted` version that closes the effectivity window.
    Archive,
    /// Remove the records and their history.
    Delete,
}

/// Everything a cascade starting at one element would touch.
#[derive(Default)]
pub(super) struct Subtree {
    /// Members with their hop distance from the root, root first.
    pub members: Vec<(ElementRecord, u32)>,
    pub relationships: BTreeMap<Guid, RelationshipRecord>,
}

impl Subtree {
    pub(crate) fn live_members(&self) -> impl Iterator<Item = &(ElementRecord, u32)> {
        self.members
            .iter()
            .filter(|(record, _)| !record.latest().status.is_deleted())
    }

    pub(crate) fn live_relationships(&self) -> impl Iterator<Item = &RelationshipRecord> {
        self.relationships
            .values()
            .filter(|record| !record.latest().status.is_deleted())
    }
}

/// The owning root of `anchor`: the element it is anchored to, or itself.
fn anchor_root(anchor: &MetadataElement) -> (Guid, String) {
    match anchor.anchor_guid {
        Some(root) if root != anchor.guid => (
            root,
            anchor
                .anchor_type_name
                .clone()
                .unwrap_or_else(|| anchor.type_name.clone()),
        ),
        _ => (anchor.guid, anchor.type_name.clone()),
    }
}

/// Whether `element` lives under the anchor of a cascade or clone rooted at
/// `root`, rather than under an anchor of its own.
fn shares_anchor(element: &MetadataElement, root: Guid, root_anchor: Guid) -> bool {
    !element.is_own_anchor()
        && matches!(element.anchor_guid, Some(anchor) if anchor == root_anchor || anchor == root)
}

pub(super) fn archived_element(
    record: &ElementRecord,
    actor: &str,
    now: Timestamp,
) -> ElementRecord {
    let current = record.latest();
    let mut next = current.clone();
    next.status = InstanceStatus::Deleted;
    next.effectivity = current.effectivity.closed_at(now);
    next.header = current.header.touched(actor, now);
    record.with_version(next)
}

pub(super) fn archived_relationship(
    record: &RelationshipRecord,
    actor: &str,
    now: Timestamp,
) -> RelationshipRecord {
    let current = record.latest();
    let mut next = current.clone();
    next.status = InstanceStatus::Deleted;
    next.effectivity = current.effectivity.closed_at(now);
    next.header = current.header.touched(actor, now);
    record.with_version(next)
}

impl GraphStore {
    pub(super) async fn resolve_parent(&self, link: &ParentLink) -> GraphResult<ResolvedParent> {
        let link_type = self.relationship_type(&link.relationship_type)?;
        let element = self
            .fetch_element(link.parent_guid)
            .await?
            .filter(|record| !record.latest().status.is_deleted())
            .map(|record| record.latest().clone())
            .ok_or_else(|| {
                GraphError::invalid(format!("parent element {} does not exist", link.parent_guid))
            })?;
        Ok(ResolvedParent { element, link_type })
    }

    /// Anchor for a new element `guid`: an explicit anchor's root, else an
    /// owning parent's root, else the element itself when it may be its own
    /// anchor.
    pub(super) async fn resolve_anchor(
        &self,
        guid: Guid,
        type_name: &str,
        anchor_guid: Option<Guid>,
        is_own_anchor: bool,
        explicit_scope: Option<Guid>,
        parent: Option<(&ResolvedParent, &ParentLink)>,
    ) -> GraphResult<AnchorAssignment> {
        if let Some(anchor_guid) = anchor_guid {
            let anchor = self
                .fetch_element(anchor_guid)
                .await?
                .filter(|record| !record.latest().status.is_deleted())
                .ok_or_else(|| {
                    GraphError::invalid(format!(
                        "anchor {anchor_guid} does not resolve to a live element"
                    ))
                })?;
            let anchor = anchor.latest();
            let (root, root_type) = anchor_root(anchor);
            return Ok(AnchorAssignment {
                anchor_guid: root,
                anchor_type_name: root_type,
                scope: explicit_scope.or(anchor.anchor_scope_guid),
            });
        }
        if let Some((parent, link)) = parent {
            if parent.link_type.ownership && link.parent_at_end1 {
                let (root, root_type) = anchor_root(&parent.element);
                return Ok(AnchorAssignment {
                    anchor_guid: root,
                    anchor_type_name: root_type,
                    scope: explicit_scope.or(parent.element.anchor_scope_guid),
                });
            }
        }
        if is_own_anchor {
            return Ok(AnchorAssignment {
                anchor_guid: guid,
                anchor_type_name: type_name.to_string(),
                scope: explicit_scope,
            });
        }
        Err(GraphError::invalid(
            "element needs an anchor, an owning parent, or is_own_anchor",
        ))
    }

    /// Relationship record for a parent link between `parent` and the child.
    pub(super) fn parent_relationship(
        &self,
        parent: &ResolvedParent,
        link: &ParentLink,
        child_guid: Guid,
        child_type: &str,
        actor: &str,
        now: Timestamp,
    ) -> GraphResult<Relationship> {
        let (end1_guid, end1_type, end2_guid, end2_type) = if link.parent_at_end1 {
            (parent.element.guid, parent.element.type_name.as_str(), child_guid, child_type)
        } else {
            (child_guid, child_type, parent.element.guid, parent.element.type_name.as_str())
        };
        self.check_end_types(&parent.link_type, end1_type, end2_type)?;
        self.check_properties(&parent.link_type.name, &link.properties)?;
        Ok(Relationship {
            guid: Guid::new(),
            type_name: parent.link_type.name.clone(),
            end1_guid,
            end1_type_name: end1_type.to_string(),
            end2_guid,
            end2_type_name: end2_type.to_string(),
            status: InstanceStatus::Active,
            properties: link.properties.clone(),
            effectivity: cairn_core::EffectivityWindow::always(),
            header: cairn_core::AuditHeader::new(actor, now),
        })
    }

    /// Breadth-first collection of everything anchored to, or owned by, the
    /// element at `root`, plus every relationship touching any of them. Owned
    /// elements join only when they share the root's anchor; an element with
    /// its own anchor keeps its lifetime and only loses the link. The root
    /// itself may already be gone; late arrivals still anchored to it are
    /// found.
    pub(super) async fn collect_subtree(&self, root: Guid) -> GraphResult<Subtree> {
        let mut subtree = Subtree::default();
        let mut visited = HashSet::from([root]);
        let mut queue = VecDeque::from([(root, 0_u32)]);
        let ceiling = self.limits.max_cascade_members.saturating_add(1);
        let root_anchor = match self.fetch_element(root).await? {
            Some(record) => anchor_root(record.latest()).0,
            None => root,
        };

        while let Some((guid, depth)) = queue.pop_front() {
            match self.fetch_element(guid).await? {
                Some(record)
                    if guid == root || shares_anchor(record.latest(), root, root_anchor) =>
                {
                    subtree.members.push((record, depth));
                }
                Some(_) => continue,
                None => {}
            }
            if subtree.members.len() > ceiling {
                break;
            }
            for anchored in self.scan(&ElementScan::anchored_by(guid)).await? {
                if visited.insert(anchored.guid) {
                    queue.push_back((anchored.guid, depth + 1));
                }
            }
            for relationship in self.relationships_of(guid).await? {
                // Archived ownership links no longer own; a reanchored child
                // keeps its old link in history only.
                let owned_child = relationship.end1_guid() == guid
                    && !relationship.latest().status.is_deleted()
                    && self.is_ownership(relationship.type_name());
                if owned_child && visited.insert(relationship.end2_guid()) {
                    queue.push_back((relationship.end2_guid(), depth + 1));
                }
                subtree
                    .relationships
                    .entry(relationship.guid)
                    .or_insert(relationship);
            }
        }
        Ok(subtree)
    }

    /// Deepest-first batch: relationships, then members by falling depth,
    /// the root last.
    fn removal_batch(
        &self,
        subtree: &Subtree,
        removal: Removal,
        actor: &str,
        now: Timestamp,
    ) -> Vec<Mutation> {
        let mut batch = Vec::new();
        let mut members: Vec<&(ElementRecord, u32)> = match removal {
            Removal::Archive => subtree.live_members().collect(),
            Removal::Delete => subtree.members.iter().collect(),
        };
        members.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.guid.cmp(&b.0.guid)));

        match removal {
            Removal::Archive => {
                for record in subtree.live_relationships() {
                    batch.push(Mutation::PutRelationship {
                        record: archived_relationship(record, actor, now),
                        expect: Expectation::Version(record.version()),
                    });
                }
                for (record, _) in members {
                    batch.push(Mutation::PutElement {
                        record: archived_element(record, actor, now),
                        expect: Expectation::Version(record.version()),
                    });
                }
            }
            Removal::Delete => {
                for guid in subtree.relationships.keys() {
                    batch.push(Mutation::RemoveRelationship {
                        guid: *guid,
                        expect: Expectation::Any,
                    });
                }
                for (record, _) in members {
                    batch.push(Mutation::RemoveElement {
                        guid: record.guid,
                        expect: Expectation::Any,
                    });
                }
            }
        }
        batch
    }

    /// Archive or delete an element. Without `cascaded` any live dependent
    /// or relationship blocks the call; with it the whole subtree goes in one
    /// batch, re-collected until no late arrivals remain.
    pub(super) async fn remove_element(
        &self,
        input: RemoveElementInput,
        removal: Removal,
    ) -> GraphResult<()> {
        let root = match removal {
            Removal::Archive => self.require_live_element(input.guid).await?,
            Removal::Delete => self
                .fetch_element(input.guid)
                .await?
                .ok_or_else(|| GraphError::not_found(format!("element {}", input.guid)))?,
        };

        if !input.cascaded {
            let subtree = self.collect_subtree(root.guid).await?;
            let dependents = subtree
                .live_members()
                .filter(|(record, _)| record.guid != root.guid)
                .count();
            let links = subtree.live_relationships().count();
            if dependents > 0 || links > 0 {
                return Err(GraphError::conflict(format!(
                    "element {} has {dependents} live dependents and {links} live relationships",
                    root.guid
                )));
            }
            let batch = self.removal_batch(&subtree, removal, &input.actor, Timestamp::now());
            self.commit(batch).await?;
            log::debug!("cairn element {:?} guid={}", removal, root.guid);
            return Ok(());
        }

        for round in 1..=self.limits.max_cascade_rounds {
            let subtree = self.collect_subtree(root.guid).await?;
            if subtree.members.len() > self.limits.max_cascade_members {
                return Err(GraphError::invalid(format!(
                    "cascade from {} exceeds {} members",
                    root.guid, self.limits.max_cascade_members
                )));
            }
            let now = Timestamp::now();
            let batch = self.removal_batch(&subtree, removal, &input.actor, now);
            if batch.is_empty() {
                return Ok(());
            }
            let size = batch.len();
            match self.commit(batch).await {
                Ok(()) => {
                    log::debug!(
                        "cairn cascade {:?} root={} round={round} mutations={size}",
                        removal,
                        root.guid
                    );
                }
                Err(GraphError::Conflict { message }) => {
                    log::debug!("cairn cascade round {round} raced a writer: {message}");
                    continue;
                }
                Err(err) => return Err(err),
            }
            let remaining = self.collect_subtree(root.guid).await?;
            if self.removal_batch(&remaining, removal, &input.actor, now).is_empty() {
                return Ok(());
            }
        }
        Err(GraphError::conflict(format!(
            "cascade from {} did not settle after {} rounds",
            root.guid, self.limits.max_cascade_rounds
        )))
    }

    /// Guids owned by `guid`, transitively, through ownership relationships.
    async fn ownership_descendants(&self, guid: Guid) -> GraphResult<Vec<Guid>> {
        let mut visited = HashSet::from([guid]);
        let mut queue = VecDeque::from([guid]);
        let mut descendants = Vec::new();
        while let Some(current) = queue.pop_front() {
            for relationship in self.relationships_of(current).await? {
                let latest = relationship.latest();
                if latest.status.is_deleted()
                    || latest.end1_guid != current
                    || !self.is_ownership(&latest.type_name)
                {
                    continue;
                }
                if visited.insert(latest.end2_guid) {
                    descendants.push(latest.end2_guid);
                    queue.push_back(latest.end2_guid);
                }
            }
        }
        Ok(descendants)
    }
}

#[async_trait]
impl AnchorApi for GraphStore {
    async fn reanchor(&self, input: ReanchorInput) -> GraphResult<Guid> {
        let record = self.require_live_element(input.guid).await?;
        let element = record.latest().clone();
        let parent = self.resolve_parent(&input.new_parent).await?;
        if !(parent.link_type.ownership && input.new_parent.parent_at_end1) {
            return Err(GraphError::invalid(
                "reanchor needs an ownership relationship with the parent at end1",
            ));
        }
        if parent.element.guid == element.guid {
            return Err(GraphError::invalid("an element cannot own itself"));
        }

        let reachable = self.ownership_descendants(element.guid).await?;
        let (old_root, _) = anchor_root(&element);
        let mut moved = Vec::new();
        for guid in &reachable {
            let Some(descendant) = self.fetch_element(*guid).await? else {
                continue;
            };
            if shares_anchor(descendant.latest(), element.guid, old_root) {
                moved.push(*guid);
            }
        }
        if element.is_own_anchor() {
            for anchored in self.scan(&ElementScan::anchored_by(element.guid)).await? {
                if anchored.guid != element.guid && !moved.contains(&anchored.guid) {
                    moved.push(anchored.guid);
                }
            }
        }
        if reachable.contains(&parent.element.guid) || moved.contains(&parent.element.guid) {
            return Err(GraphError::invalid(format!(
                "cannot reparent {} under its own descendant {}",
                element.guid, parent.element.guid
            )));
        }
        let (root, root_type) = anchor_root(&parent.element);
        if root == element.guid || moved.contains(&root) {
            return Err(GraphError::invalid(format!(
                "cannot reparent {} under an element it anchors",
                element.guid
            )));
        }

        let now = Timestamp::now();
        let mut batch = Vec::new();
        for relationship in self.relationships_of(element.guid).await? {
            let latest = relationship.latest();
            if !latest.status.is_deleted()
                && latest.end2_guid == element.guid
                && self.is_ownership(&latest.type_name)
            {
                batch.push(Mutation::PutRelationship {
                    record: archived_relationship(&relationship, &input.actor, now),
                    expect: Expectation::Version(relationship.version()),
                });
            }
        }
        let link = self.parent_relationship(
            &parent,
            &input.new_parent,
            element.guid,
            &element.type_name,
            &input.actor,
            now,
        )?;
        batch.push(Mutation::PutRelationship {
            record: RelationshipRecord::new(link),
            expect: Expectation::Absent,
        });

        let mut targets = vec![record];
        for guid in &moved {
            if let Some(record) = self.fetch_element(*guid).await? {
                targets.push(record);
            }
        }
        for target in targets {
            let current = target.latest();
            let mut next = current.clone();
            next.anchor_guid = Some(root);
            next.anchor_type_name = Some(root_type.clone());
            next.header = current.header.touched(&input.actor, now);
            batch.push(Mutation::PutElement {
                record: target.with_version(next),
                expect: Expectation::Version(target.version()),
            });
        }
        self.commit(batch).await?;
        log::debug!(
            "cairn element reanchored guid={} root={root} moved={}",
            element.guid,
            moved.len()
        );
        Ok(root)
    }

    async fn anchored_elements(
        &self,
        anchor_guid: Guid,
        options: QueryOptions,
    ) -> GraphResult<Vec<MetadataElement>> {
        let at = read_time(&options);
        let filter = StatusFilter::any();
        Ok(self
            .scan(&ElementScan::anchored_by(anchor_guid))
            .await?
            .iter()
            .filter(|record| record.guid != anchor_guid)
            .filter_map(|record| element_visible(record, &options, &filter, at))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::anchor_root;
    use crate::GraphStore;
    use cairn_core::{
        AnchorApi, CreateElementInput, ElementApi, GraphError, ParentLink, PropertyBag,
        QueryOptions, ReanchorInput,
    };

    fn props(name: &str) -> PropertyBag {
        PropertyBag::new().with("qualifiedName", name)
    }

    #[tokio::test]
    async fn nested_owned_elements_point_at_top_root() {
        let store = GraphStore::in_memory().expect("store");
        let root = store
            .create_element(CreateElementInput::root("tester", "SolutionComponent", props("root")))
            .await
            .expect("root");
        let mid = store
            .create_element(CreateElementInput::child(
                "tester",
                "SolutionComponent",
                props("mid"),
                root,
                "SolutionCompositionLink",
            ))
            .await
            .expect("mid");
        let leaf = store
            .create_element(CreateElementInput::child(
                "tester",
                "SolutionComponent",
                props("leaf"),
                mid,
                "SolutionCompositionLink",
            ))
            .await
            .expect("leaf");
        let leaf = store
            .get_element(leaf, QueryOptions::now())
            .await
            .expect("read")
            .expect("leaf visible");
        assert_eq!(leaf.anchor_guid, Some(root));
        assert_eq!(leaf.anchor_type_name.as_deref(), Some("SolutionComponent"));
        let anchored = store
            .anchored_elements(root, QueryOptions::now())
            .await
            .expect("anchored");
        assert_eq!(anchored.len(), 2);
        let (top, _) = anchor_root(&leaf);
        assert_eq!(top, root);
    }

    #[tokio::test]
    async fn missing_anchor_without_own_anchor_flag_is_rejected() {
        let store = GraphStore::in_memory().expect("store");
        let mut input = CreateElementInput::root("tester", "Asset", props("orphan"));
        input.is_own_anchor = false;
        let err = store.create_element(input).await.unwrap_err();
        assert!(matches!(err, GraphError::InvalidParameter { .. }));
    }

    #[tokio::test]
    async fn reanchor_moves_descendants_and_rejects_cycles() {
        let store = GraphStore::in_memory().expect("store");
        let first = store
            .create_element(CreateElementInput::root("tester", "SolutionComponent", props("first")))
            .await
            .expect("first");
        let second = store
            .create_element(CreateElementInput::root("tester", "SolutionComponent", props("second")))
            .await
            .expect("second");
        let child = store
            .create_element(CreateElementInput::child(
                "tester",
                "SolutionComponent",
                props("child"),
                first,
                "SolutionCompositionLink",
            ))
            .await
            .expect("child");
        let grandchild = store
            .create_element(CreateElementInput::child(
                "tester",
                "SolutionComponent",
                props("grandchild"),
                child,
                "SolutionCompositionLink",
            ))
            .await
            .expect("grandchild");

        let root = store
            .reanchor(ReanchorInput {
                actor: "tester".to_string(),
                guid: child,
                new_parent: ParentLink::new(second, "SolutionCompositionLink"),
            })
            .await
            .expect("reanchor");
        assert_eq!(root, second);
        for guid in [child, grandchild] {
            let element = store
                .get_element(guid, QueryOptions::now())
                .await
                .expect("read")
                .expect("visible");
            assert_eq!(element.anchor_guid, Some(second));
        }

        let err = store
            .reanchor(ReanchorInput {
                actor: "tester".to_string(),
                guid: child,
                new_parent: ParentLink::new(grandchild, "SolutionCompositionLink"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidParameter { .. }));
    }
}
