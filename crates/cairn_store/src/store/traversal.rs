use std::collections::HashSet;

use async_trait::async_trait;

use super::{GraphStore, element_visible, read_time, relationship_visible};
use cairn_core::{
    ComponentNode, ElementSummary, ElementView, GraphResult, Guid, MetadataElement, QueryOptions,
    RelatedElement, Relationship, StatusFilter, TraversalApi, ViewOptions, WalkInput,
};

impl GraphStore {
    async fn visible_element(
        &self,
        guid: Guid,
        options: &QueryOptions,
    ) -> GraphResult<Option<MetadataElement>> {
        let at = read_time(options);
        Ok(self
            .fetch_element(guid)
            .await?
            .and_then(|record| element_visible(&record, options, &StatusFilter::any(), at)))
    }

    /// Breadth-first walk from `input.start_guid`. Each element is reported
    /// once, at the hop it was first reached; links at one element are
    /// followed in guid order so the output is stable.
    pub(super) async fn breadth_first(&self, input: &WalkInput) -> GraphResult<Vec<RelatedElement>> {
        let max_depth = input.max_depth.max(1).min(self.limits.max_traversal_depth);
        let type_filter = match &input.type_names {
            Some(names) if !names.is_empty() => Some(self.expand_relationship_types(names)?),
            _ => None,
        };
        if self
            .visible_element(input.start_guid, &input.options)
            .await?
            .is_none()
        {
            return Ok(Vec::new());
        }

        let at = read_time(&input.options);
        let filter = StatusFilter::any();
        let mut visited = HashSet::from([input.start_guid]);
        let mut frontier = vec![input.start_guid];
        let mut found = Vec::new();

        for depth in 1..=max_depth {
            let mut next = Vec::new();
            for current in frontier {
                let mut links: Vec<Relationship> = self
                    .relationships_of(current)
                    .await?
                    .iter()
                    .filter_map(|record| relationship_visible(record, &input.options, &filter, at))
                    .filter(|link| input.direction.admits(link, current))
                    .filter(|link| {
                        type_filter
                            .as_ref()
                            .is_none_or(|types| types.contains(&link.type_name))
                    })
                    .collect();
                links.sort_by_key(|link| link.guid);

                for relationship in links {
                    let Some(other) = relationship.other_end(current) else {
                        continue;
                    };
                    if !visited.insert(other) {
                        continue;
                    }
                    let Some(element) = self.visible_element(other, &input.options).await? else {
                        continue;
                    };
                    next.push(other);
                    found.push(RelatedElement {
                        element,
                        relationship,
                        reached_from: current,
                        depth,
                    });
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        log::debug!(
            "cairn walk start={} depth={max_depth} reached={}",
            input.start_guid,
            found.len()
        );
        Ok(found)
    }
}

#[async_trait]
impl TraversalApi for GraphStore {
    async fn walk(&self, input: WalkInput) -> GraphResult<Vec<RelatedElement>> {
        self.breadth_first(&input).await
    }

    async fn parent_context(
        &self,
        guid: Guid,
        relationship_types: &[String],
        options: QueryOptions,
    ) -> GraphResult<Vec<ElementSummary>> {
        self.build_parent_context(guid, relationship_types, options)
            .await
    }

    async fn subcomponent_tree(
        &self,
        guid: Guid,
        relationship_types: &[String],
        max_depth: u32,
        options: QueryOptions,
    ) -> GraphResult<Vec<ComponentNode>> {
        self.build_subcomponent_tree(guid, relationship_types, max_depth, options)
            .await
    }

    async fn implementation_summary(
        &self,
        guid: Guid,
        relationship_types: &[String],
        options: QueryOptions,
    ) -> GraphResult<Vec<ElementSummary>> {
        self.build_implementation_summary(guid, relationship_types, options)
            .await
    }

    async fn element_view(
        &self,
        guid: Guid,
        view: ViewOptions,
    ) -> GraphResult<Option<ElementView>> {
        self.build_element_view(guid, view).await
    }
}
