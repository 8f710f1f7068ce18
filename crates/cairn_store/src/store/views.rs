//! Derived views assembled from walks: where an element sits, what it is
//! made of, and what implements it.

use std::collections::HashSet;

use super::GraphStore;
use cairn_core::{
    ComponentNode, Direction, ElementApi, ElementSummary, ElementView, GraphResult, Guid,
    QueryOptions, RelatedElement, ViewOptions, WalkInput,
};

const DEFAULT_COMPOSITION_TYPE: &str = "SolutionCompositionLink";
const DEFAULT_IMPLEMENTATION_TYPE: &str = "ImplementedBy";

/// The caller's relationship types, or `fallback` when none were named. An
/// empty list never means "every type".
fn types_or(relationship_types: &[String], fallback: &str) -> Vec<String> {
    if relationship_types.is_empty() {
        vec![fallback.to_string()]
    } else {
        relationship_types.to_vec()
    }
}

fn assemble(parent: Guid, reached: &[RelatedElement]) -> Vec<ComponentNode> {
    reached
        .iter()
        .filter(|related| related.reached_from == parent)
        .map(|related| ComponentNode {
            summary: related.element.summary(),
            relationship_type: related.relationship.type_name.clone(),
            children: assemble(related.element.guid, reached),
        })
        .collect()
}

impl GraphStore {
    /// Ancestors of `guid`, outermost first. At each step the first parent
    /// in guid order is taken; the climb ends at an element with no parent
    /// or at one already on the chain, however deep that is.
    pub(super) async fn build_parent_context(
        &self,
        guid: Guid,
        relationship_types: &[String],
        options: QueryOptions,
    ) -> GraphResult<Vec<ElementSummary>> {
        let type_names = types_or(relationship_types, DEFAULT_COMPOSITION_TYPE);
        let mut chain = Vec::new();
        let mut visited = HashSet::from([guid]);
        let mut current = guid;
        loop {
            let parents = self
                .breadth_first(&WalkInput {
                    start_guid: current,
                    direction: Direction::Incoming,
                    type_names: Some(type_names.clone()),
                    max_depth: 1,
                    options,
                })
                .await?;
            let Some(parent) = parents.into_iter().next() else {
                break;
            };
            if !visited.insert(parent.element.guid) {
                break;
            }
            current = parent.element.guid;
            chain.push(parent.element.summary());
        }
        chain.reverse();
        Ok(chain)
    }

    pub(super) async fn build_subcomponent_tree(
        &self,
        guid: Guid,
        relationship_types: &[String],
        max_depth: u32,
        options: QueryOptions,
    ) -> GraphResult<Vec<ComponentNode>> {
        let reached = self
            .breadth_first(&WalkInput {
                start_guid: guid,
                direction: Direction::Outgoing,
                type_names: Some(types_or(relationship_types, DEFAULT_COMPOSITION_TYPE)),
                max_depth,
                options,
            })
            .await?;
        Ok(assemble(guid, &reached))
    }

    pub(super) async fn build_implementation_summary(
        &self,
        guid: Guid,
        relationship_types: &[String],
        options: QueryOptions,
    ) -> GraphResult<Vec<ElementSummary>> {
        let reached = self
            .breadth_first(&WalkInput {
                start_guid: guid,
                direction: Direction::Outgoing,
                type_names: Some(types_or(relationship_types, DEFAULT_IMPLEMENTATION_TYPE)),
                max_depth: 1,
                options,
            })
            .await?;
        Ok(reached
            .into_iter()
            .map(|related| related.element.summary())
            .collect())
    }

    pub(super) async fn build_element_view(
        &self,
        guid: Guid,
        view: ViewOptions,
    ) -> GraphResult<Option<ElementView>> {
        let Some(element) = self.get_element(guid, view.options).await? else {
            return Ok(None);
        };
        let parent_context = self.record_degraded(
            "parent_context",
            guid,
            self.build_parent_context(guid, &view.context_relationship_types, view.options)
                .await,
        );
        let subcomponents = self.record_degraded(
            "subcomponents",
            guid,
            self.build_subcomponent_tree(
                guid,
                &view.component_relationship_types,
                view.max_depth,
                view.options,
            )
            .await,
        );
        let implementations = self.record_degraded(
            "implementations",
            guid,
            self.build_implementation_summary(
                guid,
                &view.implementation_relationship_types,
                view.options,
            )
            .await,
        );
        Ok(Some(ElementView {
            element,
            parent_context,
            subcomponents,
            implementations,
        }))
    }
}
