use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use super::GraphStore;
use cairn_core::{
    AuditHeader, ElementRecord, Expectation, GraphError, GraphResult, Guid, MetadataElement,
    Mutation, PropertyBag, Relationship, RelationshipRecord, TemplateApi, TemplateInput,
    Timestamp,
};

const SOURCED_FROM: &str = "SourcedFrom";
const SOURCE_VERSION: &str = "sourceVersionNumber";

/// Replace `{{name}}` tokens left to right in one pass. Replacement text is
/// never rescanned; unmapped or unterminated tokens are kept as written.
pub fn substitute_placeholders(text: &str, placeholders: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        if name.contains("{{") {
            // `{{a{{b}}`: only the innermost opener starts a token.
            out.push_str("{{");
            rest = after;
            continue;
        }
        match placeholders.get(name) {
            Some(value) => out.push_str(value),
            None => {
                out.push_str("{{");
                out.push_str(name);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

impl GraphStore {
    /// External links worth re-pointing at a clone. Ownership links stay
    /// with the original owner and provenance links with the template.
    fn copies_external_link(&self, relationship: &Relationship) -> bool {
        relationship.type_name != SOURCED_FROM && !self.is_ownership(&relationship.type_name)
    }

    fn sourced_from_link(
        &self,
        clone: &MetadataElement,
        template: &ElementRecord,
        actor: &str,
        now: Timestamp,
    ) -> Option<Relationship> {
        let def = self.registry.resolve_type(SOURCED_FROM)?;
        let mut properties = PropertyBag::new();
        if self
            .registry
            .effective_attributes(&def.name)
            .iter()
            .any(|attribute| attribute.name == SOURCE_VERSION)
        {
            properties.insert(SOURCE_VERSION, template.version() as i64);
        }
        let source = template.latest();
        Some(Relationship {
            guid: Guid::new(),
            type_name: def.name,
            end1_guid: clone.guid,
            end1_type_name: clone.type_name.clone(),
            end2_guid: source.guid,
            end2_type_name: source.type_name.clone(),
            status: cairn_core::InstanceStatus::Active,
            properties,
            effectivity: cairn_core::EffectivityWindow::always(),
            header: AuditHeader::new(actor, now),
        })
    }
}

#[async_trait]
impl TemplateApi for GraphStore {
    async fn instantiate_from_template(&self, input: TemplateInput) -> GraphResult<Guid> {
        let template = self.require_live_element(input.template_guid).await?;
        let subtree = self.collect_subtree(template.guid).await?;
        if subtree.members.len() > self.limits.max_cascade_members {
            return Err(GraphError::invalid(format!(
                "template {} has more than {} members",
                template.guid, self.limits.max_cascade_members
            )));
        }

        let members: Vec<&MetadataElement> =
            subtree.live_members().map(|(record, _)| record.latest()).collect();
        let clones: HashMap<Guid, Guid> = members
            .iter()
            .map(|member| (member.guid, Guid::new()))
            .collect();
        let root_guid = clones
            .get(&template.guid)
            .copied()
            .ok_or_else(|| GraphError::not_found(format!("element {}", template.guid)))?;
        let source = template.latest();

        let parent = match &input.parent_link {
            Some(link) => Some(self.resolve_parent(link).await?),
            None => None,
        };
        let anchor = self
            .resolve_anchor(
                root_guid,
                &source.type_name,
                input.anchor_guid,
                input.is_own_anchor,
                input.anchor_scope_guid,
                parent.as_ref().zip(input.parent_link.as_ref()),
            )
            .await?;

        let rewrite = |text: &str| substitute_placeholders(text, &input.placeholders);
        let now = Timestamp::now();
        let mut batch = Vec::new();
        let mut root_clone = None;

        for member in &members {
            let Some(guid) = clones.get(&member.guid).copied() else {
                continue;
            };
            let mut properties = member.properties.map_strings(&rewrite);
            if guid == root_guid {
                properties.merge(&input.replacement_properties);
                self.check_properties(&member.type_name, &properties)?;
            }
            let mut classifications = member.classifications.clone();
            for classification in classifications.values_mut() {
                classification.header = AuditHeader::new(&input.actor, now);
            }
            let clone = MetadataElement {
                guid,
                type_name: member.type_name.clone(),
                status: member.status,
                effectivity: member.effectivity,
                anchor_guid: Some(anchor.anchor_guid),
                anchor_type_name: Some(anchor.anchor_type_name.clone()),
                anchor_scope_guid: anchor.scope,
                classifications,
                properties,
                header: AuditHeader::new(&input.actor, now),
            };
            if guid == root_guid {
                root_clone = Some(clone.clone());
            }
            batch.push(Mutation::PutElement {
                record: ElementRecord::new(clone),
                expect: Expectation::Absent,
            });
        }

        for record in subtree.live_relationships() {
            let original = record.latest();
            let end1 = clones.get(&original.end1_guid).copied();
            let end2 = clones.get(&original.end2_guid).copied();
            let (end1_guid, end2_guid) = match (end1, end2) {
                (Some(end1), Some(end2)) => (end1, end2),
                (Some(end1), None)
                    if input.copy_external_links && self.copies_external_link(original) =>
                {
                    (end1, original.end2_guid)
                }
                (None, Some(end2))
                    if input.copy_external_links && self.copies_external_link(original) =>
                {
                    (original.end1_guid, end2)
                }
                _ => continue,
            };
            batch.push(Mutation::PutRelationship {
                record: RelationshipRecord::new(Relationship {
                    guid: Guid::new(),
                    type_name: original.type_name.clone(),
                    end1_guid,
                    end1_type_name: original.end1_type_name.clone(),
                    end2_guid,
                    end2_type_name: original.end2_type_name.clone(),
                    status: original.status,
                    properties: original.properties.map_strings(&rewrite),
                    effectivity: original.effectivity,
                    header: AuditHeader::new(&input.actor, now),
                }),
                expect: Expectation::Absent,
            });
        }

        let root_clone = root_clone
            .ok_or_else(|| GraphError::not_found(format!("element {}", template.guid)))?;
        if let Some(link) = self.sourced_from_link(&root_clone, &template, &input.actor, now) {
            batch.push(Mutation::PutRelationship {
                record: RelationshipRecord::new(link),
                expect: Expectation::Absent,
            });
        }
        if let (Some(parent), Some(link)) = (&parent, &input.parent_link) {
            let relationship = self.parent_relationship(
                parent,
                link,
                root_guid,
                &root_clone.type_name,
                &input.actor,
                now,
            )?;
            batch.push(Mutation::PutRelationship {
                record: RelationshipRecord::new(relationship),
                expect: Expectation::Absent,
            });
        }

        let size = batch.len();
        self.commit(batch).await?;
        log::debug!(
            "cairn template {} instantiated as {root_guid} members={} mutations={size}",
            template.guid,
            members.len()
        );
        Ok(root_guid)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::substitute_placeholders;
    use crate::GraphStore;
    use cairn_core::{
        CreateElementInput, Direction, ElementApi, FindRelationshipsInput, PageRequest,
        PropertyBag, PropertyValue, QueryOptions, RelationshipApi, StatusFilter, TemplateApi,
        TemplateInput,
    };

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitution_is_single_pass() {
        let placeholders = map(&[("X", "{{Y}}"), ("Y", "never")]);
        assert_eq!(substitute_placeholders("{{X}}-{{Y}}", &placeholders), "{{Y}}-never");
    }

    #[test]
    fn unmapped_and_unterminated_tokens_stay_literal() {
        let placeholders = map(&[("X", "orders")]);
        assert_eq!(
            substitute_placeholders("{{X}}_{{Z}}_{{X", &placeholders),
            "orders_{{Z}}_{{X"
        );
        assert_eq!(substitute_placeholders("{{a{{X}}", &placeholders), "{{aorders");
        assert_eq!(substitute_placeholders("no tokens", &placeholders), "no tokens");
    }

    #[tokio::test]
    async fn clone_substitutes_and_links_back_to_template() {
        let store = GraphStore::in_memory().expect("store");
        let template = store
            .create_element(CreateElementInput::root(
                "tester",
                "SolutionComponent",
                PropertyBag::new()
                    .with("qualifiedName", "template::{{X}}")
                    .with("name", "{{X}}_raw")
                    .with("description", "{{Y}}"),
            ))
            .await
            .expect("template");
        store
            .create_element(CreateElementInput::child(
                "tester",
                "SolutionComponent",
                PropertyBag::new().with("qualifiedName", "template::{{X}}::part"),
                template,
                "SolutionCompositionLink",
            ))
            .await
            .expect("part");

        let mut input = TemplateInput::new("tester", template);
        input.placeholders = map(&[("X", "orders")]);
        input.replacement_properties = PropertyBag::new().with("qualifiedName", "orders");
        let clone = store.instantiate_from_template(input).await.expect("clone");

        let element = store
            .get_element(clone, QueryOptions::now())
            .await
            .expect("read")
            .expect("visible");
        assert_eq!(element.properties.get_str("name"), Some("orders_raw"));
        assert_eq!(element.properties.get_str("description"), Some("{{Y}}"));
        assert_eq!(element.properties.get_str("qualifiedName"), Some("orders"));
        assert!(element.is_own_anchor());

        let links = store
            .find_relationships(FindRelationshipsInput {
                guid: clone,
                direction: Direction::Outgoing,
                type_name: None,
                status_filter: StatusFilter::any(),
                options: QueryOptions::now(),
                page: PageRequest::first(10),
            })
            .await
            .expect("links");
        assert_eq!(links.relationships.len(), 2);
        let sourced = links
            .relationships
            .iter()
            .find(|link| link.type_name == "SourcedFrom")
            .expect("provenance link");
        assert_eq!(sourced.end2_guid, template);
        assert_eq!(
            sourced.properties.get("sourceVersionNumber"),
            Some(&PropertyValue::Int(1))
        );
        let part = links
            .relationships
            .iter()
            .find(|link| link.type_name == "SolutionCompositionLink")
            .expect("composition");
        let part = store
            .get_element(part.end2_guid, QueryOptions::now())
            .await
            .expect("read")
            .expect("part visible");
        assert_eq!(part.properties.get_str("qualifiedName"), Some("template::orders::part"));
        assert_eq!(part.anchor_guid, Some(clone));
    }
}
