use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

use crate::{
    EffectivityWindow, ElementSummary, GraphError, GraphResult, Guid, InstanceStatus,
    MetadataElement, PropertyBag, PropertyValue, Relationship, SearchCondition, StatusFilter,
    Timestamp,
};

/// Visibility controls shared by every read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Which version of the graph to observe; `None` reads the present.
    pub as_of_time: Option<Timestamp>,
    /// Include archived instances.
    pub for_lineage: bool,
    /// Return elements marked as known duplicates instead of hiding them.
    pub for_duplicate_processing: bool,
}

impl QueryOptions {
    pub fn now() -> Self {
        Self::default()
    }

    pub fn as_of(at: Timestamp) -> Self {
        Self {
            as_of_time: Some(at),
            ..Self::default()
        }
    }

    pub fn lineage() -> Self {
        Self {
            for_lineage: true,
            ..Self::default()
        }
    }
}

/// Link a new element to an existing parent in the same call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParentLink {
    pub parent_guid: Guid,
    pub relationship_type: String,
    pub parent_at_end1: bool,
    pub properties: PropertyBag,
}

impl ParentLink {
    pub fn new(parent_guid: Guid, relationship_type: impl Into<String>) -> Self {
        Self {
            parent_guid,
            relationship_type: relationship_type.into(),
            parent_at_end1: true,
            properties: PropertyBag::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateElementInput {
    pub actor: String,
    pub type_name: String,
    pub status: InstanceStatus,
    pub anchor_guid: Option<Guid>,
    pub is_own_anchor: bool,
    pub anchor_scope_guid: Option<Guid>,
    pub effectivity: EffectivityWindow,
    pub properties: PropertyBag,
    pub parent_link: Option<ParentLink>,
}

impl CreateElementInput {
    /// A self-anchored, always-effective, active element.
    pub fn root(actor: &str, type_name: &str, properties: PropertyBag) -> Self {
        Self {
            actor: actor.to_string(),
            type_name: type_name.to_string(),
            status: InstanceStatus::Active,
            anchor_guid: None,
            is_own_anchor: true,
            anchor_scope_guid: None,
            effectivity: EffectivityWindow::always(),
            properties,
            parent_link: None,
        }
    }

    /// An active element owned by `parent` through `relationship_type`.
    pub fn child(
        actor: &str,
        type_name: &str,
        properties: PropertyBag,
        parent: Guid,
        relationship_type: &str,
    ) -> Self {
        Self {
            is_own_anchor: false,
            parent_link: Some(ParentLink::new(parent, relationship_type)),
            ..Self::root(actor, type_name, properties)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateElementInput {
    pub actor: String,
    pub guid: Guid,
    /// Replace the whole property bag instead of merging the named entries.
    pub replace_all: bool,
    pub properties: PropertyBag,
    pub effectivity: Option<EffectivityWindow>,
    pub status: Option<InstanceStatus>,
}

/// Shared by archive (soft) and delete (hard).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveElementInput {
    pub actor: String,
    pub guid: Guid,
    pub cascaded: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassifyInput {
    pub actor: String,
    pub guid: Guid,
    pub classification_name: String,
    pub properties: PropertyBag,
    pub effectivity: EffectivityWindow,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclassifyInput {
    pub actor: String,
    pub guid: Guid,
    pub classification_name: String,
}

#[async_trait]
pub trait ElementApi {
    async fn create_element(&self, input: CreateElementInput) -> GraphResult<Guid>;
    async fn get_element(
        &self,
        guid: Guid,
        options: QueryOptions,
    ) -> GraphResult<Option<MetadataElement>>;
    async fn update_element(&self, input: UpdateElementInput) -> GraphResult<()>;
    async fn archive_element(&self, input: RemoveElementInput) -> GraphResult<()>;
    async fn delete_element(&self, input: RemoveElementInput) -> GraphResult<()>;
    async fn reclassify(&self, input: ClassifyInput) -> GraphResult<()>;
    async fn declassify(&self, input: DeclassifyInput) -> GraphResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// The element is end1.
    Outgoing,
    /// The element is end2.
    Incoming,
    Both,
}

impl Direction {
    pub fn admits(self, relationship: &Relationship, guid: Guid) -> bool {
        match self {
            Direction::Outgoing => relationship.end1_guid == guid,
            Direction::Incoming => relationship.end2_guid == guid,
            Direction::Both => relationship.touches(guid),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateRelationshipInput {
    pub actor: String,
    pub type_name: String,
    pub end1_guid: Guid,
    pub end2_guid: Guid,
    pub effectivity: EffectivityWindow,
    pub properties: PropertyBag,
    pub allow_duplicates: bool,
}

impl CreateRelationshipInput {
    pub fn new(actor: &str, type_name: &str, end1_guid: Guid, end2_guid: Guid) -> Self {
        Self {
            actor: actor.to_string(),
            type_name: type_name.to_string(),
            end1_guid,
            end2_guid,
            effectivity: EffectivityWindow::always(),
            properties: PropertyBag::new(),
            allow_duplicates: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateRelationshipInput {
    pub actor: String,
    pub guid: Guid,
    pub replace_all: bool,
    pub properties: PropertyBag,
    pub effectivity: Option<EffectivityWindow>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub limit: u32,
}

impl PageRequest {
    pub fn first(limit: u32) -> Self {
        Self {
            cursor: None,
            limit,
        }
    }

    pub fn after(cursor: String, limit: u32) -> Self {
        Self {
            cursor: Some(cursor),
            limit,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FindRelationshipsInput {
    pub guid: Guid,
    pub direction: Direction,
    pub type_name: Option<String>,
    pub status_filter: StatusFilter,
    pub options: QueryOptions,
    pub page: PageRequest,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipPage {
    pub relationships: Vec<Relationship>,
    pub next_cursor: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachInput {
    pub actor: String,
    pub type_name: String,
    pub end1_guid: Guid,
    pub end2_guid: Guid,
}

#[async_trait]
pub trait RelationshipApi {
    async fn create_relationship(&self, input: CreateRelationshipInput) -> GraphResult<Guid>;
    async fn get_relationship(
        &self,
        guid: Guid,
        options: QueryOptions,
    ) -> GraphResult<Option<Relationship>>;
    async fn update_relationship(&self, input: UpdateRelationshipInput) -> GraphResult<()>;
    async fn find_relationships(&self, input: FindRelationshipsInput)
    -> GraphResult<RelationshipPage>;
    async fn delete_relationship(&self, actor: &str, guid: Guid) -> GraphResult<()>;
    /// Remove every live relationship of the type between the two ends.
    async fn detach(&self, input: DetachInput) -> GraphResult<usize>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReanchorInput {
    pub actor: String,
    pub guid: Guid,
    pub new_parent: ParentLink,
}

#[async_trait]
pub trait AnchorApi {
    /// Move an element under a new owning parent; returns the new anchor.
    async fn reanchor(&self, input: ReanchorInput) -> GraphResult<Guid>;
    async fn anchored_elements(
        &self,
        anchor_guid: Guid,
        options: QueryOptions,
    ) -> GraphResult<Vec<MetadataElement>>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemplateInput {
    pub actor: String,
    pub template_guid: Guid,
    pub replacement_properties: PropertyBag,
    /// Token name (without braces) to replacement text.
    pub placeholders: BTreeMap<String, String>,
    pub anchor_guid: Option<Guid>,
    pub is_own_anchor: bool,
    pub anchor_scope_guid: Option<Guid>,
    pub parent_link: Option<ParentLink>,
    /// Re-create links from template members to elements outside the template.
    pub copy_external_links: bool,
}

impl TemplateInput {
    pub fn new(actor: &str, template_guid: Guid) -> Self {
        Self {
            actor: actor.to_string(),
            template_guid,
            replacement_properties: PropertyBag::new(),
            placeholders: BTreeMap::new(),
            anchor_guid: None,
            is_own_anchor: true,
            anchor_scope_guid: None,
            parent_link: None,
            copy_external_links: false,
        }
    }
}

#[async_trait]
pub trait TemplateApi {
    async fn instantiate_from_template(&self, input: TemplateInput) -> GraphResult<Guid>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sequencing {
    Guid,
    CreationDateRecent,
    CreationDateOldest,
    LastUpdateRecent,
    PropertyAscending(String),
    PropertyDescending(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FindByPropertyInput {
    /// Restrict to this type and its subtypes.
    pub type_name: Option<String>,
    /// `None` matches every element of the type.
    pub condition: Option<SearchCondition>,
    pub status_filter: StatusFilter,
    pub anchor_scope: Option<Guid>,
    pub options: QueryOptions,
    pub sequencing: Sequencing,
    pub page: PageRequest,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FindByTextInput {
    pub pattern: String,
    pub type_name: Option<String>,
    pub status_filter: StatusFilter,
    pub anchor_scope: Option<Guid>,
    pub options: QueryOptions,
    pub sequencing: Sequencing,
    pub page: PageRequest,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementPage {
    pub elements: Vec<MetadataElement>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait SearchApi {
    async fn find_by_property(&self, input: FindByPropertyInput) -> GraphResult<ElementPage>;
    async fn find_by_text(&self, input: FindByTextInput) -> GraphResult<ElementPage>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalkInput {
    pub start_guid: Guid,
    pub direction: Direction,
    pub type_names: Option<Vec<String>>,
    /// Deepest hop returned; `0` and `1` both mean direct neighbours.
    pub max_depth: u32,
    pub options: QueryOptions,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelatedElement {
    pub element: MetadataElement,
    /// The relationship the walk crossed to reach `element`.
    pub relationship: Relationship,
    pub reached_from: Guid,
    pub depth: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentNode {
    pub summary: ElementSummary,
    pub relationship_type: String,
    pub children: Vec<ComponentNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewOptions {
    /// Relationship types whose end1 is the parent of end2.
    pub context_relationship_types: Vec<String>,
    pub component_relationship_types: Vec<String>,
    pub implementation_relationship_types: Vec<String>,
    pub max_depth: u32,
    pub options: QueryOptions,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            context_relationship_types: vec!["SolutionCompositionLink".to_string()],
            component_relationship_types: vec!["SolutionCompositionLink".to_string()],
            implementation_relationship_types: vec!["ImplementedBy".to_string()],
            max_depth: 5,
            options: QueryOptions::now(),
        }
    }
}

/// An element with its derived context. A derived part that could not be
/// built is `None`; the failure is logged and counted, the read still works.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementView {
    pub element: MetadataElement,
    pub parent_context: Option<Vec<ElementSummary>>,
    pub subcomponents: Option<Vec<ComponentNode>>,
    pub implementations: Option<Vec<ElementSummary>>,
}

#[async_trait]
pub trait TraversalApi {
    async fn walk(&self, input: WalkInput) -> GraphResult<Vec<RelatedElement>>;
    async fn parent_context(
        &self,
        guid: Guid,
        relationship_types: &[String],
        options: QueryOptions,
    ) -> GraphResult<Vec<ElementSummary>>;
    async fn subcomponent_tree(
        &self,
        guid: Guid,
        relationship_types: &[String],
        max_depth: u32,
        options: QueryOptions,
    ) -> GraphResult<Vec<ComponentNode>>;
    async fn implementation_summary(
        &self,
        guid: Guid,
        relationship_types: &[String],
        options: QueryOptions,
    ) -> GraphResult<Vec<ElementSummary>>;
    async fn element_view(
        &self,
        guid: Guid,
        view: ViewOptions,
    ) -> GraphResult<Option<ElementView>>;
}

/// Position after the last item of a page: its sort key and guid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageCursor {
    pub key: Option<PropertyValue>,
    pub guid: Guid,
}

pub fn encode_cursor(cursor: &PageCursor) -> GraphResult<String> {
    let payload = serde_json::to_vec(cursor)
        .map_err(|err| GraphError::invalid(format!("encode cursor: {err}")))?;
    Ok(URL_SAFE_NO_PAD.encode(payload))
}

pub fn decode_cursor(cursor: &str) -> GraphResult<PageCursor> {
    let decoded = URL_SAFE_NO_PAD
        .decode(cursor.as_bytes())
        .map_err(|_| GraphError::invalid("invalid cursor"))?;
    serde_json::from_slice(&decoded).map_err(|_| GraphError::invalid("invalid cursor"))
}
