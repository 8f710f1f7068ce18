//! `GraphStore`: every graph operation, expressed over a [`Repository`] and a
//! [`TypeRegistry`].
//!
//! The store keeps no graph state of its own. Each write reads what it needs,
//! builds one batch of [`Mutation`]s and hands it to the repository, which
//! applies it atomically; version expectations on the batch turn concurrent
//! writers into `Conflict` errors. Reads select versions by as-of time, so a
//! long traversal pinned to one instant is not disturbed by later writes.

mod anchors;
mod elements;
mod relationships;
mod search;
mod templates;
mod traversal;
mod views;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::{LimitsConfig, MemoryRepository, StoreConfig, ValidationMode};
use cairn_core::{
    ElementRecord, ElementScan, GraphError, GraphResult, Guid, MetadataElement, Mutation,
    PageCursor, QueryOptions, Relationship, RelationshipRecord, Repository, StatusFilter,
    Timestamp, TypeCatalog, TypeCategory, TypeDef, TypeRegistry, encode_cursor,
};

pub use templates::substitute_placeholders;

const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_page_size: u32,
    pub max_traversal_depth: u32,
    pub max_cascade_members: usize,
    pub max_cascade_rounds: u32,
}

impl StoreLimits {
    pub fn from_config(config: &StoreConfig) -> Self {
        let defaults = LimitsConfig::with_defaults();
        let limits = config.limits.clone().unwrap_or_else(LimitsConfig::with_defaults);
        Self {
            max_page_size: limits
                .max_page_size
                .or(defaults.max_page_size)
                .unwrap_or(500),
            max_traversal_depth: limits
                .max_traversal_depth
                .or(defaults.max_traversal_depth)
                .unwrap_or(16),
            max_cascade_members: limits
                .max_cascade_members
                .or(defaults.max_cascade_members)
                .unwrap_or(10_000),
            max_cascade_rounds: limits
                .max_cascade_rounds
                .or(defaults.max_cascade_rounds)
                .unwrap_or(3)
                .max(1),
        }
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self::from_config(&StoreConfig::in_memory())
    }
}

#[derive(Debug, Default)]
struct StoreCounters {
    degraded_views: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDiagnostics {
    pub elements: u64,
    pub relationships: u64,
    /// Derived view parts dropped because building them failed.
    pub degraded_views: u64,
}

#[derive(Clone)]
pub struct GraphStore {
    repo: Arc<dyn Repository>,
    registry: Arc<dyn TypeRegistry>,
    limits: StoreLimits,
    validation_mode: ValidationMode,
    operation_timeout: Duration,
    counters: Arc<StoreCounters>,
}

impl GraphStore {
    pub fn new(repo: Arc<dyn Repository>, registry: Arc<dyn TypeRegistry>) -> Self {
        Self {
            repo,
            registry,
            limits: StoreLimits::default(),
            validation_mode: ValidationMode::Error,
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            counters: Arc::new(StoreCounters::default()),
        }
    }

    pub fn from_config(
        config: &StoreConfig,
        repo: Arc<dyn Repository>,
        registry: Arc<dyn TypeRegistry>,
    ) -> Self {
        Self::new(repo, registry)
            .with_limits(StoreLimits::from_config(config))
            .with_validation_mode(config.validation_mode.unwrap_or(ValidationMode::Error))
            .with_operation_timeout(Duration::from_millis(
                config
                    .operation_timeout_ms
                    .unwrap_or(DEFAULT_OPERATION_TIMEOUT_MS),
            ))
    }

    /// Built-in types over a fresh [`MemoryRepository`].
    pub fn in_memory() -> GraphResult<Self> {
        Ok(Self::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(TypeCatalog::with_builtins()?),
        ))
    }

    pub fn with_limits(mut self, limits: StoreLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    pub fn with_operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    pub fn registry(&self) -> &dyn TypeRegistry {
        self.registry.as_ref()
    }

    pub async fn diagnostics(&self) -> GraphResult<StoreDiagnostics> {
        let stats = self.guarded("stats", self.repo.stats()).await?;
        Ok(StoreDiagnostics {
            elements: stats.elements,
            relationships: stats.relationships,
            degraded_views: self.counters.degraded_views.load(Ordering::Relaxed),
        })
    }

    /// Bound a repository call by the operation timeout. Failures are logged
    /// and returned as they are; nothing is retried here.
    async fn guarded<T, F>(&self, what: &str, call: F) -> GraphResult<T>
    where
        F: Future<Output = GraphResult<T>>,
    {
        match timeout(self.operation_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                if err.is_retryable() {
                    log::warn!("cairn repository {what} failed: {err}");
                }
                Err(err)
            }
            Err(_) => {
                log::warn!(
                    "cairn repository {what} timed out after {} ms",
                    self.operation_timeout.as_millis()
                );
                Err(GraphError::unavailable(format!(
                    "repository {what} timed out after {} ms",
                    self.operation_timeout.as_millis()
                )))
            }
        }
    }

    async fn fetch_element(&self, guid: Guid) -> GraphResult<Option<ElementRecord>> {
        self.guarded("element read", self.repo.element(guid)).await
    }

    async fn fetch_relationship(&self, guid: Guid) -> GraphResult<Option<RelationshipRecord>> {
        self.guarded("relationship read", self.repo.relationship(guid))
            .await
    }

    async fn scan(&self, scan: &ElementScan) -> GraphResult<Vec<ElementRecord>> {
        self.guarded("element scan", self.repo.scan_elements(scan))
            .await
    }

    async fn relationships_of(&self, guid: Guid) -> GraphResult<Vec<RelationshipRecord>> {
        self.guarded("relationship scan", self.repo.relationships_for(guid))
            .await
    }

    async fn commit(&self, batch: Vec<Mutation>) -> GraphResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.guarded("apply", self.repo.apply(batch)).await
    }

    /// The record of a live (not archived) element, or `NotFound`.
    async fn require_live_element(&self, guid: Guid) -> GraphResult<ElementRecord> {
        self.fetch_element(guid)
            .await?
            .filter(|record| !record.latest().status.is_deleted())
            .ok_or_else(|| GraphError::not_found(format!("element {guid}")))
    }

    fn validation_failure(&self, message: impl Into<String>) -> GraphResult<()> {
        let message = message.into();
        match self.validation_mode {
            ValidationMode::Error => Err(GraphError::invalid(message)),
            ValidationMode::Warn => {
                log::warn!("cairn validation warning: {message}");
                Ok(())
            }
            ValidationMode::Off => Ok(()),
        }
    }

    fn check_properties(
        &self,
        type_name: &str,
        properties: &cairn_core::PropertyBag,
    ) -> GraphResult<()> {
        properties.validate_finite()?;
        if self.validation_mode == ValidationMode::Off {
            return Ok(());
        }
        let problems = self.registry.check_properties(type_name, properties);
        if problems.is_empty() {
            return Ok(());
        }
        self.validation_failure(problems.join("; "))
    }

    fn resolve_category(&self, name: &str, category: TypeCategory) -> GraphResult<TypeDef> {
        let def = self
            .registry
            .resolve_type(name)
            .ok_or_else(|| GraphError::invalid(format!("unknown type '{name}'")))?;
        if def.category != category {
            return Err(GraphError::invalid(format!(
                "type '{name}' is a {:?} type, expected {category:?}",
                def.category
            )));
        }
        Ok(def)
    }

    fn entity_type(&self, name: &str) -> GraphResult<TypeDef> {
        self.resolve_category(name, TypeCategory::Entity)
    }

    fn relationship_type(&self, name: &str) -> GraphResult<TypeDef> {
        self.resolve_category(name, TypeCategory::Relationship)
    }

    fn classification_type(&self, name: &str) -> GraphResult<TypeDef> {
        self.resolve_category(name, TypeCategory::Classification)
    }

    /// Every named relationship type plus its subtypes.
    fn expand_relationship_types(&self, names: &[String]) -> GraphResult<HashSet<String>> {
        let mut expanded = HashSet::new();
        for name in names {
            self.relationship_type(name)?;
            expanded.extend(self.registry.type_and_subtypes(name));
        }
        Ok(expanded)
    }

    fn is_ownership(&self, relationship_type: &str) -> bool {
        self.registry
            .resolve_type(relationship_type)
            .is_some_and(|def| def.ownership)
    }

    fn check_end_types(&self, def: &TypeDef, end1_type: &str, end2_type: &str) -> GraphResult<()> {
        let Some((expected1, expected2)) = def.end_types() else {
            return Err(GraphError::invalid(format!(
                "relationship type '{}' declares no end types",
                def.name
            )));
        };
        if !self.registry.is_subtype_of(end1_type, expected1) {
            return Err(GraphError::invalid(format!(
                "{} end1 must be a {expected1}, got {end1_type}",
                def.name
            )));
        }
        if !self.registry.is_subtype_of(end2_type, expected2) {
            return Err(GraphError::invalid(format!(
                "{} end2 must be a {expected2}, got {end2_type}",
                def.name
            )));
        }
        Ok(())
    }

    fn page_limit(&self, requested: u32) -> GraphResult<usize> {
        if requested == 0 {
            return Err(GraphError::invalid("page limit must be positive"));
        }
        Ok(requested.min(self.limits.max_page_size) as usize)
    }

    fn record_degraded<T>(&self, part: &str, guid: Guid, result: GraphResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.counters.degraded_views.fetch_add(1, Ordering::Relaxed);
                log::warn!("cairn view part {part} of {guid} degraded: {err}");
                None
            }
        }
    }
}

fn read_time(options: &QueryOptions) -> Timestamp {
    options.as_of_time.unwrap_or_else(Timestamp::now)
}

/// Lineage reads skip the effectivity check; every other read needs the
/// version to be effective at the read time.
fn is_visible(
    status: cairn_core::InstanceStatus,
    effectivity: &cairn_core::EffectivityWindow,
    options: &QueryOptions,
    filter: &StatusFilter,
    at: Timestamp,
) -> bool {
    if !filter.accepts(status, options.for_lineage) {
        return false;
    }
    options.for_lineage || effectivity.contains(at)
}

fn element_visible(
    record: &ElementRecord,
    options: &QueryOptions,
    filter: &StatusFilter,
    at: Timestamp,
) -> Option<MetadataElement> {
    let version = record.as_of(options.as_of_time)?;
    is_visible(version.status, &version.effectivity, options, filter, at).then(|| version.clone())
}

fn relationship_visible(
    record: &RelationshipRecord,
    options: &QueryOptions,
    filter: &StatusFilter,
    at: Timestamp,
) -> Option<Relationship> {
    let version = record.as_of(options.as_of_time)?;
    is_visible(version.status, &version.effectivity, options, filter, at).then(|| version.clone())
}

/// Cut an already ordered, already cursor-filtered list to one page.
fn paginate<T>(
    mut items: Vec<T>,
    limit: usize,
    cursor_of: impl Fn(&T) -> PageCursor,
) -> GraphResult<(Vec<T>, Option<String>)> {
    let more = items.len() > limit;
    items.truncate(limit);
    let next_cursor = if more {
        items.last().map(|item| encode_cursor(&cursor_of(item))).transpose()?
    } else {
        None
    };
    Ok((items, next_cursor))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{GraphStore, StoreLimits, paginate};
    use crate::{LimitsConfig, MemoryRepository, StoreConfig};
    use cairn_core::{
        ElementApi, ElementRecord, ElementScan, GraphError, GraphResult, Guid, Mutation, PageCursor, QueryOptions, RelationshipRecord, Repository, RepositoryStats,
        TypeCatalog, decode_cursor,
    };

    struct StalledRepository;

    #[async_trait]
    impl Repository for StalledRepository {
        async fn element(&self, _guid: Guid) -> GraphResult<Option<ElementRecord>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }

        async fn relationship(&self, _guid: Guid) -> GraphResult<Option<RelationshipRecord>> {
            Ok(None)
        }

        async fn scan_elements(&self, _scan: &ElementScan) -> GraphResult<Vec<ElementRecord>> {
            Ok(Vec::new())
        }

        async fn relationships_for(&self, _guid: Guid) -> GraphResult<Vec<RelationshipRecord>> {
            Ok(Vec::new())
        }

        async fn apply(&self, _batch: Vec<Mutation>) -> GraphResult<()> {
            Ok(())
        }

        async fn stats(&self) -> GraphResult<RepositoryStats> {
            Ok(RepositoryStats::default())
        }
    }

    #[tokio::test]
    async fn slow_repository_surfaces_as_unavailable() {
        let store = GraphStore::new(
            Arc::new(StalledRepository),
            Arc::new(TypeCatalog::with_builtins().expect("catalog")),
        )
        .with_operation_timeout(Duration::from_millis(20));
        let err = store
            .get_element(Guid::new(), QueryOptions::now())
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::RepositoryUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn diagnostics_start_empty() {
        let store = GraphStore::in_memory().expect("store");
        let diagnostics = store.diagnostics().await.expect("diagnostics");
        assert_eq!(diagnostics.elements, 0);
        assert_eq!(diagnostics.degraded_views, 0);
    }

    #[test]
    fn limits_fall_back_to_defaults_per_field() {
        let mut config = StoreConfig::in_memory();
        config.limits = Some(LimitsConfig {
            max_page_size: Some(10),
            ..LimitsConfig::default()
        });
        let limits = StoreLimits::from_config(&config);
        assert_eq!(limits.max_page_size, 10);
        assert_eq!(limits.max_traversal_depth, 16);
        assert_eq!(limits.max_cascade_rounds, 3);
        let store = GraphStore::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(TypeCatalog::empty()),
        )
        .with_limits(limits);
        assert!(store.page_limit(0).is_err());
        assert_eq!(store.page_limit(50).expect("limit"), 10);
    }

    #[test]
    fn paginate_emits_cursor_only_when_more_remain() {
        let guids: Vec<Guid> = (0..3).map(|_| Guid::new()).collect();
        let cursor_of = |guid: &Guid| PageCursor {
            key: None,
            guid: *guid,
        };
        let (page, next) = paginate(guids.clone(), 2, cursor_of).expect("page");
        assert_eq!(page.len(), 2);
        let next = decode_cursor(&next.expect("cursor")).expect("decode");
        assert_eq!(next.guid, guids[1]);
        let (page, next) = paginate(guids, 3, cursor_of).expect("page");
        assert_eq!(page.len(), 3);
        assert!(next.is_none());
    }
}
