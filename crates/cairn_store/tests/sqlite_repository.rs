use std::collections::HashSet;
use std::sync::Arc;

use cairn_store::{
    CreateElementInput, CreateRelationshipInput, DetachInput, Direction, ElementApi,
    FindRelationshipsInput, GraphError, GraphResult, GraphStore, PageRequest, PropertyBag,
    QueryOptions, RelationshipApi, RemoveElementInput, SqlRepository, StatusFilter, StoreConfig,
    Timestamp, TypeCatalog, UpdateElementInput, ValidationMode, open_store_with,
};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use tempfile::tempdir;

async fn list_tables(path: &std::path::Path) -> GraphResult<HashSet<String>> {
    let url = format!("sqlite://{}?mode=rwc", path.to_string_lossy());
    let conn: DatabaseConnection = sea_orm::Database::connect(url)
        .await
        .map_err(|err| GraphError::unavailable(err.to_string()))?;
    let rows = conn
        .query_all(Statement::from_string(
            DatabaseBackend::Sqlite,
            "SELECT name FROM sqlite_master WHERE type = 'table'",
        ))
        .await
        .map_err(|err| GraphError::unavailable(err.to_string()))?;
    let mut tables = HashSet::new();
    for row in rows {
        let name: String = row
            .try_get("", "name")
            .map_err(|err| GraphError::unavailable(err.to_string()))?;
        tables.insert(name);
    }
    Ok(tables)
}

#[tokio::test]
async fn migrations_create_graph_tables() -> GraphResult<()> {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("cairn.sqlite");
    SqlRepository::connect_sqlite(&path).await?;
    let tables = list_tables(&path).await?;
    for table in ["cairn_elements", "cairn_relationships"] {
        assert!(tables.contains(table), "missing table {table}");
    }
    Ok(())
}

#[tokio::test]
async fn versions_survive_reopen() -> GraphResult<()> {
    let dir = tempdir().expect("tempdir");
    let base = dir.path();
    let config = StoreConfig::default_sqlite(base.join("graph.sqlite").to_string_lossy());

    let store = open_store_with(&config, base).await?;
    let guid = store
        .create_element(CreateElementInput::root(
            "steward",
            "DataSet",
            PropertyBag::new()
                .with("qualifiedName", "dataset::orders")
                .with("name", "orders"),
        ))
        .await?;
    let first_version = Timestamp::now();
    store
        .update_element(UpdateElementInput {
            actor: "editor".to_string(),
            guid,
            replace_all: false,
            properties: PropertyBag::new().with("name", "orders-v2"),
            effectivity: None,
            status: None,
        })
        .await?;
    drop(store);

    let reopened = open_store_with(&config, base).await?;
    let current = reopened
        .get_element(guid, QueryOptions::now())
        .await?
        .expect("current");
    assert_eq!(current.properties.get_str("name"), Some("orders-v2"));
    assert_eq!(current.header.version, 2);
    let past = reopened
        .get_element(guid, QueryOptions::as_of(first_version))
        .await?
        .expect("past");
    assert_eq!(past.properties.get_str("name"), Some("orders"));
    Ok(())
}

#[tokio::test]
async fn relationships_conflict_detach_and_cascade_on_sqlite() -> GraphResult<()> {
    let dir = tempdir().expect("tempdir");
    let repo = SqlRepository::connect_sqlite(&dir.path().join("graph.sqlite")).await?;
    let store = GraphStore::new(Arc::new(repo), Arc::new(TypeCatalog::with_builtins()?));

    let root = store
        .create_element(CreateElementInput::root(
            "architect",
            "SolutionComponent",
            PropertyBag::new().with("qualifiedName", "root"),
        ))
        .await?;
    let child = store
        .create_element(CreateElementInput::child(
            "architect",
            "SolutionComponent",
            PropertyBag::new().with("qualifiedName", "child"),
            root,
            "SolutionCompositionLink",
        ))
        .await?;
    let asset = store
        .create_element(CreateElementInput::root(
            "architect",
            "Asset",
            PropertyBag::new().with("qualifiedName", "asset"),
        ))
        .await?;

    let link = CreateRelationshipInput::new("architect", "ImplementedBy", child, asset);
    store.create_relationship(link.clone()).await?;
    assert!(matches!(
        store.create_relationship(link).await,
        Err(GraphError::Conflict { .. })
    ));
    let detached = store
        .detach(DetachInput {
            actor: "architect".to_string(),
            type_name: "ImplementedBy".to_string(),
            end1_guid: child,
            end2_guid: asset,
        })
        .await?;
    assert_eq!(detached, 1);

    store
        .delete_element(RemoveElementInput {
            actor: "architect".to_string(),
            guid: root,
            cascaded: true,
        })
        .await?;
    assert!(store.get_element(child, QueryOptions::lineage()).await?.is_none());
    let remaining = store
        .find_relationships(FindRelationshipsInput {
            guid: asset,
            direction: Direction::Both,
            type_name: None,
            status_filter: StatusFilter::any(),
            options: QueryOptions::lineage(),
            page: PageRequest::first(10),
        })
        .await?;
    assert!(remaining.relationships.is_empty());
    let diagnostics = store.diagnostics().await?;
    assert_eq!(diagnostics.elements, 1);
    assert_eq!(diagnostics.relationships, 0);
    Ok(())
}

#[tokio::test]
async fn non_finite_numbers_never_reach_the_database() -> GraphResult<()> {
    let dir = tempdir().expect("tempdir");
    let repo = SqlRepository::connect_sqlite(&dir.path().join("graph.sqlite")).await?;
    let store = GraphStore::new(Arc::new(repo), Arc::new(TypeCatalog::with_builtins()?))
        .with_validation_mode(ValidationMode::Off);

    let mut input = CreateElementInput::root(
        "steward",
        "DataSet",
        PropertyBag::new()
            .with("qualifiedName", "dataset::scores")
            .with("score", f64::NAN),
    );
    assert!(matches!(
        store.create_element(input.clone()).await,
        Err(GraphError::InvalidParameter { .. })
    ));

    input.properties = PropertyBag::new().with("qualifiedName", "dataset::scores");
    let guid = store.create_element(input).await?;
    let update = store
        .update_element(UpdateElementInput {
            actor: "steward".to_string(),
            guid,
            replace_all: false,
            properties: PropertyBag::new().with("score", f64::INFINITY),
            effectivity: None,
            status: None,
        })
        .await;
    assert!(matches!(update, Err(GraphError::InvalidParameter { .. })));

    let other = store
        .create_element(CreateElementInput::root(
            "steward",
            "DataSet",
            PropertyBag::new().with("qualifiedName", "dataset::other"),
        ))
        .await?;
    let mut link = CreateRelationshipInput::new("steward", "ImplementedBy", guid, other);
    link.properties = PropertyBag::new().with("weight", f64::NEG_INFINITY);
    assert!(matches!(
        store.create_relationship(link).await,
        Err(GraphError::InvalidParameter { .. })
    ));

    let current = store
        .get_element(guid, QueryOptions::now())
        .await?
        .expect("still readable");
    assert_eq!(current.header.version, 1);
    assert!(current.properties.get("score").is_none());
    Ok(())
}
