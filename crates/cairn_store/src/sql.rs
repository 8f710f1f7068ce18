use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::sea_query;
use sea_orm::sea_query::{
    Alias, Cond, Expr, Func, MysqlQueryBuilder, OnConflict, PostgresQueryBuilder, Query,
    QueryStatementWriter, SqliteQueryBuilder, Value as SeaValue,
};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr,
    QueryResult, Statement, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use uuid::Uuid;

use crate::db::*;
use crate::migration::Migrator;
use crate::{RepositoryConfig, StoreConfig};
use cairn_core::{
    ElementRecord, ElementScan, GraphError, GraphResult, Guid, Mutation, RelationshipRecord,
    Repository, RepositoryStats,
};

/// Repository over SQLite, Postgres or MySQL. Each record is one row holding
/// its full version history as JSON, with the columns the store filters on
/// pulled out and indexed.
#[derive(Clone)]
pub struct SqlRepository {
    conn: DatabaseConnection,
    backend: DatabaseBackend,
}

impl SqlRepository {
    pub async fn connect(config: &StoreConfig, base_dir: &Path) -> GraphResult<Self> {
        let url = build_connection_url(config, base_dir)?;
        let mut options = ConnectOptions::new(url);
        options.sqlx_logging(false);
        if let Some(pool) = &config.pool {
            if let Some(max) = pool.max_connections {
                options.max_connections(max);
            }
            if let Some(min) = pool.min_connections {
                options.min_connections(min);
            }
            if let Some(timeout_ms) = pool.connect_timeout_ms {
                options.connect_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.acquire_timeout_ms {
                options.acquire_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.idle_timeout_ms {
                options.idle_timeout(Duration::from_millis(timeout_ms));
            }
        }
        let conn = Database::connect(options).await.map_err(db_err)?;
        let backend = conn.get_database_backend();
        Migrator::up(&conn, None).await.map_err(db_err)?;
        log::info!(
            "cairn sql repository ready backend={}",
            config.backend_name()
        );
        Ok(Self { conn, backend })
    }

    pub async fn connect_sqlite(path: &Path) -> GraphResult<Self> {
        let config = StoreConfig::default_sqlite(path.to_string_lossy());
        Self::connect(&config, path.parent().unwrap_or_else(|| Path::new("."))).await
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    async fn element_version<C: ConnectionTrait>(
        &self,
        conn: &C,
        guid: Guid,
    ) -> GraphResult<Option<u64>> {
        let select = Query::select()
            .from(CairnElements::Table)
            .column(CairnElements::Version)
            .and_where(Expr::col(CairnElements::Guid).eq(id_value(self.backend, guid)))
            .limit(1)
            .to_owned();
        query_one(conn, &select)
            .await?
            .map(|row| read_version(&row, CairnElements::Version))
            .transpose()
    }

    async fn relationship_version<C: ConnectionTrait>(
        &self,
        conn: &C,
        guid: Guid,
    ) -> GraphResult<Option<u64>> {
        let select = Query::select()
            .from(CairnRelationships::Table)
            .column(CairnRelationships::Version)
            .and_where(Expr::col(CairnRelationships::Guid).eq(id_value(self.backend, guid)))
            .limit(1)
            .to_owned();
        query_one(conn, &select)
            .await?
            .map(|row| read_version(&row, CairnRelationships::Version))
            .transpose()
    }

    async fn apply_one<C: ConnectionTrait>(&self, conn: &C, mutation: Mutation) -> GraphResult<()> {
        match mutation {
            Mutation::PutElement { record, expect } => {
                let current = self.element_version(conn, record.guid).await?;
                expect.check("element", record.guid, current)?;
                let payload = serde_json::to_string(&record)?;
                let insert = Query::insert()
                    .into_table(CairnElements::Table)
                    .columns([
                        CairnElements::Guid,
                        CairnElements::TypeName,
                        CairnElements::AnchorGuid,
                        CairnElements::Version,
                        CairnElements::UpdatedAt,
                        CairnElements::Payload,
                    ])
                    .values_panic([
                        id_value(self.backend, record.guid).into(),
                        record.type_name().to_string().into(),
                        opt_id_value(self.backend, record.anchor_guid()).into(),
                        (record.version() as i64).into(),
                        record.latest().header.updated_at.as_micros().into(),
                        payload.into(),
                    ])
                    .on_conflict(
                        OnConflict::column(CairnElements::Guid)
                            .update_columns([
                                CairnElements::TypeName,
                                CairnElements::AnchorGuid,
                                CairnElements::Version,
                                CairnElements::UpdatedAt,
                                CairnElements::Payload,
                            ])
                            .to_owned(),
                    )
                    .to_owned();
                exec(conn, &insert).await
            }
            Mutation::RemoveElement { guid, expect } => {
                let current = self.element_version(conn, guid).await?;
                expect.check("element", guid, current)?;
                let delete = Query::delete()
                    .from_table(CairnElements::Table)
                    .and_where(Expr::col(CairnElements::Guid).eq(id_value(self.backend, guid)))
                    .to_owned();
                exec(conn, &delete).await
            }
            Mutation::PutRelationship { record, expect } => {
                let current = self.relationship_version(conn, record.guid).await?;
                expect.check("relationship", record.guid, current)?;
                let payload = serde_json::to_string(&record)?;
                let insert = Query::insert()
                    .into_table(CairnRelationships::Table)
                    .columns([
                        CairnRelationships::Guid,
                        CairnRelationships::TypeName,
                        CairnRelationships::End1Guid,
                        CairnRelationships::End2Guid,
                        CairnRelationships::Version,
                        CairnRelationships::UpdatedAt,
                        CairnRelationships::Payload,
                    ])
                    .values_panic([
                        id_value(self.backend, record.guid).into(),
                        record.type_name().to_string().into(),
                        id_value(self.backend, record.end1_guid()).into(),
                        id_value(self.backend, record.end2_guid()).into(),
                        (record.version() as i64).into(),
                        record.latest().header.updated_at.as_micros().into(),
                        payload.into(),
                    ])
                    .on_conflict(
                        OnConflict::column(CairnRelationships::Guid)
                            .update_columns([
                                CairnRelationships::TypeName,
                                CairnRelationships::End1Guid,
                                CairnRelationships::End2Guid,
                                CairnRelationships::Version,
                                CairnRelationships::UpdatedAt,
                                CairnRelationships::Payload,
                            ])
                            .to_owned(),
                    )
                    .to_owned();
                exec(conn, &insert).await
            }
            Mutation::RemoveRelationship { guid, expect } => {
                let current = self.relationship_version(conn, guid).await?;
                expect.check("relationship", guid, current)?;
                let delete = Query::delete()
                    .from_table(CairnRelationships::Table)
                    .and_where(
                        Expr::col(CairnRelationships::Guid).eq(id_value(self.backend, guid)),
                    )
                    .to_owned();
                exec(conn, &delete).await
            }
        }
    }

    async fn count(&self, table: impl sea_query::Iden + 'static) -> GraphResult<u64> {
        let select = Query::select()
            .expr_as(Func::count(Expr::col(sea_query::Asterisk)), Alias::new("total"))
            .from(table)
            .to_owned();
        let Some(row) = query_one(&self.conn, &select).await? else {
            return Ok(0);
        };
        let total: i64 = row.try_get("", "total").map_err(db_err)?;
        Ok(total.max(0) as u64)
    }
}

#[async_trait]
impl Repository for SqlRepository {
    async fn element(&self, guid: Guid) -> GraphResult<Option<ElementRecord>> {
        let select = Query::select()
            .from(CairnElements::Table)
            .column(CairnElements::Payload)
            .and_where(Expr::col(CairnElements::Guid).eq(id_value(self.backend, guid)))
            .limit(1)
            .to_owned();
        query_one(&self.conn, &select)
            .await?
            .map(|row| read_payload(&row, CairnElements::Payload))
            .transpose()
    }

    async fn relationship(&self, guid: Guid) -> GraphResult<Option<RelationshipRecord>> {
        let select = Query::select()
            .from(CairnRelationships::Table)
            .column(CairnRelationships::Payload)
            .and_where(Expr::col(CairnRelationships::Guid).eq(id_value(self.backend, guid)))
            .limit(1)
            .to_owned();
        query_one(&self.conn, &select)
            .await?
            .map(|row| read_payload(&row, CairnRelationships::Payload))
            .transpose()
    }

    async fn scan_elements(&self, scan: &ElementScan) -> GraphResult<Vec<ElementRecord>> {
        let mut select = Query::select()
            .from(CairnElements::Table)
            .column(CairnElements::Payload)
            .to_owned();
        if let Some(type_names) = &scan.type_names {
            select.and_where(Expr::col(CairnElements::TypeName).is_in(type_names.clone()));
        }
        if let Some(anchor) = scan.anchor_guid {
            select.and_where(Expr::col(CairnElements::AnchorGuid).eq(id_value(self.backend, anchor)));
        }
        let rows = query_all(&self.conn, &select).await?;
        let mut records = rows
            .iter()
            .map(|row| read_payload::<ElementRecord>(row, CairnElements::Payload))
            .collect::<GraphResult<Vec<_>>>()?;
        records.sort_by_key(|record| record.guid);
        Ok(records)
    }

    async fn relationships_for(&self, guid: Guid) -> GraphResult<Vec<RelationshipRecord>> {
        let select = Query::select()
            .from(CairnRelationships::Table)
            .column(CairnRelationships::Payload)
            .cond_where(
                Cond::any()
                    .add(Expr::col(CairnRelationships::End1Guid).eq(id_value(self.backend, guid)))
                    .add(Expr::col(CairnRelationships::End2Guid).eq(id_value(self.backend, guid))),
            )
            .to_owned();
        let rows = query_all(&self.conn, &select).await?;
        let mut records = rows
            .iter()
            .map(|row| read_payload::<RelationshipRecord>(row, CairnRelationships::Payload))
            .collect::<GraphResult<Vec<_>>>()?;
        records.sort_by_key(|record| record.guid);
        Ok(records)
    }

    async fn apply(&self, batch: Vec<Mutation>) -> GraphResult<()> {
        let tx = self.conn.begin().await.map_err(db_err)?;
        for mutation in batch {
            // Dropping `tx` on the error path rolls the batch back.
            self.apply_one(&tx, mutation).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn stats(&self) -> GraphResult<RepositoryStats> {
        Ok(RepositoryStats {
            elements: self.count(CairnElements::Table).await?,
            relationships: self.count(CairnRelationships::Table).await?,
        })
    }
}

fn db_err(err: DbErr) -> GraphError {
    GraphError::unavailable(err.to_string())
}

fn id_value(backend: DatabaseBackend, guid: Guid) -> SeaValue {
    match backend {
        DatabaseBackend::Postgres => SeaValue::from(Uuid::from_bytes(guid.as_bytes())),
        DatabaseBackend::MySql => SeaValue::from(guid.as_bytes().to_vec()),
        _ => SeaValue::from(guid.to_uuid_string()),
    }
}

fn none_id_value(backend: DatabaseBackend) -> SeaValue {
    match backend {
        DatabaseBackend::Postgres => SeaValue::Uuid(None),
        DatabaseBackend::MySql => SeaValue::Bytes(None),
        _ => SeaValue::String(None),
    }
}

fn opt_id_value(backend: DatabaseBackend, guid: Option<Guid>) -> SeaValue {
    match guid {
        Some(guid) => id_value(backend, guid),
        None => none_id_value(backend),
    }
}

fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

fn read_version(row: &QueryResult, column: impl sea_query::Iden) -> GraphResult<u64> {
    let value: i64 = row.try_get("", &col_name(column)).map_err(db_err)?;
    Ok(value.max(0) as u64)
}

fn read_payload<T: serde::de::DeserializeOwned>(
    row: &QueryResult,
    column: impl sea_query::Iden,
) -> GraphResult<T> {
    let raw: String = row.try_get("", &col_name(column)).map_err(db_err)?;
    Ok(serde_json::from_str(&raw)?)
}

fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

async fn exec<C, S>(conn: &C, stmt: &S) -> GraphResult<()>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    conn.execute(Statement::from_sql_and_values(backend, sql, values))
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn query_all<C, S>(conn: &C, stmt: &S) -> GraphResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    conn.query_all(Statement::from_sql_and_values(backend, sql, values))
        .await
        .map_err(db_err)
}

async fn query_one<C, S>(conn: &C, stmt: &S) -> GraphResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    conn.query_one(Statement::from_sql_and_values(backend, sql, values))
        .await
        .map_err(db_err)
}

fn build_connection_url(config: &StoreConfig, base_dir: &Path) -> GraphResult<String> {
    match &config.repository {
        RepositoryConfig::Sqlite { .. } => {
            let path = config.sqlite_path(base_dir)?;
            Ok(format!("sqlite://{}?mode=rwc", path.display()))
        }
        RepositoryConfig::Postgres { url } | RepositoryConfig::Mysql { url } => Ok(url.clone()),
        RepositoryConfig::Memory => Err(GraphError::invalid(
            "memory backend has no SQL connection",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::{build_connection_url, id_value};
    use crate::StoreConfig;
    use cairn_core::Guid;
    use sea_orm::DatabaseBackend;
    use sea_orm::sea_query::Value as SeaValue;
    use std::path::Path;

    #[test]
    fn sqlite_url_uses_rwc_mode() {
        let config = StoreConfig::default_sqlite("graph.sqlite");
        let url = build_connection_url(&config, Path::new("/tmp/cairn")).expect("url");
        assert_eq!(url, "sqlite:///tmp/cairn/graph.sqlite?mode=rwc");
        assert!(build_connection_url(&StoreConfig::in_memory(), Path::new(".")).is_err());
    }

    #[test]
    fn ids_bind_per_backend() {
        let guid = Guid::new();
        assert_eq!(
            id_value(DatabaseBackend::Sqlite, guid),
            SeaValue::from(guid.to_uuid_string())
        );
        assert_eq!(
            id_value(DatabaseBackend::MySql, guid),
            SeaValue::from(guid.as_bytes().to_vec())
        );
    }
}
