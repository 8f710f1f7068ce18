use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

use crate::db::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();

        manager
            .create_table(
                Table::create()
                    .table(CairnElements::Table)
                    .if_not_exists()
                    .col(id_col(backend, CairnElements::Guid, false))
                    .col(
                        ColumnDef::new(CairnElements::TypeName)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(id_col(backend, CairnElements::AnchorGuid, true))
                    .col(
                        ColumnDef::new(CairnElements::Version)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CairnElements::UpdatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CairnElements::Payload).text().not_null())
                    .primary_key(
                        Index::create()
                            .name("pk_cairn_elements")
                            .col(CairnElements::Guid),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(CairnRelationships::Table)
                    .if_not_exists()
                    .col(id_col(backend, CairnRelationships::Guid, false))
                    .col(
                        ColumnDef::new(CairnRelationships::TypeName)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(id_col(backend, CairnRelationships::End1Guid, false))
                    .col(id_col(backend, CairnRelationships::End2Guid, false))
                    .col(
                        ColumnDef::new(CairnRelationships::Version)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CairnRelationships::UpdatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CairnRelationships::Payload)
                            .text()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_cairn_relationships")
                            .col(CairnRelationships::Guid),
                    )
                    .to_owned(),
            )
            .await?;

        create_indexes(manager).await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .table(CairnRelationships::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(
                Table::drop()
                    .table(CairnElements::Table)
                    .if_exists()
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}

async fn create_indexes(manager: &SchemaManager<'_>) -> Result<(), DbErr> {
    manager
        .create_index(
            Index::create()
                .name("cairn_elements_type_idx")
                .table(CairnElements::Table)
                .col(CairnElements::TypeName)
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .name("cairn_elements_anchor_idx")
                .table(CairnElements::Table)
                .col(CairnElements::AnchorGuid)
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .name("cairn_relationships_end1_idx")
                .table(CairnRelationships::Table)
                .col(CairnRelationships::End1Guid)
                .col(CairnRelationships::TypeName)
                .to_owned(),
        )
        .await?;
    manager
        .create_index(
            Index::create()
                .name("cairn_relationships_end2_idx")
                .table(CairnRelationships::Table)
                .col(CairnRelationships::End2Guid)
                .col(CairnRelationships::TypeName)
                .to_owned(),
        )
        .await?;
    Ok(())
}

fn id_col(backend: DatabaseBackend, col: impl Iden + 'static, nullable: bool) -> ColumnDef {
    let mut col_def = ColumnDef::new(col);
    match backend {
        DatabaseBackend::Postgres => {
            col_def.uuid();
        }
        DatabaseBackend::MySql => {
            col_def.binary_len(16);
        }
        _ => {
            col_def.string_len(36);
        }
    }
    if nullable {
        col_def.null();
    } else {
        col_def.not_null();
    }
    col_def.to_owned()
}
