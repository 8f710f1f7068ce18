use sea_orm::sea_query;
use sea_orm_migration::prelude::Iden;

#[derive(Iden, Clone, Copy)]
pub enum CairnElements {
    Table,
    Guid,
    TypeName,
    AnchorGuid,
    Version,
    UpdatedAt,
    Payload,
}

#[derive(Iden, Clone, Copy)]
pub enum CairnRelationships {
    Table,
    Guid,
    TypeName,
    End1Guid,
    End2Guid,
    Version,
    UpdatedAt,
    Payload,
}
