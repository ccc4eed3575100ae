use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Line item of a demand document (ItemDFD).
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "demand_items")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub demand_document_id: i32,
    pub catalog_item_id: i32,
    #[sea_orm(column_type = "Decimal(Some((15, 3)))")]
    pub quantity: Decimal,
    #[sea_orm(column_type = "Decimal(Some((15, 2)))")]
    pub estimated_unit_price: Decimal,
    /// quantity × estimated_unit_price, rewritten whenever either changes
    #[sea_orm(column_type = "Decimal(Some((15, 2)))")]
    pub estimated_total: Decimal,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::demand_document::Entity",
        from = "Column::DemandDocumentId",
        to = "super::demand_document::Column::Id"
    )]
    DemandDocument,
    #[sea_orm(
        belongs_to = "super::catalog_item::Entity",
        from = "Column::CatalogItemId",
        to = "super::catalog_item::Column::Id"
    )]
    CatalogItem,
}

impl Related<super::demand_document::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DemandDocument.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
