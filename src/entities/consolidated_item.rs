use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One row per distinct catalog item of a technical study (ItemETP).
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "consolidated_items")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub technical_study_id: i32,
    pub catalog_item_id: i32,
    #[sea_orm(column_type = "Decimal(Some((15, 3)))")]
    pub quantity: Decimal,
    #[sea_orm(column_type = "Decimal(Some((15, 2)))")]
    pub reference_unit_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((15, 2)))")]
    pub total: Decimal,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::technical_study::Entity",
        from = "Column::TechnicalStudyId",
        to = "super::technical_study::Column::Id"
    )]
    TechnicalStudy,
}

impl Related<super::technical_study::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TechnicalStudy.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
