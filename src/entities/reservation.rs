use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

/// Status for reservations (Pedido)
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum ReservationStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "partial_delivery")]
    PartialDelivery,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl ReservationStatus {
    /// Status implied by the running delivered total.
    ///
    /// A zero total leaves `current` untouched.
    pub fn after_delivery(current: Self, requested: Decimal, delivered: Decimal) -> Self {
        if delivered >= requested {
            ReservationStatus::Delivered
        } else if delivered > Decimal::ZERO {
            ReservationStatus::PartialDelivery
        } else {
            current
        }
    }

    /// Whether the reservation still consumes contract balance.
    pub fn holds_balance(&self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }

    /// Open reservations still expect deliveries.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::PartialDelivery
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "reservations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub contract_item_id: i32,
    pub delivery_order_id: i32,
    #[sea_orm(column_type = "Decimal(Some((15, 3)))")]
    pub requested_quantity: Decimal,
    #[sea_orm(column_type = "Decimal(Some((15, 3)))")]
    pub delivered_quantity: Decimal,
    pub status: ReservationStatus,
    #[sea_orm(nullable)]
    pub last_delivery_note: Option<String>,
    #[sea_orm(nullable)]
    pub last_delivery_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::contract_item::Entity",
        from = "Column::ContractItemId",
        to = "super::contract_item::Column::Id"
    )]
    ContractItem,
    #[sea_orm(
        belongs_to = "super::delivery_order::Entity",
        from = "Column::DeliveryOrderId",
        to = "super::delivery_order::Column::Id"
    )]
    DeliveryOrder,
}

impl Related<super::contract_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ContractItem.def()
    }
}

impl Related<super::delivery_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DeliveryOrder.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();
        if insert {
            active_model.created_at = Set(now);
        }
        active_model.updated_at = Set(now);
        Ok(active_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn status_follows_delivered_total() {
        use ReservationStatus::*;
        assert_eq!(ReservationStatus::after_delivery(Pending, dec!(20), dec!(0)), Pending);
        assert_eq!(
            ReservationStatus::after_delivery(Pending, dec!(20), dec!(5)),
            PartialDelivery
        );
        assert_eq!(
            ReservationStatus::after_delivery(PartialDelivery, dec!(20), dec!(20)),
            Delivered
        );
        assert_eq!(
            ReservationStatus::after_delivery(Delivered, dec!(20), dec!(25)),
            Delivered
        );
    }

    #[test]
    fn only_cancelled_releases_balance() {
        assert!(ReservationStatus::Pending.holds_balance());
        assert!(ReservationStatus::Delivered.holds_balance());
        assert!(!ReservationStatus::Cancelled.holds_balance());
        assert!(!ReservationStatus::Delivered.is_open());
        assert!(ReservationStatus::PartialDelivery.is_open());
    }
}
