//! Contract Item Ledger
//!
//! Source of truth for how much of each item was contracted. Reservations never write here;
//! the remaining balance is always derived from the reservation rows.

use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

use super::{validate_non_negative, validate_positive_quantity};
use crate::db::DbPool;
use crate::entities::catalog_item::{self, CatalogItemType, Entity as CatalogItem};
use crate::entities::contract_item::{self, Entity as ContractItem};
use crate::entities::reservation::{self, Entity as Reservation, ReservationStatus};
use crate::errors::{is_unique_violation, ServiceError};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterCatalogItemCommand {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1, max = 32))]
    pub unit_of_measure: String,
    pub item_type: CatalogItemType,
    #[validate(length(max = 64))]
    pub taxonomy_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterContractItemCommand {
    pub contract_id: i32,
    #[validate(range(min = 1))]
    pub sequence_number: i32,
    pub catalog_item_id: i32,
    #[validate(custom = "validate_positive_quantity")]
    pub contracted_quantity: Decimal,
    #[validate(custom = "validate_non_negative")]
    pub unit_price: Decimal,
}

/// Derived balance of one contract item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemBalance {
    pub contract_item_id: i32,
    pub contracted: Decimal,
    /// Sum of requested quantities over reservations that are not cancelled
    pub reserved: Decimal,
    pub available: Decimal,
}

/// Sum of requested quantities still holding balance on `contract_item_id`.
///
/// `exclude_reservation_id` leaves one reservation out, for re-checking an edit of that
/// reservation against the cap.
pub(crate) async fn reserved_quantity<C>(
    conn: &C,
    contract_item_id: i32,
    exclude_reservation_id: Option<i32>,
) -> Result<Decimal, DbErr>
where
    C: ConnectionTrait,
{
    let mut query = Reservation::find()
        .filter(reservation::Column::ContractItemId.eq(contract_item_id))
        .filter(reservation::Column::Status.ne(ReservationStatus::Cancelled));
    if let Some(excluded) = exclude_reservation_id {
        query = query.filter(reservation::Column::Id.ne(excluded));
    }

    let reservations = query.all(conn).await?;
    Ok(reservations
        .iter()
        .filter(|r| r.status.holds_balance())
        .map(|r| r.requested_quantity)
        .sum())
}

#[derive(Clone)]
pub struct ContractLedgerService {
    db_pool: Arc<DbPool>,
}

impl ContractLedgerService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self))]
    pub async fn register_catalog_item(
        &self,
        command: RegisterCatalogItemCommand,
    ) -> Result<catalog_item::Model, ServiceError> {
        command.validate()?;

        let model = catalog_item::ActiveModel {
            name: Set(command.name.trim().to_string()),
            unit_of_measure: Set(command.unit_of_measure),
            item_type: Set(command.item_type),
            taxonomy_code: Set(command.taxonomy_code),
            ..Default::default()
        }
        .insert(&*self.db_pool)
        .await
        .map_err(ServiceError::db_error)?;

        info!(catalog_item_id = model.id, "Catalog item registered");
        Ok(model)
    }

    #[instrument(skip(self))]
    pub async fn get_catalog_item(&self, id: i32) -> Result<catalog_item::Model, ServiceError> {
        CatalogItem::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Catalog item {} not found", id)))
    }

    /// Registers a contracted line. Sequence numbers are unique within a contract.
    #[instrument(skip(self))]
    pub async fn register_contract_item(
        &self,
        command: RegisterContractItemCommand,
    ) -> Result<contract_item::Model, ServiceError> {
        command.validate()?;
        self.get_catalog_item(command.catalog_item_id).await?;

        let result = contract_item::ActiveModel {
            contract_id: Set(command.contract_id),
            sequence_number: Set(command.sequence_number),
            catalog_item_id: Set(command.catalog_item_id),
            contracted_quantity: Set(command.contracted_quantity),
            unit_price: Set(command.unit_price),
            is_active: Set(true),
            ..Default::default()
        }
        .insert(&*self.db_pool)
        .await;

        match result {
            Ok(model) => {
                info!(
                    contract_item_id = model.id,
                    contract_id = model.contract_id,
                    contracted_quantity = %model.contracted_quantity,
                    "Contract item registered"
                );
                Ok(model)
            }
            Err(e) if is_unique_violation(&e) => {
                warn!(
                    contract_id = command.contract_id,
                    sequence_number = command.sequence_number,
                    "Duplicate contract item sequence"
                );
                Err(ServiceError::Conflict(format!(
                    "Contract {} already has an item with sequence number {}",
                    command.contract_id, command.sequence_number
                )))
            }
            Err(e) => Err(ServiceError::db_error(e)),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_contract_item(&self, id: i32) -> Result<contract_item::Model, ServiceError> {
        ContractItem::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Contract item {} not found", id)))
    }

    #[instrument(skip(self))]
    pub async fn list_contract_items(
        &self,
        contract_id: i32,
    ) -> Result<Vec<contract_item::Model>, ServiceError> {
        ContractItem::find()
            .filter(contract_item::Column::ContractId.eq(contract_id))
            .order_by_asc(contract_item::Column::SequenceNumber)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Inactive items accept no new reservations; existing ones are untouched.
    #[instrument(skip(self))]
    pub async fn set_contract_item_active(
        &self,
        id: i32,
        is_active: bool,
    ) -> Result<contract_item::Model, ServiceError> {
        let item = self.get_contract_item(id).await?;
        let mut active: contract_item::ActiveModel = item.into();
        active.is_active = Set(is_active);
        let updated = active
            .update(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;
        info!(contract_item_id = id, is_active, "Contract item activation changed");
        Ok(updated)
    }

    /// Contracted quantity minus what non-cancelled reservations hold.
    #[instrument(skip(self))]
    pub async fn item_balance(&self, contract_item_id: i32) -> Result<ItemBalance, ServiceError> {
        let item = self.get_contract_item(contract_item_id).await?;
        let reserved = reserved_quantity(&*self.db_pool, contract_item_id, None)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(ItemBalance {
            contract_item_id,
            contracted: item.contracted_quantity,
            reserved,
            available: item.contracted_quantity - reserved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_db;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    async fn seeded() -> (ContractLedgerService, catalog_item::Model) {
        let ledger = ContractLedgerService::new(test_db().await);
        let catalog = ledger
            .register_catalog_item(RegisterCatalogItemCommand {
                name: "Luva de procedimento".into(),
                unit_of_measure: "CX".into(),
                item_type: CatalogItemType::Material,
                taxonomy_code: Some("6515".into()),
            })
            .await
            .unwrap();
        (ledger, catalog)
    }

    fn line(catalog_item_id: i32, sequence_number: i32) -> RegisterContractItemCommand {
        RegisterContractItemCommand {
            contract_id: 10,
            sequence_number,
            catalog_item_id,
            contracted_quantity: dec!(100),
            unit_price: dec!(12.5),
        }
    }

    #[tokio::test]
    async fn fresh_item_has_full_balance() {
        let (ledger, catalog) = seeded().await;
        let item = ledger.register_contract_item(line(catalog.id, 1)).await.unwrap();

        let balance = ledger.item_balance(item.id).await.unwrap();
        assert_eq!(balance.contracted, dec!(100));
        assert_eq!(balance.reserved, Decimal::ZERO);
        assert_eq!(balance.available, dec!(100));
    }

    #[tokio::test]
    async fn duplicate_sequence_in_contract_conflicts() {
        let (ledger, catalog) = seeded().await;
        ledger.register_contract_item(line(catalog.id, 1)).await.unwrap();

        let err = ledger.register_contract_item(line(catalog.id, 1)).await.unwrap_err();
        assert_matches!(err, ServiceError::Conflict(_));

        let mut other_contract = line(catalog.id, 1);
        other_contract.contract_id = 11;
        assert!(ledger.register_contract_item(other_contract).await.is_ok());
        assert_eq!(ledger.list_contract_items(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_lines_are_rejected() {
        let (ledger, catalog) = seeded().await;

        let mut zero = line(catalog.id, 1);
        zero.contracted_quantity = Decimal::ZERO;
        assert_matches!(
            ledger.register_contract_item(zero).await,
            Err(ServiceError::ValidationError(_))
        );

        assert_matches!(
            ledger.register_contract_item(line(9999, 2)).await,
            Err(ServiceError::NotFound(_))
        );
        assert_matches!(
            ledger.item_balance(4242).await,
            Err(ServiceError::NotFound(_))
        );
    }
}
