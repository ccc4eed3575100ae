//! Demand Item Store
//!
//! Demand documents (DFD) and their line items. Items are created with their document, removed
//! with it, and frozen once the document is linked into a technical study.

use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbBackend, EntityTrait, ModelTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

use super::{money, validate_non_negative, validate_positive_quantity};
use crate::db::{with_transaction, DbPool};
use crate::entities::catalog_item::{self, Entity as CatalogItem};
use crate::entities::demand_document::{self, DemandDocumentStatus, Entity as DemandDocument};
use crate::entities::demand_item::{self, Entity as DemandItem};
use crate::errors::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DemandItemInput {
    pub catalog_item_id: i32,
    #[validate(custom = "validate_positive_quantity")]
    pub quantity: Decimal,
    #[validate(custom = "validate_non_negative")]
    pub estimated_unit_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateDemandDocumentCommand {
    #[validate(length(min = 1, max = 128))]
    pub reference: String,
    pub requesting_unit_id: Option<i32>,
    pub items: Vec<DemandItemInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ItemPriceUpdate {
    pub demand_item_id: i32,
    #[validate(custom = "validate_non_negative")]
    pub estimated_unit_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandDocumentDetails {
    pub document: demand_document::Model,
    pub items: Vec<demand_item::Model>,
}

impl DemandDocumentDetails {
    pub fn estimated_total(&self) -> Decimal {
        self.items.iter().map(|i| i.estimated_total).sum()
    }
}

#[derive(Clone)]
pub struct DemandDocumentService {
    db_pool: Arc<DbPool>,
}

impl DemandDocumentService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Creates a draft document together with its items.
    #[instrument(skip(self, command), fields(reference = %command.reference, items = command.items.len()))]
    pub async fn create_demand_document(
        &self,
        command: CreateDemandDocumentCommand,
    ) -> Result<DemandDocumentDetails, ServiceError> {
        command.validate()?;
        validate_items(&command.items)?;

        let details = with_transaction(&self.db_pool, "create_demand_document", move |txn| {
            let command = command.clone();
            Box::pin(async move {
                ensure_catalog_items_exist(txn, &command.items).await?;

                let document = demand_document::ActiveModel {
                    reference: Set(command.reference.trim().to_string()),
                    requesting_unit_id: Set(command.requesting_unit_id),
                    technical_study_id: Set(None),
                    status: Set(DemandDocumentStatus::Draft),
                    ..Default::default()
                }
                .insert(txn)
                .await
                .map_err(ServiceError::db_error)?;

                let items = insert_items(txn, document.id, &command.items).await?;
                Ok(DemandDocumentDetails { document, items })
            })
        })
        .await?;

        info!(
            demand_document_id = details.document.id,
            item_count = details.items.len(),
            "Demand document created"
        );
        Ok(details)
    }

    #[instrument(skip(self))]
    pub async fn get_demand_document(&self, id: i32) -> Result<DemandDocumentDetails, ServiceError> {
        let db = &*self.db_pool;
        let document = DemandDocument::find_by_id(id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or(ServiceError::DemandDocumentNotFound(id))?;
        let items = document
            .find_related(DemandItem)
            .order_by_asc(demand_item::Column::Id)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(DemandDocumentDetails { document, items })
    }

    /// Swaps the whole item list of a draft document.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn replace_items(
        &self,
        id: i32,
        items: Vec<DemandItemInput>,
    ) -> Result<DemandDocumentDetails, ServiceError> {
        validate_items(&items)?;

        let details = with_transaction(&self.db_pool, "replace_demand_items", move |txn| {
            let items = items.clone();
            Box::pin(async move {
                let document = load_editable(txn, id).await?;
                ensure_catalog_items_exist(txn, &items).await?;

                DemandItem::delete_many()
                    .filter(demand_item::Column::DemandDocumentId.eq(id))
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                let items = insert_items(txn, id, &items).await?;

                // Saving refreshes updated_at.
                let active: demand_document::ActiveModel = document.into();
                let document = active.update(txn).await.map_err(ServiceError::db_error)?;
                Ok(DemandDocumentDetails { document, items })
            })
        })
        .await?;

        info!(demand_document_id = id, item_count = details.items.len(), "Demand items replaced");
        Ok(details)
    }

    /// Updates estimated unit prices and the derived totals of a draft document's items.
    #[instrument(skip(self, updates), fields(updates = updates.len()))]
    pub async fn update_item_prices(
        &self,
        id: i32,
        updates: Vec<ItemPriceUpdate>,
    ) -> Result<DemandDocumentDetails, ServiceError> {
        for update in &updates {
            update.validate()?;
        }

        with_transaction(&self.db_pool, "update_demand_item_prices", move |txn| {
            let updates = updates.clone();
            Box::pin(async move {
                load_editable(txn, id).await?;

                for update in &updates {
                    let item = DemandItem::find_by_id(update.demand_item_id)
                        .filter(demand_item::Column::DemandDocumentId.eq(id))
                        .one(txn)
                        .await
                        .map_err(ServiceError::db_error)?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Demand item {} not found in demand document {}",
                                update.demand_item_id, id
                            ))
                        })?;

                    let total = money(item.quantity * update.estimated_unit_price);
                    let mut active: demand_item::ActiveModel = item.into();
                    active.estimated_unit_price = Set(update.estimated_unit_price);
                    active.estimated_total = Set(total);
                    active.update(txn).await.map_err(ServiceError::db_error)?;
                }
                Ok(())
            })
        })
        .await?;

        info!(demand_document_id = id, "Demand item prices updated");
        self.get_demand_document(id).await
    }

    /// Deletes a draft document and its items. Linked documents must be unlinked first.
    #[instrument(skip(self))]
    pub async fn delete_demand_document(&self, id: i32) -> Result<(), ServiceError> {
        with_transaction(&self.db_pool, "delete_demand_document", move |txn| {
            Box::pin(async move {
                let document = load_editable(txn, id).await?;
                DemandItem::delete_many()
                    .filter(demand_item::Column::DemandDocumentId.eq(id))
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                document.delete(txn).await.map_err(ServiceError::db_error)?;
                Ok(())
            })
        })
        .await?;

        info!(demand_document_id = id, "Demand document deleted");
        Ok(())
    }

    /// Draft documents not yet linked to any technical study.
    #[instrument(skip(self))]
    pub async fn list_unlinked(&self) -> Result<Vec<demand_document::Model>, ServiceError> {
        DemandDocument::find()
            .filter(demand_document::Column::TechnicalStudyId.is_null())
            .order_by_asc(demand_document::Column::Id)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }
}

fn validate_items(items: &[DemandItemInput]) -> Result<(), ServiceError> {
    for (position, item) in items.iter().enumerate() {
        item.validate().map_err(|e| {
            ServiceError::ValidationError(format!("Item {}: {}", position + 1, e))
        })?;
    }
    Ok(())
}

/// Loads a document that may still be edited, failing with `AlreadyLinked` once it belongs to a
/// technical study. The row stays locked until the caller's transaction ends, where the backend
/// supports row locks, so a consolidation cannot link it halfway through an edit.
async fn load_editable<C>(conn: &C, id: i32) -> Result<demand_document::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let mut query = DemandDocument::find_by_id(id);
    if conn.get_database_backend() != DbBackend::Sqlite {
        query = query.lock_exclusive();
    }
    let document = query
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or(ServiceError::DemandDocumentNotFound(id))?;

    if let Some(technical_study_id) = document.technical_study_id {
        warn!(demand_document_id = id, technical_study_id, "Demand document is linked");
        return Err(ServiceError::AlreadyLinked {
            demand_document_id: id,
            technical_study_id,
        });
    }
    Ok(document)
}

async fn ensure_catalog_items_exist<C>(conn: &C, items: &[DemandItemInput]) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let wanted: BTreeSet<i32> = items.iter().map(|i| i.catalog_item_id).collect();
    if wanted.is_empty() {
        return Ok(());
    }

    let found: BTreeSet<i32> = CatalogItem::find()
        .filter(catalog_item::Column::Id.is_in(wanted.iter().copied()))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|c| c.id)
        .collect();

    match wanted.difference(&found).next() {
        Some(missing) => Err(ServiceError::NotFound(format!(
            "Catalog item {} not found",
            missing
        ))),
        None => Ok(()),
    }
}

async fn insert_items<C>(
    conn: &C,
    demand_document_id: i32,
    items: &[DemandItemInput],
) -> Result<Vec<demand_item::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    let mut created = Vec::with_capacity(items.len());
    for item in items {
        let model = demand_item::ActiveModel {
            demand_document_id: Set(demand_document_id),
            catalog_item_id: Set(item.catalog_item_id),
            quantity: Set(item.quantity),
            estimated_unit_price: Set(item.estimated_unit_price),
            estimated_total: Set(money(item.quantity * item.estimated_unit_price)),
            ..Default::default()
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;
        created.push(model);
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::catalog_item::CatalogItemType;
    use crate::services::contract_ledger::{ContractLedgerService, RegisterCatalogItemCommand};
    use crate::services::test_support::test_db;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    async fn setup() -> (DemandDocumentService, i32) {
        let db = test_db().await;
        let catalog = ContractLedgerService::new(db.clone())
            .register_catalog_item(RegisterCatalogItemCommand {
                name: "Seringa 5ml".into(),
                unit_of_measure: "UN".into(),
                item_type: CatalogItemType::Material,
                taxonomy_code: None,
            })
            .await
            .unwrap();
        (DemandDocumentService::new(db), catalog.id)
    }

    fn item(catalog_item_id: i32, quantity: Decimal, price: Decimal) -> DemandItemInput {
        DemandItemInput {
            catalog_item_id,
            quantity,
            estimated_unit_price: price,
        }
    }

    #[tokio::test]
    async fn create_computes_item_totals() {
        let (service, catalog_id) = setup().await;
        let created = service
            .create_demand_document(CreateDemandDocumentCommand {
                reference: "DFD 12/2024".into(),
                requesting_unit_id: None,
                items: vec![item(catalog_id, dec!(10), dec!(2.5))],
            })
            .await
            .unwrap();

        assert_eq!(created.document.status, DemandDocumentStatus::Draft);
        assert_eq!(created.items.len(), 1);
        assert_eq!(created.items[0].estimated_total, dec!(25));
        assert_eq!(created.estimated_total(), dec!(25));

        let loaded = service.get_demand_document(created.document.id).await.unwrap();
        assert_eq!(loaded.items.len(), 1);
    }

    #[tokio::test]
    async fn invalid_items_create_nothing() {
        let (service, catalog_id) = setup().await;

        let err = service
            .create_demand_document(CreateDemandDocumentCommand {
                reference: "DFD 13/2024".into(),
                requesting_unit_id: None,
                items: vec![item(catalog_id, dec!(1), dec!(1)), item(999, dec!(1), dec!(1))],
            })
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::NotFound(_));

        let err = service
            .create_demand_document(CreateDemandDocumentCommand {
                reference: "DFD 14/2024".into(),
                requesting_unit_id: None,
                items: vec![item(catalog_id, dec!(0), dec!(1))],
            })
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));

        assert!(service.list_unlinked().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_and_reprice_items() {
        let (service, catalog_id) = setup().await;
        let created = service
            .create_demand_document(CreateDemandDocumentCommand {
                reference: "DFD 15/2024".into(),
                requesting_unit_id: None,
                items: vec![item(catalog_id, dec!(1), dec!(1))],
            })
            .await
            .unwrap();
        let id = created.document.id;

        let replaced = service
            .replace_items(id, vec![item(catalog_id, dec!(4), dec!(0)), item(catalog_id, dec!(6), dec!(0))])
            .await
            .unwrap();
        assert_eq!(replaced.items.len(), 2);

        let repriced = service
            .update_item_prices(
                id,
                vec![ItemPriceUpdate {
                    demand_item_id: replaced.items[0].id,
                    estimated_unit_price: dec!(3),
                }],
            )
            .await
            .unwrap();
        assert_eq!(repriced.items[0].estimated_total, dec!(12));
        assert_eq!(repriced.items[1].estimated_total, Decimal::ZERO);
    }

    #[tokio::test]
    async fn delete_removes_items() {
        let (service, catalog_id) = setup().await;
        let created = service
            .create_demand_document(CreateDemandDocumentCommand {
                reference: "DFD 16/2024".into(),
                requesting_unit_id: None,
                items: vec![item(catalog_id, dec!(2), dec!(1))],
            })
            .await
            .unwrap();

        service.delete_demand_document(created.document.id).await.unwrap();
        assert_matches!(
            service.get_demand_document(created.document.id).await,
            Err(ServiceError::DemandDocumentNotFound(_))
        );
        assert_matches!(
            service.delete_demand_document(created.document.id).await,
            Err(ServiceError::DemandDocumentNotFound(_))
        );
    }
}
