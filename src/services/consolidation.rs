//! Consolidation Engine
//!
//! Folds the items of several demand documents into one technical study (ETP), one
//! consolidated item per distinct catalog item. The result is a snapshot: unlinking a document
//! later does not shrink the consolidated quantities.

use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait,
    QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

use super::{money, validate_non_negative};
use crate::db::{with_transaction, DbPool};
use crate::entities::consolidated_item::{self, Entity as ConsolidatedItem};
use crate::entities::demand_document::{self, DemandDocumentStatus, Entity as DemandDocument};
use crate::entities::demand_item::{self, Entity as DemandItem};
use crate::entities::technical_study::{self, Entity as TechnicalStudy};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidateCommand {
    /// Defaults to a title naming the documents
    pub title: Option<String>,
    pub demand_document_ids: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReferencePriceUpdate {
    pub consolidated_item_id: i32,
    #[validate(custom = "validate_non_negative")]
    pub reference_unit_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnicalStudyDetails {
    pub study: technical_study::Model,
    pub items: Vec<consolidated_item::Model>,
    pub demand_document_ids: Vec<i32>,
}

impl TechnicalStudyDetails {
    pub fn quantity_of(&self, catalog_item_id: i32) -> Option<Decimal> {
        self.items
            .iter()
            .find(|i| i.catalog_item_id == catalog_item_id)
            .map(|i| i.quantity)
    }
}

#[derive(Clone)]
pub struct ConsolidationService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
}

impl ConsolidationService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Creates a technical study from a set of unlinked demand documents.
    ///
    /// Either every document is linked and every quantity summed, or nothing changes. Duplicate
    /// ids in the request count once.
    #[instrument(skip(self))]
    pub async fn consolidate(
        &self,
        command: ConsolidateCommand,
    ) -> Result<TechnicalStudyDetails, ServiceError> {
        let ids: BTreeSet<i32> = command.demand_document_ids.iter().copied().collect();
        if ids.is_empty() {
            return Err(ServiceError::ValidationError(
                "At least one demand document is required".to_string(),
            ));
        }
        let ids: Vec<i32> = ids.into_iter().collect();
        let title = command
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| default_title(&ids));

        let txn_ids = ids.clone();
        let result = with_transaction(&self.db_pool, "consolidate", move |txn| {
            let title = title.clone();
            let txn_ids = txn_ids.clone();
            Box::pin(async move {
                let documents = DemandDocument::find()
                    .filter(demand_document::Column::Id.is_in(txn_ids.iter().copied()))
                    .all(txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                for id in &txn_ids {
                    let document = documents
                        .iter()
                        .find(|d| d.id == *id)
                        .ok_or(ServiceError::DemandDocumentNotFound(*id))?;
                    if let Some(technical_study_id) = document.technical_study_id {
                        return Err(ServiceError::AlreadyLinked {
                            demand_document_id: *id,
                            technical_study_id,
                        });
                    }
                }

                let study = technical_study::ActiveModel {
                    title: Set(title),
                    is_active: Set(true),
                    ..Default::default()
                }
                .insert(txn)
                .await
                .map_err(ServiceError::db_error)?;

                for id in &txn_ids {
                    link_document(txn, *id, study.id).await?;
                }

                let demand_items = DemandItem::find()
                    .filter(demand_item::Column::DemandDocumentId.is_in(txn_ids.iter().copied()))
                    .all(txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                let totals = sum_by_catalog_item(&demand_items);

                let mut items = Vec::with_capacity(totals.len());
                for (catalog_item_id, quantity) in totals {
                    let item = consolidated_item::ActiveModel {
                        technical_study_id: Set(study.id),
                        catalog_item_id: Set(catalog_item_id),
                        quantity: Set(quantity),
                        reference_unit_price: Set(Decimal::ZERO),
                        total: Set(Decimal::ZERO),
                        ..Default::default()
                    }
                    .insert(txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                    items.push(item);
                }

                Ok(TechnicalStudyDetails {
                    study,
                    items,
                    demand_document_ids: txn_ids,
                })
            })
        })
        .await;

        let details = result.map_err(|e| {
            warn!(documents = ?ids, error = %e, "Consolidation rejected");
            e
        })?;

        info!(
            technical_study_id = details.study.id,
            documents = ?details.demand_document_ids,
            item_count = details.items.len(),
            "Technical study consolidated"
        );
        self.event_sender
            .send_or_log(Event::StudyConsolidated {
                technical_study_id: details.study.id,
                demand_document_ids: details.demand_document_ids.clone(),
                item_count: details.items.len(),
            })
            .await;
        Ok(details)
    }

    /// Releases one document from a study. Consolidated quantities are left as they are.
    #[instrument(skip(self))]
    pub async fn unlink(
        &self,
        technical_study_id: i32,
        demand_document_id: i32,
    ) -> Result<demand_document::Model, ServiceError> {
        let document = with_transaction(&self.db_pool, "unlink_demand_document", move |txn| {
            Box::pin(async move {
                load_active_study(txn, technical_study_id).await?;
                let document = DemandDocument::find_by_id(demand_document_id)
                    .one(txn)
                    .await
                    .map_err(ServiceError::db_error)?
                    .ok_or(ServiceError::DemandDocumentNotFound(demand_document_id))?;

                if document.technical_study_id != Some(technical_study_id) {
                    return Err(ServiceError::ValidationError(format!(
                        "Demand document {} is not linked to technical study {}",
                        demand_document_id, technical_study_id
                    )));
                }

                let mut active: demand_document::ActiveModel = document.into();
                active.technical_study_id = Set(None);
                active.status = Set(DemandDocumentStatus::Draft);
                active.update(txn).await.map_err(ServiceError::db_error)
            })
        })
        .await?;

        info!(technical_study_id, demand_document_id, "Demand document unlinked");
        self.event_sender
            .send_or_log(Event::DemandDocumentUnlinked {
                technical_study_id,
                demand_document_id,
            })
            .await;
        Ok(document)
    }

    /// Deletes a study: its consolidated items go, its documents return to draft and the study
    /// row is kept inactive.
    #[instrument(skip(self))]
    pub async fn delete_study(&self, technical_study_id: i32) -> Result<Vec<i32>, ServiceError> {
        let released = with_transaction(&self.db_pool, "delete_technical_study", move |txn| {
            Box::pin(async move {
                let study = load_active_study(txn, technical_study_id).await?;

                ConsolidatedItem::delete_many()
                    .filter(consolidated_item::Column::TechnicalStudyId.eq(technical_study_id))
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                let released: Vec<i32> = study
                    .find_related(DemandDocument)
                    .order_by_asc(demand_document::Column::Id)
                    .all(txn)
                    .await
                    .map_err(ServiceError::db_error)?
                    .into_iter()
                    .map(|d| d.id)
                    .collect();

                DemandDocument::update_many()
                    .col_expr(
                        demand_document::Column::TechnicalStudyId,
                        Expr::value(Option::<i32>::None),
                    )
                    .col_expr(
                        demand_document::Column::Status,
                        Expr::value(DemandDocumentStatus::Draft.to_value()),
                    )
                    .col_expr(demand_document::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
                    .filter(demand_document::Column::TechnicalStudyId.eq(technical_study_id))
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                let mut active: technical_study::ActiveModel = study.into();
                active.is_active = Set(false);
                active.update(txn).await.map_err(ServiceError::db_error)?;

                Ok(released)
            })
        })
        .await?;

        info!(technical_study_id, released = ?released, "Technical study deleted");
        self.event_sender
            .send_or_log(Event::StudyDeleted {
                technical_study_id,
                released_documents: released.clone(),
            })
            .await;
        Ok(released)
    }

    #[instrument(skip(self))]
    pub async fn get_study(&self, technical_study_id: i32) -> Result<TechnicalStudyDetails, ServiceError> {
        let db = &*self.db_pool;
        let study = load_active_study(db, technical_study_id).await?;
        study_details(db, study).await
    }

    /// The active study a demand document is linked to, if any.
    #[instrument(skip(self))]
    pub async fn find_study_by_demand_document(
        &self,
        demand_document_id: i32,
    ) -> Result<Option<TechnicalStudyDetails>, ServiceError> {
        let db = &*self.db_pool;
        let document = DemandDocument::find_by_id(demand_document_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or(ServiceError::DemandDocumentNotFound(demand_document_id))?;

        let Some(study_id) = document.technical_study_id else {
            return Ok(None);
        };
        let study = TechnicalStudy::find_by_id(study_id)
            .filter(technical_study::Column::IsActive.eq(true))
            .one(db)
            .await
            .map_err(ServiceError::db_error)?;
        match study {
            Some(study) => Ok(Some(study_details(db, study).await?)),
            None => Ok(None),
        }
    }

    /// Sets reference unit prices on consolidated items and recomputes their totals.
    #[instrument(skip(self, updates), fields(updates = updates.len()))]
    pub async fn update_reference_prices(
        &self,
        technical_study_id: i32,
        updates: Vec<ReferencePriceUpdate>,
    ) -> Result<TechnicalStudyDetails, ServiceError> {
        for update in &updates {
            update.validate()?;
        }

        with_transaction(&self.db_pool, "update_reference_prices", move |txn| {
            let updates = updates.clone();
            Box::pin(async move {
                load_active_study(txn, technical_study_id).await?;

                for update in &updates {
                    let item = ConsolidatedItem::find_by_id(update.consolidated_item_id)
                        .one(txn)
                        .await
                        .map_err(ServiceError::db_error)?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Consolidated item {} not found",
                                update.consolidated_item_id
                            ))
                        })?;
                    if item.technical_study_id != technical_study_id {
                        return Err(ServiceError::ValidationError(format!(
                            "Consolidated item {} belongs to technical study {}, not {}",
                            item.id, item.technical_study_id, technical_study_id
                        )));
                    }

                    let total = money(item.quantity * update.reference_unit_price);
                    let mut active: consolidated_item::ActiveModel = item.into();
                    active.reference_unit_price = Set(update.reference_unit_price);
                    active.total = Set(total);
                    active.update(txn).await.map_err(ServiceError::db_error)?;
                }
                Ok(())
            })
        })
        .await?;

        info!(technical_study_id, "Reference prices updated");
        self.get_study(technical_study_id).await
    }
}

fn default_title(ids: &[i32]) -> String {
    let joined: Vec<String> = ids.iter().map(i32::to_string).collect();
    format!("Technical study for demand documents {}", joined.join(", "))
}

/// Quantities summed per catalog item, exact decimal arithmetic.
fn sum_by_catalog_item(items: &[demand_item::Model]) -> BTreeMap<i32, Decimal> {
    let mut totals = BTreeMap::new();
    for item in items {
        *totals.entry(item.catalog_item_id).or_insert(Decimal::ZERO) += item.quantity;
    }
    totals
}

/// Links a document only if it is still unlinked, so two consolidations racing on the same
/// document cannot both claim it.
async fn link_document<C>(conn: &C, demand_document_id: i32, technical_study_id: i32) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    let result = DemandDocument::update_many()
        .col_expr(
            demand_document::Column::TechnicalStudyId,
            Expr::value(technical_study_id),
        )
        .col_expr(
            demand_document::Column::Status,
            Expr::value(DemandDocumentStatus::InStudy.to_value()),
        )
        .col_expr(demand_document::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
        .filter(demand_document::Column::Id.eq(demand_document_id))
        .filter(demand_document::Column::TechnicalStudyId.is_null())
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    if result.rows_affected == 1 {
        return Ok(());
    }

    let current = DemandDocument::find_by_id(demand_document_id)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or(ServiceError::DemandDocumentNotFound(demand_document_id))?;
    Err(ServiceError::AlreadyLinked {
        demand_document_id,
        technical_study_id: current.technical_study_id.unwrap_or(technical_study_id),
    })
}

async fn load_active_study<C>(conn: &C, technical_study_id: i32) -> Result<technical_study::Model, ServiceError>
where
    C: ConnectionTrait,
{
    TechnicalStudy::find_by_id(technical_study_id)
        .filter(technical_study::Column::IsActive.eq(true))
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Technical study {} not found", technical_study_id))
        })
}

async fn study_details<C>(conn: &C, study: technical_study::Model) -> Result<TechnicalStudyDetails, ServiceError>
where
    C: ConnectionTrait,
{
    let items = study
        .find_related(ConsolidatedItem)
        .order_by_asc(consolidated_item::Column::CatalogItemId)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;
    let demand_document_ids = study
        .find_related(DemandDocument)
        .order_by_asc(demand_document::Column::Id)
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?
        .into_iter()
        .map(|d| d.id)
        .collect();

    Ok(TechnicalStudyDetails {
        study,
        items,
        demand_document_ids,
    })
}
