//! Delivery orders (AOCS) and the pending-delivery report.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, FromQueryResult, JoinType, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::db::DbPool;
use crate::entities::budget_line::Entity as BudgetLine;
use crate::entities::delivery_order::{self, Entity as DeliveryOrder};
use crate::entities::reservation::{self, ReservationStatus};
use crate::errors::{is_unique_violation, ServiceError};

const MAX_PAGE_SIZE: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateDeliveryOrderCommand {
    #[validate(length(min = 1, max = 64))]
    pub order_number: String,
    pub budget_line_id: Option<i32>,
    /// Defaults to now
    pub issued_at: Option<DateTime<Utc>>,
}

/// A delivery order that still expects deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDeliveryOrder {
    pub delivery_order_id: i32,
    pub order_number: String,
    pub issued_at: DateTime<Utc>,
    pub open_reservations: u64,
    pub days_elapsed: i64,
}

#[derive(Debug, FromQueryResult)]
struct PendingOrderRow {
    delivery_order_id: i32,
    order_number: String,
    issued_at: DateTime<Utc>,
    open_reservations: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDeliveryOrdersPage {
    pub items: Vec<PendingDeliveryOrder>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
}

#[derive(Clone)]
pub struct DeliveryOrderService {
    db_pool: Arc<DbPool>,
}

impl DeliveryOrderService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self))]
    pub async fn create_delivery_order(
        &self,
        command: CreateDeliveryOrderCommand,
    ) -> Result<delivery_order::Model, ServiceError> {
        command.validate()?;
        let db = &*self.db_pool;
        let order_number = command.order_number.trim().to_string();

        if let Some(budget_line_id) = command.budget_line_id {
            BudgetLine::find_by_id(budget_line_id)
                .one(db)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Budget line {} not found", budget_line_id))
                })?;
        }

        let mut model = delivery_order::ActiveModel {
            order_number: Set(order_number.clone()),
            budget_line_id: Set(command.budget_line_id),
            ..Default::default()
        };
        if let Some(issued_at) = command.issued_at {
            model.issued_at = Set(issued_at);
        }

        match model.insert(db).await {
            Ok(order) => {
                info!(
                    delivery_order_id = order.id,
                    order_number = %order.order_number,
                    "Delivery order created"
                );
                Ok(order)
            }
            Err(e) if is_unique_violation(&e) => {
                warn!(order_number = %order_number, "Duplicate delivery order number");
                Err(ServiceError::Conflict(format!(
                    "Delivery order {} already exists",
                    order_number
                )))
            }
            Err(e) => Err(ServiceError::db_error(e)),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_delivery_order(&self, id: i32) -> Result<delivery_order::Model, ServiceError> {
        DeliveryOrder::find_by_id(id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Delivery order {} not found", id)))
    }

    /// Delivery orders with at least one reservation that is neither delivered nor cancelled,
    /// oldest first. `page` starts at 1.
    #[instrument(skip(self))]
    pub async fn list_pending_delivery_orders(
        &self,
        page: u64,
        limit: u64,
    ) -> Result<PendingDeliveryOrdersPage, ServiceError> {
        if page == 0 {
            return Err(ServiceError::ValidationError("page starts at 1".to_string()));
        }
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(ServiceError::ValidationError(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        let db = &*self.db_pool;

        let paginator = DeliveryOrder::find()
            .select_only()
            .column_as(delivery_order::Column::Id, "delivery_order_id")
            .column(delivery_order::Column::OrderNumber)
            .column(delivery_order::Column::IssuedAt)
            .column_as(
                Expr::col((reservation::Entity, reservation::Column::Id)).count(),
                "open_reservations",
            )
            .join(JoinType::InnerJoin, delivery_order::Relation::Reservations.def())
            .filter(
                reservation::Column::Status
                    .is_in([ReservationStatus::Pending, ReservationStatus::PartialDelivery]),
            )
            .group_by(delivery_order::Column::Id)
            .group_by(delivery_order::Column::OrderNumber)
            .group_by(delivery_order::Column::IssuedAt)
            .order_by_asc(delivery_order::Column::IssuedAt)
            .order_by_asc(delivery_order::Column::Id)
            .into_model::<PendingOrderRow>()
            .paginate(db, limit);
        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let rows = paginator
            .fetch_page(page - 1)
            .await
            .map_err(ServiceError::db_error)?;

        let now = Utc::now();
        let items = rows
            .into_iter()
            .map(|row| PendingDeliveryOrder {
                open_reservations: u64::try_from(row.open_reservations).unwrap_or_default(),
                days_elapsed: (now - row.issued_at).num_days(),
                delivery_order_id: row.delivery_order_id,
                order_number: row.order_number,
                issued_at: row.issued_at,
            })
            .collect();

        Ok(PendingDeliveryOrdersPage {
            items,
            total,
            page,
            limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_db;
    use assert_matches::assert_matches;
    use chrono::Duration;

    fn order(number: &str) -> CreateDeliveryOrderCommand {
        CreateDeliveryOrderCommand {
            order_number: number.to_string(),
            budget_line_id: None,
            issued_at: None,
        }
    }

    #[tokio::test]
    async fn order_numbers_are_unique() {
        let service = DeliveryOrderService::new(test_db().await);
        let created = service.create_delivery_order(order("AOCS-001/2024")).await.unwrap();
        assert_eq!(
            service.get_delivery_order(created.id).await.unwrap().order_number,
            "AOCS-001/2024"
        );
        assert_matches!(
            service.create_delivery_order(order(" AOCS-001/2024 ")).await,
            Err(ServiceError::Conflict(_))
        );
    }

    #[tokio::test]
    async fn unknown_budget_line_is_rejected() {
        let service = DeliveryOrderService::new(test_db().await);
        let mut cmd = order("AOCS-002/2024");
        cmd.budget_line_id = Some(77);
        assert_matches!(
            service.create_delivery_order(cmd).await,
            Err(ServiceError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn pending_report_without_open_reservations_is_empty() {
        let service = DeliveryOrderService::new(test_db().await);
        let mut cmd = order("AOCS-003/2024");
        cmd.issued_at = Some(Utc::now() - Duration::days(3));
        service.create_delivery_order(cmd).await.unwrap();

        let page = service.list_pending_delivery_orders(1, 20).await.unwrap();
        assert_eq!(page.total, 0);
        assert!(page.items.is_empty());

        assert_matches!(
            service.list_pending_delivery_orders(0, 20).await,
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            service.list_pending_delivery_orders(1, 500).await,
            Err(ServiceError::ValidationError(_))
        );
    }
}
