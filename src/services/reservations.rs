//! Reservation Engine
//!
//! Every reservation (Pedido) draws on the balance of one contract item. The read of the
//! already-reserved total and the insert of the new row happen under a per-item lock and inside
//! one transaction, so the sum of non-cancelled requested quantities never exceeds the
//! contracted quantity, however many callers race on the same item.

use metrics::{counter, histogram};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbBackend, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use validator::Validate;

use super::contract_ledger::reserved_quantity;
use super::validate_positive_quantity;
use crate::db::{with_transaction, DbPool, ItemLocks};
use crate::entities::contract_item::{self, Entity as ContractItem};
use crate::entities::delivery_order::Entity as DeliveryOrder;
use crate::entities::reservation::{self, Entity as Reservation, ReservationStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Request for quantity against a contract item under a delivery order.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReserveCommand {
    pub contract_item_id: i32,
    pub delivery_order_id: i32,
    #[validate(custom = "validate_positive_quantity")]
    pub requested_quantity: Decimal,
}

#[derive(Clone)]
pub struct ReservationService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    item_locks: ItemLocks,
}

impl ReservationService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender, item_locks: ItemLocks) -> Self {
        Self {
            db_pool,
            event_sender,
            item_locks,
        }
    }

    /// Reserves quantity against a contract item.
    ///
    /// Fails with `InsufficientBalance` carrying the quantity still available when the request
    /// does not fit.
    #[instrument(skip(self))]
    pub async fn reserve(&self, command: ReserveCommand) -> Result<reservation::Model, ServiceError> {
        command.validate().map_err(|e| {
            counter!("procurement_reservations.failures", 1, "reason" => "validation");
            ServiceError::from(e)
        })?;

        let start = Instant::now();
        let _guard = self.item_locks.lock(command.contract_item_id).await;

        let ReserveCommand {
            contract_item_id,
            delivery_order_id,
            requested_quantity,
        } = command;

        let result = with_transaction(&self.db_pool, "reserve", move |txn| {
            Box::pin(async move {
                let item = load_item_for_update(txn, contract_item_id).await?;
                if !item.is_active {
                    return Err(ServiceError::ValidationError(format!(
                        "Contract item {} is inactive",
                        contract_item_id
                    )));
                }

                DeliveryOrder::find_by_id(delivery_order_id)
                    .one(txn)
                    .await
                    .map_err(ServiceError::db_error)?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!(
                            "Delivery order {} not found",
                            delivery_order_id
                        ))
                    })?;

                let already_reserved = reserved_quantity(txn, contract_item_id, None)
                    .await
                    .map_err(ServiceError::db_error)?;
                let available = item.contracted_quantity - already_reserved;
                if requested_quantity > available {
                    return Err(ServiceError::InsufficientBalance {
                        contract_item_id,
                        requested: requested_quantity,
                        available: available.max(Decimal::ZERO),
                    });
                }

                reservation::ActiveModel {
                    contract_item_id: Set(contract_item_id),
                    delivery_order_id: Set(delivery_order_id),
                    requested_quantity: Set(requested_quantity),
                    delivered_quantity: Set(Decimal::ZERO),
                    status: Set(ReservationStatus::Pending),
                    ..Default::default()
                }
                .insert(txn)
                .await
                .map_err(ServiceError::db_error)
            })
        })
        .await;

        histogram!("procurement_reservations.reserve_duration", start.elapsed());

        match result {
            Ok(created) => {
                counter!("procurement_reservations.created", 1);
                info!(
                    reservation_id = created.id,
                    contract_item_id,
                    requested_quantity = %requested_quantity,
                    "Reservation created"
                );
                self.event_sender
                    .send_or_log(Event::ReservationCreated {
                        reservation_id: created.id,
                        contract_item_id,
                        delivery_order_id,
                        requested_quantity,
                    })
                    .await;
                Ok(created)
            }
            Err(e) => {
                let reason = match &e {
                    ServiceError::InsufficientBalance { .. } => "insufficient_balance",
                    ServiceError::NotFound(_) => "not_found",
                    ServiceError::ValidationError(_) => "validation",
                    _ => "infrastructure",
                };
                counter!("procurement_reservations.failures", 1, "reason" => reason);
                warn!(contract_item_id, error = %e, "Reservation rejected");
                Err(e)
            }
        }
    }

    /// Cancels a reservation, releasing its quantity. The row is kept.
    ///
    /// Cancelling twice is a no-op. Reservations with recorded deliveries cannot be cancelled.
    #[instrument(skip(self))]
    pub async fn cancel(&self, reservation_id: i32) -> Result<reservation::Model, ServiceError> {
        let current = self.get_reservation(reservation_id).await?;
        let _guard = self.item_locks.lock(current.contract_item_id).await;

        let (cancelled, changed) = with_transaction(&self.db_pool, "cancel_reservation", move |txn| {
            Box::pin(async move {
                let current = load_reservation_for_update(txn, reservation_id).await?;

                if current.status == ReservationStatus::Cancelled {
                    return Ok((current, false));
                }
                if current.delivered_quantity > Decimal::ZERO {
                    return Err(ServiceError::Conflict(format!(
                        "Reservation {} already has {} delivered and cannot be cancelled",
                        reservation_id, current.delivered_quantity
                    )));
                }

                let mut active: reservation::ActiveModel = current.into();
                active.status = Set(ReservationStatus::Cancelled);
                let updated = active.update(txn).await.map_err(ServiceError::db_error)?;
                Ok((updated, true))
            })
        })
        .await?;

        if changed {
            counter!("procurement_reservations.cancelled", 1);
            info!(reservation_id, "Reservation cancelled");
            self.event_sender
                .send_or_log(Event::ReservationCancelled {
                    reservation_id,
                    contract_item_id: cancelled.contract_item_id,
                    released_quantity: cancelled.requested_quantity,
                })
                .await;
        }
        Ok(cancelled)
    }

    #[instrument(skip(self))]
    pub async fn get_reservation(&self, reservation_id: i32) -> Result<reservation::Model, ServiceError> {
        Reservation::find_by_id(reservation_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or(ServiceError::ReservationNotFound(reservation_id))
    }

    #[instrument(skip(self))]
    pub async fn list_by_delivery_order(
        &self,
        delivery_order_id: i32,
    ) -> Result<Vec<reservation::Model>, ServiceError> {
        Reservation::find()
            .filter(reservation::Column::DeliveryOrderId.eq(delivery_order_id))
            .order_by_asc(reservation::Column::Id)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Changes the requested quantity of a live reservation, re-checking the contract cap with
    /// the reservation's own previous quantity left out.
    #[instrument(skip(self))]
    pub async fn update_requested_quantity(
        &self,
        reservation_id: i32,
        requested_quantity: Decimal,
    ) -> Result<reservation::Model, ServiceError> {
        if requested_quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "Requested quantity must be greater than zero, got {}",
                requested_quantity
            )));
        }

        let current = self.get_reservation(reservation_id).await?;
        let contract_item_id = current.contract_item_id;
        let _guard = self.item_locks.lock(contract_item_id).await;

        let updated = with_transaction(&self.db_pool, "update_reservation_quantity", move |txn| {
            Box::pin(async move {
                let current = load_reservation_for_update(txn, reservation_id).await?;

                if current.status == ReservationStatus::Cancelled {
                    return Err(ServiceError::ValidationError(format!(
                        "Reservation {} is cancelled",
                        reservation_id
                    )));
                }
                if requested_quantity < current.delivered_quantity {
                    return Err(ServiceError::ValidationError(format!(
                        "Reservation {} already has {} delivered; requested quantity cannot be lower",
                        reservation_id, current.delivered_quantity
                    )));
                }

                let item = load_item_for_update(txn, contract_item_id).await?;
                let reserved_by_others =
                    reserved_quantity(txn, contract_item_id, Some(reservation_id))
                        .await
                        .map_err(ServiceError::db_error)?;
                let available = item.contracted_quantity - reserved_by_others;
                if requested_quantity > available {
                    return Err(ServiceError::InsufficientBalance {
                        contract_item_id,
                        requested: requested_quantity,
                        available: available.max(Decimal::ZERO),
                    });
                }

                let status = ReservationStatus::after_delivery(
                    current.status,
                    requested_quantity,
                    current.delivered_quantity,
                );
                let mut active: reservation::ActiveModel = current.into();
                active.requested_quantity = Set(requested_quantity);
                active.status = Set(status);
                active.update(txn).await.map_err(ServiceError::db_error)
            })
        })
        .await?;

        info!(
            reservation_id,
            requested_quantity = %requested_quantity,
            "Reservation quantity updated"
        );
        Ok(updated)
    }

    /// Removes a reservation row. Rows with delivered quantity are kept unless `force` is set.
    #[instrument(skip(self))]
    pub async fn delete_reservation(&self, reservation_id: i32, force: bool) -> Result<(), ServiceError> {
        let current = self.get_reservation(reservation_id).await?;
        let _guard = self.item_locks.lock(current.contract_item_id).await;

        with_transaction(&self.db_pool, "delete_reservation", move |txn| {
            Box::pin(async move {
                let current = load_reservation_for_update(txn, reservation_id).await?;
                if current.delivered_quantity > Decimal::ZERO && !force {
                    warn!(reservation_id, "Refusing to delete reservation with deliveries");
                    return Err(ServiceError::Conflict(format!(
                        "Reservation {} has {} delivered; deletion requires force",
                        reservation_id, current.delivered_quantity
                    )));
                }
                Reservation::delete_by_id(reservation_id)
                    .exec(txn)
                    .await
                    .map_err(ServiceError::db_error)?;
                Ok(())
            })
        })
        .await?;
        info!(reservation_id, force, "Reservation deleted");
        Ok(())
    }
}

/// Reads a reservation inside a transaction, taking a row lock where the backend has one.
pub(crate) async fn load_reservation_for_update<C>(
    conn: &C,
    reservation_id: i32,
) -> Result<reservation::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let mut query = Reservation::find_by_id(reservation_id);
    if conn.get_database_backend() != DbBackend::Sqlite {
        query = query.lock_exclusive();
    }
    query
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or(ServiceError::ReservationNotFound(reservation_id))
}

/// Reads the contract item, taking a row lock where the backend has one.
async fn load_item_for_update<C>(conn: &C, contract_item_id: i32) -> Result<contract_item::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let mut query = ContractItem::find_by_id(contract_item_id);
    if conn.get_database_backend() != DbBackend::Sqlite {
        query = query.lock_exclusive();
    }
    query
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("Contract item {} not found", contract_item_id))
        })
}
