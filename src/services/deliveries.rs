//! Delivery Fulfilment Tracker
//!
//! Accumulates delivered quantities on reservations and derives their status. A batch (one
//! delivery note covering several reservations) is applied all-or-nothing.

use chrono::{NaiveDate, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

use super::reservations::load_reservation_for_update;
use super::validate_non_negative;
use crate::config::OverDeliveryPolicy;
use crate::db::{with_transaction, DbPool, ItemLocks};
use crate::entities::reservation::{self, Entity as Reservation, ReservationStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RecordDeliveryCommand {
    pub reservation_id: i32,
    #[validate(custom = "validate_non_negative")]
    pub quantity: Decimal,
    #[validate(length(max = 64))]
    pub note_number: Option<String>,
    pub delivery_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BatchDeliveryItem {
    pub reservation_id: i32,
    #[validate(custom = "validate_non_negative")]
    pub quantity: Decimal,
}

/// One delivery note covering several reservations.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BatchDeliveryRequest {
    #[validate(length(min = 1, max = 64))]
    pub note_number: String,
    pub delivery_date: NaiveDate,
    #[validate(length(min = 1))]
    pub items: Vec<BatchDeliveryItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub message: String,
    pub processed_count: usize,
    pub reservations: Vec<reservation::Model>,
}

#[derive(Clone)]
pub struct DeliveryService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    item_locks: ItemLocks,
    policy: OverDeliveryPolicy,
}

impl DeliveryService {
    /// `item_locks` must be the table the reservation engine uses, so deliveries and
    /// cancellations on the same contract item never interleave.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        item_locks: ItemLocks,
        policy: OverDeliveryPolicy,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            item_locks,
            policy,
        }
    }

    /// Adds `quantity` to the delivered total of one reservation.
    #[instrument(skip(self))]
    pub async fn record_delivery(
        &self,
        command: RecordDeliveryCommand,
    ) -> Result<reservation::Model, ServiceError> {
        command.validate()?;
        let policy = self.policy;
        let RecordDeliveryCommand {
            reservation_id,
            quantity,
            note_number,
            delivery_date,
        } = command;

        let contract_item_id = Reservation::find_by_id(reservation_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or(ServiceError::ReservationNotFound(reservation_id))?
            .contract_item_id;
        let _guard = self.item_locks.lock(contract_item_id).await;

        let updated = with_transaction(&self.db_pool, "record_delivery", move |txn| {
            let note_number = note_number.clone();
            Box::pin(async move {
                apply_delivery(
                    txn,
                    policy,
                    reservation_id,
                    quantity,
                    note_number.as_deref(),
                    delivery_date,
                )
                .await
            })
        })
        .await?;

        counter!("procurement_deliveries.recorded", 1);
        info!(
            reservation_id,
            quantity = %quantity,
            delivered_total = %updated.delivered_quantity,
            status = %updated.status,
            "Delivery recorded"
        );
        self.event_sender
            .send_or_log(Event::DeliveryRecorded {
                reservation_id,
                quantity,
                delivered_total: updated.delivered_quantity,
                status: updated.status.to_string(),
            })
            .await;
        Ok(updated)
    }

    /// Applies every entry of a delivery note in one transaction. The first failing entry aborts
    /// the batch and nothing is written.
    #[instrument(skip(self, request), fields(note_number = %request.note_number, items = request.items.len()))]
    pub async fn record_delivery_batch(
        &self,
        request: BatchDeliveryRequest,
    ) -> Result<BatchResult, ServiceError> {
        request.validate()?;
        for item in &request.items {
            item.validate().map_err(|e| {
                ServiceError::ValidationError(format!(
                    "Reservation {}: {}",
                    item.reservation_id, e
                ))
            })?;
        }

        let policy = self.policy;
        let note_number = request.note_number.trim().to_string();
        let delivery_date = request.delivery_date;
        let items = request.items;
        let note_for_txn = note_number.clone();

        // Lock every touched contract item in ascending id order so overlapping batches
        // cannot deadlock. Unknown reservation ids fail inside the transaction.
        let reservation_ids: Vec<i32> = items.iter().map(|i| i.reservation_id).collect();
        let contract_item_ids: BTreeSet<i32> = Reservation::find()
            .filter(reservation::Column::Id.is_in(reservation_ids))
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|r| r.contract_item_id)
            .collect();
        let mut guards = Vec::with_capacity(contract_item_ids.len());
        for contract_item_id in contract_item_ids {
            guards.push(self.item_locks.lock(contract_item_id).await);
        }

        let updated = with_transaction(&self.db_pool, "record_delivery_batch", move |txn| {
            let items = items.clone();
            let note_for_txn = note_for_txn.clone();
            Box::pin(async move {
                let mut updated = Vec::with_capacity(items.len());
                for item in &items {
                    let reservation = apply_delivery(
                        txn,
                        policy,
                        item.reservation_id,
                        item.quantity,
                        Some(note_for_txn.as_str()),
                        Some(delivery_date),
                    )
                    .await?;
                    updated.push(reservation);
                }
                Ok(updated)
            })
        })
        .await
        .map_err(|e| {
            counter!("procurement_deliveries.batch_failures", 1);
            warn!(note_number = %note_number, error = %e, "Delivery batch rolled back");
            e
        })?;
        drop(guards);

        let processed_count = updated.len();
        counter!("procurement_deliveries.recorded", processed_count as u64);
        info!(note_number = %note_number, processed_count, "Delivery batch recorded");
        self.event_sender
            .send_or_log(Event::DeliveryBatchRecorded {
                note_number: note_number.clone(),
                processed_count,
                recorded_at: Utc::now(),
            })
            .await;

        Ok(BatchResult {
            message: format!(
                "Delivery note {} applied to {} reservation(s)",
                note_number, processed_count
            ),
            processed_count,
            reservations: updated,
        })
    }
}

/// Adds one delivery to a reservation inside the caller's transaction.
async fn apply_delivery<C>(
    conn: &C,
    policy: OverDeliveryPolicy,
    reservation_id: i32,
    quantity: Decimal,
    note_number: Option<&str>,
    delivery_date: Option<NaiveDate>,
) -> Result<reservation::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let current = load_reservation_for_update(conn, reservation_id).await?;

    if current.status == ReservationStatus::Cancelled {
        return Err(ServiceError::ValidationError(format!(
            "Reservation {} is cancelled and cannot receive deliveries",
            reservation_id
        )));
    }

    let delivered_total = delivered_total_after(
        policy,
        reservation_id,
        current.requested_quantity,
        current.delivered_quantity,
        quantity,
    )?;
    let status = ReservationStatus::after_delivery(
        current.status,
        current.requested_quantity,
        delivered_total,
    );

    let mut active: reservation::ActiveModel = current.into();
    active.delivered_quantity = Set(delivered_total);
    active.status = Set(status);
    if let Some(note) = note_number {
        active.last_delivery_note = Set(Some(note.to_string()));
    }
    if delivery_date.is_some() {
        active.last_delivery_date = Set(delivery_date);
    }
    active.update(conn).await.map_err(ServiceError::db_error)
}

/// New delivered total under `policy`. Never lower than `delivered`.
fn delivered_total_after(
    policy: OverDeliveryPolicy,
    reservation_id: i32,
    requested: Decimal,
    delivered: Decimal,
    quantity: Decimal,
) -> Result<Decimal, ServiceError> {
    let total = delivered + quantity;
    if total <= requested {
        return Ok(total);
    }

    match policy {
        OverDeliveryPolicy::Allow => Ok(total),
        OverDeliveryPolicy::Clamp => Ok(requested.max(delivered)),
        OverDeliveryPolicy::Reject => Err(ServiceError::ValidationError(format!(
            "Delivery of {} for reservation {} exceeds the outstanding quantity {}",
            quantity,
            reservation_id,
            (requested - delivered).max(Decimal::ZERO)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    #[rstest]
    #[case(OverDeliveryPolicy::Allow, dec!(15), dec!(10), Some(dec!(25)))]
    #[case(OverDeliveryPolicy::Clamp, dec!(15), dec!(10), Some(dec!(20)))]
    #[case(OverDeliveryPolicy::Reject, dec!(15), dec!(10), None)]
    #[case(OverDeliveryPolicy::Reject, dec!(15), dec!(5), Some(dec!(20)))]
    #[case(OverDeliveryPolicy::Clamp, dec!(15), dec!(0), Some(dec!(15)))]
    fn over_delivery_policies(
        #[case] policy: OverDeliveryPolicy,
        #[case] delivered: Decimal,
        #[case] quantity: Decimal,
        #[case] expected: Option<Decimal>,
    ) {
        let result = delivered_total_after(policy, 1, dec!(20), delivered, quantity);
        match expected {
            Some(total) => assert_eq!(result.unwrap(), total),
            None => assert!(matches!(result, Err(ServiceError::ValidationError(_)))),
        }
    }

    #[test]
    fn clamp_never_lowers_an_existing_overage() {
        let total =
            delivered_total_after(OverDeliveryPolicy::Clamp, 1, dec!(20), dec!(25), dec!(3))
                .unwrap();
        assert_eq!(total, dec!(25));
    }
}
