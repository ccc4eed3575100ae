use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::entities::lookup_entry::LookupKind;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event after its operation has committed. Failures are logged and swallowed.
    pub async fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            counter!("procurement_events.send_failures", 1, "event" => name);
            warn!(event = name, error = %e, "Event dropped");
        }
    }
}

/// Things that happened in the core, published after the owning transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    ReservationCreated {
        reservation_id: i32,
        contract_item_id: i32,
        delivery_order_id: i32,
        requested_quantity: Decimal,
    },
    ReservationCancelled {
        reservation_id: i32,
        contract_item_id: i32,
        released_quantity: Decimal,
    },
    DeliveryRecorded {
        reservation_id: i32,
        quantity: Decimal,
        delivered_total: Decimal,
        status: String,
    },
    DeliveryBatchRecorded {
        note_number: String,
        processed_count: usize,
        recorded_at: DateTime<Utc>,
    },
    StudyConsolidated {
        technical_study_id: i32,
        demand_document_ids: Vec<i32>,
        item_count: usize,
    },
    DemandDocumentUnlinked {
        technical_study_id: i32,
        demand_document_id: i32,
    },
    StudyDeleted {
        technical_study_id: i32,
        released_documents: Vec<i32>,
    },
    BudgetLineCreated {
        budget_line_id: i32,
        fiscal_year: i32,
        unit_id: i32,
    },
    LookupCreated {
        kind: LookupKind,
        id: i32,
        natural_key: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ReservationCreated { .. } => "reservation_created",
            Event::ReservationCancelled { .. } => "reservation_cancelled",
            Event::DeliveryRecorded { .. } => "delivery_recorded",
            Event::DeliveryBatchRecorded { .. } => "delivery_batch_recorded",
            Event::StudyConsolidated { .. } => "study_consolidated",
            Event::DemandDocumentUnlinked { .. } => "demand_document_unlinked",
            Event::StudyDeleted { .. } => "study_deleted",
            Event::BudgetLineCreated { .. } => "budget_line_created",
            Event::LookupCreated { .. } => "lookup_created",
        }
    }
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        let name = event.name();
        counter!("procurement_events.processed", 1, "event" => name);

        match &event {
            Event::ReservationCreated {
                reservation_id,
                contract_item_id,
                requested_quantity,
                ..
            } => info!(
                reservation_id,
                contract_item_id,
                requested_quantity = %requested_quantity,
                "Reservation created"
            ),
            Event::ReservationCancelled {
                reservation_id,
                released_quantity,
                ..
            } => info!(
                reservation_id,
                released_quantity = %released_quantity,
                "Reservation cancelled"
            ),
            Event::StudyConsolidated {
                technical_study_id,
                demand_document_ids,
                item_count,
            } => info!(
                technical_study_id,
                documents = ?demand_document_ids,
                item_count,
                "Technical study consolidated"
            ),
            other => debug!(event = name, payload = ?other, "Event received"),
        }
    }

    info!("Event processing loop finished");
}
