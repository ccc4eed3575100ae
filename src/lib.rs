//! Procurement Core Library
//!
//! Quantity reservation against contract items, delivery tracking, demand consolidation into
//! technical studies, budget lines and lookup-id resolution, over a relational store.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod services;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::{DbPool, ItemLocks};
use crate::events::EventSender;
use crate::services::budget_ledger::BudgetLedgerService;
use crate::services::consolidation::ConsolidationService;
use crate::services::contract_ledger::ContractLedgerService;
use crate::services::deliveries::DeliveryService;
use crate::services::delivery_orders::DeliveryOrderService;
use crate::services::demand_documents::DemandDocumentService;
use crate::services::identifier_resolver::{IdentifierResolver, RetryPolicy};
use crate::services::reservations::ReservationService;

pub use crate::errors::ServiceError;

/// Every service wired to one pool and one event channel.
#[derive(Clone)]
pub struct AppServices {
    pub db: Arc<DbPool>,
    pub event_sender: EventSender,
    pub resolver: Arc<IdentifierResolver>,
    pub contracts: Arc<ContractLedgerService>,
    pub delivery_orders: Arc<DeliveryOrderService>,
    pub reservations: Arc<ReservationService>,
    pub deliveries: Arc<DeliveryService>,
    pub demand_documents: Arc<DemandDocumentService>,
    pub consolidation: Arc<ConsolidationService>,
    pub budget: Arc<BudgetLedgerService>,
}

impl AppServices {
    pub fn new(db: Arc<DbPool>, event_sender: EventSender, config: &AppConfig) -> Self {
        // One lock table per process; reservation and delivery paths must share it.
        let item_locks = ItemLocks::new();
        let retry_policy = RetryPolicy {
            max_retries: config.resolver_max_retries,
        };

        Self {
            resolver: Arc::new(IdentifierResolver::new(
                db.clone(),
                event_sender.clone(),
                retry_policy,
            )),
            contracts: Arc::new(ContractLedgerService::new(db.clone())),
            delivery_orders: Arc::new(DeliveryOrderService::new(db.clone())),
            reservations: Arc::new(ReservationService::new(
                db.clone(),
                event_sender.clone(),
                item_locks.clone(),
            )),
            deliveries: Arc::new(DeliveryService::new(
                db.clone(),
                event_sender.clone(),
                item_locks,
                config.over_delivery_policy,
            )),
            demand_documents: Arc::new(DemandDocumentService::new(db.clone())),
            consolidation: Arc::new(ConsolidationService::new(db.clone(), event_sender.clone())),
            budget: Arc::new(BudgetLedgerService::new(db.clone(), event_sender.clone())),
            db,
            event_sender,
        }
    }
}
