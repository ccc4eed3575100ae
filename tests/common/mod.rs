#![allow(dead_code)]

use std::sync::Arc;

use procurement_core::{
    config::{AppConfig, OverDeliveryPolicy},
    db,
    entities::{catalog_item::CatalogItemType, contract_item, delivery_order},
    events::{self, EventSender},
    services::{
        contract_ledger::{RegisterCatalogItemCommand, RegisterContractItemCommand},
        delivery_orders::CreateDeliveryOrderCommand,
        demand_documents::{CreateDemandDocumentCommand, DemandDocumentDetails, DemandItemInput},
    },
    AppServices,
};
use rust_decimal::Decimal;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Connections in the file-backed pool; enough for writers to really overlap.
pub const CONCURRENT_POOL_SIZE: u32 = 8;

/// Services over a fresh migrated SQLite database.
pub struct TestApp {
    pub services: AppServices,
    _event_task: tokio::task::JoinHandle<()>,
    // Dropped last so the pool is gone before the database file is removed.
    _db_dir: Option<TempDir>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_policy(OverDeliveryPolicy::Allow).await
    }

    pub async fn with_policy(policy: OverDeliveryPolicy) -> Self {
        let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        // An in-memory database lives and dies with its single connection.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.over_delivery_policy = policy;
        Self::start(cfg, None).await
    }

    /// A database file in a temporary directory behind a multi-connection pool, so concurrent
    /// callers run on separate connections and separate transactions.
    pub async fn concurrent() -> Self {
        let dir = TempDir::new().expect("failed to create database directory");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("procurement.db").display()
        );
        let mut cfg = AppConfig::new(url, "test".to_string());
        cfg.db_max_connections = CONCURRENT_POOL_SIZE;
        cfg.db_min_connections = 1;
        Self::start(cfg, Some(dir)).await
    }

    async fn start(cfg: AppConfig, db_dir: Option<TempDir>) -> Self {
        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool).await.expect("failed to run migrations");

        let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
        let event_task = tokio::spawn(events::process_events(event_rx));
        let services = AppServices::new(Arc::new(pool), EventSender::new(event_tx), &cfg);

        Self {
            services,
            _event_task: event_task,
            _db_dir: db_dir,
        }
    }

    pub async fn seed_catalog_item(&self, name: &str) -> i32 {
        self.services
            .contracts
            .register_catalog_item(RegisterCatalogItemCommand {
                name: name.to_string(),
                unit_of_measure: "UN".to_string(),
                item_type: CatalogItemType::Material,
                taxonomy_code: None,
            })
            .await
            .expect("seed catalog item")
            .id
    }

    /// Registers a contract item with `quantity` contracted, on a fresh catalog item.
    pub async fn seed_contract_item(&self, quantity: Decimal) -> contract_item::Model {
        let catalog_item_id = self.seed_catalog_item("Seed item").await;
        let existing = self
            .services
            .contracts
            .list_contract_items(1)
            .await
            .expect("list contract items")
            .len() as i32;

        self.services
            .contracts
            .register_contract_item(RegisterContractItemCommand {
                contract_id: 1,
                sequence_number: existing + 1,
                catalog_item_id,
                contracted_quantity: quantity,
                unit_price: Decimal::new(1050, 2),
            })
            .await
            .expect("seed contract item")
    }

    pub async fn seed_delivery_order(&self, order_number: &str) -> delivery_order::Model {
        self.services
            .delivery_orders
            .create_delivery_order(CreateDeliveryOrderCommand {
                order_number: order_number.to_string(),
                budget_line_id: None,
                issued_at: None,
            })
            .await
            .expect("seed delivery order")
    }

    /// Creates a demand document with one item per `(catalog_item_id, quantity)` pair.
    pub async fn seed_demand_document(
        &self,
        reference: &str,
        items: &[(i32, Decimal)],
    ) -> DemandDocumentDetails {
        self.services
            .demand_documents
            .create_demand_document(CreateDemandDocumentCommand {
                reference: reference.to_string(),
                requesting_unit_id: None,
                items: items
                    .iter()
                    .map(|(catalog_item_id, quantity)| DemandItemInput {
                        catalog_item_id: *catalog_item_id,
                        quantity: *quantity,
                        estimated_unit_price: Decimal::new(250, 2),
                    })
                    .collect(),
            })
            .await
            .expect("seed demand document")
    }
}
