mod common;

use assert_matches::assert_matches;
use chrono::NaiveDate;
use common::TestApp;
use procurement_core::{
    config::OverDeliveryPolicy,
    entities::reservation::{self, ReservationStatus},
    services::{
        deliveries::{BatchDeliveryItem, BatchDeliveryRequest, RecordDeliveryCommand},
        reservations::ReserveCommand,
    },
    ServiceError,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

async fn reserved(app: &TestApp, order_number: &str, quantity: Decimal) -> reservation::Model {
    let item = app.seed_contract_item(dec!(1000)).await;
    let order = app.seed_delivery_order(order_number).await;
    app.services
        .reservations
        .reserve(ReserveCommand {
            contract_item_id: item.id,
            delivery_order_id: order.id,
            requested_quantity: quantity,
        })
        .await
        .unwrap()
}

fn delivery(reservation_id: i32, quantity: Decimal) -> RecordDeliveryCommand {
    RecordDeliveryCommand {
        reservation_id,
        quantity,
        note_number: Some("NF-2024-0001".into()),
        delivery_date: NaiveDate::from_ymd_opt(2024, 3, 15),
    }
}

#[tokio::test]
async fn deliveries_accumulate_past_the_requested_quantity_by_default() {
    let app = TestApp::new().await;
    let r = reserved(&app, "AOCS-C/2024", dec!(20)).await;
    let deliveries = &app.services.deliveries;

    let full = deliveries.record_delivery(delivery(r.id, dec!(20))).await.unwrap();
    assert_eq!(full.delivered_quantity, dec!(20));
    assert_eq!(full.status, ReservationStatus::Delivered);
    assert_eq!(full.last_delivery_note.as_deref(), Some("NF-2024-0001"));

    let over = deliveries.record_delivery(delivery(r.id, dec!(5))).await.unwrap();
    assert_eq!(over.delivered_quantity, dec!(25));
    assert_eq!(over.status, ReservationStatus::Delivered);
}

#[tokio::test]
async fn status_follows_the_delivered_total() {
    let app = TestApp::new().await;
    let r = reserved(&app, "AOCS-S/2024", dec!(20)).await;
    let deliveries = &app.services.deliveries;

    let zero = deliveries.record_delivery(delivery(r.id, dec!(0))).await.unwrap();
    assert_eq!(zero.status, ReservationStatus::Pending);

    let partial = deliveries.record_delivery(delivery(r.id, dec!(7.5))).await.unwrap();
    assert_eq!(partial.status, ReservationStatus::PartialDelivery);

    let rest = deliveries.record_delivery(delivery(r.id, dec!(12.5))).await.unwrap();
    assert_eq!(rest.delivered_quantity, dec!(20));
    assert_eq!(rest.status, ReservationStatus::Delivered);

    assert_matches!(
        deliveries.record_delivery(delivery(r.id, dec!(-1))).await,
        Err(ServiceError::ValidationError(_))
    );
    let unchanged = app.services.reservations.get_reservation(r.id).await.unwrap();
    assert_eq!(unchanged.delivered_quantity, dec!(20));
}

#[tokio::test]
async fn cancelled_reservations_refuse_deliveries() {
    let app = TestApp::new().await;
    let r = reserved(&app, "AOCS-X/2024", dec!(20)).await;
    app.services.reservations.cancel(r.id).await.unwrap();

    assert_matches!(
        app.services.deliveries.record_delivery(delivery(r.id, dec!(1))).await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn batch_with_unknown_reservation_changes_nothing() {
    let app = TestApp::new().await;
    let a = reserved(&app, "AOCS-D1/2024", dec!(10)).await;
    let b = reserved(&app, "AOCS-D2/2024", dec!(10)).await;
    let c = reserved(&app, "AOCS-D3/2024", dec!(10)).await;

    let request = BatchDeliveryRequest {
        note_number: "NF-777".into(),
        delivery_date: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
        items: vec![
            BatchDeliveryItem { reservation_id: a.id, quantity: dec!(4) },
            BatchDeliveryItem { reservation_id: b.id, quantity: dec!(10) },
            BatchDeliveryItem { reservation_id: 9_999, quantity: dec!(1) },
            BatchDeliveryItem { reservation_id: c.id, quantity: dec!(2) },
        ],
    };
    assert_matches!(
        app.services.deliveries.record_delivery_batch(request).await,
        Err(ServiceError::ReservationNotFound(9_999))
    );

    for id in [a.id, b.id, c.id] {
        let r = app.services.reservations.get_reservation(id).await.unwrap();
        assert_eq!(r.delivered_quantity, Decimal::ZERO);
        assert_eq!(r.status, ReservationStatus::Pending);
        assert!(r.last_delivery_note.is_none());
    }
}

#[tokio::test]
async fn batch_applies_every_entry() {
    let app = TestApp::new().await;
    let a = reserved(&app, "AOCS-B1/2024", dec!(10)).await;
    let b = reserved(&app, "AOCS-B2/2024", dec!(10)).await;
    let date = NaiveDate::from_ymd_opt(2024, 5, 20).unwrap();

    let result = app
        .services
        .deliveries
        .record_delivery_batch(BatchDeliveryRequest {
            note_number: "NF-900".into(),
            delivery_date: date,
            items: vec![
                BatchDeliveryItem { reservation_id: a.id, quantity: dec!(10) },
                BatchDeliveryItem { reservation_id: b.id, quantity: dec!(3) },
            ],
        })
        .await
        .unwrap();

    assert_eq!(result.processed_count, 2);
    assert_eq!(result.reservations[0].status, ReservationStatus::Delivered);
    assert_eq!(result.reservations[1].status, ReservationStatus::PartialDelivery);
    assert_eq!(result.reservations[1].last_delivery_date, Some(date));
    assert_eq!(result.reservations[1].last_delivery_note.as_deref(), Some("NF-900"));

    assert_matches!(
        app.services
            .deliveries
            .record_delivery_batch(BatchDeliveryRequest {
                note_number: "NF-901".into(),
                delivery_date: date,
                items: vec![],
            })
            .await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn reject_policy_refuses_over_delivery() {
    let app = TestApp::with_policy(OverDeliveryPolicy::Reject).await;
    let r = reserved(&app, "AOCS-R/2024", dec!(20)).await;
    let deliveries = &app.services.deliveries;

    deliveries.record_delivery(delivery(r.id, dec!(15))).await.unwrap();
    assert_matches!(
        deliveries.record_delivery(delivery(r.id, dec!(6))).await,
        Err(ServiceError::ValidationError(_))
    );
    let exact = deliveries.record_delivery(delivery(r.id, dec!(5))).await.unwrap();
    assert_eq!(exact.status, ReservationStatus::Delivered);
}

#[tokio::test]
async fn clamp_policy_caps_at_the_requested_quantity() {
    let app = TestApp::with_policy(OverDeliveryPolicy::Clamp).await;
    let r = reserved(&app, "AOCS-K/2024", dec!(20)).await;

    let clamped = app
        .services
        .deliveries
        .record_delivery(delivery(r.id, dec!(26)))
        .await
        .unwrap();
    assert_eq!(clamped.delivered_quantity, dec!(20));
    assert_eq!(clamped.status, ReservationStatus::Delivered);
}

#[tokio::test]
async fn pending_report_lists_orders_with_open_reservations() {
    let app = TestApp::new().await;
    let open = reserved(&app, "AOCS-P1/2024", dec!(10)).await;
    let done = reserved(&app, "AOCS-P2/2024", dec!(10)).await;
    app.services
        .deliveries
        .record_delivery(delivery(done.id, dec!(10)))
        .await
        .unwrap();
    app.services
        .deliveries
        .record_delivery(delivery(open.id, dec!(2)))
        .await
        .unwrap();

    let page = app
        .services
        .delivery_orders
        .list_pending_delivery_orders(1, 10)
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].delivery_order_id, open.delivery_order_id);
    assert_eq!(page.items[0].order_number, "AOCS-P1/2024");
    assert_eq!(page.items[0].open_reservations, 1);
    assert_eq!(page.items[0].days_elapsed, 0);
}

#[tokio::test]
async fn concurrent_deliveries_on_one_reservation_all_count() {
    let app = TestApp::concurrent().await;
    let r = reserved(&app, "AOCS-CC/2024", dec!(20)).await;

    let mut tasks = vec![];
    for _ in 0..10 {
        let deliveries = app.services.deliveries.clone();
        let id = r.id;
        tasks.push(tokio::spawn(async move {
            deliveries.record_delivery(delivery(id, dec!(0.5))).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let after = app.services.reservations.get_reservation(r.id).await.unwrap();
    assert_eq!(after.delivered_quantity, dec!(5));
    assert_eq!(after.status, ReservationStatus::PartialDelivery);
}

#[tokio::test]
async fn overlapping_batches_in_opposite_order_both_apply() {
    let app = TestApp::concurrent().await;
    let a = reserved(&app, "AOCS-OB1/2024", dec!(100)).await;
    let b = reserved(&app, "AOCS-OB2/2024", dec!(100)).await;
    let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

    let mut tasks = vec![];
    for round in 0..6 {
        let deliveries = app.services.deliveries.clone();
        let (first, second) = if round % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
        tasks.push(tokio::spawn(async move {
            deliveries
                .record_delivery_batch(BatchDeliveryRequest {
                    note_number: format!("NF-OB-{}", round),
                    delivery_date: date,
                    items: vec![
                        BatchDeliveryItem { reservation_id: first, quantity: dec!(1) },
                        BatchDeliveryItem { reservation_id: second, quantity: dec!(2) },
                    ],
                })
                .await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().processed_count, 2);
    }

    let total = app.services.reservations.get_reservation(a.id).await.unwrap().delivered_quantity
        + app.services.reservations.get_reservation(b.id).await.unwrap().delivered_quantity;
    assert_eq!(total, dec!(18));
}

#[tokio::test]
async fn pending_report_counts_per_order_and_pages() {
    let app = TestApp::new().await;
    let first = reserved(&app, "AOCS-G1/2024", dec!(10)).await;
    let second = reserved(&app, "AOCS-G2/2024", dec!(10)).await;
    let item = app.seed_contract_item(dec!(100)).await;

    // Two more open reservations and one cancelled one under the first order.
    for quantity in [dec!(1), dec!(2), dec!(3)] {
        app.services
            .reservations
            .reserve(ReserveCommand {
                contract_item_id: item.id,
                delivery_order_id: first.delivery_order_id,
                requested_quantity: quantity,
            })
            .await
            .unwrap();
    }
    let extra = app
        .services
        .reservations
        .list_by_delivery_order(first.delivery_order_id)
        .await
        .unwrap();
    app.services.reservations.cancel(extra[3].id).await.unwrap();

    let orders = &app.services.delivery_orders;
    let page_one = orders.list_pending_delivery_orders(1, 1).await.unwrap();
    assert_eq!(page_one.total, 2);
    assert_eq!(page_one.items.len(), 1);
    assert_eq!(page_one.items[0].delivery_order_id, first.delivery_order_id);
    assert_eq!(page_one.items[0].open_reservations, 3);

    let page_two = orders.list_pending_delivery_orders(2, 1).await.unwrap();
    assert_eq!(page_two.items.len(), 1);
    assert_eq!(page_two.items[0].delivery_order_id, second.delivery_order_id);
    assert_eq!(page_two.items[0].open_reservations, 1);

    assert!(orders.list_pending_delivery_orders(3, 1).await.unwrap().items.is_empty());
}
