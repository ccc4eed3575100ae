mod common;

use assert_matches::assert_matches;
use common::TestApp;
use procurement_core::{
    entities::reservation::ReservationStatus,
    services::{deliveries::RecordDeliveryCommand, reservations::ReserveCommand},
    ServiceError,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn reserve(contract_item_id: i32, delivery_order_id: i32, quantity: Decimal) -> ReserveCommand {
    ReserveCommand {
        contract_item_id,
        delivery_order_id,
        requested_quantity: quantity,
    }
}

#[tokio::test]
async fn cancelled_reservation_releases_its_quantity() {
    let app = TestApp::new().await;
    let item = app.seed_contract_item(dec!(100)).await;
    let order = app.seed_delivery_order("AOCS-100/2024").await;
    let reservations = &app.services.reservations;

    let first = reservations.reserve(reserve(item.id, order.id, dec!(60))).await.unwrap();
    assert_eq!(first.status, ReservationStatus::Pending);

    let refused = reservations.reserve(reserve(item.id, order.id, dec!(50))).await;
    assert_matches!(
        refused,
        Err(ServiceError::InsufficientBalance { available, requested, .. })
            if available == dec!(40) && requested == dec!(50)
    );

    reservations.cancel(first.id).await.unwrap();
    let second = reservations.reserve(reserve(item.id, order.id, dec!(50))).await.unwrap();
    assert_eq!(second.requested_quantity, dec!(50));

    let balance = app.services.contracts.item_balance(item.id).await.unwrap();
    assert_eq!(balance.reserved, dec!(50));
    assert_eq!(balance.available, dec!(50));
    // The contract item row itself is never written by reservations.
    let unchanged = app.services.contracts.get_contract_item(item.id).await.unwrap();
    assert_eq!(unchanged.contracted_quantity, dec!(100));
    assert_eq!(unchanged.updated_at, item.updated_at);
}

#[tokio::test]
async fn concurrent_reservations_never_exceed_contracted_quantity() {
    let app = TestApp::concurrent().await;
    let item = app.seed_contract_item(dec!(10)).await;
    let order = app.seed_delivery_order("AOCS-200/2024").await;

    let mut tasks = vec![];
    for _ in 0..20 {
        let service = app.services.reservations.clone();
        let (item_id, order_id) = (item.id, order.id);
        tasks.push(tokio::spawn(async move {
            service.reserve(reserve(item_id, order_id, dec!(1))).await.is_ok()
        }));
    }

    let mut success = 0;
    for task in tasks {
        if task.await.unwrap_or(false) {
            success += 1;
        }
    }
    assert_eq!(success, 10, "exactly 10 reservations should succeed; got {}", success);

    let balance = app.services.contracts.item_balance(item.id).await.unwrap();
    assert_eq!(balance.reserved, dec!(10));
    assert_eq!(balance.available, Decimal::ZERO);
}

#[tokio::test]
async fn reservations_on_different_items_do_not_interfere() {
    let app = TestApp::new().await;
    let a = app.seed_contract_item(dec!(5)).await;
    let b = app.seed_contract_item(dec!(5)).await;
    let order = app.seed_delivery_order("AOCS-300/2024").await;

    let (ra, rb) = tokio::join!(
        app.services.reservations.reserve(reserve(a.id, order.id, dec!(5))),
        app.services.reservations.reserve(reserve(b.id, order.id, dec!(5))),
    );
    ra.unwrap();
    rb.unwrap();

    let listed = app
        .services
        .reservations
        .list_by_delivery_order(order.id)
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn reserve_rejects_bad_input() {
    let app = TestApp::new().await;
    let item = app.seed_contract_item(dec!(10)).await;
    let order = app.seed_delivery_order("AOCS-400/2024").await;
    let reservations = &app.services.reservations;

    assert_matches!(
        reservations.reserve(reserve(item.id, order.id, dec!(0))).await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        reservations.reserve(reserve(9_999, order.id, dec!(1))).await,
        Err(ServiceError::NotFound(_))
    );
    assert_matches!(
        reservations.reserve(reserve(item.id, 9_999, dec!(1))).await,
        Err(ServiceError::NotFound(_))
    );

    app.services
        .contracts
        .set_contract_item_active(item.id, false)
        .await
        .unwrap();
    assert_matches!(
        reservations.reserve(reserve(item.id, order.id, dec!(1))).await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn requested_quantity_update_rechecks_the_cap_without_itself() {
    let app = TestApp::new().await;
    let item = app.seed_contract_item(dec!(100)).await;
    let order = app.seed_delivery_order("AOCS-500/2024").await;
    let reservations = &app.services.reservations;

    let first = reservations.reserve(reserve(item.id, order.id, dec!(60))).await.unwrap();
    reservations.reserve(reserve(item.id, order.id, dec!(30))).await.unwrap();

    // 60 -> 70 fits because the old 60 is not counted against itself.
    let grown = reservations.update_requested_quantity(first.id, dec!(70)).await.unwrap();
    assert_eq!(grown.requested_quantity, dec!(70));

    assert_matches!(
        reservations.update_requested_quantity(first.id, dec!(71)).await,
        Err(ServiceError::InsufficientBalance { available, .. }) if available == dec!(70)
    );

    app.services
        .deliveries
        .record_delivery(RecordDeliveryCommand {
            reservation_id: first.id,
            quantity: dec!(40),
            note_number: Some("NF-1".into()),
            delivery_date: None,
        })
        .await
        .unwrap();
    assert_matches!(
        reservations.update_requested_quantity(first.id, dec!(30)).await,
        Err(ServiceError::ValidationError(_))
    );
    let shrunk = reservations.update_requested_quantity(first.id, dec!(40)).await.unwrap();
    assert_eq!(shrunk.status, ReservationStatus::Delivered);
}

#[tokio::test]
async fn delivered_reservations_resist_cancel_and_plain_delete() {
    let app = TestApp::new().await;
    let item = app.seed_contract_item(dec!(10)).await;
    let order = app.seed_delivery_order("AOCS-600/2024").await;
    let reservations = &app.services.reservations;

    let reservation = reservations.reserve(reserve(item.id, order.id, dec!(10))).await.unwrap();
    app.services
        .deliveries
        .record_delivery(RecordDeliveryCommand {
            reservation_id: reservation.id,
            quantity: dec!(4),
            note_number: None,
            delivery_date: None,
        })
        .await
        .unwrap();

    assert_matches!(reservations.cancel(reservation.id).await, Err(ServiceError::Conflict(_)));
    assert_matches!(
        reservations.delete_reservation(reservation.id, false).await,
        Err(ServiceError::Conflict(_))
    );
    reservations.delete_reservation(reservation.id, true).await.unwrap();
    assert_matches!(
        reservations.get_reservation(reservation.id).await,
        Err(ServiceError::ReservationNotFound(_))
    );

    let balance = app.services.contracts.item_balance(item.id).await.unwrap();
    assert_eq!(balance.available, dec!(10));
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let app = TestApp::new().await;
    let item = app.seed_contract_item(dec!(10)).await;
    let order = app.seed_delivery_order("AOCS-700/2024").await;
    let reservations = &app.services.reservations;

    let reservation = reservations.reserve(reserve(item.id, order.id, dec!(3))).await.unwrap();
    let once = reservations.cancel(reservation.id).await.unwrap();
    let twice = reservations.cancel(reservation.id).await.unwrap();
    assert_eq!(once.status, ReservationStatus::Cancelled);
    assert_eq!(twice.status, ReservationStatus::Cancelled);

    assert_matches!(
        reservations.cancel(9_999).await,
        Err(ServiceError::ReservationNotFound(9_999))
    );
}

fn delivery_of(reservation_id: i32, quantity: Decimal) -> RecordDeliveryCommand {
    RecordDeliveryCommand {
        reservation_id,
        quantity,
        note_number: Some("NF-RACE".into()),
        delivery_date: None,
    }
}

#[tokio::test]
async fn cancel_racing_a_delivery_never_leaves_a_cancelled_row_with_deliveries() {
    let app = TestApp::concurrent().await;
    let item = app.seed_contract_item(dec!(100)).await;
    let order = app.seed_delivery_order("AOCS-800/2024").await;

    for _ in 0..6 {
        let reservation = app
            .services
            .reservations
            .reserve(reserve(item.id, order.id, dec!(4)))
            .await
            .unwrap();

        let reservations = app.services.reservations.clone();
        let deliveries = app.services.deliveries.clone();
        let id = reservation.id;
        let cancel = tokio::spawn(async move { reservations.cancel(id).await });
        let deliver =
            tokio::spawn(async move { deliveries.record_delivery(delivery_of(id, dec!(1.5))).await });
        let cancelled = cancel.await.unwrap();
        let delivered = deliver.await.unwrap();

        let after = app.services.reservations.get_reservation(id).await.unwrap();
        match (cancelled, delivered) {
            (Ok(_), Err(e)) => {
                assert_matches!(e, ServiceError::ValidationError(_));
                assert_eq!(after.status, ReservationStatus::Cancelled);
                assert_eq!(after.delivered_quantity, Decimal::ZERO);
            }
            (Err(e), Ok(_)) => {
                assert_matches!(e, ServiceError::Conflict(_));
                assert_eq!(after.status, ReservationStatus::PartialDelivery);
                assert_eq!(after.delivered_quantity, dec!(1.5));
            }
            (cancelled, delivered) => panic!(
                "exactly one of cancel and delivery must win: {:?} / {:?}",
                cancelled, delivered
            ),
        }
    }
}

#[tokio::test]
async fn plain_delete_racing_a_delivery_cannot_drop_delivered_quantity() {
    let app = TestApp::concurrent().await;
    let item = app.seed_contract_item(dec!(100)).await;
    let order = app.seed_delivery_order("AOCS-900/2024").await;

    for _ in 0..6 {
        let reservation = app
            .services
            .reservations
            .reserve(reserve(item.id, order.id, dec!(4)))
            .await
            .unwrap();

        let reservations = app.services.reservations.clone();
        let deliveries = app.services.deliveries.clone();
        let id = reservation.id;
        let delete = tokio::spawn(async move { reservations.delete_reservation(id, false).await });
        let deliver =
            tokio::spawn(async move { deliveries.record_delivery(delivery_of(id, dec!(2))).await });
        let deleted = delete.await.unwrap();
        let delivered = deliver.await.unwrap();

        match (deleted, delivered) {
            (Ok(()), Err(e)) => {
                assert_matches!(e, ServiceError::ReservationNotFound(_));
                assert_matches!(
                    app.services.reservations.get_reservation(id).await,
                    Err(ServiceError::ReservationNotFound(_))
                );
            }
            (Err(e), Ok(_)) => {
                assert_matches!(e, ServiceError::Conflict(_));
                let after = app.services.reservations.get_reservation(id).await.unwrap();
                assert_eq!(after.delivered_quantity, dec!(2));
            }
            (deleted, delivered) => panic!(
                "exactly one of delete and delivery must win: {:?} / {:?}",
                deleted, delivered
            ),
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Reserve(u32),
    CancelOldest,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u32..=40).prop_map(Op::Reserve),
        1 => Just(Op::CancelOldest),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn reserved_total_never_exceeds_contract(ops in prop::collection::vec(op_strategy(), 1..25)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let app = TestApp::new().await;
            let item = app.seed_contract_item(dec!(100)).await;
            let order = app.seed_delivery_order("AOCS-PROP").await;
            let reservations = &app.services.reservations;
            let mut live: Vec<i32> = Vec::new();

            for op in ops {
                match op {
                    Op::Reserve(q) => {
                        if let Ok(r) = reservations
                            .reserve(reserve(item.id, order.id, Decimal::from(q)))
                            .await
                        {
                            live.push(r.id);
                        }
                    }
                    Op::CancelOldest => {
                        if !live.is_empty() {
                            let id = live.remove(0);
                            reservations.cancel(id).await.unwrap();
                        }
                    }
                }

                let balance = app.services.contracts.item_balance(item.id).await.unwrap();
                assert!(balance.reserved <= balance.contracted);
                assert_eq!(balance.reserved + balance.available, balance.contracted);
            }
        });
    }
}
