//! End-to-end settlement flow: booking → delivery → owed → payout → approval

use chrono::NaiveDate;
use ledger_core::{ActorId, Currency, Money, TransactionStatus, WithdrawalRequest};
use message_bus::{DeliveryState, IdempotentReceiver, LogDispatcher, NotificationKind};
use parcel_engine::{
    Commission, CustomerId, FeeMode, ItemCorrection, ItemStatus, NewBooking, NewItem, Prices,
    Receiver, ServiceTariff, SettlementFlag,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use settlement::{Config, Error, SettlementEngine, WalletLink};
use uuid::Uuid;

fn usd(amount: Decimal) -> Money {
    Money::new(amount, Currency::USD)
}

fn customer() -> CustomerId {
    CustomerId::new("cust-1")
}

fn driver() -> ActorId {
    ActorId::new("driver-a")
}

async fn engine() -> SettlementEngine {
    let mut config = Config::default();
    config.parcel.tariffs.push(ServiceTariff {
        service_id: "standard".to_string(),
        name: "Standard".to_string(),
        base_price: Prices::new(dec!(3), dec!(12000)),
        price_per_km: Prices::default(),
    });
    config.wallet_links.push(WalletLink {
        customer_id: customer(),
        actor_id: ActorId::new("wallet-1"),
        display_name: "Sokha Shop".to_string(),
        payout_channel: Some("ABA".to_string()),
    });
    SettlementEngine::open(config).await.unwrap()
}

fn new_item(code: &str, cod: Money) -> NewItem {
    NewItem {
        tracking_code: code.to_string(),
        receiver: Receiver {
            name: format!("Receiver {}", code),
            phone: "012345678".to_string(),
            address: "Phnom Penh".to_string(),
        },
        cod,
        weight_kg: dec!(1),
        delivery_fee: None,
    }
}

/// Two items, COD 20 and 30 USD, booking-level fee 6 USD
fn book(engine: &SettlementEngine, customer_id: CustomerId, prefix: &str) -> (Uuid, Vec<Uuid>) {
    let receipt = engine
        .parcels()
        .create_booking(NewBooking {
            customer_id,
            sender_name: "Sokha Shop".to_string(),
            pickup_address: "Street 2004".to_string(),
            booking_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            service_id: "standard".to_string(),
            fee_mode: FeeMode::BookingTotal,
            distance_km: None,
            items: vec![
                new_item(&format!("{}-1", prefix), usd(dec!(20))),
                new_item(&format!("{}-2", prefix), usd(dec!(30))),
            ],
        })
        .unwrap();

    assert_eq!(receipt.view.booking.total_delivery_fee, Some(usd(dec!(6))));
    let item_ids = receipt.view.items.iter().map(|i| i.item_id).collect();
    (receipt.view.booking.booking_id, item_ids)
}

async fn deliver(engine: &SettlementEngine, booking_id: Uuid, item_id: Uuid) {
    engine
        .parcels()
        .verify_pickup(
            booking_id,
            item_id,
            ItemCorrection::default(),
            Some(Commission::new(driver(), usd(dec!(0.50)))),
        )
        .unwrap();
    let outcome = engine
        .parcels()
        .mark_delivered(booking_id, item_id, None)
        .await
        .unwrap();
    assert_eq!(outcome.earnings.len(), 1);
}

async fn delivered_booking(engine: &SettlementEngine, prefix: &str) -> (Uuid, Vec<Uuid>) {
    let (booking_id, item_ids) = book(engine, customer(), prefix);
    for item_id in &item_ids {
        deliver(engine, booking_id, *item_id).await;
    }
    (booking_id, item_ids)
}

#[tokio::test]
async fn test_two_items_booking_fee_owes_44_usd() {
    let engine = engine().await;
    delivered_booking(&engine, "P").await;

    let owed = engine.compute_owed(&customer());
    assert_eq!(owed.net_usd, dec!(44));
    assert_eq!(owed.net_khr, Decimal::ZERO);
    assert_eq!(owed.unsettled_item_count, 2);
    assert!(owed.items.iter().all(|line| line.fee == usd(dec!(3))));
}

#[tokio::test]
async fn test_owed_excludes_undelivered_and_settled_items() {
    let engine = engine().await;
    delivered_booking(&engine, "P").await;
    let (pending_booking, pending_items) = book(&engine, customer(), "Q");
    deliver(&engine, pending_booking, pending_items[0]).await;

    // Q-2 is still PENDING
    let owed = engine.compute_owed(&customer());
    assert_eq!(owed.unsettled_item_count, 3);
    assert!(owed.items.iter().all(|line| line.item_id != pending_items[1]));

    let request = engine.settle(&customer()).await.unwrap();
    engine.approve(request.transactions[0].transaction_id).await.unwrap();

    let owed = engine.compute_owed(&customer());
    assert!(owed.is_empty());
    assert_eq!(owed.net_usd, Decimal::ZERO);
}

#[tokio::test]
async fn test_unlinked_customer_cannot_settle() {
    let engine = engine().await;
    let stranger = CustomerId::new("cust-2");
    let (booking_id, item_ids) = book(&engine, stranger.clone(), "S");
    deliver(&engine, booking_id, item_ids[0]).await;

    assert_eq!(engine.compute_owed(&stranger).unsettled_item_count, 1);
    let result = engine.settle(&stranger).await;
    assert!(matches!(result, Err(Error::UnlinkedActor(c)) if c == stranger));
}

#[tokio::test]
async fn test_settle_twice_issues_once() {
    let engine = engine().await;
    delivered_booking(&engine, "P").await;

    let first = engine.settle(&customer()).await.unwrap();
    assert_eq!(first.transactions.len(), 1);
    assert_eq!(first.transactions[0].money(), usd(dec!(44)));
    assert_eq!(first.transactions[0].payout_channel.as_deref(), Some("ABA"));

    assert!(matches!(
        engine.settle(&customer()).await,
        Err(Error::NothingToSettle(_))
    ));

    // A rejected request frees its items again
    engine
        .reject(first.transactions[0].transaction_id, "wrong account")
        .await
        .unwrap();
    let retry = engine.settle(&customer()).await.unwrap();
    assert_eq!(retry.summary.net_usd, dec!(44));
}

#[tokio::test]
async fn test_approval_flips_customer_flags_and_notifies_once() {
    let engine = engine().await;
    let (booking_id, item_ids) = delivered_booking(&engine, "P").await;

    let request = engine.settle(&customer()).await.unwrap();
    let tx_id = request.transactions[0].transaction_id;

    let approval = engine.approve(tx_id).await.unwrap();
    assert_eq!(approval.transaction.status, TransactionStatus::Approved);
    assert_eq!(approval.settled_items.len(), 2);
    assert!(approval.notified);
    assert_eq!(approval.report.lines.len(), 2);
    assert_eq!(approval.report.totals.usd, dec!(44));
    assert_eq!(
        engine.ledger().balance(&ActorId::new("wallet-1"), Currency::USD),
        dec!(44)
    );

    let view = engine.parcels().view(booking_id).unwrap();
    for item_id in &item_ids {
        let item = view.item(*item_id).unwrap();
        assert_eq!(item.customer_settlement, SettlementFlag::Settled);
        assert_eq!(item.driver_settlement, SettlementFlag::Unsettled);
    }

    // Second approval is refused and enqueues nothing
    assert!(matches!(
        engine.approve(tx_id).await,
        Err(Error::Ledger(ledger_core::Error::StateConflict(_)))
    ));
    assert_eq!(engine.outbox().len(), 1);

    let entry = engine.outbox().get(&tx_id.to_string()).unwrap();
    assert_eq!(entry.notification.kind, NotificationKind::SettlementApproved);
    assert!(entry.notification.text.contains("P-1"));
    assert_eq!(entry.notification.payload["lines"].as_array().unwrap().len(), 2);

    let receiver = IdempotentReceiver::new(LogDispatcher);
    assert_eq!(engine.outbox().drain(&receiver).await.delivered, 1);
    assert!(receiver.has_seen(&tx_id.to_string()));
    assert_eq!(
        engine.outbox().get(&tx_id.to_string()).unwrap().state,
        DeliveryState::Delivered
    );
}

#[tokio::test]
async fn test_settled_item_freezes_financials_only() {
    let engine = engine().await;
    let (booking_id, item_ids) = delivered_booking(&engine, "P").await;
    let request = engine.settle(&customer()).await.unwrap();
    engine.approve(request.transactions[0].transaction_id).await.unwrap();

    let fee_edit = engine
        .edit_item(
            booking_id,
            item_ids[0],
            ItemCorrection {
                delivery_fee: Some(dec!(5)),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(
        fee_edit,
        Err(Error::Parcel(parcel_engine::Error::StateConflict(_)))
    ));

    let name_edit = engine
        .edit_item(
            booking_id,
            item_ids[0],
            ItemCorrection {
                receiver_name: Some("Dara".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(name_edit.item.item.receiver.name, "Dara");
    assert_eq!(name_edit.item.item.status, ItemStatus::Delivered);
}

#[tokio::test]
async fn test_reject_leaves_flags_untouched() {
    let engine = engine().await;
    let (booking_id, _) = delivered_booking(&engine, "P").await;

    let request = engine.settle(&customer()).await.unwrap();
    let tx_id = request.transactions[0].transaction_id;
    let rejected = engine.reject(tx_id, "duplicate request").await.unwrap();

    assert_eq!(rejected.status, TransactionStatus::Failed);
    assert_eq!(rejected.failure_reason.as_deref(), Some("duplicate request"));

    let view = engine.parcels().view(booking_id).unwrap();
    assert!(view
        .items
        .iter()
        .all(|i| i.customer_settlement == SettlementFlag::Unsettled));

    let entry = engine.outbox().get(&tx_id.to_string()).unwrap();
    assert_eq!(entry.notification.kind, NotificationKind::PayoutRejected);
    assert_eq!(engine.compute_owed(&customer()).net_usd, dec!(44));
}

#[tokio::test]
async fn test_driver_withdrawal_settles_driver_side() {
    let engine = engine().await;
    let (booking_id, item_ids) = delivered_booking(&engine, "P").await;
    assert_eq!(engine.ledger().balance(&driver(), Currency::USD), dec!(1.00));

    let related: Vec<_> = item_ids
        .iter()
        .map(|id| ledger_core::RelatedItem::new(booking_id, *id))
        .collect();
    let request = |amount| WithdrawalRequest {
        actor_id: driver(),
        actor_name: "Driver A".to_string(),
        amount: usd(amount),
        payout_channel: "cash".to_string(),
        memo: "Weekly commission".to_string(),
        related_items: related.clone(),
    };

    assert!(matches!(
        engine.request_withdrawal(request(dec!(5))).await,
        Err(Error::Ledger(ledger_core::Error::InsufficientFunds { .. }))
    ));

    let tx_id = engine.request_withdrawal(request(dec!(1))).await.unwrap();
    let approval = engine.approve(tx_id).await.unwrap();

    assert_eq!(approval.report.totals.usd, dec!(1.00));
    assert_eq!(engine.ledger().balance(&driver(), Currency::USD), Decimal::ZERO);

    let view = engine.parcels().view(booking_id).unwrap();
    for item in &view.items {
        assert_eq!(item.driver_settlement, SettlementFlag::Settled);
        assert_eq!(item.customer_settlement, SettlementFlag::Unsettled);
    }

    let entry = engine.outbox().get(&tx_id.to_string()).unwrap();
    assert_eq!(entry.notification.kind, NotificationKind::WithdrawalApproved);

    // Driver side already settled
    assert!(matches!(
        engine.request_withdrawal(request(dec!(0.50))).await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_fee_correction_announces_adjustment() {
    let engine = engine().await;
    let (booking_id, item_ids) = delivered_booking(&engine, "P").await;

    // Apportioned fee 3.00 → 4.50, commission 0.50 → +0.25
    let outcome = engine
        .edit_item(
            booking_id,
            item_ids[0],
            ItemCorrection {
                delivery_fee: Some(dec!(4.50)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.adjustments.len(), 1);
    assert_eq!(outcome.adjustments[0].money(), usd(dec!(0.25)));
    assert_eq!(engine.ledger().balance(&driver(), Currency::USD), dec!(1.25));

    let key = outcome.adjustments[0].transaction_id.to_string();
    let entry = engine.outbox().get(&key).unwrap();
    assert_eq!(entry.notification.kind, NotificationKind::AdjustmentRecorded);

    // Net owed follows the corrected fee: 15.50 + 27.00
    assert_eq!(engine.compute_owed(&customer()).net_usd, dec!(42.50));
}

fn khr(amount: Decimal) -> Money {
    Money::new(amount, Currency::KHR)
}

/// One item, COD 80 000 KHR, per-item fee 12 000 KHR, delivered
async fn delivered_khr_booking(engine: &SettlementEngine, code: &str) -> (Uuid, Uuid) {
    let receipt = engine
        .parcels()
        .create_booking(NewBooking {
            customer_id: customer(),
            sender_name: "Sokha Shop".to_string(),
            pickup_address: "Street 2004".to_string(),
            booking_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            service_id: "standard".to_string(),
            fee_mode: FeeMode::PerItem,
            distance_km: None,
            items: vec![new_item(code, khr(dec!(80000)))],
        })
        .unwrap();
    let booking_id = receipt.view.booking.booking_id;
    let item_id = receipt.view.items[0].item_id;

    engine
        .parcels()
        .verify_pickup(
            booking_id,
            item_id,
            ItemCorrection::default(),
            Some(Commission::new(driver(), khr(dec!(2000)))),
        )
        .unwrap();
    engine
        .parcels()
        .mark_delivered(booking_id, item_id, None)
        .await
        .unwrap();
    (booking_id, item_id)
}

#[tokio::test]
async fn test_two_currency_payouts_settle_independently() {
    let engine = engine().await;
    let (usd_booking, usd_items) = delivered_booking(&engine, "P").await;
    let (khr_booking, khr_item) = delivered_khr_booking(&engine, "K-1").await;

    let owed = engine.compute_owed(&customer());
    assert_eq!(owed.net_usd, dec!(44));
    assert_eq!(owed.net_khr, dec!(68000));

    let request = engine.settle(&customer()).await.unwrap();
    assert_eq!(request.transactions.len(), 2);
    let usd_row = request
        .transactions
        .iter()
        .find(|tx| tx.currency == Currency::USD)
        .unwrap();
    let khr_row = request
        .transactions
        .iter()
        .find(|tx| tx.currency == Currency::KHR)
        .unwrap();
    // Both rows reference the full item set
    assert_eq!(usd_row.related_items.len(), 3);
    assert!(khr_row
        .related_items
        .contains(&ledger_core::RelatedItem::new(khr_booking, khr_item)));

    // Approving the USD payout leaves the riel item alone
    let approval = engine.approve(usd_row.transaction_id).await.unwrap();
    assert_eq!(approval.settled_items.len(), 2);
    assert_eq!(approval.report.lines.len(), 2);
    let usd_view = engine.parcels().view(usd_booking).unwrap();
    for item_id in &usd_items {
        assert_eq!(
            usd_view.item(*item_id).unwrap().customer_settlement,
            SettlementFlag::Settled
        );
    }
    let khr_view = engine.parcels().view(khr_booking).unwrap();
    assert_eq!(
        khr_view.item(khr_item).unwrap().customer_settlement,
        SettlementFlag::Unsettled
    );

    // Rejecting the KHR payout keeps the riel owed and settleable
    engine
        .reject(khr_row.transaction_id, "wrong account")
        .await
        .unwrap();
    let owed = engine.compute_owed(&customer());
    assert_eq!(owed.net_usd, Decimal::ZERO);
    assert_eq!(owed.net_khr, dec!(68000));
    assert_eq!(owed.unsettled_item_count, 1);

    let retry = engine.settle(&customer()).await.unwrap();
    assert_eq!(retry.transactions.len(), 1);
    assert_eq!(retry.transactions[0].money(), khr(dec!(68000)));
    engine
        .approve(retry.transactions[0].transaction_id)
        .await
        .unwrap();

    assert!(engine.compute_owed(&customer()).is_empty());
    let wallet = ActorId::new("wallet-1");
    assert_eq!(engine.ledger().balance(&wallet, Currency::USD), dec!(44));
    assert_eq!(engine.ledger().balance(&wallet, Currency::KHR), dec!(68000));
}

#[tokio::test]
async fn test_correction_after_settle_refuses_stale_approval() {
    let engine = engine().await;
    let (booking_id, item_ids) = delivered_booking(&engine, "P").await;

    let request = engine.settle(&customer()).await.unwrap();
    let stale = request.transactions[0].transaction_id;
    assert_eq!(request.transactions[0].money(), usd(dec!(44)));

    // COD 20 → 30 while the payout is still pending
    engine
        .edit_item(
            booking_id,
            item_ids[0],
            ItemCorrection {
                cod: Some(dec!(30)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let result = engine.approve(stale).await;
    assert!(matches!(
        result,
        Err(Error::OutdatedPayout { requested, current, .. })
            if requested == usd(dec!(44)) && current == usd(dec!(54))
    ));
    assert_eq!(
        engine.ledger().transaction(stale).unwrap().status,
        TransactionStatus::Pending
    );
    let view = engine.parcels().view(booking_id).unwrap();
    assert!(view
        .items
        .iter()
        .all(|i| i.customer_settlement == SettlementFlag::Unsettled));

    // Reject and settle again: the corrected amount is paid in full
    engine.reject(stale, "amount changed").await.unwrap();
    let retry = engine.settle(&customer()).await.unwrap();
    assert_eq!(retry.transactions[0].money(), usd(dec!(54)));
    engine
        .approve(retry.transactions[0].transaction_id)
        .await
        .unwrap();

    assert_eq!(
        engine.ledger().balance(&ActorId::new("wallet-1"), Currency::USD),
        dec!(54)
    );
    assert!(engine.compute_owed(&customer()).is_empty());
}

#[tokio::test]
async fn test_restart_keeps_bookings_and_ledger() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = {
        let mut config = engine().await.config().clone();
        config.ledger.data_dir = Some(temp_dir.path().join("wallet"));
        config.ledger.sync_writes = false;
        config
    };

    let (booking_id, item_ids) = {
        let engine = SettlementEngine::open(config.clone()).await.unwrap();
        let booked = delivered_booking(&engine, "P").await;
        let request = engine.settle(&customer()).await.unwrap();
        engine.approve(request.transactions[0].transaction_id).await.unwrap();
        delivered_khr_booking(&engine, "K-1").await;
        engine.shutdown().await.unwrap();
        booked
    };

    let engine = SettlementEngine::open(config).await.unwrap();
    let view = engine.parcels().view(booking_id).unwrap();
    assert_eq!(view.items.len(), item_ids.len());
    assert!(view
        .items
        .iter()
        .all(|i| i.customer_settlement == SettlementFlag::Settled));

    // Settled USD stays settled, the riel item is still owed
    let owed = engine.compute_owed(&customer());
    assert_eq!(owed.net_usd, Decimal::ZERO);
    assert_eq!(owed.net_khr, dec!(68000));
    assert_eq!(
        engine.ledger().balance(&ActorId::new("wallet-1"), Currency::USD),
        dec!(44)
    );
    assert_eq!(engine.ledger().balance(&driver(), Currency::USD), dec!(1.00));
    assert!(engine
        .parcels()
        .store()
        .find_by_tracking_code("K-1")
        .is_some());

    engine.shutdown().await.unwrap();
}
