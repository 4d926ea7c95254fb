use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use slotkeeper::engine::{AccrualOutcome, Engine, EngineError};
use slotkeeper::model::*;
use slotkeeper::notify::{
    DeliveryError, Notification, NotificationChannel, NotificationKind, NotifyHub, run_dispatcher,
};
use slotkeeper::time::parse_timestamp;

// ── Test infrastructure ──────────────────────────────────────

fn wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("slotkeeper_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

#[derive(Default)]
struct RecordingChannel {
    delivered: Mutex<Vec<(NotificationKind, Ulid)>>,
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), DeliveryError> {
        self.delivered
            .lock()
            .unwrap()
            .push((notification.kind, notification.appointment_id));
        Ok(())
    }
}

impl RecordingChannel {
    async fn wait_for(&self, count: usize) -> Vec<(NotificationKind, Ulid)> {
        for _ in 0..100 {
            let seen = self.delivered.lock().unwrap().clone();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} notifications");
    }
}

struct Shop {
    engine: Engine,
    location: Ulid,
    customer: Ulid,
    wash: CatalogService,
}

async fn open_shop(engine: Engine) -> Shop {
    let location = Ulid::new();
    let customer = Ulid::new();
    assert_ok!(engine.create_location(location, "Lava-rápido Centro".into()).await);
    assert_ok!(
        engine
            .register_customer(customer, location, "Carla".into())
            .await
    );
    assert_ok!(
        engine
            .configure_loyalty(
                location,
                LoyaltyConfig {
                    points_rate: Decimal::new(1000, 2),
                    enabled: true,
                },
            )
            .await
    );
    let wash = CatalogService {
        id: Ulid::new(),
        location_id: location,
        name: "Complete wash".into(),
        description: None,
        price: Decimal::new(12000, 2),
        duration_minutes: 90,
        active: true,
    };
    assert_ok!(engine.save_service(wash.clone()).await);
    Shop {
        engine,
        location,
        customer,
        wash,
    }
}

fn wash_at(shop: &Shop, start: Ms) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        location_id: shop.location,
        customer_id: shop.customer,
        staff_id: None,
        start,
        end: None,
        service: ServiceSelection::Catalog(shop.wash.id),
        discount: Decimal::new(2000, 2),
        notes: None,
        vehicle: None,
    }
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn book_complete_redeem_and_use() {
    let hub = Arc::new(NotifyHub::new());
    let channel = Arc::new(RecordingChannel::default());
    tokio::spawn(run_dispatcher(hub.subscribe_all(), channel.clone()));

    let engine = assert_ok!(Engine::new(wal_path("flow.wal"), hub.clone()));
    let shop = open_shop(engine).await;

    // Offsets are normalized at the boundary: 09:00 in São Paulo is 12:00 UTC.
    let start = assert_ok!(parse_timestamp("2026-03-02T09:00:00-03:00"));
    assert_eq!(start, assert_ok!(parse_timestamp("2026-03-02T12:00:00Z")));
    assert_err!(parse_timestamp("2026-03-02T09:00:00"));

    let first = assert_ok!(shop.engine.create_appointment(wash_at(&shop, start)).await);
    assert_eq!(first.span.duration_ms(), 90 * MINUTE_MS);
    assert_eq!(first.final_value, Decimal::new(10000, 2));

    // Adjacent slot is free, an overlapping one is not.
    let second = assert_ok!(
        shop.engine
            .create_appointment(wash_at(&shop, first.span.end))
            .await
    );
    let clash = shop
        .engine
        .create_appointment(wash_at(&shop, start + 30 * MINUTE_MS))
        .await;
    assert!(matches!(clash, Err(EngineError::Conflict(id)) if id == first.id));

    let outcome = assert_ok!(
        shop.engine
            .update_status(first.id, AppointmentStatus::Completed)
            .await
    );
    assert_eq!(outcome.accrual, AccrualOutcome::Credited(10));
    assert_ok!(shop.engine.update_status_named(second.id, "cancelled").await);

    let voucher = Reward {
        id: Ulid::new(),
        location_id: shop.location,
        name: "10% off".into(),
        description: None,
        kind: RewardKind::PercentDiscount,
        discount_value: Some(Decimal::new(10, 0)),
        service_id: None,
        points_required: 10,
        active: true,
        validity: None,
    };
    assert_ok!(shop.engine.save_reward(voucher.clone()).await);
    let eligible = assert_ok!(shop.engine.available_rewards(shop.customer).await);
    assert!(eligible[0].can_redeem);

    let redemption = assert_ok!(
        shop.engine
            .redeem(Ulid::new(), shop.customer, voucher.id)
            .await
    );
    assert_err!(
        shop.engine
            .redeem(Ulid::new(), shop.customer, voucher.id)
            .await
    );

    let next = assert_ok!(
        shop.engine
            .create_appointment(wash_at(&shop, start + 24 * HOUR_MS))
            .await
    );
    assert_ok!(shop.engine.mark_used(redemption.id, next.id).await);
    assert_err!(shop.engine.mark_used(redemption.id, next.id).await);

    let delivered = channel.wait_for(5).await;
    assert_eq!(
        delivered,
        vec![
            (NotificationKind::Booked, first.id),
            (NotificationKind::Booked, second.id),
            (NotificationKind::Completed, first.id),
            (NotificationKind::Cancelled, second.id),
            (NotificationKind::Booked, next.id),
        ]
    );
}

#[tokio::test]
async fn restart_keeps_history_and_balances() {
    let path = wal_path("restart.wal");
    let hub = Arc::new(NotifyHub::new());

    let (shop_location, customer, done, hidden) = {
        let engine = assert_ok!(Engine::new(path.clone(), hub.clone()));
        let shop = open_shop(engine).await;
        let base = assert_ok!(parse_timestamp("2026-04-10T08:00:00Z"));

        let done = assert_ok!(shop.engine.create_appointment(wash_at(&shop, base)).await);
        assert_ok!(
            shop.engine
                .update_status(done.id, AppointmentStatus::Completed)
                .await
        );
        let hidden = assert_ok!(
            shop.engine
                .create_appointment(wash_at(&shop, base + 4 * HOUR_MS))
                .await
        );
        assert_eq!(
            assert_ok!(shop.engine.delete_appointment(hidden.id).await),
            RetentionPolicy::Hide
        );
        assert_ok!(shop.engine.compact_wal().await);
        (shop.location, shop.customer, done.id, hidden.id)
    };

    let engine = assert_ok!(Engine::new(path, hub));
    assert_eq!(assert_ok!(engine.get_customer(customer).await).points, 10);
    assert_eq!(assert_ok!(engine.accrue_points(done).await), 0);
    assert!(assert_ok!(engine.get_appointment(hidden).await).deleted_at.is_some());

    let day = assert_ok!(parse_timestamp("2026-04-10T00:00:00Z"));
    let calendar = assert_ok!(engine.calendar(shop_location, day, day + 24 * HOUR_MS).await);
    assert_eq!(calendar.len(), 1);
    assert_eq!(calendar[0].id, done);
}
