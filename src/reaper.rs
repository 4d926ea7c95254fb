use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::engine::Engine;
use crate::model::Ms;
use crate::time::now_ms;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reminders: usize,
    pub expired_redemptions: usize,
}

/// One pass of the periodic housekeeping: reminders for appointments that
/// start around `now + lead`, then redemption expiry.
pub async fn sweep_once(engine: &Engine, now: Ms, lead: Ms, slack: Ms) -> SweepReport {
    let mut report = SweepReport::default();

    for id in engine.collect_due_reminders(now, lead, slack).await {
        match engine.send_reminder(id).await {
            Ok(true) => report.reminders += 1,
            Ok(false) => {}
            // May have been purged since collection.
            Err(e) => debug!("reminder skip {id}: {e}"),
        }
    }

    match engine.expire_redemptions(now).await {
        Ok(n) => report.expired_redemptions = n,
        Err(e) => error!("redemption expiry failed: {e}"),
    }

    report
}

/// Background task that runs `sweep_once` every `config.sweep_interval`.
pub async fn run_reaper(engine: Arc<Engine>, config: Config) {
    let mut interval = tokio::time::interval(config.sweep_interval);
    loop {
        interval.tick().await;
        let report = sweep_once(
            &engine,
            now_ms(),
            config.reminder_lead,
            config.reminder_slack,
        )
        .await;
        if report != SweepReport::default() {
            info!(
                reminders = report.reminders,
                expired = report.expired_redemptions,
                "sweep finished"
            );
        }
    }
}

/// Background task that compacts the WAL once `threshold` appends have
/// accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            error!(appends, "WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::{NotificationKind, NotifyHub};
    use rust_decimal::Decimal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn seeded(name: &str) -> (Arc<Engine>, Arc<NotifyHub>, Ulid, Ulid) {
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(test_wal_path(name), notify.clone()).unwrap());
        let lid = Ulid::new();
        let cid = Ulid::new();
        engine.create_location(lid, "Garage".into()).await.unwrap();
        engine
            .register_customer(cid, lid, "Ana".into())
            .await
            .unwrap();
        (engine, notify, lid, cid)
    }

    fn custom_booking(lid: Ulid, cid: Ulid, start: Ms) -> BookingRequest {
        BookingRequest {
            id: Ulid::new(),
            location_id: lid,
            customer_id: cid,
            staff_id: None,
            start,
            end: None,
            service: ServiceSelection::Custom {
                name: "Wash".into(),
                description: None,
                price: Decimal::new(40, 0),
                duration_minutes: None,
            },
            discount: Decimal::ZERO,
            notes: None,
            vehicle: None,
        }
    }

    #[tokio::test]
    async fn reminder_fires_once_for_appointments_a_day_ahead() {
        let (engine, notify, lid, cid) = seeded("reminder_once.wal").await;
        let mut rx = notify.subscribe(lid);
        let now = now_ms();
        let lead = 24 * HOUR_MS;
        let slack = HOUR_MS;

        let tomorrow = engine
            .create_appointment(custom_booking(lid, cid, now + lead + 10 * MINUTE_MS))
            .await
            .unwrap();
        engine
            .create_appointment(custom_booking(lid, cid, now + 3 * lead))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, NotificationKind::Booked);
        assert_eq!(rx.recv().await.unwrap().kind, NotificationKind::Booked);

        let first = sweep_once(&engine, now, lead, slack).await;
        assert_eq!(first.reminders, 1);
        let n = rx.recv().await.unwrap();
        assert_eq!(n.kind, NotificationKind::Reminder);
        assert_eq!(n.appointment_id, tomorrow.id);

        let second = sweep_once(&engine, now, lead, slack).await;
        assert_eq!(second.reminders, 0);
        assert!(engine.get_appointment(tomorrow.id).await.unwrap().reminder_sent);
    }

    #[tokio::test]
    async fn cancelled_appointments_get_no_reminder() {
        let (engine, _notify, lid, cid) = seeded("reminder_cancelled.wal").await;
        let now = now_ms();
        let a = engine
            .create_appointment(custom_booking(lid, cid, now + 24 * HOUR_MS))
            .await
            .unwrap();
        engine
            .update_status(a.id, AppointmentStatus::Cancelled)
            .await
            .unwrap();

        let report = sweep_once(&engine, now, 24 * HOUR_MS, HOUR_MS).await;
        assert_eq!(report.reminders, 0);
    }

    #[tokio::test]
    async fn sweep_expires_stale_redemptions() {
        let (engine, _notify, lid, cid) = seeded("sweep_expiry.wal").await;
        engine
            .configure_loyalty(
                lid,
                LoyaltyConfig {
                    points_rate: Decimal::ONE,
                    enabled: true,
                },
            )
            .await
            .unwrap();
        let reward = Reward {
            id: Ulid::new(),
            location_id: lid,
            name: "Free polish".into(),
            description: None,
            kind: RewardKind::Product,
            discount_value: None,
            service_id: None,
            points_required: 10,
            active: true,
            validity: Some(HOUR_MS),
        };
        engine.save_reward(reward.clone()).await.unwrap();

        let a = engine
            .create_appointment(custom_booking(lid, cid, now_ms() + HOUR_MS))
            .await
            .unwrap();
        engine
            .update_status(a.id, AppointmentStatus::Completed)
            .await
            .unwrap();
        let r = engine.redeem(Ulid::new(), cid, reward.id).await.unwrap();

        let report = sweep_once(&engine, now_ms() + 2 * HOUR_MS, 24 * HOUR_MS, HOUR_MS).await;
        assert_eq!(report.expired_redemptions, 1);
        let stored = engine.redemptions(cid).await.unwrap();
        assert_eq!(stored[0].id, r.id);
        assert_eq!(stored[0].status, RedemptionStatus::Expired);
    }
}
