use std::net::SocketAddr;

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: appointments created. Labels: service (catalog|custom).
pub const APPOINTMENTS_BOOKED_TOTAL: &str = "slotkeeper_appointments_booked_total";

/// Counter: bookings or reschedules rejected because the window was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotkeeper_booking_conflicts_total";

/// Counter: status transitions applied. Labels: to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "slotkeeper_status_transitions_total";

/// Counter: appointment deletions. Labels: policy (purge|hide).
pub const APPOINTMENTS_DELETED_TOTAL: &str = "slotkeeper_appointments_deleted_total";

/// Counter: reminder notifications sent by the sweep.
pub const REMINDERS_SENT_TOTAL: &str = "slotkeeper_reminders_sent_total";

// ── Loyalty metrics ─────────────────────────────────────────────

/// Counter: loyalty points credited.
pub const POINTS_ACCRUED_TOTAL: &str = "slotkeeper_points_accrued_total";

/// Counter: accruals that failed after the completion was committed.
pub const ACCRUAL_FAILURES_TOTAL: &str = "slotkeeper_accrual_failures_total";

/// Counter: rewards redeemed.
pub const REDEMPTIONS_TOTAL: &str = "slotkeeper_redemptions_total";

/// Counter: redemptions swept to expired.
pub const REDEMPTIONS_EXPIRED_TOTAL: &str = "slotkeeper_redemptions_expired_total";

// ── Notification metrics ────────────────────────────────────────

/// Counter: notifications published to the hub. Labels: kind.
pub const NOTIFICATIONS_TOTAL: &str = "slotkeeper_notifications_total";

/// Counter: outbound deliveries that failed.
pub const NOTIFICATION_FAILURES_TOTAL: &str = "slotkeeper_notification_failures_total";

// ── WAL metrics ─────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotkeeper_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
