mod booking;
mod compaction;
mod conflict;
mod error;
mod lifecycle;
mod loyalty;
mod queries;
mod registry;

pub use conflict::find_conflict;
pub use error::EngineError;
pub use lifecycle::{AccrualOutcome, TransitionOutcome};
pub use loyalty::points_for;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, NotificationKind, NotifyHub};
use crate::wal::Wal;

pub type SharedLocationState = Arc<RwLock<LocationState>>;
pub type SharedCustomerState = Arc<Mutex<CustomerState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no partial bytes leak into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Applying events ──────────────────────────────────────

/// Location a non-creation event applies to.
fn event_location_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ServiceSaved { service } => Some(service.location_id),
        Event::RewardSaved { reward } => Some(reward.location_id),
        Event::AppointmentBooked { appointment } => Some(appointment.location_id),
        Event::LoyaltyConfigured { location_id, .. }
        | Event::AppointmentRescheduled { location_id, .. }
        | Event::StatusChanged { location_id, .. }
        | Event::AppointmentHidden { location_id, .. }
        | Event::AppointmentPurged { location_id, .. }
        | Event::StaffDetached { location_id, .. }
        | Event::ReminderSent { location_id, .. }
        | Event::DetailsUpdated { location_id, .. }
        | Event::PointsAccrued { location_id, .. }
        | Event::AccrualRecorded { location_id, .. } => Some(*location_id),
        Event::LocationCreated { .. }
        | Event::CustomerRegistered { .. }
        | Event::RewardRedeemed { .. }
        | Event::RedemptionRecorded { .. }
        | Event::RedemptionUsed { .. }
        | Event::RedemptionExpired { .. } => None,
    }
}

/// Customer a non-creation event applies to.
fn event_customer_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::PointsAccrued { accrual, .. } => Some(accrual.customer_id),
        Event::RewardRedeemed { redemption } | Event::RedemptionRecorded { redemption } => {
            Some(redemption.customer_id)
        }
        Event::RedemptionUsed { customer_id, .. } | Event::RedemptionExpired { customer_id, .. } => {
            Some(*customer_id)
        }
        _ => None,
    }
}

/// Apply the location half of an event. The caller holds the write lock.
fn apply_to_location(ls: &mut LocationState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ServiceSaved { service } => {
            ls.services.insert(service.id, service.clone());
        }
        Event::LoyaltyConfigured { config, .. } => ls.loyalty = Some(config.clone()),
        Event::RewardSaved { reward } => {
            ls.rewards.insert(reward.id, reward.clone());
        }
        Event::AppointmentBooked { appointment } => {
            index.insert(appointment.id, ls.id);
            ls.insert_appointment(appointment.clone());
        }
        Event::AppointmentRescheduled { id, span, .. } => {
            if let Some(mut appointment) = ls.remove_appointment(*id) {
                appointment.span = *span;
                appointment.reminder_sent = false;
                ls.insert_appointment(appointment);
            }
        }
        Event::StatusChanged { id, status, at, .. } => {
            if let Some(a) = ls.appointment_mut(id) {
                a.status = *status;
                match status {
                    AppointmentStatus::Cancelled => a.cancelled_at = Some(*at),
                    AppointmentStatus::Completed => a.completed_at = Some(*at),
                    AppointmentStatus::Scheduled | AppointmentStatus::NoShow => {}
                }
            }
        }
        Event::AppointmentHidden { id, at, .. } => {
            if let Some(a) = ls.appointment_mut(id) {
                a.deleted_at = Some(*at);
            }
        }
        Event::AppointmentPurged { id, .. } => {
            ls.remove_appointment(*id);
            index.remove(id);
        }
        Event::StaffDetached { staff_id, .. } => {
            for a in ls
                .appointments
                .iter_mut()
                .filter(|a| a.staff_id == Some(*staff_id))
            {
                a.staff_id = None;
            }
        }
        Event::ReminderSent { id, .. } => {
            if let Some(a) = ls.appointment_mut(id) {
                a.reminder_sent = true;
            }
        }
        Event::DetailsUpdated { id, details, .. } => {
            if let Some(a) = ls.appointment_mut(id) {
                details.apply_to(a);
            }
        }
        Event::PointsAccrued { accrual, .. } | Event::AccrualRecorded { accrual, .. } => {
            ls.accruals.insert(accrual.appointment_id, accrual.clone());
        }
        _ => {}
    }
}

/// Apply the customer half of an event. The caller holds the customer lock.
fn apply_to_customer(cs: &mut CustomerState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::PointsAccrued { accrual, .. } => {
            cs.points = cs.points.saturating_add(accrual.points);
        }
        Event::RewardRedeemed { redemption } => {
            cs.points = cs.points.saturating_sub(redemption.points_spent);
            index.insert(redemption.id, cs.id);
            cs.redemptions.push(redemption.clone());
        }
        Event::RedemptionRecorded { redemption } => {
            index.insert(redemption.id, cs.id);
            cs.redemptions.push(redemption.clone());
        }
        Event::RedemptionUsed {
            id,
            appointment_id,
            at,
            ..
        } => {
            if let Some(r) = cs.redemption_mut(id) {
                r.status = RedemptionStatus::Used {
                    appointment_id: *appointment_id,
                    used_at: *at,
                };
            }
        }
        Event::RedemptionExpired { id, .. } => {
            if let Some(r) = cs.redemption_mut(id) {
                r.status = RedemptionStatus::Expired;
            }
        }
        _ => {}
    }
}

/// Rebuild in-memory state from the log, before any lock exists.
fn rebuild(
    events: &[Event],
    appointment_index: &DashMap<Ulid, Ulid>,
    redemption_index: &DashMap<Ulid, Ulid>,
) -> (HashMap<Ulid, LocationState>, HashMap<Ulid, CustomerState>) {
    let mut locations: HashMap<Ulid, LocationState> = HashMap::new();
    let mut customers: HashMap<Ulid, CustomerState> = HashMap::new();

    for event in events {
        match event {
            Event::LocationCreated { id, name } => {
                locations.insert(*id, LocationState::new(*id, name.clone()));
            }
            Event::CustomerRegistered {
                id,
                location_id,
                name,
                points,
            } => {
                customers.insert(
                    *id,
                    CustomerState::new(*id, *location_id, name.clone(), *points),
                );
            }
            other => {
                if let Some(lid) = event_location_id(other)
                    && let Some(ls) = locations.get_mut(&lid)
                {
                    apply_to_location(ls, other, appointment_index);
                }
                if let Some(cid) = event_customer_id(other)
                    && let Some(cs) = customers.get_mut(&cid)
                {
                    apply_to_customer(cs, other, redemption_index);
                }
            }
        }
    }

    (locations, customers)
}

/// Claim on a caller-supplied id in one of the reverse indexes. Released on
/// drop unless `keep` is called, so a failed or abandoned request frees the id.
pub(super) struct IdReservation<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    kept: bool,
}

impl<'a> IdReservation<'a> {
    /// `AlreadyExists` if the id is indexed or reserved by a concurrent request.
    pub(super) fn claim(
        index: &'a DashMap<Ulid, Ulid>,
        id: Ulid,
        owner: Ulid,
    ) -> Result<Self, EngineError> {
        match index.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(owner);
                Ok(Self {
                    index,
                    id,
                    kept: false,
                })
            }
        }
    }

    pub(super) fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.index.remove(&self.id);
        }
    }
}

pub struct Engine {
    pub(super) locations: DashMap<Ulid, SharedLocationState>,
    pub(super) customers: DashMap<Ulid, SharedCustomerState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: appointment id → location id.
    pub(super) appointment_to_location: DashMap<Ulid, Ulid>,
    /// Reverse lookup: redemption id → customer id.
    pub(super) redemption_to_customer: DashMap<Ulid, Ulid>,
    /// Held shared while a location or customer is created and exclusively by
    /// compaction, so no entity appears between its snapshot and the swap.
    pub(super) creation_gate: RwLock<()>,
}

impl Engine {
    /// Replay the log at `wal_path` and start the group-commit writer.
    /// Must be called inside a Tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let appointment_to_location = DashMap::new();
        let redemption_to_customer = DashMap::new();
        let (locations, customers) =
            rebuild(&events, &appointment_to_location, &redemption_to_customer);
        info!(
            events = events.len(),
            locations = locations.len(),
            customers = customers.len(),
            "state rebuilt from {}",
            wal_path.display()
        );

        Ok(Self {
            locations: locations
                .into_iter()
                .map(|(id, ls)| (id, Arc::new(RwLock::new(ls))))
                .collect(),
            customers: customers
                .into_iter()
                .map(|(id, cs)| (id, Arc::new(Mutex::new(cs))))
                .collect(),
            wal_tx,
            notify,
            appointment_to_location,
            redemption_to_customer,
            creation_gate: RwLock::new(()),
        })
    }

    /// Write an event through the group-commit writer and wait until it is durable.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_location(&self, id: &Ulid) -> Option<SharedLocationState> {
        self.locations.get(id).map(|e| e.value().clone())
    }

    pub fn get_location_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_to_location
            .get(appointment_id)
            .map(|e| *e.value())
    }

    pub(super) fn location(&self, id: Ulid) -> Result<SharedLocationState, EngineError> {
        self.get_location(&id)
            .ok_or(EngineError::not_found("location", id))
    }

    pub(super) fn customer(&self, id: Ulid) -> Result<SharedCustomerState, EngineError> {
        self.customers
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::not_found("customer", id))
    }

    /// WAL-append, then apply to the locked location.
    pub(super) async fn commit_location(
        &self,
        ls: &mut LocationState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_location(ls, event, &self.appointment_to_location);
        Ok(())
    }

    /// WAL-append, then apply to the locked customer.
    pub(super) async fn commit_customer(
        &self,
        cs: &mut CustomerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_customer(cs, event, &self.redemption_to_customer);
        Ok(())
    }

    /// WAL-append once, then apply to both locked halves.
    pub(super) async fn commit_both(
        &self,
        ls: &mut LocationState,
        cs: &mut CustomerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_location(ls, event, &self.appointment_to_location);
        apply_to_customer(cs, event, &self.redemption_to_customer);
        Ok(())
    }

    /// Publish a lifecycle notification for a committed appointment change.
    pub(super) fn announce(&self, kind: NotificationKind, appointment: &Appointment) {
        self.notify.send(Notification {
            kind,
            appointment_id: appointment.id,
            location_id: appointment.location_id,
            customer_id: appointment.customer_id,
            at: crate::time::now_ms(),
        });
    }

    /// Lookup appointment → location, acquire the location write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<LocationState>, EngineError> {
        let location_id = self
            .get_location_for_appointment(appointment_id)
            .ok_or(EngineError::not_found("appointment", *appointment_id))?;
        let guard = self.location(location_id)?.write_owned().await;
        // Purged between the index lookup and the lock.
        if guard.appointment(appointment_id).is_none() {
            return Err(EngineError::not_found("appointment", *appointment_id));
        }
        Ok(guard)
    }
}
