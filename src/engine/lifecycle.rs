use rust_decimal::Decimal;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NotificationKind;
use crate::time::now_ms;

use super::{Engine, EngineError};

/// Result of the loyalty side effect of a status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccrualOutcome {
    /// The transition does not earn points.
    NotApplicable,
    /// Points credited; `0` when loyalty is off or the accrual already exists.
    Credited(u64),
    /// The completion was committed but crediting failed.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub appointment: Appointment,
    pub accrual: AccrualOutcome,
}

impl Engine {
    /// Move an appointment out of `Scheduled`. Completing it also credits loyalty
    /// points; a failed credit is reported in the outcome and does not undo the
    /// transition.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(
        &self,
        id: Ulid,
        target: AppointmentStatus,
    ) -> Result<TransitionOutcome, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let current = guard
            .appointment(&id)
            .map(|a| a.status)
            .ok_or(EngineError::not_found("appointment", id))?;
        if !current.can_transition_to(target) {
            return Err(EngineError::InvalidTransition {
                from: current,
                to: target.as_str().to_string(),
            });
        }

        let event = Event::StatusChanged {
            id,
            location_id: guard.id,
            status: target,
            at: now_ms(),
        };
        self.commit_location(&mut guard, &event).await?;
        metrics::counter!(crate::observability::STATUS_TRANSITIONS_TOTAL, "to" => target.as_str())
            .increment(1);
        info!(from = %current, to = %target, "status changed");

        let accrual = if target == AppointmentStatus::Completed {
            match self.accrue_locked(&mut guard, id).await {
                Ok(points) => AccrualOutcome::Credited(points),
                Err(e) => {
                    warn!("loyalty accrual failed after completion: {e}");
                    metrics::counter!(crate::observability::ACCRUAL_FAILURES_TOTAL).increment(1);
                    AccrualOutcome::Failed(e.to_string())
                }
            }
        } else {
            AccrualOutcome::NotApplicable
        };

        let appointment = guard
            .appointment(&id)
            .cloned()
            .ok_or(EngineError::not_found("appointment", id))?;
        drop(guard);

        match target {
            AppointmentStatus::Completed => self.announce(NotificationKind::Completed, &appointment),
            AppointmentStatus::Cancelled => self.announce(NotificationKind::Cancelled, &appointment),
            AppointmentStatus::Scheduled | AppointmentStatus::NoShow => {}
        }
        Ok(TransitionOutcome {
            appointment,
            accrual,
        })
    }

    /// Textual variant of `update_status`. Names outside the closed status set
    /// fail as `InvalidTransition` from the current state.
    pub async fn update_status_named(
        &self,
        id: Ulid,
        target: &str,
    ) -> Result<TransitionOutcome, EngineError> {
        match target.parse::<AppointmentStatus>() {
            Ok(status) => self.update_status(id, status).await,
            Err(UnknownStatus(raw)) => {
                let from = self.get_appointment(id).await?.status;
                Err(EngineError::InvalidTransition { from, to: raw })
            }
        }
    }

    /// Remove or hide an appointment according to its status. Hiding an
    /// already hidden appointment changes nothing.
    #[tracing::instrument(skip(self))]
    pub async fn delete_appointment(&self, id: Ulid) -> Result<RetentionPolicy, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let (policy, hidden) = guard
            .appointment(&id)
            .map(|a| (a.status.retention(), !a.is_visible()))
            .ok_or(EngineError::not_found("appointment", id))?;

        let location_id = guard.id;
        let event = match policy {
            RetentionPolicy::Purge => Event::AppointmentPurged { id, location_id },
            RetentionPolicy::Hide if hidden => return Ok(policy),
            RetentionPolicy::Hide => Event::AppointmentHidden {
                id,
                location_id,
                at: now_ms(),
            },
        };
        self.commit_location(&mut guard, &event).await?;

        let label = match policy {
            RetentionPolicy::Purge => "purge",
            RetentionPolicy::Hide => "hide",
        };
        metrics::counter!(crate::observability::APPOINTMENTS_DELETED_TOTAL, "policy" => label)
            .increment(1);
        info!(policy = label, "appointment deleted");
        Ok(policy)
    }

    /// Clear `staff_id` on every appointment of the location that references
    /// the staff member. Returns how many were touched.
    #[tracing::instrument(skip(self))]
    pub async fn detach_staff(&self, location_id: Ulid, staff_id: Ulid) -> Result<usize, EngineError> {
        let location = self.location(location_id)?;
        let mut guard = location.write().await;
        let affected = guard
            .appointments
            .iter()
            .filter(|a| a.staff_id == Some(staff_id))
            .count();
        if affected == 0 {
            return Ok(0);
        }
        let event = Event::StaffDetached {
            location_id,
            staff_id,
        };
        self.commit_location(&mut guard, &event).await?;
        info!(affected, "staff detached");
        Ok(affected)
    }

    /// Edit notes, vehicle, payment method, rating or discount after booking.
    /// A new discount re-derives `final_value` and is only accepted while the
    /// appointment is `Scheduled`.
    #[tracing::instrument(skip_all, fields(appointment = %id))]
    pub async fn update_details(
        &self,
        id: Ulid,
        details: DetailsUpdate,
    ) -> Result<Appointment, EngineError> {
        let too_long = |text: &Option<String>, max: usize| text.as_ref().is_some_and(|t| t.len() > max);
        if too_long(&details.notes, MAX_NOTES_LEN) || too_long(&details.internal_notes, MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        if too_long(&details.vehicle, MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("vehicle description too long"));
        }
        if let Some(rating) = &details.rating {
            if !(Rating::MIN_SCORE..=Rating::MAX_SCORE).contains(&rating.score) {
                return Err(EngineError::Validation(format!(
                    "rating must be between {} and {} (got {})",
                    Rating::MIN_SCORE,
                    Rating::MAX_SCORE,
                    rating.score
                )));
            }
            if too_long(&rating.comment, MAX_NOTES_LEN) {
                return Err(EngineError::LimitExceeded("rating comment too long"));
            }
        }
        if let Some(discount) = details.discount
            && discount < Decimal::ZERO
        {
            return Err(EngineError::negative_money("discount", discount));
        }

        let mut guard = self.resolve_appointment_write(&id).await?;
        let current = guard
            .appointment(&id)
            .ok_or(EngineError::not_found("appointment", id))?;
        if details.is_empty() {
            return Ok(current.clone());
        }
        if let Some(discount) = details.discount {
            if current.status != AppointmentStatus::Scheduled {
                return Err(EngineError::Validation(format!(
                    "discount can only change while scheduled (status {})",
                    current.status
                )));
            }
            if discount > current.base_value {
                return Err(EngineError::Validation(format!(
                    "discount {discount} exceeds service value {}",
                    current.base_value
                )));
            }
        }

        let event = Event::DetailsUpdated {
            id,
            location_id: guard.id,
            details,
        };
        self.commit_location(&mut guard, &event).await?;
        info!("appointment details updated");
        guard
            .appointment(&id)
            .cloned()
            .ok_or(EngineError::not_found("appointment", id))
    }

    /// Mark the reminder as sent and publish it. Returns `false` when the
    /// appointment no longer needs one.
    #[tracing::instrument(skip(self))]
    pub async fn send_reminder(&self, id: Ulid) -> Result<bool, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let due = guard
            .appointment(&id)
            .is_some_and(|a| a.blocks_calendar() && !a.reminder_sent);
        if !due {
            return Ok(false);
        }
        let event = Event::ReminderSent {
            id,
            location_id: guard.id,
        };
        self.commit_location(&mut guard, &event).await?;
        let appointment = guard
            .appointment(&id)
            .cloned()
            .ok_or(EngineError::not_found("appointment", id))?;
        drop(guard);

        metrics::counter!(crate::observability::REMINDERS_SENT_TOTAL).increment(1);
        self.announce(NotificationKind::Reminder, &appointment);
        Ok(true)
    }
}
