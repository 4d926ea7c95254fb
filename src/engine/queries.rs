use std::cmp::Reverse;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{find_conflict, validate_span};
use super::{Engine, EngineError};

fn check_query_window(from: Ms, to: Ms) -> Result<Span, EngineError> {
    let window = Span::try_new(from, to)
        .ok_or_else(|| EngineError::Validation(format!("query end ({to}) must be after start ({from})")))?;
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(window)
}

impl Engine {
    /// Lookup by id. Soft-deleted appointments are still returned.
    pub async fn get_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let location_id = self
            .get_location_for_appointment(&id)
            .ok_or(EngineError::not_found("appointment", id))?;
        let location = self.location(location_id)?;
        let guard = location.read().await;
        guard
            .appointment(&id)
            .cloned()
            .ok_or(EngineError::not_found("appointment", id))
    }

    /// Whether `[start, end)` would collide with a scheduled appointment of
    /// the location. `exclude` skips the appointment being moved.
    pub async fn has_conflict(
        &self,
        location_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let span = validate_span(start, end)?;
        let location = self.location(location_id)?;
        let guard = location.read().await;
        Ok(find_conflict(&guard, &span, exclude).is_some())
    }

    /// Visible, non-cancelled appointments overlapping `[from, to)`, in start order.
    pub async fn calendar(
        &self,
        location_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Appointment>, EngineError> {
        let window = check_query_window(from, to)?;
        let location = self.location(location_id)?;
        let guard = location.read().await;
        Ok(guard
            .overlapping(&window)
            .filter(|a| a.is_visible() && a.status != AppointmentStatus::Cancelled)
            .cloned()
            .collect())
    }

    /// Visible appointments matching `filter`, latest start first.
    pub async fn list_appointments(
        &self,
        location_id: Ulid,
        filter: &AppointmentFilter,
    ) -> Result<Vec<Appointment>, EngineError> {
        let location = self.location(location_id)?;
        let guard = location.read().await;
        let mut matching: Vec<&Appointment> = guard
            .appointments
            .iter()
            .filter(|a| a.is_visible() && filter.matches(a))
            .collect();
        matching.sort_by_key(|a| Reverse(a.span.start));
        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    /// Completed appointments whose completion falls in `[from, to)`.
    pub async fn completed_appointments(
        &self,
        location_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Appointment>, EngineError> {
        let window = check_query_window(from, to)?;
        let location = self.location(location_id)?;
        let guard = location.read().await;
        let mut done: Vec<Appointment> = guard
            .appointments
            .iter()
            .filter(|a| {
                a.is_visible()
                    && a.status == AppointmentStatus::Completed
                    && a.completed_at.is_some_and(|t| window.contains_instant(t))
            })
            .cloned()
            .collect();
        done.sort_by_key(|a| a.completed_at);
        Ok(done)
    }

    /// The location's accrual ledger, oldest first.
    pub async fn accruals(&self, location_id: Ulid) -> Result<Vec<Accrual>, EngineError> {
        let location = self.location(location_id)?;
        let guard = location.read().await;
        let mut ledger: Vec<Accrual> = guard.accruals.values().cloned().collect();
        ledger.sort_by_key(|a| (a.accrued_at, a.appointment_id));
        Ok(ledger)
    }

    pub async fn get_customer(&self, id: Ulid) -> Result<CustomerInfo, EngineError> {
        let customer = self.customer(id)?;
        let cs = customer.lock().await;
        Ok(CustomerInfo {
            id: cs.id,
            location_id: cs.location_id,
            name: cs.name.clone(),
            points: cs.points,
        })
    }

    pub async fn redemptions(&self, customer_id: Ulid) -> Result<Vec<Redemption>, EngineError> {
        let customer = self.customer(customer_id)?;
        let cs = customer.lock().await;
        Ok(cs.redemptions.clone())
    }

    pub async fn list_services(&self, location_id: Ulid) -> Result<Vec<CatalogService>, EngineError> {
        let location = self.location(location_id)?;
        let guard = location.read().await;
        let mut services: Vec<CatalogService> = guard.services.values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    pub async fn list_rewards(&self, location_id: Ulid) -> Result<Vec<Reward>, EngineError> {
        let location = self.location(location_id)?;
        let guard = location.read().await;
        let mut rewards: Vec<Reward> = guard.rewards.values().cloned().collect();
        rewards.sort_by_key(|r| r.points_required);
        Ok(rewards)
    }

    pub async fn loyalty_config(&self, location_id: Ulid) -> Result<Option<LoyaltyConfig>, EngineError> {
        let location = self.location(location_id)?;
        let guard = location.read().await;
        Ok(guard.loyalty.clone())
    }

    /// Scheduled appointments starting within `lead ± slack` of `now` that
    /// have not been reminded yet.
    pub async fn collect_due_reminders(&self, now: Ms, lead: Ms, slack: Ms) -> Vec<Ulid> {
        let Some(window) = Span::try_new(now + lead - slack, now + lead + slack) else {
            return Vec::new();
        };
        let locations: Vec<_> = self.locations.iter().map(|e| e.value().clone()).collect();
        let mut due = Vec::new();
        for location in locations {
            let guard = location.read().await;
            due.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| {
                        a.blocks_calendar() && !a.reminder_sent && window.contains_instant(a.span.start)
                    })
                    .map(|a| a.id),
            );
        }
        due
    }
}
