use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NotificationKind;
use crate::time::now_ms;

use super::conflict::{check_no_conflict, validate_span};
use super::{Engine, EngineError, IdReservation};

/// Resolve the requested service against the location's catalog.
/// Returns the stored reference, the base price and the default duration.
fn resolve_service(
    ls: &LocationState,
    selection: &ServiceSelection,
) -> Result<(ServiceRef, Decimal, Ms), EngineError> {
    match selection {
        ServiceSelection::Catalog(service_id) => {
            let service = ls
                .services
                .get(service_id)
                .ok_or(EngineError::not_found("service", *service_id))?;
            if !service.active {
                return Err(EngineError::Inactive(*service_id));
            }
            Ok((
                ServiceRef::Catalog {
                    service_id: *service_id,
                },
                service.price,
                service.duration_ms(),
            ))
        }
        ServiceSelection::Custom {
            name,
            description,
            price,
            duration_minutes,
        } => {
            let name = name.trim();
            if name.is_empty() {
                return Err(EngineError::Validation(
                    "custom service requires a name".into(),
                ));
            }
            if name.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("service name too long"));
            }
            if description
                .as_ref()
                .is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN)
            {
                return Err(EngineError::LimitExceeded("service description too long"));
            }
            if *price <= Decimal::ZERO {
                return Err(EngineError::Validation(format!(
                    "custom service price must be positive (got {price})"
                )));
            }
            let minutes = duration_minutes.unwrap_or(DEFAULT_CUSTOM_DURATION_MINUTES);
            if minutes == 0 || minutes > MAX_SERVICE_DURATION_MINUTES {
                return Err(EngineError::Validation(format!(
                    "custom service duration out of range: {minutes} minutes"
                )));
            }
            Ok((
                ServiceRef::Custom {
                    name: name.to_string(),
                    description: description.clone(),
                },
                *price,
                minutes as Ms * MINUTE_MS,
            ))
        }
    }
}

impl Engine {
    /// Book a new `Scheduled` appointment. Nothing is stored unless every check
    /// passes; a busy window fails with `Conflict` naming the occupant.
    #[tracing::instrument(skip_all, fields(appointment = %req.id, location = %req.location_id))]
    pub async fn create_appointment(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        if req.discount < Decimal::ZERO {
            return Err(EngineError::negative_money("discount", req.discount));
        }
        if req.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        if req.vehicle.as_ref().is_some_and(|v| v.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("vehicle description too long"));
        }
        let reservation =
            IdReservation::claim(&self.appointment_to_location, req.id, req.location_id)?;

        let location = self.location(req.location_id)?;
        let mut guard = location.write().await;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many appointments at location"));
        }

        let customer = self.customer(req.customer_id)?;
        if customer.lock().await.location_id != req.location_id {
            return Err(EngineError::not_found("customer", req.customer_id));
        }

        let (service, base_value, default_duration) = resolve_service(&guard, &req.service)?;
        let end = req
            .end
            .unwrap_or_else(|| req.start.saturating_add(default_duration));
        let span = validate_span(req.start, end)?;

        if req.discount > base_value {
            return Err(EngineError::Validation(format!(
                "discount {} exceeds service value {base_value}",
                req.discount
            )));
        }

        check_no_conflict(&guard, &span, None)?;

        let appointment = Appointment {
            id: req.id,
            location_id: req.location_id,
            customer_id: req.customer_id,
            staff_id: req.staff_id,
            span,
            service,
            base_value,
            discount: req.discount,
            final_value: base_value - req.discount,
            status: AppointmentStatus::Scheduled,
            notes: req.notes,
            internal_notes: None,
            vehicle: req.vehicle,
            payment_method: PaymentMethod::Pending,
            rating: None,
            created_at: now_ms(),
            cancelled_at: None,
            completed_at: None,
            deleted_at: None,
            reminder_sent: false,
        };
        let event = Event::AppointmentBooked {
            appointment: appointment.clone(),
        };
        self.commit_location(&mut guard, &event).await?;
        reservation.keep();
        drop(guard);

        let kind = if appointment.service.is_custom() {
            "custom"
        } else {
            "catalog"
        };
        metrics::counter!(crate::observability::APPOINTMENTS_BOOKED_TOTAL, "service" => kind)
            .increment(1);
        info!(
            customer = %appointment.customer_id,
            start = %crate::time::format_timestamp(span.start),
            "appointment booked"
        );
        self.announce(NotificationKind::Booked, &appointment);
        Ok(appointment)
    }

    /// Move a scheduled appointment to a new window. Without `end` the
    /// previous duration is kept.
    #[tracing::instrument(skip(self))]
    pub async fn reschedule(
        &self,
        id: Ulid,
        start: Ms,
        end: Option<Ms>,
    ) -> Result<Appointment, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let current = guard
            .appointment(&id)
            .ok_or(EngineError::not_found("appointment", id))?;
        if !current.blocks_calendar() {
            return Err(EngineError::Validation(format!(
                "only scheduled appointments can be rescheduled (status {})",
                current.status
            )));
        }
        let end = end.unwrap_or_else(|| start.saturating_add(current.span.duration_ms()));
        let span = validate_span(start, end)?;
        check_no_conflict(&guard, &span, Some(id))?;

        let event = Event::AppointmentRescheduled {
            id,
            location_id: guard.id,
            span,
        };
        self.commit_location(&mut guard, &event).await?;
        info!("appointment rescheduled");
        guard
            .appointment(&id)
            .cloned()
            .ok_or(EngineError::not_found("appointment", id))
    }
}
