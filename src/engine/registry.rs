use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

fn validate_name(kind: &'static str, name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation(format!("{kind} name must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    #[tracing::instrument(skip(self))]
    pub async fn create_location(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        validate_name("location", &name)?;
        let _gate = self.creation_gate.read().await;
        if self.locations.len() >= MAX_LOCATIONS {
            return Err(EngineError::LimitExceeded("too many locations"));
        }

        // Published locked, so compaction cannot snapshot before the event is durable.
        let state = Arc::new(RwLock::new(LocationState::new(id, name.clone())));
        let _guard = state.clone().write_owned().await;
        match self.locations.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(state);
            }
        }

        if let Err(e) = self.wal_append(&Event::LocationCreated { id, name }).await {
            self.locations.remove(&id);
            return Err(e);
        }
        info!("location created");
        Ok(())
    }

    /// Create or replace a catalog service.
    #[tracing::instrument(skip_all, fields(service = %service.id, location = %service.location_id))]
    pub async fn save_service(&self, service: CatalogService) -> Result<(), EngineError> {
        validate_name("service", &service.name)?;
        if service
            .description
            .as_ref()
            .is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN)
        {
            return Err(EngineError::LimitExceeded("service description too long"));
        }
        if service.price <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "service price must be positive (got {})",
                service.price
            )));
        }
        if service.duration_minutes == 0 || service.duration_minutes > MAX_SERVICE_DURATION_MINUTES {
            return Err(EngineError::Validation(format!(
                "service duration out of range: {} minutes",
                service.duration_minutes
            )));
        }

        let location = self.location(service.location_id)?;
        let mut guard = location.write().await;
        if !guard.services.contains_key(&service.id)
            && guard.services.len() >= MAX_SERVICES_PER_LOCATION
        {
            return Err(EngineError::LimitExceeded("too many services at location"));
        }
        self.commit_location(&mut guard, &Event::ServiceSaved { service })
            .await
    }

    /// Catalog lookup scoped to a location. A service owned by another
    /// location is `NotFound`.
    pub async fn get_service(
        &self,
        service_id: Ulid,
        location_id: Ulid,
    ) -> Result<CatalogService, EngineError> {
        let location = self.location(location_id)?;
        let guard = location.read().await;
        guard
            .services
            .get(&service_id)
            .cloned()
            .ok_or(EngineError::not_found("service", service_id))
    }

    /// Register a customer of a location with an empty balance.
    #[tracing::instrument(skip(self))]
    pub async fn register_customer(
        &self,
        id: Ulid,
        location_id: Ulid,
        name: String,
    ) -> Result<(), EngineError> {
        validate_name("customer", &name)?;
        let _gate = self.creation_gate.read().await;
        if !self.locations.contains_key(&location_id) {
            return Err(EngineError::not_found("location", location_id));
        }

        let state = Arc::new(Mutex::new(CustomerState::new(id, location_id, name.clone(), 0)));
        let _guard = state.clone().lock_owned().await;
        match self.customers.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(state);
            }
        }

        let event = Event::CustomerRegistered {
            id,
            location_id,
            name,
            points: 0,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.customers.remove(&id);
            return Err(e);
        }
        info!("customer registered");
        Ok(())
    }
}
