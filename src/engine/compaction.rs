use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

fn location_snapshot(ls: &LocationState, events: &mut Vec<Event>) {
    events.push(Event::LocationCreated {
        id: ls.id,
        name: ls.name.clone(),
    });
    if let Some(config) = &ls.loyalty {
        events.push(Event::LoyaltyConfigured {
            location_id: ls.id,
            config: config.clone(),
        });
    }
    events.extend(ls.services.values().map(|service| Event::ServiceSaved {
        service: service.clone(),
    }));
    events.extend(ls.rewards.values().map(|reward| Event::RewardSaved {
        reward: reward.clone(),
    }));
    events.extend(ls.appointments.iter().map(|appointment| Event::AppointmentBooked {
        appointment: appointment.clone(),
    }));
    events.extend(ls.accruals.values().map(|accrual| Event::AccrualRecorded {
        location_id: ls.id,
        accrual: accrual.clone(),
    }));
}

fn customer_snapshot(cs: &CustomerState, events: &mut Vec<Event>) {
    events.push(Event::CustomerRegistered {
        id: cs.id,
        location_id: cs.location_id,
        name: cs.name.clone(),
        points: cs.points,
    });
    events.extend(cs.redemptions.iter().map(|redemption| Event::RedemptionRecorded {
        redemption: redemption.clone(),
    }));
}

impl Engine {
    /// Rewrite the WAL with only the events needed to recreate the current state.
    #[tracing::instrument(skip(self))]
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Blocks new locations and customers until the swap.
        let _gate = self.creation_gate.write().await;
        let mut location_ids: Vec<Ulid> = self.locations.iter().map(|e| *e.key()).collect();
        location_ids.sort();
        let mut customer_ids: Vec<Ulid> = self.customers.iter().map(|e| *e.key()).collect();
        customer_ids.sort();

        // Every lock is held until the swap so no commit lands between snapshot and swap.
        let mut location_guards = Vec::with_capacity(location_ids.len());
        for id in &location_ids {
            if let Some(ls) = self.get_location(id) {
                location_guards.push(ls.read_owned().await);
            }
        }
        let mut customer_guards = Vec::with_capacity(customer_ids.len());
        for id in &customer_ids {
            if let Ok(cs) = self.customer(*id) {
                customer_guards.push(cs.lock_owned().await);
            }
        }

        let mut events = Vec::new();
        for ls in &location_guards {
            location_snapshot(ls, &mut events);
        }
        for cs in &customer_guards {
            customer_snapshot(cs, &mut events);
        }
        let snapshot_len = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = snapshot_len, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
