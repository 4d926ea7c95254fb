use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::time::now_ms;

use super::{Engine, EngineError, IdReservation};

/// `floor(final_value / points_rate)`. Non-positive inputs earn nothing.
pub fn points_for(final_value: Decimal, points_rate: Decimal) -> u64 {
    if points_rate <= Decimal::ZERO || final_value <= Decimal::ZERO {
        return 0;
    }
    final_value
        .checked_div(points_rate)
        .and_then(|q| q.floor().to_u64())
        .unwrap_or(0)
}

fn validate_reward(reward: &Reward, ls: &LocationState) -> Result<(), EngineError> {
    if reward.name.trim().is_empty() {
        return Err(EngineError::Validation("reward requires a name".into()));
    }
    if reward.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("reward name too long"));
    }
    if reward
        .description
        .as_ref()
        .is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN)
    {
        return Err(EngineError::LimitExceeded("reward description too long"));
    }
    if reward.points_required == 0 {
        return Err(EngineError::Validation(
            "reward must cost at least one point".into(),
        ));
    }
    if let Some(value) = reward.discount_value
        && value < Decimal::ZERO
    {
        return Err(EngineError::negative_money("discount_value", value));
    }
    if reward.validity.is_some_and(|v| v <= 0) {
        return Err(EngineError::Validation(
            "reward validity must be positive".into(),
        ));
    }
    if let Some(service_id) = reward.service_id
        && !ls.services.contains_key(&service_id)
    {
        return Err(EngineError::not_found("service", service_id));
    }
    Ok(())
}

impl Engine {
    /// Credit points for a completed appointment. Returns `0` without side
    /// effects when the appointment is not completed, loyalty is off at its
    /// location, or it has already been credited.
    #[tracing::instrument(skip(self))]
    pub async fn accrue_points(&self, appointment_id: Ulid) -> Result<u64, EngineError> {
        let mut guard = self.resolve_appointment_write(&appointment_id).await?;
        self.accrue_locked(&mut guard, appointment_id).await
    }

    /// Accrual with the location write lock already held.
    pub(super) async fn accrue_locked(
        &self,
        ls: &mut LocationState,
        appointment_id: Ulid,
    ) -> Result<u64, EngineError> {
        let appointment = ls
            .appointment(&appointment_id)
            .ok_or(EngineError::not_found("appointment", appointment_id))?;
        if appointment.status != AppointmentStatus::Completed
            || ls.accruals.contains_key(&appointment_id)
        {
            return Ok(0);
        }
        let Some(config) = ls.loyalty.as_ref().filter(|c| c.enabled) else {
            return Ok(0);
        };
        let points = points_for(appointment.final_value, config.points_rate);
        if points == 0 {
            return Ok(0);
        }

        let customer_id = appointment.customer_id;
        let customer = self.customer(customer_id)?;
        let mut cs = customer.lock().await;
        let event = Event::PointsAccrued {
            location_id: ls.id,
            accrual: Accrual {
                appointment_id,
                customer_id,
                points,
                accrued_at: now_ms(),
            },
        };
        self.commit_both(ls, &mut cs, &event).await?;

        metrics::counter!(crate::observability::POINTS_ACCRUED_TOTAL).increment(points);
        info!(customer = %customer_id, points, balance = cs.points, "points accrued");
        Ok(points)
    }

    /// Create or replace the location's loyalty settings.
    #[tracing::instrument(skip(self))]
    pub async fn configure_loyalty(
        &self,
        location_id: Ulid,
        config: LoyaltyConfig,
    ) -> Result<(), EngineError> {
        if config.points_rate <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "points rate must be positive (got {})",
                config.points_rate
            )));
        }
        let location = self.location(location_id)?;
        let mut guard = location.write().await;
        let event = Event::LoyaltyConfigured {
            location_id,
            config,
        };
        self.commit_location(&mut guard, &event).await
    }

    /// Create or replace a reward in its location's catalog.
    #[tracing::instrument(skip_all, fields(reward = %reward.id, location = %reward.location_id))]
    pub async fn save_reward(&self, reward: Reward) -> Result<(), EngineError> {
        let location = self.location(reward.location_id)?;
        let mut guard = location.write().await;
        if !guard.rewards.contains_key(&reward.id) && guard.rewards.len() >= MAX_REWARDS_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many rewards at location"));
        }
        validate_reward(&reward, &guard)?;
        self.commit_location(&mut guard, &Event::RewardSaved { reward })
            .await
    }

    pub async fn deactivate_reward(&self, location_id: Ulid, reward_id: Ulid) -> Result<(), EngineError> {
        let location = self.location(location_id)?;
        let mut guard = location.write().await;
        let mut reward = guard
            .rewards
            .get(&reward_id)
            .cloned()
            .ok_or(EngineError::not_found("reward", reward_id))?;
        if !reward.active {
            return Ok(());
        }
        reward.active = false;
        self.commit_location(&mut guard, &Event::RewardSaved { reward })
            .await
    }

    /// Exchange points for a reward. The balance check and the debit happen
    /// under the customer lock, so concurrent redemptions cannot overdraw.
    #[tracing::instrument(skip(self))]
    pub async fn redeem(
        &self,
        redemption_id: Ulid,
        customer_id: Ulid,
        reward_id: Ulid,
    ) -> Result<Redemption, EngineError> {
        let reservation =
            IdReservation::claim(&self.redemption_to_customer, redemption_id, customer_id)?;
        let customer = self.customer(customer_id)?;
        let location_id = customer.lock().await.location_id;

        let location = self.location(location_id)?;
        let ls = location.read().await;
        let reward = ls
            .rewards
            .get(&reward_id)
            .ok_or(EngineError::not_found("reward", reward_id))?;
        if !reward.active {
            return Err(EngineError::Inactive(reward_id));
        }

        let mut cs = customer.lock().await;
        if cs.points < reward.points_required {
            return Err(EngineError::InsufficientPoints {
                required: reward.points_required,
                available: cs.points,
            });
        }
        let now = now_ms();
        let redemption = Redemption {
            id: redemption_id,
            customer_id,
            reward_id,
            location_id,
            points_spent: reward.points_required,
            redeemed_at: now,
            expires_at: reward.validity.map(|v| now.saturating_add(v)),
            status: RedemptionStatus::Available,
        };
        let event = Event::RewardRedeemed {
            redemption: redemption.clone(),
        };
        self.commit_customer(&mut cs, &event).await?;
        reservation.keep();

        metrics::counter!(crate::observability::REDEMPTIONS_TOTAL).increment(1);
        info!(points = redemption.points_spent, balance = cs.points, "reward redeemed");
        Ok(redemption)
    }

    /// Consume an available redemption on an appointment of the same location.
    #[tracing::instrument(skip(self))]
    pub async fn mark_used(
        &self,
        redemption_id: Ulid,
        appointment_id: Ulid,
    ) -> Result<Redemption, EngineError> {
        let customer_id = self
            .redemption_to_customer
            .get(&redemption_id)
            .map(|e| *e.value())
            .ok_or(EngineError::not_found("redemption", redemption_id))?;
        let customer = self.customer(customer_id)?;
        let location_id = customer.lock().await.location_id;

        let location = self.location(location_id)?;
        let ls = location.read().await;
        if ls.appointment(&appointment_id).is_none() {
            return Err(EngineError::not_found("appointment", appointment_id));
        }

        let mut cs = customer.lock().await;
        let now = now_ms();
        let usable = cs
            .redemptions
            .iter()
            .find(|r| r.id == redemption_id)
            .map(|r| r.is_usable_at(now))
            .ok_or(EngineError::not_found("redemption", redemption_id))?;
        if !usable {
            return Err(EngineError::AlreadyUsed(redemption_id));
        }
        let event = Event::RedemptionUsed {
            id: redemption_id,
            customer_id,
            appointment_id,
            at: now,
        };
        self.commit_customer(&mut cs, &event).await?;
        info!("redemption used");
        cs.redemptions
            .iter()
            .find(|r| r.id == redemption_id)
            .cloned()
            .ok_or(EngineError::not_found("redemption", redemption_id))
    }

    /// Flip every `Available` redemption past its expiry to `Expired`.
    /// Returns how many changed.
    pub async fn expire_redemptions(&self, now: Ms) -> Result<usize, EngineError> {
        let customers: Vec<_> = self.customers.iter().map(|e| e.value().clone()).collect();
        let mut expired = 0;
        for customer in customers {
            let mut cs = customer.lock().await;
            let due: Vec<Ulid> = cs
                .redemptions
                .iter()
                .filter(|r| r.status == RedemptionStatus::Available && r.is_expired_at(now))
                .map(|r| r.id)
                .collect();
            for id in due {
                let event = Event::RedemptionExpired {
                    id,
                    customer_id: cs.id,
                };
                self.commit_customer(&mut cs, &event).await?;
                expired += 1;
            }
        }
        if expired > 0 {
            metrics::counter!(crate::observability::REDEMPTIONS_EXPIRED_TOTAL)
                .increment(expired as u64);
            info!(expired, "redemptions expired");
        }
        Ok(expired)
    }

    /// Active rewards of the customer's location, cheapest first, with how
    /// far the customer is from each.
    pub async fn available_rewards(
        &self,
        customer_id: Ulid,
    ) -> Result<Vec<RewardEligibility>, EngineError> {
        let customer = self.customer(customer_id)?;
        let (location_id, points) = {
            let cs = customer.lock().await;
            (cs.location_id, cs.points)
        };
        let location = self.location(location_id)?;
        let ls = location.read().await;

        let mut rewards: Vec<RewardEligibility> = ls
            .rewards
            .values()
            .filter(|r| r.active)
            .map(|r| RewardEligibility {
                reward: r.clone(),
                can_redeem: points >= r.points_required,
                points_missing: r.points_required.saturating_sub(points),
            })
            .collect();
        rewards.sort_by(|a, b| {
            a.reward
                .points_required
                .cmp(&b.reward.points_required)
                .then_with(|| a.reward.name.cmp(&b.reward.name))
        });
        Ok(rewards)
    }
}
