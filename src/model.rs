use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. Offsets are resolved at the boundary (see `crate::time`).
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Duration used for custom services when the caller gives neither an end nor a duration.
pub const DEFAULT_CUSTOM_DURATION_MINUTES: u32 = 60;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied windows.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `[s1,e1)` and `[s2,e2)` overlap iff `s1 < e2 && s2 < e1`.
    /// A window ending exactly where another begins does not overlap it.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Appointment status ───────────────────────────────────────────

/// Closed set of appointment states. `Scheduled` is the only non-terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

/// What `delete_appointment` does with a record, decided by its status alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Remove the record permanently.
    Purge,
    /// Keep the record for history but hide it from calendar and conflict queries.
    Hide,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 4] = [
        AppointmentStatus::Scheduled,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
        AppointmentStatus::NoShow,
    ];

    pub fn is_terminal(self) -> bool {
        !matches!(self, AppointmentStatus::Scheduled)
    }

    /// Every transition leaves `Scheduled`; nothing leaves a terminal state.
    pub fn can_transition_to(self, target: AppointmentStatus) -> bool {
        self == AppointmentStatus::Scheduled && target != AppointmentStatus::Scheduled
    }

    pub fn retention(self) -> RetentionPolicy {
        match self {
            AppointmentStatus::Cancelled | AppointmentStatus::NoShow => RetentionPolicy::Purge,
            AppointmentStatus::Scheduled | AppointmentStatus::Completed => RetentionPolicy::Hide,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown appointment status: {:?}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for AppointmentStatus {
    type Err = UnknownStatus;

    /// Case-insensitive. Retired intermediate states ("confirmed", "in progress")
    /// are not accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "scheduled" => Ok(AppointmentStatus::Scheduled),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            "no_show" | "noshow" => Ok(AppointmentStatus::NoShow),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

// ── Services ─────────────────────────────────────────────────────

/// What the appointment is for. Exactly one variant is ever populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceRef {
    Catalog { service_id: Ulid },
    Custom { name: String, description: Option<String> },
}

impl ServiceRef {
    pub fn catalog_id(&self) -> Option<Ulid> {
        match self {
            ServiceRef::Catalog { service_id } => Some(*service_id),
            ServiceRef::Custom { .. } => None,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, ServiceRef::Custom { .. })
    }
}

/// Service choice as submitted with a booking request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceSelection {
    Catalog(Ulid),
    Custom {
        name: String,
        description: Option<String>,
        price: Decimal,
        /// Falls back to [`DEFAULT_CUSTOM_DURATION_MINUTES`].
        duration_minutes: Option<u32>,
    },
}

/// A predefined offering owned by a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogService {
    pub id: Ulid,
    pub location_id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub price: Decimal,
    pub duration_minutes: u32,
    pub active: bool,
}

impl CatalogService {
    pub fn duration_ms(&self) -> Ms {
        self.duration_minutes as Ms * MINUTE_MS
    }
}

// ── Appointment ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    Cash,
    DebitCard,
    CreditCard,
    Pix,
    BankSlip,
    #[default]
    Pending,
}

/// Customer feedback on a visit. `score` is 1 to 5.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rating {
    pub score: u8,
    pub comment: Option<String>,
}

impl Rating {
    pub const MIN_SCORE: u8 = 1;
    pub const MAX_SCORE: u8 = 5;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub location_id: Ulid,
    pub customer_id: Ulid,
    /// Cleared when the staff account is detached from the location.
    pub staff_id: Option<Ulid>,
    pub span: Span,
    pub service: ServiceRef,
    pub base_value: Decimal,
    pub discount: Decimal,
    pub final_value: Decimal,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    /// Staff-only remarks, never shown to the customer.
    pub internal_notes: Option<String>,
    /// Model and plate, e.g. "Honda Civic - ABC1234".
    pub vehicle: Option<String>,
    pub payment_method: PaymentMethod,
    pub rating: Option<Rating>,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub deleted_at: Option<Ms>,
    pub reminder_sent: bool,
}

impl Appointment {
    /// Not soft-deleted.
    pub fn is_visible(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Occupies the location's time: visible and still scheduled.
    pub fn blocks_calendar(&self) -> bool {
        self.is_visible() && self.status == AppointmentStatus::Scheduled
    }
}

/// Input to `Engine::create_appointment`.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: Ulid,
    pub location_id: Ulid,
    pub customer_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub start: Ms,
    /// Derived from the service duration when absent.
    pub end: Option<Ms>,
    pub service: ServiceSelection,
    pub discount: Decimal,
    pub notes: Option<String>,
    pub vehicle: Option<String>,
}

/// Post-booking edits. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailsUpdate {
    pub notes: Option<String>,
    pub internal_notes: Option<String>,
    pub vehicle: Option<String>,
    /// Re-derives `final_value`. Only accepted while the appointment is scheduled.
    pub discount: Option<Decimal>,
    pub payment_method: Option<PaymentMethod>,
    pub rating: Option<Rating>,
}

impl DetailsUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overwrite the fields present in the update.
    pub fn apply_to(&self, a: &mut Appointment) {
        if let Some(notes) = &self.notes {
            a.notes = Some(notes.clone());
        }
        if let Some(internal) = &self.internal_notes {
            a.internal_notes = Some(internal.clone());
        }
        if let Some(vehicle) = &self.vehicle {
            a.vehicle = Some(vehicle.clone());
        }
        if let Some(discount) = self.discount {
            a.discount = discount;
            a.final_value = a.base_value - discount;
        }
        if let Some(method) = self.payment_method {
            a.payment_method = method;
        }
        if let Some(rating) = &self.rating {
            a.rating = Some(rating.clone());
        }
    }
}

// ── Loyalty ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoyaltyConfig {
    /// Currency units needed to earn one point.
    pub points_rate: Decimal,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardKind {
    PercentDiscount,
    FixedDiscount,
    FreeService,
    Product,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    pub id: Ulid,
    pub location_id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub kind: RewardKind,
    /// Percentage or currency amount for the discount kinds.
    pub discount_value: Option<Decimal>,
    /// Service granted by `FreeService` rewards.
    pub service_id: Option<Ulid>,
    pub points_required: u64,
    pub active: bool,
    /// How long a redemption stays usable. `None` never expires.
    pub validity: Option<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedemptionStatus {
    Available,
    Used { appointment_id: Ulid, used_at: Ms },
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub reward_id: Ulid,
    pub location_id: Ulid,
    pub points_spent: u64,
    pub redeemed_at: Ms,
    pub expires_at: Option<Ms>,
    pub status: RedemptionStatus,
}

impl Redemption {
    pub fn is_expired_at(&self, now: Ms) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    /// Still `Available` and not past its expiry.
    pub fn is_usable_at(&self, now: Ms) -> bool {
        self.status == RedemptionStatus::Available && !self.is_expired_at(now)
    }
}

/// One ledger row per appointment that earned points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accrual {
    pub appointment_id: Ulid,
    pub customer_id: Ulid,
    pub points: u64,
    pub accrued_at: Ms,
}

// ── Per-location state ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LocationState {
    pub id: Ulid,
    pub name: String,
    pub loyalty: Option<LoyaltyConfig>,
    pub services: HashMap<Ulid, CatalogService>,
    pub rewards: HashMap<Ulid, Reward>,
    /// Every stored appointment (hidden ones included), sorted by `span.start`.
    pub appointments: Vec<Appointment>,
    /// Accrual ledger keyed by appointment id.
    pub accruals: HashMap<Ulid, Accrual>,
}

impl LocationState {
    pub fn new(id: Ulid, name: String) -> Self {
        Self {
            id,
            name,
            loyalty: None,
            services: HashMap::new(),
            rewards: HashMap::new(),
            appointments: Vec::new(),
            accruals: HashMap::new(),
        }
    }

    /// Insert keeping the sort order by start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn appointment(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn appointment_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    /// Appointments whose window overlaps `query`, in start order.
    /// Everything at or past the first start `>= query.end` is skipped by binary search.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// Overlapping appointments that still hold the slot.
    pub fn blocking(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        self.overlapping(query).filter(|a| a.blocks_calendar())
    }
}

#[derive(Debug, Clone)]
pub struct CustomerState {
    pub id: Ulid,
    pub location_id: Ulid,
    pub name: String,
    pub points: u64,
    pub redemptions: Vec<Redemption>,
}

impl CustomerState {
    pub fn new(id: Ulid, location_id: Ulid, name: String, points: u64) -> Self {
        Self {
            id,
            location_id,
            name,
            points,
            redemptions: Vec::new(),
        }
    }

    pub fn redemption_mut(&mut self, id: &Ulid) -> Option<&mut Redemption> {
        self.redemptions.iter_mut().find(|r| r.id == *id)
    }
}

/// The WAL record format. Each variant is applied to at most one location
/// and at most one customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    LocationCreated {
        id: Ulid,
        name: String,
    },
    ServiceSaved {
        service: CatalogService,
    },
    LoyaltyConfigured {
        location_id: Ulid,
        config: LoyaltyConfig,
    },
    RewardSaved {
        reward: Reward,
    },
    CustomerRegistered {
        id: Ulid,
        location_id: Ulid,
        name: String,
        points: u64,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentRescheduled {
        id: Ulid,
        location_id: Ulid,
        span: Span,
    },
    StatusChanged {
        id: Ulid,
        location_id: Ulid,
        status: AppointmentStatus,
        at: Ms,
    },
    AppointmentHidden {
        id: Ulid,
        location_id: Ulid,
        at: Ms,
    },
    AppointmentPurged {
        id: Ulid,
        location_id: Ulid,
    },
    StaffDetached {
        location_id: Ulid,
        staff_id: Ulid,
    },
    ReminderSent {
        id: Ulid,
        location_id: Ulid,
    },
    DetailsUpdated {
        id: Ulid,
        location_id: Ulid,
        details: DetailsUpdate,
    },
    /// Ledger row plus balance credit.
    PointsAccrued {
        location_id: Ulid,
        accrual: Accrual,
    },
    /// Ledger row only; written by compaction, where the balance is already folded in.
    AccrualRecorded {
        location_id: Ulid,
        accrual: Accrual,
    },
    /// Redemption row plus balance debit.
    RewardRedeemed {
        redemption: Redemption,
    },
    /// Redemption row only; written by compaction.
    RedemptionRecorded {
        redemption: Redemption,
    },
    RedemptionUsed {
        id: Ulid,
        customer_id: Ulid,
        appointment_id: Ulid,
        at: Ms,
    },
    RedemptionExpired {
        id: Ulid,
        customer_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerInfo {
    pub id: Ulid,
    pub location_id: Ulid,
    pub name: String,
    pub points: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardEligibility {
    pub reward: Reward,
    pub can_redeem: bool,
    pub points_missing: u64,
}

/// Filters for `Engine::list_appointments`. Hidden appointments are never listed.
#[derive(Debug, Clone, Default)]
pub struct AppointmentFilter {
    /// Only appointments starting at or after this instant.
    pub from: Option<Ms>,
    /// Only appointments starting before this instant.
    pub to: Option<Ms>,
    pub status: Option<AppointmentStatus>,
    pub customer_id: Option<Ulid>,
    pub service_id: Option<Ulid>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl AppointmentFilter {
    pub fn matches(&self, a: &Appointment) -> bool {
        self.from.is_none_or(|t| a.span.start >= t)
            && self.to.is_none_or(|t| a.span.start < t)
            && self.status.is_none_or(|s| a.status == s)
            && self.customer_id.is_none_or(|c| a.customer_id == c)
            && self.service_id.is_none_or(|s| a.service.catalog_id() == Some(s))
    }
}
