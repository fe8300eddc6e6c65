use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type stored on disk.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

/// Facility-local wall-clock time → Ms. The facility has one implicit
/// timezone, so naive date-times are encoded as if they were UTC.
pub fn ms_from_naive(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

pub fn naive_from_ms(ms: Ms) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

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

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Adjacent spans (one ends where the other starts) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Booking status ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }

    /// Whether a booking in this status still holds its interval.
    pub fn occupies(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, Completed)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown booking status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

// ── Operating hours ──────────────────────────────────────────────

/// Wall-clock opening window for one weekday, in minutes after midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub open_min: u32,
    pub close_min: u32,
}

impl DayHours {
    pub const fn new(open_min: u32, close_min: u32) -> Self {
        Self { open_min, close_min }
    }
}

pub const DEFAULT_DAY_HOURS: DayHours = DayHours::new(9 * 60, 17 * 60);

/// Per-weekday hours, Monday first. `None` = closed that day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
    pub days: [Option<DayHours>; 7],
}

impl OperatingHours {
    pub fn uniform(hours: DayHours) -> Self {
        Self { days: [Some(hours); 7] }
    }

    pub fn for_date(&self, date: NaiveDate) -> Option<DayHours> {
        self.days[date.weekday().num_days_from_monday() as usize]
    }
}

impl Default for OperatingHours {
    fn default() -> Self {
        Self::uniform(DEFAULT_DAY_HOURS)
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub name: String,
    pub duration_min: u32,
    /// Minor currency units.
    pub price: i64,
    pub active: bool,
    pub category: Option<String>,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        self.duration_min as Ms * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub name: String,
    /// Lowercased; unique per facility.
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub customer_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub service_id: Ulid,
    /// Frozen at admission; later service edits never move it.
    pub span: Span,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    /// True when this booking competes with a request scoped to `staff`.
    ///
    /// Each staff member is an independent resource, and so is the
    /// facility-wide pool: a staff-scoped request only sees that staff
    /// member's bookings, never pool bookings. An unscoped request sees every
    /// booking. The relation is not symmetric, so a pool booking and a staff
    /// booking at the same time can coexist only when the pool booking is
    /// admitted first.
    pub fn in_scope(&self, staff: Option<Ulid>) -> bool {
        match staff {
            Some(s) => self.staff_id == Some(s),
            None => true,
        }
    }

    /// Whether a resubmission carrying this booking's idempotency key asks
    /// for the same appointment.
    pub fn matches_request(&self, req: &AdmissionRequest) -> bool {
        self.customer_id == req.customer_id
            && self.service_id == req.service_id
            && self.span.start == req.start
            && self.staff_id == req.staff_id
    }
}

/// A candidate start time and whether it can be booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub start: NaiveDateTime,
    pub available: bool,
}

impl Slot {
    /// `HH:MM`
    pub fn label(&self) -> String {
        self.start.format("%H:%M").to_string()
    }
}

#[derive(Debug, Clone)]
pub struct FacilityState {
    pub id: Ulid,
    pub name: Option<String>,
    pub slot_minutes: u32,
    pub auto_confirm: bool,
    pub hours: OperatingHours,
    pub services: HashMap<Ulid, Service>,
    pub customers: HashMap<Ulid, Customer>,
    /// Lowercased email → customer id.
    pub customer_emails: HashMap<String, Ulid>,
    /// All bookings (cancelled included), sorted by `span.start`.
    pub bookings: Vec<Booking>,
    /// Longest span ever stored; bounds how far back a start-range scan must reach.
    pub longest_booking_ms: Ms,
    pub idempotency: HashMap<String, Ulid>,
}

impl FacilityState {
    pub fn new(id: Ulid, name: Option<String>, slot_minutes: u32, auto_confirm: bool) -> Self {
        Self {
            id,
            name,
            slot_minutes,
            auto_confirm,
            hours: OperatingHours::default(),
            services: HashMap::new(),
            customers: HashMap::new(),
            customer_emails: HashMap::new(),
            bookings: Vec::new(),
            longest_booking_ms: 0,
            idempotency: HashMap::new(),
        }
    }

    /// First registration of an email wins.
    pub fn register_customer(&mut self, customer: Customer) {
        if self.customer_emails.contains_key(&customer.email) {
            return;
        }
        self.customer_emails.insert(customer.email.clone(), customer.id);
        self.customers.insert(customer.id, customer);
    }

    pub fn customer_by_email(&self, email: &str) -> Option<&Customer> {
        self.customer_emails
            .get(email)
            .and_then(|id| self.customers.get(id))
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        self.longest_booking_ms = self.longest_booking_ms.max(booking.span.duration_ms());
        if let Some(key) = &booking.idempotency_key {
            self.idempotency.insert(key.clone(), booking.id);
        }
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings whose start lies in `[window.start, window.end)`. Two binary searches.
    pub fn starting_within(&self, window: &Span) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.span.start < window.start);
        let hi = self.bookings.partition_point(|b| b.span.start < window.end);
        &self.bookings[lo..hi]
    }

    /// Reach backwards by the longest booking or service so that nothing
    /// starting earlier but running into `span` is missed.
    pub fn lookback_ms(&self) -> Ms {
        let longest_service = self
            .services
            .values()
            .map(Service::duration_ms)
            .max()
            .unwrap_or(0);
        self.longest_booking_ms.max(longest_service)
    }

    /// Non-cancelled, in-scope bookings overlapping `span`.
    pub fn occupying<'a>(
        &'a self,
        span: &'a Span,
        staff: Option<Ulid>,
    ) -> impl Iterator<Item = &'a Booking> + 'a {
        let window = Span::new(span.start - self.lookback_ms(), span.end);
        self.starting_within(&window)
            .iter()
            .filter(move |b| b.status.occupies() && b.in_scope(staff) && b.span.overlaps(span))
    }
}

/// Flat event types; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FacilityCreated {
        id: Ulid,
        name: Option<String>,
        slot_minutes: u32,
        auto_confirm: bool,
        hours: OperatingHours,
    },
    HoursSet {
        facility_id: Ulid,
        /// 0 = Monday.
        weekday: u8,
        hours: Option<DayHours>,
    },
    ServiceUpserted {
        service: Service,
    },
    CustomerRegistered {
        customer: Customer,
    },
    BookingAdmitted {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        facility_id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
}

impl Event {
    pub fn facility_id(&self) -> Ulid {
        match self {
            Event::FacilityCreated { id, .. } => *id,
            Event::HoursSet { facility_id, .. } | Event::BookingStatusChanged { facility_id, .. } => {
                *facility_id
            }
            Event::ServiceUpserted { service } => service.facility_id,
            Event::CustomerRegistered { customer } => customer.facility_id,
            Event::BookingAdmitted { booking } => booking.facility_id,
        }
    }
}

// ── Requests ─────────────────────────────────────────────────────

/// What a customer submits: identity by name + email, then a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub customer_name: String,
    pub customer_email: String,
    pub service_id: Ulid,
    pub start: NaiveDateTime,
    pub staff_id: Option<Ulid>,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Admission input once the customer identity is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub customer_id: Ulid,
    pub service_id: Ulid,
    pub start: Ms,
    pub staff_id: Option<Ulid>,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilityInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub slot_minutes: u32,
    pub auto_confirm: bool,
}
