use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::slots::validate_hours;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_facility(
        &self,
        id: Ulid,
        name: Option<String>,
        slot_minutes: u32,
        auto_confirm: bool,
        hours: OperatingHours,
    ) -> Result<(), EngineError> {
        if self.facilities.len() >= MAX_FACILITIES {
            return Err(EngineError::LimitExceeded("too many facilities"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("facility name too long"));
            }
        if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&slot_minutes) {
            return Err(EngineError::Configuration(format!(
                "slot granularity {slot_minutes} outside {MIN_SLOT_MINUTES}..={MAX_SLOT_MINUTES} minutes"
            )));
        }
        for day in hours.days.iter().flatten() {
            validate_hours(*day)?;
        }

        // Serialises creation against itself and against compaction.
        let _catalog = self.catalog_lock.lock().await;
        if self.facilities.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::FacilityCreated {
            id,
            name: name.clone(),
            slot_minutes,
            auto_confirm,
            hours: hours.clone(),
        };
        self.wal_append(&event).await?;
        let mut fs = FacilityState::new(id, name, slot_minutes, auto_confirm);
        fs.hours = hours;
        self.facilities.insert(id, Arc::new(RwLock::new(fs)));
        self.notify.send(id, &event);
        metrics::gauge!(observability::FACILITIES_ACTIVE).set(self.facilities.len() as f64);
        tracing::info!("facility {id} created ({slot_minutes}-minute slots)");
        Ok(())
    }

    /// Replace one weekday's hours; `None` closes the facility that day.
    pub async fn set_operating_hours(
        &self,
        facility_id: Ulid,
        weekday: u8,
        hours: Option<DayHours>,
    ) -> Result<(), EngineError> {
        if weekday > 6 {
            return Err(EngineError::Validation(format!("weekday {weekday} is not in 0..=6")));
        }
        if let Some(h) = hours {
            validate_hours(h)?;
        }
        let mut guard = self.facility_write(&facility_id).await?;
        let event = Event::HoursSet { facility_id, weekday, hours };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Insert or replace a service. Existing bookings keep their frozen spans.
    pub async fn upsert_service(&self, service: Service) -> Result<(), EngineError> {
        validate_service(&service)?;
        let mut guard = self.facility_write(&service.facility_id).await?;
        if !guard.services.contains_key(&service.id) && guard.services.len() >= MAX_SERVICES_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        let event = Event::ServiceUpserted { service };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Resolve-or-create a customer by email. Idempotent: a known email
    /// returns the existing record unchanged.
    pub async fn resolve_customer(
        &self,
        facility_id: Ulid,
        name: &str,
        email: &str,
    ) -> Result<Customer, EngineError> {
        validate_customer(name, email)?;
        let email = normalize_email(email);

        let mut guard = self.facility_write(&facility_id).await?;
        if let Some(existing) = guard.customer_by_email(&email) {
            return Ok(existing.clone());
        }
        if guard.customers.len() >= MAX_CUSTOMERS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many customers"));
        }

        let customer = Customer {
            id: Ulid::new(),
            facility_id,
            name: name.trim().to_string(),
            email,
        };
        let event = Event::CustomerRegistered { customer: customer.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!("customer {} registered in facility {facility_id}", customer.id);
        Ok(customer)
    }

    /// Admission: validate, then re-check conflicts and commit under the
    /// facility write lock. The only write is the booking itself.
    pub async fn admit(&self, facility_id: Ulid, req: AdmissionRequest) -> Result<Booking, EngineError> {
        validate_admission_shape(req.notes.as_deref(), req.idempotency_key.as_deref())?;

        let mut guard = self.facility_write(&facility_id).await?;

        // A retry is answered before the clock check so it still succeeds
        // once the booked start has passed.
        if let Some(key) = &req.idempotency_key
            && let Some(existing) = guard.idempotency.get(key).and_then(|id| guard.booking(id)) {
                if !existing.matches_request(&req) {
                    return Err(EngineError::Validation(format!(
                        "idempotency key {key:?} already used for booking {}",
                        existing.id
                    )));
                }
                tracing::debug!("idempotent replay of booking {} (key {key})", existing.id);
                metrics::counter!(observability::ADMISSIONS_TOTAL, "outcome" => "replayed").increment(1);
                return Ok(existing.clone());
            }

        let now = now_ms();
        if req.start < now {
            return Err(EngineError::Validation("start time is in the past".into()));
        }

        if !guard.customers.contains_key(&req.customer_id) {
            return Err(EngineError::Validation(format!("unknown customer {}", req.customer_id)));
        }
        let service = guard
            .services
            .get(&req.service_id)
            .ok_or_else(|| EngineError::Validation(format!("unknown service {}", req.service_id)))?;
        if !service.active {
            return Err(EngineError::Validation(format!("service {} is not active", service.id)));
        }
        let end = req
            .start
            .checked_add(service.duration_ms())
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        let span = Span::new(req.start, end);
        validate_span(&span)?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }

        if let Err(e) = check_no_conflict(&guard, &span, req.staff_id) {
            metrics::counter!(observability::ADMISSIONS_TOTAL, "outcome" => "slot_taken").increment(1);
            tracing::debug!("admission rejected in facility {facility_id}: {e}");
            return Err(e);
        }

        let status = if guard.auto_confirm {
            BookingStatus::Confirmed
        } else {
            BookingStatus::Pending
        };
        let booking = Booking {
            id: Ulid::new(),
            facility_id,
            customer_id: req.customer_id,
            staff_id: req.staff_id,
            service_id: req.service_id,
            span,
            status,
            notes: req.notes,
            idempotency_key: req.idempotency_key,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingAdmitted { booking: booking.clone() };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(observability::ADMISSIONS_TOTAL, "outcome" => "admitted").increment(1);
        tracing::info!("booking {} admitted in facility {facility_id} ({status})", booking.id);
        Ok(booking)
    }

    /// Identity first, then admission; two separate critical sections.
    pub async fn create_booking(&self, facility_id: Ulid, req: BookingRequest) -> Result<Booking, EngineError> {
        validate_customer(&req.customer_name, &req.customer_email)?;
        validate_admission_shape(req.notes.as_deref(), req.idempotency_key.as_deref())?;

        let customer = self
            .resolve_customer(facility_id, &req.customer_name, &req.customer_email)
            .await?;
        self.admit(
            facility_id,
            AdmissionRequest {
                customer_id: customer.id,
                service_id: req.service_id,
                start: ms_from_naive(req.start),
                staff_id: req.staff_id,
                notes: req.notes,
                idempotency_key: req.idempotency_key,
            },
        )
        .await
    }

    pub async fn set_booking_status(&self, booking_id: Ulid, status: BookingStatus) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let from = guard
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?
            .status;
        if !from.can_transition_to(status) {
            return Err(EngineError::InvalidTransition { from, to: status });
        }

        let event = Event::BookingStatusChanged {
            id: booking_id,
            facility_id: guard.id,
            status,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(observability::STATUS_TRANSITIONS_TOTAL, "to" => status.as_str()).increment(1);
        tracing::info!("booking {booking_id}: {from} -> {status}");

        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.set_booking_status(booking_id, BookingStatus::Cancelled).await
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Every facility read lock is held until the writer has swapped files, so
    /// no commit can land in the old log after the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;

        let mut shared: Vec<(Ulid, super::SharedFacilityState)> = self
            .facilities
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        shared.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(shared.len());
        for (_, fs) in shared {
            guards.push(fs.read_owned().await);
        }

        let mut events = Vec::new();
        for fs in &guards {
            events.push(Event::FacilityCreated {
                id: fs.id,
                name: fs.name.clone(),
                slot_minutes: fs.slot_minutes,
                auto_confirm: fs.auto_confirm,
                hours: fs.hours.clone(),
            });
            events.extend(fs.services.values().map(|s| Event::ServiceUpserted { service: s.clone() }));
            events.extend(fs.customers.values().map(|c| Event::CustomerRegistered { customer: c.clone() }));
            events.extend(fs.bookings.iter().map(|b| Event::BookingAdmitted { booking: b.clone() }));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;

        tracing::info!("WAL compacted to {count} events");
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

// ── Request validation (no store access) ─────────────────────────

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn validate_customer(name: &str, email: &str) -> Result<(), EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Validation("customer name is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("customer name too long"));
    }
    let email = email.trim();
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    if !is_plausible_email(email) {
        return Err(EngineError::Validation(format!("invalid email: {email:?}")));
    }
    Ok(())
}

fn is_plausible_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

pub(crate) fn validate_admission_shape(notes: Option<&str>, key: Option<&str>) -> Result<(), EngineError> {
    if notes.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    if let Some(k) = key {
        if k.is_empty() {
            return Err(EngineError::Validation("idempotency key must not be empty".into()));
        }
        if k.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(EngineError::LimitExceeded("idempotency key too long"));
        }
    }
    Ok(())
}

fn validate_service(service: &Service) -> Result<(), EngineError> {
    if service.name.trim().is_empty() {
        return Err(EngineError::Validation("service name is required".into()));
    }
    if service.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("service name too long"));
    }
    if service.duration_min == 0 {
        return Err(EngineError::Validation("service duration must be positive".into()));
    }
    if service.duration_min > MAX_SERVICE_DURATION_MIN {
        return Err(EngineError::LimitExceeded("service duration too long"));
    }
    if service.price < 0 {
        return Err(EngineError::Validation("service price must not be negative".into()));
    }
    if service.category.as_ref().is_some_and(|c| c.len() > MAX_CATEGORY_LEN) {
        return Err(EngineError::LimitExceeded("category too long"));
    }
    Ok(())
}
