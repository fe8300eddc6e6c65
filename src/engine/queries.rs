use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::availability::resolve_slots;
use super::slots::candidates;
use super::{Engine, EngineError};

impl Engine {
    /// Every candidate start for `service` on `date`, each marked free or taken.
    ///
    /// Unknown facility or service, an inactive service and a closed day all
    /// yield no slots. A broken hours policy is logged and also yields none.
    pub async fn available_slots(
        &self,
        facility_id: Ulid,
        date: NaiveDate,
        service_id: Ulid,
        staff: Option<Ulid>,
    ) -> Result<Vec<Slot>, EngineError> {
        metrics::counter!(observability::SLOT_QUERIES_TOTAL).increment(1);
        let fs = match self.get_facility(&facility_id) {
            Some(fs) => fs,
            None => return Ok(vec![]),
        };
        let guard = fs.read().await;

        let Some(service) = guard.services.get(&service_id).filter(|s| s.active) else {
            return Ok(vec![]);
        };
        let Some(hours) = guard.hours.for_date(date) else {
            return Ok(vec![]);
        };

        let starts = match candidates(date, hours, service.duration_min, guard.slot_minutes) {
            Ok(starts) => starts,
            Err(e) => {
                tracing::warn!("facility {facility_id}: no slots on {date}: {e}");
                return Ok(vec![]);
            }
        };

        // Every candidate interval lies inside opening hours.
        let midnight = ms_from_naive(date.and_time(NaiveTime::MIN));
        let open_window = Span::new(
            midnight + hours.open_min as Ms * MINUTE_MS,
            midnight + hours.close_min as Ms * MINUTE_MS,
        );
        let existing: Vec<&Booking> = guard.occupying(&open_window, staff).collect();
        Ok(resolve_slots(starts, service.duration_ms(), &existing))
    }

    /// Bookings of a facility ordered by start, cancelled included.
    /// `date` keeps those starting that day; `staff` keeps one staff member's.
    pub async fn list_bookings(
        &self,
        facility_id: Ulid,
        date: Option<NaiveDate>,
        staff: Option<Ulid>,
    ) -> Result<Vec<Booking>, EngineError> {
        let fs = match self.get_facility(&facility_id) {
            Some(fs) => fs,
            None => return Ok(vec![]),
        };
        let guard = fs.read().await;

        let scanned: &[Booking] = match date {
            Some(d) => {
                let midnight = ms_from_naive(d.and_time(NaiveTime::MIN));
                guard.starting_within(&Span::new(midnight, midnight + DAY_MS))
            }
            None => &guard.bookings,
        };
        Ok(scanned
            .iter()
            .filter(|b| staff.is_none_or(|s| b.staff_id == Some(s)))
            .cloned()
            .collect())
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let facility_id = self
            .facility_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let guard = fs.read().await;
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    pub async fn list_facilities(&self) -> Vec<FacilityInfo> {
        let shared: Vec<_> = self.facilities.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for fs in shared {
            let guard = fs.read().await;
            out.push(FacilityInfo {
                id: guard.id,
                name: guard.name.clone(),
                slot_minutes: guard.slot_minutes,
                auto_confirm: guard.auto_confirm,
            });
        }
        out.sort_by_key(|f| f.id);
        out
    }

    pub async fn list_services(&self, facility_id: Ulid) -> Result<Vec<Service>, EngineError> {
        let fs = match self.get_facility(&facility_id) {
            Some(fs) => fs,
            None => return Ok(vec![]),
        };
        let guard = fs.read().await;
        let mut services: Vec<Service> = guard.services.values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(services)
    }
}
