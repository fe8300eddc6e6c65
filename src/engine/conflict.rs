use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// First in-scope, non-cancelled booking overlapping `candidate`.
pub(crate) fn find_conflict<'a>(
    scanned: impl IntoIterator<Item = &'a Booking>,
    candidate: &Span,
    staff: Option<Ulid>,
) -> Option<&'a Booking> {
    scanned
        .into_iter()
        .find(|b| b.status.occupies() && b.in_scope(staff) && b.span.overlaps(candidate))
}

/// Conflict check over an explicit start-range window. Any window that covers
/// `[candidate.start - lookback, candidate.end)` gives the same answer.
pub(crate) fn check_no_conflict_within(
    fs: &FacilityState,
    candidate: &Span,
    staff: Option<Ulid>,
    window: &Span,
) -> Result<(), EngineError> {
    match find_conflict(fs.starting_within(window), candidate, staff) {
        Some(existing) => Err(EngineError::SlotTaken(existing.id)),
        None => Ok(()),
    }
}

/// Conflict check over the narrowest window that cannot miss an overlap.
pub(crate) fn check_no_conflict(
    fs: &FacilityState,
    candidate: &Span,
    staff: Option<Ulid>,
) -> Result<(), EngineError> {
    let window = Span::new(candidate.start - fs.lookback_ms(), candidate.end);
    check_no_conflict_within(fs, candidate, staff, &window)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const H: Ms = 3_600_000;

    fn at(h: u32, m: u32) -> Ms {
        ms_from_naive(NaiveDate::from_ymd_opt(2030, 3, 4).unwrap().and_hms_opt(h, m, 0).unwrap())
    }

    fn booking(start: Ms, end: Ms, staff: Option<Ulid>, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            facility_id: Ulid::nil(),
            customer_id: Ulid::new(),
            staff_id: staff,
            service_id: Ulid::new(),
            span: Span::new(start, end),
            status,
            notes: None,
            idempotency_key: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn facility(bookings: Vec<Booking>) -> FacilityState {
        let mut fs = FacilityState::new(Ulid::new(), None, 30, true);
        for b in bookings {
            fs.insert_booking(b);
        }
        fs
    }

    #[test]
    fn overlap_is_slot_taken() {
        let existing = booking(at(10, 0), at(11, 0), None, BookingStatus::Confirmed);
        let id = existing.id;
        let fs = facility(vec![existing]);
        let result = check_no_conflict(&fs, &Span::new(at(10, 30), at(11, 30)), None);
        assert!(matches!(result, Err(EngineError::SlotTaken(got)) if got == id));
    }

    #[test]
    fn back_to_back_is_fine() {
        let fs = facility(vec![booking(at(10, 0), at(11, 0), None, BookingStatus::Confirmed)]);
        assert!(check_no_conflict(&fs, &Span::new(at(11, 0), at(12, 0)), None).is_ok());
        assert!(check_no_conflict(&fs, &Span::new(at(9, 0), at(10, 0)), None).is_ok());
    }

    #[test]
    fn long_earlier_booking_found_by_lookback() {
        // Starts 6h before the candidate; a same-hour scan would miss it.
        let fs = facility(vec![booking(at(3, 0), at(12, 0), None, BookingStatus::Confirmed)]);
        let candidate = Span::new(at(9, 0), at(9, 30));
        assert!(check_no_conflict(&fs, &candidate, None).is_err());
        let too_narrow = Span::new(at(8, 0), candidate.end);
        assert!(check_no_conflict_within(&fs, &candidate, None, &too_narrow).is_ok());
    }

    #[test]
    fn wider_window_never_changes_outcome() {
        let alice = Ulid::new();
        let fs = facility(vec![
            booking(at(1, 0), at(4, 0), Some(alice), BookingStatus::Confirmed),
            booking(at(9, 0), at(10, 0), None, BookingStatus::Cancelled),
            booking(at(10, 0), at(10, 45), Some(alice), BookingStatus::Pending),
            booking(at(13, 0), at(14, 0), None, BookingStatus::Confirmed),
            booking(at(20, 0), at(23, 0), Some(alice), BookingStatus::Completed),
        ]);
        let candidates: Vec<Span> = (0..46)
            .map(|i| at(0, 0) + i * H / 2)
            .map(|s| Span::new(s, s + H))
            .collect();
        for candidate in &candidates {
            for staff in [None, Some(alice), Some(Ulid::new())] {
                let narrow = check_no_conflict(&fs, candidate, staff).is_ok();
                for widen in [H, 12 * H, 48 * H] {
                    let wide = Span::new(candidate.start - fs.lookback_ms() - widen, candidate.end + widen);
                    let outcome = check_no_conflict_within(&fs, candidate, staff, &wide).is_ok();
                    assert_eq!(narrow, outcome, "{candidate:?} staff={staff:?} widen={widen}");
                }
            }
        }
    }

    #[test]
    fn staff_scope_isolates_members() {
        let alice = Ulid::new();
        let bob = Ulid::new();
        let fs = facility(vec![booking(at(10, 0), at(11, 0), Some(alice), BookingStatus::Confirmed)]);
        let candidate = Span::new(at(10, 0), at(11, 0));
        assert!(check_no_conflict(&fs, &candidate, Some(alice)).is_err());
        assert!(check_no_conflict(&fs, &candidate, Some(bob)).is_ok());
        // Unscoped requests compete with the whole facility.
        assert!(check_no_conflict(&fs, &candidate, None).is_err());
    }

    #[test]
    fn cancelled_never_conflicts() {
        let fs = facility(vec![booking(at(10, 0), at(11, 0), None, BookingStatus::Cancelled)]);
        assert!(check_no_conflict(&fs, &Span::new(at(10, 0), at(11, 0)), None).is_ok());
    }

    #[test]
    fn span_validation() {
        assert!(validate_span(&Span::new(at(9, 0), at(10, 0))).is_ok());
        assert!(matches!(
            validate_span(&Span::new(0, 1000)),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
