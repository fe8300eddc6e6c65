use chrono::NaiveDateTime;

use crate::model::*;

// ── Availability Resolver ─────────────────────────────────────────

/// Mark each candidate start free or taken.
///
/// A candidate occupies `[start, start + duration)` and is taken when it
/// overlaps any non-cancelled booking in `existing`. Callers pass the bookings
/// already narrowed to the right facility/staff scope; cancelled ones are
/// skipped here regardless. Output is ascending by start.
pub fn resolve_slots<'a, I>(candidates: I, duration_ms: Ms, existing: &[&'a Booking]) -> Vec<Slot>
where
    I: IntoIterator<Item = NaiveDateTime>,
{
    let busy: Vec<Span> = existing
        .iter()
        .filter(|b| b.status.occupies())
        .map(|b| b.span)
        .collect();

    let mut slots: Vec<Slot> = candidates
        .into_iter()
        .map(|start| {
            let begin = ms_from_naive(start);
            let occupied = Span::new(begin, begin + duration_ms);
            Slot {
                start,
                available: !busy.iter().any(|b| b.overlaps(&occupied)),
            }
        })
        .collect();

    slots.sort_by_key(|s| s.start);
    slots
}
