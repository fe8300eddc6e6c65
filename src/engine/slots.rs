use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::model::DayHours;

use super::EngineError;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Candidate start times for one day: `[open, close - duration]` stepped by
/// the granularity. Lazy and finite; clone it to iterate again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCandidates {
    midnight: NaiveDateTime,
    next_min: u32,
    /// Inclusive. `None` when the service does not fit the day at all.
    last_min: Option<u32>,
    step_min: u32,
}

impl SlotCandidates {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            midnight: date.and_time(NaiveTime::MIN),
            next_min: 0,
            last_min: None,
            step_min: 1,
        }
    }
}

impl Iterator for SlotCandidates {
    type Item = NaiveDateTime;

    fn next(&mut self) -> Option<NaiveDateTime> {
        let last = self.last_min?;
        if self.next_min > last {
            return None;
        }
        let current = self.next_min;
        self.next_min += self.step_min;
        Some(self.midnight + Duration::minutes(current as i64))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = match self.last_min {
            Some(last) if self.next_min <= last => ((last - self.next_min) / self.step_min + 1) as usize,
            _ => 0,
        };
        (n, Some(n))
    }
}

impl ExactSizeIterator for SlotCandidates {}

/// Build the candidate sequence. Fails only on an invalid policy; a service
/// longer than the opening window is a valid, empty day.
pub fn candidates(
    date: NaiveDate,
    hours: DayHours,
    duration_min: u32,
    granularity_min: u32,
) -> Result<SlotCandidates, EngineError> {
    validate_hours(hours)?;
    if granularity_min == 0 {
        return Err(EngineError::Configuration("slot granularity must be positive".into()));
    }
    if duration_min == 0 {
        return Err(EngineError::Validation("service duration must be positive".into()));
    }
    let last_min = hours
        .close_min
        .checked_sub(duration_min)
        .filter(|last| *last >= hours.open_min);
    Ok(SlotCandidates {
        midnight: date.and_time(NaiveTime::MIN),
        next_min: hours.open_min,
        last_min,
        step_min: granularity_min,
    })
}

pub fn validate_hours(hours: DayHours) -> Result<(), EngineError> {
    if hours.close_min > MINUTES_PER_DAY {
        return Err(EngineError::Configuration(format!(
            "closing minute {} is past midnight",
            hours.close_min
        )));
    }
    if hours.close_min <= hours.open_min {
        return Err(EngineError::Configuration(format!(
            "closing minute {} must be after opening minute {}",
            hours.close_min, hours.open_min
        )));
    }
    Ok(())
}
