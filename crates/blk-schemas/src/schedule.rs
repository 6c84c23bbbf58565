//! Civil-time resolution and the overlap rule.
//!
//! Deterministic, pure logic. No IO, no wall-clock: callers pass `now`.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Knobs the reservation protocol reads on every claim/unclaim.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReservationPolicy {
    /// Reference timezone that block dates/times are expressed in.
    pub timezone: Tz,
    /// Unclaiming this close to start (inclusive) costs points.
    pub penalty_window_minutes: i64,
    pub late_unclaim_points: i32,
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            penalty_window_minutes: 60,
            late_unclaim_points: -20,
        }
    }
}

impl ReservationPolicy {
    /// Calendar day of `at` in the reference timezone.
    pub fn civil_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.timezone).date_naive()
    }

    /// Date compliance facts are judged on for a block dated `block_date`:
    /// the block's own day, or today if that is later.
    pub fn eligibility_date(&self, block_date: NaiveDate, now: DateTime<Utc>) -> NaiveDate {
        block_date.max(self.civil_date(now))
    }

    /// Whole minutes from `now` until `starts_at`, truncated toward zero
    /// (negative once started). For display; use `within_penalty_window`
    /// to decide lateness.
    pub fn minutes_until(&self, starts_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        starts_at.signed_duration_since(now).num_minutes()
    }

    /// True when `starts_at` is at most the penalty window away from `now`,
    /// measured on the exact duration.
    pub fn within_penalty_window(&self, starts_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        starts_at.signed_duration_since(now) <= Duration::minutes(self.penalty_window_minutes)
    }
}

/// A block's `[starts_at, ends_at)` interval resolved to UTC instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockWindow {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl BlockWindow {
    /// Resolve civil date + local times in `tz`. An `end` at or before `start`
    /// rolls over to the following day.
    pub fn resolve(date: NaiveDate, start: NaiveTime, end: NaiveTime, tz: Tz) -> Self {
        let starts_at = localize(tz, date.and_time(start));
        let end_date = if end <= start {
            date.succ_opt().unwrap_or(date)
        } else {
            date
        };
        let ends_at = localize(tz, end_date.and_time(end));
        Self { starts_at, ends_at }
    }

    /// Half-open overlap: `s1 < e2 && s2 < e1`. Touching endpoints do not
    /// overlap.
    pub fn overlaps(&self, other: &BlockWindow) -> bool {
        self.starts_at < other.ends_at && other.starts_at < self.ends_at
    }
}

/// Map a wall-clock time to UTC. Ambiguous times (DST fall-back) take the
/// earlier instant; nonexistent times (spring-forward gap) shift forward an
/// hour.
fn localize(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => match tz.from_local_datetime(&(naive + Duration::hours(1))) {
            LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
            LocalResult::None => Utc.from_utc_datetime(&naive),
        },
    }
}

/// A driver may take on at most one overlap per calendar day.
///
/// `same_day` holds the windows of the driver's accepted claims on the
/// candidate's date. The candidate is refused when it overlaps something and
/// the day would then contain two or more overlapping pairs.
pub fn overlap_limit_exceeded(candidate: &BlockWindow, same_day: &[BlockWindow]) -> bool {
    let new_overlaps = same_day.iter().filter(|w| w.overlaps(candidate)).count();
    if new_overlaps == 0 {
        return false;
    }
    let mut existing_pairs = 0usize;
    for (i, a) in same_day.iter().enumerate() {
        for b in &same_day[i + 1..] {
            if a.overlaps(b) {
                existing_pairs += 1;
            }
        }
    }
    existing_pairs + new_overlaps >= 2
}
