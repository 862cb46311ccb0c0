use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::policy::{SlotPolicy, SuggestionType};

use super::schedule::DaySchedule;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySlots {
    pub date: NaiveDate,
    pub day_of_week: u8,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    #[serde(flatten)]
    pub slot: Slot,
    pub preferred: bool,
}

/// Advisory output of slot generation. Holds no reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotReport {
    pub range_start: NaiveDate,
    pub range_end: NaiveDate,
    pub duration_minutes: Minute,
    pub total_slots: usize,
    pub days: Vec<DaySlots>,
    pub next_available: Vec<Suggestion>,
}

/// Clinic-local date and minute captured once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Now {
    pub date: NaiveDate,
    pub minute: Minute,
}

impl Now {
    pub fn of(clock: &dyn Clock) -> Self {
        let at = clock.now_local();
        Self {
            date: at.date(),
            minute: minute_of(at.time()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWalk {
    pub duration: Minute,
    pub max_per_day: usize,
}

/// First step of a window's grid (`start + k * duration`) at or after `cutoff`.
pub fn first_step_at_or_after(window_start: Minute, cutoff: Minute, duration: Minute) -> Minute {
    if cutoff <= window_start {
        return window_start;
    }
    let steps = (cutoff - window_start).div_ceil(duration);
    window_start + steps * duration
}

/// Inclusive date range for a request: base date (after the evening rollover)
/// through base + the suggestion type's day count.
pub fn resolve_range(
    policy: &SlotPolicy,
    now: Now,
    base_date: Option<NaiveDate>,
    suggestion: SuggestionType,
) -> (NaiveDate, NaiveDate) {
    let mut base = base_date.unwrap_or(now.date);
    if base == now.date
        && policy.rollover_after.is_some_and(|at| now.minute >= at)
        && let Some(tomorrow) = base.checked_add_days(Days::new(1))
    {
        base = tomorrow;
    }
    let days = u64::from(policy.ranges.days(suggestion));
    let end = base.checked_add_days(Days::new(days)).unwrap_or(NaiveDate::MAX);
    (base, end)
}

/// Walk every window of one resolved day. Slots step by `duration` from each
/// window's start; remainders shorter than `duration` are dropped.
pub fn day_slots(
    provider_id: Ulid,
    date: NaiveDate,
    day: &DaySchedule,
    walk: SlotWalk,
    not_before: Option<Minute>,
) -> Vec<Slot> {
    if day.is_closed() || walk.max_per_day == 0 {
        return Vec::new();
    }
    let duration = walk.duration;
    let mut starts = Vec::new();
    for w in &day.windows {
        let mut start = match not_before {
            Some(cutoff) => first_step_at_or_after(w.start, cutoff, duration),
            None => w.start,
        };
        while start + duration <= w.end {
            let span = Span::new(start, start + duration);
            if !day.hits_break(&span) && !day.hits_booking(&span) {
                starts.push(start);
            }
            start += duration;
        }
    }
    // Overlapping windows may propose the same start twice.
    starts.sort_unstable();
    starts.dedup();
    starts.truncate(walk.max_per_day);
    starts
        .into_iter()
        .map(|s| Slot::open(provider_id, date, Span::new(s, s + duration)))
        .collect()
}

/// Days in `[from, to]` that have at least one slot. Dates before today
/// yield nothing; today's slots respect the lead time.
pub fn walk_range(
    rs: &ProviderState,
    from: NaiveDate,
    to: NaiveDate,
    walk: SlotWalk,
    now: Now,
    lead_time: Minute,
) -> Vec<DaySlots> {
    if !rs.active {
        return Vec::new();
    }
    let cutoff_today = now.minute + lead_time;
    let mut days = Vec::new();
    for date in from.iter_days().take_while(|d| *d <= to) {
        if date < now.date {
            continue;
        }
        let not_before = (date == now.date).then_some(cutoff_today);
        let day = DaySchedule::resolve(rs, date, None);
        let slots = day_slots(rs.id, date, &day, walk, not_before);
        if !slots.is_empty() {
            days.push(DaySlots {
                date,
                day_of_week: day_of_week(date),
                slots,
            });
        }
    }
    days
}

/// The earliest bookable slot on or after `from` within the policy's short range.
pub fn first_open_slot(
    rs: &ProviderState,
    from: NaiveDate,
    duration: Minute,
    policy: &SlotPolicy,
    now: Now,
) -> Option<Slot> {
    let to = from
        .checked_add_days(Days::new(u64::from(policy.ranges.next_week)))
        .unwrap_or(NaiveDate::MAX);
    let walk = SlotWalk {
        duration,
        max_per_day: 1,
    };
    walk_range(rs, from, to, walk, now, policy.lead_time)
        .into_iter()
        .next()
        .and_then(|d| d.slots.into_iter().next())
}

/// Interleave several providers' days, ordered by (date, start, provider).
pub fn merge_days(per_provider: Vec<Vec<DaySlots>>) -> Vec<DaySlots> {
    let mut by_date: BTreeMap<NaiveDate, Vec<Slot>> = BTreeMap::new();
    for days in per_provider {
        for day in days {
            by_date.entry(day.date).or_default().extend(day.slots);
        }
    }
    by_date
        .into_iter()
        .map(|(date, mut slots)| {
            slots.sort_by_key(|s| (s.start_time, s.provider_id));
            DaySlots {
                date,
                day_of_week: day_of_week(date),
                slots,
            }
        })
        .collect()
}

pub fn assemble_report(
    range: (NaiveDate, NaiveDate),
    duration: Minute,
    days: Vec<DaySlots>,
    next_n: usize,
) -> SlotReport {
    let next_available = days
        .iter()
        .flat_map(|d| d.slots.iter())
        .take(next_n)
        .enumerate()
        .map(|(i, slot)| Suggestion {
            slot: slot.clone(),
            preferred: i == 0,
        })
        .collect();
    SlotReport {
        range_start: range.0,
        range_end: range.1,
        duration_minutes: duration,
        total_slots: days.iter().map(|d| d.slots.len()).sum(),
        days,
        next_available,
    }
}
