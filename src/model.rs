use std::collections::BTreeMap;
use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since clinic-local midnight. The only time-of-day type.
pub type Minute = u32;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// Half-open interval `[start, end)` within one clinic day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but rejects empty spans and spans running past midnight.
    pub fn checked(start: Minute, end: Minute) -> Option<Self> {
        (start < end && end <= MINUTES_PER_DAY).then_some(Self { start, end })
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    /// `[a, b)` and `[c, d)` overlap iff `a < d && c < b`. Touching spans don't.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The span with its end pushed out by `minutes` of turnover time.
    pub fn padded(&self, minutes: Minute) -> Span {
        Span {
            start: self.start,
            end: self.end + minutes,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", fmt_clock(self.start), fmt_clock(self.end))
    }
}

// ── Clock strings ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time of day {0:?} (expected HH:MM or HH:MM:SS)")]
pub struct ClockParseError(pub String);

/// Parse `HH:MM` or `HH:MM:SS` into minutes since midnight. Seconds are
/// truncated. `24:00` is accepted as the end of the day.
pub fn parse_clock(s: &str) -> Result<Minute, ClockParseError> {
    let t = s.trim();
    if t == "24:00" || t == "24:00:00" {
        return Ok(MINUTES_PER_DAY);
    }
    let time = NaiveTime::parse_from_str(t, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M"))
        .map_err(|_| ClockParseError(s.to_string()))?;
    Ok(minute_of(time))
}

pub fn fmt_clock(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

pub fn minute_of(t: NaiveTime) -> Minute {
    t.hour() * 60 + t.minute()
}

/// 0 = Sunday .. 6 = Saturday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Serde adapter rendering a `Minute` as `HH:MM`.
pub mod hhmm {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{fmt_clock, parse_clock, Minute};

    pub fn serialize<S: Serializer>(m: &Minute, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&fmt_clock(*m))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Minute, D::Error> {
        let raw = String::deserialize(d)?;
        parse_clock(&raw).map_err(serde::de::Error::custom)
    }
}

// ── Providers and their weekly shape ─────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Doctor,
    Member,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProviderKind::Doctor => "doctor",
            ProviderKind::Member => "member",
        })
    }
}

/// Recurring weekly range during which a provider can be booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub day_of_week: u8,
    #[serde(with = "hhmm")]
    pub start_time: Minute,
    #[serde(with = "hhmm")]
    pub end_time: Minute,
    pub active: bool,
}

impl AvailabilityWindow {
    pub fn span(&self) -> Span {
        Span::new(self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    Lunch,
    Personal,
    Other,
}

impl fmt::Display for BreakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakKind::Lunch => "lunch",
            BreakKind::Personal => "personal",
            BreakKind::Other => "other",
        })
    }
}

/// Recurring weekly range carved out of availability (lunch and the like).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakInterval {
    pub id: Ulid,
    pub day_of_week: u8,
    #[serde(with = "hhmm")]
    pub start_time: Minute,
    #[serde(with = "hhmm")]
    pub end_time: Minute,
    pub kind: BreakKind,
    pub label: Option<String>,
    pub active: bool,
}

impl BreakInterval {
    pub fn span(&self) -> Span {
        Span::new(self.start_time, self.end_time)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Every status except `Cancelled` occupies its interval.
    pub fn is_active(self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, InProgress)
                | (Pending, Cancelled)
                | (Confirmed, InProgress)
                | (Confirmed, Cancelled)
                | (InProgress, Completed)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: Minute,
    #[serde(with = "hhmm")]
    pub end_time: Minute,
    pub status: BookingStatus,
    pub label: Option<String>,
    /// Committed through the overbooking override.
    pub overbooked: bool,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::new(self.start_time, self.end_time)
    }
}

/// Why a candidate interval can't be booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictReason {
    ProviderInactive,
    OutsideAvailability,
    OverlapsBreak {
        break_id: Ulid,
        break_kind: BreakKind,
        #[serde(with = "hhmm")]
        start_time: Minute,
        #[serde(with = "hhmm")]
        end_time: Minute,
    },
    OverlapsBooking {
        booking_id: Ulid,
        #[serde(with = "hhmm")]
        start_time: Minute,
        #[serde(with = "hhmm")]
        end_time: Minute,
    },
}

impl ConflictReason {
    pub fn label(&self) -> &'static str {
        match self {
            ConflictReason::ProviderInactive => "provider_inactive",
            ConflictReason::OutsideAvailability => "outside_availability",
            ConflictReason::OverlapsBreak { .. } => "overlaps_break",
            ConflictReason::OverlapsBooking { .. } => "overlaps_booking",
        }
    }
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::ProviderInactive => f.write_str("provider is not taking bookings"),
            ConflictReason::OutsideAvailability => f.write_str("outside availability"),
            ConflictReason::OverlapsBreak {
                break_kind,
                start_time,
                end_time,
                ..
            } => write!(
                f,
                "overlaps {break_kind} break {}",
                Span::new(*start_time, *end_time)
            ),
            ConflictReason::OverlapsBooking {
                booking_id,
                start_time,
                end_time,
            } => write!(
                f,
                "overlaps existing appointment {booking_id} at {}",
                Span::new(*start_time, *end_time)
            ),
        }
    }
}

/// A computed candidate interval. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub provider_id: Ulid,
    pub date: NaiveDate,
    pub day_of_week: u8,
    #[serde(with = "hhmm")]
    pub start_time: Minute,
    #[serde(with = "hhmm")]
    pub end_time: Minute,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ConflictReason>,
}

impl Slot {
    pub fn open(provider_id: Ulid, date: NaiveDate, span: Span) -> Self {
        Self {
            provider_id,
            date,
            day_of_week: day_of_week(date),
            start_time: span.start,
            end_time: span.end,
            available: true,
            conflicts: Vec::new(),
        }
    }

    pub fn span(&self) -> Span {
        Span::new(self.start_time, self.end_time)
    }
}

// ── Per-provider state ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProviderState {
    pub id: Ulid,
    pub kind: ProviderKind,
    pub name: Option<String>,
    pub chapter: Option<String>,
    /// Turnover minutes after each booking (cleaning, notes).
    pub buffer_after: Minute,
    pub active: bool,
    /// Sorted by `(day_of_week, start_time)`.
    pub windows: Vec<AvailabilityWindow>,
    /// Sorted by `(day_of_week, start_time)`.
    pub breaks: Vec<BreakInterval>,
    /// Per date, sorted by `start_time`. Cancelled bookings are kept.
    pub bookings: BTreeMap<NaiveDate, Vec<Booking>>,
}

impl ProviderState {
    pub fn new(
        id: Ulid,
        kind: ProviderKind,
        name: Option<String>,
        chapter: Option<String>,
        buffer_after: Minute,
    ) -> Self {
        Self {
            id,
            kind,
            name,
            chapter,
            buffer_after,
            active: true,
            windows: Vec::new(),
            breaks: Vec::new(),
            bookings: BTreeMap::new(),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.windows.len() + self.breaks.len()
    }

    pub fn insert_window(&mut self, window: AvailabilityWindow) {
        let key = (window.day_of_week, window.start_time);
        let pos = self
            .windows
            .partition_point(|w| (w.day_of_week, w.start_time) <= key);
        self.windows.insert(pos, window);
    }

    pub fn insert_break(&mut self, brk: BreakInterval) {
        let key = (brk.day_of_week, brk.start_time);
        let pos = self
            .breaks
            .partition_point(|b| (b.day_of_week, b.start_time) <= key);
        self.breaks.insert(pos, brk);
    }

    /// Remove a window or break by id.
    pub fn remove_rule(&mut self, id: Ulid) -> bool {
        if let Some(pos) = self.windows.iter().position(|w| w.id == id) {
            self.windows.remove(pos);
            return true;
        }
        if let Some(pos) = self.breaks.iter().position(|b| b.id == id) {
            self.breaks.remove(pos);
            return true;
        }
        false
    }

    pub fn set_rule_active(&mut self, id: Ulid, active: bool) -> bool {
        if let Some(w) = self.windows.iter_mut().find(|w| w.id == id) {
            w.active = active;
            return true;
        }
        if let Some(b) = self.breaks.iter_mut().find(|b| b.id == id) {
            b.active = active;
            return true;
        }
        false
    }

    /// Insert keeping the day's list sorted by start time.
    pub fn insert_booking(&mut self, booking: Booking) {
        let day = self.bookings.entry(booking.date).or_default();
        let pos = day.partition_point(|b| b.start_time <= booking.start_time);
        day.insert(pos, booking);
    }

    /// Remove a booking entirely (used when moving it to a new slot).
    pub fn take_booking(&mut self, id: Ulid) -> Option<Booking> {
        let date = self.find_booking(id)?.date;
        let day = self.bookings.get_mut(&date)?;
        let pos = day.iter().position(|b| b.id == id)?;
        let booking = day.remove(pos);
        if day.is_empty() {
            self.bookings.remove(&date);
        }
        Some(booking)
    }

    pub fn find_booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.values().flatten().find(|b| b.id == id)
    }

    pub fn find_booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.values_mut().flatten().find(|b| b.id == id)
    }

    pub fn bookings_on(&self, date: NaiveDate) -> &[Booking] {
        self.bookings.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Bookings on `date` that still hold their interval.
    pub fn active_count_on(&self, date: NaiveDate) -> usize {
        self.bookings_on(date).iter().filter(|b| b.status.is_active()).count()
    }

    /// Non-cancelled bookings on `date` whose span overlaps `query`.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn active_overlapping(
        &self,
        date: NaiveDate,
        query: Span,
    ) -> impl Iterator<Item = &Booking> {
        let day = self.bookings_on(date);
        let right_bound = day.partition_point(|b| b.start_time < query.end);
        day[..right_bound]
            .iter()
            .filter(move |b| b.status.is_active() && b.end_time > query.start)
    }
}

/// Flat event records; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderRegistered {
        id: Ulid,
        kind: ProviderKind,
        name: Option<String>,
        chapter: Option<String>,
        buffer_after: Minute,
    },
    ProviderUpdated {
        id: Ulid,
        name: Option<String>,
        chapter: Option<String>,
        buffer_after: Minute,
        active: bool,
    },
    ProviderRemoved {
        id: Ulid,
    },
    WindowAdded {
        id: Ulid,
        provider_id: Ulid,
        day_of_week: u8,
        span: Span,
    },
    BreakAdded {
        id: Ulid,
        provider_id: Ulid,
        day_of_week: u8,
        span: Span,
        kind: BreakKind,
        label: Option<String>,
    },
    RuleToggled {
        id: Ulid,
        provider_id: Ulid,
        active: bool,
    },
    RuleRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        provider_id: Ulid,
        date: NaiveDate,
        span: Span,
        label: Option<String>,
        overbooked: bool,
    },
    BookingStatusChanged {
        id: Ulid,
        provider_id: Ulid,
        status: BookingStatus,
    },
    BookingRescheduled {
        id: Ulid,
        provider_id: Ulid,
        date: NaiveDate,
        span: Span,
        overbooked: bool,
    },
}

impl Event {
    /// The provider this event belongs to.
    pub fn provider_id(&self) -> Ulid {
        match self {
            Event::ProviderRegistered { id, .. }
            | Event::ProviderUpdated { id, .. }
            | Event::ProviderRemoved { id } => *id,
            Event::WindowAdded { provider_id, .. }
            | Event::BreakAdded { provider_id, .. }
            | Event::RuleToggled { provider_id, .. }
            | Event::RuleRemoved { provider_id, .. }
            | Event::BookingCreated { provider_id, .. }
            | Event::BookingStatusChanged { provider_id, .. }
            | Event::BookingRescheduled { provider_id, .. } => *provider_id,
        }
    }

    /// Stable snake_case name, used as the SSE event type.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ProviderRegistered { .. } => "provider_registered",
            Event::ProviderUpdated { .. } => "provider_updated",
            Event::ProviderRemoved { .. } => "provider_removed",
            Event::WindowAdded { .. } => "window_added",
            Event::BreakAdded { .. } => "break_added",
            Event::RuleToggled { .. } => "rule_toggled",
            Event::RuleRemoved { .. } => "rule_removed",
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingStatusChanged { .. } => "booking_status_changed",
            Event::BookingRescheduled { .. } => "booking_rescheduled",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: Ulid,
    pub kind: ProviderKind,
    pub name: Option<String>,
    pub chapter: Option<String>,
    pub buffer_after: Minute,
    pub active: bool,
}

impl From<&ProviderState> for ProviderInfo {
    fn from(rs: &ProviderState) -> Self {
        Self {
            id: rs.id,
            kind: rs.kind,
            name: rs.name.clone(),
            chapter: rs.chapter.clone(),
            buffer_after: rs.buffer_after,
            active: rs.active,
        }
    }
}
