//! Request bodies and query strings. Times travel as `HH:MM` (or `HH:MM:SS`).

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};
use ulid::Ulid;

use crate::model::{hhmm, BookingStatus, BreakKind, Minute, ProviderKind};
use crate::policy::SuggestionType;

fn default_duration() -> Minute {
    30
}

fn default_break_kind() -> BreakKind {
    BreakKind::Other
}

/// Tell an explicit `null` (`Some(None)`) apart from a missing field (`None`).
/// Pair with `#[serde(default)]`.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct CreateProvider {
    /// Generated when omitted.
    pub id: Option<Ulid>,
    pub kind: ProviderKind,
    pub name: Option<String>,
    pub chapter: Option<String>,
    #[serde(default)]
    pub buffer_after: Minute,
}

/// `null` clears `name` or `chapter`; an absent field keeps it.
#[derive(Debug, Deserialize)]
pub struct UpdateProvider {
    #[serde(default, deserialize_with = "nullable")]
    pub name: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub chapter: Option<Option<String>>,
    pub buffer_after: Option<Minute>,
    pub active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderListQuery {
    pub kind: Option<ProviderKind>,
    pub chapter: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleQuery {
    pub day_of_week: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct CreateWindow {
    pub id: Option<Ulid>,
    pub day_of_week: u8,
    #[serde(with = "hhmm")]
    pub start_time: Minute,
    #[serde(with = "hhmm")]
    pub end_time: Minute,
}

#[derive(Debug, Deserialize)]
pub struct CreateBreak {
    pub id: Option<Ulid>,
    pub day_of_week: u8,
    #[serde(with = "hhmm")]
    pub start_time: Minute,
    #[serde(with = "hhmm")]
    pub end_time: Minute,
    #[serde(default = "default_break_kind")]
    pub kind: BreakKind,
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRule {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
    pub base_date: Option<NaiveDate>,
    #[serde(default = "default_duration", alias = "duration")]
    pub duration_minutes: Minute,
    #[serde(default)]
    pub suggestion_type: SuggestionType,
    pub max_per_day: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ChapterSlotsQuery {
    pub chapter: String,
    pub kind: Option<ProviderKind>,
    pub base_date: Option<NaiveDate>,
    #[serde(default = "default_duration", alias = "duration")]
    pub duration_minutes: Minute,
    #[serde(default)]
    pub suggestion_type: SuggestionType,
    pub max_per_day: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CheckSlotQuery {
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: Minute,
    #[serde(default = "default_duration", alias = "duration")]
    pub duration_minutes: Minute,
}

#[derive(Debug, Deserialize)]
pub struct DateQuery {
    pub date: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct CreateBooking {
    pub id: Option<Ulid>,
    pub provider_id: Ulid,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: Minute,
    #[serde(default = "default_duration", alias = "duration")]
    pub duration_minutes: Minute,
    pub label: Option<String>,
    #[serde(default)]
    pub allow_overbooking: bool,
}

#[derive(Debug, Deserialize)]
pub struct BookingListQuery {
    pub provider_id: Option<Ulid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    #[serde(default)]
    pub include_cancelled: bool,
}

/// Narrows the event stream to one provider; the whole tenant otherwise.
#[derive(Debug, Deserialize)]
pub struct EventStreamQuery {
    pub provider_id: Option<Ulid>,
}

#[derive(Debug, Deserialize)]
pub struct StatusChange {
    pub status: BookingStatus,
}

#[derive(Debug, Deserialize)]
pub struct Reschedule {
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: Minute,
    #[serde(alias = "duration")]
    pub duration_minutes: Option<Minute>,
    #[serde(default)]
    pub allow_overbooking: bool,
}
