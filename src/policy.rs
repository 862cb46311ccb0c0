//! Business rules for slot generation and booking that product may tune.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::{Minute, ProviderKind};

/// How far past `base_date` a slot request looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionType {
    #[default]
    NextWeek,
    TwoWeeks,
    Month,
}

impl FromStr for SuggestionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "next_week" => Ok(SuggestionType::NextWeek),
            "two_weeks" => Ok(SuggestionType::TwoWeeks),
            "month" => Ok(SuggestionType::Month),
            other => Err(format!("unknown suggestion type: {other}")),
        }
    }
}

/// Days added to `base_date` for each suggestion type. The range end is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeTable {
    pub next_week: u32,
    pub two_weeks: u32,
    pub month: u32,
}

impl Default for RangeTable {
    fn default() -> Self {
        Self {
            next_week: 7,
            two_weeks: 14,
            month: 30,
        }
    }
}

impl RangeTable {
    pub fn days(&self, kind: SuggestionType) -> u32 {
        match kind {
            SuggestionType::NextWeek => self.next_week,
            SuggestionType::TwoWeeks => self.two_weeks,
            SuggestionType::Month => self.month,
        }
    }
}

/// Which provider kinds have their weekly windows and breaks enforced at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleEnforcement {
    /// Doctors and members alike.
    #[default]
    AllKinds,
    /// Only members; doctor bookings are checked against other bookings only.
    MembersOnly,
}

impl ScheduleEnforcement {
    pub fn applies_to(self, kind: ProviderKind) -> bool {
        match self {
            ScheduleEnforcement::AllKinds => true,
            ScheduleEnforcement::MembersOnly => kind == ProviderKind::Member,
        }
    }
}

impl FromStr for ScheduleEnforcement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all_kinds" | "all" => Ok(ScheduleEnforcement::AllKinds),
            "members_only" => Ok(ScheduleEnforcement::MembersOnly),
            other => Err(format!("unknown enforcement mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPolicy {
    /// Slots on the current day must start at least this far from now.
    pub lead_time: Minute,
    /// Requests made at or after this minute of the day start from tomorrow.
    /// `None` disables the rollover.
    pub rollover_after: Option<Minute>,
    pub default_max_per_day: usize,
    /// Length of the flat "next available" list.
    pub next_available: usize,
    pub ranges: RangeTable,
    pub enforcement: ScheduleEnforcement,
    /// Refuse bookings that start before the current clinic-local time.
    pub reject_past: bool,
}

impl Default for SlotPolicy {
    fn default() -> Self {
        Self {
            lead_time: 30,
            rollover_after: Some(18 * 60),
            default_max_per_day: 10,
            next_available: 5,
            ranges: RangeTable::default(),
            enforcement: ScheduleEnforcement::AllKinds,
            reject_past: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_table_defaults() {
        let t = RangeTable::default();
        assert_eq!(t.days(SuggestionType::NextWeek), 7);
        assert_eq!(t.days(SuggestionType::TwoWeeks), 14);
        assert_eq!(t.days(SuggestionType::Month), 30);
    }

    #[test]
    fn enforcement_modes() {
        assert!(ScheduleEnforcement::AllKinds.applies_to(ProviderKind::Doctor));
        assert!(ScheduleEnforcement::MembersOnly.applies_to(ProviderKind::Member));
        assert!(!ScheduleEnforcement::MembersOnly.applies_to(ProviderKind::Doctor));
        assert_eq!("members_only".parse(), Ok(ScheduleEnforcement::MembersOnly));
        assert!("strict".parse::<ScheduleEnforcement>().is_err());
    }

    #[test]
    fn suggestion_type_parse() {
        assert_eq!("month".parse(), Ok(SuggestionType::Month));
        assert!("year".parse::<SuggestionType>().is_err());
    }
}
