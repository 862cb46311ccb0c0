use std::ops::Bound;
use std::time::Instant;

use chrono::NaiveDate;
use futures::future::join_all;
use serde::Serialize;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{SLOTS_GENERATED_TOTAL, SLOT_GENERATION_DURATION_SECONDS};
use crate::policy::SuggestionType;

use super::conflict::{find_conflicts, reject_past, requested_span};
use super::schedule::free_spans;
use super::slots::{assemble_report, merge_days, resolve_range, walk_range, SlotReport, SlotWalk};
use super::{Engine, EngineError, SharedProviderState};

#[derive(Debug, Clone)]
pub struct SlotRequest {
    pub provider_id: Ulid,
    /// Defaults to today in the clinic's local time.
    pub base_date: Option<NaiveDate>,
    pub duration: Minute,
    pub suggestion_type: SuggestionType,
    pub max_per_day: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ChapterSlotRequest {
    pub chapter: String,
    pub kind: Option<ProviderKind>,
    pub base_date: Option<NaiveDate>,
    pub duration: Minute,
    pub suggestion_type: SuggestionType,
    pub max_per_day: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct BookingFilter {
    pub provider_id: Option<Ulid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub include_cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSchedule {
    pub provider: ProviderInfo,
    pub windows: Vec<AvailabilityWindow>,
    pub breaks: Vec<BreakInterval>,
}

impl Engine {
    pub async fn provider_info(&self, id: Ulid) -> Result<ProviderInfo, EngineError> {
        let rs = self.get_provider(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(ProviderInfo::from(&*guard))
    }

    /// All providers, optionally filtered, ordered by id.
    pub async fn list_providers(&self, kind: Option<ProviderKind>, chapter: Option<&str>) -> Vec<ProviderInfo> {
        let mut out = Vec::new();
        for rs in self.providers_snapshot() {
            let guard = rs.read().await;
            if kind.is_some_and(|k| k != guard.kind) {
                continue;
            }
            if chapter.is_some_and(|c| guard.chapter.as_deref() != Some(c)) {
                continue;
            }
            out.push(ProviderInfo::from(&*guard));
        }
        out.sort_by_key(|p| p.id);
        out
    }

    /// Weekly rules, inactive ones included. `day_of_week` narrows to one day.
    pub async fn provider_schedule(
        &self,
        id: Ulid,
        day_of_week: Option<u8>,
    ) -> Result<ProviderSchedule, EngineError> {
        let rs = self.get_provider(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        let (windows, breaks) = match day_of_week {
            Some(dow) if dow > 6 => {
                return Err(EngineError::validation(format!(
                    "day_of_week must be 0 (Sunday) to 6 (Saturday), got {dow}"
                )));
            }
            Some(dow) => (
                guard.windows.iter().filter(|w| w.day_of_week == dow).cloned().collect(),
                guard.breaks.iter().filter(|b| b.day_of_week == dow).cloned().collect(),
            ),
            None => (guard.windows.clone(), guard.breaks.clone()),
        };
        Ok(ProviderSchedule {
            provider: ProviderInfo::from(&*guard),
            windows,
            breaks,
        })
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let provider_id = self.provider_for_entity(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.get_provider(&provider_id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard.find_booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Bookings ordered by (date, start, provider). Cancelled ones only on request.
    pub async fn list_bookings(&self, filter: BookingFilter) -> Result<Vec<Booking>, EngineError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to)
            && from > to
        {
            return Err(EngineError::validation("from must not be after to"));
        }
        let providers = match filter.provider_id {
            Some(id) => vec![self.get_provider(&id).ok_or(EngineError::NotFound(id))?],
            None => self.providers_snapshot(),
        };
        let range = (
            filter.from.map_or(Bound::Unbounded, Bound::Included),
            filter.to.map_or(Bound::Unbounded, Bound::Included),
        );

        let mut out = Vec::new();
        for rs in providers {
            let guard = rs.read().await;
            for (_, day) in guard.bookings.range(range) {
                out.extend(
                    day.iter()
                        .filter(|b| filter.include_cancelled || b.status.is_active())
                        .cloned(),
                );
            }
        }
        out.sort_by_key(|b| (b.date, b.start_time, b.provider_id));
        Ok(out)
    }

    /// Open time on one date: merged windows minus breaks and padded bookings.
    pub async fn free_spans(&self, provider_id: Ulid, date: NaiveDate) -> Result<Vec<Span>, EngineError> {
        let rs = self.get_provider(&provider_id).ok_or(EngineError::NotFound(provider_id))?;
        let guard = rs.read().await;
        if !guard.active {
            return Ok(Vec::new());
        }
        Ok(free_spans(&guard, date))
    }

    pub async fn generate_slots(&self, req: SlotRequest) -> Result<SlotReport, EngineError> {
        let started = Instant::now();
        let walk = self.slot_walk(req.duration, req.max_per_day)?;
        let now = self.now();
        let range = self.checked_range(req.base_date, req.suggestion_type)?;
        let rs = self
            .get_provider(&req.provider_id)
            .ok_or(EngineError::NotFound(req.provider_id))?;

        let days = {
            let guard = rs.read().await;
            walk_range(&guard, range.0, range.1, walk, now, self.policy.lead_time)
        };
        let report = assemble_report(range, walk.duration, days, self.policy.next_available);

        metrics::counter!(SLOTS_GENERATED_TOTAL, "scope" => "provider").increment(report.total_slots as u64);
        metrics::histogram!(SLOT_GENERATION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        debug!(
            provider = %req.provider_id,
            from = %range.0,
            to = %range.1,
            slots = report.total_slots,
            "generated slots"
        );
        Ok(report)
    }

    /// Slots across every active provider in a chapter, interleaved by time.
    pub async fn generate_chapter_slots(&self, req: ChapterSlotRequest) -> Result<SlotReport, EngineError> {
        let started = Instant::now();
        if req.chapter.is_empty() {
            return Err(EngineError::validation("chapter must not be empty"));
        }
        let walk = self.slot_walk(req.duration, req.max_per_day)?;
        let now = self.now();
        let range = self.checked_range(req.base_date, req.suggestion_type)?;

        let members = self.list_providers(req.kind, Some(&req.chapter)).await;
        if members.len() > MAX_CHAPTER_PROVIDERS {
            return Err(EngineError::LimitExceeded("too many providers in chapter"));
        }

        let lead_time = self.policy.lead_time;
        let walks = members
            .iter()
            .filter_map(|p| self.get_provider(&p.id))
            .map(|rs| async move {
                let guard = rs.read().await;
                walk_range(&guard, range.0, range.1, walk, now, lead_time)
            });
        let days = merge_days(join_all(walks).await);
        let report = assemble_report(range, walk.duration, days, self.policy.next_available);

        metrics::counter!(SLOTS_GENERATED_TOTAL, "scope" => "chapter").increment(report.total_slots as u64);
        metrics::histogram!(SLOT_GENERATION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        debug!(
            chapter = %req.chapter,
            providers = members.len(),
            slots = report.total_slots,
            "generated chapter slots"
        );
        Ok(report)
    }

    /// Advisory check of one specific time. Reports what the guard would say
    /// right now, without reserving anything.
    pub async fn check_slot(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
        start: Minute,
        duration: Minute,
    ) -> Result<Slot, EngineError> {
        let span = requested_span(start, duration)?;
        if self.policy.reject_past {
            reject_past(date, &span, self.now())?;
        }
        let rs = self.get_provider(&provider_id).ok_or(EngineError::NotFound(provider_id))?;
        let guard = rs.read().await;
        let enforce = self.policy.enforcement.applies_to(guard.kind);
        let conflicts = find_conflicts(&guard, date, &span, enforce, None);
        Ok(Slot {
            available: conflicts.is_empty(),
            conflicts,
            ..Slot::open(provider_id, date, span)
        })
    }

    fn slot_walk(&self, duration: Minute, max_per_day: Option<usize>) -> Result<SlotWalk, EngineError> {
        if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&duration) {
            return Err(EngineError::validation(format!(
                "duration must be between {MIN_DURATION_MINUTES} and {MAX_DURATION_MINUTES} minutes, got {duration}"
            )));
        }
        let max_per_day = max_per_day.unwrap_or(self.policy.default_max_per_day);
        if max_per_day == 0 {
            return Err(EngineError::validation("max_per_day must be at least 1"));
        }
        if max_per_day > MAX_SLOTS_PER_DAY {
            return Err(EngineError::LimitExceeded("max_per_day too large"));
        }
        Ok(SlotWalk { duration, max_per_day })
    }

    fn checked_range(
        &self,
        base_date: Option<NaiveDate>,
        suggestion: SuggestionType,
    ) -> Result<(NaiveDate, NaiveDate), EngineError> {
        let range = resolve_range(&self.policy, self.now(), base_date, suggestion);
        if (range.1 - range.0).num_days() > MAX_RANGE_DAYS as i64 {
            return Err(EngineError::LimitExceeded("slot range too long"));
        }
        Ok(range)
    }

    fn providers_snapshot(&self) -> Vec<SharedProviderState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }
}
