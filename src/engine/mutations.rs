use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_COMMITTED_TOTAL, BOOKING_CONFLICTS_TOTAL, OVERBOOKINGS_TOTAL};

use super::conflict::{find_conflicts, reject_past, requested_span};
use super::slots::{first_open_slot, Now};
use super::{forget_entities, ConflictDetail, Engine, EngineError, snapshot_events};

#[derive(Debug, Clone)]
pub struct NewProvider {
    pub id: Ulid,
    pub kind: ProviderKind,
    pub name: Option<String>,
    pub chapter: Option<String>,
    pub buffer_after: Minute,
}

/// Fields left `None` keep their current value; `Some(None)` clears a name
/// or chapter.
#[derive(Debug, Clone, Default)]
pub struct ProviderUpdate {
    pub name: Option<Option<String>>,
    pub chapter: Option<Option<String>>,
    pub buffer_after: Option<Minute>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewWindow {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub day_of_week: u8,
    pub start_time: Minute,
    pub end_time: Minute,
}

#[derive(Debug, Clone)]
pub struct NewBreak {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub day_of_week: u8,
    pub start_time: Minute,
    pub end_time: Minute,
    pub kind: BreakKind,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Window,
    Break,
}

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub date: NaiveDate,
    pub start_time: Minute,
    pub duration: Minute,
    pub label: Option<String>,
    /// Staff escape hatch: commit despite schedule or booking conflicts.
    pub allow_overbooking: bool,
}

#[derive(Debug, Clone)]
pub struct RescheduleRequest {
    pub booking_id: Ulid,
    pub date: NaiveDate,
    pub start_time: Minute,
    /// Defaults to the booking's current length.
    pub duration: Option<Minute>,
    pub allow_overbooking: bool,
}

fn check_len(value: Option<&String>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn check_buffer(buffer: Minute) -> Result<(), EngineError> {
    if buffer > MAX_BUFFER_MINUTES {
        return Err(EngineError::validation(format!(
            "buffer_after must be at most {MAX_BUFFER_MINUTES} minutes"
        )));
    }
    Ok(())
}

fn rule_span(day_of_week: u8, start: Minute, end: Minute) -> Result<Span, EngineError> {
    if day_of_week > 6 {
        return Err(EngineError::validation(format!(
            "day_of_week must be 0 (Sunday) to 6 (Saturday), got {day_of_week}"
        )));
    }
    Span::checked(start, end).ok_or_else(|| {
        EngineError::validation(format!(
            "start_time {} must be before end_time {}",
            fmt_clock(start),
            fmt_clock(end)
        ))
    })
}

impl Engine {
    pub async fn register_provider(&self, p: NewProvider) -> Result<ProviderInfo, EngineError> {
        check_len(p.name.as_ref(), MAX_NAME_LEN, "provider name too long")?;
        check_len(p.chapter.as_ref(), MAX_NAME_LEN, "chapter name too long")?;
        check_buffer(p.buffer_after)?;

        let _membership = self.membership.lock().await;
        let _gate = self.compaction_gate.read().await;
        if self.state.contains_key(&p.id) {
            return Err(EngineError::AlreadyExists(p.id));
        }
        if self.provider_count() >= MAX_PROVIDERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many providers"));
        }

        let event = Event::ProviderRegistered {
            id: p.id,
            kind: p.kind,
            name: p.name.clone(),
            chapter: p.chapter.clone(),
            buffer_after: p.buffer_after,
        };
        self.wal
            .append(event.clone())
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let rs = ProviderState::new(p.id, p.kind, p.name, p.chapter, p.buffer_after);
        let info = ProviderInfo::from(&rs);
        self.state.insert(p.id, Arc::new(RwLock::new(rs)));
        self.notify.send(p.id, &event);
        info!(provider = %p.id, kind = %p.kind, "provider registered");
        Ok(info)
    }

    pub async fn update_provider(&self, id: Ulid, update: ProviderUpdate) -> Result<ProviderInfo, EngineError> {
        check_len(update.name.as_ref().and_then(Option::as_ref), MAX_NAME_LEN, "provider name too long")?;
        check_len(update.chapter.as_ref().and_then(Option::as_ref), MAX_NAME_LEN, "chapter name too long")?;
        if let Some(b) = update.buffer_after {
            check_buffer(b)?;
        }

        let (_gate, mut guard) = self.lock_provider(id).await?;
        let event = Event::ProviderUpdated {
            id,
            name: update.name.unwrap_or_else(|| guard.name.clone()),
            chapter: update.chapter.unwrap_or_else(|| guard.chapter.clone()),
            buffer_after: update.buffer_after.unwrap_or(guard.buffer_after),
            active: update.active.unwrap_or(guard.active),
        };
        self.persist_and_apply(&mut guard, event).await?;
        Ok(ProviderInfo::from(&*guard))
    }

    /// Remove a provider and its weekly schedule. Refused while any booking
    /// (cancelled included) references it; deactivate instead to keep history.
    pub async fn remove_provider(&self, id: Ulid) -> Result<(), EngineError> {
        let _membership = self.membership.lock().await;
        let (_gate, guard) = self.lock_provider(id).await?;
        if !guard.bookings.is_empty() {
            return Err(EngineError::HasBookings(id));
        }

        let event = Event::ProviderRemoved { id };
        self.wal
            .append(event.clone())
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        forget_entities(&guard, &self.entity_to_provider);
        self.state.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!(provider = %id, "provider removed");
        Ok(())
    }

    pub async fn add_window(&self, w: NewWindow) -> Result<AvailabilityWindow, EngineError> {
        let span = rule_span(w.day_of_week, w.start_time, w.end_time)?;
        let (_gate, mut guard) = self.lock_provider(w.provider_id).await?;
        if guard.rule_count() >= MAX_RULES_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many windows and breaks on provider"));
        }

        self.claim_id(w.id, w.provider_id)?;
        let event = Event::WindowAdded {
            id: w.id,
            provider_id: w.provider_id,
            day_of_week: w.day_of_week,
            span,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, event).await {
            self.release_id(w.id, w.provider_id);
            return Err(e);
        }
        guard
            .windows
            .iter()
            .find(|x| x.id == w.id)
            .cloned()
            .ok_or(EngineError::NotFound(w.id))
    }

    pub async fn add_break(&self, b: NewBreak) -> Result<BreakInterval, EngineError> {
        let span = rule_span(b.day_of_week, b.start_time, b.end_time)?;
        check_len(b.label.as_ref(), MAX_LABEL_LEN, "label too long")?;
        let (_gate, mut guard) = self.lock_provider(b.provider_id).await?;
        if guard.rule_count() >= MAX_RULES_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many windows and breaks on provider"));
        }

        self.claim_id(b.id, b.provider_id)?;
        let event = Event::BreakAdded {
            id: b.id,
            provider_id: b.provider_id,
            day_of_week: b.day_of_week,
            span,
            kind: b.kind,
            label: b.label,
        };
        if let Err(e) = self.persist_and_apply(&mut guard, event).await {
            self.release_id(b.id, b.provider_id);
            return Err(e);
        }
        guard
            .breaks
            .iter()
            .find(|x| x.id == b.id)
            .cloned()
            .ok_or(EngineError::NotFound(b.id))
    }

    /// Soft-enable or disable a window or break.
    pub async fn set_rule_active(&self, id: Ulid, kind: RuleKind, active: bool) -> Result<Ulid, EngineError> {
        let (_gate, mut guard) = self.lock_entity(id).await?;
        if !has_rule(&guard, id, kind) {
            return Err(EngineError::NotFound(id));
        }
        let provider_id = guard.id;
        let event = Event::RuleToggled { id, provider_id, active };
        self.persist_and_apply(&mut guard, event).await?;
        Ok(provider_id)
    }

    pub async fn remove_rule(&self, id: Ulid, kind: RuleKind) -> Result<Ulid, EngineError> {
        let (_gate, mut guard) = self.lock_entity(id).await?;
        if !has_rule(&guard, id, kind) {
            return Err(EngineError::NotFound(id));
        }
        let provider_id = guard.id;
        let event = Event::RuleRemoved { id, provider_id };
        self.persist_and_apply(&mut guard, event).await?;
        Ok(provider_id)
    }

    /// The conflict guard: validate, check and commit under the provider's
    /// write lock, so two requests for the same time can't both succeed.
    pub async fn check_and_reserve(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        let span = requested_span(req.start_time, req.duration)?;
        check_len(req.label.as_ref(), MAX_LABEL_LEN, "label too long")?;
        let now = self.now();
        if self.policy.reject_past {
            reject_past(req.date, &span, now)?;
        }

        let (_gate, mut guard) = self.lock_provider(req.provider_id).await?;
        // Ids are client-supplied; the claim spans every provider of the tenant.
        let (id, provider_id) = (req.id, req.provider_id);
        self.claim_id(id, provider_id)?;
        let result = self.reserve_locked(&mut guard, req, span, now).await;
        if result.is_err() {
            self.release_id(id, provider_id);
        }
        result
    }

    async fn reserve_locked(
        &self,
        rs: &mut ProviderState,
        req: BookingRequest,
        span: Span,
        now: Now,
    ) -> Result<Booking, EngineError> {
        if rs.active_count_on(req.date) >= MAX_BOOKINGS_PER_PROVIDER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings for provider on this date"));
        }

        let enforce = self.policy.enforcement.applies_to(rs.kind);
        let reasons = find_conflicts(rs, req.date, &span, enforce, None);
        let overbooked = self.settle_conflicts(rs, req.date, span, reasons, req.allow_overbooking, now)?;

        let event = Event::BookingCreated {
            id: req.id,
            provider_id: req.provider_id,
            date: req.date,
            span,
            label: req.label,
            overbooked,
        };
        self.persist_and_apply(rs, event).await?;
        metrics::counter!(BOOKINGS_COMMITTED_TOTAL, "kind" => kind_label(rs.kind)).increment(1);
        info!(booking = %req.id, provider = %req.provider_id, date = %req.date, %span, "booking committed");

        rs.find_booking(req.id).cloned().ok_or(EngineError::NotFound(req.id))
    }

    /// Reserve `id` for `provider_id` before its event is written. Fails if any
    /// provider already owns or is committing an entity with that id.
    fn claim_id(&self, id: Ulid, provider_id: Ulid) -> Result<(), EngineError> {
        match self.entity_to_provider.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(provider_id);
                Ok(())
            }
        }
    }

    fn release_id(&self, id: Ulid, provider_id: Ulid) {
        self.entity_to_provider.remove_if(&id, |_, owner| *owner == provider_id);
    }

    pub async fn update_booking_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, EngineError> {
        let (_gate, mut guard) = self.lock_entity(id).await?;
        let current = guard
            .find_booking(id)
            .ok_or(EngineError::NotFound(id))?
            .status;
        if !current.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                from: current,
                to: status,
            });
        }

        let provider_id = guard.id;
        let event = Event::BookingStatusChanged { id, provider_id, status };
        self.persist_and_apply(&mut guard, event).await?;
        info!(booking = %id, from = %current, to = %status, "booking status changed");
        guard.find_booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Cancelled bookings are kept for history but free their interval.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.update_booking_status(id, BookingStatus::Cancelled).await
    }

    /// Move a pending or confirmed booking through the same guard, ignoring itself.
    pub async fn reschedule_booking(&self, req: RescheduleRequest) -> Result<Booking, EngineError> {
        let (_gate, mut guard) = self.lock_entity(req.booking_id).await?;
        let current = guard
            .find_booking(req.booking_id)
            .ok_or(EngineError::NotFound(req.booking_id))?
            .clone();
        if !matches!(current.status, BookingStatus::Pending | BookingStatus::Confirmed) {
            return Err(EngineError::validation(format!(
                "only pending or confirmed bookings can be rescheduled, this one is {}",
                current.status
            )));
        }

        let duration = req.duration.unwrap_or(current.end_time - current.start_time);
        let span = requested_span(req.start_time, duration)?;
        let now = self.now();
        if self.policy.reject_past {
            reject_past(req.date, &span, now)?;
        }
        if req.date != current.date && guard.active_count_on(req.date) >= MAX_BOOKINGS_PER_PROVIDER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings for provider on this date"));
        }

        let enforce = self.policy.enforcement.applies_to(guard.kind);
        let reasons = find_conflicts(&guard, req.date, &span, enforce, Some(req.booking_id));
        let overbooked = self.settle_conflicts(&guard, req.date, span, reasons, req.allow_overbooking, now)?;

        let event = Event::BookingRescheduled {
            id: req.booking_id,
            provider_id: guard.id,
            date: req.date,
            span,
            overbooked,
        };
        self.persist_and_apply(&mut guard, event).await?;
        info!(
            booking = %req.booking_id,
            from = %current.date,
            to = %req.date,
            %span,
            "booking rescheduled"
        );
        guard
            .find_booking(req.booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(req.booking_id))
    }

    /// Decide what the conflicts mean: `Ok(false)` when clear, `Ok(true)` when
    /// overridden, otherwise a `Conflict` naming every reason and the next open slot.
    fn settle_conflicts(
        &self,
        rs: &ProviderState,
        date: NaiveDate,
        span: Span,
        reasons: Vec<ConflictReason>,
        allow_overbooking: bool,
        now: Now,
    ) -> Result<bool, EngineError> {
        if reasons.is_empty() {
            return Ok(false);
        }
        for reason in &reasons {
            metrics::counter!(BOOKING_CONFLICTS_TOTAL, "reason" => reason.label()).increment(1);
        }

        let overridable = !reasons.contains(&ConflictReason::ProviderInactive);
        if allow_overbooking && overridable {
            warn!(
                provider = %rs.id,
                %date,
                %span,
                conflicts = reasons.len(),
                "overbooking committed despite conflicts"
            );
            metrics::counter!(OVERBOOKINGS_TOTAL).increment(1);
            return Ok(true);
        }

        let next_available = first_open_slot(rs, date, span.duration(), &self.policy, now);
        let detail = ConflictDetail {
            provider_id: rs.id,
            date,
            requested: span,
            reasons,
            next_available,
        };
        warn!(provider = %rs.id, "booking rejected: {detail}");
        Err(EngineError::Conflict(Box::new(detail)))
    }

    /// Rewrite the WAL as the minimal event list recreating current state.
    /// Returns the number of events written.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _gate = self.compaction_gate.write().await;
        let providers: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();

        let mut events = Vec::new();
        for rs in providers {
            let guard = rs.read().await;
            snapshot_events(&guard, &mut events);
        }
        let written = events.len();
        self.wal
            .compact(events)
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(written)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}

fn has_rule(rs: &ProviderState, id: Ulid, kind: RuleKind) -> bool {
    match kind {
        RuleKind::Window => rs.windows.iter().any(|w| w.id == id),
        RuleKind::Break => rs.breaks.iter().any(|b| b.id == id),
    }
}

fn kind_label(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Doctor => "doctor",
        ProviderKind::Member => "member",
    }
}
