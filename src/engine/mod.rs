mod conflict;
mod error;
mod mutations;
mod queries;
pub mod schedule;
pub mod slots;

pub use error::{ConflictDetail, EngineError};
pub use mutations::{BookingRequest, NewBreak, NewProvider, NewWindow, ProviderUpdate, RescheduleRequest, RuleKind};
pub use queries::{BookingFilter, ChapterSlotRequest, ProviderSchedule, SlotRequest};
pub use slots::{DaySlots, Now, SlotReport, Suggestion};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::info;
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::policy::SlotPolicy;
use crate::wal::{Wal, WalHandle};

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

/// Write access to one provider, taken under the shared compaction gate.
pub(crate) type ProviderWrite<'a> = (RwLockReadGuard<'a, ()>, OwnedRwLockWriteGuard<ProviderState>);

/// One tenant's providers, schedules and bookings, backed by its own WAL.
pub struct Engine {
    state: DashMap<Ulid, SharedProviderState>,
    wal: WalHandle,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: window/break/booking id → provider id.
    entity_to_provider: DashMap<Ulid, Ulid>,
    clock: Arc<dyn Clock>,
    policy: SlotPolicy,
    /// Mutations hold it shared from WAL append to apply; compaction holds it
    /// exclusively so the snapshot and the log swap see the same state.
    compaction_gate: RwLock<()>,
    /// Serializes provider registration and removal.
    membership: Mutex<()>,
}

/// Apply a provider-scoped event. Caller holds the provider's write lock.
fn apply_event(rs: &mut ProviderState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ProviderUpdated {
            name,
            chapter,
            buffer_after,
            active,
            ..
        } => {
            rs.name = name.clone();
            rs.chapter = chapter.clone();
            rs.buffer_after = *buffer_after;
            rs.active = *active;
        }
        Event::WindowAdded {
            id,
            provider_id,
            day_of_week,
            span,
        } => {
            rs.insert_window(AvailabilityWindow {
                id: *id,
                day_of_week: *day_of_week,
                start_time: span.start,
                end_time: span.end,
                active: true,
            });
            entity_map.insert(*id, *provider_id);
        }
        Event::BreakAdded {
            id,
            provider_id,
            day_of_week,
            span,
            kind,
            label,
        } => {
            rs.insert_break(BreakInterval {
                id: *id,
                day_of_week: *day_of_week,
                start_time: span.start,
                end_time: span.end,
                kind: *kind,
                label: label.clone(),
                active: true,
            });
            entity_map.insert(*id, *provider_id);
        }
        Event::RuleToggled { id, active, .. } => {
            rs.set_rule_active(*id, *active);
        }
        Event::RuleRemoved { id, .. } => {
            rs.remove_rule(*id);
            entity_map.remove(id);
        }
        Event::BookingCreated {
            id,
            provider_id,
            date,
            span,
            label,
            overbooked,
        } => {
            rs.insert_booking(Booking {
                id: *id,
                provider_id: *provider_id,
                date: *date,
                start_time: span.start,
                end_time: span.end,
                status: BookingStatus::Pending,
                label: label.clone(),
                overbooked: *overbooked,
            });
            entity_map.insert(*id, *provider_id);
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = rs.find_booking_mut(*id) {
                b.status = *status;
            }
        }
        Event::BookingRescheduled {
            id,
            date,
            span,
            overbooked,
            ..
        } => {
            if let Some(mut b) = rs.take_booking(*id) {
                b.date = *date;
                b.start_time = span.start;
                b.end_time = span.end;
                b.overbooked = *overbooked;
                rs.insert_booking(b);
            }
        }
        // Registration and removal happen at the map level.
        Event::ProviderRegistered { .. } | Event::ProviderRemoved { .. } => {}
    }
}

/// Drop every reverse-lookup entry owned by a provider.
fn forget_entities(rs: &ProviderState, entity_map: &DashMap<Ulid, Ulid>) {
    for w in &rs.windows {
        entity_map.remove(&w.id);
    }
    for b in &rs.breaks {
        entity_map.remove(&b.id);
    }
    for b in rs.bookings.values().flatten() {
        entity_map.remove(&b.id);
    }
}

/// Minimal event sequence that recreates `rs` on replay.
fn snapshot_events(rs: &ProviderState, out: &mut Vec<Event>) {
    out.push(Event::ProviderRegistered {
        id: rs.id,
        kind: rs.kind,
        name: rs.name.clone(),
        chapter: rs.chapter.clone(),
        buffer_after: rs.buffer_after,
    });
    if !rs.active {
        out.push(Event::ProviderUpdated {
            id: rs.id,
            name: rs.name.clone(),
            chapter: rs.chapter.clone(),
            buffer_after: rs.buffer_after,
            active: false,
        });
    }
    for w in &rs.windows {
        out.push(Event::WindowAdded {
            id: w.id,
            provider_id: rs.id,
            day_of_week: w.day_of_week,
            span: w.span(),
        });
        if !w.active {
            out.push(Event::RuleToggled {
                id: w.id,
                provider_id: rs.id,
                active: false,
            });
        }
    }
    for b in &rs.breaks {
        out.push(Event::BreakAdded {
            id: b.id,
            provider_id: rs.id,
            day_of_week: b.day_of_week,
            span: b.span(),
            kind: b.kind,
            label: b.label.clone(),
        });
        if !b.active {
            out.push(Event::RuleToggled {
                id: b.id,
                provider_id: rs.id,
                active: false,
            });
        }
    }
    for b in rs.bookings.values().flatten() {
        out.push(Event::BookingCreated {
            id: b.id,
            provider_id: rs.id,
            date: b.date,
            span: b.span(),
            label: b.label.clone(),
            overbooked: b.overbooked,
        });
        if b.status != BookingStatus::Pending {
            out.push(Event::BookingStatusChanged {
                id: b.id,
                provider_id: rs.id,
                status: b.status,
            });
        }
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        policy: SlotPolicy,
    ) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let entity_to_provider = DashMap::new();

        // Rebuild plain state first; locks are only added once it's complete.
        let mut providers: HashMap<Ulid, ProviderState> = HashMap::new();
        for event in &events {
            match event {
                Event::ProviderRegistered {
                    id,
                    kind,
                    name,
                    chapter,
                    buffer_after,
                } => {
                    let rs = ProviderState::new(*id, *kind, name.clone(), chapter.clone(), *buffer_after);
                    providers.insert(*id, rs);
                }
                Event::ProviderRemoved { id } => {
                    if let Some(rs) = providers.remove(id) {
                        forget_entities(&rs, &entity_to_provider);
                    }
                }
                other => {
                    if let Some(rs) = providers.get_mut(&other.provider_id()) {
                        apply_event(rs, other, &entity_to_provider);
                    }
                }
            }
        }

        let state = DashMap::new();
        for (id, rs) in providers {
            state.insert(id, Arc::new(RwLock::new(rs)));
        }
        info!(
            "replayed {} events into {} providers from {}",
            events.len(),
            state.len(),
            wal_path.display()
        );

        let wal = WalHandle::spawn(Wal::open(&wal_path)?);
        Ok(Self {
            state,
            wal,
            notify,
            entity_to_provider,
            clock,
            policy,
            compaction_gate: RwLock::new(()),
            membership: Mutex::new(()),
        })
    }

    pub fn now(&self) -> Now {
        Now::of(self.clock.as_ref())
    }

    pub fn provider_count(&self) -> usize {
        self.state.len()
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn provider_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_provider.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append, then apply and notify. Nothing changes in memory unless
    /// the append was durable.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ProviderState,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal
            .append(event.clone())
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        apply_event(rs, &event, &self.entity_to_provider);
        self.notify.send(rs.id, &event);
        Ok(())
    }

    pub(super) async fn lock_provider(&self, id: Ulid) -> Result<ProviderWrite<'_>, EngineError> {
        let gate = self.compaction_gate.read().await;
        let rs = self.get_provider(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write_owned().await;
        // Removed while we waited for the lock.
        if !self.state.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        Ok((gate, guard))
    }

    /// Lookup entity → provider, then lock the provider for writing.
    pub(super) async fn lock_entity(&self, entity_id: Ulid) -> Result<ProviderWrite<'_>, EngineError> {
        let provider_id = self
            .provider_for_entity(&entity_id)
            .ok_or(EngineError::NotFound(entity_id))?;
        self.lock_provider(provider_id).await
    }
}
