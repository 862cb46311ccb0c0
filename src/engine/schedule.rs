use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

// ── Weekly shape ─────────────────────────────────────────────────

/// Active windows for a weekday, ascending by start. Empty means closed.
pub fn windows_for(rs: &ProviderState, day_of_week: u8) -> Vec<&AvailabilityWindow> {
    rs.windows
        .iter()
        .filter(|w| w.active && w.day_of_week == day_of_week)
        .collect()
}

/// Active breaks for a weekday, ascending by start.
pub fn breaks_for(rs: &ProviderState, day_of_week: u8) -> Vec<&BreakInterval> {
    rs.breaks
        .iter()
        .filter(|b| b.active && b.day_of_week == day_of_week)
        .collect()
}

/// The single overlap primitive: `[a, b)` and `[c, d)` overlap iff `a < d && c < b`.
pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.overlaps(b)
}

/// Buffer-aware collision between a candidate and an existing booking.
/// Turnover applies after whichever of the two comes first.
pub fn collides(candidate: &Span, existing: &Span, buffer: Minute) -> bool {
    overlaps(&existing.padded(buffer), candidate) || overlaps(&candidate.padded(buffer), existing)
}

/// Everything that constrains slots on one date, resolved once.
#[derive(Debug, Clone, Default)]
pub struct DaySchedule {
    /// Active window spans, ascending by start (may overlap each other).
    pub windows: Vec<Span>,
    /// Active windows merged into disjoint open hours.
    pub open: Vec<Span>,
    pub breaks: Vec<Span>,
    /// Non-cancelled booking spans, unpadded, ascending by start.
    pub booked: Vec<Span>,
    pub buffer: Minute,
}

impl DaySchedule {
    /// Resolve windows, breaks and bookings for `date`, optionally ignoring
    /// one booking (the one being rescheduled).
    pub fn resolve(rs: &ProviderState, date: NaiveDate, exclude: Option<Ulid>) -> Self {
        let dow = day_of_week(date);
        let windows: Vec<Span> = windows_for(rs, dow).iter().map(|w| w.span()).collect();
        let mut breaks: Vec<Span> = breaks_for(rs, dow).iter().map(|b| b.span()).collect();
        breaks.sort_by_key(|s| s.start);
        let booked = rs
            .bookings_on(date)
            .iter()
            .filter(|b| b.status.is_active() && Some(b.id) != exclude)
            .map(Booking::span)
            .collect();
        let mut sorted = windows.clone();
        sorted.sort_by_key(|s| s.start);
        Self {
            open: merge_overlapping(&sorted),
            windows,
            breaks,
            booked,
            buffer: rs.buffer_after,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn within_open_hours(&self, span: &Span) -> bool {
        self.open.iter().any(|o| o.contains_span(span))
    }

    pub fn hits_break(&self, span: &Span) -> bool {
        self.breaks.iter().any(|b| overlaps(b, span))
    }

    pub fn hits_booking(&self, span: &Span) -> bool {
        self.booked
            .iter()
            .any(|b| collides(span, b, self.buffer))
    }

    /// Open hours minus breaks minus padded bookings.
    pub fn free_spans(&self) -> Vec<Span> {
        let mut free = subtract_intervals(&self.open, &merge_overlapping(&self.breaks));
        if !self.booked.is_empty() {
            let mut padded: Vec<Span> = self.booked.iter().map(|b| b.padded(self.buffer)).collect();
            padded.sort_by_key(|s| s.start);
            free = subtract_intervals(&free, &merge_overlapping(&padded));
        }
        free
    }
}

/// Free time for a provider on one date as disjoint, sorted spans.
pub fn free_spans(rs: &ProviderState, date: NaiveDate) -> Vec<Span> {
    DaySchedule::resolve(rs, date, None).free_spans()
}

// ── Interval set arithmetic ──────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both must be sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ProviderState {
        ProviderState::new(Ulid::new(), ProviderKind::Doctor, None, None, 0)
    }

    fn window(dow: u8, start: Minute, end: Minute, active: bool) -> AvailabilityWindow {
        AvailabilityWindow {
            id: Ulid::new(),
            day_of_week: dow,
            start_time: start,
            end_time: end,
            active,
        }
    }

    fn lunch(dow: u8, start: Minute, end: Minute) -> BreakInterval {
        BreakInterval {
            id: Ulid::new(),
            day_of_week: dow,
            start_time: start,
            end_time: end,
            kind: BreakKind::Lunch,
            label: None,
            active: true,
        }
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    #[test]
    fn windows_for_filters_day_and_inactive() {
        let mut rs = provider();
        rs.insert_window(window(1, 840, 1020, true));
        rs.insert_window(window(1, 540, 720, true));
        rs.insert_window(window(1, 720, 780, false));
        rs.insert_window(window(2, 540, 720, true));

        let starts: Vec<_> = windows_for(&rs, 1).iter().map(|w| w.start_time).collect();
        assert_eq!(starts, vec![540, 840]);
        assert!(windows_for(&rs, 0).is_empty());
    }

    #[test]
    fn collision_respects_buffer_both_ways() {
        let existing = Span::new(600, 630);
        // Back-to-back with no buffer is fine.
        assert!(!collides(&Span::new(630, 660), &existing, 0));
        assert!(!collides(&Span::new(570, 600), &existing, 0));
        // With 10 minutes turnover, neither neighbour fits.
        assert!(collides(&Span::new(630, 660), &existing, 10));
        assert!(collides(&Span::new(570, 600), &existing, 10));
        assert!(!collides(&Span::new(640, 670), &existing, 10));
        assert!(!collides(&Span::new(560, 590), &existing, 10));
    }

    #[test]
    fn collision_is_symmetric() {
        let spans = [Span::new(540, 570), Span::new(570, 600), Span::new(555, 585)];
        for a in &spans {
            for b in &spans {
                for buffer in [0, 5, 15] {
                    assert_eq!(collides(a, b, buffer), collides(b, a, buffer));
                }
            }
        }
    }

    #[test]
    fn free_spans_subtracts_breaks_and_bookings() {
        let mut rs = provider();
        rs.buffer_after = 10;
        rs.insert_window(window(1, 540, 720, true));
        rs.insert_break(lunch(1, 600, 630));
        rs.insert_booking(Booking {
            id: Ulid::new(),
            provider_id: rs.id,
            date: monday(),
            start_time: 660,
            end_time: 690,
            status: BookingStatus::Confirmed,
            label: None,
            overbooked: false,
        });
        rs.insert_booking(Booking {
            id: Ulid::new(),
            provider_id: rs.id,
            date: monday(),
            start_time: 540,
            end_time: 570,
            status: BookingStatus::Cancelled,
            label: None,
            overbooked: false,
        });

        assert_eq!(
            free_spans(&rs, monday()),
            vec![Span::new(540, 600), Span::new(630, 660), Span::new(700, 720)]
        );
    }

    #[test]
    fn adjacent_windows_merge_into_open_hours() {
        let mut rs = provider();
        rs.insert_window(window(1, 540, 720, true));
        rs.insert_window(window(1, 720, 900, true));
        let day = DaySchedule::resolve(&rs, monday(), None);
        assert_eq!(day.open, vec![Span::new(540, 900)]);
        assert!(day.within_open_hours(&Span::new(690, 750)));
        assert!(!day.within_open_hours(&Span::new(880, 910)));
    }

    #[test]
    fn resolve_excludes_named_booking() {
        let mut rs = provider();
        let id = Ulid::new();
        rs.insert_booking(Booking {
            id,
            provider_id: rs.id,
            date: monday(),
            start_time: 540,
            end_time: 570,
            status: BookingStatus::Pending,
            label: None,
            overbooked: false,
        });
        assert!(DaySchedule::resolve(&rs, monday(), None).hits_booking(&Span::new(540, 570)));
        assert!(!DaySchedule::resolve(&rs, monday(), Some(id)).hits_booking(&Span::new(540, 570)));
    }

    // ── subtract_intervals / merge_overlapping ────────────────

    #[test]
    fn subtract_middle_punch() {
        let result = subtract_intervals(&[Span::new(100, 300)], &[Span::new(150, 200)]);
        assert_eq!(result, vec![Span::new(100, 150), Span::new(200, 300)]);
    }

    #[test]
    fn subtract_spanning_removal() {
        let base = [Span::new(100, 200), Span::new(300, 400)];
        let result = subtract_intervals(&base, &[Span::new(150, 350)]);
        assert_eq!(result, vec![Span::new(100, 150), Span::new(350, 400)]);
    }

    #[test]
    fn subtract_nothing_to_remove() {
        let base = [Span::new(100, 200)];
        assert_eq!(subtract_intervals(&base, &[]), base.to_vec());
        assert!(subtract_intervals(&[], &base).is_empty());
    }

    #[test]
    fn merge_adjacent_and_nested() {
        let spans = [Span::new(100, 200), Span::new(200, 300), Span::new(250, 260), Span::new(400, 500)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 300), Span::new(400, 500)]
        );
    }
}
