use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::schedule::{breaks_for, collides, DaySchedule};
use super::slots::Now;
use super::EngineError;

/// Turn a requested start and duration into a span inside one day.
pub(crate) fn requested_span(start: Minute, duration: Minute) -> Result<Span, EngineError> {
    if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&duration) {
        return Err(EngineError::validation(format!(
            "duration must be between {MIN_DURATION_MINUTES} and {MAX_DURATION_MINUTES} minutes, got {duration}"
        )));
    }
    Span::checked(start, start + duration).ok_or_else(|| {
        EngineError::validation(format!(
            "appointment starting {} for {duration} minutes runs past midnight",
            fmt_clock(start)
        ))
    })
}

pub(crate) fn reject_past(date: NaiveDate, span: &Span, now: Now) -> Result<(), EngineError> {
    if date < now.date || (date == now.date && span.start < now.minute) {
        return Err(EngineError::validation(format!(
            "cannot book {span} on {date}: that time has already passed"
        )));
    }
    Ok(())
}

/// Every reason `span` on `date` can't be booked.
///
/// Bookings are always checked (buffer-aware, cancelled ignored). Windows
/// and breaks only when `check_schedule` is set. `exclude` skips one
/// booking, for rescheduling it onto an overlapping time.
pub(crate) fn find_conflicts(
    rs: &ProviderState,
    date: NaiveDate,
    span: &Span,
    check_schedule: bool,
    exclude: Option<Ulid>,
) -> Vec<ConflictReason> {
    let mut reasons = Vec::new();
    if !rs.active {
        reasons.push(ConflictReason::ProviderInactive);
    }

    if check_schedule {
        let day = DaySchedule::resolve(rs, date, exclude);
        if !day.within_open_hours(span) {
            reasons.push(ConflictReason::OutsideAvailability);
        }
        for brk in breaks_for(rs, day_of_week(date)) {
            if brk.span().overlaps(span) {
                reasons.push(ConflictReason::OverlapsBreak {
                    break_id: brk.id,
                    break_kind: brk.kind,
                    start_time: brk.start_time,
                    end_time: brk.end_time,
                });
            }
        }
    }

    let buffer = rs.buffer_after;
    let search = Span::new(span.start.saturating_sub(buffer), span.end + buffer);
    for booking in rs.active_overlapping(date, search) {
        if Some(booking.id) == exclude {
            continue;
        }
        if collides(span, &booking.span(), buffer) {
            reasons.push(ConflictReason::OverlapsBooking {
                booking_id: booking.id,
                start_time: booking.start_time,
                end_time: booking.end_time,
            });
        }
    }

    reasons
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn provider(kind: ProviderKind) -> ProviderState {
        let mut rs = ProviderState::new(Ulid::new(), kind, None, None, 0);
        rs.insert_window(AvailabilityWindow {
            id: Ulid::new(),
            day_of_week: 1,
            start_time: 540,
            end_time: 720,
            active: true,
        });
        rs.insert_break(BreakInterval {
            id: Ulid::new(),
            day_of_week: 1,
            start_time: 600,
            end_time: 630,
            kind: BreakKind::Personal,
            label: Some("school run".into()),
            active: true,
        });
        rs
    }

    fn book(rs: &mut ProviderState, start: Minute, end: Minute) -> Ulid {
        let id = Ulid::new();
        let provider_id = rs.id;
        rs.insert_booking(Booking {
            id,
            provider_id,
            date: monday(),
            start_time: start,
            end_time: end,
            status: BookingStatus::Confirmed,
            label: None,
            overbooked: false,
        });
        id
    }

    #[test]
    fn clear_span_has_no_reasons() {
        let rs = provider(ProviderKind::Member);
        assert!(find_conflicts(&rs, monday(), &Span::new(540, 570), true, None).is_empty());
    }

    #[test]
    fn back_to_back_is_not_a_conflict() {
        let mut rs = provider(ProviderKind::Member);
        book(&mut rs, 570, 600);
        assert!(find_conflicts(&rs, monday(), &Span::new(540, 570), true, None).is_empty());
        assert_eq!(
            find_conflicts(&rs, monday(), &Span::new(555, 585), true, None).len(),
            1
        );
    }

    #[test]
    fn every_reason_reported() {
        let mut rs = provider(ProviderKind::Member);
        let existing = book(&mut rs, 690, 720);
        let reasons = find_conflicts(&rs, monday(), &Span::new(590, 750), true, None);
        let labels: Vec<_> = reasons.iter().map(ConflictReason::label).collect();
        assert_eq!(labels, vec!["outside_availability", "overlaps_break", "overlaps_booking"]);
        assert!(matches!(
            reasons[2],
            ConflictReason::OverlapsBooking { booking_id, .. } if booking_id == existing
        ));
    }

    #[test]
    fn schedule_skipped_when_not_enforced() {
        let rs = provider(ProviderKind::Doctor);
        assert!(find_conflicts(&rs, monday(), &Span::new(1200, 1230), false, None).is_empty());
        assert_eq!(
            find_conflicts(&rs, monday(), &Span::new(1200, 1230), true, None),
            vec![ConflictReason::OutsideAvailability]
        );
    }

    #[test]
    fn buffer_applies_to_both_sides() {
        let mut rs = provider(ProviderKind::Member);
        rs.buffer_after = 10;
        book(&mut rs, 660, 690);
        // Existing ends 11:30, turnover until 11:40.
        assert!(!find_conflicts(&rs, monday(), &Span::new(690, 710), false, None).is_empty());
        assert!(find_conflicts(&rs, monday(), &Span::new(700, 720), false, None).is_empty());
        // New booking would need turnover before 11:00.
        assert!(!find_conflicts(&rs, monday(), &Span::new(630, 660), false, None).is_empty());
        assert!(find_conflicts(&rs, monday(), &Span::new(620, 650), false, None).is_empty());
    }

    #[test]
    fn excluded_booking_ignored() {
        let mut rs = provider(ProviderKind::Member);
        let id = book(&mut rs, 540, 570);
        assert!(find_conflicts(&rs, monday(), &Span::new(555, 585), true, Some(id)).is_empty());
    }

    #[test]
    fn inactive_provider_reported() {
        let mut rs = provider(ProviderKind::Member);
        rs.active = false;
        assert_eq!(
            find_conflicts(&rs, monday(), &Span::new(540, 570), true, None),
            vec![ConflictReason::ProviderInactive]
        );
    }

    #[test]
    fn requested_span_validation() {
        assert_eq!(requested_span(540, 30).unwrap(), Span::new(540, 570));
        assert!(matches!(requested_span(540, 4), Err(EngineError::Validation(_))));
        assert!(matches!(requested_span(540, 481), Err(EngineError::Validation(_))));
        assert!(matches!(requested_span(1430, 30), Err(EngineError::Validation(_))));
        assert!(requested_span(1410, 30).is_ok());
    }

    #[test]
    fn past_requests_rejected() {
        let now = Now {
            date: monday(),
            minute: 600,
        };
        assert!(reject_past(monday(), &Span::new(570, 600), now).is_err());
        assert!(reject_past(monday(), &Span::new(600, 630), now).is_ok());
        assert!(reject_past(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(), &Span::new(900, 930), now).is_err());
        assert!(reject_past(NaiveDate::from_ymd_opt(2026, 3, 3).unwrap(), &Span::new(0, 30), now).is_ok());
    }
}
