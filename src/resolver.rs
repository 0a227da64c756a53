//! Per-resource transition rules.
//!
//! Given one consistent snapshot of a resource (its `active` and `pending`
//! bookings) and the current instant, decide what the reconciler must do:
//!
//! 1. With an unreturned active booking, every pending booking dated on or
//!    after the active booking's day is discarded, whatever its time of day
//!    and whether or not that day has come.
//! 2. With no active booking, the first pending booking whose start instant
//!    has arrived is promoted. At most one promotion per resource.
//! 3. Right after a promotion, every other pending booking on the same date
//!    is discarded as a duplicate. Rule 1 then applies against the newly
//!    active booking, so a second run over the result changes nothing.
//!
//! Everything here is pure: no I/O, no clock reads.

use chrono::DateTime;
use chrono_tz::Tz;
use ulid::Ulid;

use crate::clock::{Schedule, ScheduleError};
use crate::model::Booking;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Delete `booking`: `blocking` is still out and has not been returned.
    DiscardOverdue { booking: Booking, blocking: Booking },
    /// Move `booking` from pending to active.
    Promote { booking: Booking },
    /// Delete `booking`: `activated` holds the resource that day.
    DiscardDuplicate { booking: Booking, activated: Booking },
}

impl Decision {
    /// The booking this decision mutates.
    pub fn booking(&self) -> &Booking {
        match self {
            Decision::DiscardOverdue { booking, .. }
            | Decision::Promote { booking }
            | Decision::DiscardDuplicate { booking, .. } => booking,
        }
    }

    /// The ticket that caused a discard.
    pub fn cause(&self) -> Option<&Booking> {
        match self {
            Decision::DiscardOverdue { blocking, .. } => Some(blocking),
            Decision::DiscardDuplicate { activated, .. } => Some(activated),
            Decision::Promote { .. } => None,
        }
    }

    /// Human-readable reason for discards.
    pub fn reason(&self) -> Option<String> {
        match self {
            Decision::DiscardOverdue { blocking, .. } => Some(overdue_reason(blocking)),
            Decision::DiscardDuplicate { activated, .. } => Some(duplicate_reason(activated)),
            Decision::Promote { .. } => None,
        }
    }
}

pub fn overdue_reason(blocking: &Booking) -> String {
    format!("previous use not yet returned (ticket {})", blocking.id)
}

pub fn duplicate_reason(activated: &Booking) -> String {
    format!(
        "{} is in use on {} via ticket {}",
        activated.resource_key, activated.borrow_date, activated.id
    )
}

/// A record left out of this run because its schedule could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub id: Ulid,
    pub error: ScheduleError,
}

/// A state the rules do not repair. Reported, never acted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    MultipleActive(Vec<Ulid>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub decisions: Vec<Decision>,
    pub skipped: Vec<SkippedRecord>,
    pub anomaly: Option<Anomaly>,
}

impl Resolution {
    pub fn is_noop(&self) -> bool {
        self.decisions.is_empty()
    }
}

/// Split bookings into parsed schedules and skipped records, ordered by schedule.
fn parse_all<'a>(bookings: &'a [Booking], skipped: &mut Vec<SkippedRecord>) -> Vec<(Schedule, &'a Booking)> {
    let mut parsed = Vec::with_capacity(bookings.len());
    for b in bookings {
        match b.schedule() {
            Ok(s) => parsed.push((s, b)),
            Err(error) => skipped.push(SkippedRecord { id: b.id, error }),
        }
    }
    parsed.sort_by_key(|(s, _)| *s);
    parsed
}

/// Rule 1 over `pending`, skipping any id in `exclude`.
fn discard_behind(
    blocking: (&Schedule, &Booking),
    pending: &[(Schedule, &Booking)],
    exclude: &[Ulid],
    out: &mut Vec<Decision>,
) {
    let (active_schedule, active) = blocking;
    for (s, p) in pending {
        if exclude.contains(&p.id) {
            continue;
        }
        if s.date >= active_schedule.date {
            out.push(Decision::DiscardOverdue {
                booking: (*p).clone(),
                blocking: active.clone(),
            });
        }
    }
}

/// Decide the transitions for one resource.
///
/// `active` and `pending` must come from the same snapshot of one resource.
pub fn resolve(active: &[Booking], pending: &[Booking], now: &DateTime<Tz>) -> Resolution {
    let mut res = Resolution::default();

    if active.len() > 1 {
        res.anomaly = Some(Anomaly::MultipleActive(active.iter().map(|b| b.id).collect()));
        return res;
    }

    let pending = parse_all(pending, &mut res.skipped);

    if let Some(current) = active.first() {
        match current.schedule() {
            Ok(s) => discard_behind((&s, current), &pending, &[], &mut res.decisions),
            // The resource is in use but the rules cannot place it in time.
            Err(error) => res.skipped.push(SkippedRecord { id: current.id, error }),
        }
        return res;
    }

    let Some(&(promoted_schedule, promoted)) = pending.iter().find(|(s, _)| s.has_arrived(now)) else {
        return res;
    };
    res.decisions.push(Decision::Promote {
        booking: promoted.clone(),
    });

    let mut handled = vec![promoted.id];
    for (s, p) in &pending {
        if p.id != promoted.id && s.date == promoted_schedule.date {
            res.decisions.push(Decision::DiscardDuplicate {
                booking: (*p).clone(),
                activated: promoted.clone(),
            });
            handled.push(p.id);
        }
    }

    discard_behind((&promoted_schedule, promoted), &pending, &handled, &mut res.decisions);
    res
}

/// Why a new booking may not be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationConflict {
    /// The resource is already in use on the requested day.
    SameDay { blocking: Booking },
    /// An earlier use has not been returned.
    NotReturned { blocking: Booking },
}

impl CreationConflict {
    pub fn blocking(&self) -> &Booking {
        match self {
            CreationConflict::SameDay { blocking } | CreationConflict::NotReturned { blocking } => blocking,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            CreationConflict::SameDay { blocking } => duplicate_reason(blocking),
            CreationConflict::NotReturned { blocking } => overdue_reason(blocking),
        }
    }
}

/// Would a booking at `candidate` be discarded by the rules above on the
/// next run? Active records with malformed schedules are ignored.
pub fn creation_conflict(active: &[Booking], candidate: &Schedule) -> Option<CreationConflict> {
    active.iter().find_map(|a| {
        let s = a.schedule().ok()?;
        if candidate.date == s.date {
            Some(CreationConflict::SameDay { blocking: a.clone() })
        } else if candidate.date > s.date {
            Some(CreationConflict::NotReturned { blocking: a.clone() })
        } else {
            None
        }
    })
}
