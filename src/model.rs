use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::{Schedule, ScheduleError};

/// Unix milliseconds, used for bookkeeping timestamps.
pub type Ms = i64;

/// Status without payload. Used for store filters and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKind {
    Pending,
    Active,
    Returned,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Pending => "pending",
            StatusKind::Active => "active",
            StatusKind::Returned => "returned",
        }
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a booking.
///
/// A recorded return only exists on `Returned`, so an `Active` booking is
/// unreturned by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Active,
    Returned {
        return_date: NaiveDate,
        return_time: NaiveTime,
    },
}

impl BookingStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            BookingStatus::Pending => StatusKind::Pending,
            BookingStatus::Active => StatusKind::Active,
            BookingStatus::Returned { .. } => StatusKind::Returned,
        }
    }

    /// Pending → Active → Returned. A returned booking never moves again.
    pub fn can_become(&self, next: &BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, BookingStatus::Active) | (BookingStatus::Active, BookingStatus::Returned { .. })
        )
    }
}

/// Informational payload carried through to notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingDetails {
    pub project: Option<String>,
    pub location: Option<String>,
    pub purpose: Option<String>,
    pub colleagues: Vec<String>,
}

/// A single ticket on a resource.
///
/// `borrow_date` / `borrow_time` are kept as submitted (`YYYY-MM-DD`, `HH:MM`)
/// and parsed on demand, so a malformed record can be skipped instead of
/// poisoning a whole pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_key: String,
    pub status: BookingStatus,
    pub borrow_date: String,
    pub borrow_time: String,
    pub requester_id: String,
    pub details: BookingDetails,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn schedule(&self) -> Result<Schedule, ScheduleError> {
        Schedule::parse(&self.borrow_date, &self.borrow_time)
    }

    pub fn status_kind(&self) -> StatusKind {
        self.status.kind()
    }
}

/// Fields supplied when a booking is created. The store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDraft {
    pub resource_key: String,
    pub borrow_date: String,
    pub borrow_time: String,
    pub requester_id: String,
    pub details: BookingDetails,
}

/// Store-side ordering: well-formed schedules ascending, malformed last,
/// ties broken by creation time.
fn order_key(b: &Booking) -> (bool, Option<Schedule>, Ms) {
    let schedule = b.schedule().ok();
    (schedule.is_none(), schedule, b.created_at)
}

/// All bookings on one resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceBookings {
    pub key: String,
    /// Sorted by `(borrow_date, borrow_time)`.
    pub bookings: Vec<Booking>,
}

impl ResourceBookings {
    pub fn new(key: String) -> Self {
        Self {
            key,
            bookings: Vec::new(),
        }
    }

    /// Insert keeping schedule order. Equal keys keep insertion order.
    pub fn insert_booking(&mut self, booking: Booking) {
        let key = order_key(&booking);
        let pos = self.bookings.partition_point(|b| order_key(b) <= key);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn with_status(&self, kind: StatusKind) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(move |b| b.status_kind() == kind)
    }
}

/// The WAL record format. One event per store mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    StatusChanged {
        id: Ulid,
        resource_key: String,
        status: BookingStatus,
        at: Ms,
    },
    BookingDeleted {
        id: Ulid,
        resource_key: String,
    },
}

impl Event {
    pub fn resource_key(&self) -> &str {
        match self {
            Event::BookingCreated { booking } => &booking.resource_key,
            Event::StatusChanged { resource_key, .. } | Event::BookingDeleted { resource_key, .. } => {
                resource_key
            }
        }
    }
}
