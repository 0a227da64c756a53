use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::{Clock, Schedule, ScheduleError};
use crate::limits::*;
use crate::model::{Booking, BookingDraft, BookingStatus, StatusKind};
use crate::notify::{Dispatcher, EventKind, Notification};
use crate::resolver;
use crate::store::{BookingStore, StatusUpdate, StoreError};
use crate::transition::Transitions;

#[derive(Debug)]
pub enum ServiceError {
    Store(StoreError),
    Invalid { field: &'static str, reason: String },
    /// Creation would collide with an active booking.
    Conflict { ticket: Ulid, reason: String },
    NotFound(Ulid),
    InvalidState { id: Ulid, status: StatusKind },
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Store(e) => write!(f, "{e}"),
            ServiceError::Invalid { field, reason } => write!(f, "invalid {field}: {reason}"),
            ServiceError::Conflict { ticket, reason } => write!(f, "conflicts with ticket {ticket}: {reason}"),
            ServiceError::NotFound(id) => write!(f, "booking {id} not found"),
            ServiceError::InvalidState { id, status } => write!(f, "booking {id} is {status}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        ServiceError::Store(e)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ServiceError {
    ServiceError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ServiceError> {
    if value.len() > max {
        return Err(invalid(field, format!("longer than {max} bytes")));
    }
    Ok(())
}

/// Synchronous create / return / cancel, sharing the scheduler's rules and
/// notification contract.
pub struct BookingService {
    transitions: Transitions,
    clock: Arc<dyn Clock>,
    default_resource_key: String,
}

impl BookingService {
    pub fn new(
        store: Arc<dyn BookingStore>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
        default_resource_key: impl Into<String>,
    ) -> Self {
        Self {
            transitions: Transitions::new(store, dispatcher),
            clock,
            default_resource_key: default_resource_key.into(),
        }
    }

    fn store(&self) -> &Arc<dyn BookingStore> {
        self.transitions.store()
    }

    fn validate(&self, draft: &mut BookingDraft) -> Result<Schedule, ServiceError> {
        if draft.resource_key.trim().is_empty() {
            draft.resource_key = self.default_resource_key.clone();
        }
        check_len("resource_key", &draft.resource_key, MAX_RESOURCE_KEY_LEN)?;
        if draft.requester_id.is_empty() {
            return Err(invalid("requester_id", "must not be empty"));
        }
        check_len("requester_id", &draft.requester_id, MAX_FIELD_LEN)?;
        check_len("borrow_date", &draft.borrow_date, MAX_FIELD_LEN)?;
        check_len("borrow_time", &draft.borrow_time, MAX_FIELD_LEN)?;

        let details = &draft.details;
        for (field, value) in [
            ("project", &details.project),
            ("location", &details.location),
            ("purpose", &details.purpose),
        ] {
            if let Some(v) = value {
                check_len(field, v, MAX_FIELD_LEN)?;
            }
        }
        if details.colleagues.len() > MAX_COLLEAGUES {
            return Err(invalid("colleagues", format!("more than {MAX_COLLEAGUES} entries")));
        }
        for c in &details.colleagues {
            check_len("colleagues", c, MAX_FIELD_LEN)?;
        }

        Schedule::parse(&draft.borrow_date, &draft.borrow_time).map_err(|e| match e {
            ScheduleError::MissingDate | ScheduleError::BadDate(_) => invalid("borrow_date", e.to_string()),
            ScheduleError::MissingTime | ScheduleError::BadTime(_) => invalid("borrow_time", e.to_string()),
        })
    }

    /// Create a pending booking, or reject it if the resource is taken.
    ///
    /// A booking whose start has already passed is reconciled straight
    /// away, so the returned record may already be active.
    pub async fn create(&self, mut draft: BookingDraft) -> Result<Booking, ServiceError> {
        let schedule = self.validate(&mut draft)?;
        let now = self.clock.now();

        let active = self.store().list_by_status(&draft.resource_key, StatusKind::Active).await?;
        if let Some(conflict) = resolver::creation_conflict(&active, &schedule) {
            let ticket = conflict.blocking().id;
            info!(resource = %draft.resource_key, blocking = %ticket, "booking rejected");
            return Err(ServiceError::Conflict {
                ticket,
                reason: conflict.reason(),
            });
        }

        let booking = self.store().insert(draft).await?;
        info!(resource = %booking.resource_key, ticket = %booking.id, "booking created");
        self.transitions.emit(Notification::new(EventKind::Created, &booking));

        if schedule.has_arrived(&now) {
            self.transitions.reconcile_resource(&booking.resource_key, &now).await?;
            if let Some(current) = self.store().get_one(booking.id).await? {
                return Ok(current);
            }
            debug!(ticket = %booking.id, "booking discarded during immediate reconciliation");
        }
        Ok(booking)
    }

    /// Record the return of an active booking.
    pub async fn return_booking(
        &self,
        id: Ulid,
        return_date: NaiveDate,
        return_time: NaiveTime,
    ) -> Result<Booking, ServiceError> {
        let current = self.store().get_one(id).await?.ok_or(ServiceError::NotFound(id))?;
        if current.status != BookingStatus::Active {
            return Err(ServiceError::InvalidState {
                id,
                status: current.status_kind(),
            });
        }

        let returned = BookingStatus::Returned {
            return_date,
            return_time,
        };
        match self.store().update_status(id, returned).await? {
            StatusUpdate::Applied(updated) => {
                info!(resource = %updated.resource_key, ticket = %id, "booking returned");
                self.transitions.emit(Notification::new(EventKind::Returned, &updated));
                Ok(updated)
            }
            // Someone else closed it out between the read and the write.
            StatusUpdate::Unchanged(b) | StatusUpdate::Rejected(b) => Err(ServiceError::InvalidState {
                id,
                status: b.status_kind(),
            }),
            StatusUpdate::Missing => Err(ServiceError::NotFound(id)),
        }
    }

    /// Return at the clock's current local date and time.
    pub async fn return_now(&self, id: Ulid) -> Result<Booking, ServiceError> {
        let now = self.clock.now().naive_local();
        self.return_booking(id, now.date(), now.time()).await
    }

    /// Cancel a pending booking. The row is deleted.
    pub async fn cancel(&self, id: Ulid) -> Result<Booking, ServiceError> {
        let current = self.store().get_one(id).await?.ok_or(ServiceError::NotFound(id))?;
        if current.status != BookingStatus::Pending {
            return Err(ServiceError::InvalidState {
                id,
                status: current.status_kind(),
            });
        }

        // The scheduler may have discarded it meanwhile; whoever deletes it announces it.
        let removed = self.store().delete(id).await?.ok_or(ServiceError::NotFound(id))?;
        info!(resource = %removed.resource_key, ticket = %id, "booking cancelled");
        self.transitions.emit(Notification::new(EventKind::Cancelled, &removed));
        Ok(removed)
    }

    pub async fn get(&self, id: Ulid) -> Result<Booking, ServiceError> {
        self.store().get_one(id).await?.ok_or(ServiceError::NotFound(id))
    }

    pub async fn list(&self, resource_key: &str, status: StatusKind) -> Result<Vec<Booking>, ServiceError> {
        Ok(self.store().list_by_status(resource_key, status).await?)
    }
}
