use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Booking, BookingStatus};
use crate::resolver::Decision;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Created,
    Activated,
    Returned,
    Cancelled,
    OverdueDiscarded,
    DuplicateDiscarded,
    OverdueReminder,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Activated => "activated",
            EventKind::Returned => "returned",
            EventKind::Cancelled => "cancelled",
            EventKind::OverdueDiscarded => "overdue-discarded",
            EventKind::DuplicateDiscarded => "duplicate-discarded",
            EventKind::OverdueReminder => "overdue-reminder",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat key-value table describing a booking, for message rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, String>);

impl Payload {
    /// Everything informational about `b`. Optional fields appear only when set.
    pub fn for_booking(b: &Booking) -> Self {
        let mut p = Payload::default()
            .with("ticket_id", b.id.to_string())
            .with("resource_key", &b.resource_key)
            .with("requester", &b.requester_id)
            .with("status", b.status_kind().as_str())
            .with("borrow_date", &b.borrow_date)
            .with("borrow_time", &b.borrow_time);
        if let Some(project) = &b.details.project {
            p = p.with("project", project);
        }
        if let Some(location) = &b.details.location {
            p = p.with("location", location);
        }
        if let Some(purpose) = &b.details.purpose {
            p = p.with("purpose", purpose);
        }
        if !b.details.colleagues.is_empty() {
            p = p.with("colleagues", b.details.colleagues.join(", "));
        }
        if let BookingStatus::Returned { return_date, return_time } = &b.status {
            p = p
                .with("return_date", return_date.format("%Y-%m-%d").to_string())
                .with("return_time", return_time.format("%H:%M").to_string());
        }
        p
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// One outbound message. Built the same way whichever path caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: EventKind,
    pub resource_key: String,
    pub ticket_id: Ulid,
    pub payload: Payload,
}

impl Notification {
    pub fn new(kind: EventKind, booking: &Booking) -> Self {
        Self {
            kind,
            resource_key: booking.resource_key.clone(),
            ticket_id: booking.id,
            payload: Payload::for_booking(booking),
        }
    }

    /// A discard notice naming the ticket that caused it.
    pub fn discard(kind: EventKind, booking: &Booking, cause: &Booking, reason: String) -> Self {
        let mut n = Self::new(kind, booking);
        n.payload = n
            .payload
            .with("reason", reason)
            .with("related_ticket", cause.id.to_string());
        n
    }

    /// The notification for a resolver decision.
    ///
    /// `booking` is the row as it stands after the mutation (for a promotion,
    /// the updated row).
    pub fn for_decision(decision: &Decision, booking: &Booking) -> Self {
        match decision {
            Decision::Promote { .. } => Self::new(EventKind::Activated, booking),
            Decision::DiscardOverdue { blocking, .. } => Self::discard(
                EventKind::OverdueDiscarded,
                booking,
                blocking,
                crate::resolver::overdue_reason(blocking),
            ),
            Decision::DiscardDuplicate { activated, .. } => Self::discard(
                EventKind::DuplicateDiscarded,
                booking,
                activated,
                crate::resolver::duplicate_reason(activated),
            ),
        }
    }
}

/// Outbound notification boundary.
///
/// `dispatch` must return without waiting on delivery; implementations log
/// their own failures and never surface them to the caller.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, notification: Notification);
}

/// In-process broadcast, per resource key and for everything.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notification>>,
    all: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_key: &str) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(resource_key.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, notification: &Notification) {
        if let Some(sender) = self.channels.get(&notification.resource_key) {
            let _ = sender.send(notification.clone());
        }
        let _ = self.all.send(notification.clone());
    }
}

impl Dispatcher for NotifyHub {
    fn dispatch(&self, notification: Notification) {
        self.send(&notification);
    }
}

/// Hands each notification to every inner dispatcher.
pub struct Fanout {
    sinks: Vec<Arc<dyn Dispatcher>>,
}

impl Fanout {
    pub fn new(sinks: Vec<Arc<dyn Dispatcher>>) -> Self {
        Self { sinks }
    }
}

impl Dispatcher for Fanout {
    fn dispatch(&self, notification: Notification) {
        for sink in &self.sinks {
            sink.dispatch(notification.clone());
        }
    }
}
