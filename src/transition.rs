use std::sync::Arc;

use chrono::DateTime;
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::model::{Booking, BookingStatus, StatusKind};
use crate::notify::{Dispatcher, EventKind, Notification};
use crate::observability::{ANOMALIES_TOTAL, RECORDS_SKIPPED_TOTAL, TRANSITIONS_TOTAL};
use crate::resolver::{self, Anomaly, Decision};
use crate::store::{BookingStore, StatusUpdate, StoreError};

/// One resource's bookings as read at the start of a pass.
#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub resource_key: String,
    pub active: Vec<Booking>,
    pub pending: Vec<Booking>,
}

/// What one resource's reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceOutcome {
    pub promoted: usize,
    pub overdue_discarded: usize,
    pub duplicate_discarded: usize,
    pub skipped: usize,
    pub anomalies: usize,
}

impl ResourceOutcome {
    fn record(&mut self, kind: EventKind) {
        match kind {
            EventKind::Activated => self.promoted += 1,
            EventKind::OverdueDiscarded => self.overdue_discarded += 1,
            EventKind::DuplicateDiscarded => self.duplicate_discarded += 1,
            _ => {}
        }
    }

    pub fn merge(&mut self, other: &ResourceOutcome) {
        self.promoted += other.promoted;
        self.overdue_discarded += other.overdue_discarded;
        self.duplicate_discarded += other.duplicate_discarded;
        self.skipped += other.skipped;
        self.anomalies += other.anomalies;
    }

    pub fn transitions(&self) -> usize {
        self.promoted + self.overdue_discarded + self.duplicate_discarded
    }
}

/// Store mutation followed by exactly one notification.
///
/// The notification goes out only when the store reports that this call
/// changed the row, so two paths racing on the same ticket emit once.
pub struct Transitions {
    store: Arc<dyn BookingStore>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Transitions {
    pub fn new(store: Arc<dyn BookingStore>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    pub fn store(&self) -> &Arc<dyn BookingStore> {
        &self.store
    }

    /// Count and hand off. Never waits on delivery.
    pub fn emit(&self, notification: Notification) {
        metrics::counter!(TRANSITIONS_TOTAL, "kind" => notification.kind.as_str()).increment(1);
        self.dispatcher.dispatch(notification);
    }

    /// Apply one resolver decision. `Ok(None)` means another writer got
    /// there first and nothing was emitted.
    pub async fn apply(&self, decision: &Decision) -> Result<Option<EventKind>, StoreError> {
        let target = decision.booking();
        let after = match decision {
            Decision::Promote { .. } => match self.store.update_status(target.id, BookingStatus::Active).await? {
                StatusUpdate::Applied(updated) => updated,
                StatusUpdate::Unchanged(_) | StatusUpdate::Missing => {
                    debug!(ticket = %target.id, "promotion already applied or ticket gone");
                    return Ok(None);
                }
                StatusUpdate::Rejected(current) => {
                    debug!(ticket = %target.id, status = %current.status_kind(), "promotion from stale snapshot ignored");
                    return Ok(None);
                }
            },
            Decision::DiscardOverdue { .. } | Decision::DiscardDuplicate { .. } => {
                match self.store.delete(target.id).await? {
                    Some(existing) => existing,
                    None => {
                        debug!(ticket = %target.id, "discard target already gone");
                        return Ok(None);
                    }
                }
            }
        };

        let notification = Notification::for_decision(decision, &after);
        let kind = notification.kind;
        match decision.cause() {
            Some(cause) => info!(
                resource = %after.resource_key,
                ticket = %after.id,
                cause = %cause.id,
                "{kind}"
            ),
            None => info!(resource = %after.resource_key, ticket = %after.id, "{kind}"),
        }
        self.emit(notification);
        Ok(Some(kind))
    }

    pub async fn snapshot(&self, resource_key: &str) -> Result<ResourceSnapshot, StoreError> {
        Ok(ResourceSnapshot {
            resource_key: resource_key.to_string(),
            active: self.store.list_by_status(resource_key, StatusKind::Active).await?,
            pending: self.store.list_by_status(resource_key, StatusKind::Pending).await?,
        })
    }

    pub async fn reconcile_resource(
        &self,
        resource_key: &str,
        now: &DateTime<Tz>,
    ) -> Result<ResourceOutcome, StoreError> {
        let snapshot = self.snapshot(resource_key).await?;
        self.reconcile_snapshot(&snapshot, now).await
    }

    /// Resolve a snapshot and apply the decisions in order. A store error
    /// aborts the remaining decisions.
    pub async fn reconcile_snapshot(
        &self,
        snapshot: &ResourceSnapshot,
        now: &DateTime<Tz>,
    ) -> Result<ResourceOutcome, StoreError> {
        let resource_key = &snapshot.resource_key;
        let resolution = resolver::resolve(&snapshot.active, &snapshot.pending, now);

        let mut outcome = ResourceOutcome::default();
        for skipped in &resolution.skipped {
            warn!(resource = %resource_key, ticket = %skipped.id, "skipping booking: {}", skipped.error);
            metrics::counter!(RECORDS_SKIPPED_TOTAL).increment(1);
            outcome.skipped += 1;
        }
        if let Some(Anomaly::MultipleActive(ids)) = &resolution.anomaly {
            warn!(
                resource = %resource_key,
                tickets = ?ids,
                "multiple active bookings on one resource, manual intervention required"
            );
            metrics::counter!(ANOMALIES_TOTAL).increment(1);
            outcome.anomalies += 1;
        }

        for decision in &resolution.decisions {
            if let Some(kind) = self.apply(decision).await? {
                outcome.record(kind);
            }
        }
        Ok(outcome)
    }
}
