use tokio::sync::oneshot;
use ulid::Ulid;

use crate::clock::now_ms;
use crate::limits::*;
use crate::model::*;

use super::{StatusUpdate, StoreError, WalCommand, WalStore};

impl WalStore {
    pub async fn insert_booking(&self, draft: BookingDraft) -> Result<Booking, StoreError> {
        let _gate = self.gate.read().await;
        let rb = self.get_or_create_resource(&draft.resource_key);
        let mut guard = rb.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(StoreError::LimitExceeded("too many bookings on resource"));
        }

        let now = now_ms();
        let booking = Booking {
            id: Ulid::new(),
            resource_key: draft.resource_key,
            status: BookingStatus::Pending,
            borrow_date: draft.borrow_date,
            borrow_time: draft.borrow_time,
            requester_id: draft.requester_id,
            details: draft.details,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(booking)
    }

    /// Idempotent: a missing row or a row already in `status` is not an error.
    /// Only forward lifecycle moves are written; anything else is `Rejected`.
    pub async fn set_status(&self, id: Ulid, status: BookingStatus) -> Result<StatusUpdate, StoreError> {
        let _gate = self.gate.read().await;
        let Some(mut guard) = self.resolve_ticket_write(&id).await else {
            return Ok(StatusUpdate::Missing);
        };
        let Some(current) = guard.get(id) else {
            return Ok(StatusUpdate::Missing);
        };
        if current.status == status {
            return Ok(StatusUpdate::Unchanged(current.clone()));
        }
        if !current.status.can_become(&status) {
            return Ok(StatusUpdate::Rejected(current.clone()));
        }

        let event = Event::StatusChanged {
            id,
            resource_key: guard.key.clone(),
            status,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        match guard.get(id) {
            Some(updated) => Ok(StatusUpdate::Applied(updated.clone())),
            None => Ok(StatusUpdate::Missing),
        }
    }

    /// Idempotent: deleting an already-deleted id returns `None`.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        let _gate = self.gate.read().await;
        let Some(mut guard) = self.resolve_ticket_write(&id).await else {
            return Ok(None);
        };
        let Some(existing) = guard.get(id).cloned() else {
            return Ok(None);
        };

        let event = Event::BookingDeleted {
            id,
            resource_key: guard.key.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Some(existing))
    }

    /// Rewrite the WAL as one `BookingCreated` per live booking.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _gate = self.gate.write().await;

        let mut keys: Vec<String> = self.resources.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        let mut events = Vec::new();
        for key in keys {
            let Some(rb) = self.get_resource(&key) else {
                continue;
            };
            let guard = rb.read().await;
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated { booking: b.clone() }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
