mod error;
mod mutations;
mod queries;

pub use error::StoreError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceBookings = Arc<RwLock<ResourceBookings>>;

/// Outcome of a status update. Only `Applied` is a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied(Booking),
    /// Row already had the requested status.
    Unchanged(Booking),
    /// Row is in a status that cannot move to the requested one.
    Rejected(Booking),
    /// Row no longer exists.
    Missing,
}

/// The booking operations the reconciliation core and the service consume.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Bookings on `resource_key` with the given status, ordered by
    /// `(borrow_date, borrow_time)` ascending.
    async fn list_by_status(
        &self,
        resource_key: &str,
        status: StatusKind,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn get_one(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;

    /// Insert a new `Pending` booking; the store assigns id and timestamps.
    async fn insert(&self, draft: BookingDraft) -> Result<Booking, StoreError>;

    async fn update_status(&self, id: Ulid, status: BookingStatus) -> Result<StatusUpdate, StoreError>;

    /// Delete a booking, returning it if it still existed.
    async fn delete(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;

    /// Every resource key that currently holds at least one booking.
    async fn resource_keys(&self) -> Result<Vec<String>, StoreError>;
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Waits for an append, drains whatever else is already
/// queued, then commits the whole batch with one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray buffered bytes don't leak
    // into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Apply an event to a resource's bookings (caller holds the lock).
fn apply_event(rb: &mut ResourceBookings, event: &Event, index: &DashMap<Ulid, String>) {
    match event {
        Event::BookingCreated { booking } => {
            index.insert(booking.id, booking.resource_key.clone());
            rb.insert_booking(booking.clone());
        }
        Event::StatusChanged { id, status, at, .. } => {
            if let Some(b) = rb.get_mut(*id) {
                b.status = status.clone();
                b.updated_at = *at;
            }
        }
        Event::BookingDeleted { id, .. } => {
            rb.remove_booking(*id);
            index.remove(id);
        }
    }
}

/// WAL-backed booking store. State lives in memory, grouped per resource.
pub struct WalStore {
    pub(super) resources: DashMap<String, SharedResourceBookings>,
    /// Reverse lookup: ticket id → resource key.
    pub(super) ticket_index: DashMap<Ulid, String>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared; compaction holds it exclusively so no
    /// append can land between the snapshot and the file swap.
    pub(super) gate: RwLock<()>,
}

impl WalStore {
    /// Replay the WAL at `wal_path` and start the writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let ticket_index = DashMap::new();
        let mut replayed: HashMap<String, ResourceBookings> = HashMap::new();
        for event in &events {
            let key = event.resource_key();
            let rb = replayed
                .entry(key.to_string())
                .or_insert_with(|| ResourceBookings::new(key.to_string()));
            apply_event(rb, event, &ticket_index);
        }

        let resources = DashMap::new();
        for (key, rb) in replayed {
            resources.insert(key, Arc::new(RwLock::new(rb)));
        }

        Ok(Self {
            resources,
            ticket_index,
            wal_tx,
            gate: RwLock::new(()),
        })
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, key: &str) -> Option<SharedResourceBookings> {
        self.resources.get(key).map(|e| e.value().clone())
    }

    pub(super) fn get_or_create_resource(&self, key: &str) -> SharedResourceBookings {
        self.resources
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ResourceBookings::new(key.to_string()))))
            .value()
            .clone()
    }

    /// WAL-append then apply, under the caller's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        rb: &mut ResourceBookings,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_event(rb, event, &self.ticket_index);
        Ok(())
    }

    /// Look up the ticket's resource and take its write lock.
    pub(super) async fn resolve_ticket_write(
        &self,
        id: &Ulid,
    ) -> Option<tokio::sync::OwnedRwLockWriteGuard<ResourceBookings>> {
        let key = self.ticket_index.get(id).map(|e| e.value().clone())?;
        let rb = self.get_resource(&key)?;
        Some(rb.write_owned().await)
    }
}

#[async_trait]
impl BookingStore for WalStore {
    async fn list_by_status(
        &self,
        resource_key: &str,
        status: StatusKind,
    ) -> Result<Vec<Booking>, StoreError> {
        Ok(self.bookings_with_status(resource_key, status).await)
    }

    async fn get_one(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.find_booking(id).await)
    }

    async fn insert(&self, draft: BookingDraft) -> Result<Booking, StoreError> {
        self.insert_booking(draft).await
    }

    async fn update_status(&self, id: Ulid, status: BookingStatus) -> Result<StatusUpdate, StoreError> {
        self.set_status(id, status).await
    }

    async fn delete(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        self.delete_booking(id).await
    }

    async fn resource_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.occupied_keys().await)
    }
}
