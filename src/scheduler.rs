use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Timelike};
use chrono_tz::Tz;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::clock::Clock;
use crate::notify::{Dispatcher, EventKind, Notification};
use crate::observability::{PASSES_TOTAL, PASS_DURATION_SECONDS};
use crate::store::{BookingStore, StoreError, WalStore};
use crate::transition::{ResourceOutcome, ResourceSnapshot, Transitions};

/// Which resources a pass covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceScope {
    /// Every resource key the store currently holds bookings for.
    All,
    Keys(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub pass_timeout: Option<Duration>,
    pub scope: ResourceScope,
    /// Local hour from which daily overdue reminders are sent.
    pub reminder_hour: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            pass_timeout: None,
            scope: ResourceScope::All,
            reminder_hour: 9,
        }
    }
}

#[derive(Debug)]
pub enum PassError {
    Store(StoreError),
    TimedOut(Duration),
}

impl std::fmt::Display for PassError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassError::Store(e) => write!(f, "store error: {e}"),
            PassError::TimedOut(limit) => write!(f, "pass exceeded {}ms", limit.as_millis()),
        }
    }
}

impl std::error::Error for PassError {}

impl From<StoreError> for PassError {
    fn from(e: StoreError) -> Self {
        PassError::Store(e)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub resources: usize,
    pub totals: ResourceOutcome,
    pub reminders: usize,
}

#[derive(Debug)]
pub enum TickOutcome {
    Completed(PassReport),
    /// The previous pass still held the guard; nothing was read or written.
    Skipped,
    Failed(PassError),
}

/// State that lives across passes. Holding its lock is the reentrancy guard.
#[derive(Debug, Default)]
struct PassState {
    /// Ticket → last local date an overdue reminder went out.
    last_reminded: HashMap<Ulid, NaiveDate>,
}

/// Drives the resolver against the store, one pass per tick.
pub struct Reconciler {
    transitions: Transitions,
    clock: Arc<dyn Clock>,
    scope: ResourceScope,
    pass_timeout: Option<Duration>,
    reminder_hour: u32,
    state: Mutex<PassState>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn BookingStore>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            transitions: Transitions::new(store, dispatcher),
            clock,
            scope: config.scope.clone(),
            pass_timeout: config.pass_timeout,
            reminder_hour: config.reminder_hour,
            state: Mutex::new(PassState::default()),
        }
    }

    /// Run one pass unless one is already running.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(mut state) = self.state.try_lock() else {
            debug!("previous reconciliation pass still running, skipping tick");
            metrics::counter!(PASSES_TOTAL, "outcome" => "skipped").increment(1);
            return TickOutcome::Skipped;
        };

        let started = Instant::now();
        let result = match self.pass_timeout {
            Some(limit) => tokio::time::timeout(limit, self.pass(&mut state))
                .await
                .unwrap_or(Err(PassError::TimedOut(limit))),
            None => self.pass(&mut state).await,
        };
        drop(state);
        metrics::histogram!(PASS_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match result {
            Ok(report) => {
                metrics::counter!(PASSES_TOTAL, "outcome" => "completed").increment(1);
                if report.totals.transitions() > 0 || report.reminders > 0 {
                    info!(
                        resources = report.resources,
                        promoted = report.totals.promoted,
                        overdue_discarded = report.totals.overdue_discarded,
                        duplicate_discarded = report.totals.duplicate_discarded,
                        reminders = report.reminders,
                        "reconciliation pass applied changes"
                    );
                }
                TickOutcome::Completed(report)
            }
            Err(e) => {
                let outcome = match e {
                    PassError::TimedOut(_) => "timed_out",
                    PassError::Store(_) => "failed",
                };
                metrics::counter!(PASSES_TOTAL, "outcome" => outcome).increment(1);
                error!("reconciliation pass aborted: {e}");
                TickOutcome::Failed(e)
            }
        }
    }

    /// Resolve once the in-flight pass, if any, has finished.
    pub async fn wait_idle(&self) {
        drop(self.state.lock().await);
    }

    async fn pass(&self, state: &mut PassState) -> Result<PassReport, PassError> {
        let now = self.clock.now();
        let keys = match &self.scope {
            ResourceScope::All => self.transitions.store().resource_keys().await?,
            ResourceScope::Keys(keys) => keys.clone(),
        };

        // Read everything first so each resource is decided from the state
        // at the start of the pass.
        let mut snapshots = Vec::with_capacity(keys.len());
        for key in &keys {
            snapshots.push(self.transitions.snapshot(key).await?);
        }

        let mut report = PassReport {
            resources: snapshots.len(),
            ..PassReport::default()
        };
        for snapshot in &snapshots {
            let outcome = self.transitions.reconcile_snapshot(snapshot, &now).await?;
            report.totals.merge(&outcome);
        }
        report.reminders = self.send_reminders(state, &snapshots, &now);
        Ok(report)
    }

    /// One `overdue-reminder` per day for each active booking that started
    /// before today.
    fn send_reminders(&self, state: &mut PassState, snapshots: &[ResourceSnapshot], now: &DateTime<Tz>) -> usize {
        let today = now.date_naive();
        let due = now.hour() >= self.reminder_hour;
        let mut seen = HashSet::new();
        let mut sent = 0;

        for booking in snapshots.iter().flat_map(|s| s.active.iter()) {
            seen.insert(booking.id);
            let Ok(schedule) = booking.schedule() else {
                continue;
            };
            if !due || schedule.date >= today || state.last_reminded.get(&booking.id) == Some(&today) {
                continue;
            }

            let days = (today - schedule.date).num_days();
            let mut n = Notification::new(EventKind::OverdueReminder, booking);
            n.payload = n.payload.with("days_overdue", days.to_string());
            info!(resource = %booking.resource_key, ticket = %booking.id, days, "overdue reminder");
            self.transitions.emit(n);
            state.last_reminded.insert(booking.id, today);
            sent += 1;
        }

        state.last_reminded.retain(|id, _| seen.contains(id));
        sent
    }
}

/// Tick every `interval` until `shutdown` flips, then wait for the last pass.
///
/// Each tick runs on its own task so a slow pass never delays the ticker;
/// overlapping ticks are turned away by the reconciler's guard. Tick tasks
/// are joined before returning, and one that starts after shutdown does nothing.
pub async fn run_scheduler(reconciler: Arc<Reconciler>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_ms = interval.as_millis() as u64, "reconciliation scheduler started");

    let mut ticks = JoinSet::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                while ticks.try_join_next().is_some() {}
                let r = reconciler.clone();
                let stop = shutdown.clone();
                ticks.spawn(async move {
                    if *stop.borrow() {
                        return;
                    }
                    r.tick().await;
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    while let Some(joined) = ticks.join_next().await {
        if let Err(e) = joined {
            error!("reconciliation tick task failed: {e}");
        }
    }
    reconciler.wait_idle().await;
    info!("reconciliation scheduler stopped");
}

/// Compact the WAL whenever enough appends have piled up.
pub async fn run_compactor(
    store: Arc<WalStore>,
    threshold: u64,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}
