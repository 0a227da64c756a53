use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use tokio::sync::broadcast;
use tokio_test::assert_ok;
use ulid::Ulid;

use fleetbook::clock::ManualClock;
use fleetbook::model::{Booking, BookingDetails, BookingDraft, BookingStatus, StatusKind};
use fleetbook::notify::{EventKind, Notification, NotifyHub};
use fleetbook::scheduler::{PassReport, Reconciler, SchedulerConfig, TickOutcome};
use fleetbook::service::{BookingService, ServiceError};
use fleetbook::store::{BookingStore, StatusUpdate, StoreError, WalStore};

// ── Test infrastructure ──────────────────────────────────────

const PLATE: &str = "ABC-123";

fn fresh_store() -> Arc<WalStore> {
    let dir = std::env::temp_dir().join(format!("fleetbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    Arc::new(WalStore::open(dir.join("bookings.wal")).unwrap())
}

fn clock_at(date: &str, time: &str) -> Arc<ManualClock> {
    Arc::new(ManualClock::at(
        Tz::UTC,
        NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        NaiveTime::parse_from_str(time, "%H:%M").unwrap(),
    ))
}

fn draft(resource_key: &str, date: &str, time: &str) -> BookingDraft {
    BookingDraft {
        resource_key: resource_key.to_string(),
        borrow_date: date.to_string(),
        borrow_time: time.to_string(),
        requester_id: "driver-7".to_string(),
        details: BookingDetails {
            project: Some("Bridge survey".into()),
            location: Some("North depot".into()),
            purpose: None,
            colleagues: vec!["chen".into()],
        },
    }
}

/// Counts writes and stalls reads, so a pass can be made to outlast a tick.
struct SlowStore {
    inner: Arc<WalStore>,
    read_delay: Duration,
    writes: AtomicUsize,
}

impl SlowStore {
    fn new(inner: Arc<WalStore>, read_delay: Duration) -> Self {
        Self {
            inner,
            read_delay,
            writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BookingStore for SlowStore {
    async fn list_by_status(&self, key: &str, status: StatusKind) -> Result<Vec<Booking>, StoreError> {
        tokio::time::sleep(self.read_delay).await;
        self.inner.list_by_status(key, status).await
    }

    async fn get_one(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        self.inner.get_one(id).await
    }

    async fn insert(&self, draft: BookingDraft) -> Result<Booking, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.insert(draft).await
    }

    async fn update_status(&self, id: Ulid, status: BookingStatus) -> Result<StatusUpdate, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update_status(id, status).await
    }

    async fn delete(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(id).await
    }

    async fn resource_keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.resource_keys().await
    }
}

struct World {
    store: Arc<WalStore>,
    clock: Arc<ManualClock>,
    reconciler: Reconciler,
    service: BookingService,
    rx: broadcast::Receiver<Notification>,
}

fn world(date: &str, time: &str) -> World {
    let store = fresh_store();
    let clock = clock_at(date, time);
    let hub = Arc::new(NotifyHub::new());
    let rx = hub.subscribe_all();
    let reconciler = Reconciler::new(store.clone(), hub.clone(), clock.clone(), &SchedulerConfig::default());
    let service = BookingService::new(store.clone(), hub, clock.clone(), "default");
    World {
        store,
        clock,
        reconciler,
        service,
        rx,
    }
}

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

async fn completed(reconciler: &Reconciler) -> PassReport {
    match reconciler.tick().await {
        TickOutcome::Completed(report) => report,
        other => panic!("expected a completed pass, got {other:?}"),
    }
}

async fn status(store: &WalStore, id: Ulid) -> Option<StatusKind> {
    store.get_one(id).await.unwrap().map(|b| b.status_kind())
}

// ── Promotion and discards ───────────────────────────────────

#[tokio::test]
async fn earliest_arrived_pending_is_promoted() {
    let mut w = world("2024-05-01", "09:30");
    let p1 = assert_ok!(w.store.insert(draft(PLATE, "2024-05-01", "09:00")).await);
    let p2 = assert_ok!(w.store.insert(draft(PLATE, "2024-05-02", "10:00")).await);

    let report = completed(&w.reconciler).await;
    assert_eq!(report.totals.promoted, 1);
    assert_eq!(status(&w.store, p1.id).await, Some(StatusKind::Active));
    assert_ne!(status(&w.store, p2.id).await, Some(StatusKind::Active));

    let sent = drain(&mut w.rx);
    let activated: Vec<_> = sent.iter().filter(|n| n.kind == EventKind::Activated).map(|n| n.ticket_id).collect();
    assert_eq!(activated, [p1.id]);
}

#[tokio::test]
async fn same_day_runner_up_is_discarded_as_duplicate() {
    let mut w = world("2024-05-01", "09:30");
    let p1 = assert_ok!(w.store.insert(draft(PLATE, "2024-05-01", "09:00")).await);
    let p2 = assert_ok!(w.store.insert(draft(PLATE, "2024-05-01", "14:00")).await);

    completed(&w.reconciler).await;
    assert_eq!(status(&w.store, p1.id).await, Some(StatusKind::Active));
    assert_eq!(status(&w.store, p2.id).await, None);

    let sent = drain(&mut w.rx);
    let kinds: Vec<_> = sent.iter().map(|n| n.kind).collect();
    assert_eq!(kinds, [EventKind::Activated, EventKind::DuplicateDiscarded]);
    let dup = &sent[1];
    assert_eq!(dup.ticket_id, p2.id);
    assert_eq!(dup.payload.get("related_ticket"), Some(p1.id.to_string().as_str()));
    assert!(dup.payload.get("reason").unwrap().contains(&p1.id.to_string()));
}

#[tokio::test]
async fn unreturned_use_discards_next_days_booking_whatever_its_time() {
    let mut w = world("2024-05-01", "09:30");
    let a = assert_ok!(w.store.insert(draft(PLATE, "2024-05-01", "09:00")).await);
    completed(&w.reconciler).await;
    drain(&mut w.rx);

    // Still A's own day: B's day has not come yet.
    let b = assert_ok!(w.store.insert(draft(PLATE, "2024-05-02", "09:00")).await);
    w.clock.advance(chrono::Duration::hours(2));
    completed(&w.reconciler).await;

    assert_eq!(status(&w.store, b.id).await, None);
    assert_eq!(status(&w.store, a.id).await, Some(StatusKind::Active));
    let sent = drain(&mut w.rx);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, EventKind::OverdueDiscarded);
    assert_eq!(sent[0].payload.get("related_ticket"), Some(a.id.to_string().as_str()));
    assert_eq!(sent[0].payload.get("reason"), Some(format!("previous use not yet returned (ticket {})", a.id).as_str()));
}

#[tokio::test]
async fn booking_days_ahead_is_discarded_on_the_active_days_own_morning() {
    let mut w = world("2024-05-01", "09:30");
    let a = assert_ok!(w.store.insert(draft(PLATE, "2024-05-01", "09:00")).await);
    let b = assert_ok!(w.store.insert(draft(PLATE, "2024-05-08", "07:00")).await);

    let report = completed(&w.reconciler).await;
    assert_eq!(report.totals.promoted, 1);
    assert_eq!(report.totals.overdue_discarded, 1);
    assert_eq!(status(&w.store, a.id).await, Some(StatusKind::Active));
    assert_eq!(status(&w.store, b.id).await, None);

    let kinds: Vec<_> = drain(&mut w.rx).into_iter().map(|n| (n.kind, n.ticket_id)).collect();
    assert_eq!(kinds, [(EventKind::Activated, a.id), (EventKind::OverdueDiscarded, b.id)]);

    // A fresh request for a later day is turned away up front.
    match w.service.create(draft(PLATE, "2024-05-09", "07:00")).await {
        Err(ServiceError::Conflict { ticket, .. }) => assert_eq!(ticket, a.id),
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn returned_booking_frees_the_resource() {
    let mut w = world("2024-05-01", "09:30");
    let a = assert_ok!(w.service.create(draft(PLATE, "2024-05-01", "09:00")).await);
    assert_ok!(w.service.return_now(a.id).await);
    let b = assert_ok!(w.service.create(draft(PLATE, "2024-05-02", "08:00")).await);
    drain(&mut w.rx);

    w.clock.advance(chrono::Duration::days(1));
    completed(&w.reconciler).await;

    assert!(matches!(w.store.get_one(a.id).await.unwrap().unwrap().status, BookingStatus::Returned { .. }));
    assert_eq!(status(&w.store, b.id).await, Some(StatusKind::Active));
    let kinds: Vec<_> = drain(&mut w.rx).into_iter().map(|n| n.kind).collect();
    assert_eq!(kinds, [EventKind::Activated]);
}

// ── Exactly-once and idempotence ─────────────────────────────

#[tokio::test]
async fn repeated_ticks_emit_each_transition_once() {
    let mut w = world("2024-05-01", "09:30");
    for (date, time) in [("2024-05-01", "09:00"), ("2024-05-01", "11:00"), ("2024-05-03", "09:00")] {
        assert_ok!(w.store.insert(draft(PLATE, date, time)).await);
    }
    assert_ok!(w.store.insert(draft("XYZ-9", "2024-05-01", "07:00")).await);

    // Promote, same-day duplicate, later-day overdue, promote on XYZ-9.
    let first = completed(&w.reconciler).await;
    assert_eq!(first.totals.transitions(), 4);
    for _ in 0..5 {
        let again = completed(&w.reconciler).await;
        assert_eq!(again.totals.transitions(), 0);
    }

    let sent = drain(&mut w.rx);
    assert_eq!(sent.len(), 4);
    for resource in [PLATE, "XYZ-9"] {
        let active = w.store.list_by_status(resource, StatusKind::Active).await.unwrap();
        assert_eq!(active.len(), 1, "{resource}");
    }
}

#[tokio::test]
async fn scheduler_and_service_race_on_one_row_announce_once() {
    let mut w = world("2024-05-01", "08:00");
    let p = assert_ok!(w.service.create(draft(PLATE, "2024-05-02", "09:00")).await);
    drain(&mut w.rx);

    // The resolver decided to discard, then the requester cancelled first.
    assert_ok!(w.service.cancel(p.id).await);
    let removed_again = w.store.delete(p.id).await.unwrap();
    assert_eq!(removed_again, None);

    let kinds: Vec<_> = drain(&mut w.rx).into_iter().map(|n| n.kind).collect();
    assert_eq!(kinds, [EventKind::Cancelled]);
}

// ── Reentrancy guard ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn tick_during_slow_pass_changes_nothing() {
    let inner = fresh_store();
    inner.insert(draft(PLATE, "2024-05-01", "09:00")).await.unwrap();
    inner.insert(draft(PLATE, "2024-05-01", "10:00")).await.unwrap();
    let slow = Arc::new(SlowStore::new(inner.clone(), Duration::from_secs(8)));
    let hub = Arc::new(NotifyHub::new());
    let mut rx = hub.subscribe_all();
    let reconciler = Arc::new(Reconciler::new(
        slow.clone(),
        hub,
        clock_at("2024-05-01", "10:30"),
        &SchedulerConfig::default(),
    ));

    let running = tokio::spawn({
        let r = reconciler.clone();
        async move { r.tick().await }
    });
    // One tick interval later the first pass is still reading.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let writes_before = slow.writes.load(Ordering::SeqCst);
    assert!(matches!(reconciler.tick().await, TickOutcome::Skipped));
    assert_eq!(slow.writes.load(Ordering::SeqCst), writes_before);
    assert!(drain(&mut rx).is_empty());

    assert!(matches!(running.await.unwrap(), TickOutcome::Completed(_)));
    assert_eq!(drain(&mut rx).len(), 2);
}

// ── Isolation and interactive path ───────────────────────────

#[tokio::test]
async fn resources_do_not_affect_each_other() {
    // Before the reminder hour, so only transitions are announced.
    let mut w = world("2024-05-02", "08:30");
    let blocker = assert_ok!(w.store.insert(draft(PLATE, "2024-05-01", "09:00")).await);
    assert_ok!(w.store.update_status(blocker.id, BookingStatus::Active).await);
    let victim = assert_ok!(w.store.insert(draft(PLATE, "2024-05-02", "09:00")).await);
    let other = assert_ok!(w.store.insert(draft("XYZ-9", "2024-05-02", "08:00")).await);

    completed(&w.reconciler).await;
    assert_eq!(status(&w.store, victim.id).await, None);
    assert_eq!(status(&w.store, other.id).await, Some(StatusKind::Active));

    let mut sent = drain(&mut w.rx);
    sent.sort_by_key(|n| n.resource_key.clone());
    assert_eq!(sent.len(), 2);
    assert_eq!((sent[0].resource_key.as_str(), sent[0].kind), (PLATE, EventKind::OverdueDiscarded));
    assert_eq!((sent[1].resource_key.as_str(), sent[1].kind), ("XYZ-9", EventKind::Activated));
}

#[tokio::test]
async fn interactive_and_scheduled_activation_look_the_same() {
    let mut interactive = world("2024-05-01", "09:30");
    let a = assert_ok!(interactive.service.create(draft(PLATE, "2024-05-01", "09:00")).await);
    let from_service = drain(&mut interactive.rx).pop().unwrap();

    let mut scheduled = world("2024-05-01", "08:00");
    let b = assert_ok!(scheduled.service.create(draft(PLATE, "2024-05-01", "09:00")).await);
    scheduled.clock.advance(chrono::Duration::minutes(90));
    completed(&scheduled.reconciler).await;
    let from_scheduler = drain(&mut scheduled.rx).pop().unwrap();

    assert_eq!(from_service.kind, EventKind::Activated);
    assert_eq!(from_scheduler.kind, EventKind::Activated);
    let mut lhs = from_service.payload.clone();
    let mut rhs = from_scheduler.payload.clone();
    lhs = lhs.with("ticket_id", "");
    rhs = rhs.with("ticket_id", "");
    assert_eq!(lhs, rhs);
    assert_eq!(from_service.ticket_id, a.id);
    assert_eq!(from_scheduler.ticket_id, b.id);
}

#[tokio::test]
async fn conflicting_create_is_rejected_before_any_write() {
    let mut w = world("2024-05-01", "09:30");
    let a = assert_ok!(w.service.create(draft(PLATE, "2024-05-01", "09:00")).await);
    drain(&mut w.rx);

    match w.service.create(draft(PLATE, "2024-05-01", "17:00")).await {
        Err(ServiceError::Conflict { ticket, .. }) => assert_eq!(ticket, a.id),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(drain(&mut w.rx).is_empty());
    assert!(w.store.list_by_status(PLATE, StatusKind::Pending).await.unwrap().is_empty());
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = std::env::temp_dir().join(format!("fleetbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("bookings.wal");

    let id = {
        let store = Arc::new(WalStore::open(path.clone()).unwrap());
        let hub = Arc::new(NotifyHub::new());
        let clock = clock_at("2024-05-01", "09:30");
        let r = Reconciler::new(store.clone(), hub, clock, &SchedulerConfig::default());
        let p = store.insert(draft(PLATE, "2024-05-01", "09:00")).await.unwrap();
        completed(&r).await;
        p.id
    };

    let reopened = WalStore::open(path).unwrap();
    assert_eq!(status(&reopened, id).await, Some(StatusKind::Active));
}
