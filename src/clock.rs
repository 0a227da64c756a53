use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::Ms;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMATS: [&str; 2] = ["%H:%M", "%H:%M:%S"];

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Source of wall-clock time in a single fixed zone.
pub trait Clock: Send + Sync {
    fn timezone(&self) -> Tz;

    fn now(&self) -> DateTime<Tz>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn timezone(&self) -> Tz {
        self.tz
    }

    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Tz>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Tz>) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Build from local wall-clock fields in `tz`.
    pub fn at(tz: Tz, date: NaiveDate, time: NaiveTime) -> Self {
        Self::new(local_instant(tz, date.and_time(time)))
    }

    pub fn set(&self, now: DateTime<Tz>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn timezone(&self) -> Tz {
        self.now.lock().unwrap_or_else(PoisonError::into_inner).timezone()
    }

    fn now(&self) -> DateTime<Tz> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolve a local wall-clock time to an instant.
///
/// Ambiguous times (DST fold) take the earlier instant; nonexistent times
/// (DST gap) are pushed forward past the gap.
pub fn local_instant(tz: Tz, local: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earlier, _) => earlier,
        LocalResult::None => tz
            .from_local_datetime(&(local + Duration::hours(1)))
            .earliest()
            .unwrap_or_else(|| tz.from_utc_datetime(&local)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    MissingDate,
    MissingTime,
    BadDate(String),
    BadTime(String),
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::MissingDate => write!(f, "borrow date is missing"),
            ScheduleError::MissingTime => write!(f, "borrow time is missing"),
            ScheduleError::BadDate(s) => write!(f, "malformed borrow date: {s:?}"),
            ScheduleError::BadTime(s) => write!(f, "malformed borrow time: {s:?}"),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Scheduled start of use: a local date plus time of day.
/// Orders by date, then time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Schedule {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl Schedule {
    pub fn new(date: NaiveDate, time: NaiveTime) -> Self {
        Self { date, time }
    }

    pub fn parse(date: &str, time: &str) -> Result<Self, ScheduleError> {
        Ok(Self {
            date: parse_date(date)?,
            time: parse_time(time)?,
        })
    }

    pub fn instant(&self, tz: Tz) -> DateTime<Tz> {
        local_instant(tz, self.date.and_time(self.time))
    }

    /// True once the start instant is at or before `now`.
    pub fn has_arrived(&self, now: &DateTime<Tz>) -> bool {
        self.instant(now.timezone()) <= *now
    }
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, ScheduleError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ScheduleError::MissingDate);
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| ScheduleError::BadDate(raw.to_string()))
}

pub fn parse_time(raw: &str) -> Result<NaiveTime, ScheduleError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ScheduleError::MissingTime);
    }
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| ScheduleError::BadTime(raw.to_string()))
}
