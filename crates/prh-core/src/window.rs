//! Half-open time windows and snapshot periods.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};

/// `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The calendar day `date` as seen from `offset`.
    pub fn day(date: NaiveDate, offset: FixedOffset) -> Self {
        Self::days(date, date, offset)
    }

    /// From the start of `first` to the start of the day after `last`.
    pub fn days(first: NaiveDate, last: NaiveDate, offset: FixedOffset) -> Self {
        Self {
            start: local_midnight(first, offset),
            end: local_midnight(last + Duration::days(1), offset),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

fn local_midnight(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let local = date.and_time(NaiveTime::MIN);
    (local - Duration::seconds(i64::from(offset.local_minus_utc()))).and_utc()
}

pub fn today_in(offset: FixedOffset) -> NaiveDate {
    Utc::now().with_timezone(&offset).date_naive()
}

pub fn yesterday_in(offset: FixedOffset) -> NaiveDate {
    today_in(offset) - Duration::days(1)
}

/// Monday and Sunday of the calendar week before the one containing `run_date`.
pub fn previous_week(run_date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let since_monday = i64::from(run_date.weekday().num_days_from_monday());
    let last_monday = run_date - Duration::days(since_monday + 7);
    (last_monday, last_monday + Duration::days(6))
}

/// Period covered by one export snapshot. Names are deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPeriod {
    Day(NaiveDate),
    Week { start: NaiveDate, end: NaiveDate },
}

const DAILY_PREFIX: &str = "export_prs_";
const DATE_FORMAT: &str = "%Y-%m-%d";

impl SnapshotPeriod {
    pub fn previous_week_of(run_date: NaiveDate) -> Self {
        let (start, end) = previous_week(run_date);
        Self::Week { start, end }
    }

    pub fn json_file_name(&self) -> String {
        match self {
            Self::Day(date) => format!("{DAILY_PREFIX}{}.json", date.format(DATE_FORMAT)),
            Self::Week { start, end } => format!(
                "export_prs_hebdo_{}_au_{}.json",
                start.format(DATE_FORMAT),
                end.format(DATE_FORMAT)
            ),
        }
    }

    pub fn markdown_file_name(&self) -> String {
        match self {
            Self::Day(date) => format!("rapport_{}.md", date.format(DATE_FORMAT)),
            Self::Week { start, end } => format!(
                "rapport_hebdo_{}_au_{}.md",
                start.format(DATE_FORMAT),
                end.format(DATE_FORMAT)
            ),
        }
    }

    pub fn window(&self, offset: FixedOffset) -> Window {
        match self {
            Self::Day(date) => Window::day(*date, offset),
            Self::Week { start, end } => Window::days(*start, *end, offset),
        }
    }

    /// Date encoded in a daily snapshot file name; `None` for anything else,
    /// weekly snapshots included.
    pub fn parse_daily_file_name(name: &str) -> Option<NaiveDate> {
        let date = name.strip_prefix(DAILY_PREFIX)?.strip_suffix(".json")?;
        NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
    }
}
