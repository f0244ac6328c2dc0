use chrono::{DateTime, Datelike, Duration, FixedOffset, Local, NaiveDate, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wall-clock instant carrying the user's UTC offset.
pub type Timestamp = DateTime<FixedOffset>;

/// Current time in the local timezone, offset preserved.
pub fn local_now() -> Timestamp {
    Local::now().fixed_offset()
}

/// Local midnight of `date`, falling back to the earliest valid instant on DST gaps.
pub fn local_midnight(date: NaiveDate) -> Timestamp {
    let naive = date.and_time(NaiveTime::MIN);
    match Local.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.fixed_offset(),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.fixed_offset(),
        chrono::LocalResult::None => Local
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.fixed_offset())
            .unwrap_or_else(|| naive.and_utc().fixed_offset()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    NotStarted,
    Waiting,
    Success,
    Failed,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::NotStarted => "not_started",
            AuthState::Waiting => "waiting",
            AuthState::Success => "success",
            AuthState::Failed => "failed",
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NotStarted,
    Done,
}

impl TaskStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }
}

/// Client-side task identity. Never reused within a process.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(String);

impl LocalId {
    pub fn generate() -> Self {
        Self(format!("new-{}", Uuid::new_v4()))
    }

    /// Tasks loaded from the remote store reuse their page id locally.
    pub fn from_remote(remote_id: &str) -> Self {
        Self(remote_id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskTime {
    pub start: Timestamp,
    pub end: Option<Timestamp>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub local_id: LocalId,
    /// `None` until the first successful remote create.
    pub remote_id: Option<String>,
    pub content: String,
    pub tags: Vec<String>,
    pub status: TaskStatus,
    /// Relative priority as an integer percentage; higher sorts first.
    pub weight: u32,
    pub time: TaskTime,
}

impl Task {
    pub fn new(content: impl Into<String>, weight: u32) -> Self {
        Self {
            local_id: LocalId::generate(),
            remote_id: None,
            content: content.into(),
            tags: Vec::new(),
            status: TaskStatus::NotStarted,
            weight,
            time: TaskTime {
                start: local_now(),
                end: None,
            },
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.remote_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn local_day(&self) -> NaiveDate {
        self.time.start.with_timezone(&Local).date_naive()
    }
}

/// Half-open `[start, end)` interval over task creation instants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeWindow {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, instant: &Timestamp) -> bool {
        *instant >= self.start && *instant < self.end
    }

    pub fn for_day(date: NaiveDate) -> Self {
        let next = date.succ_opt().unwrap_or(date);
        Self::new(local_midnight(date), local_midnight(next))
    }

    /// Sunday-based week containing `date`.
    pub fn for_week(date: NaiveDate) -> Self {
        let offset = date.weekday().num_days_from_sunday() as i64;
        let first = date - Duration::days(offset);
        Self::new(
            local_midnight(first),
            local_midnight(first + Duration::days(7)),
        )
    }

    pub fn for_month(date: NaiveDate) -> Self {
        let first = date.with_day(1).unwrap_or(date);
        let next = if first.month() == 12 {
            NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
        }
        .unwrap_or(first);
        Self::new(local_midnight(first), local_midnight(next))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ViewKind {
    #[default]
    Today,
    Week,
    Month,
}

impl ViewKind {
    pub fn window(&self, date: NaiveDate) -> TimeWindow {
        match self {
            ViewKind::Today => TimeWindow::for_day(date),
            ViewKind::Week => TimeWindow::for_week(date),
            ViewKind::Month => TimeWindow::for_month(date),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "today" | "day" => Some(ViewKind::Today),
            "week" => Some(ViewKind::Week),
            "month" | "calendar" => Some(ViewKind::Month),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    Open,
    Done,
    All,
}

impl StatusFilter {
    pub fn matches(&self, status: TaskStatus) -> bool {
        match self {
            StatusFilter::Open => !status.is_done(),
            StatusFilter::Done => status.is_done(),
            StatusFilter::All => true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Person {
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NotionUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub person: Option<Person>,
}

/// Persisted access bundle plus workspace/database selection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub bot_id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub workspace_name: Option<String>,
    #[serde(default)]
    pub workspace_icon: Option<String>,
    /// Selected task database. Absent means linked but unconfigured.
    #[serde(default)]
    pub database_id: Option<String>,
    #[serde(default)]
    pub owner: Option<NotionUser>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl Credential {
    pub fn is_configured(&self) -> bool {
        self.database_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn owner_name(&self) -> Option<&str> {
        self.owner.as_ref().and_then(|owner| owner.name.as_deref())
    }
}

/// Notion ids are accepted with or without dashes; stored without.
pub fn compact_id(id: &str) -> String {
    id.trim().replace('-', "")
}
