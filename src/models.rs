//! Domain records (tasks, habits, completions, insights)
//!
//! Ids are opaque strings; server-created rows get a v4 UUID. All timestamps are
//! UTC and are stored in SQLite as fixed-width RFC 3339 strings so that string
//! comparison in SQL matches time comparison.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Render a timestamp in the form stored in the database
pub fn to_db_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp read back from the database
pub fn from_db_time(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Midnight (UTC) at the start of `day`
pub fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// A rejected field value
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid value for `{field}`: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors from habit bookkeeping and analysis
#[derive(Debug, thiserror::Error)]
pub enum HabitError {
    #[error("habit {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(ValidationError::new(
                "status",
                format!("unknown status '{other}'"),
            )),
        }
    }
}

/// A task/todo item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    /// 1 (lowest) to 5 (highest)
    pub priority: u8,
    pub status: TaskStatus,
    /// Minutes
    #[serde(default)]
    pub estimated_duration: Option<u32>,
    pub completion_percentage: f64,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(user_id: &str, title: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.into(),
            description: None,
            due_date: None,
            priority: 1,
            status: TaskStatus::Pending,
            estimated_duration: None,
            completion_percentage: 0.0,
            completed_at: None,
            created_at: at,
            updated_at: at,
        }
    }

    /// Keep `completed` consistent with `completed_at` and the percentage.
    ///
    /// Completed tasks always carry a completion time and 100%; any other status
    /// has no completion time.
    pub fn normalize_completion(&mut self, at: DateTime<Utc>) {
        if self.status == TaskStatus::Completed {
            self.completed_at.get_or_insert(at);
            self.completion_percentage = 100.0;
        } else {
            self.completed_at = None;
        }
    }
}

/// Period a habit's frequency count refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyType {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl FrequencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrequencyType::Daily => "daily",
            FrequencyType::Weekly => "weekly",
            FrequencyType::Monthly => "monthly",
        }
    }
}

impl FromStr for FrequencyType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(FrequencyType::Daily),
            "weekly" => Ok(FrequencyType::Weekly),
            "monthly" => Ok(FrequencyType::Monthly),
            other => Err(ValidationError::new(
                "frequency_type",
                format!("unknown frequency '{other}'"),
            )),
        }
    }
}

/// A recurring habit with cached streak counters.
///
/// `current_streak`, `longest_streak` and `total_completions` are a cache over the
/// completion log; [`crate::patterns::recompute_streaks`] rebuilds them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Habit {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub frequency_type: FrequencyType,
    pub frequency_value: u32,
    pub is_active: bool,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub total_completions: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Habit {
    pub fn new(user_id: &str, name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.into(),
            description: None,
            category: None,
            frequency_type: FrequencyType::Daily,
            frequency_value: 1,
            is_active: true,
            current_streak: 0,
            longest_streak: 0,
            total_completions: 0,
            created_at: at,
            updated_at: at,
        }
    }

    /// Advance the cached counters for one new completion.
    ///
    /// Only the first completion of a calendar day touches the streak: it extends
    /// the streak when the previous day had a completion (or no streak is
    /// running yet) and restarts it at 1 after a gap.
    pub fn register_completion(&mut self, already_done_today: bool, done_yesterday: bool) {
        self.total_completions += 1;
        if already_done_today {
            return;
        }

        if done_yesterday || self.current_streak == 0 {
            self.current_streak += 1;
        } else {
            self.current_streak = 1;
        }
        self.longest_streak = self.longest_streak.max(self.current_streak);
    }
}

/// One entry of a habit's append-only completion log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HabitCompletion {
    pub id: String,
    pub habit_id: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    /// 1-5
    #[serde(default)]
    pub quality_rating: Option<u8>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Mood and energy are on a 1-10 scale
    #[serde(default)]
    pub mood_before: Option<u8>,
    #[serde(default)]
    pub mood_after: Option<u8>,
    #[serde(default)]
    pub energy_before: Option<u8>,
    #[serde(default)]
    pub energy_after: Option<u8>,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

/// Body of a "habit completed" request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCompletion {
    /// Defaults to the time the request is handled
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub quality_rating: Option<u8>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub mood_before: Option<u8>,
    #[serde(default)]
    pub mood_after: Option<u8>,
    #[serde(default)]
    pub energy_before: Option<u8>,
    #[serde(default)]
    pub energy_after: Option<u8>,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl NewCompletion {
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("quality_rating", self.quality_rating, 1, 5)?;
        check_range("mood_before", self.mood_before, 1, 10)?;
        check_range("mood_after", self.mood_after, 1, 10)?;
        check_range("energy_before", self.energy_before, 1, 10)?;
        check_range("energy_after", self.energy_after, 1, 10)?;
        Ok(())
    }

    pub fn into_completion(self, habit_id: &str, now: DateTime<Utc>) -> HabitCompletion {
        HabitCompletion {
            id: uuid::Uuid::new_v4().to_string(),
            habit_id: habit_id.to_string(),
            completed_at: self.completed_at.unwrap_or(now),
            duration_minutes: self.duration_minutes,
            quality_rating: self.quality_rating,
            notes: self.notes,
            mood_before: self.mood_before,
            mood_after: self.mood_after,
            energy_before: self.energy_before,
            energy_after: self.energy_after,
            context: self.context,
        }
    }
}

fn check_range(field: &str, value: Option<u8>, min: u8, max: u8) -> Result<(), ValidationError> {
    match value {
        Some(v) if v < min || v > max => Err(ValidationError::new(
            field,
            format!("{v} is outside {min}-{max}"),
        )),
        _ => Ok(()),
    }
}

/// A persisted, human-readable observation about a habit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HabitInsight {
    pub id: i64,
    pub habit_id: String,
    pub insight_type: String,
    pub title: String,
    pub description: String,
    pub data: serde_json::Value,
    pub confidence: f64,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// One stored cross-habit pattern for a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorPattern {
    pub pattern_type: String,
    pub data: serde_json::Value,
    pub confidence_score: f64,
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 8, 0, 0).unwrap()
    }

    #[test]
    fn db_time_is_fixed_width_and_round_trips() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let s = to_db_time(&ts);
        assert_eq!(s, "2025-03-01T08:00:00.000000Z");
        assert_eq!(from_db_time(&s).unwrap(), ts);
    }

    #[test]
    fn completed_task_gets_completion_fields() {
        let mut task = Task::new("u1", "Write report", at(1));
        task.status = TaskStatus::Completed;
        task.normalize_completion(at(2));
        assert_eq!(task.completed_at, Some(at(2)));
        assert_eq!(task.completion_percentage, 100.0);

        task.status = TaskStatus::InProgress;
        task.normalize_completion(at(3));
        assert_eq!(task.completed_at, None);
    }

    #[test]
    fn streak_resets_after_gap_and_keeps_longest() {
        let mut habit = Habit::new("u1", "Run", at(1));
        // day D
        habit.register_completion(false, false);
        // day D+1
        habit.register_completion(false, true);
        assert_eq!(habit.current_streak, 2);
        // day D+3, nothing on D+2
        habit.register_completion(false, false);
        assert_eq!(habit.current_streak, 1);
        assert_eq!(habit.longest_streak, 2);
        assert_eq!(habit.total_completions, 3);
    }

    #[test]
    fn second_completion_same_day_leaves_streak() {
        let mut habit = Habit::new("u1", "Read", at(1));
        habit.register_completion(false, false);
        habit.register_completion(true, false);
        assert_eq!(habit.current_streak, 1);
        assert_eq!(habit.total_completions, 2);
    }

    #[test]
    fn completion_ratings_are_range_checked() {
        let bad = NewCompletion {
            quality_rating: Some(6),
            ..Default::default()
        };
        let err = bad.validate().unwrap_err();
        assert_eq!(err.field, "quality_rating");

        let ok = NewCompletion {
            mood_before: Some(3),
            mood_after: Some(7),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }
}
