//! Database module for lifesync-server
//!
//! Row-level helpers take a `&Connection` so they run unchanged inside a
//! transaction (`Transaction` derefs to `Connection`). Every query that returns
//! user data is scoped by `user_id`, except the by-id lookups whose callers
//! check ownership themselves.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::{
    BehaviorPattern, Habit, HabitCompletion, HabitError, HabitInsight, NewCompletion, Task, day_start, from_db_time,
    to_db_time,
};

/// Thread-safe database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        Self::with_connection(conn)
    }

    /// Private in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init().context("Failed to initialize schema")?;
        Ok(db)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize the database schema
    fn init(&self) -> rusqlite::Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                due_date TEXT,
                priority INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'pending',
                estimated_duration INTEGER,
                completion_percentage REAL NOT NULL DEFAULT 0,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS habits (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                category TEXT,
                frequency_type TEXT NOT NULL DEFAULT 'daily',
                frequency_value INTEGER NOT NULL DEFAULT 1,
                is_active INTEGER NOT NULL DEFAULT 1,
                current_streak INTEGER NOT NULL DEFAULT 0,
                longest_streak INTEGER NOT NULL DEFAULT 0,
                total_completions INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Append-only completion log
            CREATE TABLE IF NOT EXISTS habit_completions (
                id TEXT PRIMARY KEY,
                habit_id TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                duration_minutes INTEGER,
                quality_rating INTEGER,
                notes TEXT,
                mood_before INTEGER,
                mood_after INTEGER,
                energy_before INTEGER,
                energy_after INTEGER,
                context TEXT NOT NULL DEFAULT '{}',
                FOREIGN KEY (habit_id) REFERENCES habits(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS habit_insights (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                habit_id TEXT NOT NULL,
                insight_type TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                data TEXT NOT NULL DEFAULT '{}',
                confidence REAL NOT NULL DEFAULT 0,
                is_read INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (habit_id) REFERENCES habits(id) ON DELETE CASCADE
            );

            -- Device sync state
            CREATE TABLE IF NOT EXISTS device_sync (
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                last_sync TEXT NOT NULL,
                PRIMARY KEY (user_id, device_id)
            );

            -- Cross-habit summary, one row per user and pattern type
            CREATE TABLE IF NOT EXISTS user_behavior_patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                pattern_type TEXT NOT NULL,
                pattern_data TEXT NOT NULL DEFAULT 'null',
                confidence_score REAL NOT NULL DEFAULT 0,
                last_updated TEXT NOT NULL,
                UNIQUE (user_id, pattern_type)
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_user_updated ON tasks(user_id, updated_at);
            CREATE INDEX IF NOT EXISTS idx_habits_user_updated ON habits(user_id, updated_at);
            CREATE INDEX IF NOT EXISTS idx_completions_habit ON habit_completions(habit_id, completed_at);
            CREATE INDEX IF NOT EXISTS idx_insights_habit ON habit_insights(habit_id);
            "#,
        )
    }

    /// Run `f` against the shared connection
    pub fn with_conn<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside one transaction; any error rolls the whole thing back
    pub fn with_transaction<T, E>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Append a completion and update the habit's cached counters atomically
    pub fn record_completion(
        &self,
        user_id: &str,
        habit_id: &str,
        new: NewCompletion,
        now: DateTime<Utc>,
    ) -> Result<(HabitCompletion, Habit), HabitError> {
        new.validate()?;

        self.with_transaction(|tx| {
            let mut habit = get_habit(tx, habit_id)?
                .filter(|h| h.user_id == user_id)
                .ok_or_else(|| HabitError::NotFound(habit_id.to_string()))?;

            let completion = new.into_completion(habit_id, now);
            let today = day_start(completion.completed_at.date_naive());
            let tomorrow = today + Duration::days(1);
            let yesterday = today - Duration::days(1);

            let already_done_today = has_completion_between(tx, habit_id, today, tomorrow)?;
            let done_yesterday = has_completion_between(tx, habit_id, yesterday, today)?;
            habit.register_completion(already_done_today, done_yesterday);
            habit.updated_at = now;

            insert_completion(tx, &completion)?;
            update_habit(tx, &habit)?;

            tracing::debug!(
                habit_id,
                streak = habit.current_streak,
                longest = habit.longest_streak,
                "Completion recorded"
            );

            Ok((completion, habit))
        })
    }
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    from_db_time(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        from_db_time(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str = "id, user_id, title, description, due_date, priority, status, \
     estimated_duration, completion_percentage, completed_at, created_at, updated_at";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        due_date: opt_time_at(row, 4)?,
        priority: row.get(5)?,
        status: parsed_at(row, 6)?,
        estimated_duration: row.get(7)?,
        completion_percentage: row.get(8)?,
        completed_at: opt_time_at(row, 9)?,
        created_at: time_at(row, 10)?,
        updated_at: time_at(row, 11)?,
    })
}

fn collect_tasks<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> rusqlite::Result<Vec<Task>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, task_from_row)?;
    rows.collect()
}

pub fn insert_task(conn: &Connection, task: &Task) -> rusqlite::Result<()> {
    conn.execute(
        r#"INSERT INTO tasks (id, user_id, title, description, due_date, priority, status,
           estimated_duration, completion_percentage, completed_at, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
        params![
            &task.id,
            &task.user_id,
            &task.title,
            &task.description,
            task.due_date.as_ref().map(to_db_time),
            task.priority,
            task.status.as_str(),
            task.estimated_duration,
            task.completion_percentage,
            task.completed_at.as_ref().map(to_db_time),
            to_db_time(&task.created_at),
            to_db_time(&task.updated_at),
        ],
    )?;
    Ok(())
}

pub fn update_task(conn: &Connection, task: &Task) -> rusqlite::Result<()> {
    conn.execute(
        r#"UPDATE tasks SET title = ?2, description = ?3, due_date = ?4, priority = ?5,
           status = ?6, estimated_duration = ?7, completion_percentage = ?8,
           completed_at = ?9, updated_at = ?10
           WHERE id = ?1"#,
        params![
            &task.id,
            &task.title,
            &task.description,
            task.due_date.as_ref().map(to_db_time),
            task.priority,
            task.status.as_str(),
            task.estimated_duration,
            task.completion_percentage,
            task.completed_at.as_ref().map(to_db_time),
            to_db_time(&task.updated_at),
        ],
    )?;
    Ok(())
}

/// Look up a task by id regardless of owner
pub fn get_task(conn: &Connection, id: &str) -> rusqlite::Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id],
        task_from_row,
    )
    .optional()
}

pub fn delete_task(conn: &Connection, id: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])
}

pub fn tasks_modified_since(
    conn: &Connection,
    user_id: &str,
    since: &DateTime<Utc>,
) -> rusqlite::Result<Vec<Task>> {
    collect_tasks(
        conn,
        &format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ?1 AND updated_at > ?2 ORDER BY updated_at"
        ),
        params![user_id, to_db_time(since)],
    )
}

/// Open tasks due no later than `until`, plus open tasks without a due date
pub fn schedulable_tasks(
    conn: &Connection,
    user_id: &str,
    until: &DateTime<Utc>,
) -> rusqlite::Result<Vec<Task>> {
    collect_tasks(
        conn,
        &format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ?1 \
             AND status IN ('pending', 'in_progress') \
             AND (due_date IS NULL OR due_date <= ?2) ORDER BY created_at"
        ),
        params![user_id, to_db_time(until)],
    )
}

pub fn completed_tasks_since(
    conn: &Connection,
    user_id: &str,
    since: &DateTime<Utc>,
) -> rusqlite::Result<Vec<Task>> {
    collect_tasks(
        conn,
        &format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ?1 AND status = 'completed' \
             AND updated_at >= ?2 ORDER BY updated_at"
        ),
        params![user_id, to_db_time(since)],
    )
}

/// The user's open tasks whose due date has passed
pub fn overdue_tasks(
    conn: &Connection,
    user_id: &str,
    now: &DateTime<Utc>,
) -> rusqlite::Result<Vec<Task>> {
    collect_tasks(
        conn,
        &format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = ?1 \
             AND due_date IS NOT NULL AND due_date < ?2 \
             AND status IN ('pending', 'in_progress') ORDER BY due_date"
        ),
        params![user_id, to_db_time(now)],
    )
}

/// Row count and latest `updated_at` for one user's tasks
pub fn task_stats(
    conn: &Connection,
    user_id: &str,
) -> rusqlite::Result<(u64, Option<DateTime<Utc>>)> {
    table_stats(conn, "tasks", user_id)
}

fn table_stats(
    conn: &Connection,
    table: &str,
    user_id: &str,
) -> rusqlite::Result<(u64, Option<DateTime<Utc>>)> {
    conn.query_row(
        &format!("SELECT COUNT(*), MAX(updated_at) FROM {table} WHERE user_id = ?1"),
        params![user_id],
        |row| Ok((row.get(0)?, opt_time_at(row, 1)?)),
    )
}

// ---------------------------------------------------------------------------
// Habits
// ---------------------------------------------------------------------------

const HABIT_COLUMNS: &str = "id, user_id, name, description, category, frequency_type, \
     frequency_value, is_active, current_streak, longest_streak, total_completions, \
     created_at, updated_at";

fn habit_from_row(row: &Row<'_>) -> rusqlite::Result<Habit> {
    Ok(Habit {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        frequency_type: parsed_at(row, 5)?,
        frequency_value: row.get(6)?,
        is_active: row.get(7)?,
        current_streak: row.get(8)?,
        longest_streak: row.get(9)?,
        total_completions: row.get(10)?,
        created_at: time_at(row, 11)?,
        updated_at: time_at(row, 12)?,
    })
}

fn collect_habits<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> rusqlite::Result<Vec<Habit>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, habit_from_row)?;
    rows.collect()
}

pub fn insert_habit(conn: &Connection, habit: &Habit) -> rusqlite::Result<()> {
    conn.execute(
        r#"INSERT INTO habits (id, user_id, name, description, category, frequency_type,
           frequency_value, is_active, current_streak, longest_streak, total_completions,
           created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
        params![
            &habit.id,
            &habit.user_id,
            &habit.name,
            &habit.description,
            &habit.category,
            habit.frequency_type.as_str(),
            habit.frequency_value,
            habit.is_active,
            habit.current_streak,
            habit.longest_streak,
            habit.total_completions,
            to_db_time(&habit.created_at),
            to_db_time(&habit.updated_at),
        ],
    )?;
    Ok(())
}

pub fn update_habit(conn: &Connection, habit: &Habit) -> rusqlite::Result<()> {
    conn.execute(
        r#"UPDATE habits SET name = ?2, description = ?3, category = ?4, frequency_type = ?5,
           frequency_value = ?6, is_active = ?7, current_streak = ?8, longest_streak = ?9,
           total_completions = ?10, updated_at = ?11
           WHERE id = ?1"#,
        params![
            &habit.id,
            &habit.name,
            &habit.description,
            &habit.category,
            habit.frequency_type.as_str(),
            habit.frequency_value,
            habit.is_active,
            habit.current_streak,
            habit.longest_streak,
            habit.total_completions,
            to_db_time(&habit.updated_at),
        ],
    )?;
    Ok(())
}

/// Look up a habit by id regardless of owner
pub fn get_habit(conn: &Connection, id: &str) -> rusqlite::Result<Option<Habit>> {
    conn.query_row(
        &format!("SELECT {HABIT_COLUMNS} FROM habits WHERE id = ?1"),
        params![id],
        habit_from_row,
    )
    .optional()
}

/// Delete a habit together with its completion log and insights
pub fn delete_habit(conn: &Connection, id: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM habit_insights WHERE habit_id = ?1", params![id])?;
    conn.execute("DELETE FROM habit_completions WHERE habit_id = ?1", params![id])?;
    conn.execute("DELETE FROM habits WHERE id = ?1", params![id])
}

pub fn habits_modified_since(
    conn: &Connection,
    user_id: &str,
    since: &DateTime<Utc>,
) -> rusqlite::Result<Vec<Habit>> {
    collect_habits(
        conn,
        &format!(
            "SELECT {HABIT_COLUMNS} FROM habits WHERE user_id = ?1 AND updated_at > ?2 ORDER BY updated_at"
        ),
        params![user_id, to_db_time(since)],
    )
}

pub fn habits_for_user(conn: &Connection, user_id: &str) -> rusqlite::Result<Vec<Habit>> {
    collect_habits(
        conn,
        &format!("SELECT {HABIT_COLUMNS} FROM habits WHERE user_id = ?1 ORDER BY created_at"),
        params![user_id],
    )
}

pub fn active_habits(conn: &Connection, user_id: &str) -> rusqlite::Result<Vec<Habit>> {
    collect_habits(
        conn,
        &format!(
            "SELECT {HABIT_COLUMNS} FROM habits WHERE user_id = ?1 AND is_active = 1 ORDER BY created_at"
        ),
        params![user_id],
    )
}

/// Row count and latest `updated_at` for one user's habits
pub fn habit_stats(
    conn: &Connection,
    user_id: &str,
) -> rusqlite::Result<(u64, Option<DateTime<Utc>>)> {
    table_stats(conn, "habits", user_id)
}

// ---------------------------------------------------------------------------
// Completions
// ---------------------------------------------------------------------------

const COMPLETION_COLUMNS: &str = "id, habit_id, completed_at, duration_minutes, quality_rating, \
     notes, mood_before, mood_after, energy_before, energy_after, context";

fn completion_from_row(row: &Row<'_>) -> rusqlite::Result<HabitCompletion> {
    Ok(HabitCompletion {
        id: row.get(0)?,
        habit_id: row.get(1)?,
        completed_at: time_at(row, 2)?,
        duration_minutes: row.get(3)?,
        quality_rating: row.get(4)?,
        notes: row.get(5)?,
        mood_before: row.get(6)?,
        mood_after: row.get(7)?,
        energy_before: row.get(8)?,
        energy_after: row.get(9)?,
        context: json_at(row, 10)?,
    })
}

pub fn insert_completion(conn: &Connection, completion: &HabitCompletion) -> rusqlite::Result<()> {
    let context = serde_json::Value::Object(completion.context.clone()).to_string();
    conn.execute(
        r#"INSERT INTO habit_completions (id, habit_id, completed_at, duration_minutes,
           quality_rating, notes, mood_before, mood_after, energy_before, energy_after, context)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
        params![
            &completion.id,
            &completion.habit_id,
            to_db_time(&completion.completed_at),
            completion.duration_minutes,
            completion.quality_rating,
            &completion.notes,
            completion.mood_before,
            completion.mood_after,
            completion.energy_before,
            completion.energy_after,
            context,
        ],
    )?;
    Ok(())
}

/// A habit's completion log, oldest first
pub fn completions_for_habit(
    conn: &Connection,
    habit_id: &str,
) -> rusqlite::Result<Vec<HabitCompletion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COMPLETION_COLUMNS} FROM habit_completions WHERE habit_id = ?1 ORDER BY completed_at"
    ))?;
    let rows = stmt.query_map(params![habit_id], completion_from_row)?;
    rows.collect()
}

/// The most recent `limit` completions, newest first
pub fn recent_completions(
    conn: &Connection,
    habit_id: &str,
    limit: usize,
) -> rusqlite::Result<Vec<HabitCompletion>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COMPLETION_COLUMNS} FROM habit_completions WHERE habit_id = ?1 \
         ORDER BY completed_at DESC LIMIT ?2"
    ))?;
    let rows = stmt.query_map(params![habit_id, limit as i64], completion_from_row)?;
    rows.collect()
}

fn has_completion_between(
    conn: &Connection,
    habit_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM habit_completions \
         WHERE habit_id = ?1 AND completed_at >= ?2 AND completed_at < ?3)",
        params![habit_id, to_db_time(&start), to_db_time(&end)],
        |row| row.get(0),
    )
}

// ---------------------------------------------------------------------------
// Insights
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub fn insert_insight(
    conn: &Connection,
    habit_id: &str,
    insight_type: &str,
    title: &str,
    description: &str,
    data: &serde_json::Value,
    confidence: f64,
    at: &DateTime<Utc>,
) -> rusqlite::Result<i64> {
    conn.execute(
        r#"INSERT INTO habit_insights (habit_id, insight_type, title, description, data,
           confidence, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
        params![
            habit_id,
            insight_type,
            title,
            description,
            data.to_string(),
            confidence,
            to_db_time(at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insights_for_habit(
    conn: &Connection,
    habit_id: &str,
    unread_only: bool,
) -> rusqlite::Result<Vec<HabitInsight>> {
    let mut stmt = conn.prepare(
        "SELECT id, habit_id, insight_type, title, description, data, confidence, is_read, created_at \
         FROM habit_insights WHERE habit_id = ?1 AND (?2 = 0 OR is_read = 0) \
         ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt.query_map(params![habit_id, unread_only], |row| {
        Ok(HabitInsight {
            id: row.get(0)?,
            habit_id: row.get(1)?,
            insight_type: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            data: json_at(row, 5)?,
            confidence: row.get(6)?,
            is_read: row.get(7)?,
            created_at: time_at(row, 8)?,
        })
    })?;
    rows.collect()
}

/// Mark an insight read if it belongs to one of the user's habits
pub fn mark_insight_read(conn: &Connection, user_id: &str, insight_id: i64) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE habit_insights SET is_read = 1 WHERE id = ?1 \
         AND habit_id IN (SELECT id FROM habits WHERE user_id = ?2)",
        params![insight_id, user_id],
    )?;
    Ok(changed > 0)
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Update device sync timestamp
pub fn update_device_sync(
    conn: &Connection,
    device_id: &str,
    user_id: &str,
    timestamp: &DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO device_sync (user_id, device_id, last_sync) VALUES (?1, ?2, ?3) \
         ON CONFLICT (user_id, device_id) DO UPDATE SET last_sync = excluded.last_sync",
        params![user_id, device_id, to_db_time(timestamp)],
    )?;
    Ok(())
}

#[cfg(test)]
pub fn device_last_sync(
    conn: &Connection,
    user_id: &str,
    device_id: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    conn.query_row(
        "SELECT last_sync FROM device_sync WHERE user_id = ?1 AND device_id = ?2",
        params![user_id, device_id],
        |row| time_at(row, 0),
    )
    .optional()
}

// ---------------------------------------------------------------------------
// Behavior patterns
// ---------------------------------------------------------------------------

/// Insert or refresh one cross-habit pattern; an existing row keeps its confidence
pub fn upsert_behavior_pattern(
    conn: &Connection,
    user_id: &str,
    pattern_type: &str,
    data: &serde_json::Value,
    confidence: f64,
    at: &DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO user_behavior_patterns \
         (user_id, pattern_type, pattern_data, confidence_score, last_updated) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT (user_id, pattern_type) DO UPDATE SET \
         pattern_data = excluded.pattern_data, last_updated = excluded.last_updated",
        params![user_id, pattern_type, data.to_string(), confidence, to_db_time(at)],
    )?;
    Ok(())
}

pub fn behavior_patterns(conn: &Connection, user_id: &str) -> rusqlite::Result<Vec<BehaviorPattern>> {
    let mut stmt = conn.prepare(
        "SELECT pattern_type, pattern_data, confidence_score, last_updated \
         FROM user_behavior_patterns WHERE user_id = ?1 ORDER BY pattern_type",
    )?;
    let rows = stmt.query_map(params![user_id], |row| {
        Ok(BehaviorPattern {
            pattern_type: row.get(0)?,
            data: json_at(row, 1)?,
            confidence_score: row.get(2)?,
            last_updated: time_at(row, 3)?,
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn task_round_trip_and_feed() {
        let db = Database::open_in_memory().unwrap();
        let mut task = Task::new("alice", "Plan sprint", ts(1, 9));
        task.due_date = Some(ts(3, 17));
        task.priority = 4;

        db.with_conn(|conn| insert_task(conn, &task)).unwrap();
        let loaded = db.with_conn(|conn| get_task(conn, &task.id)).unwrap().unwrap();
        assert_eq!(loaded, task);

        let newer = db
            .with_conn(|conn| tasks_modified_since(conn, "alice", &ts(1, 8)))
            .unwrap();
        assert_eq!(newer.len(), 1);
        let none = db
            .with_conn(|conn| tasks_modified_since(conn, "alice", &ts(1, 9)))
            .unwrap();
        assert!(none.is_empty());
        let other_user = db
            .with_conn(|conn| tasks_modified_since(conn, "bob", &ts(1, 8)))
            .unwrap();
        assert!(other_user.is_empty());
    }

    #[test]
    fn schedulable_tasks_include_undated_and_skip_completed() {
        let db = Database::open_in_memory().unwrap();
        let mut due_soon = Task::new("alice", "Due soon", ts(1, 9));
        due_soon.due_date = Some(ts(2, 12));
        let mut due_later = Task::new("alice", "Due later", ts(1, 9));
        due_later.due_date = Some(ts(20, 12));
        let undated = Task::new("alice", "Someday", ts(1, 9));
        let mut done = Task::new("alice", "Done", ts(1, 9));
        done.status = TaskStatus::Completed;
        done.normalize_completion(ts(1, 10));

        db.with_conn(|conn| {
            for task in [&due_soon, &due_later, &undated, &done] {
                insert_task(conn, task)?;
            }
            Ok::<_, rusqlite::Error>(())
        })
        .unwrap();

        let tasks = db
            .with_conn(|conn| schedulable_tasks(conn, "alice", &ts(3, 0)))
            .unwrap();
        let titles: Vec<_> = tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles.len(), 2);
        assert!(titles.contains(&"Due soon"));
        assert!(titles.contains(&"Someday"));
    }

    #[test]
    fn record_completion_updates_streaks() {
        let db = Database::open_in_memory().unwrap();
        let habit = Habit::new("alice", "Stretch", ts(1, 6));
        db.with_conn(|conn| insert_habit(conn, &habit)).unwrap();

        for day in [1, 2, 4] {
            let new = NewCompletion {
                completed_at: Some(ts(day, 7)),
                ..Default::default()
            };
            db.record_completion("alice", &habit.id, new, ts(day, 7)).unwrap();
        }
        let (_, after_gap) = db
            .record_completion(
                "alice",
                &habit.id,
                NewCompletion {
                    completed_at: Some(ts(4, 20)),
                    ..Default::default()
                },
                ts(4, 20),
            )
            .unwrap();

        assert_eq!(after_gap.current_streak, 1);
        assert_eq!(after_gap.longest_streak, 2);
        assert_eq!(after_gap.total_completions, 4);

        let log = db
            .with_conn(|conn| completions_for_habit(conn, &habit.id))
            .unwrap();
        assert_eq!(log.len(), 4);
        assert!(log.windows(2).all(|w| w[0].completed_at <= w[1].completed_at));
    }

    #[test]
    fn record_completion_rejects_foreign_habit() {
        let db = Database::open_in_memory().unwrap();
        let habit = Habit::new("alice", "Stretch", ts(1, 6));
        db.with_conn(|conn| insert_habit(conn, &habit)).unwrap();

        let err = db
            .record_completion("mallory", &habit.id, NewCompletion::default(), ts(1, 7))
            .unwrap_err();
        assert!(matches!(err, HabitError::NotFound(_)));
    }

    #[test]
    fn insights_can_be_marked_read_by_owner_only() {
        let db = Database::open_in_memory().unwrap();
        let habit = Habit::new("alice", "Meditate", ts(1, 6));
        db.with_conn(|conn| insert_habit(conn, &habit)).unwrap();
        let id = db
            .with_conn(|conn| {
                insert_insight(
                    conn,
                    &habit.id,
                    "pattern",
                    "Optimal Time Identified",
                    "Mostly at 7:00",
                    &serde_json::json!({ "peak_hour": 7 }),
                    0.9,
                    &ts(2, 8),
                )
            })
            .unwrap();

        assert!(!db.with_conn(|conn| mark_insight_read(conn, "bob", id)).unwrap());
        assert!(db.with_conn(|conn| mark_insight_read(conn, "alice", id)).unwrap());

        let unread = db
            .with_conn(|conn| insights_for_habit(conn, &habit.id, true))
            .unwrap();
        assert!(unread.is_empty());
        let all = db
            .with_conn(|conn| insights_for_habit(conn, &habit.id, false))
            .unwrap();
        assert_eq!(all[0].data["peak_hour"], 7);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let task = Task::new("alice", "Temp", ts(1, 9));

        let result: Result<(), rusqlite::Error> = db.with_transaction(|tx| {
            insert_task(tx, &task)?;
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(result.is_err());
        assert!(db.with_conn(|conn| get_task(conn, &task.id)).unwrap().is_none());
    }

    #[test]
    fn device_sync_is_kept_per_user() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            update_device_sync(conn, "shared-tablet", "alice", &ts(1, 9))?;
            update_device_sync(conn, "shared-tablet", "bob", &ts(2, 9))?;
            update_device_sync(conn, "shared-tablet", "alice", &ts(3, 9))
        })
        .unwrap();

        let alice = db
            .with_conn(|conn| device_last_sync(conn, "alice", "shared-tablet"))
            .unwrap();
        let bob = db
            .with_conn(|conn| device_last_sync(conn, "bob", "shared-tablet"))
            .unwrap();
        assert_eq!(alice, Some(ts(3, 9)));
        assert_eq!(bob, Some(ts(2, 9)));
    }

    #[test]
    fn overdue_tasks_are_scoped_to_user() {
        let db = Database::open_in_memory().unwrap();
        let mut mine = Task::new("alice", "Mine", ts(1, 9));
        mine.due_date = Some(ts(2, 9));
        let mut theirs = Task::new("bob", "Theirs", ts(1, 9));
        theirs.due_date = Some(ts(2, 9));
        db.with_conn(|conn| {
            insert_task(conn, &mine)?;
            insert_task(conn, &theirs)
        })
        .unwrap();

        let overdue = db
            .with_conn(|conn| overdue_tasks(conn, "alice", &ts(5, 0)))
            .unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, mine.id);
    }

    #[test]
    fn behavior_patterns_upsert_per_type() {
        let db = Database::open_in_memory().unwrap();
        db.with_transaction(|tx| {
            upsert_behavior_pattern(tx, "alice", "most_productive_hour", &json!(7), 0.8, &ts(1, 9))?;
            upsert_behavior_pattern(tx, "alice", "habit_synergy_score", &json!(0.5), 0.8, &ts(1, 9))?;
            upsert_behavior_pattern(tx, "bob", "most_productive_hour", &json!(21), 0.8, &ts(1, 9))
        })
        .unwrap();
        db.with_conn(|conn| {
            upsert_behavior_pattern(conn, "alice", "most_productive_hour", &json!(9), 0.3, &ts(2, 9))
        })
        .unwrap();

        let alice = db.with_conn(|conn| behavior_patterns(conn, "alice")).unwrap();
        assert_eq!(alice.len(), 2);
        let hour = alice
            .iter()
            .find(|p| p.pattern_type == "most_productive_hour")
            .unwrap();
        assert_eq!(hour.data, json!(9));
        assert_eq!(hour.confidence_score, 0.8);
        assert_eq!(hour.last_updated, ts(2, 9));

        let bob = db.with_conn(|conn| behavior_patterns(conn, "bob")).unwrap();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].data, json!(21));
    }
}
