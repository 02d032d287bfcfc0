//! In-process notification queue
//!
//! One bounded queue per user behind a mutex. Pushing onto a full queue drops the
//! oldest entry; draining hands everything over and empties the queue, so each
//! notification is delivered at most once. Nothing survives a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::db::{self, Database};

pub const QUEUE_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    HabitInsight,
    OverdueTask,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    /// 1 (low) to 5 (urgent)
    pub priority: u8,
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        priority: u8,
        data: Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            title: title.into(),
            message: message.into(),
            priority,
            data,
            created_at,
        }
    }
}

/// Per-user bounded notification queues
pub struct NotificationHub {
    queues: Mutex<HashMap<String, VecDeque<Notification>>>,
    capacity: usize,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Notification>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, user_id: &str, notification: Notification) {
        let mut queues = self.lock();
        let queue = queues.entry(user_id.to_string()).or_default();
        if queue.len() == self.capacity {
            queue.pop_front();
        }
        queue.push_back(notification);
    }

    /// Remove and return everything queued for `user_id`, oldest first
    pub fn drain(&self, user_id: &str) -> Vec<Notification> {
        self.lock()
            .remove(user_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn pending(&self, user_id: &str) -> usize {
        self.lock().get(user_id).map_or(0, VecDeque::len)
    }

    /// Whether anything queued for `user_id` matches `pred`
    pub fn any_queued(&self, user_id: &str, pred: impl Fn(&Notification) -> bool) -> bool {
        self.lock()
            .get(user_id)
            .is_some_and(|queue| queue.iter().any(pred))
    }
}

fn is_overdue_notice_for(notification: &Notification, task_id: &str) -> bool {
    notification.kind == NotificationKind::OverdueTask
        && notification.data.get("task_id").and_then(Value::as_str) == Some(task_id)
}

/// Queue an overdue notice for each of the user's open tasks whose due date has
/// passed, skipping tasks that already have one waiting. Returns how many were queued.
pub fn sweep_overdue(
    db: &Database,
    hub: &NotificationHub,
    user_id: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    let overdue: Vec<_> = db
        .with_conn(|conn| db::overdue_tasks(conn, user_id, &now))?
        .into_iter()
        .filter(|task| !hub.any_queued(user_id, |n| is_overdue_notice_for(n, &task.id)))
        .collect();

    for task in &overdue {
        hub.push(
            user_id,
            Notification::new(
                NotificationKind::OverdueTask,
                format!("Overdue: {}", task.title),
                format!("Task '{}' is overdue. Would you like to reschedule?", task.title),
                5,
                json!({ "task_id": task.id, "due_date": task.due_date }),
                now,
            ),
        );
    }

    if !overdue.is_empty() {
        tracing::info!(user_id, count = overdue.len(), "Overdue task notifications queued");
    }
    Ok(overdue.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Task, TaskStatus};
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, hour, 0, 0).unwrap()
    }

    fn note(title: &str) -> Notification {
        Notification::new(
            NotificationKind::HabitInsight,
            title,
            "body",
            3,
            Value::Null,
            at(9),
        )
    }

    #[test]
    fn drain_is_at_most_once_and_per_user() {
        let hub = NotificationHub::new();
        hub.push("alice", note("one"));
        hub.push("alice", note("two"));
        hub.push("bob", note("other"));

        let drained = hub.drain("alice");
        let titles: Vec<_> = drained.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["one", "two"]);
        assert!(hub.drain("alice").is_empty());
        assert_eq!(hub.pending("bob"), 1);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let hub = NotificationHub::with_capacity(3);
        for i in 0..5 {
            hub.push("alice", note(&format!("n{i}")));
        }
        assert_eq!(hub.pending("alice"), 3);
        let titles: Vec<_> = hub.drain("alice").into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["n2", "n3", "n4"]);
    }

    #[test]
    fn overdue_sweep_covers_only_the_given_user() {
        let db = Database::open_in_memory().unwrap();
        let hub = NotificationHub::new();

        let mut late = Task::new("alice", "File taxes", at(1));
        late.due_date = Some(at(8) - Duration::days(1));
        let mut done = Task::new("alice", "Old chore", at(1));
        done.due_date = Some(at(8) - Duration::days(2));
        done.status = TaskStatus::Completed;
        let mut future = Task::new("bob", "Later", at(1));
        future.due_date = Some(at(8) + Duration::days(1));

        db.with_conn(|conn| {
            for task in [&late, &done, &future] {
                db::insert_task(conn, task)?;
            }
            Ok::<_, rusqlite::Error>(())
        })
        .unwrap();

        assert_eq!(sweep_overdue(&db, &hub, "alice", at(8)).unwrap(), 1);
        let queued = hub.drain("alice");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, NotificationKind::OverdueTask);
        assert_eq!(queued[0].title, "Overdue: File taxes");
        assert_eq!(queued[0].data["task_id"], late.id.as_str());
        assert_eq!(hub.pending("bob"), 0);
    }

    #[test]
    fn repeated_sweeps_do_not_duplicate_notices() {
        let db = Database::open_in_memory().unwrap();
        let hub = NotificationHub::new();
        let mut late = Task::new("alice", "File taxes", at(1));
        late.due_date = Some(at(8) - Duration::days(1));
        let mut theirs = Task::new("bob", "Pay rent", at(1));
        theirs.due_date = Some(at(8) - Duration::days(1));
        db.with_conn(|conn| {
            db::insert_task(conn, &late)?;
            db::insert_task(conn, &theirs)
        })
        .unwrap();

        for _ in 0..3 {
            sweep_overdue(&db, &hub, "alice", at(8)).unwrap();
        }
        assert_eq!(hub.pending("alice"), 1);
        assert_eq!(hub.pending("bob"), 0);

        // Once drained, the task is announced again
        hub.drain("alice");
        assert_eq!(sweep_overdue(&db, &hub, "alice", at(9)).unwrap(), 1);
    }
}
