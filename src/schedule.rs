//! Scheduling heuristic engine
//!
//! Builds a day plan from open tasks, daily habit commitments and the user's
//! historical productivity pattern. The text generator gets one bounded attempt
//! at the plan; any failure there drops to a deterministic rule-based packer so
//! the caller always receives a schedule.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::db::{self, Database};
use crate::llm::{self, TextGenerator};
use crate::models::{FrequencyType, Task, day_start};

/// Score reported for rule-based schedules
pub const FALLBACK_SCORE: f64 = 70.0;

const FALLBACK_START_HOUR: u32 = 9;
const FALLBACK_END_HOUR: u32 = 18;
const FALLBACK_MAX_TASKS: usize = 8;
const COMMITMENT_MINUTES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Energy {
    Low,
    Medium,
    High,
}

/// A named slice of the day with its default energy level
#[derive(Debug, Clone, Copy)]
pub struct TimeBlock {
    pub name: &'static str,
    pub start: u32,
    pub end: u32,
    pub energy: Energy,
}

pub const TIME_BLOCKS: [TimeBlock; 6] = [
    TimeBlock { name: "Early Morning", start: 6, end: 9, energy: Energy::High },
    TimeBlock { name: "Morning", start: 9, end: 12, energy: Energy::High },
    TimeBlock { name: "Midday", start: 12, end: 14, energy: Energy::Medium },
    TimeBlock { name: "Afternoon", start: 14, end: 17, energy: Energy::Medium },
    TimeBlock { name: "Evening", start: 17, end: 20, energy: Energy::Low },
    TimeBlock { name: "Night", start: 20, end: 23, energy: Energy::Low },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HabitPreference {
    pub habit_id: String,
    pub name: String,
    /// Most frequent completion hour over the last 30 completions
    pub preferred_hour: u32,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRatio {
    pub work_ratio: f64,
    pub personal_ratio: f64,
}

/// What the user's history says about when they get things done
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPatterns {
    /// Up to three hours with the most task completions in the last 30 days
    pub peak_hours: Vec<u32>,
    pub energy_levels: BTreeMap<String, Energy>,
    pub habits: Vec<HabitPreference>,
    pub balance: BalanceRatio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulableTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: u8,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    /// Minutes
    pub estimated_duration: u32,
    pub complexity: Complexity,
    pub category: String,
}

impl SchedulableTask {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            priority: task.priority,
            due_date: task.due_date,
            estimated_duration: estimate_duration(task),
            complexity: estimate_complexity(task),
            category: categorize(task).to_string(),
        }
    }
}

/// A fixed slot the plan has to respect (currently: daily habits)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    /// Minutes
    pub duration: u32,
    pub preferred_hour: u32,
    pub flexibility: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleBlock {
    /// "HH:MM"
    pub start_time: String,
    /// "HH:MM"
    pub end_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_match: Option<String>,
}

impl ScheduleBlock {
    fn times(&self) -> Option<(NaiveTime, NaiveTime)> {
        let start = NaiveTime::parse_from_str(&self.start_time, "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(&self.end_time, "%H:%M").ok()?;
        Some((start, end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleSource {
    Generated,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_blocks: Vec<ScheduleBlock>,
    pub unscheduled_tasks: Vec<Value>,
    pub optimization_score: f64,
    pub source: ScheduleSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkLifeBalance {
    pub work_percentage: f64,
    pub personal_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleMetrics {
    pub total_scheduled_items: usize,
    pub work_life_balance: WorkLifeBalance,
    pub optimization_score: f64,
    pub unscheduled_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub priority: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedSchedule {
    pub success: bool,
    pub target_date: NaiveDate,
    #[serde(flatten)]
    pub schedule: Schedule,
    pub metrics: ScheduleMetrics,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// Task heuristics
// ---------------------------------------------------------------------------

fn task_text(task: &Task) -> String {
    format!("{} {}", task.title, task.description.as_deref().unwrap_or("")).to_lowercase()
}

fn mentions(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

/// Estimated minutes for a task, in [15, 240].
///
/// Priority scales a 30 minute base, a long description stretches it, then
/// keywords adjust it. "meeting"/"call" pins the estimate to 60 minutes and
/// takes precedence over the quick/long multipliers.
pub fn estimate_duration(task: &Task) -> u32 {
    let multiplier = match task.priority {
        1 => 0.5,
        2 => 1.0,
        3 => 1.5,
        4 => 2.0,
        5 => 2.5,
        _ => 1.0,
    };
    let mut minutes = 30.0 * multiplier;

    if let Some(description) = task.description.as_deref().filter(|d| !d.is_empty()) {
        let factor = (description.chars().count() as f64 / 100.0).min(2.0);
        minutes *= 1.0 + factor * 0.5;
    }

    let text = task_text(task);
    if mentions(&text, &["meeting", "call"]) {
        minutes = 60.0;
    } else if mentions(&text, &["quick", "brief", "short"]) {
        minutes *= 0.5;
    } else if mentions(&text, &["long", "detailed", "comprehensive"]) {
        minutes *= 1.5;
    }

    minutes.clamp(15.0, 240.0) as u32
}

pub fn estimate_complexity(task: &Task) -> Complexity {
    match task.priority {
        p if p >= 4 => Complexity::High,
        p if p >= 2 => Complexity::Medium,
        _ => Complexity::Low,
    }
}

pub fn categorize(task: &Task) -> &'static str {
    let text = task_text(task);
    if mentions(&text, &["work", "job", "project", "meeting", "email"]) {
        "work"
    } else if mentions(&text, &["exercise", "gym", "workout", "run"]) {
        "fitness"
    } else if mentions(&text, &["family", "friend", "personal", "home"]) {
        "personal"
    } else if mentions(&text, &["learn", "study", "read", "course"]) {
        "learning"
    } else {
        "general"
    }
}

/// Preferred hour for a habit commitment by category
pub fn habit_preferred_hour(category: Option<&str>) -> u32 {
    match category {
        Some("exercise") => 7,
        Some("meditation") => 8,
        Some("work") => 9,
        Some("learning") => 14,
        Some("social") => 18,
        Some("relaxation") => 20,
        _ => 12,
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// First most-frequent value, in iteration order
fn mode<T: PartialEq + Copy>(values: impl IntoIterator<Item = T>) -> Option<T> {
    let mut counts: Vec<(T, usize)> = Vec::new();
    for v in values {
        match counts.iter_mut().find(|(seen, _)| *seen == v) {
            Some((_, n)) => *n += 1,
            None => counts.push((v, 1)),
        }
    }
    let best = counts.iter().map(|(_, n)| *n).max()?;
    counts.into_iter().find(|(_, n)| *n == best).map(|(v, _)| v)
}

pub fn peak_hours(completion_hours: &[u32]) -> Vec<u32> {
    let mut histogram: Vec<(u32, usize)> = (0..24)
        .map(|h| (h, completion_hours.iter().filter(|&&c| c == h).count()))
        .collect();
    // stable: ties keep the earlier hour
    histogram.sort_by(|a, b| b.1.cmp(&a.1));
    histogram
        .into_iter()
        .take(3)
        .filter(|(_, count)| *count > 0)
        .map(|(hour, _)| hour)
        .collect()
}

pub fn energy_levels(peak_hours: &[u32]) -> BTreeMap<String, Energy> {
    TIME_BLOCKS
        .iter()
        .map(|block| {
            let boosted = peak_hours
                .iter()
                .any(|h| (block.start..block.end).contains(h));
            let energy = if boosted { Energy::High } else { block.energy };
            (block.name.to_string(), energy)
        })
        .collect()
}

fn analyze_user_patterns(
    conn: &Connection,
    user_id: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<UserPatterns> {
    let mut habits = Vec::new();
    for habit in db::habits_for_user(conn, user_id)? {
        let recent = db::recent_completions(conn, &habit.id, 30)?;
        if let Some(preferred_hour) = mode(recent.iter().map(|c| c.completed_at.hour())) {
            habits.push(HabitPreference {
                habit_id: habit.id,
                name: habit.name,
                preferred_hour,
                category: habit.category,
            });
        }
    }

    let completed = db::completed_tasks_since(conn, user_id, &(now - Duration::days(30)))?;
    let hours: Vec<u32> = completed.iter().map(|t| t.updated_at.hour()).collect();
    let peak_hours = peak_hours(&hours);

    let balance = if completed.is_empty() {
        BalanceRatio {
            work_ratio: 0.5,
            personal_ratio: 0.5,
        }
    } else {
        let work = completed
            .iter()
            .filter(|t| mentions(&t.title.to_lowercase(), &["work", "job"]))
            .count();
        let total = completed.len() as f64;
        BalanceRatio {
            work_ratio: work as f64 / total,
            personal_ratio: (completed.len() - work) as f64 / total,
        }
    };

    Ok(UserPatterns {
        energy_levels: energy_levels(&peak_hours),
        peak_hours,
        habits,
        balance,
    })
}

fn existing_commitments(conn: &Connection, user_id: &str) -> rusqlite::Result<Vec<Commitment>> {
    Ok(db::active_habits(conn, user_id)?
        .into_iter()
        .filter(|h| h.frequency_type == FrequencyType::Daily)
        .map(|h| Commitment {
            kind: "habit".to_string(),
            preferred_hour: habit_preferred_hour(h.category.as_deref()),
            title: h.name,
            duration: COMMITMENT_MINUTES,
            flexibility: "medium".to_string(),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Generation and validation
// ---------------------------------------------------------------------------

fn scheduling_prompt(
    tasks: &[SchedulableTask],
    commitments: &[Commitment],
    patterns: &UserPatterns,
    target_date: NaiveDate,
) -> String {
    let tasks_json = serde_json::to_string_pretty(tasks).unwrap_or_default();
    let commitments_json = serde_json::to_string_pretty(commitments).unwrap_or_default();
    let energy_json = serde_json::to_string(&patterns.energy_levels).unwrap_or_default();
    let balance_json = serde_json::to_string(&patterns.balance).unwrap_or_default();

    format!(
        r#"As an AI scheduling assistant, create an optimized daily schedule for {target_date}.

User Patterns:
- Peak productivity hours: {peak:?}
- Energy levels: {energy_json}
- Work-life balance ratio: {balance_json}

Tasks to Schedule:
{tasks_json}

Existing Commitments:
{commitments_json}

Guidelines:
1. Schedule high-complexity tasks during peak energy hours
2. Batch similar tasks together
3. Leave buffer time between tasks
4. Respect existing commitments
5. Balance work and personal tasks
6. Include breaks

Return a JSON schedule with this structure:
{{
    "schedule_blocks": [
        {{
            "start_time": "09:00",
            "end_time": "10:30",
            "task_id": "task_123",
            "title": "Task Title",
            "type": "work|personal|break|habit",
            "energy_match": "high|medium|low"
        }}
    ],
    "unscheduled_tasks": [],
    "optimization_score": 85
}}"#,
        peak = patterns.peak_hours,
    )
}

/// Keep blocks with parseable times that do not overlap an already kept block
pub fn validate_blocks(blocks: impl IntoIterator<Item = ScheduleBlock>) -> Vec<ScheduleBlock> {
    let mut accepted: Vec<(ScheduleBlock, NaiveTime, NaiveTime)> = Vec::new();
    for block in blocks {
        let Some((start, end)) = block.times() else {
            continue;
        };
        let overlaps = accepted
            .iter()
            .any(|(_, other_start, other_end)| start < *other_end && end > *other_start);
        if !overlaps {
            accepted.push((block, start, end));
        }
    }
    accepted.into_iter().map(|(block, _, _)| block).collect()
}

/// Turn the generator's answer into a schedule; `None` when it lacks a block list
fn accept_generated(value: &Value) -> Option<Schedule> {
    let raw_blocks = value.get("schedule_blocks")?.as_array()?;
    let blocks = raw_blocks
        .iter()
        .filter_map(|b| serde_json::from_value::<ScheduleBlock>(b.clone()).ok());

    Some(Schedule {
        schedule_blocks: validate_blocks(blocks),
        unscheduled_tasks: value
            .get("unscheduled_tasks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        optimization_score: value
            .get("optimization_score")
            .and_then(Value::as_f64)
            .map(|s| s.clamp(0.0, 100.0))
            .unwrap_or(FALLBACK_SCORE),
        source: ScheduleSource::Generated,
    })
}

fn clock(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Rule-based schedule: commitments first, then tasks packed from 09:00
pub fn fallback_schedule(tasks: &[SchedulableTask], commitments: &[Commitment]) -> Schedule {
    let mut blocks: Vec<ScheduleBlock> = commitments
        .iter()
        .map(|c| {
            let start = c.preferred_hour * 60;
            ScheduleBlock {
                start_time: clock(start),
                end_time: clock(start + c.duration),
                task_id: None,
                title: c.title.clone(),
                block_type: c.kind.clone(),
                energy_match: Some("medium".to_string()),
            }
        })
        .collect();

    let mut sorted: Vec<&SchedulableTask> = tasks.iter().collect();
    sorted.sort_by(|a, b| (b.priority, b.complexity).cmp(&(a.priority, a.complexity)));

    let mut hour = FALLBACK_START_HOUR;
    let mut placed = 0;
    for task in &sorted {
        if placed == FALLBACK_MAX_TASKS || hour >= FALLBACK_END_HOUR {
            break;
        }
        let start = hour * 60;
        blocks.push(ScheduleBlock {
            start_time: clock(start),
            end_time: clock(start + task.estimated_duration),
            task_id: Some(task.id.clone()),
            title: task.title.clone(),
            block_type: task.category.clone(),
            energy_match: Some("medium".to_string()),
        });
        placed += 1;
        hour += task.estimated_duration.div_ceil(60).max(1);
    }

    Schedule {
        schedule_blocks: blocks,
        unscheduled_tasks: sorted[placed..]
            .iter()
            .filter_map(|t| serde_json::to_value(t).ok())
            .collect(),
        optimization_score: FALLBACK_SCORE,
        source: ScheduleSource::Fallback,
    }
}

// ---------------------------------------------------------------------------
// Metrics and recommendations
// ---------------------------------------------------------------------------

pub fn schedule_metrics(schedule: &Schedule) -> ScheduleMetrics {
    let total = schedule.schedule_blocks.len();
    let share = |kind: &str| {
        if total == 0 {
            return 0.0;
        }
        let n = schedule
            .schedule_blocks
            .iter()
            .filter(|b| b.block_type == kind)
            .count();
        n as f64 / total as f64 * 100.0
    };

    ScheduleMetrics {
        total_scheduled_items: total,
        work_life_balance: WorkLifeBalance {
            work_percentage: share("work"),
            personal_percentage: share("personal"),
        },
        optimization_score: schedule.optimization_score,
        unscheduled_count: schedule.unscheduled_tasks.len(),
    }
}

fn recommendation(kind: &str, title: &str, message: String, priority: &str) -> Recommendation {
    Recommendation {
        kind: kind.to_string(),
        title: title.to_string(),
        message,
        priority: priority.to_string(),
    }
}

pub fn recommendations(metrics: &ScheduleMetrics) -> Vec<Recommendation> {
    let mut out = Vec::new();

    if metrics.optimization_score < 80.0 {
        out.push(recommendation(
            "optimization",
            "Schedule Optimization",
            "Your schedule could be better optimized. Consider rearranging tasks based on your energy levels.".to_string(),
            "medium",
        ));
    }

    let work = metrics.work_life_balance.work_percentage;
    if work > 70.0 {
        out.push(recommendation(
            "balance",
            "Work-Life Balance",
            "Consider adding more personal time to your schedule for better balance.".to_string(),
            "high",
        ));
    } else if work < 30.0 {
        out.push(recommendation(
            "balance",
            "Productivity Focus",
            "You might want to allocate more time for work-related tasks.".to_string(),
            "medium",
        ));
    }

    if metrics.unscheduled_count > 0 {
        out.push(recommendation(
            "tasks",
            "Unscheduled Tasks",
            format!(
                "You have {} tasks that couldn't be scheduled today. Consider rescheduling or breaking them down.",
                metrics.unscheduled_count
            ),
            "medium",
        ));
    }

    out
}

/// Plan `target_date` for `user_id`.
///
/// Only storage failures are errors; generator trouble of any kind yields the
/// rule-based schedule.
pub async fn optimize_schedule(
    db: &Database,
    generator: &dyn TextGenerator,
    budget: std::time::Duration,
    user_id: &str,
    target_date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<OptimizedSchedule, ScheduleError> {
    let until = day_start(target_date) + Duration::days(1);
    let (patterns, tasks, commitments) = db.with_conn(|conn| {
        let patterns = analyze_user_patterns(conn, user_id, now)?;
        let tasks: Vec<SchedulableTask> = db::schedulable_tasks(conn, user_id, &until)?
            .iter()
            .map(SchedulableTask::from_task)
            .collect();
        let commitments = existing_commitments(conn, user_id)?;
        Ok::<_, rusqlite::Error>((patterns, tasks, commitments))
    })?;

    let prompt = scheduling_prompt(&tasks, &commitments, &patterns, target_date);
    let schedule = llm::generate_json(generator, &prompt, budget, "schedule")
        .await
        .and_then(|value| accept_generated(&value))
        .unwrap_or_else(|| fallback_schedule(&tasks, &commitments));

    let metrics = schedule_metrics(&schedule);
    let recommendations = recommendations(&metrics);

    tracing::info!(
        user_id,
        %target_date,
        source = ?schedule.source,
        blocks = metrics.total_scheduled_items,
        unscheduled = metrics.unscheduled_count,
        "Schedule optimized"
    );

    Ok(OptimizedSchedule {
        success: true,
        target_date,
        schedule,
        metrics,
        recommendations,
    })
}
