//! Habit pattern analyzer
//!
//! Turns a habit's completion log into a [`PatternSnapshot`] of descriptive
//! statistics and derives human-readable insights from it. Analysis is a pure
//! function of the habit, its log and the supplied clock; the `analyze_user`
//! entry point adds persistence and notification around it.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::db::{self, Database};
use crate::models::{BehaviorPattern, Habit, HabitCompletion, HabitError, HabitInsight};
use crate::notify::{Notification, NotificationHub, NotificationKind};

/// Fewer completions than this and a habit is not analyzed at all
pub const MIN_DATA_POINTS: usize = 5;

/// Minimum completions for difficulty adaptation
pub const MIN_ADAPTATION_POINTS: usize = 7;

/// Minimum observations for quality, mood and context statistics
const MIN_OBSERVATIONS: usize = 3;

/// Confidence given to a newly stored cross-habit pattern
const BEHAVIOR_PATTERN_CONFIDENCE: f64 = 0.8;

const WEEKDAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

impl Trend {
    fn classify(delta: f64, threshold: f64) -> Self {
        if delta > threshold {
            Trend::Improving
        } else if delta < -threshold {
            Trend::Declining
        } else {
            Trend::Stable
        }
    }
}

/// A statistic that needs a minimum amount of data
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Gated<T> {
    Ready(T),
    InsufficientData { insufficient_data: bool },
}

impl<T> Gated<T> {
    fn insufficient() -> Self {
        Gated::InsufficientData {
            insufficient_data: true,
        }
    }

    pub fn ready(&self) -> Option<&T> {
        match self {
            Gated::Ready(value) => Some(value),
            Gated::InsufficientData { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRate {
    pub overall: f64,
    pub last_30_days: f64,
    pub last_7_days: f64,
    pub trend: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimePatterns {
    pub peak_hour: u32,
    pub peak_hour_percentage: f64,
    pub hourly_distribution: BTreeMap<u32, usize>,
    pub daily_distribution: BTreeMap<String, usize>,
    pub consistency_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityTrend {
    pub overall_average: f64,
    pub recent_average: f64,
    pub trend_slope: f64,
    pub trend: Trend,
    /// Standard deviation of the ratings
    pub consistency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoodEnergy {
    pub avg_mood_improvement: f64,
    pub avg_energy_improvement: f64,
    pub avg_mood_before: f64,
    pub avg_mood_after: f64,
    pub avg_energy_before: f64,
    pub avg_energy_after: f64,
    /// Fraction (0-1) of mood deltas that are positive
    pub positive_impact_percentage: f64,
    /// Fraction (0-1) of energy deltas that are positive
    pub positive_energy_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreakAnalysis {
    pub total_streaks: usize,
    pub average_streak_length: f64,
    pub longest_streak: u32,
    /// Length of the run ending at the latest completion
    pub current_streak: u32,
    pub average_break_length: f64,
    pub longest_break: u32,
    pub streak_consistency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextPattern {
    pub most_common: Value,
    pub frequency: f64,
    pub distribution: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationTrend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Adjustment {
    Increase,
    Decrease,
    Maintain,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DifficultyAdaptation {
    /// Minutes per completion; absent with fewer than three timed completions
    pub duration_trend_slope: Option<f64>,
    pub duration_trend: Option<DurationTrend>,
    pub quality_duration_correlation: f64,
    pub adaptation_score: f64,
    pub recommended_difficulty_adjustment: Adjustment,
}

/// Everything computed for one habit in one analysis run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternSnapshot {
    pub completion_rate: CompletionRate,
    pub time_patterns: TimePatterns,
    pub quality_trends: Gated<QualityTrend>,
    pub mood_energy_correlation: Gated<MoodEnergy>,
    pub streak_analysis: StreakAnalysis,
    pub contextual_patterns: BTreeMap<String, ContextPattern>,
    pub difficulty_adaptation: Gated<DifficultyAdaptation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insight {
    #[serde(rename = "type")]
    pub insight_type: String,
    pub title: String,
    pub description: String,
    pub data: Value,
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

fn mean(xs: &[f64]) -> Option<f64> {
    (!xs.is_empty()).then(|| xs.iter().sum::<f64>() / xs.len() as f64)
}

/// Population standard deviation
fn std_dev(xs: &[f64]) -> f64 {
    let Some(m) = mean(xs) else {
        return 0.0;
    };
    (xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64).sqrt()
}

/// Least-squares slope of `ys` against 0, 1, 2, ...
fn slope(ys: &[f64]) -> f64 {
    if ys.len() < 2 {
        return 0.0;
    }
    let x_mean = (ys.len() - 1) as f64 / 2.0;
    let y_mean = mean(ys).unwrap_or(0.0);
    let (num, den) = ys.iter().enumerate().fold((0.0, 0.0), |(num, den), (i, y)| {
        let dx = i as f64 - x_mean;
        (num + dx * (y - y_mean), den + dx * dx)
    });
    num / den
}

/// Pearson correlation; 0 when either side has no variance
fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let (Some(mx), Some(my)) = (mean(xs), mean(ys)) else {
        return 0.0;
    };
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mx) * (y - my);
        vx += (x - mx).powi(2);
        vy += (y - my).powi(2);
    }
    if vx == 0.0 || vy == 0.0 {
        0.0
    } else {
        cov / (vx * vy).sqrt()
    }
}

/// First most-frequent item, in iteration order
fn first_mode<T: PartialEq>(values: impl IntoIterator<Item = T>) -> Option<(T, usize)> {
    let mut counts: Vec<(T, usize)> = Vec::new();
    for v in values {
        match counts.iter_mut().find(|(seen, _)| *seen == v) {
            Some((_, n)) => *n += 1,
            None => counts.push((v, 1)),
        }
    }
    let best = counts.iter().map(|(_, n)| *n).max()?;
    counts.into_iter().find(|(_, n)| *n == best)
}

fn count_since(completions: &[HabitCompletion], since: DateTime<Utc>) -> usize {
    completions.iter().filter(|c| c.completed_at >= since).count()
}

// ---------------------------------------------------------------------------
// Per-habit blocks
// ---------------------------------------------------------------------------

pub fn completion_rate(
    habit: &Habit,
    completions: &[HabitCompletion],
    now: DateTime<Utc>,
) -> CompletionRate {
    let days = ((now - habit.created_at).num_days() + 1).max(1) as f64;
    let per_day = habit.frequency_value.max(1) as f64;
    let ratio = |count: usize, window: f64| (count as f64 / (window * per_day)).min(1.0);

    let overall = ratio(completions.len(), days);
    let last_30_days = ratio(
        count_since(completions, now - Duration::days(30)),
        days.min(30.0),
    );
    let last_7_days = ratio(
        count_since(completions, now - Duration::days(7)),
        days.min(7.0),
    );

    CompletionRate {
        overall,
        last_30_days,
        last_7_days,
        trend: Trend::classify(last_30_days - overall, 0.0),
    }
}

/// `None` only for an empty log
pub fn time_patterns(completions: &[HabitCompletion]) -> Option<TimePatterns> {
    let hours: Vec<u32> = completions.iter().map(|c| c.completed_at.hour()).collect();
    let (peak_hour, peak_count) = first_mode(hours.iter().copied())?;

    let mut hourly_distribution = BTreeMap::new();
    for h in &hours {
        *hourly_distribution.entry(*h).or_insert(0) += 1;
    }
    let mut daily_distribution = BTreeMap::new();
    for c in completions {
        let day = WEEKDAYS[c.completed_at.weekday().num_days_from_monday() as usize];
        *daily_distribution.entry(day.to_string()).or_insert(0) += 1;
    }

    let consistency_score = if hours.len() < MIN_OBSERVATIONS {
        0.0
    } else {
        let as_f64: Vec<f64> = hours.iter().map(|&h| h as f64).collect();
        (1.0 - std_dev(&as_f64) / 12.0).max(0.0)
    };

    Some(TimePatterns {
        peak_hour,
        peak_hour_percentage: peak_count as f64 / hours.len() as f64,
        hourly_distribution,
        daily_distribution,
        consistency_score,
    })
}

pub fn quality_trend(completions: &[HabitCompletion]) -> Gated<QualityTrend> {
    let ratings: Vec<f64> = completions
        .iter()
        .filter_map(|c| c.quality_rating.map(f64::from))
        .collect();
    if ratings.len() < MIN_OBSERVATIONS {
        return Gated::insufficient();
    }

    let trend_slope = slope(&ratings);
    let recent = &ratings[ratings.len().saturating_sub(7)..];

    Gated::Ready(QualityTrend {
        overall_average: mean(&ratings).unwrap_or(0.0),
        recent_average: mean(recent).unwrap_or(0.0),
        trend_slope,
        trend: Trend::classify(trend_slope, 0.1),
        consistency: std_dev(&ratings),
    })
}

pub fn mood_energy(completions: &[HabitCompletion]) -> Gated<MoodEnergy> {
    let collect = |f: fn(&HabitCompletion) -> Option<u8>| -> Vec<f64> {
        completions.iter().filter_map(f).map(f64::from).collect()
    };
    let mood_before = collect(|c| c.mood_before);
    if mood_before.len() < MIN_OBSERVATIONS {
        return Gated::insufficient();
    }
    let mood_after = collect(|c| c.mood_after);
    let energy_before = collect(|c| c.energy_before);
    let energy_after = collect(|c| c.energy_after);

    let deltas = |before: fn(&HabitCompletion) -> Option<u8>,
                  after: fn(&HabitCompletion) -> Option<u8>|
     -> Vec<f64> {
        completions
            .iter()
            .filter_map(|c| Some(f64::from(after(c)?) - f64::from(before(c)?)))
            .collect()
    };
    let mood_deltas = deltas(|c| c.mood_before, |c| c.mood_after);
    let energy_deltas = deltas(|c| c.energy_before, |c| c.energy_after);

    let positive_share = |ds: &[f64]| {
        if ds.is_empty() {
            0.0
        } else {
            ds.iter().filter(|&&d| d > 0.0).count() as f64 / ds.len() as f64
        }
    };

    Gated::Ready(MoodEnergy {
        avg_mood_improvement: mean(&mood_deltas).unwrap_or(0.0),
        avg_energy_improvement: mean(&energy_deltas).unwrap_or(0.0),
        avg_mood_before: mean(&mood_before).unwrap_or(0.0),
        avg_mood_after: mean(&mood_after).unwrap_or(0.0),
        avg_energy_before: mean(&energy_before).unwrap_or(0.0),
        avg_energy_after: mean(&energy_after).unwrap_or(0.0),
        positive_impact_percentage: positive_share(&mood_deltas),
        positive_energy_percentage: positive_share(&energy_deltas),
    })
}

/// Runs of consecutive completion days (single days count as runs of 1) and
/// the gaps between them
fn day_runs(completions: &[HabitCompletion]) -> (Vec<u32>, Vec<u32>) {
    let mut days: Vec<NaiveDate> = completions
        .iter()
        .map(|c| c.completed_at.date_naive())
        .collect();
    days.sort_unstable();
    days.dedup();

    let mut runs = Vec::new();
    let mut breaks = Vec::new();
    let mut run = 0;
    let mut prev: Option<NaiveDate> = None;
    for day in days {
        match prev {
            Some(p) if (day - p).num_days() == 1 => run += 1,
            Some(p) => {
                runs.push(run);
                breaks.push(((day - p).num_days() - 1) as u32);
                run = 1;
            }
            None => run = 1,
        }
        prev = Some(day);
    }
    if prev.is_some() {
        runs.push(run);
    }
    (runs, breaks)
}

pub fn streak_analysis(completions: &[HabitCompletion]) -> StreakAnalysis {
    let (runs, breaks) = day_runs(completions);
    let as_f64 = |xs: &[u32]| xs.iter().map(|&x| x as f64).collect::<Vec<_>>();

    StreakAnalysis {
        total_streaks: runs.len(),
        average_streak_length: mean(&as_f64(&runs)).unwrap_or(0.0),
        longest_streak: runs.iter().copied().max().unwrap_or(0),
        current_streak: runs.last().copied().unwrap_or(0),
        average_break_length: mean(&as_f64(&breaks)).unwrap_or(0.0),
        longest_break: breaks.iter().copied().max().unwrap_or(0),
        streak_consistency: if completions.is_empty() {
            0.0
        } else {
            runs.len() as f64 / completions.len() as f64
        },
    }
}

fn context_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn contextual_patterns(completions: &[HabitCompletion]) -> BTreeMap<String, ContextPattern> {
    let mut observed: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();
    for c in completions {
        for (key, value) in &c.context {
            observed.entry(key.as_str()).or_default().push(value);
        }
    }

    observed
        .into_iter()
        .filter(|(_, values)| values.len() >= MIN_OBSERVATIONS)
        .filter_map(|(key, values)| {
            let (most_common, count) = first_mode(values.iter().copied())?;
            let mut distribution = BTreeMap::new();
            for v in &values {
                *distribution.entry(context_key(v)).or_insert(0) += 1;
            }
            Some((
                key.to_string(),
                ContextPattern {
                    most_common: most_common.clone(),
                    frequency: count as f64 / values.len() as f64,
                    distribution,
                },
            ))
        })
        .collect()
}

fn average_quality(completions: &[HabitCompletion]) -> Option<f64> {
    let ratings: Vec<f64> = completions
        .iter()
        .filter_map(|c| c.quality_rating.map(f64::from))
        .collect();
    mean(&ratings)
}

/// Late-third quality relative to early-third quality, mapped into [0, 1]
fn adaptation_score(completions: &[HabitCompletion]) -> f64 {
    let len = completions.len();
    let early = average_quality(&completions[..len / 3]);
    let late = average_quality(&completions[len - len.div_ceil(3)..]);
    match (early, late) {
        (Some(early), Some(late)) if early > 0.0 => {
            ((late / early - 0.5) / 1.5 + 0.5).clamp(0.0, 1.0)
        }
        _ => 0.5,
    }
}

fn recommend_adjustment(completions: &[HabitCompletion], now: DateTime<Utc>) -> Adjustment {
    let recent = &completions[completions.len().saturating_sub(7)..];
    let avg_quality = average_quality(recent);
    let last_week = count_since(completions, now - Duration::days(7)) as f64;

    match avg_quality {
        Some(q) if q >= 4.5 && last_week >= 0.9 * 7.0 => Adjustment::Increase,
        Some(q) if q <= 2.5 => Adjustment::Decrease,
        _ if last_week <= 0.5 * 7.0 => Adjustment::Decrease,
        _ => Adjustment::Maintain,
    }
}

pub fn difficulty_adaptation(
    completions: &[HabitCompletion],
    now: DateTime<Utc>,
) -> Gated<DifficultyAdaptation> {
    if completions.len() < MIN_ADAPTATION_POINTS {
        return Gated::insufficient();
    }

    let durations: Vec<f64> = completions
        .iter()
        .filter_map(|c| c.duration_minutes.map(f64::from))
        .collect();
    let duration_trend_slope = (durations.len() >= MIN_OBSERVATIONS).then(|| slope(&durations));
    let duration_trend = duration_trend_slope.map(|s| {
        if s > 0.5 {
            DurationTrend::Increasing
        } else if s < -0.5 {
            DurationTrend::Decreasing
        } else {
            DurationTrend::Stable
        }
    });

    let (qualities, paired_durations): (Vec<f64>, Vec<f64>) = completions
        .iter()
        .filter_map(|c| Some((f64::from(c.quality_rating?), f64::from(c.duration_minutes?))))
        .unzip();
    let quality_duration_correlation = if qualities.len() >= MIN_OBSERVATIONS {
        pearson(&qualities, &paired_durations)
    } else {
        0.0
    };

    Gated::Ready(DifficultyAdaptation {
        duration_trend_slope,
        duration_trend,
        quality_duration_correlation,
        adaptation_score: adaptation_score(completions),
        recommended_difficulty_adjustment: recommend_adjustment(completions, now),
    })
}

/// Analyze one habit. `completions` must be oldest first.
///
/// Returns `None` below [`MIN_DATA_POINTS`] completions.
pub fn analyze(
    habit: &Habit,
    completions: &[HabitCompletion],
    now: DateTime<Utc>,
) -> Option<PatternSnapshot> {
    if completions.len() < MIN_DATA_POINTS {
        return None;
    }

    Some(PatternSnapshot {
        completion_rate: completion_rate(habit, completions, now),
        time_patterns: time_patterns(completions)?,
        quality_trends: quality_trend(completions),
        mood_energy_correlation: mood_energy(completions),
        streak_analysis: streak_analysis(completions),
        contextual_patterns: contextual_patterns(completions),
        difficulty_adaptation: difficulty_adaptation(completions, now),
    })
}

// ---------------------------------------------------------------------------
// Insights
// ---------------------------------------------------------------------------

fn insight(
    insight_type: &str,
    title: impl Into<String>,
    description: String,
    data: &impl Serialize,
    confidence: f64,
) -> Insight {
    Insight {
        insight_type: insight_type.to_string(),
        title: title.into(),
        description,
        data: serde_json::to_value(data).unwrap_or(Value::Null),
        confidence: confidence.clamp(0.0, 1.0),
    }
}

fn percent(fraction: f64) -> String {
    format!("{:.1}%", fraction * 100.0)
}

/// Zero to six insights, each carrying the statistic that triggered it as its
/// confidence
pub fn generate_insights(habit: &Habit, snapshot: &PatternSnapshot) -> Vec<Insight> {
    let name = &habit.name;
    let mut out = Vec::new();

    let rate = &snapshot.completion_rate;
    if rate.trend == Trend::Declining {
        let drop = if rate.overall > 0.0 {
            1.0 - rate.last_30_days / rate.overall
        } else {
            0.0
        };
        out.push(insight(
            "warning",
            "Completion Rate Declining",
            format!(
                "Your completion rate for '{name}' has dropped to {} over the last 30 days. Consider adjusting its difficulty or frequency.",
                percent(rate.last_30_days)
            ),
            rate,
            drop,
        ));
    } else if rate.overall >= 0.8 {
        out.push(insight(
            "achievement",
            "Great Consistency!",
            format!(
                "You're keeping an excellent {} completion rate for '{name}'. Keep it up!",
                percent(rate.overall)
            ),
            rate,
            rate.overall,
        ));
    }

    let time = &snapshot.time_patterns;
    out.push(insight(
        "pattern",
        "Optimal Time Identified",
        format!(
            "You're most successful with '{name}' around {}:00. {} of your completions happen at this time.",
            time.peak_hour,
            percent(time.peak_hour_percentage)
        ),
        time,
        time.peak_hour_percentage,
    ));

    if let Some(quality) = snapshot.quality_trends.ready()
        && quality.trend == Trend::Improving
    {
        out.push(insight(
            "achievement",
            "Quality Improving",
            format!(
                "The quality of your '{name}' sessions is improving. Your recent average is {:.1}/5.",
                quality.recent_average
            ),
            quality,
            quality.recent_average / 5.0,
        ));
    }

    if let Some(mood) = snapshot.mood_energy_correlation.ready() {
        if mood.avg_mood_improvement > 0.5 {
            out.push(insight(
                "benefit",
                "Positive Mood Impact",
                format!(
                    "'{name}' lifts your mood by {:.1} points on average.",
                    mood.avg_mood_improvement
                ),
                mood,
                mood.positive_impact_percentage,
            ));
        }
        if mood.avg_energy_improvement > 0.5 {
            out.push(insight(
                "benefit",
                "Energy Boost",
                format!(
                    "'{name}' raises your energy by {:.1} points on average.",
                    mood.avg_energy_improvement
                ),
                mood,
                mood.positive_energy_percentage,
            ));
        }
    }

    if let Some(difficulty) = snapshot.difficulty_adaptation.ready() {
        let verb = match difficulty.recommended_difficulty_adjustment {
            Adjustment::Increase => Some(("Increasing", "increasing", difficulty.adaptation_score)),
            Adjustment::Decrease => Some(("Reducing", "reducing", 1.0 - difficulty.adaptation_score)),
            Adjustment::Maintain => None,
        };
        if let Some((title_verb, verb, confidence)) = verb {
            out.push(insight(
                "recommendation",
                format!("Consider {title_verb} Difficulty"),
                format!(
                    "Based on your recent performance, you might benefit from {verb} the difficulty or duration of '{name}'."
                ),
                difficulty,
                confidence,
            ));
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Cross-habit view and streak consistency
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossHabitSummary {
    pub overall_completion_rate: f64,
    pub most_productive_hour: Option<u32>,
    pub habit_synergy_score: f64,
    /// Spread (standard deviation) of per-habit completion rates
    pub consistency_across_habits: f64,
}

impl CrossHabitSummary {
    /// One `(pattern_type, value)` pair per stored behavior pattern
    pub fn entries(&self) -> [(&'static str, Value); 4] {
        [
            ("overall_completion_rate", Value::from(self.overall_completion_rate)),
            ("most_productive_hour", Value::from(self.most_productive_hour)),
            ("habit_synergy_score", Value::from(self.habit_synergy_score)),
            ("consistency_across_habits", Value::from(self.consistency_across_habits)),
        ]
    }
}

pub fn cross_habit_summary(snapshots: &[&PatternSnapshot]) -> CrossHabitSummary {
    let rates: Vec<f64> = snapshots.iter().map(|s| s.completion_rate.overall).collect();
    let consistencies: Vec<f64> = snapshots
        .iter()
        .map(|s| s.time_patterns.consistency_score)
        .collect();

    CrossHabitSummary {
        overall_completion_rate: mean(&rates).unwrap_or(0.0),
        most_productive_hour: first_mode(snapshots.iter().map(|s| s.time_patterns.peak_hour))
            .map(|(hour, _)| hour),
        habit_synergy_score: if snapshots.len() < 2 {
            0.5
        } else {
            mean(&consistencies).unwrap_or(0.5)
        },
        consistency_across_habits: if rates.len() > 1 { std_dev(&rates) } else { 0.0 },
    }
}

/// Streak counters as the completion log says they should be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreakCounters {
    pub current_streak: u32,
    pub longest_streak: u32,
    pub total_completions: u32,
}

impl StreakCounters {
    pub fn matches(&self, habit: &Habit) -> bool {
        self.current_streak == habit.current_streak
            && self.longest_streak == habit.longest_streak
            && self.total_completions == habit.total_completions
    }
}

/// Rebuild the cached habit counters from its completion log
pub fn recompute_streaks(completions: &[HabitCompletion]) -> StreakCounters {
    let (runs, _) = day_runs(completions);
    StreakCounters {
        current_streak: runs.last().copied().unwrap_or(0),
        longest_streak: runs.iter().copied().max().unwrap_or(0),
        total_completions: completions.len() as u32,
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HabitAnalysis {
    pub habit_id: String,
    pub habit_name: String,
    pub patterns: PatternSnapshot,
    pub insights: Vec<Insight>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserAnalysis {
    pub user_id: String,
    pub habits: Vec<HabitAnalysis>,
    /// Habits skipped for having too few completions
    pub skipped: Vec<String>,
    pub cross_habit: CrossHabitSummary,
    pub insights_created: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HabitPatterns {
    pub habit_id: String,
    pub completion_count: usize,
    /// Absent below the minimum number of completions
    pub patterns: Option<PatternSnapshot>,
    pub streaks: StreakCounters,
    /// Whether the cached counters on the habit agree with the log
    pub streaks_consistent: bool,
}

fn owned_habit(conn: &rusqlite::Connection, user_id: &str, habit_id: &str) -> Result<Habit, HabitError> {
    db::get_habit(conn, habit_id)?
        .filter(|h| h.user_id == user_id)
        .ok_or_else(|| HabitError::NotFound(habit_id.to_string()))
}

/// Analyze every habit of a user, store the insights and queue them as notifications
pub fn analyze_user(
    db: &Database,
    hub: &NotificationHub,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<UserAnalysis, HabitError> {
    let logs = db.with_conn(|conn| {
        db::habits_for_user(conn, user_id)?
            .into_iter()
            .map(|habit| {
                let log = db::completions_for_habit(conn, &habit.id)?;
                Ok((habit, log))
            })
            .collect::<rusqlite::Result<Vec<_>>>()
    })?;

    let mut habits = Vec::new();
    let mut skipped = Vec::new();
    for (habit, log) in &logs {
        match analyze(habit, log, now) {
            Some(patterns) => {
                let insights = generate_insights(habit, &patterns);
                habits.push(HabitAnalysis {
                    habit_id: habit.id.clone(),
                    habit_name: habit.name.clone(),
                    patterns,
                    insights,
                });
            }
            None => {
                tracing::debug!(
                    habit_id = %habit.id,
                    completions = log.len(),
                    "Not enough completions, skipping analysis"
                );
                skipped.push(habit.id.clone());
            }
        }
    }

    let snapshots: Vec<&PatternSnapshot> = habits.iter().map(|h| &h.patterns).collect();
    let cross_habit = cross_habit_summary(&snapshots);

    let insights_created = db.with_transaction(|tx| {
        let mut created = 0;
        for analysis in &habits {
            for i in &analysis.insights {
                db::insert_insight(
                    tx,
                    &analysis.habit_id,
                    &i.insight_type,
                    &i.title,
                    &i.description,
                    &i.data,
                    i.confidence,
                    &now,
                )?;
                created += 1;
            }
        }

        // Nothing analyzed means nothing to summarize; keep earlier patterns
        if !habits.is_empty() {
            for (pattern_type, data) in cross_habit.entries() {
                db::upsert_behavior_pattern(
                    tx,
                    user_id,
                    pattern_type,
                    &data,
                    BEHAVIOR_PATTERN_CONFIDENCE,
                    &now,
                )?;
            }
        }
        Ok::<_, rusqlite::Error>(created)
    })?;

    for analysis in &habits {
        for i in &analysis.insights {
            hub.push(
                user_id,
                Notification::new(
                    NotificationKind::HabitInsight,
                    i.title.clone(),
                    i.description.clone(),
                    3,
                    serde_json::json!({
                        "habit_id": analysis.habit_id,
                        "insight_type": i.insight_type,
                        "confidence": i.confidence,
                    }),
                    now,
                ),
            );
        }
    }

    tracing::info!(
        user_id,
        analyzed = habits.len(),
        skipped = skipped.len(),
        insights = insights_created,
        "Habit analysis finished"
    );

    Ok(UserAnalysis {
        user_id: user_id.to_string(),
        habits,
        skipped,
        cross_habit,
        insights_created,
    })
}

/// Snapshot for a single habit without persisting anything
pub fn habit_patterns(
    db: &Database,
    user_id: &str,
    habit_id: &str,
    now: DateTime<Utc>,
) -> Result<HabitPatterns, HabitError> {
    let (habit, log) = db.with_conn(|conn| {
        let habit = owned_habit(conn, user_id, habit_id)?;
        let log = db::completions_for_habit(conn, habit_id)?;
        Ok::<_, HabitError>((habit, log))
    })?;

    let streaks = recompute_streaks(&log);
    Ok(HabitPatterns {
        habit_id: habit.id.clone(),
        completion_count: log.len(),
        patterns: analyze(&habit, &log, now),
        streaks_consistent: streaks.matches(&habit),
        streaks,
    })
}

/// Cross-habit patterns stored by the last [`analyze_user`] run
pub fn behavior_patterns(db: &Database, user_id: &str) -> Result<Vec<BehaviorPattern>, HabitError> {
    Ok(db.with_conn(|conn| db::behavior_patterns(conn, user_id))?)
}

pub fn habit_insights(
    db: &Database,
    user_id: &str,
    habit_id: &str,
    unread_only: bool,
) -> Result<Vec<HabitInsight>, HabitError> {
    db.with_conn(|conn| {
        owned_habit(conn, user_id, habit_id)?;
        Ok(db::insights_for_habit(conn, habit_id, unread_only)?)
    })
}
