//! Free-text task intake
//!
//! Asks the text generator to pull task drafts out of a sentence such as
//! "email Sam tomorrow and book the dentist, it's urgent". Any trouble with the
//! generator yields an empty list.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::llm::{self, TextGenerator};

const DEFAULT_PRIORITY: u8 = 3;
const DEFAULT_CATEGORY: &str = "personal";

/// A task suggested from free text, not yet stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    /// 1 (lowest) to 5 (highest)
    pub priority: u8,
    pub category: String,
    /// Minutes
    pub estimated_duration: Option<u32>,
    pub due_date: Option<NaiveDate>,
}

fn intake_prompt(text: &str) -> String {
    format!(
        r#"You are a task extraction assistant for the LifeSync app. Extract tasks from the user input and return ONLY valid JSON.

User input: "{text}"

Extract tasks with these properties:
- name: task description
- priority: high/medium/low
- category: work/personal/health/academic
- estimated_duration: in minutes (number only)
- due_date: if mentioned, return as YYYY-MM-DD, otherwise null

Return format:
{{"tasks": [{{"name": "task name", "priority": "medium", "category": "personal", "estimated_duration": 30, "due_date": null}}]}}

JSON only, no explanation:"#
    )
}

/// Map a priority word (or a number already on the 1-5 scale) onto 1-5
pub fn priority_level(value: Option<&Value>) -> u8 {
    match value {
        Some(Value::String(word)) => match word.trim().to_lowercase().as_str() {
            "low" => 2,
            "medium" => 3,
            "high" => 4,
            _ => DEFAULT_PRIORITY,
        },
        Some(Value::Number(n)) => n
            .as_u64()
            .filter(|p| (1..=5).contains(p))
            .map_or(DEFAULT_PRIORITY, |p| p as u8),
        _ => DEFAULT_PRIORITY,
    }
}

fn draft_from(item: &Value) -> Option<TaskDraft> {
    let name = item.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }

    Some(TaskDraft {
        name: name.to_string(),
        priority: priority_level(item.get("priority")),
        category: item
            .get("category")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CATEGORY)
            .to_lowercase(),
        estimated_duration: item
            .get("estimated_duration")
            .and_then(Value::as_f64)
            .filter(|m| *m > 0.0)
            .map(|m| m.round() as u32),
        due_date: item
            .get("due_date")
            .and_then(Value::as_str)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
    })
}

/// Extract task drafts from `text`. Malformed entries are skipped.
pub async fn parse_tasks(
    generator: &dyn TextGenerator,
    budget: Duration,
    text: &str,
) -> Vec<TaskDraft> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let Some(answer) = llm::generate_json(generator, &intake_prompt(text), budget, "intake").await
    else {
        return Vec::new();
    };

    let drafts: Vec<TaskDraft> = answer
        .get("tasks")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(draft_from).collect())
        .unwrap_or_default();

    tracing::debug!(count = drafts.len(), "Tasks parsed from free text");
    drafts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedGenerator;
    use serde_json::json;

    #[test]
    fn priority_words_map_to_scale() {
        assert_eq!(priority_level(Some(&json!("low"))), 2);
        assert_eq!(priority_level(Some(&json!("Medium"))), 3);
        assert_eq!(priority_level(Some(&json!("HIGH"))), 4);
        assert_eq!(priority_level(Some(&json!(5))), 5);
        assert_eq!(priority_level(Some(&json!(9))), 3);
        assert_eq!(priority_level(Some(&json!("whenever"))), 3);
        assert_eq!(priority_level(None), 3);
    }

    #[tokio::test]
    async fn drafts_come_from_generated_json() {
        let generator = ScriptedGenerator::reply(
            r#"Sure:
            {"tasks": [
                {"name": "Email Sam", "priority": "high", "category": "Work", "estimated_duration": 15, "due_date": "2025-06-11"},
                {"name": "Book dentist", "priority": "low", "due_date": "next week"},
                {"priority": "high"},
                {"name": "   "}
            ]}"#,
        );

        let drafts = parse_tasks(
            &generator,
            Duration::from_secs(1),
            "email Sam tomorrow and book the dentist",
        )
        .await;

        assert_eq!(
            drafts,
            vec![
                TaskDraft {
                    name: "Email Sam".to_string(),
                    priority: 4,
                    category: "work".to_string(),
                    estimated_duration: Some(15),
                    due_date: NaiveDate::from_ymd_opt(2025, 6, 11),
                },
                TaskDraft {
                    name: "Book dentist".to_string(),
                    priority: 2,
                    category: "personal".to_string(),
                    estimated_duration: None,
                    due_date: None,
                },
            ]
        );
        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[0].contains("book the dentist"));
    }

    #[tokio::test]
    async fn generator_failure_yields_empty_list() {
        let failing = ScriptedGenerator::failing();
        assert!(parse_tasks(&failing, Duration::from_secs(1), "buy milk").await.is_empty());

        let prose = ScriptedGenerator::reply("I found two tasks for you.");
        assert!(parse_tasks(&prose, Duration::from_secs(1), "buy milk").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_generator_yields_empty_list() {
        let hanging = ScriptedGenerator::hanging();
        assert!(parse_tasks(&hanging, Duration::from_secs(15), "buy milk").await.is_empty());
    }

    #[tokio::test]
    async fn blank_input_skips_the_generator() {
        let generator = ScriptedGenerator::reply(r#"{"tasks": [{"name": "x"}]}"#);
        assert!(parse_tasks(&generator, Duration::from_secs(1), "  ").await.is_empty());
        assert!(generator.prompts.lock().unwrap().is_empty());
    }
}
