//! Text-generation adapter for the local inference server
//!
//! Callers only ever see `Option<serde_json::Value>` from [`generate_json`]:
//! timeouts, transport failures, non-200 answers and unparseable output all
//! collapse into `None` and the caller takes its deterministic fallback.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LlmConfig;

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("text generation is disabled")]
    Disabled,
    #[error("inference server unreachable: {0}")]
    Unreachable(String),
    #[error("inference request failed: {0}")]
    RequestFailed(String),
    #[error("inference server answered HTTP {status}")]
    Status { status: u16 },
    #[error("could not decode inference response: {0}")]
    BadResponse(String),
}

/// `generate(prompt) -> text`, nothing more
#[async_trait::async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError>;

    /// Name for logs
    fn name(&self) -> &str;
}

/// Client for Ollama's `/api/generate` endpoint
pub struct OllamaGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OllamaGenerator {
    pub fn from_config(config: &LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[async_trait::async_trait]
impl TextGenerator for OllamaGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    GenerateError::Unreachable(e.to_string())
                } else {
                    GenerateError::RequestFailed(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(GenerateError::Status {
                status: response.status().as_u16(),
            });
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerateError::BadResponse(e.to_string()))?;

        Ok(body.response)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

/// Stand-in used when `[llm] enabled = false`
pub struct DisabledGenerator;

#[async_trait::async_trait]
impl TextGenerator for DisabledGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GenerateError> {
        Err(GenerateError::Disabled)
    }

    fn name(&self) -> &str {
        "disabled"
    }
}

/// Best-effort structured-output parser.
///
/// Takes the substring from the first `{` to the last `}` and parses it as a
/// JSON object. Anything else (no braces, invalid JSON, a non-object) is `None`.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }

    match serde_json::from_str::<serde_json::Value>(&text[start..=end]) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

/// One bounded attempt at a structured answer; never an error.
///
/// There is no retry: a single call, then `None` on timeout, adapter failure or
/// unparseable output.
pub async fn generate_json(
    generator: &dyn TextGenerator,
    prompt: &str,
    budget: Duration,
    call_site: &str,
) -> Option<serde_json::Value> {
    let text = match tokio::time::timeout(budget, generator.generate(prompt)).await {
        Err(_) => {
            tracing::warn!(
                call_site,
                generator = generator.name(),
                budget_secs = budget.as_secs(),
                "Text generation timed out, using fallback"
            );
            return None;
        }
        Ok(Err(GenerateError::Disabled)) => {
            tracing::debug!(call_site, "Text generation disabled, using fallback");
            return None;
        }
        Ok(Err(e)) => {
            tracing::warn!(
                call_site,
                generator = generator.name(),
                error = %e,
                "Text generation failed, using fallback"
            );
            return None;
        }
        Ok(Ok(text)) => text,
    };

    let parsed = extract_json(&text);
    if parsed.is_none() {
        tracing::warn!(
            call_site,
            generator = generator.name(),
            chars = text.len(),
            "Text generation returned no JSON object, using fallback"
        );
    }
    parsed
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted generators for exercising adapter success and failure paths

    use super::*;
    use std::sync::Mutex;

    pub enum Script {
        Reply(String),
        Fail,
        Hang,
    }

    /// Replays a fixed answer and remembers every prompt it saw
    pub struct ScriptedGenerator {
        script: Script,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        pub fn reply(text: impl Into<String>) -> Self {
            Self::new(Script::Reply(text.into()))
        }

        pub fn failing() -> Self {
            Self::new(Script::Fail)
        }

        pub fn hanging() -> Self {
            Self::new(Script::Hang)
        }

        fn new(script: Script) -> Self {
            Self {
                script,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            match &self.script {
                Script::Reply(text) => Ok(text.clone()),
                Script::Fail => Err(GenerateError::Status { status: 500 }),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(String::new())
                }
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedGenerator;
    use super::*;

    #[test]
    fn extracts_object_embedded_in_prose() {
        let text = "Sure! Here is your plan:\n{\"a\": {\"b\": 1}}\nHope that helps.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["a"]["b"], 1);
    }

    #[test]
    fn rejects_text_without_object() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("} backwards {").is_none());
        assert!(extract_json("{not: valid}").is_none());
    }

    #[tokio::test]
    async fn failure_and_garbage_become_none() {
        let failing = ScriptedGenerator::failing();
        assert!(
            generate_json(&failing, "p", Duration::from_secs(1), "test")
                .await
                .is_none()
        );

        let garbage = ScriptedGenerator::reply("I cannot help with that");
        assert!(
            generate_json(&garbage, "p", Duration::from_secs(1), "test")
                .await
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_becomes_none() {
        let hanging = ScriptedGenerator::hanging();
        let out = generate_json(&hanging, "p", Duration::from_secs(30), "test").await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn disabled_generator_falls_back() {
        let out = generate_json(&DisabledGenerator, "p", Duration::from_secs(1), "test").await;
        assert!(out.is_none());
    }
}
