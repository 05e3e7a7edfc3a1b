//! Question generation through an LLM.
//!
//! [`QuestionGenerator`] is the seam the generation job talks to.
//! [`AnthropicGenerator`] implements it against the Anthropic Messages API.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::generation::chunker::Chapter;
use crate::generation::model::{Difficulty, Question};

const PROVIDER: &str = "anthropic";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A question as returned by the model, before it is tied to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionDraft {
    pub prompt: String,
    pub options: Vec<String>,
    pub answer_index: usize,
    #[serde(default)]
    pub explanation: Option<String>,
}

impl QuestionDraft {
    /// A prompt, at least two non-empty options and an in-range answer.
    pub fn is_valid(&self) -> bool {
        !self.prompt.trim().is_empty()
            && self.options.len() >= 2
            && self.options.iter().all(|o| !o.trim().is_empty())
            && self.answer_index < self.options.len()
    }

    pub fn into_question(
        self,
        task_id: &str,
        chapter: &str,
        position: i64,
        difficulty: Difficulty,
    ) -> Question {
        let question = Question::new(
            task_id,
            chapter,
            position,
            self.prompt,
            self.options,
            self.answer_index,
            difficulty,
        );
        match self.explanation {
            Some(explanation) if !explanation.trim().is_empty() => {
                question.with_explanation(explanation)
            }
            _ => question,
        }
    }
}

/// Produces multiple-choice questions for one chapter.
#[async_trait]
pub trait QuestionGenerator: Send + Sync {
    async fn generate(
        &self,
        chapter: &Chapter,
        count: usize,
        difficulty: Difficulty,
    ) -> Result<Vec<QuestionDraft>, LlmError>;
}

// ── Anthropic Messages API ──────────────────────────────────────────

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<RequestMessage>,
}

#[derive(Serialize)]
struct RequestMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

const SYSTEM_PROMPT: &str = "You write multiple-choice quiz questions for textbook chapters. \
Reply with a JSON array only. Each element is an object with the keys \
\"prompt\" (string), \"options\" (array of 4 strings), \"answer_index\" \
(zero-based index of the correct option) and \"explanation\" (one sentence). \
Questions must be answerable from the chapter text alone.";

/// Anthropic-backed question generator.
pub struct AnthropicGenerator {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    endpoint: String,
    max_tokens: u32,
    temperature: f32,
    max_attempts: u32,
    retry_base: Duration,
}

impl AnthropicGenerator {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        tracing::info!("Using Anthropic (model: {})", config.model);
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            endpoint: format!("{}/v1/messages", config.base_url.trim_end_matches('/')),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_attempts: config.max_attempts.max(1),
            retry_base: Duration::from_millis(500),
        })
    }

    /// Builder: base delay for the exponential retry backoff.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    fn user_prompt(chapter: &Chapter, count: usize, difficulty: Difficulty) -> String {
        format!(
            "Write {count} {difficulty} questions about the chapter \"{title}\".\n\n\
             <chapter>\n{body}\n</chapter>",
            title = chapter.title,
            body = chapter.body,
        )
    }

    /// Exponential backoff with up to 25% random jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .retry_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(MAX_BACKOFF);
        let jitter_ms = (exp.as_millis() as u64) / 4;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        exp + Duration::from_millis(jitter)
    }

    async fn send_once(&self, body: &MessagesRequest<'_>) -> Result<String, AttemptError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                AttemptError::Retry(LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: e.to_string(),
                })
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AttemptError::Retry(LlmError::RateLimited {
                provider: PROVIDER.to_string(),
                retry_after,
            }));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AttemptError::Fatal(LlmError::AuthFailed {
                provider: PROVIDER.to_string(),
            }));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("HTTP {status}: {}", truncate(&text, 300)),
            };
            return Err(if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
                AttemptError::Retry(err)
            } else {
                AttemptError::Fatal(err)
            });
        }

        let parsed: MessagesResponse = response.json().await.map_err(|e| {
            AttemptError::Fatal(LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })
        })?;

        Ok(parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

/// Outcome of a failed request: rate limits, server errors and transport
/// failures are worth another try.
enum AttemptError {
    Retry(LlmError),
    Fatal(LlmError),
}

#[async_trait]
impl QuestionGenerator for AnthropicGenerator {
    async fn generate(
        &self,
        chapter: &Chapter,
        count: usize,
        difficulty: Difficulty,
    ) -> Result<Vec<QuestionDraft>, LlmError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: SYSTEM_PROMPT,
            messages: vec![RequestMessage {
                role: "user",
                content: Self::user_prompt(chapter, count, difficulty),
            }],
        };

        let mut attempt = 0;
        let text = loop {
            attempt += 1;
            match self.send_once(&body).await {
                Ok(text) => break text,
                Err(AttemptError::Retry(e)) if attempt < self.max_attempts => {
                    let delay = match &e {
                        LlmError::RateLimited {
                            retry_after: Some(after),
                            ..
                        } => (*after).min(MAX_BACKOFF),
                        _ => self.backoff(attempt),
                    };
                    warn!(
                        chapter = %chapter.title,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "LLM request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError::Retry(e)) | Err(AttemptError::Fatal(e)) => return Err(e),
            }
        };

        let drafts = parse_drafts(&text, count)?;
        debug!(chapter = %chapter.title, count = drafts.len(), "Questions generated");
        Ok(drafts)
    }
}

/// Pull the JSON array out of a model reply and keep the well-formed entries.
pub fn parse_drafts(text: &str, count: usize) -> Result<Vec<QuestionDraft>, LlmError> {
    let invalid = |reason: String| LlmError::InvalidResponse {
        provider: PROVIDER.to_string(),
        reason,
    };

    let start = text
        .find('[')
        .ok_or_else(|| invalid(format!("no JSON array in reply: {}", truncate(text, 200))))?;
    let end = text
        .rfind(']')
        .filter(|end| *end > start)
        .ok_or_else(|| invalid("unterminated JSON array in reply".to_string()))?;

    let raw: Vec<serde_json::Value> = serde_json::from_str(&text[start..=end])?;
    let drafts: Vec<QuestionDraft> = raw
        .into_iter()
        .filter_map(|value| serde_json::from_value::<QuestionDraft>(value).ok())
        .filter(QuestionDraft::is_valid)
        .take(count)
        .collect();

    if drafts.is_empty() {
        return Err(invalid("reply contained no valid questions".to_string()));
    }
    Ok(drafts)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chapter() -> Chapter {
        Chapter {
            title: "Cells".to_string(),
            body: "Cells are the basic unit of life.".to_string(),
        }
    }

    fn config(base_url: &str) -> LlmConfig {
        LlmConfig {
            api_key: SecretString::from("sk-test".to_string()),
            model: "test-model".to_string(),
            base_url: base_url.to_string(),
            max_tokens: 1024,
            temperature: 0.0,
            max_attempts: 3,
            request_timeout: Duration::from_secs(5),
        }
    }

    fn reply(text: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "text", "text": text }],
        })
    }

    const TWO_QUESTIONS: &str = r#"Here you go:
[
  {"prompt": "What is a cell?", "options": ["A unit of life", "A rock", "A gas", "A star"], "answer_index": 0, "explanation": "Stated in the text."},
  {"prompt": "Broken", "options": ["only one"], "answer_index": 0},
  {"prompt": "Which is alive?", "options": ["Cell", "Stone"], "answer_index": 0}
]"#;

    #[test]
    fn parse_drafts_skips_malformed_entries() {
        let drafts = parse_drafts(TWO_QUESTIONS, 10).unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].explanation.as_deref(), Some("Stated in the text."));
        assert_eq!(drafts[1].prompt, "Which is alive?");
    }

    #[test]
    fn parse_drafts_truncates_to_count() {
        assert_eq!(parse_drafts(TWO_QUESTIONS, 1).unwrap().len(), 1);
    }

    #[test]
    fn parse_drafts_reports_broken_json() {
        assert!(matches!(
            parse_drafts("Here you go: [{\"prompt\": \"Cut off\", ]", 3),
            Err(LlmError::Json(_))
        ));
    }

    #[test]
    fn parse_drafts_rejects_prose() {
        assert!(matches!(
            parse_drafts("I cannot help with that.", 3),
            Err(LlmError::InvalidResponse { .. })
        ));
        assert!(matches!(
            parse_drafts("[]", 3),
            Err(LlmError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn draft_out_of_range_answer_is_invalid() {
        let draft = QuestionDraft {
            prompt: "Q".to_string(),
            options: vec!["a".to_string(), "b".to_string()],
            answer_index: 2,
            explanation: None,
        };
        assert!(!draft.is_valid());
    }

    #[test]
    fn draft_into_question() {
        let draft = QuestionDraft {
            prompt: "Q".to_string(),
            options: vec!["a".to_string(), "b".to_string()],
            answer_index: 1,
            explanation: Some("  ".to_string()),
        };
        let question = draft.into_question("task-1", "Cells", 3, Difficulty::Hard);
        assert_eq!(question.task_id, "task-1");
        assert_eq!(question.position, 3);
        assert_eq!(question.difficulty, Difficulty::Hard);
        assert!(question.explanation.is_none());
    }

    #[tokio::test]
    async fn generate_sends_headers_and_parses_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply(TWO_QUESTIONS)))
            .expect(1)
            .mount(&server)
            .await;

        let generator = AnthropicGenerator::new(&config(&server.uri())).unwrap();
        let drafts = generator
            .generate(&chapter(), 5, Difficulty::Easy)
            .await
            .unwrap();
        assert_eq!(drafts.len(), 2);
    }

    #[tokio::test]
    async fn generate_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(529))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply(TWO_QUESTIONS)))
            .expect(1)
            .mount(&server)
            .await;

        let generator = AnthropicGenerator::new(&config(&server.uri()))
            .unwrap()
            .with_retry_base(Duration::from_millis(1));
        let drafts = generator
            .generate(&chapter(), 5, Difficulty::Medium)
            .await
            .unwrap();
        assert_eq!(drafts.len(), 2);
    }

    #[tokio::test]
    async fn generate_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .expect(3)
            .mount(&server)
            .await;

        let generator = AnthropicGenerator::new(&config(&server.uri()))
            .unwrap()
            .with_retry_base(Duration::from_millis(1));
        let err = generator
            .generate(&chapter(), 5, Difficulty::Medium)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { retry_after: Some(_), .. }));
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let generator = AnthropicGenerator::new(&config(&server.uri())).unwrap();
        let err = generator
            .generate(&chapter(), 5, Difficulty::Medium)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::AuthFailed { .. }));
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let generator = AnthropicGenerator::new(&config("http://localhost"))
            .unwrap()
            .with_retry_base(Duration::from_millis(100));
        let first = generator.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = generator.backoff(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        assert!(generator.backoff(40) <= MAX_BACKOFF + MAX_BACKOFF / 4);
    }
}
