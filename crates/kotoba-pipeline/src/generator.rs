//! Generator stage: extracted text plus directive to structured content.
//!
//! The language model is asked for a single JSON object holding a
//! `grammar_script` and the content fields of the target type. The reply is
//! only accepted if it parses, carries a non-empty script, matches the
//! target content type and has at least one card, slide or question.

use async_trait::async_trait;
use kotoba_h5p::{ContentType, GeneratedContent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{api_key, Config, GenerationConfig};
use crate::error::{PipelineError, Result, ServiceErrorKind};
use crate::http::{build_client, read_json, send_error, truncate};
use crate::lesson::{fenced_json_blocks, LessonRequest};
use crate::retry::RetryPolicy;

/// Key holding the grammar explanation in the model's reply.
const SCRIPT_KEY: &str = "grammar_script";

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A chat-style language model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Sends `messages` and returns the text of the reply.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::GenerationError`.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

// ============================================================================
// OpenAI-compatible client
// ============================================================================

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct ChatCompletionsModel {
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for ChatCompletionsModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsModel")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl ChatCompletionsModel {
    /// Creates a client from generation settings and an API key.
    pub fn new(
        settings: &GenerationConfig,
        api_key: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            client: build_client(timeout)?,
        })
    }

    /// Creates a client from config, reading the key from the environment.
    pub fn from_config(config: &Config) -> Result<Self> {
        let key = api_key("generation", &config.generation.api_key_env)?;
        Self::new(&config.generation, key, config.request_timeout())
    }

    /// Model name sent with each request.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let (kind, message) = send_error(&e, "language model");
                PipelineError::generation(kind, message)
            })?;

        let parsed: CompletionResponse = read_json(response, "language model")
            .await
            .map_err(|(kind, message)| PipelineError::generation(kind, message))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| {
                PipelineError::generation(ServiceErrorKind::Malformed, "reply has no message content")
            })
    }
}

// ============================================================================
// Generator
// ============================================================================

/// What the Generator returns for one lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedLesson {
    /// Markdown explanation of the grammar point.
    pub grammar_script: String,

    /// Cards, slides or questions.
    pub content: GeneratedContent,
}

/// The Generator stage: a language model, its retry policy and the prompt
/// settings.
pub struct Generator {
    model: Box<dyn LanguageModel>,
    retry: RetryPolicy,
    system_prompt: String,
    audience: String,
}

impl Generator {
    /// Creates a generator with the default prompt settings.
    #[must_use]
    pub fn new(model: Box<dyn LanguageModel>) -> Self {
        let defaults = Config::default();
        Self {
            model,
            retry: RetryPolicy::default(),
            system_prompt: defaults.generation.system_prompt,
            audience: defaults.audience,
        }
    }

    /// Creates a generator using the prompt and retry settings from config.
    #[must_use]
    pub fn from_config(model: Box<dyn LanguageModel>, config: &Config) -> Self {
        Self {
            model,
            retry: RetryPolicy::from_config(&config.retry, config.retry.generation_attempts),
            system_prompt: config.generation.system_prompt.clone(),
            audience: config.audience.clone(),
        }
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builds the system and user messages for `request`.
    #[must_use]
    pub fn build_messages(&self, request: &LessonRequest, input_text: &str) -> Vec<ChatMessage> {
        let content_type = request.content_type;
        let mut prompt = format!(
            "Generate {content_type} JSON content for an H5P activity.\n\
             Lesson ID: {}\n\
             Level: {}\n",
            request.lesson_id, request.level
        );
        if let Some(grammar_point) = request.effective_grammar_point() {
            prompt.push_str(&format!("Grammar point: {grammar_point}\n"));
        }

        prompt.push_str(&format!("\nSource text:\n{}\n", input_text.trim()));

        let directive = request.task_directive.content.trim();
        if !directive.is_empty() && directive != input_text.trim() {
            prompt.push_str(&format!("\nTask directive:\n{directive}\n"));
        }

        if let Some(template) = request.task_directive.template_for(content_type) {
            let pretty = serde_json::to_string_pretty(&template).unwrap_or_default();
            prompt.push_str(&format!(
                "\nFollow this JSON structure for the content:\n```json\n{pretty}\n```\n"
            ));
        }

        prompt.push_str(&format!(
            "\nThis content is for learners of Japanese. Adjust explanations for {}.\n\
             Return one JSON object with a \"{SCRIPT_KEY}\" string explaining the grammar \
             point and a \"{}\" array.\n\
             Return JSON only, without explanations or comments.\n",
            self.audience,
            collection_key(content_type),
        ));

        vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(prompt),
        ]
    }

    /// Generates lesson content, retrying rate limits and server errors.
    ///
    /// # Errors
    ///
    /// Returns a `GenerationError` with kind `RateLimit` once retries are
    /// exhausted, or kind `Malformed` if the reply fails validation.
    pub async fn generate(&self, request: &LessonRequest, input_text: &str) -> Result<GeneratedLesson> {
        let messages = self.build_messages(request, input_text);
        tracing::info!(
            lesson_id = %request.lesson_id,
            content_type = %request.content_type,
            level = %request.level,
            "Requesting lesson content"
        );

        let reply = self
            .retry
            .run("generation", || self.model.complete(&messages))
            .await?;
        tracing::debug!(chars = reply.chars().count(), "Received reply");

        let lesson = parse_lesson(&reply, request.content_type)?;
        tracing::info!(
            lesson_id = %request.lesson_id,
            items = lesson.content.item_count(),
            "Lesson content accepted"
        );
        Ok(lesson)
    }
}

/// Top-level list name the model should fill for `content_type`.
const fn collection_key(content_type: ContentType) -> &'static str {
    match content_type {
        ContentType::DialogCards => "cards",
        ContentType::CoursePresentation => "slides",
        ContentType::Quiz | ContentType::FillBlanks => "questions",
    }
}

/// Returns the JSON text in a model reply: the first fenced ```` ```json ````
/// block if there is one, otherwise the whole trimmed reply.
#[must_use]
pub fn extract_json(reply: &str) -> &str {
    fenced_json_blocks(reply)
        .into_iter()
        .next()
        .unwrap_or_else(|| reply.trim())
}

/// Parses and validates a model reply for `content_type`.
///
/// The content may sit next to `grammar_script` at the top level or inside a
/// `content` object.
pub fn parse_lesson(reply: &str, content_type: ContentType) -> Result<GeneratedLesson> {
    let malformed = |message: String| PipelineError::generation(ServiceErrorKind::Malformed, message);

    let json = extract_json(reply);
    let value: Value = serde_json::from_str(json).map_err(|e| {
        malformed(format!(
            "reply is not valid JSON ({e}): {}",
            truncate(json, 200)
        ))
    })?;
    let Value::Object(mut object) = value else {
        return Err(malformed("reply is not a JSON object".to_string()));
    };

    let grammar_script = match object.remove(SCRIPT_KEY) {
        Some(Value::String(script)) if !script.trim().is_empty() => script,
        _ => return Err(malformed(format!("reply has no non-empty '{SCRIPT_KEY}'"))),
    };

    let body = match object.remove("content") {
        Some(inner @ Value::Object(_)) => inner,
        Some(other) => {
            object.insert("content".to_string(), other);
            Value::Object(object)
        }
        None => Value::Object(object),
    };

    let content = GeneratedContent::from_value(content_type, body).map_err(|e| {
        malformed(format!("reply does not match the {content_type} structure: {e}"))
    })?;

    if !content.supports(content_type) {
        return Err(malformed(format!(
            "reply holds {} content, expected {content_type}",
            content.natural_content_type()
        )));
    }
    if content.item_count() == 0 {
        return Err(malformed(format!(
            "reply has no {}",
            collection_key(content_type)
        )));
    }

    Ok(GeneratedLesson {
        grammar_script,
        content,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::lesson::TaskDirective;

    const QUIZ_REPLY: &str = r#"Here you go:
```json
{
  "grammar_script": "「これは～です。」は近くの物を紹介する表現です。",
  "title": "これは～です",
  "quiz": [
    {
      "question": "「これはペンです。」の意味は？",
      "answers": [
        {"text": "This is a pen.", "correct": true},
        {"text": "That is a pen.", "correct": false}
      ]
    }
  ]
}
```"#;

    /// Returns scripted replies in order and records the prompts.
    struct ScriptedModel {
        replies: Mutex<Vec<Result<String>>>,
        prompts: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(messages.to_vec());
            self.replies.lock().unwrap().remove(0)
        }
    }

    fn generator(replies: Vec<Result<String>>) -> (Generator, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let model = ScriptedModel {
            replies: Mutex::new(replies),
            prompts: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::clone(&calls),
        };
        let generator = Generator::new(Box::new(model))
            .with_retry(RetryPolicy::new(3, Duration::ZERO, 2));
        (generator, calls)
    }

    fn quiz_request() -> LessonRequest {
        LessonRequest::new("ch1", ContentType::Quiz, TaskDirective::inline("Make a quiz."))
            .unwrap()
            .with_grammar_point("これは～です。")
            .with_level("N5")
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let model =
            ChatCompletionsModel::new(&GenerationConfig::default(), "sk-secret", Duration::from_secs(5))
                .unwrap();
        let debug = format!("{model:?}");
        assert!(debug.contains("ChatCompletionsModel"));
        assert!(!debug.contains("sk-secret"));
    }

    #[test]
    fn test_extract_json_prefers_fenced_block() {
        assert!(extract_json(QUIZ_REPLY).starts_with('{'));
        assert_eq!(extract_json("  {\"a\": 1}\n"), "{\"a\": 1}");
    }

    #[test]
    fn test_parse_quiz_reply() {
        let lesson = parse_lesson(QUIZ_REPLY, ContentType::Quiz).unwrap();
        assert!(lesson.grammar_script.contains("これは～です"));
        assert_eq!(lesson.content.item_count(), 1);
        assert_eq!(lesson.content.title(), Some("これは～です"));
    }

    #[test]
    fn test_parse_nested_content() {
        let reply = r#"{"grammar_script": "x", "content": {"cards": [{"text": "あ", "answer": "a"}]}}"#;
        let lesson = parse_lesson(reply, ContentType::DialogCards).unwrap();
        assert_eq!(lesson.content.natural_content_type(), ContentType::DialogCards);
    }

    #[test]
    fn test_parse_rejects_malformed_replies() {
        let cases = [
            ("Sorry, I cannot help with that.", "not valid JSON"),
            ("[1, 2]", "not a JSON object"),
            (r#"{"questions": [{"text": "?"}]}"#, "grammar_script"),
            (r#"{"grammar_script": "  ", "questions": [{"text": "?"}]}"#, "grammar_script"),
            (r#"{"grammar_script": "x", "questions": []}"#, "no questions"),
            (r#"{"grammar_script": "x", "cards": []}"#, "quiz structure"),
        ];
        for (reply, expected) in cases {
            let err = parse_lesson(reply, ContentType::Quiz).unwrap_err();
            assert!(
                matches!(
                    err,
                    PipelineError::GenerationError {
                        kind: ServiceErrorKind::Malformed,
                        ..
                    }
                ),
                "{reply}: {err}"
            );
            assert!(err.to_string().contains(expected), "{reply}: {err}");
        }
    }

    #[test]
    fn test_prompt_contains_lesson_details() {
        let (generator, _) = generator(vec![]);
        let directive = TaskDirective::inline(
            "# Quiz\n```json\n{\"questions\": [{\"text\": \"...\", \"answers\": []}]}\n```",
        );
        let request = LessonRequest::new("ch1", ContentType::Quiz, directive)
            .unwrap()
            .with_grammar_point("これは～です。");

        let messages = generator.build_messages(&request, "これはペンです。");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, "You are a H5P content creation expert.");

        let prompt = &messages[1].content;
        assert!(prompt.contains("Lesson ID: ch1"));
        assert!(prompt.contains("Level: N5"));
        assert!(prompt.contains("Grammar point: これは～です。"));
        assert!(prompt.contains("これはペンです。"));
        assert!(prompt.contains("```json"));
        assert!(prompt.contains("Indonesian learners"));
        assert!(prompt.contains("\"questions\" array"));
        assert!(prompt.contains("Return JSON only"));
    }

    #[tokio::test]
    async fn test_generate_retries_rate_limit() {
        let (generator, calls) = generator(vec![
            Err(PipelineError::generation(ServiceErrorKind::RateLimit, "429")),
            Ok(QUIZ_REPLY.to_string()),
        ]);
        let lesson = generator
            .generate(&quiz_request(), "これはペンです。")
            .await
            .unwrap();
        assert_eq!(lesson.content.item_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_generate_rate_limit_exhaustion() {
        let (generator, calls) = generator(
            (0..3)
                .map(|_| Err(PipelineError::generation(ServiceErrorKind::RateLimit, "429")))
                .collect(),
        );
        let err = generator
            .generate(&quiz_request(), "これはペンです。")
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_generate_does_not_retry_malformed_reply() {
        let (generator, calls) = generator(vec![Ok("no json here".to_string())]);
        let err = generator
            .generate(&quiz_request(), "これはペンです。")
            .await
            .unwrap_err();
        assert!(err.requires_operator());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
