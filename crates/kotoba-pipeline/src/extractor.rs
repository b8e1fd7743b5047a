//! Extractor stage: source document to plain text.
//!
//! The recognition service receives the document base64-encoded and returns
//! `{document_id, extracted_text}`. A transient failure is retried once;
//! anything else is reported upward.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::{api_key, Config};
use crate::error::{PipelineError, Result, ServiceErrorKind};
use crate::http::{build_client, read_json, send_error};
use crate::lesson::{ExtractedDocument, SourceDocument};
use crate::retry::RetryPolicy;

/// A service that turns a document into text.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Recognises the text of `document`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::RecognitionError`.
    async fn recognize(&self, document: &SourceDocument) -> Result<ExtractedDocument>;
}

/// Request body sent to the recognition endpoint.
#[derive(Debug, Serialize)]
struct RecognitionRequest<'a> {
    file_name: &'a str,
    content_base64: String,
}

/// Response body from the recognition endpoint.
#[derive(Debug, Deserialize)]
struct RecognitionResponse {
    #[serde(default)]
    document_id: String,
    #[serde(default)]
    extracted_text: String,
}

/// Recognition service reached over HTTPS.
#[derive(Clone)]
pub struct HttpRecognizer {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRecognizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRecognizer")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpRecognizer {
    /// Creates a client for `endpoint`.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            client: build_client(timeout)?,
        })
    }

    /// Creates a client from the `recognition` config section.
    ///
    /// # Errors
    ///
    /// Fails if no endpoint is configured or the API key variable is unset.
    pub fn from_config(config: &Config) -> Result<Self> {
        let endpoint = config.recognition.endpoint.clone().ok_or_else(|| {
            PipelineError::config_validation(
                "recognition.endpoint is not set",
                "Set recognition.endpoint in kotoba.json to use --source",
            )
        })?;
        let key = api_key("recognition", &config.recognition.api_key_env)?;
        Self::new(endpoint, key, config.request_timeout())
    }
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    async fn recognize(&self, document: &SourceDocument) -> Result<ExtractedDocument> {
        let body = RecognitionRequest {
            file_name: &document.file_name,
            content_base64: base64::engine::general_purpose::STANDARD.encode(&document.bytes),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let (kind, message) = send_error(&e, "recognition service");
                PipelineError::recognition(kind, message)
            })?;

        let parsed: RecognitionResponse = read_json(response, "recognition service")
            .await
            .map_err(|(kind, message)| PipelineError::recognition(kind, message))?;

        if parsed.document_id.trim().is_empty() {
            return Err(PipelineError::recognition(
                ServiceErrorKind::Malformed,
                "response has no document_id",
            ));
        }
        if parsed.extracted_text.trim().is_empty() {
            return Err(PipelineError::recognition(
                ServiceErrorKind::Malformed,
                format!("document {} has no extracted_text", parsed.document_id),
            ));
        }

        Ok(ExtractedDocument {
            document_id: parsed.document_id,
            raw_text: parsed.extracted_text,
        })
    }
}

/// The Extractor stage: a recognizer plus its retry policy.
pub struct Extractor {
    recognizer: Box<dyn Recognizer>,
    retry: RetryPolicy,
}

impl Extractor {
    /// Creates an extractor. The default policy allows a single retry.
    #[must_use]
    pub fn new(recognizer: Box<dyn Recognizer>) -> Self {
        Self {
            recognizer,
            retry: RetryPolicy::new(2, std::time::Duration::from_secs(1), 2),
        }
    }

    /// Overrides the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Extracts the text of `document`.
    pub async fn extract(&self, document: &SourceDocument) -> Result<ExtractedDocument> {
        tracing::info!(
            file = %document.file_name,
            bytes = document.bytes.len(),
            "Extracting text"
        );
        let extracted = self
            .retry
            .run("recognition", || self.recognizer.recognize(document))
            .await?;
        tracing::info!(
            document_id = %extracted.document_id,
            chars = extracted.raw_text.chars().count(),
            "Text extracted"
        );
        Ok(extracted)
    }
}
