//! Configuration for the lesson pipeline.
//!
//! Settings are read from `kotoba.json` (camelCase keys, every field
//! optional), then selected environment variables override the platform
//! section, and finally the CLI overrides individual values. API keys are
//! never stored in the file; the config only names the environment variable
//! that holds each key.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kotoba_h5p::ContentType;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// The default config file name.
const CONFIG_FILE_NAME: &str = "kotoba.json";

/// Environment variable overriding `platform.url`.
pub const ENV_MOODLE_URL: &str = "MOODLE_URL";

/// Environment variable overriding `platform.courseId`.
pub const ENV_MOODLE_COURSE_ID: &str = "MOODLE_COURSE_ID";

/// Environment variable overriding `platform.sectionId`.
pub const ENV_MOODLE_SECTION_ID: &str = "MOODLE_SECTION_ID";

fn default_output_dir() -> String {
    "output".to_string()
}

fn default_task_file() -> String {
    "tasks/default.md".to_string()
}

fn default_level() -> String {
    "N5".to_string()
}

fn default_audience() -> String {
    "Indonesian learners".to_string()
}

const fn default_request_timeout() -> u64 {
    120
}

fn default_recognition_key_env() -> String {
    "KOTOBA_OCR_API_KEY".to_string()
}

fn default_generation_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

const fn default_temperature() -> f32 {
    0.7
}

const fn default_max_tokens() -> u32 {
    4000
}

fn default_generation_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_system_prompt() -> String {
    "You are a H5P content creation expert.".to_string()
}

fn default_platform_token_env() -> String {
    "MOODLE_TOKEN".to_string()
}

const fn default_upload_pause_ms() -> u64 {
    1000
}

const fn default_student_role_id() -> u32 {
    5
}

const fn default_generation_attempts() -> u32 {
    3
}

const fn default_recognition_attempts() -> u32 {
    2
}

const fn default_upload_attempts() -> u32 {
    3
}

const fn default_initial_delay_ms() -> u64 {
    5000
}

const fn default_max_delay_ms() -> u64 {
    60_000
}

const fn default_backoff_multiplier() -> u32 {
    2
}

/// Main configuration for a lesson run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root directory for per-lesson artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Default task directive file.
    #[serde(default = "default_task_file")]
    pub task_file: String,

    /// Default content type when a run does not name one.
    #[serde(default)]
    pub content_type: ContentType,

    /// Default JLPT level, e.g. `N5`.
    #[serde(default = "default_level")]
    pub level: String,

    /// Learner audience the generated explanations are adjusted for.
    #[serde(default = "default_audience")]
    pub audience: String,

    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Recognition (OCR) service settings.
    #[serde(default)]
    pub recognition: RecognitionConfig,

    /// Language-model service settings.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Learning platform (Moodle) settings.
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Retry and backoff settings.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            task_file: default_task_file(),
            content_type: ContentType::default(),
            level: default_level(),
            audience: default_audience(),
            request_timeout_secs: default_request_timeout(),
            recognition: RecognitionConfig::default(),
            generation: GenerationConfig::default(),
            platform: PlatformConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// Looks for `kotoba.json` in the current directory. If not found,
    /// returns the default configuration.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            PipelineError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads configuration from `kotoba.json` in a specific directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::ConfigParseError` if the file exists but
    /// contains invalid JSON, and `PipelineError::ConfigValidationError` if
    /// a value is out of range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(PipelineError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| PipelineError::config_parse(path, e.to_string()))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Applies `MOODLE_URL`, `MOODLE_COURSE_ID` and `MOODLE_SECTION_ID` from
    /// the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies platform overrides from an arbitrary variable lookup.
    ///
    /// Empty values are ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_MOODLE_URL) {
            self.platform.url = Some(url);
        }
        if let Some(course) = get(ENV_MOODLE_COURSE_ID) {
            let id = course.trim().parse().map_err(|_| {
                PipelineError::config_validation(
                    format!("{ENV_MOODLE_COURSE_ID} must be a number, got '{course}'"),
                    format!("Set {ENV_MOODLE_COURSE_ID} to the numeric id of the Moodle course"),
                )
            })?;
            self.platform.course_id = Some(id);
        }
        if let Some(section) = get(ENV_MOODLE_SECTION_ID) {
            self.platform.section_id = section.trim().parse().map_err(|_| {
                PipelineError::config_validation(
                    format!("{ENV_MOODLE_SECTION_ID} must be a number, got '{section}'"),
                    format!("Set {ENV_MOODLE_SECTION_ID} to a course section number (0 is the top section)"),
                )
            })?;
        }
        self.validate()
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::ConfigValidationError` if any check fails.
    pub fn validate(&self) -> Result<()> {
        if self.output_dir.trim().is_empty() {
            return Err(PipelineError::config_validation(
                "outputDir must not be empty",
                "Provide an output directory in your kotoba.json (e.g. 'output')",
            ));
        }

        if self.task_file.trim().is_empty() {
            return Err(PipelineError::config_validation(
                "taskFile must not be empty",
                "Provide a task directive path in your kotoba.json",
            ));
        }

        if self.level.trim().is_empty() {
            return Err(PipelineError::config_validation(
                "level must not be empty",
                "Set level to a JLPT level such as 'N5' in your kotoba.json",
            ));
        }

        if self.request_timeout_secs == 0 {
            return Err(PipelineError::config_validation(
                "requestTimeoutSecs must be greater than 0",
                "Set requestTimeoutSecs to at least 1 second in your kotoba.json",
            ));
        }

        if self.generation.model.trim().is_empty() {
            return Err(PipelineError::config_validation(
                "generation.model must not be empty",
                "Set generation.model (e.g. 'gpt-4o') in your kotoba.json",
            ));
        }

        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(PipelineError::config_validation(
                format!(
                    "generation.temperature must be between 0 and 2, got {}",
                    self.generation.temperature
                ),
                "Set generation.temperature to a value such as 0.7",
            ));
        }

        if self.generation.max_tokens == 0 {
            return Err(PipelineError::config_validation(
                "generation.maxTokens must be greater than 0",
                "Set generation.maxTokens to at least 1 in your kotoba.json",
            ));
        }

        check_url("generation.baseUrl", Some(&self.generation.base_url))?;
        check_url("recognition.endpoint", self.recognition.endpoint.as_deref())?;
        check_url("platform.url", self.platform.url.as_deref())?;

        if self.retry.generation_attempts == 0
            || self.retry.recognition_attempts == 0
            || self.retry.upload_attempts == 0
        {
            return Err(PipelineError::config_validation(
                "retry attempts must be greater than 0",
                "Set every retry.*Attempts value to at least 1 (1 means no retry)",
            ));
        }

        if self.retry.backoff_multiplier == 0 {
            return Err(PipelineError::config_validation(
                "retry.backoffMultiplier must be greater than 0",
                "Set retry.backoffMultiplier to 1 for a constant delay or 2 to double it",
            ));
        }

        Ok(())
    }

    /// Returns the per-request HTTP timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Returns the output directory as a path.
    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }
}

fn check_url(field: &str, url: Option<&str>) -> Result<()> {
    match url {
        Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
            Err(PipelineError::config_validation(
                format!("{field} must be an http(s) URL, got '{url}'"),
                format!("Set {field} to a full URL such as 'https://example.com'"),
            ))
        }
        _ => Ok(()),
    }
}

/// Reads an API key from the environment variable `env_var`.
///
/// # Errors
///
/// Returns `PipelineError::MissingApiKey` if the variable is unset or blank.
pub fn api_key(service: &str, env_var: &str) -> Result<String> {
    std::env::var(env_var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| PipelineError::missing_api_key(service, env_var))
}

/// Recognition (OCR) service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionConfig {
    /// Endpoint accepting `{file_name, content_base64}`. Required only when a
    /// run has a source document.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Environment variable holding the API key.
    #[serde(default = "default_recognition_key_env")]
    pub api_key_env: String,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: default_recognition_key_env(),
        }
    }
}

/// Language-model service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    #[serde(default = "default_generation_base_url")]
    pub base_url: String,

    /// Model name.
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens in the reply.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Environment variable holding the API key.
    #[serde(default = "default_generation_key_env")]
    pub api_key_env: String,

    /// System message sent with every prompt.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_generation_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            api_key_env: default_generation_key_env(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// Learning platform (Moodle) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfig {
    /// Moodle site root, e.g. `https://moodle.example.com`.
    #[serde(default)]
    pub url: Option<String>,

    /// Course that receives the activities.
    #[serde(default)]
    pub course_id: Option<u64>,

    /// Course section number (0 is the top section).
    #[serde(default)]
    pub section_id: u32,

    /// Environment variable holding the web-service token.
    #[serde(default = "default_platform_token_env")]
    pub token_env: String,

    /// Pause between uploads when publishing several packages.
    #[serde(default = "default_upload_pause_ms")]
    pub upload_pause_ms: u64,

    /// Role assigned by `kotoba enroll` (5 is Moodle's student role).
    #[serde(default = "default_student_role_id")]
    pub student_role_id: u32,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            url: None,
            course_id: None,
            section_id: 0,
            token_env: default_platform_token_env(),
            upload_pause_ms: default_upload_pause_ms(),
            student_role_id: default_student_role_id(),
        }
    }
}

impl PlatformConfig {
    /// Returns the site URL or a validation error naming the fix.
    pub fn require_url(&self) -> Result<&str> {
        self.url.as_deref().ok_or_else(|| {
            PipelineError::config_validation(
                "platform.url is not set",
                format!("Set platform.url in kotoba.json or export {ENV_MOODLE_URL}"),
            )
        })
    }

    /// Returns the course id or a validation error naming the fix.
    pub fn require_course_id(&self) -> Result<u64> {
        self.course_id.ok_or_else(|| {
            PipelineError::config_validation(
                "platform.courseId is not set",
                format!("Set platform.courseId in kotoba.json or export {ENV_MOODLE_COURSE_ID}"),
            )
        })
    }
}

/// Retry and backoff settings for transient service failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts for generation calls.
    #[serde(default = "default_generation_attempts")]
    pub generation_attempts: u32,

    /// Total attempts for recognition calls (2 means a single retry).
    #[serde(default = "default_recognition_attempts")]
    pub recognition_attempts: u32,

    /// Total attempts for package uploads.
    #[serde(default = "default_upload_attempts")]
    pub upload_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Factor applied to the delay after each retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            generation_attempts: default_generation_attempts(),
            recognition_attempts: default_recognition_attempts(),
            upload_attempts: default_upload_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}
