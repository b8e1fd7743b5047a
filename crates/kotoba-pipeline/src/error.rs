//! Error types for the lesson pipeline.
//!
//! Every stage reports failures through [`PipelineError`]. Variants carry an
//! actionable suggestion in their display text and can be classified with
//! [`PipelineError::is_transient`] (retry with backoff) and
//! [`PipelineError::requires_operator`] (stop and hand over to a human).

use std::path::PathBuf;

use kotoba_h5p::{H5pError, SchemaError};

/// A specialized `Result` type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur during a lesson run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your kotoba.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    /// A service API key is not set in the environment.
    #[error("Missing API key for {service}: environment variable '{env_var}' is not set\n\nSuggestion: Export {env_var} before running kotoba")]
    MissingApiKey {
        /// Service the key is for.
        service: String,
        /// Environment variable that should hold the key.
        env_var: String,
    },

    // ========================================================================
    // Lesson Input Errors
    // ========================================================================
    /// Lesson id is empty or contains characters unsafe for a path.
    #[error("Invalid lesson id '{lesson_id}'\n\nSuggestion: Use only letters, digits, '_' and '-' (e.g. 'hiragana_01')")]
    InvalidLessonId {
        /// The rejected lesson id.
        lesson_id: String,
    },

    /// Task directive file was not found.
    #[error("Task file not found: '{path}'\n\nSuggestion: Check --task-file or the 'taskFile' field in kotoba.json")]
    TaskFileNotFound {
        /// Path where the directive was expected.
        path: PathBuf,
    },

    /// Task directive file exceeds the size limit.
    #[error("Task file exceeds size limit (100KB): '{path}' is {size_kb}KB\n\nSuggestion: Split the directive into smaller task files")]
    TaskFileTooLarge {
        /// Path to the oversized directive.
        path: PathBuf,
        /// Actual size in kilobytes.
        size_kb: u64,
    },

    /// Task directive file is not UTF-8.
    #[error("Task file has invalid encoding: '{path}'\n\nSuggestion: Convert the file to UTF-8 encoding")]
    TaskFileEncodingError {
        /// Path to the directive with encoding issues.
        path: PathBuf,
    },

    /// Source document for recognition was not found.
    #[error("Source document not found: '{path}'\n\nSuggestion: Check the --source path")]
    SourceNotFound {
        /// Path where the document was expected.
        path: PathBuf,
    },

    // ========================================================================
    // Stage Errors
    // ========================================================================
    /// The recognition service failed or returned unusable output.
    #[error("Recognition error ({kind}): {message}\n\nSuggestion: {suggestion}")]
    RecognitionError {
        /// Failure category.
        kind: ServiceErrorKind,
        /// Detailed error message.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    /// The language model failed or returned unusable output.
    #[error("Generation error ({kind}): {message}\n\nSuggestion: {suggestion}")]
    GenerationError {
        /// Failure category.
        kind: ServiceErrorKind,
        /// Detailed error message.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    /// Generated content lacks a field the target content type needs.
    #[error("Schema error: {0}\n\nSuggestion: Fix the generated JSON and run 'kotoba resume'")]
    SchemaError(#[from] SchemaError),

    /// The package could not be built or read.
    #[error("Packaging error: {message}\n\nSuggestion: Check the generated JSON and media paths")]
    PackageError {
        /// Description of the failure.
        message: String,
    },

    /// Uploading the package to the platform failed.
    #[error("Upload error ({kind}): {message}\n\nSuggestion: {suggestion}")]
    UploadError {
        /// Failure category.
        kind: ServiceErrorKind,
        /// Detailed error message.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    /// The package was uploaded but could not be registered in the course.
    #[error("Registration error ({kind}): package {package_id} was uploaded but not registered: {message}\n\nSuggestion: Run 'kotoba verify' and add the activity manually in Moodle")]
    RegistrationError {
        /// Failure category.
        kind: ServiceErrorKind,
        /// Draft item id of the uploaded package.
        package_id: u64,
        /// Detailed error message.
        message: String,
    },

    /// A platform query, enrollment or progress call failed.
    #[error("Platform error ({kind}): {message}\n\nSuggestion: {suggestion}")]
    PlatformError {
        /// Failure category.
        kind: ServiceErrorKind,
        /// Detailed error message.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Run Record Errors
    // ========================================================================
    /// No run record exists for the lesson.
    #[error("No run found for lesson '{lesson_id}'\n\nSuggestion: Start one with 'kotoba run --lesson-id {lesson_id}'")]
    RunNotFound {
        /// Lesson that has no record.
        lesson_id: String,
    },

    /// The run is not at a stage the requested command can continue from.
    #[error("Cannot {action} lesson '{lesson_id}' in stage '{stage}'\n\nSuggestion: Check the lesson's run.json or start a new run")]
    InvalidRunStage {
        /// Lesson being operated on.
        lesson_id: String,
        /// Stage recorded in run.json.
        stage: String,
        /// Attempted action.
        action: String,
    },

    /// Run record contains malformed JSON.
    #[error("Corrupted run record '{path}': {message}\n\nSuggestion: Remove the run.json to start the lesson fresh")]
    RunRecordCorrupted {
        /// Path to the corrupted record.
        path: PathBuf,
        /// Description of the corruption.
        message: String,
    },

    // ========================================================================
    // General I/O Errors
    // ========================================================================
    /// General I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Categories of external service failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// Authentication failure (invalid API key or token).
    Authentication,
    /// Rate limit or quota exceeded.
    RateLimit,
    /// Server error (5xx responses).
    Server,
    /// Network connectivity issues or timeouts.
    Network,
    /// The response could not be parsed or lacks required fields.
    Malformed,
    /// Other unclassified errors.
    Other,
}

impl std::fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Server => write!(f, "server"),
            Self::Network => write!(f, "network"),
            Self::Malformed => write!(f, "malformed"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl ServiceErrorKind {
    /// Returns a suggestion message for this error kind.
    #[must_use]
    pub const fn suggestion(&self) -> &'static str {
        match self {
            Self::Authentication => "Check the API key or token for this service",
            Self::RateLimit => "Wait and retry later, or reduce request frequency",
            Self::Server => "Retry later; the service may be experiencing issues",
            Self::Network => "Check your network connection and the service URL",
            Self::Malformed => "Inspect the service response; a human needs to fix the input or output",
            Self::Other => "Check the service logs or status page",
        }
    }

    /// Returns `true` for kinds worth retrying with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Server | Self::Network)
    }

    /// Classifies an HTTP status code.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Authentication,
            429 => Self::RateLimit,
            500..=599 => Self::Server,
            _ => Self::Other,
        }
    }

    /// Classifies a transport-level failure.
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16())
        } else {
            Self::Network
        }
    }
}

impl PipelineError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `MissingApiKey` error.
    #[must_use]
    pub fn missing_api_key(service: impl Into<String>, env_var: impl Into<String>) -> Self {
        Self::MissingApiKey {
            service: service.into(),
            env_var: env_var.into(),
        }
    }

    /// Creates a new `InvalidLessonId` error.
    #[must_use]
    pub fn invalid_lesson_id(lesson_id: impl Into<String>) -> Self {
        Self::InvalidLessonId {
            lesson_id: lesson_id.into(),
        }
    }

    /// Creates a new `TaskFileNotFound` error.
    #[must_use]
    pub fn task_file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::TaskFileNotFound { path: path.into() }
    }

    /// Creates a new `TaskFileTooLarge` error.
    #[must_use]
    pub fn task_file_too_large(path: impl Into<PathBuf>, size_kb: u64) -> Self {
        Self::TaskFileTooLarge {
            path: path.into(),
            size_kb,
        }
    }

    /// Creates a new `TaskFileEncodingError`.
    #[must_use]
    pub fn task_file_encoding(path: impl Into<PathBuf>) -> Self {
        Self::TaskFileEncodingError { path: path.into() }
    }

    /// Creates a new `RecognitionError` with a suggestion based on the kind.
    #[must_use]
    pub fn recognition(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self::RecognitionError {
            kind,
            message: message.into(),
            suggestion: kind.suggestion().to_string(),
        }
    }

    /// Creates a new `GenerationError` with a suggestion based on the kind.
    #[must_use]
    pub fn generation(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self::GenerationError {
            kind,
            message: message.into(),
            suggestion: kind.suggestion().to_string(),
        }
    }

    /// Creates a new `UploadError` with a suggestion based on the kind.
    #[must_use]
    pub fn upload(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self::UploadError {
            kind,
            message: message.into(),
            suggestion: kind.suggestion().to_string(),
        }
    }

    /// Creates a new `RegistrationError` for an uploaded package.
    #[must_use]
    pub fn registration(
        kind: ServiceErrorKind,
        package_id: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::RegistrationError {
            kind,
            package_id,
            message: message.into(),
        }
    }

    /// Creates a new `PlatformError` with a suggestion based on the kind.
    #[must_use]
    pub fn platform(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        Self::PlatformError {
            kind,
            message: message.into(),
            suggestion: kind.suggestion().to_string(),
        }
    }

    /// Creates a new `RunNotFound` error.
    #[must_use]
    pub fn run_not_found(lesson_id: impl Into<String>) -> Self {
        Self::RunNotFound {
            lesson_id: lesson_id.into(),
        }
    }

    /// Creates a new `InvalidRunStage` error.
    #[must_use]
    pub fn invalid_stage(
        lesson_id: impl Into<String>,
        stage: impl std::fmt::Display,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidRunStage {
            lesson_id: lesson_id.into(),
            stage: stage.to_string(),
            action: action.into(),
        }
    }

    /// Creates a new `RunRecordCorrupted` error.
    #[must_use]
    pub fn run_corrupted(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::RunRecordCorrupted {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns the service failure kind, if this is a service error.
    #[must_use]
    pub const fn service_kind(&self) -> Option<ServiceErrorKind> {
        match self {
            Self::RecognitionError { kind, .. }
            | Self::GenerationError { kind, .. }
            | Self::UploadError { kind, .. }
            | Self::RegistrationError { kind, .. }
            | Self::PlatformError { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns `true` if the error came from a rate limit or quota.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self.service_kind(), Some(ServiceErrorKind::RateLimit))
    }

    /// Returns `true` if this error is transient and may be retried.
    ///
    /// Registration failures are never retried: the upload already
    /// happened and repeating registration could create duplicate activities.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::RecognitionError { kind, .. }
            | Self::GenerationError { kind, .. }
            | Self::UploadError { kind, .. }
            | Self::PlatformError { kind, .. } => kind.is_transient(),
            _ => false,
        }
    }

    /// Returns `true` if a human has to fix something before the lesson can
    /// continue.
    #[must_use]
    pub const fn requires_operator(&self) -> bool {
        matches!(
            self,
            Self::SchemaError(_)
                | Self::RegistrationError { .. }
                | Self::RecognitionError {
                    kind: ServiceErrorKind::Malformed,
                    ..
                }
                | Self::GenerationError {
                    kind: ServiceErrorKind::Malformed,
                    ..
                }
        )
    }
}

impl From<H5pError> for PipelineError {
    fn from(err: H5pError) -> Self {
        match err {
            H5pError::Schema(schema) => Self::SchemaError(schema),
            other => Self::PackageError {
                message: other.to_string(),
            },
        }
    }
}
