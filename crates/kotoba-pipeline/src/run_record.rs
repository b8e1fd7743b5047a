//! Persisted per-lesson run state.
//!
//! `run.json` records how far a lesson got, where its artifacts are and which
//! remote identifiers it was given. It is rewritten after every stage so a
//! failed run leaves an accurate account of its partial state behind, most
//! importantly a package that was uploaded but never registered.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kotoba_h5p::ContentType;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::lesson::LessonRequest;

// ============================================================================
// RunStage
// ============================================================================

/// Furthest stage a lesson run has completed.
///
/// The stage advances in this order:
/// - `Started` -> `Extracted` (only with a source document) -> `Generated`
/// - `Generated` -> `AwaitingReview` (only with `--review`)
/// - `Generated` / `AwaitingReview` -> `Packaged` -> `Uploaded` -> `Published`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    /// Run created, nothing produced yet.
    #[default]
    Started,
    /// Source document recognised.
    Extracted,
    /// Generated content saved.
    Generated,
    /// Stopped for human review of the generated content.
    AwaitingReview,
    /// Package built and written.
    Packaged,
    /// Package uploaded to the platform but not registered in the course.
    Uploaded,
    /// Activity registered in the course.
    Published,
}

impl RunStage {
    /// Returns `true` if generated content exists and packaging can (re)start.
    ///
    /// ```
    /// use kotoba_pipeline::RunStage;
    ///
    /// assert!(RunStage::AwaitingReview.can_resume());
    /// assert!(!RunStage::Uploaded.can_resume());
    /// ```
    #[must_use]
    pub const fn can_resume(&self) -> bool {
        matches!(self, Self::Generated | Self::AwaitingReview | Self::Packaged)
    }

    /// Returns `true` if a package file exists that can be published.
    #[must_use]
    pub const fn has_package(&self) -> bool {
        matches!(self, Self::Packaged | Self::Uploaded | Self::Published)
    }
}

impl std::fmt::Display for RunStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Extracted => "extracted",
            Self::Generated => "generated",
            Self::AwaitingReview => "awaiting_review",
            Self::Packaged => "packaged",
            Self::Uploaded => "uploaded",
            Self::Published => "published",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// RunFailure
// ============================================================================

/// The error that stopped a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Step that failed, e.g. `generate` or `register`.
    pub step: String,

    /// Service failure kind, if the error came from a service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Full error message.
    pub message: String,

    /// Whether a human must act before the run can continue.
    pub requires_operator: bool,

    /// When the failure happened.
    pub at: DateTime<Utc>,
}

impl RunFailure {
    /// Captures `err` for `step`.
    #[must_use]
    pub fn new(step: impl Into<String>, err: &PipelineError) -> Self {
        Self {
            step: step.into(),
            kind: err.service_kind().map(|k| k.to_string()),
            message: err.to_string(),
            requires_operator: err.requires_operator(),
            at: Utc::now(),
        }
    }
}

// ============================================================================
// RunRecord
// ============================================================================

/// Persisted state of one lesson run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Lesson identifier.
    pub lesson_id: String,

    /// Target content type.
    pub content_type: ContentType,

    /// JLPT level.
    pub level: String,

    /// Grammar point sent to the generator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar_point: Option<String>,

    /// Furthest completed stage.
    pub stage: RunStage,

    /// Recognition document id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,

    /// Generated content JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_path: Option<PathBuf>,

    /// Grammar script markdown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_path: Option<PathBuf>,

    /// Built `.h5p` file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_path: Option<PathBuf>,

    /// Draft item id Moodle assigned to the upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_item_id: Option<u64>,

    /// Context id of the draft area holding the upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_context_id: Option<u64>,

    /// Activity name used for registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_name: Option<String>,

    /// H5P activity id returned by registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<u64>,

    /// Last failure, cleared when the run advances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Creates a record in the `Started` stage for `request`.
    #[must_use]
    pub fn new(request: &LessonRequest) -> Self {
        let now = Utc::now();
        Self {
            lesson_id: request.lesson_id.clone(),
            content_type: request.content_type,
            level: request.level.clone(),
            grammar_point: request.effective_grammar_point().map(str::to_string),
            stage: RunStage::Started,
            document_id: None,
            content_path: None,
            script_path: None,
            package_path: None,
            package_item_id: None,
            package_context_id: None,
            activity_name: None,
            activity_id: None,
            failure: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Updates the `updated_at` timestamp to the current time.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Moves to `stage` and clears any previous failure.
    pub fn advance(&mut self, stage: RunStage) {
        tracing::debug!(lesson_id = %self.lesson_id, from = %self.stage, to = %stage, "Run advanced");
        self.stage = stage;
        self.failure = None;
        self.touch();
    }

    /// Records that `step` failed with `err`. The stage is left unchanged.
    pub fn fail(&mut self, step: &str, err: &PipelineError) {
        self.failure = Some(RunFailure::new(step, err));
        self.touch();
    }

    /// Returns `true` if the package was uploaded but registration never
    /// succeeded.
    #[must_use]
    pub const fn needs_reconciliation(&self) -> bool {
        matches!(self.stage, RunStage::Uploaded)
    }

    /// Loads a record from `path`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::RunNotFound` if the file does not exist and
    /// `PipelineError::RunRecordCorrupted` if it is not a valid record.
    pub async fn load(path: &Path, lesson_id: &str) -> Result<Self> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::run_not_found(lesson_id));
            }
            Err(e) => return Err(PipelineError::Io(e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| PipelineError::run_corrupted(path, e.to_string()))
    }

    /// Writes the record to `path`, replacing it atomically.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ServiceErrorKind;
    use crate::lesson::TaskDirective;

    fn record() -> RunRecord {
        let request = LessonRequest::new("ch1", ContentType::Quiz, TaskDirective::inline("# これは～です。"))
            .unwrap();
        RunRecord::new(&request)
    }

    #[test]
    fn test_new_record() {
        let record = record();
        assert_eq!(record.stage, RunStage::Started);
        assert_eq!(record.level, "N5");
        assert_eq!(record.grammar_point.as_deref(), Some("これは～です。"));
        assert!(record.failure.is_none());
    }

    #[test]
    fn test_stage_order_and_flags() {
        assert!(RunStage::Started < RunStage::Generated);
        assert!(RunStage::Packaged < RunStage::Uploaded);
        assert!(RunStage::Generated.can_resume());
        assert!(RunStage::Packaged.can_resume());
        assert!(!RunStage::Started.can_resume());
        assert!(!RunStage::Published.can_resume());
        assert!(RunStage::Uploaded.has_package());
        assert!(!RunStage::Generated.has_package());
    }

    #[test]
    fn test_stage_serialization() {
        assert_eq!(
            serde_json::to_string(&RunStage::AwaitingReview).unwrap(),
            "\"awaiting_review\""
        );
        assert_eq!(RunStage::AwaitingReview.to_string(), "awaiting_review");
    }

    #[test]
    fn test_fail_then_advance_clears_failure() {
        let mut record = record();
        record.fail(
            "generate",
            &PipelineError::generation(ServiceErrorKind::RateLimit, "429"),
        );
        let failure = record.failure.as_ref().unwrap();
        assert_eq!(failure.step, "generate");
        assert_eq!(failure.kind.as_deref(), Some("rate_limit"));
        assert!(!failure.requires_operator);
        assert_eq!(record.stage, RunStage::Started);

        record.advance(RunStage::Generated);
        assert!(record.failure.is_none());
    }

    #[test]
    fn test_registration_failure_needs_reconciliation() {
        let mut record = record();
        record.advance(RunStage::Uploaded);
        record.package_item_id = Some(42);
        record.fail(
            "register",
            &PipelineError::registration(ServiceErrorKind::Other, 42, "invalidparameter"),
        );
        assert!(record.needs_reconciliation());
        assert!(record.failure.as_ref().unwrap().requires_operator);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ch1").join("run.json");

        let mut record = record();
        record.advance(RunStage::Packaged);
        record.package_path = Some(PathBuf::from("output/ch1/ch1_quiz.h5p"));
        record.save(&path).await.unwrap();

        let loaded = RunRecord::load(&path, "ch1").await.unwrap();
        assert_eq!(loaded, record);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_missing_and_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");

        let err = RunRecord::load(&path, "ch1").await.unwrap_err();
        assert!(matches!(err, PipelineError::RunNotFound { .. }));

        std::fs::write(&path, "{ truncated").unwrap();
        let err = RunRecord::load(&path, "ch1").await.unwrap_err();
        assert!(matches!(err, PipelineError::RunRecordCorrupted { .. }));
    }
}
