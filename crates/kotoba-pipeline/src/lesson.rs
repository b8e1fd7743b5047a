//! Lesson inputs and the per-lesson artifact workspace.
//!
//! A run starts from a [`LessonRequest`]: a path-safe lesson id, the target
//! content type and a task directive (a markdown file describing what to
//! generate, usually with a ```` ```json ```` template). Everything a run
//! writes lives under `<output>/<lesson_id>/`, laid out by
//! [`LessonWorkspace`].

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};
use kotoba_h5p::{package_file_name, ContentType, GeneratedContent, H5pError, MediaAsset};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};

/// Maximum allowed task directive size in bytes (100KB).
pub const MAX_TASK_FILE_SIZE: u64 = 100 * 1024;

/// Matches a fenced ```` ```json ```` block and captures its body.
static JSON_BLOCK: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"```json\s*([\s\S]*?)\s*```").ok());

/// Returns the bodies of all ```` ```json ```` blocks in `text`, in order.
pub fn fenced_json_blocks(text: &str) -> Vec<&str> {
    let Some(re) = JSON_BLOCK.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str()))
        .collect()
}

/// Checks that `lesson_id` is non-empty and only uses `[A-Za-z0-9_-]`.
///
/// # Errors
///
/// Returns `PipelineError::InvalidLessonId` otherwise.
pub fn validate_lesson_id(lesson_id: &str) -> Result<()> {
    let safe = !lesson_id.is_empty()
        && lesson_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if safe {
        Ok(())
    } else {
        Err(PipelineError::invalid_lesson_id(lesson_id))
    }
}

/// Generates a lesson id of the form `lesson_YYYYmmdd_HHMMSS`.
#[must_use]
pub fn timestamped_lesson_id<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("lesson_{}", now.format("%Y%m%d_%H%M%S"))
}

// ============================================================================
// Task directive
// ============================================================================

/// A loaded task directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDirective {
    /// Where the directive was read from.
    pub path: PathBuf,

    /// Raw markdown content.
    pub content: String,
}

impl TaskDirective {
    /// Loads a directive from a markdown file.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::TaskFileNotFound` if the file doesn't exist,
    /// `PipelineError::TaskFileTooLarge` above 100KB and
    /// `PipelineError::TaskFileEncodingError` if it is not UTF-8.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::task_file_not_found(path)
            } else {
                PipelineError::Io(e)
            }
        })?;

        let file_size = metadata.len();
        if file_size > MAX_TASK_FILE_SIZE {
            return Err(PipelineError::task_file_too_large(path, file_size / 1024));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                PipelineError::task_file_encoding(path)
            } else {
                PipelineError::Io(e)
            }
        })?;

        tracing::debug!(path = %path.display(), bytes = file_size, "Loaded task directive");
        Ok(Self {
            path: path.to_path_buf(),
            content,
        })
    }

    /// Creates a directive from text that did not come from a file.
    #[must_use]
    pub fn inline(content: impl Into<String>) -> Self {
        Self {
            path: PathBuf::from("<inline>"),
            content: content.into(),
        }
    }

    /// Returns the first `# ` heading, if any.
    #[must_use]
    pub fn heading(&self) -> Option<&str> {
        self.content
            .lines()
            .find_map(|line| line.strip_prefix("# "))
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }

    /// Parses every ```` ```json ```` block that holds valid JSON.
    #[must_use]
    pub fn json_templates(&self) -> Vec<Value> {
        fenced_json_blocks(&self.content)
            .into_iter()
            .filter_map(|block| serde_json::from_str(block).ok())
            .collect()
    }

    /// Returns the first JSON template shaped like `content_type`.
    ///
    /// Dialog cards look for `cards`, presentations for `slides`, quizzes and
    /// blanks for `questions` (or `quiz`).
    #[must_use]
    pub fn template_for(&self, content_type: ContentType) -> Option<Value> {
        let keys: &[&str] = match content_type {
            ContentType::DialogCards => &["cards", "dialogs"],
            ContentType::CoursePresentation => &["slides"],
            ContentType::Quiz | ContentType::FillBlanks => &["questions", "quiz"],
        };
        self.json_templates()
            .into_iter()
            .find(|template| keys.iter().any(|key| template.get(key).is_some()))
    }
}

// ============================================================================
// Lesson request
// ============================================================================

/// What one run should produce. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonRequest {
    /// Path-safe lesson identifier.
    pub lesson_id: String,

    /// Target interactive format.
    pub content_type: ContentType,

    /// What to generate.
    pub task_directive: TaskDirective,

    /// Grammar point the lesson teaches, e.g. `これは～です。`.
    pub grammar_point: Option<String>,

    /// JLPT level, e.g. `N5`.
    pub level: String,

    /// Optional scanned source document to run through recognition.
    pub source: Option<PathBuf>,
}

impl LessonRequest {
    /// Creates a request, validating the lesson id.
    pub fn new(
        lesson_id: impl Into<String>,
        content_type: ContentType,
        task_directive: TaskDirective,
    ) -> Result<Self> {
        let lesson_id = lesson_id.into();
        validate_lesson_id(&lesson_id)?;
        Ok(Self {
            lesson_id,
            content_type,
            task_directive,
            grammar_point: None,
            level: "N5".to_string(),
            source: None,
        })
    }

    /// Sets the grammar point.
    #[must_use]
    pub fn with_grammar_point(mut self, grammar_point: impl Into<String>) -> Self {
        self.grammar_point = Some(grammar_point.into());
        self
    }

    /// Sets the JLPT level.
    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Sets the source document.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Grammar point to put in the prompt, falling back to the directive's
    /// heading.
    #[must_use]
    pub fn effective_grammar_point(&self) -> Option<&str> {
        self.grammar_point
            .as_deref()
            .or_else(|| self.task_directive.heading())
    }
}

// ============================================================================
// Documents
// ============================================================================

/// A binary document to send to the recognition service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    /// File name reported to the service.
    pub file_name: String,

    /// Raw bytes.
    pub bytes: Vec<u8>,
}

impl SourceDocument {
    /// Reads a source document from disk.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::SourceNotFound` if the file doesn't exist.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::SourceNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                PipelineError::Io(e)
            }
        })?;
        let file_name = path
            .file_name()
            .map_or_else(|| "document".to_string(), |n| n.to_string_lossy().into_owned());
        Ok(Self { file_name, bytes })
    }
}

/// Text recognised from a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    /// Identifier assigned by the recognition service.
    pub document_id: String,

    /// Recognised plain text.
    pub raw_text: String,
}

// ============================================================================
// Workspace
// ============================================================================

/// File layout for one lesson under the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonWorkspace {
    lesson_id: String,
    dir: PathBuf,
}

impl LessonWorkspace {
    /// Returns the workspace for `lesson_id` under `output_dir`.
    pub fn new(output_dir: impl AsRef<Path>, lesson_id: &str) -> Result<Self> {
        validate_lesson_id(lesson_id)?;
        Ok(Self {
            lesson_id: lesson_id.to_string(),
            dir: output_dir.as_ref().join(lesson_id),
        })
    }

    /// Lesson this workspace belongs to.
    #[must_use]
    pub fn lesson_id(&self) -> &str {
        &self.lesson_id
    }

    /// `<output>/<lesson_id>`.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the lesson directory.
    pub async fn create(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// `run.json`.
    #[must_use]
    pub fn run_record_path(&self) -> PathBuf {
        self.dir.join("run.json")
    }

    /// `extracted.json`.
    #[must_use]
    pub fn extracted_path(&self) -> PathBuf {
        self.dir.join("extracted.json")
    }

    /// `<level>_<lesson_id>_<content_type>.json`.
    #[must_use]
    pub fn content_path(&self, level: &str, content_type: ContentType) -> PathBuf {
        self.dir
            .join(format!("{level}_{}_{content_type}.json", self.lesson_id))
    }

    /// `<level>_<lesson_id>_<content_type>_script.md`.
    #[must_use]
    pub fn script_path(&self, level: &str, content_type: ContentType) -> PathBuf {
        self.dir
            .join(format!("{level}_{}_{content_type}_script.md", self.lesson_id))
    }

    /// `<lesson_id>_<content_type>.h5p`.
    #[must_use]
    pub fn package_path(&self, content_type: ContentType) -> PathBuf {
        self.dir.join(package_file_name(&self.lesson_id, content_type))
    }

    /// Writes the recognised text.
    pub async fn save_extracted(&self, document: &ExtractedDocument) -> Result<PathBuf> {
        let path = self.extracted_path();
        tokio::fs::write(&path, serde_json::to_vec_pretty(document)?).await?;
        Ok(path)
    }

    /// Writes generated content as pretty JSON. Non-ASCII text is kept as is.
    pub async fn save_content(
        &self,
        level: &str,
        content_type: ContentType,
        content: &GeneratedContent,
    ) -> Result<PathBuf> {
        let path = self.content_path(level, content_type);
        tokio::fs::write(&path, serde_json::to_vec_pretty(content)?).await?;
        Ok(path)
    }

    /// Reads generated content back, typically after human review.
    pub async fn load_content(path: &Path, content_type: ContentType) -> Result<GeneratedContent> {
        let bytes = tokio::fs::read(path).await?;
        let value: Value = serde_json::from_slice(&bytes)?;
        Ok(GeneratedContent::from_value(content_type, value)?)
    }

    /// Writes the grammar script.
    pub async fn save_script(
        &self,
        level: &str,
        content_type: ContentType,
        script: &str,
    ) -> Result<PathBuf> {
        let path = self.script_path(level, content_type);
        tokio::fs::write(&path, script).await?;
        Ok(path)
    }

    /// Loads the media files `content` references from the lesson directory.
    pub async fn collect_media(&self, content: &GeneratedContent) -> Result<Vec<MediaAsset>> {
        collect_media(&self.dir, content).await
    }
}

/// Loads the media files `content` references, relative to `dir`.
///
/// References that do not exist on disk are logged and skipped; the activity
/// then shows the card without that media. Remote URLs are left to the
/// player. Absolute or `..` references are rejected before anything is read.
pub async fn collect_media(dir: &Path, content: &GeneratedContent) -> Result<Vec<MediaAsset>> {
    let mut assets = Vec::new();
    for reference in content.media_paths() {
        if reference.contains("://") {
            continue;
        }
        if !MediaAsset::is_bundle_path(reference) {
            return Err(H5pError::InvalidAsset(reference.to_string()).into());
        }
        match tokio::fs::read(dir.join(reference)).await {
            Ok(data) => assets.push(MediaAsset::new(reference, data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    dir = %dir.display(),
                    media = reference,
                    "Referenced media file not found, skipping"
                );
            }
            Err(e) => return Err(PipelineError::Io(e)),
        }
    }
    Ok(assets)
}
