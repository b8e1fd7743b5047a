//! The lesson pipeline: extract, generate, package, publish.
//!
//! Stages run strictly in sequence and the run record is saved after each
//! one, so a failure leaves `run.json` describing exactly how far the lesson
//! got. Only upload and recognition are retried (inside their stages); a
//! generation failure stops the run before anything is packaged.

use std::path::{Path, PathBuf};

use kotoba_h5p::{
    detect_content_type, package_file_name, ContentPackage, ContentType, GeneratedContent, Packager,
};
use serde_json::Value;

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::extractor::Extractor;
use crate::generator::{GeneratedLesson, Generator};
use crate::lesson::{collect_media, validate_lesson_id, LessonRequest, LessonWorkspace, SourceDocument};
use crate::publisher::{ProgressRecord, Publisher, UploadedFile, Verification};
use crate::run_record::{RunRecord, RunStage};

/// How far a run should go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Stop after writing the generated JSON for human review.
    pub review: bool,
    /// Package but do not upload.
    pub skip_publish: bool,
}

/// Result of publishing one lesson in a batch.
#[derive(Debug)]
pub struct PublishReport {
    /// Lesson that was published.
    pub lesson_id: String,
    /// Final run record, or why publishing failed.
    pub outcome: Result<RunRecord>,
}

/// A freshly packaged loose JSON file.
#[derive(Debug, Clone)]
pub struct PackagedFile {
    /// The built package.
    pub package: ContentPackage,
    /// Where it was written.
    pub path: PathBuf,
}

/// Runs lessons through the stages.
///
/// Stages are optional so commands that only need some of them (e.g.
/// `verify` needs no language model) can be built without every API key.
pub struct Pipeline {
    output_dir: PathBuf,
    extractor: Option<Extractor>,
    generator: Option<Generator>,
    publisher: Option<Publisher>,
}

impl Pipeline {
    /// Creates a pipeline writing under `output_dir` with no stages attached.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            extractor: None,
            generator: None,
            publisher: None,
        }
    }

    /// Creates a pipeline writing under the configured output directory.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.output_path())
    }

    /// Attaches the Extractor stage.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Attaches the Generator stage.
    #[must_use]
    pub fn with_generator(mut self, generator: Generator) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Attaches the Publisher stage.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Output directory lessons are written under.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Returns the workspace of `lesson_id`.
    pub fn workspace(&self, lesson_id: &str) -> Result<LessonWorkspace> {
        LessonWorkspace::new(&self.output_dir, lesson_id)
    }

    fn extractor(&self) -> Result<&Extractor> {
        self.extractor.as_ref().ok_or_else(|| {
            PipelineError::config_validation(
                "a source document was given but no recognition service is configured",
                "Set recognition.endpoint in kotoba.json",
            )
        })
    }

    fn generator(&self) -> Result<&Generator> {
        self.generator.as_ref().ok_or_else(|| {
            PipelineError::config_validation(
                "no language model is configured",
                "Set generation.apiKeyEnv and export the key",
            )
        })
    }

    fn publisher(&self) -> Result<&Publisher> {
        self.publisher.as_ref().ok_or_else(|| {
            PipelineError::config_validation(
                "no learning platform is configured",
                "Set platform.url and platform.courseId in kotoba.json or MOODLE_URL and MOODLE_COURSE_ID",
            )
        })
    }

    // ========================================================================
    // Run
    // ========================================================================

    /// Runs one lesson from its request.
    ///
    /// Returns the final run record. On failure the error is also recorded
    /// in `run.json` before it is returned.
    pub async fn run(&self, request: &LessonRequest, options: RunOptions) -> Result<RunRecord> {
        let workspace = self.workspace(&request.lesson_id)?;
        refuse_published_rerun(&workspace).await?;
        workspace.create().await?;
        let mut record = RunRecord::new(request);
        record.save(&workspace.run_record_path()).await?;
        tracing::info!(
            lesson_id = %request.lesson_id,
            content_type = %request.content_type,
            level = %request.level,
            "Lesson run started"
        );

        let input_text = match &request.source {
            Some(source) => match self.extract(&workspace, &mut record, source).await {
                Ok(text) => text,
                Err(err) => return Err(fail(&workspace, &mut record, "extract", err).await),
            },
            None => request.task_directive.content.clone(),
        };

        let lesson = match self.generator() {
            Ok(generator) => generator.generate(request, &input_text).await,
            Err(err) => Err(err),
        };
        let lesson = match lesson {
            Ok(lesson) => lesson,
            Err(err) => return Err(fail(&workspace, &mut record, "generate", err).await),
        };

        let (content_path, script_path) = match save_lesson(&workspace, request, &lesson).await {
            Ok(paths) => paths,
            Err(err) => return Err(fail(&workspace, &mut record, "generate", err).await),
        };
        record.content_path = Some(content_path.clone());
        record.script_path = Some(script_path);
        record.advance(RunStage::Generated);
        record.save(&workspace.run_record_path()).await?;

        if options.review {
            record.advance(RunStage::AwaitingReview);
            record.save(&workspace.run_record_path()).await?;
            tracing::info!(
                lesson_id = %request.lesson_id,
                content = %content_path.display(),
                "Awaiting review"
            );
            return Ok(record);
        }

        self.finish(&workspace, record, &lesson.content, options).await
    }

    /// Continues a run from its saved (possibly hand-edited) content.
    pub async fn resume(&self, lesson_id: &str, options: RunOptions) -> Result<RunRecord> {
        let workspace = self.workspace(lesson_id)?;
        let mut record = RunRecord::load(&workspace.run_record_path(), lesson_id).await?;
        if !record.stage.can_resume() {
            return Err(PipelineError::invalid_stage(lesson_id, record.stage, "resume"));
        }

        let content_path = record
            .content_path
            .clone()
            .unwrap_or_else(|| workspace.content_path(&record.level, record.content_type));
        tracing::info!(lesson_id, content = %content_path.display(), "Resuming run");

        let content = match LessonWorkspace::load_content(&content_path, record.content_type).await {
            Ok(content) => content,
            Err(err) => return Err(fail(&workspace, &mut record, "review", err).await),
        };
        let options = RunOptions {
            review: false,
            ..options
        };
        self.finish(&workspace, record, &content, options).await
    }

    async fn extract(
        &self,
        workspace: &LessonWorkspace,
        record: &mut RunRecord,
        source: &Path,
    ) -> Result<String> {
        let extractor = self.extractor()?;
        let document = SourceDocument::load(source).await?;
        let extracted = extractor.extract(&document).await?;
        workspace.save_extracted(&extracted).await?;
        record.document_id = Some(extracted.document_id.clone());
        record.advance(RunStage::Extracted);
        record.save(&workspace.run_record_path()).await?;
        Ok(extracted.raw_text)
    }

    /// Packages `content`, then publishes unless told not to.
    async fn finish(
        &self,
        workspace: &LessonWorkspace,
        mut record: RunRecord,
        content: &GeneratedContent,
        options: RunOptions,
    ) -> Result<RunRecord> {
        let packaged =
            package_content(workspace.dir(), workspace.lesson_id(), record.content_type, content).await;
        let package = match packaged {
            Ok(package) => package,
            Err(err) => return Err(fail(workspace, &mut record, "package", err).await),
        };
        let package_path = match package.write_to_dir(workspace.dir()) {
            Ok(path) => path,
            Err(err) => return Err(fail(workspace, &mut record, "package", err.into()).await),
        };
        tracing::info!(
            lesson_id = %record.lesson_id,
            path = %package_path.display(),
            bytes = package.len(),
            "Package written"
        );
        record.package_path = Some(package_path);
        record.advance(RunStage::Packaged);
        record.save(&workspace.run_record_path()).await?;

        if options.skip_publish {
            return Ok(record);
        }
        if self.publisher.is_none() {
            tracing::info!(lesson_id = %record.lesson_id, "No platform configured, skipping publish");
            return Ok(record);
        }

        self.publish_package(workspace, &mut record, &package).await?;
        Ok(record)
    }

    // ========================================================================
    // Publish
    // ========================================================================

    /// Uploads then registers `package`, saving the record in between so an
    /// unregistered upload is never lost.
    async fn publish_package(
        &self,
        workspace: &LessonWorkspace,
        record: &mut RunRecord,
        package: &ContentPackage,
    ) -> Result<()> {
        let publisher = self.publisher()?;

        let uploaded = match publisher.upload(package).await {
            Ok(uploaded) => uploaded,
            Err(err) => return Err(fail(workspace, record, "upload", err).await),
        };
        record.package_item_id = Some(uploaded.item_id);
        record.package_context_id = uploaded.context_id;
        record.activity_name = Some(package.title.clone());
        record.advance(RunStage::Uploaded);
        record.save(&workspace.run_record_path()).await?;

        let activity_id = match publisher.register(&uploaded, &package.title).await {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(
                    lesson_id = %record.lesson_id,
                    item_id = uploaded.item_id,
                    "Package uploaded but not registered, needs manual reconciliation"
                );
                return Err(fail(workspace, record, "register", err).await);
            }
        };
        record.activity_id = Some(activity_id);
        record.advance(RunStage::Published);
        record.save(&workspace.run_record_path()).await?;
        Ok(())
    }

    /// Publishes already packaged lessons, pausing between uploads.
    ///
    /// Every lesson is attempted; failures are reported per lesson.
    pub async fn publish_lessons(&self, lesson_ids: &[String]) -> Result<Vec<PublishReport>> {
        let publisher = self.publisher()?;
        let mut reports = Vec::with_capacity(lesson_ids.len());
        for (i, lesson_id) in lesson_ids.iter().enumerate() {
            if i > 0 {
                publisher.pause().await;
            }
            let outcome = self.publish_lesson(lesson_id).await;
            if let Err(err) = &outcome {
                tracing::error!(lesson_id = %lesson_id, error = %err, "Publishing failed");
            }
            reports.push(PublishReport {
                lesson_id: lesson_id.clone(),
                outcome,
            });
        }
        Ok(reports)
    }

    async fn publish_lesson(&self, lesson_id: &str) -> Result<RunRecord> {
        let workspace = self.workspace(lesson_id)?;
        let mut record = RunRecord::load(&workspace.run_record_path(), lesson_id).await?;
        // Uploaded lessons already have a draft on the platform; uploading
        // again would orphan it.
        if record.stage != RunStage::Packaged {
            return Err(PipelineError::invalid_stage(lesson_id, record.stage, "publish"));
        }

        let path = record
            .package_path
            .clone()
            .unwrap_or_else(|| workspace.package_path(record.content_type));
        let package = ContentPackage::read_from_file(&path, lesson_id, record.content_type)?;
        self.publish_package(&workspace, &mut record, &package).await?;
        Ok(record)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Loads the run record of `lesson_id`.
    pub async fn status(&self, lesson_id: &str) -> Result<RunRecord> {
        let workspace = self.workspace(lesson_id)?;
        RunRecord::load(&workspace.run_record_path(), lesson_id).await
    }

    /// Compares a lesson's uploaded package with the course contents.
    pub async fn verify(&self, lesson_id: &str) -> Result<Verification> {
        let record = self.status(lesson_id).await?;
        let Some(item_id) = record.package_item_id else {
            return Err(PipelineError::invalid_stage(lesson_id, record.stage, "verify"));
        };
        let uploaded = UploadedFile {
            item_id,
            context_id: record.package_context_id,
            file_name: package_file_name(lesson_id, record.content_type),
        };
        let name = record
            .activity_name
            .clone()
            .unwrap_or_else(|| format!("{lesson_id}_{}", record.content_type));

        let verification = self
            .publisher()?
            .verify(&uploaded, &name, record.activity_id)
            .await?;
        tracing::info!(
            lesson_id,
            package_present = verification.package_present,
            registered = verification.registered,
            "Verified lesson"
        );
        Ok(verification)
    }

    /// Enrolls learners in the course.
    pub async fn enroll(&self, user_ids: &[u64]) -> Result<()> {
        self.publisher()?.enroll(user_ids).await
    }

    /// Reads learner progress on a published lesson.
    pub async fn progress(&self, lesson_id: &str) -> Result<Vec<ProgressRecord>> {
        let record = self.status(lesson_id).await?;
        let Some(activity_id) = record.activity_id else {
            return Err(PipelineError::invalid_stage(lesson_id, record.stage, "read progress of"));
        };
        self.publisher()?.progress(activity_id, lesson_id).await
    }
}

/// Refuses to start over a lesson whose package already reached the
/// platform.
///
/// A fresh run would replace the record of the draft item id and upload a
/// second copy, orphaning the first.
async fn refuse_published_rerun(workspace: &LessonWorkspace) -> Result<()> {
    match RunRecord::load(&workspace.run_record_path(), workspace.lesson_id()).await {
        Ok(existing) if existing.stage >= RunStage::Uploaded => {
            tracing::warn!(
                lesson_id = %existing.lesson_id,
                stage = %existing.stage,
                item_id = ?existing.package_item_id,
                "Lesson already uploaded, refusing to run it again"
            );
            Err(PipelineError::invalid_stage(
                workspace.lesson_id(),
                existing.stage,
                "run",
            ))
        }
        Ok(_) | Err(PipelineError::RunNotFound { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Writes the generated content and grammar script, returning both paths.
async fn save_lesson(
    workspace: &LessonWorkspace,
    request: &LessonRequest,
    lesson: &GeneratedLesson,
) -> Result<(PathBuf, PathBuf)> {
    let content_path = workspace
        .save_content(&request.level, request.content_type, &lesson.content)
        .await?;
    let script_path = workspace
        .save_script(&request.level, request.content_type, &lesson.grammar_script)
        .await?;
    Ok((content_path, script_path))
}

/// Records `err` against `step` and returns it.
///
/// A failure to save the record is logged; the original error wins.
async fn fail(
    workspace: &LessonWorkspace,
    record: &mut RunRecord,
    step: &str,
    err: PipelineError,
) -> PipelineError {
    tracing::error!(lesson_id = %record.lesson_id, step, error = %err, "Run step failed");
    record.fail(step, &err);
    if let Err(save_err) = record.save(&workspace.run_record_path()).await {
        tracing::warn!(error = %save_err, "Could not save run record");
    }
    err
}

async fn package_content(
    media_dir: &Path,
    lesson_id: &str,
    content_type: ContentType,
    content: &GeneratedContent,
) -> Result<ContentPackage> {
    let assets = collect_media(media_dir, content).await?;
    Ok(Packager::new(lesson_id, content_type)
        .with_assets(assets)
        .package(content)?)
}

/// Packages a loose content JSON file into `output_dir`.
///
/// The lesson id is the file stem. Without an explicit `content_type` it is
/// detected from the file name and document shape. Media paths resolve
/// against the file's directory.
pub async fn package_file(
    input: &Path,
    content_type: Option<ContentType>,
    output_dir: &Path,
) -> Result<PackagedFile> {
    let lesson_id = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    validate_lesson_id(&lesson_id)?;

    let bytes = tokio::fs::read(input).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PipelineError::SourceNotFound {
                path: input.to_path_buf(),
            }
        } else {
            PipelineError::Io(e)
        }
    })?;
    let document: Value = serde_json::from_slice(&bytes)?;
    let content_type =
        content_type.unwrap_or_else(|| detect_content_type(&lesson_id, &document));
    let content = GeneratedContent::from_value(content_type, document)?;

    let media_dir = input.parent().unwrap_or_else(|| Path::new("."));
    let package = package_content(media_dir, &lesson_id, content_type, &content).await?;
    let path = package.write_to_dir(output_dir)?;
    tracing::info!(path = %path.display(), content_type = %content_type, "Packaged file");
    Ok(PackagedFile { package, path })
}
