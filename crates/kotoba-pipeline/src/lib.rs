//! Kotoba Forge lesson pipeline
//!
//! Turns a lesson request into a published H5P activity: text recognition,
//! language-model generation, packaging and upload to Moodle, with a
//! persisted run record per lesson.

pub mod config;
pub mod error;
pub mod extractor;
pub mod generator;
pub mod http;
pub mod lesson;
pub mod pipeline;
pub mod publisher;
pub mod retry;
pub mod run_record;

pub use config::{
    api_key, Config, GenerationConfig, PlatformConfig, RecognitionConfig, RetryConfig,
    ENV_MOODLE_COURSE_ID, ENV_MOODLE_SECTION_ID, ENV_MOODLE_URL,
};
pub use error::{PipelineError, Result, ServiceErrorKind};
pub use extractor::{Extractor, HttpRecognizer, Recognizer};
pub use generator::{
    extract_json, parse_lesson, ChatCompletionsModel, ChatMessage, GeneratedLesson, Generator,
    LanguageModel,
};
pub use lesson::{
    timestamped_lesson_id, validate_lesson_id, ExtractedDocument, LessonRequest, LessonWorkspace,
    SourceDocument, TaskDirective, MAX_TASK_FILE_SIZE,
};
pub use pipeline::{package_file, PackagedFile, Pipeline, PublishReport, RunOptions};
pub use publisher::{
    CourseActivity, MoodleClient, Platform, ProgressRecord, Publisher, SiteInfo, UploadedFile,
    Verification,
};
pub use retry::RetryPolicy;
pub use run_record::{RunFailure, RunRecord, RunStage};
