//! Kotoba Forge H5P packaging
//!
//! This crate owns the data contract between lesson generation and
//! publishing: the structured content a language model produces, the
//! required-field rules for each interactive format, and the deterministic
//! conversion of that content into an `.h5p` bundle.
//!
//! # Types
//!
//! - [`ContentType`] - Target interactive format (dialog cards, course presentation, quiz, fill blanks)
//! - [`GeneratedContent`] - Card deck, slide deck or question set
//! - [`ContentPackage`] - The built `.h5p` archive
//! - [`SchemaError`] - A required field is missing for the target format
//!
//! # Example
//!
//! ```rust
//! use kotoba_h5p::{ContentType, GeneratedContent, Packager};
//!
//! let content: GeneratedContent = serde_json::from_str(
//!     r#"{"title": "ひらがな", "cards": [{"text": "あ", "answer": "a"}]}"#,
//! ).unwrap();
//!
//! let package = Packager::new("hiragana", ContentType::DialogCards)
//!     .package(&content)
//!     .unwrap();
//! assert_eq!(package.content_type, ContentType::DialogCards);
//! ```

pub mod content;
pub mod detect;
pub mod library;
pub mod package;
pub mod schema;

pub use content::{
    CardAudio, CardImage, ContentType, CoursePresentation, DialogCard, DialogCardSet,
    GeneratedContent, QuizAnswer, QuizQuestion, QuizSet, Slide,
};
pub use detect::detect_content_type;
pub use library::Library;
pub use package::{
    package_file_name, ContentPackage, MediaAsset, Packager, CONTENT_ENTRY, METADATA_ENTRY,
};
pub use schema::{validate, SchemaError};

use thiserror::Error;

/// Errors that can occur while building or reading a package.
#[derive(Debug, Error)]
pub enum H5pError {
    /// The content lacks a field the target format requires.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// A media asset path is absolute, empty or escapes `content/`.
    #[error("invalid media asset path: '{0}'")]
    InvalidAsset(String),

    /// An expected archive entry is absent.
    #[error("package entry not found: {0}")]
    MissingEntry(String),

    /// Failed to serialize package JSON.
    #[error("failed to serialize package JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to write or read the zip archive.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Failed to read or write package files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for packaging operations.
pub type Result<T> = std::result::Result<T, H5pError>;
