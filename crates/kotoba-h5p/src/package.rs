//! Deterministic `.h5p` bundle construction.
//!
//! A package is a zip archive. Entries are always written in the same order
//! (`h5p.json`, `content/content.json`, then media sorted by path) with a
//! fixed timestamp, so the same content always yields the same bytes.

use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use crate::content::{ContentType, GeneratedContent};
use crate::library::{content_parameters, package_metadata};
use crate::schema::validate;
use crate::{H5pError, Result};

/// Archive path of the package metadata.
pub const METADATA_ENTRY: &str = "h5p.json";

/// Archive path of the main library parameters.
pub const CONTENT_ENTRY: &str = "content/content.json";

/// A media file bundled under `content/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAsset {
    /// Path relative to `content/`, e.g. `images/a.png`.
    pub path: String,
    /// File contents.
    pub data: Vec<u8>,
}

impl MediaAsset {
    /// Creates a new media asset.
    #[must_use]
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            data,
        }
    }

    /// Returns `true` if `path` can live under `content/`: non-empty,
    /// relative and free of `..` or root components.
    ///
    /// ```
    /// use kotoba_h5p::MediaAsset;
    ///
    /// assert!(MediaAsset::is_bundle_path("images/a.png"));
    /// assert!(!MediaAsset::is_bundle_path("../a.png"));
    /// assert!(!MediaAsset::is_bundle_path("/etc/passwd"));
    /// ```
    #[must_use]
    pub fn is_bundle_path(path: &str) -> bool {
        !path.is_empty()
            && Path::new(path)
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
    }

    fn check_path(&self) -> Result<()> {
        if Self::is_bundle_path(&self.path) {
            Ok(())
        } else {
            Err(H5pError::InvalidAsset(self.path.clone()))
        }
    }
}

/// A platform-ready bundle built from one piece of generated content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPackage {
    /// Lesson the package belongs to.
    pub lesson_id: String,
    /// Content type the package was built as.
    pub content_type: ContentType,
    /// Title recorded in `h5p.json`.
    pub title: String,
    /// The `.h5p` archive bytes.
    pub bytes: Vec<u8>,
}

impl ContentPackage {
    /// File name the package is stored and uploaded under.
    #[must_use]
    pub fn file_name(&self) -> String {
        package_file_name(&self.lesson_id, self.content_type)
    }

    /// Size of the archive in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the archive is empty (never the case for built packages).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Writes the archive into `dir` and returns the full path.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, &self.bytes)?;
        Ok(path)
    }

    /// Reads a previously written package back from disk.
    ///
    /// The title is taken from the archive's `h5p.json`.
    pub fn read_from_file(
        path: &Path,
        lesson_id: impl Into<String>,
        content_type: ContentType,
    ) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let metadata: serde_json::Value = serde_json::from_str(&read_entry(&bytes, METADATA_ENTRY)?)?;
        let title = metadata
            .get("title")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            lesson_id: lesson_id.into(),
            content_type,
            title,
            bytes,
        })
    }

    /// Returns the archive entry names in stored order.
    pub fn entry_names(&self) -> Result<Vec<String>> {
        let mut archive = ZipArchive::new(Cursor::new(self.bytes.as_slice()))?;
        let mut names = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            names.push(archive.by_index(i)?.name().to_string());
        }
        Ok(names)
    }

    /// Reads one archive entry as UTF-8 text.
    pub fn read_entry(&self, name: &str) -> Result<String> {
        read_entry(&self.bytes, name)
    }
}

/// Returns `<lesson_id>_<content_type>.h5p`.
#[must_use]
pub fn package_file_name(lesson_id: &str, content_type: ContentType) -> String {
    format!("{lesson_id}_{content_type}.h5p")
}

fn read_entry(bytes: &[u8], name: &str) -> Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut file = archive
        .by_name(name)
        .map_err(|_| H5pError::MissingEntry(name.to_string()))?;
    let mut text = String::new();
    file.read_to_string(&mut text)?;
    Ok(text)
}

/// Builds [`ContentPackage`]s for one lesson and content type.
///
/// # Example
///
/// ```
/// use kotoba_h5p::{ContentType, DialogCard, DialogCardSet, GeneratedContent, Packager};
///
/// let content = GeneratedContent::DialogCards(DialogCardSet {
///     cards: vec![DialogCard {
///         text: "あ".to_string(),
///         answer: "a".to_string(),
///         ..Default::default()
///     }],
///     ..Default::default()
/// });
///
/// let package = Packager::new("hiragana", ContentType::DialogCards)
///     .package(&content)
///     .unwrap();
/// assert_eq!(package.file_name(), "hiragana_dialog_cards.h5p");
/// ```
#[derive(Debug, Clone)]
pub struct Packager {
    lesson_id: String,
    content_type: ContentType,
    title: Option<String>,
    assets: Vec<MediaAsset>,
}

impl Packager {
    /// Creates a packager for `lesson_id` targeting `content_type`.
    #[must_use]
    pub fn new(lesson_id: impl Into<String>, content_type: ContentType) -> Self {
        Self {
            lesson_id: lesson_id.into(),
            content_type,
            title: None,
            assets: Vec::new(),
        }
    }

    /// Overrides the package title.
    ///
    /// Without an override the content's own title is used, falling back to
    /// `<lesson_id>_<content_type>`.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Adds a media file to bundle under `content/`.
    #[must_use]
    pub fn with_asset(mut self, asset: MediaAsset) -> Self {
        self.assets.push(asset);
        self
    }

    /// Adds several media files.
    #[must_use]
    pub fn with_assets(mut self, assets: impl IntoIterator<Item = MediaAsset>) -> Self {
        self.assets.extend(assets);
        self
    }

    /// Validates `content` and builds the package.
    ///
    /// # Errors
    ///
    /// Returns [`H5pError::Schema`] if a required field is missing, and
    /// [`H5pError::InvalidAsset`] for media paths that are absolute or climb
    /// out of `content/`.
    pub fn package(&self, content: &GeneratedContent) -> Result<ContentPackage> {
        validate(content, self.content_type)?;
        for asset in &self.assets {
            asset.check_path()?;
        }

        let title = self
            .title
            .clone()
            .or_else(|| content.title().map(str::to_string))
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("{}_{}", self.lesson_id, self.content_type));

        let metadata = package_metadata(&title, self.content_type);
        let params = content_parameters(content, self.content_type, &title);

        let mut assets: Vec<&MediaAsset> = self.assets.iter().collect();
        assets.sort_by(|a, b| a.path.cmp(&b.path));
        assets.dedup_by(|a, b| a.path == b.path);

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default());

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file(METADATA_ENTRY, options)?;
        writer.write_all(&serde_json::to_vec_pretty(&metadata)?)?;
        writer.start_file(CONTENT_ENTRY, options)?;
        writer.write_all(&serde_json::to_vec_pretty(&params)?)?;
        for asset in assets {
            writer.start_file(format!("content/{}", asset.path), options)?;
            writer.write_all(&asset.data)?;
        }
        let bytes = writer.finish()?.into_inner();

        Ok(ContentPackage {
            lesson_id: self.lesson_id.clone(),
            content_type: self.content_type,
            title,
            bytes,
        })
    }
}
