//! Generated lesson content and the content types it can be packaged as.
//!
//! The structures here mirror the JSON the language model is asked to return
//! and the JSON a human reviewer edits on disk. Text fields default to empty
//! strings so that an incomplete document still parses; completeness is the
//! job of [`crate::schema`], which runs before anything is packaged.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// ContentType
// ============================================================================

/// Interactive-content format a lesson is packaged as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentType {
    /// Two-sided flashcards (`H5P.Dialogcards`, default).
    #[default]
    DialogCards,
    /// Slide deck (`H5P.CoursePresentation`).
    CoursePresentation,
    /// Multiple-choice question set (`H5P.QuestionSet`).
    Quiz,
    /// Fill-in-the-blanks exercise (`H5P.Blanks`).
    FillBlanks,
}

impl ContentType {
    /// Every supported content type, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::DialogCards,
        Self::CoursePresentation,
        Self::Quiz,
        Self::FillBlanks,
    ];

    /// Returns the canonical snake_case name used in file names and requests.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DialogCards => "dialog_cards",
            Self::CoursePresentation => "course_presentation",
            Self::Quiz => "quiz",
            Self::FillBlanks => "fill_blanks",
        }
    }

    /// Parses a content type name, case-insensitively.
    ///
    /// `multiple_choice` is accepted as an alias of [`ContentType::Quiz`].
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "dialog_cards" => Some(Self::DialogCards),
            "course_presentation" => Some(Self::CoursePresentation),
            "quiz" | "multiple_choice" => Some(Self::Quiz),
            "fill_blanks" => Some(Self::FillBlanks),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_case_insensitive(s).ok_or_else(|| {
            format!(
                "invalid content type '{s}': expected one of 'dialog_cards', 'course_presentation', 'quiz', 'fill_blanks'"
            )
        })
    }
}

impl<'de> Deserialize<'de> for ContentType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for ContentType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

// ============================================================================
// Dialog cards
// ============================================================================

/// A deck of two-sided dialog cards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialogCardSet {
    /// Deck title shown above the cards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Short instruction shown under the title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Cards in presentation order.
    #[serde(alias = "dialogs")]
    pub cards: Vec<DialogCard>,

    /// Raw H5P behaviour settings, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behaviour: Option<serde_json::Value>,
}

/// One flashcard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialogCard {
    /// Front face, e.g. the kana `あ`.
    #[serde(default)]
    pub text: String,

    /// Back face, e.g. the romaji `a`.
    #[serde(default)]
    pub answer: String,

    /// Optional hint for the front face.
    #[serde(default, alias = "tips", skip_serializing_if = "Option::is_none")]
    pub tip: Option<String>,

    /// Optional illustration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<CardImage>,

    /// Optional pronunciation clip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<CardAudio>,
}

/// Image attached to a dialog card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardImage {
    /// Path relative to the package `content/` directory.
    #[serde(default)]
    pub path: String,

    /// Width in pixels (300 when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    /// Height in pixels (300 when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,

    /// Alternative text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
}

/// Audio attached to a dialog card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardAudio {
    /// Path relative to the package `content/` directory.
    #[serde(default)]
    pub path: String,

    /// MIME type (`audio/mpeg` when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

// ============================================================================
// Course presentation
// ============================================================================

/// A slide deck.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoursePresentation {
    /// Presentation title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Slides in order.
    pub slides: Vec<Slide>,
}

/// One slide of explanatory text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slide {
    /// Slide heading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Slide body.
    #[serde(default)]
    pub text: String,

    /// Presenter notes for the reviewer. Not rendered in the package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// ============================================================================
// Quiz
// ============================================================================

/// A set of questions, packaged as multiple choice or as fill-in-the-blanks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizSet {
    /// Quiz title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Questions in order.
    #[serde(alias = "quiz")]
    pub questions: Vec<QuizQuestion>,
}

/// A single quiz item.
///
/// For fill-in-the-blanks the answers live inside `text`, wrapped in
/// asterisks (`これ*は*ペンです。`), and `answers` stays empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizQuestion {
    /// Question prompt.
    #[serde(default, alias = "question")]
    pub text: String,

    /// Answer options for multiple choice.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answers: Vec<QuizAnswer>,

    /// Explanation shown after answering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// One answer option.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizAnswer {
    /// Option text.
    #[serde(default)]
    pub text: String,

    /// Whether choosing this option is correct.
    #[serde(default)]
    pub correct: bool,

    /// Feedback shown when this option is chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

// ============================================================================
// GeneratedContent
// ============================================================================

/// Structured lesson content produced by the generator.
///
/// Serialized untagged so that the on-disk JSON is exactly what a reviewer
/// expects to edit (`{"cards": [...]}`, `{"slides": [...]}` or
/// `{"questions": [...]}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GeneratedContent {
    /// Flashcard deck.
    DialogCards(DialogCardSet),
    /// Slide deck.
    CoursePresentation(CoursePresentation),
    /// Question set.
    Quiz(QuizSet),
}

impl GeneratedContent {
    /// Parses a JSON value as the variant that backs `content_type`.
    ///
    /// Unlike plain deserialization this never guesses: a document meant for
    /// a quiz is always read as a [`QuizSet`].
    pub fn from_value(
        content_type: ContentType,
        value: serde_json::Value,
    ) -> serde_json::Result<Self> {
        match content_type {
            ContentType::DialogCards => serde_json::from_value(value).map(Self::DialogCards),
            ContentType::CoursePresentation => {
                serde_json::from_value(value).map(Self::CoursePresentation)
            }
            ContentType::Quiz | ContentType::FillBlanks => {
                serde_json::from_value(value).map(Self::Quiz)
            }
        }
    }

    /// Returns the content type this variant is packaged as by default.
    #[must_use]
    pub const fn natural_content_type(&self) -> ContentType {
        match self {
            Self::DialogCards(_) => ContentType::DialogCards,
            Self::CoursePresentation(_) => ContentType::CoursePresentation,
            Self::Quiz(_) => ContentType::Quiz,
        }
    }

    /// Returns `true` if this variant can be packaged as `content_type`.
    #[must_use]
    pub const fn supports(&self, content_type: ContentType) -> bool {
        matches!(
            (self, content_type),
            (Self::DialogCards(_), ContentType::DialogCards)
                | (Self::CoursePresentation(_), ContentType::CoursePresentation)
                | (Self::Quiz(_), ContentType::Quiz | ContentType::FillBlanks)
        )
    }

    /// Returns the title, if the content has one.
    #[must_use]
    pub fn title(&self) -> Option<&str> {
        match self {
            Self::DialogCards(set) => set.title.as_deref(),
            Self::CoursePresentation(deck) => deck.title.as_deref(),
            Self::Quiz(quiz) => quiz.title.as_deref(),
        }
    }

    /// Media paths referenced by the content, in document order.
    #[must_use]
    pub fn media_paths(&self) -> Vec<&str> {
        match self {
            Self::DialogCards(set) => set
                .cards
                .iter()
                .flat_map(|card| {
                    let image = card.image.as_ref().map(|i| i.path.as_str());
                    let audio = card.audio.as_ref().map(|a| a.path.as_str());
                    image.into_iter().chain(audio)
                })
                .filter(|path| !path.is_empty())
                .collect(),
            Self::CoursePresentation(_) | Self::Quiz(_) => Vec::new(),
        }
    }

    /// Number of cards, slides or questions.
    #[must_use]
    pub fn item_count(&self) -> usize {
        match self {
            Self::DialogCards(set) => set.cards.len(),
            Self::CoursePresentation(deck) => deck.slides.len(),
            Self::Quiz(quiz) => quiz.questions.len(),
        }
    }
}
