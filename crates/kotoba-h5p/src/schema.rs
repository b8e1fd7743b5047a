//! Required-field checks that run before a package is built.
//!
//! Every content type has a small set of fields without which the H5P
//! library would render a broken activity. Checking them up front means the
//! packager either produces a complete bundle or returns a [`SchemaError`];
//! it never writes a partial one.

use thiserror::Error;

use crate::content::{ContentType, CoursePresentation, DialogCardSet, GeneratedContent, QuizSet};

/// Generated content is missing something the target content type requires.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// A required text field is empty or absent.
    #[error("{content_type}: required field '{field}' is missing or empty")]
    MissingField {
        /// Content type being packaged.
        content_type: ContentType,
        /// JSON path of the field, e.g. `cards[2].text`.
        field: String,
    },

    /// A field is present but unusable for the target content type.
    #[error("{content_type}: field '{field}' is invalid: {reason}")]
    InvalidField {
        /// Content type being packaged.
        content_type: ContentType,
        /// JSON path of the field.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The content has no cards, slides or questions at all.
    #[error("{content_type}: '{collection}' must contain at least one entry")]
    EmptyContent {
        /// Content type being packaged.
        content_type: ContentType,
        /// Name of the empty list.
        collection: String,
    },

    /// The content variant cannot be packaged as the requested type.
    #[error("{found} content cannot be packaged as {target}")]
    IncompatibleContent {
        /// Type the content naturally maps to.
        found: ContentType,
        /// Requested target type.
        target: ContentType,
    },
}

impl SchemaError {
    /// Returns the JSON path of the offending field, if there is one.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::MissingField { field, .. } | Self::InvalidField { field, .. } => Some(field),
            Self::EmptyContent { collection, .. } => Some(collection),
            Self::IncompatibleContent { .. } => None,
        }
    }
}

/// Checks that `content` has everything `target` needs.
///
/// # Errors
///
/// Returns the first [`SchemaError`] found, in document order.
pub fn validate(content: &GeneratedContent, target: ContentType) -> Result<(), SchemaError> {
    match (content, target) {
        (GeneratedContent::DialogCards(set), ContentType::DialogCards) => validate_cards(set),
        (GeneratedContent::CoursePresentation(deck), ContentType::CoursePresentation) => {
            validate_slides(deck)
        }
        (GeneratedContent::Quiz(quiz), ContentType::Quiz) => validate_multiple_choice(quiz),
        (GeneratedContent::Quiz(quiz), ContentType::FillBlanks) => validate_blanks(quiz),
        _ => Err(SchemaError::IncompatibleContent {
            found: content.natural_content_type(),
            target,
        }),
    }
}

fn validate_cards(set: &DialogCardSet) -> Result<(), SchemaError> {
    let content_type = ContentType::DialogCards;
    if set.cards.is_empty() {
        return Err(empty(content_type, "cards"));
    }

    for (i, card) in set.cards.iter().enumerate() {
        require(content_type, &card.text, || format!("cards[{i}].text"))?;
        require(content_type, &card.answer, || format!("cards[{i}].answer"))?;
        if let Some(image) = &card.image {
            require(content_type, &image.path, || format!("cards[{i}].image.path"))?;
        }
        if let Some(audio) = &card.audio {
            require(content_type, &audio.path, || format!("cards[{i}].audio.path"))?;
        }
    }
    Ok(())
}

fn validate_slides(deck: &CoursePresentation) -> Result<(), SchemaError> {
    let content_type = ContentType::CoursePresentation;
    if deck.slides.is_empty() {
        return Err(empty(content_type, "slides"));
    }

    for (i, slide) in deck.slides.iter().enumerate() {
        require(content_type, &slide.text, || format!("slides[{i}].text"))?;
    }
    Ok(())
}

fn validate_multiple_choice(quiz: &QuizSet) -> Result<(), SchemaError> {
    let content_type = ContentType::Quiz;
    if quiz.questions.is_empty() {
        return Err(empty(content_type, "questions"));
    }

    for (i, question) in quiz.questions.iter().enumerate() {
        require(content_type, &question.text, || format!("questions[{i}].text"))?;
        if question.answers.len() < 2 {
            return Err(SchemaError::InvalidField {
                content_type,
                field: format!("questions[{i}].answers"),
                reason: "a multiple-choice question needs at least two answers".to_string(),
            });
        }
        for (j, answer) in question.answers.iter().enumerate() {
            require(content_type, &answer.text, || {
                format!("questions[{i}].answers[{j}].text")
            })?;
        }
        if !question.answers.iter().any(|a| a.correct) {
            return Err(SchemaError::InvalidField {
                content_type,
                field: format!("questions[{i}].answers"),
                reason: "no answer is marked correct".to_string(),
            });
        }
    }
    Ok(())
}

fn validate_blanks(quiz: &QuizSet) -> Result<(), SchemaError> {
    let content_type = ContentType::FillBlanks;
    if quiz.questions.is_empty() {
        return Err(empty(content_type, "questions"));
    }

    for (i, question) in quiz.questions.iter().enumerate() {
        require(content_type, &question.text, || format!("questions[{i}].text"))?;
        if !has_blank(&question.text) {
            return Err(SchemaError::InvalidField {
                content_type,
                field: format!("questions[{i}].text"),
                reason: "no blank marked with *answer*".to_string(),
            });
        }
    }
    Ok(())
}

/// Returns `true` if `text` contains at least one non-empty `*blank*`.
pub(crate) fn has_blank(text: &str) -> bool {
    let parts: Vec<&str> = text.split('*').collect();
    if parts.len() < 3 {
        return false;
    }
    // Odd-indexed parts sit between an opening and a closing asterisk.
    parts[1..parts.len() - 1]
        .iter()
        .step_by(2)
        .any(|blank| !blank.trim().is_empty())
}

fn require(
    content_type: ContentType,
    value: &str,
    field: impl FnOnce() -> String,
) -> Result<(), SchemaError> {
    if value.trim().is_empty() {
        return Err(SchemaError::MissingField {
            content_type,
            field: field(),
        });
    }
    Ok(())
}

fn empty(content_type: ContentType, collection: &str) -> SchemaError {
    SchemaError::EmptyContent {
        content_type,
        collection: collection.to_string(),
    }
}
