//! Content type detection for loose JSON files.
//!
//! Reviewed content is often dropped into a directory by hand. The file name
//! wins when it names a type (`N5_hiragana_dialog_cards.json`); otherwise the
//! document shape decides.

use serde_json::Value;

use crate::content::ContentType;
use crate::schema::has_blank;

/// File-name markers in match order. `multiple_choice` predates `quiz`.
const NAME_MARKERS: [(&str, ContentType); 5] = [
    ("dialog_cards", ContentType::DialogCards),
    ("course_presentation", ContentType::CoursePresentation),
    ("multiple_choice", ContentType::Quiz),
    ("fill_blanks", ContentType::FillBlanks),
    ("quiz", ContentType::Quiz),
];

/// Guesses the content type of a generated JSON document.
///
/// Falls back to [`ContentType::DialogCards`] when nothing matches.
#[must_use]
pub fn detect_content_type(file_name: &str, document: &Value) -> ContentType {
    if let Some((_, content_type)) = NAME_MARKERS
        .iter()
        .find(|(marker, _)| file_name.contains(marker))
    {
        return *content_type;
    }

    if document.get("cards").is_some() || document.get("dialogs").is_some() {
        return ContentType::DialogCards;
    }
    if document.get("slides").is_some() {
        return ContentType::CoursePresentation;
    }

    let questions = document
        .get("questions")
        .or_else(|| document.get("quiz"))
        .and_then(Value::as_array);
    if let Some(questions) = questions {
        if questions.iter().any(|q| q.get("answers").is_some()) {
            return ContentType::Quiz;
        }
        let blank = questions.iter().any(|q| {
            q.get("text")
                .and_then(Value::as_str)
                .is_some_and(has_blank)
        });
        if blank {
            return ContentType::FillBlanks;
        }
    }

    ContentType::DialogCards
}
