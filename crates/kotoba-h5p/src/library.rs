//! H5P library identifiers and the JSON documents inside a package.
//!
//! Two documents are produced per package: `h5p.json`, the package
//! metadata, and `content/content.json`, the parameters handed to the main
//! library. Both are built from already-validated content, so the builders
//! here never fail.

use serde_json::{json, Value};

use crate::content::{
    ContentType, CoursePresentation, DialogCard, DialogCardSet, GeneratedContent, QuizQuestion,
    QuizSet,
};

/// Default dialog card image size in pixels.
const DEFAULT_IMAGE_SIZE: u32 = 300;

/// Default MIME type for card audio.
const DEFAULT_AUDIO_MIME: &str = "audio/mpeg";

/// An H5P library reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Library {
    /// Machine name, e.g. `H5P.Dialogcards`.
    pub machine_name: &'static str,
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
}

impl Library {
    const fn new(machine_name: &'static str, major: u32, minor: u32) -> Self {
        Self {
            machine_name,
            major,
            minor,
        }
    }

    /// Returns the `"<machine name> <major>.<minor>"` form used for sub-content.
    #[must_use]
    pub fn ubername(&self) -> String {
        format!("{} {}.{}", self.machine_name, self.major, self.minor)
    }

    fn dependency(&self) -> Value {
        json!({
            "machineName": self.machine_name,
            "majorVersion": self.major,
            "minorVersion": self.minor,
        })
    }
}

/// `H5P.Dialogcards`.
pub const DIALOG_CARDS: Library = Library::new("H5P.Dialogcards", 1, 9);
/// `H5P.CoursePresentation`.
pub const COURSE_PRESENTATION: Library = Library::new("H5P.CoursePresentation", 1, 25);
/// `H5P.AdvancedText`, the text element placed on slides.
pub const ADVANCED_TEXT: Library = Library::new("H5P.AdvancedText", 1, 1);
/// `H5P.QuestionSet`.
pub const QUESTION_SET: Library = Library::new("H5P.QuestionSet", 1, 20);
/// `H5P.MultiChoice`, the question type inside a question set.
pub const MULTI_CHOICE: Library = Library::new("H5P.MultiChoice", 1, 16);
/// `H5P.Blanks`.
pub const BLANKS: Library = Library::new("H5P.Blanks", 1, 14);

impl ContentType {
    /// Returns the main H5P library for this content type.
    #[must_use]
    pub const fn main_library(&self) -> Library {
        match self {
            Self::DialogCards => DIALOG_CARDS,
            Self::CoursePresentation => COURSE_PRESENTATION,
            Self::Quiz => QUESTION_SET,
            Self::FillBlanks => BLANKS,
        }
    }

    /// Returns every library the package must declare, main library first.
    #[must_use]
    pub fn dependencies(&self) -> Vec<Library> {
        match self {
            Self::DialogCards => vec![DIALOG_CARDS],
            Self::CoursePresentation => vec![COURSE_PRESENTATION, ADVANCED_TEXT],
            Self::Quiz => vec![QUESTION_SET, MULTI_CHOICE],
            Self::FillBlanks => vec![BLANKS],
        }
    }
}

/// Builds `h5p.json`.
#[must_use]
pub fn package_metadata(title: &str, content_type: ContentType) -> Value {
    let main = content_type.main_library();
    let dependencies: Vec<Value> = content_type
        .dependencies()
        .iter()
        .map(Library::dependency)
        .collect();

    json!({
        "title": title,
        "language": "ja",
        "mainLibrary": main.machine_name,
        "embedTypes": ["iframe"],
        "license": "U",
        "preloadedDependencies": dependencies,
    })
}

/// Builds `content/content.json` for validated content.
///
/// The caller guarantees `content.supports(target)`; [`crate::schema::validate`]
/// has already rejected anything else.
#[must_use]
pub fn content_parameters(content: &GeneratedContent, target: ContentType, title: &str) -> Value {
    match (content, target) {
        (GeneratedContent::DialogCards(set), _) => dialog_cards(set, title),
        (GeneratedContent::CoursePresentation(deck), _) => course_presentation(deck),
        (GeneratedContent::Quiz(quiz), ContentType::FillBlanks) => blanks(quiz, title),
        (GeneratedContent::Quiz(quiz), _) => question_set(quiz, title),
    }
}

fn dialog_cards(set: &DialogCardSet, title: &str) -> Value {
    let dialogs: Vec<Value> = set.cards.iter().map(dialog).collect();

    let mut params = json!({
        "title": paragraph(title),
        "mode": "normal",
        "dialogs": dialogs,
    });
    if let Some(description) = &set.description {
        params["description"] = Value::String(paragraph(description));
    }
    if let Some(behaviour) = &set.behaviour {
        params["behaviour"] = behaviour.clone();
    }
    params
}

fn dialog(card: &DialogCard) -> Value {
    let mut dialog = json!({
        "text": paragraph(&card.text),
        "answer": paragraph(&card.answer),
    });
    if let Some(tip) = &card.tip {
        dialog["tips"] = json!({ "front": escape_html(tip) });
    }
    if let Some(image) = &card.image {
        dialog["image"] = json!({
            "path": image.path,
            "width": image.width.unwrap_or(DEFAULT_IMAGE_SIZE),
            "height": image.height.unwrap_or(DEFAULT_IMAGE_SIZE),
            "alt": image.alt.clone().unwrap_or_default(),
        });
    }
    if let Some(audio) = &card.audio {
        dialog["audio"] = json!([{
            "path": audio.path,
            "mime": audio.mime.as_deref().unwrap_or(DEFAULT_AUDIO_MIME),
        }]);
    }
    dialog
}

fn course_presentation(deck: &CoursePresentation) -> Value {
    let slides: Vec<Value> = deck
        .slides
        .iter()
        .enumerate()
        .map(|(i, slide)| {
            let mut html = String::new();
            if let Some(heading) = &slide.title {
                html.push_str(&format!("<h2>{}</h2>", escape_html(heading)));
            }
            html.push_str(&paragraph(&slide.text));

            let mut entry = json!({
                "elements": [{
                    "x": 5,
                    "y": 5,
                    "width": 90,
                    "height": 90,
                    "action": {
                        "library": ADVANCED_TEXT.ubername(),
                        "params": { "text": html },
                        "subContentId": sub_content_id(i),
                    },
                }],
                "slideBackgroundSelector": {},
            });
            if let Some(heading) = &slide.title {
                entry["keywords"] = json!([{ "main": heading }]);
            }
            entry
        })
        .collect();

    json!({
        "presentation": {
            "slides": slides,
            "keywordListEnabled": true,
        },
    })
}

fn question_set(quiz: &QuizSet, title: &str) -> Value {
    let questions: Vec<Value> = quiz
        .questions
        .iter()
        .enumerate()
        .map(|(i, question)| multi_choice(i, question))
        .collect();

    json!({
        "introPage": {
            "showIntroPage": false,
            "title": title,
        },
        "progressType": "dots",
        "passPercentage": 50,
        "questions": questions,
    })
}

fn multi_choice(index: usize, question: &QuizQuestion) -> Value {
    let correct = question.answers.iter().filter(|a| a.correct).count();
    let answers: Vec<Value> = question
        .answers
        .iter()
        .map(|answer| {
            json!({
                "text": format!("<div>{}</div>", escape_html(&answer.text)),
                "correct": answer.correct,
                "tipsAndFeedback": {
                    "chosenFeedback": answer.feedback.as_deref().map(escape_html).unwrap_or_default(),
                },
            })
        })
        .collect();

    let mut params = json!({
        "question": paragraph(&question.text),
        "answers": answers,
        "behaviour": { "singleAnswer": correct == 1 },
    });
    if let Some(explanation) = &question.explanation {
        params["overallFeedback"] = json!([{ "from": 0, "to": 100, "feedback": explanation }]);
    }

    json!({
        "library": MULTI_CHOICE.ubername(),
        "params": params,
        "subContentId": sub_content_id(index),
        "metadata": { "contentType": "Multiple Choice" },
    })
}

fn blanks(quiz: &QuizSet, title: &str) -> Value {
    let questions: Vec<Value> = quiz
        .questions
        .iter()
        .map(|q| Value::String(paragraph(&q.text)))
        .collect();

    json!({
        "text": paragraph(title),
        "questions": questions,
        "behaviour": {
            "caseSensitive": false,
            "enableRetry": true,
            "enableSolutionsButton": true,
        },
    })
}

/// Sub-content ids must be stable for packaging to be reproducible, so they
/// are derived from the item position instead of being random.
fn sub_content_id(index: usize) -> String {
    format!("00000000-0000-4000-8000-{index:012x}")
}

fn paragraph(text: &str) -> String {
    format!("<p>{}</p>", escape_html(text))
}

/// Escapes the characters that matter inside H5P HTML fields.
pub(crate) fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
