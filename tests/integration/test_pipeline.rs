//! End-to-end tests for the lesson pipeline.
//!
//! One in-process axum server stands in for the recognition service, the
//! chat-completions API and Moodle's web services. The pipeline talks to it
//! through the real reqwest clients.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Json, Router};
use kotoba_h5p::{ContentPackage, ContentType};
use kotoba_pipeline::{
    ChatCompletionsModel, Config, Extractor, Generator, HttpRecognizer, LessonRequest,
    MoodleClient, Pipeline, PipelineError, Publisher, RetryPolicy, RunOptions, RunStage,
    ServiceErrorKind, TaskDirective,
};
use serde_json::{json, Value};
use tempfile::TempDir;

const COURSE_ID: u64 = 7;
const MOODLE_TOKEN: &str = "moodle-token";
const OCR_KEY: &str = "ocr-key";

const QUIZ_REPLY: &str = r#"```json
{
  "grammar_script": "「これは～です。」は話し手の近くにある物を紹介するときに使います。",
  "questions": [
    {
      "text": "「これはペンです。」の意味はどれですか。",
      "answers": [
        {"text": "This is a pen.", "correct": true},
        {"text": "That is a pen.", "correct": false},
        {"text": "This is a book.", "correct": false}
      ],
      "explanation": "「これ」は話し手の近くの物を指します。"
    }
  ]
}
```"#;

// ============================================================================
// Mock services
// ============================================================================

#[derive(Default)]
struct MockState {
    rate_limited: bool,
    fail_registration: bool,
    chat_requests: Mutex<Vec<Value>>,
    uploads: Mutex<Vec<String>>,
    activities: Mutex<Vec<Value>>,
    rest_calls: Mutex<Vec<HashMap<String, String>>>,
}

type Shared = Arc<MockState>;

impl MockState {
    fn calls_to(&self, function: &str) -> Vec<HashMap<String, String>> {
        self.rest_calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|form| form.get("wsfunction").map(String::as_str) == Some(function))
            .cloned()
            .collect()
    }
}

fn moodle_exception(errorcode: &str, message: &str) -> Response {
    Json(json!({
        "exception": "moodle_exception",
        "errorcode": errorcode,
        "message": message,
    }))
    .into_response()
}

async fn recognize(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {OCR_KEY}"));
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let has_content = body["content_base64"].as_str().is_some_and(|s| !s.is_empty());
    if !has_content {
        return StatusCode::BAD_REQUEST.into_response();
    }
    Json(json!({
        "document_id": "doc-1",
        "extracted_text": "これはペンです。",
    }))
    .into_response()
}

async fn chat(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    state.chat_requests.lock().expect("lock").push(body);
    if state.rate_limited {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": {"message": "Rate limit reached"}})),
        )
            .into_response();
    }
    Json(json!({
        "id": "chatcmpl-1",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": QUIZ_REPLY},
            "finish_reason": "stop"
        }]
    }))
    .into_response()
}

async fn upload(State(state): State<Shared>, body: axum::body::Bytes) -> Response {
    let text = String::from_utf8_lossy(&body);
    if !text.contains(MOODLE_TOKEN) {
        return Json(json!({"error": "Invalid token", "errorcode": "invalidtoken"})).into_response();
    }
    let Some(file_name) = text
        .split("filename=\"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .map(str::to_string)
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    state.uploads.lock().expect("lock").push(file_name.clone());
    Json(json!([{
        "component": "user",
        "contextid": 15,
        "userid": "2",
        "filearea": "draft",
        "filename": file_name,
        "filepath": "/",
        "itemid": 9001,
        "license": "allrightsreserved",
        "author": "Kotoba Bot",
        "source": ""
    }]))
    .into_response()
}

async fn rest(State(state): State<Shared>, Form(form): Form<HashMap<String, String>>) -> Response {
    state.rest_calls.lock().expect("lock").push(form.clone());
    if form.get("wstoken").map(String::as_str) != Some(MOODLE_TOKEN) {
        return moodle_exception("invalidtoken", "Invalid token - token not found");
    }

    let function = form.get("wsfunction").cloned().unwrap_or_default();
    match function.as_str() {
        "core_webservice_get_site_info" => Json(json!({
            "sitename": "Kotoba Test",
            "username": "kotoba-bot",
            "userid": 2
        }))
        .into_response(),
        "mod_h5pactivity_add_instance" => {
            if state.fail_registration {
                return moodle_exception("invalidrecord", "Can't find data record in database");
            }
            let name = form.get("h5pactivity[name]").cloned().unwrap_or_default();
            state.activities.lock().expect("lock").push(json!({
                "id": 40,
                "name": name,
                "modname": "h5pactivity",
                "instance": 12
            }));
            Json(json!({"h5pactivityid": 12})).into_response()
        }
        "core_files_get_files" => {
            let files: Vec<Value> = state
                .uploads
                .lock()
                .expect("lock")
                .iter()
                .map(|name| json!({"filename": name, "filepath": "/", "isdir": false}))
                .collect();
            Json(json!({"parents": [], "files": files})).into_response()
        }
        "core_course_get_contents" => {
            let modules = state.activities.lock().expect("lock").clone();
            Json(json!([{"id": 1, "name": "Week 1", "modules": modules}])).into_response()
        }
        "enrol_manual_enrol_users" => Json(Value::Null).into_response(),
        "mod_h5pactivity_get_attempts" => Json(json!({
            "activityid": 12,
            "usersattempts": [{
                "userid": 3,
                "attempts": [{
                    "id": 1,
                    "timemodified": 1_700_000_000,
                    "rawscore": 1,
                    "maxscore": 1,
                    "scaled": 1.0
                }]
            }],
            "warnings": []
        }))
        .into_response(),
        other => moodle_exception("invalidfunction", &format!("unknown function {other}")),
    }
}

/// Starts the mock services and returns their base URL.
async fn spawn_mock(state: Shared) -> String {
    let router = Router::new()
        .route("/ocr", post(recognize))
        .route("/v1/chat/completions", post(chat))
        .route("/webservice/upload.php", post(upload))
        .route("/webservice/rest/server.php", post(rest))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Mock server failed");
    });
    format!("http://{addr}")
}

// ============================================================================
// Helpers
// ============================================================================

fn test_config(base: &str, output: &Path) -> Config {
    let mut config = Config::default();
    config.output_dir = output.display().to_string();
    config.generation.base_url = format!("{base}/v1");
    config.recognition.endpoint = Some(format!("{base}/ocr"));
    config.platform.url = Some(base.to_string());
    config.platform.course_id = Some(COURSE_ID);
    config.platform.upload_pause_ms = 0;
    config.retry.initial_delay_ms = 0;
    config.request_timeout_secs = 10;
    config.validate().expect("test config should be valid");
    config
}

fn build_pipeline(config: &Config, moodle_token: &str) -> Pipeline {
    let timeout = config.request_timeout();
    let model = ChatCompletionsModel::new(&config.generation, "sk-test", timeout)
        .expect("Failed to build model client");
    let recognizer = HttpRecognizer::new(
        config.recognition.endpoint.clone().expect("endpoint"),
        OCR_KEY,
        timeout,
    )
    .expect("Failed to build recognizer");
    let moodle = MoodleClient::new(
        config.platform.url.clone().expect("url"),
        moodle_token,
        COURSE_ID,
        config.platform.section_id,
        timeout,
    )
    .expect("Failed to build Moodle client");

    let recognition_retry =
        RetryPolicy::from_config(&config.retry, config.retry.recognition_attempts);
    Pipeline::from_config(config)
        .with_extractor(Extractor::new(Box::new(recognizer)).with_retry(recognition_retry))
        .with_generator(Generator::from_config(Box::new(model), config))
        .with_publisher(Publisher::from_config(Box::new(moodle), config))
}

fn lesson_request(dir: &Path) -> LessonRequest {
    let source = dir.join("page-01.png");
    std::fs::write(&source, [0x89, b'P', b'N', b'G', 0x0d, 0x0a]).expect("write source");

    LessonRequest::new(
        "ch1",
        ContentType::Quiz,
        TaskDirective::inline("# これは～です。\n\nMake a short multiple-choice quiz."),
    )
    .expect("valid lesson id")
    .with_grammar_point("これは～です。")
    .with_level("N5")
    .with_source(source)
}

// ============================================================================
// Tests
// ============================================================================

/// Recognised text, grammar point and level flow through to a published
/// quiz package.
#[tokio::test]
async fn test_end_to_end_quiz_lesson() {
    let state = Arc::new(MockState::default());
    let base = spawn_mock(Arc::clone(&state)).await;
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&base, &dir.path().join("output"));
    let pipeline = build_pipeline(&config, MOODLE_TOKEN);

    let record = pipeline
        .run(&lesson_request(dir.path()), RunOptions::default())
        .await
        .expect("run should succeed");

    assert_eq!(record.stage, RunStage::Published);
    assert_eq!(record.document_id.as_deref(), Some("doc-1"));
    assert_eq!(record.package_item_id, Some(9001));
    assert_eq!(record.activity_id, Some(12));

    // The prompt carries the recognised text and lesson parameters
    let requests = state.chat_requests.lock().expect("lock").clone();
    assert_eq!(requests.len(), 1);
    let prompt = requests[0]["messages"][1]["content"].as_str().expect("prompt");
    assert!(prompt.contains("これはペンです。"));
    assert!(prompt.contains("Grammar point: これは～です。"));
    assert!(prompt.contains("Level: N5"));

    let script = std::fs::read_to_string(record.script_path.as_ref().expect("script path"))
        .expect("read script");
    assert!(!script.trim().is_empty());

    let package = ContentPackage::read_from_file(
        record.package_path.as_ref().expect("package path"),
        "ch1",
        ContentType::Quiz,
    )
    .expect("read package");
    assert_eq!(package.content_type, ContentType::Quiz);
    let names = package.entry_names().expect("entries");
    assert!(names.contains(&"h5p.json".to_string()));
    assert!(names.contains(&"content/content.json".to_string()));
    let metadata: Value =
        serde_json::from_str(&package.read_entry("h5p.json").expect("h5p.json")).expect("json");
    assert_eq!(metadata["mainLibrary"], "H5P.QuestionSet");
    let content: Value = serde_json::from_str(
        &package.read_entry("content/content.json").expect("content.json"),
    )
    .expect("json");
    assert!(!content["questions"].as_array().expect("questions").is_empty());

    // Upload and registration reached Moodle with the right identifiers
    assert_eq!(*state.uploads.lock().expect("lock"), vec!["ch1_quiz.h5p"]);
    let registrations = state.calls_to("mod_h5pactivity_add_instance");
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0]["h5pfile"], "9001");
    assert_eq!(registrations[0]["h5pactivity[course]"], COURSE_ID.to_string());
    assert_eq!(state.calls_to("core_webservice_get_site_info").len(), 1);

    let verification = pipeline.verify("ch1").await.expect("verify");
    assert!(verification.package_present);
    assert!(verification.registered);
}

/// A rate-limited generation exhausts its retries and leaves no package.
#[tokio::test]
async fn test_rate_limited_generation_leaves_no_package() {
    let state = Arc::new(MockState {
        rate_limited: true,
        ..Default::default()
    });
    let base = spawn_mock(Arc::clone(&state)).await;
    let dir = TempDir::new().expect("tempdir");
    let output = dir.path().join("output");
    let config = test_config(&base, &output);
    let pipeline = build_pipeline(&config, MOODLE_TOKEN);

    let err = pipeline
        .run(&lesson_request(dir.path()), RunOptions::default())
        .await
        .expect_err("run should fail");

    assert!(err.is_rate_limited());
    assert!(!err.requires_operator());
    assert_eq!(
        state.chat_requests.lock().expect("lock").len(),
        config.retry.generation_attempts as usize
    );
    assert!(!output.join("ch1/ch1_quiz.h5p").exists());
    assert!(state.uploads.lock().expect("lock").is_empty());

    let record = pipeline.status("ch1").await.expect("status");
    assert_eq!(record.stage, RunStage::Extracted);
    assert_eq!(record.failure.expect("failure").step, "generate");
}

/// Upload succeeds, registration fails: the package is present remotely
/// but absent from the course, and `verify` reports it.
#[tokio::test]
async fn test_registration_failure_is_detectable() {
    let state = Arc::new(MockState {
        fail_registration: true,
        ..Default::default()
    });
    let base = spawn_mock(Arc::clone(&state)).await;
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&base, &dir.path().join("output"));
    let pipeline = build_pipeline(&config, MOODLE_TOKEN);

    let err = pipeline
        .run(&lesson_request(dir.path()), RunOptions::default())
        .await
        .expect_err("registration should fail");

    assert!(matches!(
        err,
        PipelineError::RegistrationError {
            package_id: 9001,
            ..
        }
    ));
    assert!(err.requires_operator());
    assert_eq!(state.calls_to("mod_h5pactivity_add_instance").len(), 1);

    let record = pipeline.status("ch1").await.expect("status");
    assert_eq!(record.stage, RunStage::Uploaded);
    assert!(record.needs_reconciliation());

    let verification = pipeline.verify("ch1").await.expect("verify");
    assert!(verification.package_present);
    assert!(!verification.registered);
    assert!(verification.needs_reconciliation());
}

/// An invalid Moodle token stops the run before anything is uploaded.
#[tokio::test]
async fn test_invalid_token_is_an_authentication_error() {
    let state = Arc::new(MockState::default());
    let base = spawn_mock(Arc::clone(&state)).await;
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&base, &dir.path().join("output"));
    let pipeline = build_pipeline(&config, "wrong-token");

    let err = pipeline
        .run(&lesson_request(dir.path()), RunOptions::default())
        .await
        .expect_err("access check should fail");

    assert_eq!(err.service_kind(), Some(ServiceErrorKind::Authentication));
    assert!(state.uploads.lock().expect("lock").is_empty());

    let record = pipeline.status("ch1").await.expect("status");
    assert_eq!(record.stage, RunStage::Packaged);
    assert_eq!(record.failure.expect("failure").step, "upload");
}

/// The same generated content always packages to the same bytes.
#[tokio::test]
async fn test_packaging_is_deterministic() {
    let state = Arc::new(MockState::default());
    let base = spawn_mock(Arc::clone(&state)).await;
    let dir = TempDir::new().expect("tempdir");
    let options = RunOptions {
        review: false,
        skip_publish: true,
    };

    let mut packages = Vec::new();
    for run in ["first", "second"] {
        let output = dir.path().join(run);
        let config = test_config(&base, &output);
        let record = build_pipeline(&config, MOODLE_TOKEN)
            .run(&lesson_request(dir.path()), options)
            .await
            .expect("run should succeed");
        assert_eq!(record.stage, RunStage::Packaged);
        packages.push(std::fs::read(output.join("ch1/ch1_quiz.h5p")).expect("read package"));
    }

    assert_eq!(packages[0], packages[1]);
    assert!(state.uploads.lock().expect("lock").is_empty());
}

/// Learners are enrolled as students and their attempts read back.
#[tokio::test]
async fn test_enroll_and_read_progress() {
    let state = Arc::new(MockState::default());
    let base = spawn_mock(Arc::clone(&state)).await;
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&base, &dir.path().join("output"));
    let pipeline = build_pipeline(&config, MOODLE_TOKEN);

    pipeline
        .run(&lesson_request(dir.path()), RunOptions::default())
        .await
        .expect("run should succeed");

    pipeline.enroll(&[3, 4]).await.expect("enroll");
    let enrolments = state.calls_to("enrol_manual_enrol_users");
    assert_eq!(enrolments.len(), 1);
    assert_eq!(enrolments[0]["enrolments[1][userid]"], "4");
    assert_eq!(enrolments[0]["enrolments[1][roleid]"], "5");
    assert_eq!(enrolments[0]["enrolments[0][courseid]"], COURSE_ID.to_string());

    let progress = pipeline.progress("ch1").await.expect("progress");
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].user_id, 3);
    assert_eq!(progress[0].lesson_id, "ch1");
    assert!((progress[0].score - 1.0).abs() < f64::EPSILON);
    assert_eq!(progress[0].timestamp.timestamp(), 1_700_000_000);
}

/// A reviewed lesson resumes from its saved JSON and is then published.
#[tokio::test]
async fn test_review_resume_publish() {
    let state = Arc::new(MockState::default());
    let base = spawn_mock(Arc::clone(&state)).await;
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&base, &dir.path().join("output"));
    let pipeline = build_pipeline(&config, MOODLE_TOKEN);

    let review = RunOptions {
        review: true,
        skip_publish: false,
    };
    let record = pipeline
        .run(&lesson_request(dir.path()), review)
        .await
        .expect("run should stop for review");
    assert_eq!(record.stage, RunStage::AwaitingReview);
    assert!(state.uploads.lock().expect("lock").is_empty());

    // Reviewer fixes a typo in the generated JSON
    let content_path = record.content_path.expect("content path");
    let edited = std::fs::read_to_string(&content_path)
        .expect("read content")
        .replace("This is a book.", "This is a notebook.");
    std::fs::write(&content_path, edited).expect("write content");

    let record = pipeline
        .resume("ch1", RunOptions::default())
        .await
        .expect("resume should publish");
    assert_eq!(record.stage, RunStage::Published);

    let package = ContentPackage::read_from_file(
        record.package_path.as_ref().expect("package path"),
        "ch1",
        ContentType::Quiz,
    )
    .expect("read package");
    let content = package.read_entry("content/content.json").expect("content.json");
    assert!(content.contains("This is a notebook."));
}
