//! Tests for the sample configuration, task directive and content files
//! shipped with the repository.

use std::path::PathBuf;

use kotoba_h5p::ContentType;
use kotoba_pipeline::{package_file, Config, TaskDirective};

/// Path to the integration fixtures.
fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

/// Path to the repository root.
fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(|p| p.parent())
        .map(PathBuf::from)
        .expect("Failed to find repository root")
}

/// Tests that the sample config loads, keeping defaults for omitted fields.
#[test]
fn test_sample_config_loads() {
    let config_path = fixture_path().join("kotoba.json");
    assert!(config_path.exists(), "Config fixture not found at: {config_path:?}");

    let config = Config::load_from_file(&config_path).expect("Failed to load config");

    assert_eq!(config.content_type, ContentType::Quiz);
    assert_eq!(config.request_timeout_secs, 60);
    assert_eq!(config.generation.model, "gpt-4o-mini");
    assert_eq!(config.generation.max_tokens, 4000);
    assert_eq!(config.platform.course_id, Some(7));
    assert_eq!(config.platform.student_role_id, 5);
    assert_eq!(config.retry.upload_attempts, 5);
    assert_eq!(config.retry.generation_attempts, 3);
}

/// Tests that environment-style overrides replace the file's platform values.
#[test]
fn test_sample_config_overrides() {
    let mut config =
        Config::load_from_file(&fixture_path().join("kotoba.json")).expect("Failed to load config");

    config
        .apply_overrides_from(|name| match name {
            "MOODLE_URL" => Some("https://lms.example.org".to_string()),
            "MOODLE_COURSE_ID" => Some("42".to_string()),
            _ => None,
        })
        .expect("overrides should apply");

    assert_eq!(config.platform.url.as_deref(), Some("https://lms.example.org"));
    assert_eq!(config.platform.course_id, Some(42));
    assert_eq!(config.platform.section_id, 1);
}

/// Tests that the default task directive has a heading and a quiz template.
#[test]
fn test_default_task_directive() {
    let directive =
        TaskDirective::load(repo_root().join("tasks/default.md")).expect("Failed to load directive");

    assert_eq!(directive.heading(), Some("これは～です。"));
    let quiz = directive
        .template_for(ContentType::Quiz)
        .expect("quiz template");
    assert!(quiz.get("questions").is_some());
    let cards = directive
        .template_for(ContentType::DialogCards)
        .expect("card template");
    assert!(cards.get("cards").is_some());
    assert!(directive.template_for(ContentType::CoursePresentation).is_none());
}

/// Tests that a loose content file packages with its type detected from
/// the file name, skipping media that is not on disk.
#[tokio::test]
async fn test_package_sample_content_file() {
    let output = tempfile::TempDir::new().expect("tempdir");

    let packaged = package_file(
        &fixture_path().join("hiragana_dialog_cards.json"),
        None,
        output.path(),
    )
    .await
    .expect("Failed to package fixture");

    assert_eq!(packaged.package.content_type, ContentType::DialogCards);
    assert_eq!(packaged.package.title, "ひらがな あ行");
    let names = packaged.package.entry_names().expect("entries");
    assert_eq!(names, vec!["h5p.json", "content/content.json"]);
    assert!(packaged.path.exists());
}
