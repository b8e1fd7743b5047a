//! Publisher stage: upload a package to Moodle and register it in a course.
//!
//! Upload and registration are two separate web-service calls. Uploads are
//! retried on transient failures; registration is not, because a failed
//! registration leaves an uploaded draft behind that an operator reconciles
//! (see [`Verification`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kotoba_h5p::ContentPackage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{api_key, Config};
use crate::error::{PipelineError, Result, ServiceErrorKind};
use crate::http::{build_client, read_json, send_error};
use crate::retry::RetryPolicy;

/// Moodle module name of H5P activities.
const H5P_MODULE: &str = "h5pactivity";

// ============================================================================
// Platform types
// ============================================================================

/// Basic facts about the Moodle site and the token's user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInfo {
    /// Site name.
    #[serde(default)]
    pub sitename: String,
    /// User the token belongs to.
    #[serde(default)]
    pub username: String,
    /// Id of that user.
    #[serde(default)]
    pub userid: u64,
}

/// A file in the token user's draft area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    /// Draft item id, the package identifier used for registration.
    pub item_id: u64,
    /// Context of the draft area.
    pub context_id: Option<u64>,
    /// Stored file name.
    pub file_name: String,
}

/// One activity in the course contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseActivity {
    /// Course module id.
    pub id: u64,
    /// Activity name.
    pub name: String,
    /// Module type, e.g. `h5pactivity`.
    pub modname: String,
    /// Instance id within the module type.
    #[serde(default)]
    pub instance: Option<u64>,
}

/// A learner's result on a lesson activity. Owned by the platform; the
/// pipeline only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Moodle user id.
    pub user_id: u64,
    /// Lesson the activity belongs to.
    pub lesson_id: String,
    /// Scaled score between 0 and 1.
    pub score: f64,
    /// When the attempt was last updated.
    pub timestamp: DateTime<Utc>,
}

/// The learning platform's web services.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Checks that the token works.
    async fn site_info(&self) -> Result<SiteInfo>;

    /// Uploads the package into the draft area.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::UploadError`.
    async fn upload(&self, package: &ContentPackage) -> Result<UploadedFile>;

    /// Creates an H5P activity from an uploaded package and returns its id.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::RegistrationError`.
    async fn register(&self, upload: &UploadedFile, name: &str) -> Result<u64>;

    /// Lists the file names stored under the upload's draft item.
    async fn draft_files(&self, upload: &UploadedFile) -> Result<Vec<String>>;

    /// Lists the activities in the course.
    async fn course_activities(&self) -> Result<Vec<CourseActivity>>;

    /// Enrolls users in the course with `role_id`.
    async fn enrol(&self, user_ids: &[u64], role_id: u32) -> Result<()>;

    /// Reads learner attempts on an activity.
    async fn progress(&self, activity_id: u64, lesson_id: &str) -> Result<Vec<ProgressRecord>>;
}

// ============================================================================
// Moodle client
// ============================================================================

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    h5pactivityid: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct UploadEntry {
    itemid: u64,
    #[serde(default)]
    contextid: Option<u64>,
    #[serde(default)]
    filename: String,
}

#[derive(Debug, Deserialize)]
struct FilesResponse {
    #[serde(default)]
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    filename: String,
}

#[derive(Debug, Deserialize)]
struct CourseSection {
    #[serde(default)]
    modules: Vec<CourseActivity>,
}

#[derive(Debug, Deserialize)]
struct AttemptsResponse {
    #[serde(default)]
    usersattempts: Vec<UserAttempts>,
}

#[derive(Debug, Deserialize)]
struct UserAttempts {
    userid: u64,
    #[serde(default)]
    attempts: Vec<Attempt>,
}

#[derive(Debug, Deserialize)]
struct Attempt {
    #[serde(default)]
    timemodified: i64,
    #[serde(default)]
    rawscore: Option<f64>,
    #[serde(default)]
    maxscore: Option<f64>,
    #[serde(default)]
    scaled: Option<f64>,
}

impl Attempt {
    fn score(&self) -> f64 {
        match (self.scaled, self.rawscore, self.maxscore) {
            (Some(scaled), _, _) => scaled,
            (None, Some(raw), Some(max)) if max > 0.0 => raw / max,
            _ => 0.0,
        }
    }
}

/// Moodle web-services client.
#[derive(Clone)]
pub struct MoodleClient {
    base_url: String,
    token: String,
    course_id: u64,
    section_id: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for MoodleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoodleClient")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .field("course_id", &self.course_id)
            .finish_non_exhaustive()
    }
}

impl MoodleClient {
    /// Creates a client for the site at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        course_id: u64,
        section_id: u32,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            course_id,
            section_id,
            client: build_client(timeout)?,
        })
    }

    /// Creates a client from the `platform` config section.
    pub fn from_config(config: &Config) -> Result<Self> {
        let url = config.platform.require_url()?;
        let course_id = config.platform.require_course_id()?;
        let token = api_key("moodle", &config.platform.token_env)?;
        Self::new(
            url,
            token,
            course_id,
            config.platform.section_id,
            config.request_timeout(),
        )
    }

    /// Calls a REST web-service function and returns its JSON result.
    async fn call(
        &self,
        function: &str,
        params: &[(String, String)],
    ) -> std::result::Result<Value, (ServiceErrorKind, String)> {
        let url = format!("{}/webservice/rest/server.php", self.base_url);
        let mut form: Vec<(String, String)> = vec![
            ("wstoken".to_string(), self.token.clone()),
            ("wsfunction".to_string(), function.to_string()),
            ("moodlewsrestformat".to_string(), "json".to_string()),
        ];
        form.extend_from_slice(params);

        tracing::debug!(function, "Calling Moodle web service");
        let response = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| send_error(&e, function))?;
        let value: Value = read_json(response, function).await?;
        check_exception(&value, function)?;
        Ok(value)
    }

    async fn call_as<T: serde::de::DeserializeOwned>(
        &self,
        function: &str,
        params: &[(String, String)],
    ) -> std::result::Result<T, (ServiceErrorKind, String)> {
        let value = self.call(function, params).await?;
        serde_json::from_value(value).map_err(|e| {
            (
                ServiceErrorKind::Malformed,
                format!("{function} returned an unexpected shape: {e}"),
            )
        })
    }
}

/// Moodle reports failures with HTTP 200 and an `exception` or `errorcode`
/// object.
fn check_exception(value: &Value, function: &str) -> std::result::Result<(), (ServiceErrorKind, String)> {
    let Some(object) = value.as_object() else {
        return Ok(());
    };
    if !object.contains_key("exception") && !object.contains_key("errorcode") {
        return Ok(());
    }

    let code = object
        .get("errorcode")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let message = object
        .get("message")
        .or_else(|| object.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    let kind = match code {
        "invalidtoken" | "accessexception" | "nopermissions" | "requireloginerror" => {
            ServiceErrorKind::Authentication
        }
        _ => ServiceErrorKind::Other,
    };
    Err((kind, format!("{function} failed [{code}]: {message}")))
}

fn param(key: impl Into<String>, value: impl ToString) -> (String, String) {
    (key.into(), value.to_string())
}

#[async_trait]
impl Platform for MoodleClient {
    async fn site_info(&self) -> Result<SiteInfo> {
        self.call_as("core_webservice_get_site_info", &[])
            .await
            .map_err(|(kind, message)| PipelineError::platform(kind, message))
    }

    async fn upload(&self, package: &ContentPackage) -> Result<UploadedFile> {
        let url = format!("{}/webservice/upload.php", self.base_url);
        let file_name = package.file_name();
        let part = reqwest::multipart::Part::bytes(package.bytes.clone())
            .file_name(file_name.clone())
            .mime_str("application/zip")
            .map_err(|e| PipelineError::upload(ServiceErrorKind::Other, e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("token", self.token.clone())
            .text("filearea", "draft")
            .text("itemid", "0")
            .part("file", part);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                let (kind, message) = send_error(&e, "upload.php");
                PipelineError::upload(kind, message)
            })?;

        let value: Value = read_json(response, "upload.php")
            .await
            .map_err(|(kind, message)| PipelineError::upload(kind, message))?;
        check_exception(&value, "upload.php")
            .map_err(|(kind, message)| PipelineError::upload(kind, message))?;

        let entries: Vec<UploadEntry> = serde_json::from_value(value).map_err(|e| {
            PipelineError::upload(
                ServiceErrorKind::Malformed,
                format!("upload.php returned an unexpected shape: {e}"),
            )
        })?;
        let entry = entries.into_iter().next().ok_or_else(|| {
            PipelineError::upload(ServiceErrorKind::Malformed, "upload.php returned no files")
        })?;

        Ok(UploadedFile {
            item_id: entry.itemid,
            context_id: entry.contextid,
            file_name: if entry.filename.is_empty() {
                file_name
            } else {
                entry.filename
            },
        })
    }

    async fn register(&self, upload: &UploadedFile, name: &str) -> Result<u64> {
        let params = [
            param("h5pactivity[course]", self.course_id),
            param("h5pactivity[name]", name),
            param("h5pactivity[intro]", format!("Generated H5P activity: {name}")),
            param("h5pactivity[introformat]", 1),
            param("h5pactivity[section]", self.section_id),
            param("h5pactivity[visible]", 1),
            param("h5pactivity[displayoptions]", 0),
            param("h5pfile", upload.item_id),
        ];
        let response: RegisterResponse = self
            .call_as("mod_h5pactivity_add_instance", &params)
            .await
            .map_err(|(kind, message)| PipelineError::registration(kind, upload.item_id, message))?;

        response.h5pactivityid.ok_or_else(|| {
            PipelineError::registration(
                ServiceErrorKind::Malformed,
                upload.item_id,
                "response has no h5pactivityid",
            )
        })
    }

    async fn draft_files(&self, upload: &UploadedFile) -> Result<Vec<String>> {
        let mut params = vec![
            param("component", "user"),
            param("filearea", "draft"),
            param("itemid", upload.item_id),
            param("filepath", "/"),
            param("filename", ""),
        ];
        if let Some(context_id) = upload.context_id {
            params.push(param("contextid", context_id));
        } else {
            let site = self.site_info().await?;
            params.push(param("contextid", -1));
            params.push(param("contextlevel", "user"));
            params.push(param("instanceid", site.userid));
        }

        let response: FilesResponse = self
            .call_as("core_files_get_files", &params)
            .await
            .map_err(|(kind, message)| PipelineError::platform(kind, message))?;
        Ok(response.files.into_iter().map(|f| f.filename).collect())
    }

    async fn course_activities(&self) -> Result<Vec<CourseActivity>> {
        let sections: Vec<CourseSection> = self
            .call_as("core_course_get_contents", &[param("courseid", self.course_id)])
            .await
            .map_err(|(kind, message)| PipelineError::platform(kind, message))?;
        Ok(sections.into_iter().flat_map(|s| s.modules).collect())
    }

    async fn enrol(&self, user_ids: &[u64], role_id: u32) -> Result<()> {
        let params: Vec<(String, String)> = user_ids
            .iter()
            .enumerate()
            .flat_map(|(i, user_id)| {
                [
                    param(format!("enrolments[{i}][roleid]"), role_id),
                    param(format!("enrolments[{i}][userid]"), user_id),
                    param(format!("enrolments[{i}][courseid]"), self.course_id),
                ]
            })
            .collect();
        self.call("enrol_manual_enrol_users", &params)
            .await
            .map_err(|(kind, message)| PipelineError::platform(kind, message))?;
        Ok(())
    }

    async fn progress(&self, activity_id: u64, lesson_id: &str) -> Result<Vec<ProgressRecord>> {
        let response: AttemptsResponse = self
            .call_as(
                "mod_h5pactivity_get_attempts",
                &[param("h5pactivityid", activity_id)],
            )
            .await
            .map_err(|(kind, message)| PipelineError::platform(kind, message))?;

        Ok(response
            .usersattempts
            .into_iter()
            .flat_map(|user| {
                let user_id = user.userid;
                user.attempts.into_iter().map(move |attempt| ProgressRecord {
                    user_id,
                    lesson_id: lesson_id.to_string(),
                    score: attempt.score(),
                    timestamp: DateTime::from_timestamp(attempt.timemodified, 0)
                        .unwrap_or_default(),
                })
            })
            .collect())
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Remote state of one lesson package as seen by `verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    /// The uploaded file is present in the draft area.
    pub package_present: bool,
    /// A matching H5P activity is in the course contents.
    pub registered: bool,
    /// The matching activity, if found.
    pub activity: Option<CourseActivity>,
}

impl Verification {
    /// Uploaded but absent from the enrolled content.
    #[must_use]
    pub const fn needs_reconciliation(&self) -> bool {
        self.package_present && !self.registered
    }
}

/// The Publisher stage.
pub struct Publisher {
    platform: Box<dyn Platform>,
    upload_retry: RetryPolicy,
    upload_pause: Duration,
    student_role_id: u32,
    access_checked: AtomicBool,
}

impl Publisher {
    /// Creates a publisher with default settings.
    #[must_use]
    pub fn new(platform: Box<dyn Platform>) -> Self {
        Self::from_config(platform, &Config::default())
    }

    /// Creates a publisher using retry and pause settings from config.
    #[must_use]
    pub fn from_config(platform: Box<dyn Platform>, config: &Config) -> Self {
        Self {
            platform,
            upload_retry: RetryPolicy::from_config(&config.retry, config.retry.upload_attempts),
            upload_pause: Duration::from_millis(config.platform.upload_pause_ms),
            student_role_id: config.platform.student_role_id,
            access_checked: AtomicBool::new(false),
        }
    }

    /// Overrides the upload retry policy.
    #[must_use]
    pub fn with_upload_retry(mut self, retry: RetryPolicy) -> Self {
        self.upload_retry = retry;
        self
    }

    /// Overrides the pause between batch uploads.
    #[must_use]
    pub const fn with_upload_pause(mut self, pause: Duration) -> Self {
        self.upload_pause = pause;
        self
    }

    /// Checks that the platform accepts the token.
    pub async fn check_access(&self) -> Result<SiteInfo> {
        let site = self.platform.site_info().await?;
        tracing::info!(site = %site.sitename, user = %site.username, "Moodle access confirmed");
        self.access_checked.store(true, Ordering::SeqCst);
        Ok(site)
    }

    /// Uploads `package`, checking access first if not yet done.
    pub async fn upload(&self, package: &ContentPackage) -> Result<UploadedFile> {
        if !self.access_checked.load(Ordering::SeqCst) {
            self.check_access().await?;
        }
        tracing::info!(file = %package.file_name(), bytes = package.len(), "Uploading package");
        let uploaded = self
            .upload_retry
            .run("upload", || self.platform.upload(package))
            .await?;
        tracing::info!(item_id = uploaded.item_id, "Package uploaded");
        Ok(uploaded)
    }

    /// Registers an uploaded package as an activity. Never retried.
    pub async fn register(&self, uploaded: &UploadedFile, name: &str) -> Result<u64> {
        let activity_id = self.platform.register(uploaded, name).await?;
        tracing::info!(item_id = uploaded.item_id, activity_id, name, "Activity registered");
        Ok(activity_id)
    }

    /// Waits between uploads of a batch.
    pub async fn pause(&self) {
        if !self.upload_pause.is_zero() {
            tokio::time::sleep(self.upload_pause).await;
        }
    }

    /// Compares an upload with the course contents.
    ///
    /// The activity matches by `activity_id` when known, otherwise by name.
    pub async fn verify(
        &self,
        uploaded: &UploadedFile,
        name: &str,
        activity_id: Option<u64>,
    ) -> Result<Verification> {
        let files = self.platform.draft_files(uploaded).await?;
        let package_present = files.iter().any(|f| *f == uploaded.file_name);

        let activity = self
            .platform
            .course_activities()
            .await?
            .into_iter()
            .filter(|a| a.modname == H5P_MODULE)
            .find(|a| match activity_id {
                Some(id) => a.instance == Some(id),
                None => a.name == name,
            });

        Ok(Verification {
            package_present,
            registered: activity.is_some(),
            activity,
        })
    }

    /// Enrolls learners in the course with the configured student role.
    pub async fn enroll(&self, user_ids: &[u64]) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        self.platform.enrol(user_ids, self.student_role_id).await?;
        tracing::info!(count = user_ids.len(), role_id = self.student_role_id, "Learners enrolled");
        Ok(())
    }

    /// Reads learner progress on a lesson's activity.
    pub async fn progress(&self, activity_id: u64, lesson_id: &str) -> Result<Vec<ProgressRecord>> {
        self.platform.progress(activity_id, lesson_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    #[test]
    fn test_check_exception() {
        assert!(check_exception(&json!({"sitename": "x"}), "f").is_ok());
        assert!(check_exception(&json!([1]), "f").is_ok());
        assert!(check_exception(&Value::Null, "f").is_ok());

        let (kind, message) = check_exception(
            &json!({"exception": "moodle_exception", "errorcode": "invalidtoken", "message": "Invalid token"}),
            "core_webservice_get_site_info",
        )
        .unwrap_err();
        assert_eq!(kind, ServiceErrorKind::Authentication);
        assert!(message.contains("Invalid token"));

        let (kind, _) = check_exception(
            &json!({"error": "bad", "errorcode": "invalidparameter"}),
            "upload.php",
        )
        .unwrap_err();
        assert_eq!(kind, ServiceErrorKind::Other);
    }

    #[test]
    fn test_debug_redacts_token() {
        let client =
            MoodleClient::new("https://moodle.example/", "ws-secret", 7, 0, Duration::from_secs(5)).unwrap();
        let debug = format!("{client:?}");
        assert!(debug.contains("https://moodle.example"));
        assert!(!debug.contains("ws-secret"));
    }

    #[test]
    fn test_attempt_score() {
        let scaled = Attempt { timemodified: 0, rawscore: Some(3.0), maxscore: Some(4.0), scaled: Some(0.5) };
        assert!((scaled.score() - 0.5).abs() < f64::EPSILON);
        let raw = Attempt { timemodified: 0, rawscore: Some(3.0), maxscore: Some(4.0), scaled: None };
        assert!((raw.score() - 0.75).abs() < f64::EPSILON);
        let none = Attempt { timemodified: 0, rawscore: None, maxscore: Some(0.0), scaled: None };
        assert!(none.score().abs() < f64::EPSILON);
    }

    /// In-memory platform that records calls.
    #[derive(Default)]
    struct FakePlatform {
        calls: Arc<Mutex<Vec<String>>>,
        fail_upload_times: Mutex<u32>,
        fail_register: bool,
        activities: Vec<CourseActivity>,
    }

    #[async_trait]
    impl Platform for FakePlatform {
        async fn site_info(&self) -> Result<SiteInfo> {
            self.calls.lock().unwrap().push("site_info".to_string());
            Ok(SiteInfo {
                sitename: "Kotoba".to_string(),
                username: "bot".to_string(),
                userid: 2,
            })
        }

        async fn upload(&self, package: &ContentPackage) -> Result<UploadedFile> {
            self.calls.lock().unwrap().push("upload".to_string());
            let mut remaining = self.fail_upload_times.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PipelineError::upload(ServiceErrorKind::Server, "502"));
            }
            Ok(UploadedFile {
                item_id: 77,
                context_id: Some(5),
                file_name: package.file_name(),
            })
        }

        async fn register(&self, upload: &UploadedFile, _name: &str) -> Result<u64> {
            self.calls.lock().unwrap().push("register".to_string());
            if self.fail_register {
                return Err(PipelineError::registration(
                    ServiceErrorKind::Server,
                    upload.item_id,
                    "503",
                ));
            }
            Ok(9)
        }

        async fn draft_files(&self, upload: &UploadedFile) -> Result<Vec<String>> {
            Ok(vec![upload.file_name.clone()])
        }

        async fn course_activities(&self) -> Result<Vec<CourseActivity>> {
            Ok(self.activities.clone())
        }

        async fn enrol(&self, user_ids: &[u64], role_id: u32) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("enrol {user_ids:?} as {role_id}"));
            Ok(())
        }

        async fn progress(&self, _activity_id: u64, lesson_id: &str) -> Result<Vec<ProgressRecord>> {
            Ok(vec![ProgressRecord {
                user_id: 3,
                lesson_id: lesson_id.to_string(),
                score: 1.0,
                timestamp: Utc::now(),
            }])
        }
    }

    fn package() -> ContentPackage {
        ContentPackage {
            lesson_id: "ch1".to_string(),
            content_type: kotoba_h5p::ContentType::Quiz,
            title: "ch1".to_string(),
            bytes: vec![0x50, 0x4b],
        }
    }

    fn publisher(platform: FakePlatform) -> Publisher {
        Publisher::new(Box::new(platform))
            .with_upload_retry(RetryPolicy::new(3, Duration::ZERO, 2))
            .with_upload_pause(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_upload_checks_access_once_and_retries() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let platform = FakePlatform {
            calls: Arc::clone(&calls),
            fail_upload_times: Mutex::new(1),
            ..Default::default()
        };
        let publisher = publisher(platform);

        let uploaded = publisher.upload(&package()).await.unwrap();
        assert_eq!(uploaded.item_id, 77);
        publisher.upload(&package()).await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(*calls, vec!["site_info", "upload", "upload", "upload"]);
    }

    #[tokio::test]
    async fn test_registration_is_not_retried() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let platform = FakePlatform {
            calls: Arc::clone(&calls),
            fail_register: true,
            ..Default::default()
        };
        let publisher = publisher(platform);
        let uploaded = publisher.upload(&package()).await.unwrap();

        let err = publisher.register(&uploaded, "ch1").await.unwrap_err();
        assert!(matches!(err, PipelineError::RegistrationError { package_id: 77, .. }));
        let registers = calls.lock().unwrap().iter().filter(|c| *c == "register").count();
        assert_eq!(registers, 1);
    }

    #[tokio::test]
    async fn test_verify_detects_unregistered_upload() {
        let publisher = publisher(FakePlatform {
            activities: vec![CourseActivity {
                id: 1,
                name: "other".to_string(),
                modname: "h5pactivity".to_string(),
                instance: Some(1),
            }],
            ..Default::default()
        });
        let uploaded = UploadedFile {
            item_id: 77,
            context_id: Some(5),
            file_name: "ch1_quiz.h5p".to_string(),
        };

        let verification = publisher.verify(&uploaded, "ch1", None).await.unwrap();
        assert!(verification.package_present);
        assert!(!verification.registered);
        assert!(verification.needs_reconciliation());
    }

    #[tokio::test]
    async fn test_verify_matches_by_activity_id() {
        let publisher = publisher(FakePlatform {
            activities: vec![
                CourseActivity {
                    id: 10,
                    name: "ch1".to_string(),
                    modname: "page".to_string(),
                    instance: Some(9),
                },
                CourseActivity {
                    id: 11,
                    name: "renamed".to_string(),
                    modname: "h5pactivity".to_string(),
                    instance: Some(9),
                },
            ],
            ..Default::default()
        });
        let uploaded = UploadedFile {
            item_id: 77,
            context_id: None,
            file_name: "ch1_quiz.h5p".to_string(),
        };

        let verification = publisher.verify(&uploaded, "ch1", Some(9)).await.unwrap();
        assert!(verification.registered);
        assert_eq!(verification.activity.unwrap().id, 11);
    }

    #[tokio::test]
    async fn test_enroll_uses_student_role() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let publisher = publisher(FakePlatform {
            calls: Arc::clone(&calls),
            ..Default::default()
        });
        publisher.enroll(&[]).await.unwrap();
        publisher.enroll(&[3, 4]).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["enrol [3, 4] as 5"]);
    }

    #[tokio::test]
    async fn test_progress_is_read_through() {
        let publisher = publisher(FakePlatform::default());
        let records = publisher.progress(9, "ch1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].lesson_id, "ch1");
    }
}
