//! Kotoba Forge CLI
//!
//! Generates Japanese lessons, packages them as H5P and publishes them to
//! Moodle.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use kotoba_h5p::ContentType;
use kotoba_pipeline::{
    package_file, timestamped_lesson_id, ChatCompletionsModel, Config, Extractor, Generator,
    HttpRecognizer, LessonRequest, MoodleClient, Pipeline, PipelineError, ProgressRecord,
    Publisher, RetryPolicy, RunOptions, RunRecord, RunStage, TaskDirective, Verification,
};
use tracing_subscriber::EnvFilter;

/// Exit code when an operator has to fix something before the lesson can
/// continue.
const EXIT_OPERATOR: u8 = 2;

/// Kotoba Forge - Japanese lesson authoring pipeline
///
/// Generates lesson content with a language model, packages it as H5P and
/// publishes it to a Moodle course.
#[derive(Parser, Debug)]
#[command(name = "kotoba")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (default: kotoba.json in current directory)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Output directory for lesson artifacts
    #[arg(short, long, value_name = "DIR", global = true)]
    output_dir: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate, package and publish one lesson
    Run(RunArgs),

    /// Continue a reviewed lesson from its saved content
    Resume {
        /// Lesson to resume
        lesson_id: String,

        /// Package but do not upload
        #[arg(long)]
        skip_publish: bool,
    },

    /// Package a loose content JSON file
    Package {
        /// Content JSON file
        input: PathBuf,

        /// Content type (detected from the file when omitted)
        #[arg(long, value_name = "TYPE")]
        content_type: Option<ContentType>,
    },

    /// Publish packaged lessons
    Publish {
        /// Lessons to publish, in order
        #[arg(required = true)]
        lesson_ids: Vec<String>,
    },

    /// Check whether a lesson's package is uploaded and registered
    Verify {
        /// Lesson to check
        lesson_id: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Enroll learners in the course as students
    Enroll {
        /// Moodle user ids
        #[arg(required = true)]
        user_ids: Vec<u64>,
    },

    /// Show learner progress on a published lesson
    Progress {
        /// Lesson to report on
        lesson_id: String,

        /// Print the records as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Lesson id (default: lesson_<timestamp>)
    #[arg(long)]
    lesson_id: Option<String>,

    /// Content type: dialog_cards, course_presentation, quiz or fill_blanks
    #[arg(long, value_name = "TYPE")]
    content_type: Option<ContentType>,

    /// Task directive markdown file
    #[arg(long, value_name = "FILE")]
    task_file: Option<String>,

    /// Scanned source document to run through text recognition
    #[arg(long, value_name = "FILE")]
    source: Option<PathBuf>,

    /// Grammar point the lesson teaches
    #[arg(long)]
    grammar_point: Option<String>,

    /// JLPT level
    #[arg(long)]
    level: Option<String>,

    /// Stop after generation so the content can be reviewed
    #[arg(long)]
    review: bool,

    /// Package but do not upload
    #[arg(long)]
    skip_publish: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!(config = ?cli.config, "Config file");

    match run_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            let needs_operator = e
                .downcast_ref::<PipelineError>()
                .is_some_and(PipelineError::requires_operator);
            ExitCode::from(if needs_operator { EXIT_OPERATOR } else { 1 })
        }
    }
}

async fn run_command(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = load_config(cli.config.as_deref())?;
    config.apply_env_overrides()?;
    if let Some(ref output_dir) = cli.output_dir {
        config.output_dir.clone_from(output_dir);
    }

    match cli.command {
        Command::Run(args) => run_lesson(config, args).await,
        Command::Resume {
            lesson_id,
            skip_publish,
        } => resume_lesson(&config, &lesson_id, skip_publish).await,
        Command::Package {
            input,
            content_type,
        } => package_input(&config, &input, content_type).await,
        Command::Publish { lesson_ids } => publish_lessons(&config, &lesson_ids).await,
        Command::Verify { lesson_id, json } => verify_lesson(&config, &lesson_id, json).await,
        Command::Enroll { user_ids } => enroll_users(&config, &user_ids).await,
        Command::Progress { lesson_id, json } => show_progress(&config, &lesson_id, json).await,
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn run_lesson(mut config: Config, args: RunArgs) -> anyhow::Result<ExitCode> {
    // Apply CLI argument overrides
    if let Some(content_type) = args.content_type {
        config.content_type = content_type;
    }
    if let Some(ref task_file) = args.task_file {
        config.task_file.clone_from(task_file);
    }
    if let Some(ref level) = args.level {
        config.level.clone_from(level);
    }

    // Re-validate after overrides
    config.validate()?;
    print_config(&config);

    let lesson_id = args
        .lesson_id
        .unwrap_or_else(|| timestamped_lesson_id(&chrono::Local::now()));
    let directive = TaskDirective::load(&config.task_file)?;
    let mut request = LessonRequest::new(lesson_id, config.content_type, directive)?
        .with_level(config.level.clone());
    if let Some(grammar_point) = args.grammar_point {
        request = request.with_grammar_point(grammar_point);
    }
    if let Some(source) = args.source {
        request = request.with_source(source);
    }

    let mut pipeline = Pipeline::from_config(&config).with_generator(build_generator(&config)?);
    if request.source.is_some() {
        pipeline = pipeline.with_extractor(build_extractor(&config)?);
    }
    if !args.skip_publish && !args.review {
        if let Some(publisher) = build_optional_publisher(&config)? {
            pipeline = pipeline.with_publisher(publisher);
        }
    }

    println!();
    println!("Running lesson {}...", request.lesson_id);
    let options = RunOptions {
        review: args.review,
        skip_publish: args.skip_publish,
    };
    let record = pipeline.run(&request, options).await?;
    print_record(&record);
    Ok(ExitCode::SUCCESS)
}

async fn resume_lesson(
    config: &Config,
    lesson_id: &str,
    skip_publish: bool,
) -> anyhow::Result<ExitCode> {
    let mut pipeline = Pipeline::from_config(config);
    if !skip_publish {
        if let Some(publisher) = build_optional_publisher(config)? {
            pipeline = pipeline.with_publisher(publisher);
        }
    }

    println!("Resuming lesson {lesson_id}...");
    let options = RunOptions {
        review: false,
        skip_publish,
    };
    let record = pipeline.resume(lesson_id, options).await?;
    print_record(&record);
    Ok(ExitCode::SUCCESS)
}

async fn package_input(
    config: &Config,
    input: &Path,
    content_type: Option<ContentType>,
) -> anyhow::Result<ExitCode> {
    let packaged = package_file(input, content_type, &config.output_path()).await?;
    println!("Packaged {}", input.display());
    println!("  Content type: {}", packaged.package.content_type);
    println!("  Title: {}", packaged.package.title);
    println!("  Size: {} bytes", packaged.package.len());
    println!("  Written to: {}", packaged.path.display());
    Ok(ExitCode::SUCCESS)
}

async fn publish_lessons(config: &Config, lesson_ids: &[String]) -> anyhow::Result<ExitCode> {
    let pipeline = Pipeline::from_config(config).with_publisher(build_publisher(config)?);
    let reports = pipeline.publish_lessons(lesson_ids).await?;

    println!();
    println!("=== Publish Summary ===");
    let mut failed = 0;
    let mut needs_operator = false;
    for report in &reports {
        match &report.outcome {
            Ok(record) => println!(
                "  {}: published (activity {})",
                report.lesson_id,
                record.activity_id.unwrap_or_default()
            ),
            Err(e) => {
                failed += 1;
                needs_operator |= e.requires_operator();
                println!("  {}: failed ({})", report.lesson_id, first_line(&e.to_string()));
            }
        }
    }
    println!("Published {}/{}", reports.len() - failed, reports.len());

    Ok(match (failed, needs_operator) {
        (0, _) => ExitCode::SUCCESS,
        (_, true) => ExitCode::from(EXIT_OPERATOR),
        (_, false) => ExitCode::from(1),
    })
}

async fn verify_lesson(config: &Config, lesson_id: &str, json: bool) -> anyhow::Result<ExitCode> {
    let pipeline = Pipeline::from_config(config).with_publisher(build_publisher(config)?);
    let verification = pipeline.verify(lesson_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&verification)?);
    } else {
        print_verification(lesson_id, &verification);
    }

    Ok(if verification.needs_reconciliation() {
        ExitCode::from(EXIT_OPERATOR)
    } else {
        ExitCode::SUCCESS
    })
}

async fn enroll_users(config: &Config, user_ids: &[u64]) -> anyhow::Result<ExitCode> {
    let pipeline = Pipeline::from_config(config).with_publisher(build_publisher(config)?);
    pipeline.enroll(user_ids).await?;
    println!(
        "Enrolled {} learner(s) in course {}",
        user_ids.len(),
        config.platform.course_id.unwrap_or_default()
    );
    Ok(ExitCode::SUCCESS)
}

async fn show_progress(config: &Config, lesson_id: &str, json: bool) -> anyhow::Result<ExitCode> {
    let pipeline = Pipeline::from_config(config).with_publisher(build_publisher(config)?);
    let records = pipeline.progress(lesson_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print_progress(lesson_id, &records);
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Setup
// ============================================================================

/// Loads configuration from the specified path or default location.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Ok(Config::load_from_file(path)?)
        }
        None => Ok(Config::load()?),
    }
}

fn build_generator(config: &Config) -> anyhow::Result<Generator> {
    let model = ChatCompletionsModel::from_config(config)?;
    tracing::debug!(model = %model.model(), "Language model configured");
    Ok(Generator::from_config(Box::new(model), config))
}

fn build_extractor(config: &Config) -> anyhow::Result<Extractor> {
    let recognizer = HttpRecognizer::from_config(config)?;
    let retry = RetryPolicy::from_config(&config.retry, config.retry.recognition_attempts);
    Ok(Extractor::new(Box::new(recognizer)).with_retry(retry))
}

fn build_publisher(config: &Config) -> anyhow::Result<Publisher> {
    let client = MoodleClient::from_config(config)?;
    Ok(Publisher::from_config(Box::new(client), config))
}

/// Builds a publisher only when a platform URL is configured.
fn build_optional_publisher(config: &Config) -> anyhow::Result<Option<Publisher>> {
    if config.platform.url.is_none() {
        println!("No Moodle URL configured, the package will not be published");
        return Ok(None);
    }
    build_publisher(config).map(Some)
}

// ============================================================================
// Output
// ============================================================================

/// Prints the loaded configuration.
fn print_config(config: &Config) {
    println!("Configuration loaded:");
    println!("  Output directory: {}", config.output_dir);
    println!("  Task file: {}", config.task_file);
    println!("  Content type: {}", config.content_type);
    println!("  Level: {}", config.level);
    println!("  Model: {}", config.generation.model);
    if let Some(ref url) = config.platform.url {
        println!("  Moodle: {url}");
    }
}

/// Prints where a run ended and what it produced.
fn print_record(record: &RunRecord) {
    println!();
    println!("=== Lesson {} ===", record.lesson_id);
    println!("Stage: {}", record.stage);
    if let Some(ref path) = record.content_path {
        println!("  Content: {}", path.display());
    }
    if let Some(ref path) = record.script_path {
        println!("  Grammar script: {}", path.display());
    }
    if let Some(ref path) = record.package_path {
        println!("  Package: {}", path.display());
    }
    if let Some(item_id) = record.package_item_id {
        println!("  Uploaded as item {item_id}");
    }
    if let Some(activity_id) = record.activity_id {
        println!("  Activity id: {activity_id}");
    }

    match record.stage {
        RunStage::AwaitingReview => println!(
            "Review the content, then run: kotoba resume {}",
            record.lesson_id
        ),
        RunStage::Packaged => println!(
            "Publish with: kotoba publish {}",
            record.lesson_id
        ),
        _ => {}
    }
}

fn print_verification(lesson_id: &str, verification: &Verification) {
    println!("=== Verify {lesson_id} ===");
    println!(
        "Package in draft area: {}",
        if verification.package_present { "yes" } else { "no" }
    );
    match &verification.activity {
        Some(activity) => println!(
            "Registered in course: yes ({}, module {})",
            activity.name, activity.id
        ),
        None => println!("Registered in course: no"),
    }
    if verification.needs_reconciliation() {
        println!();
        println!("The package was uploaded but never registered.");
        println!("Add the H5P activity manually in Moodle from the uploaded draft.");
    }
}

fn print_progress(lesson_id: &str, records: &[ProgressRecord]) {
    println!("=== Progress {lesson_id} ===");
    if records.is_empty() {
        println!("No attempts yet");
        return;
    }
    for record in records {
        println!(
            "  user {:>6}  {:>5.1}%  {}",
            record.user_id,
            record.score * 100.0,
            record.timestamp.format("%Y-%m-%d %H:%M")
        );
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
