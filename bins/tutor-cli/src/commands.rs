// CLI commands for grading, running and queueing programs
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tutor_common::config::WorkerSettings;
use tutor_common::redis as queue;
use tutor_common::types::{parse_test_case_list, InvocationSpec, Job, JobPayload, TestCase};
use tutor_grader::{DockerBackend, Grader, IsolationRunner, RuntimeRegistry};
use uuid::Uuid;

/// Test cases as stored: a JSON list, or the literal-text form
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StoredTestCases {
    List(Vec<TestCase>),
    Text(String),
}

/// One entry of an exercise file
#[derive(Debug, Clone, Deserialize)]
pub struct Exercise {
    pub name: String,
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(alias = "mit_correct_solution")]
    pub solution: String,
    #[serde(default)]
    pub test_case_list: Option<StoredTestCases>,
}

impl Exercise {
    pub fn invocation(&self) -> InvocationSpec {
        InvocationSpec::from_question_metadata(self.function_name.as_deref(), self.class_name.as_deref())
    }

    /// `None` when the exercise has no test cases
    pub fn test_cases(&self) -> Result<Option<Vec<TestCase>>> {
        match &self.test_case_list {
            None => Ok(None),
            Some(StoredTestCases::List(cases)) => Ok(Some(cases.clone())),
            Some(StoredTestCases::Text(text)) => parse_test_case_list(text)
                .map(Some)
                .with_context(|| format!("Invalid test cases for exercise '{}'", self.name)),
        }
    }

    fn label(&self) -> String {
        match self.invocation() {
            InvocationSpec::FreeFunction { function_name } => format!("Function: {}", function_name),
            InvocationSpec::ClassMethod { class_name } => format!("Class: {}", class_name),
            InvocationSpec::BareScript => format!("Exercise: {}", self.name),
        }
    }
}

pub fn load_exercises(path: &Path) -> Result<Vec<Exercise>> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn build_grader(timeout_secs: Option<u64>, concurrency: Option<usize>) -> Result<(Grader, RuntimeRegistry)> {
    let settings = WorkerSettings::from_env()?;
    let registry = RuntimeRegistry::load_or_builtin(&settings.languages_config)?;
    let runner = IsolationRunner::new(Arc::new(DockerBackend::connect()?), settings.limits);

    let timeout = timeout_secs.map(Duration::from_secs).unwrap_or(settings.timeout);
    let grader = Grader::new(runner, registry.python()?.clone())
        .with_timeout(timeout)
        .with_concurrency(concurrency.unwrap_or(settings.concurrency));
    Ok((grader, registry))
}

/// Tally of a `grade` run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GradeSummary {
    pub graded: usize,
    pub fully_passing: usize,
    pub skipped: usize,
    pub invalid: usize,
}

/// Grade every exercise's reference solution against its own test cases
pub async fn grade_exercises(path: &Path, timeout_secs: Option<u64>, concurrency: Option<usize>) -> Result<()> {
    let exercises = load_exercises(path)?;
    let (grader, _) = build_grader(timeout_secs, concurrency)?;

    println!("🧪 Grading {} exercise(s) from {}\n", exercises.len(), path.display());

    let summary = grade_all(&grader, &exercises).await;

    println!(
        "\n📊 {}/{} exercise(s) fully passing ({} skipped, {} with invalid test cases)",
        summary.fully_passing, summary.graded, summary.skipped, summary.invalid
    );
    Ok(())
}

/// Grade each exercise in turn. Broken or missing test cases are reported
/// and skipped; they never stop the run.
pub async fn grade_all(grader: &Grader, exercises: &[Exercise]) -> GradeSummary {
    let mut summary = GradeSummary::default();
    for exercise in exercises {
        let test_cases = match exercise.test_cases() {
            Ok(Some(test_cases)) if !test_cases.is_empty() => test_cases,
            Ok(_) => {
                println!("⚠️  No test cases for {}", exercise.name);
                summary.skipped += 1;
                continue;
            }
            Err(e) => {
                println!("❌ {:#}", e);
                summary.invalid += 1;
                continue;
            }
        };

        let report = grader
            .grade_report(exercise.solution.trim(), &exercise.invocation(), &test_cases)
            .await;
        summary.graded += 1;
        if report.all_passed {
            summary.fully_passing += 1;
        }

        let mark = if report.all_passed { "✅" } else { "❌" };
        println!(
            "{} For {} | Results: {}/{}",
            mark,
            exercise.label(),
            report.passed_count(),
            report.verdicts.len()
        );
        if !report.all_passed {
            for (idx, verdict) in report.verdicts.iter().enumerate().filter(|(_, v)| !v.is_correct()) {
                println!("     #{} {}", idx + 1, verdict.test_input_to_code.replace('\n', "; "));
                match &verdict.error {
                    Some(error) => println!("        error: {}", error.lines().last().unwrap_or("")),
                    None => println!(
                        "        expected {} got {}",
                        verdict.expected_output,
                        verdict.program_output.as_ref().map(|v| v.to_literal()).unwrap_or_default()
                    ),
                }
            }
        }
    }
    summary
}

/// Run a single program in the sandbox and print its output
pub async fn run_file(path: &Path, language: &str, timeout_secs: Option<u64>) -> Result<()> {
    let code = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let (grader, registry) = build_grader(timeout_secs, None)?;
    let runtime = registry.get(language)?;

    println!("🚀 Running {} ({})\n", path.display(), runtime.name);
    let result = grader.execute(runtime, &code).await;

    print!("{}", result.raw_output);
    if !result.raw_output.ends_with('\n') {
        println!();
    }
    if result.success {
        println!("\n✅ Completed");
        Ok(())
    } else {
        bail!("program did not complete successfully")
    }
}

/// Queue a job read from a payload file and print its id
pub async fn submit_job(path: &Path, redis_url: &str, timeout_secs: Option<u64>) -> Result<Uuid> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let payload: JobPayload =
        serde_json::from_str(&content).with_context(|| format!("Invalid job payload in {}", path.display()))?;

    let mut job = Job::new(payload);
    job.timeout_secs = timeout_secs;

    let mut conn = connect(redis_url).await?;
    queue::push_job(&mut conn, &job).await.context("Failed to enqueue job")?;

    println!("📨 Submitted job {}", job.id);
    Ok(job.id)
}

/// Print a job's status and stored result
pub async fn fetch_result(job_id: Uuid, redis_url: &str) -> Result<()> {
    let mut conn = connect(redis_url).await?;

    let Some(status) = queue::get_status(&mut conn, &job_id).await? else {
        println!("⏳ No result yet for job {} (pending, or expired)", job_id);
        return Ok(());
    };
    println!("📋 Job {} | Status: {:?}\n", job_id, status);

    if let Some(result) = queue::get_result(&mut conn, &job_id).await? {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

/// List the runtimes the sandbox can use
pub fn list_languages() -> Result<()> {
    let settings = WorkerSettings::from_env()?;
    let registry = RuntimeRegistry::load_or_builtin(&settings.languages_config)?;

    println!("📋 Configured Languages:\n");
    println!("{:<12} {:<24} {:<24}", "Name", "Image", "Command");
    println!("{}", "─".repeat(60));
    for name in registry.list_languages() {
        let runtime = registry.get(&name)?;
        println!("{:<12} {:<24} {:<24}", runtime.name, runtime.image, runtime.command("/app").join(" "));
    }
    Ok(())
}

async fn connect(redis_url: &str) -> Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
    redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")
}
