// CLI commands for operating an Arbiter worker
use anyhow::{bail, Context, Result};
use arbiter_common::config::PathConfig;
use arbiter_common::redis;
use arbiter_common::types::{JobData, Language, ProblemData, SampleTest, SubmissionData};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const EXAMPLE_JOB_FILE: &str = "job.example.json";

/// Create the directory layout a worker started from `path` expects
pub fn init_project(path: &Path) -> Result<()> {
    println!("🚀 Initializing Arbiter layout at: {}", path.display());

    let layout = PathConfig::default();
    for dir_path in layout_dirs(path) {
        fs::create_dir_all(&dir_path)
            .with_context(|| format!("Failed to create directory: {}", dir_path.display()))?;
        println!("  ✅ Created: {}", dir_path.display());
    }

    let example_path = path.join(EXAMPLE_JOB_FILE);
    if !example_path.exists() {
        let content = serde_json::to_string_pretty(&example_job())?;
        fs::write(&example_path, content)
            .with_context(|| format!("Failed to write {}", example_path.display()))?;
        println!("  ✅ Created: {}", example_path.display());
    }

    println!("✅ Layout initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Put compile.sh, judge.py and the checker in {}", layout.scripts_dir.display());
    println!("  2. Add hidden tests under {}/<slug>/{{input,output}}", layout.test_cases_dir.display());
    println!("  3. Submit a job: arbiter-cli submit --job {}", EXAMPLE_JOB_FILE);

    Ok(())
}

/// Directories `init` creates, rooted at `path`
fn layout_dirs(path: &Path) -> Vec<PathBuf> {
    let layout = PathConfig::default();
    [layout.code_dir, layout.scripts_dir, layout.test_cases_dir]
        .iter()
        .map(|dir| path.join(dir))
        .collect()
}

fn example_job() -> JobData {
    JobData {
        problem_data: ProblemData {
            slug: "a-plus-b".to_string(),
            time_lim: 1000,
            mem_lim: 65536,
            language: Language {
                name: "python".to_string(),
                extension: "py".to_string(),
                is_compiled: false,
            },
            sample_tests: vec![SampleTest {
                test_input: "1 2\n".to_string(),
                test_output: "3\n".to_string(),
            }],
            hidden_tests: vec![],
        },
        submission_data: SubmissionData {
            id: "example".to_string(),
            user_id: "local".to_string(),
            source_code: "a, b = map(int, input().split())\nprint(a + b)\n".to_string(),
            problem_id: "a-plus-b".to_string(),
            submission_time: "1970-01-01T00:00:00Z".to_string(),
        },
    }
}

pub fn load_job(job_file: &Path) -> Result<JobData> {
    let content = fs::read_to_string(job_file)
        .with_context(|| format!("Failed to read job file: {}", job_file.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job file: {}", job_file.display()))
}

/// Push a job, then block on a private reply list for the correlated result
pub async fn submit_job(job_file: &Path, redis_url: &str, queue: &str, timeout_secs: u64) -> Result<()> {
    let job = load_job(job_file)?;

    let client = ::redis::Client::open(redis_url).context("Invalid Redis URL")?;
    let mut conn = ::redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    let correlation_id = uuid::Uuid::new_v4().to_string();
    let reply_to = redis::reply_queue(&correlation_id);

    redis::push_job(&mut conn, queue, &correlation_id, &reply_to, &job)
        .await
        .context("Failed to push job")?;
    println!("📤 Submitted {} to '{}' (correlation id {})", job.submission_data.id, queue, correlation_id);

    let reply = redis::wait_reply(&mut conn, &reply_to, Duration::from_secs(timeout_secs))
        .await
        .context("Failed to read reply")?;

    let Some(reply) = reply else {
        bail!("No reply within {}s", timeout_secs);
    };
    if reply.correlation_id != correlation_id {
        bail!(
            "Reply correlation id {} does not match request {}",
            reply.correlation_id,
            correlation_id
        );
    }

    println!("{}", serde_json::to_string_pretty(&reply.body)?);
    Ok(())
}
