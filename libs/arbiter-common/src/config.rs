// Worker configuration, built once at start-up and handed to every component
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_QUEUE: &str = "arbiter:queue:submissions";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub queue_name: String,
    pub worker_id: String,
    pub paths: PathConfig,
    pub scripts: ScriptConfig,
    pub max_concurrent_jobs: usize,
    pub poll_timeout: Duration,
}

/// On-disk layout used by the pipeline
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Staging directory for generated sources and binaries
    pub code_dir: PathBuf,
    /// Working directory of the compile and judge scripts
    pub scripts_dir: PathBuf,
    /// Test-case store, one subdirectory per problem slug
    pub test_cases_dir: PathBuf,
}

/// How the external compile and judge contracts are launched
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    pub compile_command: Vec<String>,
    pub judge_command: Vec<String>,
    pub checker: String,
    /// None means a script may run forever
    pub timeout: Option<Duration>,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            code_dir: PathBuf::from("worker/cache/code"),
            scripts_dir: PathBuf::from("worker/scripts"),
            test_cases_dir: PathBuf::from("worker/cache/test_cases"),
        }
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            compile_command: vec!["./compile.sh".to_string()],
            judge_command: vec!["python3".to_string(), "judge.py".to_string()],
            checker: "./THE_JUDGE.out".to_string(),
            timeout: None,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            queue_name: DEFAULT_QUEUE.to_string(),
            worker_id: uuid::Uuid::new_v4().to_string(),
            paths: PathConfig::default(),
            scripts: ScriptConfig::default(),
            max_concurrent_jobs: 8,
            poll_timeout: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let paths = PathConfig {
            code_dir: var("ARBITER_CODE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.paths.code_dir),
            scripts_dir: var("ARBITER_SCRIPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.paths.scripts_dir),
            test_cases_dir: var("ARBITER_TEST_CASES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.paths.test_cases_dir),
        };

        let timeout = match var("ARBITER_SCRIPT_TIMEOUT_SECS") {
            Some(raw) => Some(Duration::from_secs(
                raw.trim()
                    .parse()
                    .with_context(|| format!("Invalid ARBITER_SCRIPT_TIMEOUT_SECS: {}", raw))?,
            )),
            None => None,
        };

        let scripts = ScriptConfig {
            compile_command: var("ARBITER_COMPILE_COMMAND")
                .map(|raw| split_command(&raw))
                .unwrap_or(defaults.scripts.compile_command),
            judge_command: var("ARBITER_JUDGE_COMMAND")
                .map(|raw| split_command(&raw))
                .unwrap_or(defaults.scripts.judge_command),
            checker: var("ARBITER_CHECKER").unwrap_or(defaults.scripts.checker),
            timeout,
        };

        let max_concurrent_jobs = match var("ARBITER_MAX_JOBS") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid ARBITER_MAX_JOBS: {}", raw))?,
            None => defaults.max_concurrent_jobs,
        };
        if max_concurrent_jobs == 0 {
            bail!("ARBITER_MAX_JOBS must be at least 1");
        }

        let poll_timeout = match var("ARBITER_POLL_SECS") {
            Some(raw) => Duration::from_secs(
                raw.trim()
                    .parse()
                    .with_context(|| format!("Invalid ARBITER_POLL_SECS: {}", raw))?,
            ),
            None => defaults.poll_timeout,
        };

        Ok(Self {
            redis_url: var("REDIS_URL").unwrap_or(defaults.redis_url),
            queue_name: var("ARBITER_QUEUE").unwrap_or(defaults.queue_name),
            // A stable id lets the next boot recover this worker's processing list
            worker_id: var("ARBITER_WORKER_ID")
                .or_else(|| var("HOSTNAME"))
                .unwrap_or(defaults.worker_id),
            paths,
            scripts,
            max_concurrent_jobs,
            poll_timeout,
        })
    }
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}
