/// Script Engine - the boundary to the external compile and judge contracts
///
/// **Core Responsibility:**
/// Launch the scripts that compile a submission and judge one test, and
/// translate their exit status and output into typed results.
///
/// **Architectural Boundary:**
/// - Engine knows HOW to launch the scripts (argv, working directory, timeout)
/// - Engine does NOT sandbox anything itself; the judge script owns limits
/// - Engine does NOT decide verdicts; it reports what the scripts said
///
/// Both scripts run with the scripts root as working directory, so every
/// path handed to them is relative to that root.

use crate::error::EngineError;
use arbiter_common::config::ScriptConfig;
use arbiter_common::types::JudgeOutput;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, warn};

/// Outcome of a compile script that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileStatus {
    Compiled,
    Failed { exit_code: Option<i32> },
}

/// Positional arguments of one judge invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeRequest {
    pub slug: String,
    /// Executable (or extensionless source) path, relative to the scripts root
    pub exec_path: PathBuf,
    pub language: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub mem_lim: u64,
    pub time_lim: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Run `compile <language> <workspace-id>`
    async fn compile(&self, language: &str, workspace_id: &str)
        -> Result<CompileStatus, EngineError>;

    /// Run the judge for one test and parse the document it prints
    async fn judge(&self, request: &JudgeRequest) -> Result<JudgeOutput, EngineError>;
}

/// Production engine: spawns the configured commands as child processes
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    scripts_dir: PathBuf,
    scripts: ScriptConfig,
}

impl ProcessEngine {
    pub fn new(scripts_dir: PathBuf, scripts: ScriptConfig) -> Self {
        Self { scripts_dir, scripts }
    }

    fn command(
        &self,
        kind: &'static str,
        argv: &[String],
        args: Vec<String>,
    ) -> Result<(Command, String), EngineError> {
        let (program, prefix) = argv.split_first().ok_or(EngineError::EmptyCommand(kind))?;

        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .args(&args)
            .current_dir(&self.scripts_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let shown = argv
            .iter()
            .chain(args.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        Ok((cmd, shown))
    }

    /// Spawn and wait, enforcing the configured timeout.
    /// The child is killed if the timeout drops it.
    async fn run(&self, mut cmd: Command, shown: &str) -> Result<Output, EngineError> {
        let child = cmd.spawn().map_err(|source| EngineError::Spawn {
            command: shown.to_string(),
            source,
        })?;

        let wait = child.wait_with_output();
        let output = match self.scripts.timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| EngineError::TimedOut {
                    command: shown.to_string(),
                    timeout,
                })?,
            None => wait.await,
        };

        output.map_err(|source| EngineError::Wait {
            command: shown.to_string(),
            source,
        })
    }
}

#[async_trait]
impl ScriptEngine for ProcessEngine {
    async fn compile(
        &self,
        language: &str,
        workspace_id: &str,
    ) -> Result<CompileStatus, EngineError> {
        let (cmd, shown) = self.command(
            "compile",
            &self.scripts.compile_command,
            vec![language.to_string(), workspace_id.to_string()],
        )?;
        debug!(command = %shown, "Starting compile script");

        let output = self.run(cmd, &shown).await?;
        if output.status.success() {
            return Ok(CompileStatus::Compiled);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            exit_code = ?output.status.code(),
            error_preview = stderr.lines().next().unwrap_or(""),
            "Compile script reported failure"
        );
        Ok(CompileStatus::Failed {
            exit_code: output.status.code(),
        })
    }

    async fn judge(&self, request: &JudgeRequest) -> Result<JudgeOutput, EngineError> {
        let args = vec![
            request.slug.clone(),
            request.exec_path.to_string_lossy().into_owned(),
            request.language.clone(),
            request.input_path.to_string_lossy().into_owned(),
            request.output_path.to_string_lossy().into_owned(),
            request.mem_lim.to_string(),
            request.time_lim.to_string(),
            self.scripts.checker.clone(),
        ];
        let (cmd, shown) = self.command("judge", &self.scripts.judge_command, args)?;
        debug!(command = %shown, "Starting judge script");

        let output = self.run(cmd, &shown).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                status = %output.status,
                error_preview = stderr.lines().next().unwrap_or(""),
                "Judge script failed"
            );
            return Err(EngineError::ExitStatus {
                command: shown,
                status: output.status,
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}
