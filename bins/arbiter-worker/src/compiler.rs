// Compile step for compiled languages

use crate::engine::{CompileStatus, ScriptEngine};
use crate::error::EngineError;
use crate::workspace::Workspace;
use arbiter_common::types::Language;
use std::time::Instant;
use tracing::{info, warn};

/// Run the compile contract for the workspace's source.
///
/// The binary path is registered for cleanup before the script runs, so a
/// half-written executable never outlives the pipeline.
#[tracing::instrument(skip_all, fields(language = %language.name, workspace_id = %workspace.id()))]
pub async fn compile_submission(
    engine: &dyn ScriptEngine,
    workspace: &mut Workspace,
    language: &Language,
) -> Result<CompileStatus, EngineError> {
    let exec_path = workspace.exec_path().to_path_buf();
    workspace.register(exec_path);

    let start = Instant::now();
    let status = engine.compile(&language.name, workspace.id()).await?;
    let compilation_ms = start.elapsed().as_millis() as u64;

    match &status {
        CompileStatus::Compiled => info!(compilation_ms, "Compilation succeeded"),
        CompileStatus::Failed { exit_code } => {
            warn!(compilation_ms, exit_code = ?exit_code, "Compilation failed")
        }
    }
    Ok(status)
}
