/// Submission Pipeline - High-Level Orchestration
///
/// **Responsibility:**
/// Sequence workspace staging, compilation and test execution for one
/// submission, then hand the collected results to the aggregator.
///
/// **Guarantees:**
/// - Always returns a well-formed JobResult; infrastructure failures become IE
/// - Compile failures become CE with no test results
/// - Every staged file is removed before returning, on every path
///
/// This module is the glue layer - it knows nothing about:
/// - How scripts are launched (engine's job)
/// - How the final verdict is chosen (evaluator's job)

use crate::compiler;
use crate::engine::{CompileStatus, ScriptEngine};
use crate::evaluator;
use crate::runner::TestRunner;
use crate::workspace::Workspace;
use arbiter_common::config::PathConfig;
use arbiter_common::types::{JobResult, ProblemData, SubmissionData};
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct Pipeline {
    engine: Arc<dyn ScriptEngine>,
    paths: PathConfig,
}

impl Pipeline {
    pub fn new(engine: Arc<dyn ScriptEngine>, paths: PathConfig) -> Self {
        Self { engine, paths }
    }

    #[tracing::instrument(
        skip_all,
        fields(
            submission_id = %submission.id,
            slug = %problem.slug,
            language = %problem.language.name,
        )
    )]
    pub async fn process_submission(
        &self,
        submission: &SubmissionData,
        problem: &ProblemData,
    ) -> JobResult {
        // Dropping the workspace deletes everything registered with it
        let mut workspace = Workspace::allocate(&self.paths.code_dir, &problem.language);

        if let Err(e) = workspace.stage_source(&submission.source_code).await {
            error!(error = %e, "Failed to stage source code");
            return JobResult::default();
        }
        debug!(source = %workspace.source_path().display(), "Source staged");

        if problem.language.is_compiled {
            match compiler::compile_submission(self.engine.as_ref(), &mut workspace, &problem.language)
                .await
            {
                Ok(CompileStatus::Compiled) => {}
                Ok(CompileStatus::Failed { .. }) => return JobResult::compile_error(),
                Err(e) => {
                    error!(error = %e, "Failed to run compile script");
                    return JobResult::default();
                }
            }
        }

        let run = TestRunner::new(self.engine.as_ref(), &self.paths)
            .run(&mut workspace, problem)
            .await;
        let result = evaluator::aggregate_results(run);
        debug!(files = workspace.registered().len(), "Releasing workspace");

        info!(
            verdict = %result.verdict,
            cpu_time = result.cpu_time,
            memory = result.memory,
            samples = result.sample_test_results.len(),
            hidden = result.hidden_test_results.len(),
            "Submission judged"
        );
        result
    }
}
