// Test orchestration: samples first, then hidden tests, stopping at the
// first verdict that is not accepted

use crate::engine::{JudgeRequest, ScriptEngine};
use crate::error::PipelineError;
use crate::workspace::{ensure_dir, relative_to, Workspace};
use arbiter_common::config::PathConfig;
use arbiter_common::types::{ProblemData, TestResult};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    Sample,
    Hidden,
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestPhase::Sample => write!(f, "sample"),
            TestPhase::Hidden => write!(f, "hidden"),
        }
    }
}

/// How the test phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every test ran, or the run stopped on a non-accepted verdict
    Finished,
    /// Staging or the judge failed; the results are partial
    InternalError,
}

/// Results collected in execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRun {
    pub sample_results: Vec<TestResult>,
    pub hidden_results: Vec<TestResult>,
    pub outcome: RunOutcome,
}

impl TestRun {
    fn new() -> Self {
        Self {
            sample_results: Vec::new(),
            hidden_results: Vec::new(),
            outcome: RunOutcome::Finished,
        }
    }

    fn results_mut(&mut self, phase: TestPhase) -> &mut Vec<TestResult> {
        match phase {
            TestPhase::Sample => &mut self.sample_results,
            TestPhase::Hidden => &mut self.hidden_results,
        }
    }
}

/// One test ready to be judged
struct TestCase {
    phase: TestPhase,
    number: usize,
    input: PathBuf,
    output: PathBuf,
    mem_lim: u64,
    time_lim: u64,
}

pub struct TestRunner<'a> {
    engine: &'a dyn ScriptEngine,
    paths: &'a PathConfig,
}

impl<'a> TestRunner<'a> {
    pub fn new(engine: &'a dyn ScriptEngine, paths: &'a PathConfig) -> Self {
        Self { engine, paths }
    }

    #[tracing::instrument(skip_all, fields(slug = %problem.slug, workspace_id = %workspace.id()))]
    pub async fn run(&self, workspace: &mut Workspace, problem: &ProblemData) -> TestRun {
        let mut run = TestRun::new();
        if let Err(e) = self.run_tests(workspace, problem, &mut run).await {
            error!(error = %e, "Test run aborted with internal error");
            run.outcome = RunOutcome::InternalError;
        }
        run
    }

    async fn run_tests(
        &self,
        workspace: &mut Workspace,
        problem: &ProblemData,
        run: &mut TestRun,
    ) -> Result<(), PipelineError> {
        let problem_dir = self.paths.test_cases_dir.join(&problem.slug);
        let input_dir = problem_dir.join("input");
        let output_dir = problem_dir.join("output");
        ensure_dir(&input_dir).await?;
        ensure_dir(&output_dir).await?;

        let exec_path = relative_to(workspace.exec_path(), &self.paths.scripts_dir)?;

        for (idx, sample) in problem.sample_tests.iter().enumerate() {
            let number = idx + 1;
            // Prefixed with the workspace id: jobs on the same problem run concurrently
            let input = input_dir.join(format!("{}-sample-{}.in", workspace.id(), number));
            let output = output_dir.join(format!("{}-sample-{}.out", workspace.id(), number));
            workspace.stage_file(input.clone(), &sample.test_input).await?;
            workspace.stage_file(output.clone(), &sample.test_output).await?;

            let case = TestCase {
                phase: TestPhase::Sample,
                number,
                input,
                output,
                mem_lim: problem.mem_lim,
                time_lim: problem.time_lim,
            };
            if !self.judge(problem, &exec_path, &case, run).await? {
                return Ok(());
            }
        }

        for (idx, hidden) in problem.hidden_tests.iter().enumerate() {
            let case = TestCase {
                phase: TestPhase::Hidden,
                number: idx + 1,
                input: input_dir.join(&hidden.input_file_path),
                output: output_dir.join(&hidden.output_file_path),
                mem_lim: hidden.mem_lim,
                time_lim: hidden.time_lim,
            };
            if !self.judge(problem, &exec_path, &case, run).await? {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Judge one test and record its result.
    /// Returns whether the run should continue.
    async fn judge(
        &self,
        problem: &ProblemData,
        exec_path: &Path,
        case: &TestCase,
        run: &mut TestRun,
    ) -> Result<bool, PipelineError> {
        let request = JudgeRequest {
            slug: problem.slug.clone(),
            exec_path: exec_path.to_path_buf(),
            language: problem.language.name.clone(),
            input_path: relative_to(&case.input, &self.paths.scripts_dir)?,
            output_path: relative_to(&case.output, &self.paths.scripts_dir)?,
            mem_lim: case.mem_lim,
            time_lim: case.time_lim,
        };
        debug!(phase = %case.phase, test = case.number, ?request, "Judging test");

        let output = self.engine.judge(&request).await?;
        let result = TestResult::from(&output);
        info!(
            phase = %case.phase,
            test = case.number,
            verdict = %result.verdict,
            cpu_time = result.cpu_time,
            memory = result.memory,
            program_exit_code = output.program_exit_code,
            checker_exit_code = output.checker_exit_code,
            "Test judged"
        );

        let accepted = result.is_accepted();
        run.results_mut(case.phase).push(result);
        Ok(accepted)
    }
}
