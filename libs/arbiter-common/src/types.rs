use serde::{Deserialize, Deserializer, Serialize};

/// Verdict codes the worker itself produces.
/// Every other verdict comes from the checker and is passed through verbatim.
pub mod verdict {
    pub const ACCEPTED: &str = "AC";
    pub const COMPILE_ERROR: &str = "CE";
    pub const INTERNAL_ERROR: &str = "IE";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    pub name: String,
    pub extension: String,
    pub is_compiled: bool,
}

/// Sample test with its content embedded in the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleTest {
    pub test_input: String,
    pub test_output: String,
}

/// Hidden test stored on disk under the problem's slug directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenTest {
    pub input_file_path: String,
    pub output_file_path: String,
    pub time_lim: u64,
    pub mem_lim: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemData {
    pub slug: String,
    pub time_lim: u64,
    pub mem_lim: u64,
    #[serde(rename = "lang")]
    pub language: Language,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub sample_tests: Vec<SampleTest>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub hidden_tests: Vec<HiddenTest>,
}

/// Producers may send `null` for an empty test list
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionData {
    pub id: String,
    pub user_id: String,
    pub source_code: String,
    pub problem_id: String,
    pub submission_time: String,
}

/// Body of an inbound job message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobData {
    pub problem_data: ProblemData,
    pub submission_data: SubmissionData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub verdict: String,
    pub cpu_time: u64,
    pub memory: u64,
}

impl TestResult {
    pub fn is_accepted(&self) -> bool {
        self.verdict == verdict::ACCEPTED
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub verdict: String,
    pub cpu_time: u64,
    pub memory: u64,
    pub sample_test_results: Vec<TestResult>,
    pub hidden_test_results: Vec<TestResult>,
}

impl Default for JobResult {
    /// Internal error with no results: what a job reports if nothing ever ran.
    fn default() -> Self {
        Self {
            verdict: verdict::INTERNAL_ERROR.to_string(),
            cpu_time: 0,
            memory: 0,
            sample_test_results: Vec::new(),
            hidden_test_results: Vec::new(),
        }
    }
}

impl JobResult {
    pub fn compile_error() -> Self {
        Self {
            verdict: verdict::COMPILE_ERROR.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerOutput {
    #[serde(default, alias = "Message")]
    pub message: String,
    #[serde(alias = "Verdict")]
    pub verdict: String,
}

/// Document the judge script prints on stdout for one test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeOutput {
    pub program_exit_code: i32,
    pub checker_exit_code: i32,
    pub cpu_time: u64,
    pub memory: u64,
    pub checker_output: CheckerOutput,
}

impl From<&JudgeOutput> for TestResult {
    fn from(output: &JudgeOutput) -> Self {
        Self {
            verdict: output.checker_output.verdict.clone(),
            cpu_time: output.cpu_time,
            memory: output.memory,
        }
    }
}
