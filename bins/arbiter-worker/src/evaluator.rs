/// Verdict Aggregator - reduces a test run to the job's final result
///
/// **Final Verdict Rules:**
/// - The run ended in an internal error: IE
/// - Any hidden test ran: verdict of the last hidden test
/// - Otherwise any sample test ran: verdict of the last sample test
/// - Nothing ran: IE
///
/// Because the runner stops at the first rejection, "last test" is either the
/// test that failed or the final test of a fully accepted phase.
///
/// **Resource Rules:**
/// Peak cpu time and memory are maxima over every collected result, samples
/// and hidden combined, wherever the run stopped.

use crate::runner::{RunOutcome, TestRun};
use arbiter_common::types::{verdict, JobResult};

pub fn aggregate_results(run: TestRun) -> JobResult {
    let final_verdict = match run.outcome {
        RunOutcome::InternalError => verdict::INTERNAL_ERROR.to_string(),
        RunOutcome::Finished => run
            .hidden_results
            .last()
            .or_else(|| run.sample_results.last())
            .map(|last| last.verdict.clone())
            .unwrap_or_else(|| verdict::INTERNAL_ERROR.to_string()),
    };

    let all = run.sample_results.iter().chain(run.hidden_results.iter());
    let (cpu_time, memory) = all.fold((0u64, 0u64), |(cpu, mem), result| {
        (cpu.max(result.cpu_time), mem.max(result.memory))
    });

    JobResult {
        verdict: final_verdict,
        cpu_time,
        memory,
        sample_test_results: run.sample_results,
        hidden_test_results: run.hidden_results,
    }
}
