/// Queue-RPC Worker
///
/// Per message: received -> decoded -> dispatched -> replied -> acknowledged.
///
/// - One intake loop receives strictly sequentially.
/// - Each decoded job runs in its own task; a semaphore caps how many run at
///   once, and a saturated pool delays intake rather than growing.
/// - One publisher task owns the outbound connection. It publishes each reply
///   and acknowledges the original message after the publish attempt,
///   whether or not it succeeded.
/// - Payloads that fail to decode are dead-lettered and never judged.
/// - Shutdown lets a pending receive finish and judges what it returned.

use crate::executor::Pipeline;
use anyhow::{anyhow, Context, Result};
use arbiter_common::config::WorkerConfig;
use arbiter_common::redis::{self, Delivery, Job};
use arbiter_common::types::JobResult;
use async_trait::async_trait;
use ::redis::RedisResult;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Inbound side of the broker
#[async_trait]
pub trait JobQueue: Send {
    /// Wait briefly for the next payload; `None` when the wait timed out
    async fn receive(&mut self) -> RedisResult<Option<Delivery>>;

    /// Drop a payload that cannot be decoded, without requeueing it
    async fn reject(&mut self, delivery: &Delivery) -> RedisResult<()>;

    /// Hand back everything received but not acknowledged
    async fn release(&mut self) -> RedisResult<usize>;
}

/// Outbound side of the broker
#[async_trait]
pub trait ReplySink: Send + 'static {
    async fn publish(
        &mut self,
        reply_to: &str,
        correlation_id: &str,
        result: &JobResult,
    ) -> RedisResult<()>;

    async fn ack(&mut self, delivery: &Delivery) -> RedisResult<()>;
}

pub struct RedisJobQueue {
    conn: ::redis::aio::ConnectionManager,
    queue: String,
    processing_queue: String,
    poll_timeout: Duration,
}

impl RedisJobQueue {
    pub fn new(conn: ::redis::aio::ConnectionManager, config: &WorkerConfig) -> Self {
        Self {
            conn,
            queue: config.queue_name.clone(),
            processing_queue: redis::processing_queue(&config.worker_id),
            poll_timeout: config.poll_timeout,
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn receive(&mut self) -> RedisResult<Option<Delivery>> {
        redis::receive(
            &mut self.conn,
            &self.queue,
            &self.processing_queue,
            self.poll_timeout,
        )
        .await
    }

    async fn reject(&mut self, delivery: &Delivery) -> RedisResult<()> {
        redis::dead_letter(&mut self.conn, delivery).await
    }

    async fn release(&mut self) -> RedisResult<usize> {
        redis::requeue_unacked(&mut self.conn, &self.processing_queue, &self.queue).await
    }
}

pub struct RedisReplySink {
    conn: ::redis::aio::ConnectionManager,
}

impl RedisReplySink {
    pub fn new(conn: ::redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ReplySink for RedisReplySink {
    async fn publish(
        &mut self,
        reply_to: &str,
        correlation_id: &str,
        result: &JobResult,
    ) -> RedisResult<()> {
        redis::publish_reply(&mut self.conn, reply_to, correlation_id, result).await
    }

    async fn ack(&mut self, delivery: &Delivery) -> RedisResult<()> {
        redis::ack(&mut self.conn, delivery).await
    }
}

/// A finished job waiting for the publisher
#[derive(Debug)]
struct ReplyRequest {
    delivery: Delivery,
    correlation_id: String,
    reply_to: String,
    result: JobResult,
}

pub struct Worker<Q, S> {
    queue: Q,
    replies: S,
    pipeline: Arc<Pipeline>,
    max_concurrent_jobs: usize,
}

impl<Q: JobQueue, S: ReplySink> Worker<Q, S> {
    pub fn new(queue: Q, replies: S, pipeline: Arc<Pipeline>, max_concurrent_jobs: usize) -> Self {
        Self {
            queue,
            replies,
            pipeline,
            max_concurrent_jobs: max_concurrent_jobs.max(1),
        }
    }

    /// Consume jobs until `shutdown` resolves or the broker fails, then drain
    /// in-flight jobs and their replies
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Worker {
            mut queue,
            replies,
            pipeline,
            max_concurrent_jobs,
        } = self;

        let (reply_tx, reply_rx) = mpsc::channel(max_concurrent_jobs * 2);
        let publisher = tokio::spawn(publish_replies(replies, reply_rx));
        let permits = Arc::new(Semaphore::new(max_concurrent_jobs));
        let mut jobs = JoinSet::new();
        tokio::pin!(shutdown);

        info!(max_concurrent_jobs, "Worker loop started");

        let outcome: Result<()> = loop {
            // Backpressure: wait for a free slot before taking another job
            let permit = tokio::select! {
                _ = &mut shutdown => break Ok(()),
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => break Err(anyhow!(e).context("Job semaphore closed")),
                },
            };

            // A pending receive is never cancelled: the broker may already be
            // moving a payload into the processing list
            let (received, stopping) = {
                let receive = queue.receive();
                tokio::pin!(receive);
                tokio::select! {
                    received = &mut receive => (received, false),
                    _ = &mut shutdown => {
                        info!("Shutdown requested, finishing the pending receive");
                        (receive.await, true)
                    }
                }
            };

            let delivery = match received {
                Ok(Some(delivery)) => Some(delivery),
                // Poll timeout
                Ok(None) => None,
                Err(e) => break Err(anyhow!(e).context("Failed to receive from the job queue")),
            };

            while let Some(finished) = jobs.try_join_next() {
                if let Err(e) = finished {
                    error!(error = %e, "Job task failed");
                }
            }

            if let Some(delivery) = delivery {
                match delivery.decode() {
                    Ok(job) => {
                        info!(
                            correlation_id = %job.correlation_id,
                            submission_id = %job.data.submission_data.id,
                            slug = %job.data.problem_data.slug,
                            language = %job.data.problem_data.language.name,
                            samples = job.data.problem_data.sample_tests.len(),
                            hidden = job.data.problem_data.hidden_tests.len(),
                            "Received job"
                        );
                        jobs.spawn(run_job(
                            pipeline.clone(),
                            job,
                            delivery,
                            reply_tx.clone(),
                            permit,
                        ));
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            payload_size = delivery.payload.len(),
                            "Malformed job payload, moving it to the dead-letter queue"
                        );
                        if let Err(e) = queue.reject(&delivery).await {
                            error!(error = %e, "Failed to dead-letter malformed payload");
                        }
                    }
                }
            }

            if stopping {
                break Ok(());
            }
        };

        if !jobs.is_empty() {
            info!(in_flight = jobs.len(), "Draining in-flight jobs");
        }
        while let Some(finished) = jobs.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Job task failed");
            }
        }

        drop(reply_tx);
        publisher.await.context("Reply publisher task failed")?;

        // Every dispatched job is acknowledged by now; anything still held
        // was received but never dispatched
        match queue.release().await {
            Ok(0) => {}
            Ok(released) => warn!(released, "Returned unprocessed jobs to the queue"),
            Err(e) => error!(error = %e, "Failed to return unprocessed jobs to the queue"),
        }

        outcome
    }
}

/// Judge one job and queue its reply. The permit is released when the
/// reply has been handed to the publisher.
async fn run_job(
    pipeline: Arc<Pipeline>,
    job: Job,
    delivery: Delivery,
    reply_tx: mpsc::Sender<ReplyRequest>,
    _permit: OwnedSemaphorePermit,
) {
    let Job {
        correlation_id,
        reply_to,
        data,
    } = job;

    let start = Instant::now();
    // A panicking pipeline still produces a reply
    let judged = tokio::spawn(async move {
        pipeline
            .process_submission(&data.submission_data, &data.problem_data)
            .await
    })
    .await;
    let result = match judged {
        Ok(result) => result,
        Err(e) => {
            error!(correlation_id = %correlation_id, error = %e, "Pipeline task panicked");
            JobResult::default()
        }
    };

    info!(
        correlation_id = %correlation_id,
        verdict = %result.verdict,
        execution_ms = start.elapsed().as_millis() as u64,
        "Job completed"
    );

    let request = ReplyRequest {
        delivery,
        correlation_id,
        reply_to,
        result,
    };
    if let Err(e) = reply_tx.send(request).await {
        error!(correlation_id = %e.0.correlation_id, "Reply publisher is gone, reply dropped");
    }
}

/// Sole owner of the outbound handle: publish, then acknowledge
async fn publish_replies<S: ReplySink>(mut sink: S, mut rx: mpsc::Receiver<ReplyRequest>) {
    while let Some(reply) = rx.recv().await {
        match sink
            .publish(&reply.reply_to, &reply.correlation_id, &reply.result)
            .await
        {
            Ok(()) => info!(
                correlation_id = %reply.correlation_id,
                reply_to = %reply.reply_to,
                "Reply published"
            ),
            // At-most-once: no retry
            Err(e) => error!(
                correlation_id = %reply.correlation_id,
                reply_to = %reply.reply_to,
                error = %e,
                "Failed to publish reply"
            ),
        }

        if let Err(e) = sink.ack(&reply.delivery).await {
            error!(correlation_id = %reply.correlation_id, error = %e, "Failed to acknowledge job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CompileStatus, JudgeRequest, MockScriptEngine, ScriptEngine};
    use crate::error::EngineError;
    use arbiter_common::config::PathConfig;
    use arbiter_common::redis::JobEnvelope;
    use arbiter_common::types::{
        CheckerOutput, JobData, JudgeOutput, Language, ProblemData, SampleTest, SubmissionData,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// In-memory queue; records rejected payloads
    struct FakeQueue {
        pending: VecDeque<String>,
        rejected: Arc<Mutex<Vec<String>>>,
        fail_when_empty: bool,
        /// How long each receive takes before it yields a payload
        delay: Duration,
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobQueue for FakeQueue {
        async fn receive(&mut self) -> RedisResult<Option<Delivery>> {
            tokio::time::sleep(self.delay).await;
            match self.pending.pop_front() {
                Some(payload) => Ok(Some(Delivery {
                    processing_queue: "arbiter:processing:test".to_string(),
                    payload,
                })),
                None if self.fail_when_empty => Err(::redis::RedisError::from((
                    ::redis::ErrorKind::IoError,
                    "connection lost",
                ))),
                None => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(None)
                }
            }
        }

        async fn reject(&mut self, delivery: &Delivery) -> RedisResult<()> {
            self.rejected.lock().unwrap().push(delivery.payload.clone());
            Ok(())
        }

        async fn release(&mut self) -> RedisResult<usize> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Published(String, String, String),
        Acked(String),
    }

    struct FakeSink {
        events: Arc<Mutex<Vec<Event>>>,
        acked: mpsc::UnboundedSender<()>,
        fail_publish: bool,
    }

    #[async_trait]
    impl ReplySink for FakeSink {
        async fn publish(
            &mut self,
            reply_to: &str,
            correlation_id: &str,
            result: &JobResult,
        ) -> RedisResult<()> {
            if self.fail_publish {
                return Err(::redis::RedisError::from((
                    ::redis::ErrorKind::IoError,
                    "publish failed",
                )));
            }
            self.events.lock().unwrap().push(Event::Published(
                reply_to.to_string(),
                correlation_id.to_string(),
                result.verdict.clone(),
            ));
            Ok(())
        }

        async fn ack(&mut self, delivery: &Delivery) -> RedisResult<()> {
            self.events
                .lock()
                .unwrap()
                .push(Event::Acked(delivery.payload.clone()));
            let _ = self.acked.send(());
            Ok(())
        }
    }

    fn job_payload(correlation_id: &str) -> String {
        let data = JobData {
            problem_data: ProblemData {
                slug: "echo".to_string(),
                time_lim: 1000,
                mem_lim: 65536,
                language: Language {
                    name: "python".to_string(),
                    extension: "py".to_string(),
                    is_compiled: false,
                },
                sample_tests: vec![SampleTest {
                    test_input: "hi\n".to_string(),
                    test_output: "hi\n".to_string(),
                }],
                hidden_tests: vec![],
            },
            submission_data: SubmissionData {
                id: format!("sub-{}", correlation_id),
                user_id: "user".to_string(),
                source_code: "print(input())".to_string(),
                problem_id: "echo".to_string(),
                submission_time: "2024-01-01T00:00:00Z".to_string(),
            },
        };
        serde_json::to_string(&JobEnvelope {
            correlation_id: correlation_id.to_string(),
            reply_to: format!("arbiter:reply:{}", correlation_id),
            body: serde_json::to_value(data).unwrap(),
        })
        .unwrap()
    }

    fn accepted() -> JudgeOutput {
        JudgeOutput {
            program_exit_code: 0,
            checker_exit_code: 0,
            cpu_time: 5,
            memory: 50,
            checker_output: CheckerOutput {
                message: String::new(),
                verdict: "AC".to_string(),
            },
        }
    }

    fn paths(root: &std::path::Path) -> PathConfig {
        PathConfig {
            code_dir: root.join("code"),
            scripts_dir: root.join("scripts"),
            test_cases_dir: root.join("test_cases"),
        }
    }

    fn accepting_pipeline(root: &std::path::Path) -> Arc<Pipeline> {
        let mut engine = MockScriptEngine::new();
        engine.expect_judge().returning(|_| Ok(accepted()));
        Arc::new(Pipeline::new(Arc::new(engine), paths(root)))
    }

    /// Holds every judge for a while and tracks how many overlap
    #[derive(Default)]
    struct SlowEngine {
        running: AtomicUsize,
        peak: AtomicUsize,
        judged: AtomicUsize,
    }

    #[async_trait]
    impl ScriptEngine for SlowEngine {
        async fn compile(
            &self,
            _language: &str,
            _workspace_id: &str,
        ) -> Result<CompileStatus, EngineError> {
            Ok(CompileStatus::Compiled)
        }

        async fn judge(&self, _request: &JudgeRequest) -> Result<JudgeOutput, EngineError> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.judged.fetch_add(1, Ordering::SeqCst);
            Ok(accepted())
        }
    }

    async fn wait_for_acks(acked: &mut mpsc::UnboundedReceiver<()>, count: usize) {
        for _ in 0..count {
            tokio::time::timeout(Duration::from_secs(10), acked.recv())
                .await
                .expect("timed out waiting for acknowledgement");
        }
    }

    /// Scenario D: a malformed payload is dead-lettered and the worker keeps going
    #[tokio::test]
    async fn test_malformed_payload_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let rejected = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let (acked, mut acked_rx) = mpsc::unbounded_channel();

        let good = job_payload("corr-1");
        let queue = FakeQueue {
            pending: VecDeque::from(vec!["{\"broken\":".to_string(), good.clone()]),
            rejected: rejected.clone(),
            fail_when_empty: false,
            delay: Duration::ZERO,
            released: Arc::new(AtomicUsize::new(0)),
        };
        let sink = FakeSink {
            events: events.clone(),
            acked,
            fail_publish: false,
        };

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let worker = Worker::new(queue, sink, accepting_pipeline(dir.path()), 2);
        let handle = tokio::spawn(worker.run(async {
            let _ = stop_rx.await;
        }));

        wait_for_acks(&mut acked_rx, 1).await;
        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(*rejected.lock().unwrap(), vec!["{\"broken\":".to_string()]);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Published(
                    "arbiter:reply:corr-1".to_string(),
                    "corr-1".to_string(),
                    "AC".to_string()
                ),
                Event::Acked(good),
            ]
        );
    }

    /// Every job gets its own reply with its correlation id, then an ack
    #[tokio::test]
    async fn test_concurrent_jobs_reply_with_their_correlation_ids() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let (acked, mut acked_rx) = mpsc::unbounded_channel();

        let ids: Vec<String> = (0..5).map(|i| format!("corr-{}", i)).collect();
        let queue = FakeQueue {
            pending: ids.iter().map(|id| job_payload(id)).collect(),
            rejected: Arc::new(Mutex::new(Vec::new())),
            fail_when_empty: false,
            delay: Duration::ZERO,
            released: Arc::new(AtomicUsize::new(0)),
        };
        let sink = FakeSink {
            events: events.clone(),
            acked,
            fail_publish: false,
        };

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let worker = Worker::new(queue, sink, accepting_pipeline(dir.path()), 2);
        let handle = tokio::spawn(worker.run(async {
            let _ = stop_rx.await;
        }));

        wait_for_acks(&mut acked_rx, ids.len()).await;
        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        let events = events.lock().unwrap();
        for id in &ids {
            let published = events
                .iter()
                .position(|e| matches!(e, Event::Published(_, c, v) if c == id && v == "AC"))
                .expect("missing reply");
            let acked = events
                .iter()
                .position(|e| *e == Event::Acked(job_payload(id)))
                .expect("missing ack");
            assert!(published < acked, "ack before publish for {}", id);
        }
    }

    /// A failed publish is not retried and the job is still acknowledged
    #[tokio::test]
    async fn test_publish_failure_still_acks() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let (acked, mut acked_rx) = mpsc::unbounded_channel();

        let payload = job_payload("corr-x");
        let queue = FakeQueue {
            pending: VecDeque::from(vec![payload.clone()]),
            rejected: Arc::new(Mutex::new(Vec::new())),
            fail_when_empty: false,
            delay: Duration::ZERO,
            released: Arc::new(AtomicUsize::new(0)),
        };
        let sink = FakeSink {
            events: events.clone(),
            acked,
            fail_publish: true,
        };

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let worker = Worker::new(queue, sink, accepting_pipeline(dir.path()), 1);
        let handle = tokio::spawn(worker.run(async {
            let _ = stop_rx.await;
        }));

        wait_for_acks(&mut acked_rx, 1).await;
        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(*events.lock().unwrap(), vec![Event::Acked(payload)]);
    }

    /// Losing the broker stops the worker with an error after draining
    #[tokio::test]
    async fn test_receive_error_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));

        let queue = FakeQueue {
            pending: VecDeque::from(vec![job_payload("corr-last")]),
            rejected: Arc::new(Mutex::new(Vec::new())),
            fail_when_empty: true,
            delay: Duration::ZERO,
            released: Arc::new(AtomicUsize::new(0)),
        };
        let sink = FakeSink {
            events: events.clone(),
            acked: mpsc::unbounded_channel().0,
            fail_publish: false,
        };

        let worker = Worker::new(queue, sink, accepting_pipeline(dir.path()), 1);
        let result = worker.run(std::future::pending()).await;

        assert!(result.is_err());
        // The job received before the failure was still answered
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    /// Intake keeps pulling while jobs are judged, but never past the limit
    #[tokio::test]
    async fn test_jobs_overlap_up_to_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(SlowEngine::default());
        let pipeline = Arc::new(Pipeline::new(engine.clone(), paths(dir.path())));
        let (acked, mut acked_rx) = mpsc::unbounded_channel();

        let ids: Vec<String> = (0..6).map(|i| format!("corr-{}", i)).collect();
        let queue = FakeQueue {
            pending: ids.iter().map(|id| job_payload(id)).collect(),
            rejected: Arc::new(Mutex::new(Vec::new())),
            fail_when_empty: false,
            delay: Duration::ZERO,
            released: Arc::new(AtomicUsize::new(0)),
        };
        let sink = FakeSink {
            events: Arc::new(Mutex::new(Vec::new())),
            acked,
            fail_publish: false,
        };

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let worker = Worker::new(queue, sink, pipeline, 3);
        let handle = tokio::spawn(worker.run(async {
            let _ = stop_rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.running.load(Ordering::SeqCst), 3);
        assert_eq!(engine.judged.load(Ordering::SeqCst), 0);

        wait_for_acks(&mut acked_rx, ids.len()).await;
        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(engine.peak.load(Ordering::SeqCst), 3);
        assert_eq!(engine.judged.load(Ordering::SeqCst), ids.len());
    }

    /// A receive in flight when shutdown arrives is completed and its job answered
    #[tokio::test]
    async fn test_shutdown_finishes_pending_receive() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::new(AtomicUsize::new(0));

        let payload = job_payload("corr-late");
        let queue = FakeQueue {
            pending: VecDeque::from(vec![payload.clone()]),
            rejected: Arc::new(Mutex::new(Vec::new())),
            fail_when_empty: false,
            delay: Duration::from_millis(200),
            released: released.clone(),
        };
        let sink = FakeSink {
            events: events.clone(),
            acked: mpsc::unbounded_channel().0,
            fail_publish: false,
        };

        let worker = Worker::new(queue, sink, accepting_pipeline(dir.path()), 1);
        worker
            .run(tokio::time::sleep(Duration::from_millis(20)))
            .await
            .unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Published(
                    "arbiter:reply:corr-late".to_string(),
                    "corr-late".to_string(),
                    "AC".to_string()
                ),
                Event::Acked(payload),
            ]
        );
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
