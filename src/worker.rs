//! In-process job system.
//!
//! [`TaskWorker`] is the retry loop: it runs a [`Job`], waits out the job's
//! backoff between failed attempts, and hands the final error back to the job
//! once attempts run out. [`InProcessQueue`] puts a tokio channel and a
//! dispatcher task in front of it for every named connection, for hosts that
//! have no job system of their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::diagnostics::Diagnostics;
use crate::queue::{EnqueueError, Job, JobQueue, QueueRoute};
use crate::task::DeliveryTask;

/// Default capacity of each connection's channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 1_000;

/// Configuration for the in-process queue.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Tasks a connection buffers before `enqueue` reports it unavailable
    pub channel_capacity: usize,

    /// Extra random wait added to each backoff, as a fraction of it
    pub jitter_ratio: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            jitter_ratio: 0.0,
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered { attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Statistics about worker operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Tasks accepted by `enqueue`
    pub enqueued: u64,

    /// Tasks that eventually succeeded
    pub delivered: u64,

    /// Tasks that used up all attempts
    pub exhausted: u64,

    /// Attempts beyond the first
    pub retries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    exhausted: AtomicU64,
    retries: AtomicU64,
}

/// Runs jobs to completion with retries and backoff.
#[derive(Clone)]
pub struct TaskWorker {
    diagnostics: Arc<dyn Diagnostics>,
    jitter_ratio: f64,
    counters: Arc<Counters>,
}

impl TaskWorker {
    pub fn new(diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self {
            diagnostics,
            jitter_ratio: 0.0,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Add up to `ratio * backoff` of random wait to every retry. The ratio is
    /// clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Run `job` after `delay`, retrying until it succeeds or its attempts are
    /// used up. Terminal failures go to `Job::failed`, never to the caller.
    pub async fn run<J: Job>(&self, job: &J, delay: Duration) -> JobOutcome {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let max_tries = job.max_tries().max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;

            match job.execute().await {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(attempts = attempts, "Job completed");
                    return JobOutcome::Delivered { attempts };
                }
                Err(e) if attempts < max_tries => {
                    let wait = self.retry_delay(job.backoff(attempts));
                    warn!(
                        error = %e,
                        attempt = attempts,
                        max_tries = max_tries,
                        delay_secs = wait.as_secs(),
                        "Job failed, will retry"
                    );
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                    job.failed(e, attempts, self.diagnostics.as_ref());
                    return JobOutcome::Exhausted { attempts };
                }
            }
        }
    }

    fn retry_delay(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 {
            return backoff;
        }

        let factor = rand::random::<f64>() * self.jitter_ratio;
        let jitter = Duration::try_from_secs_f64(backoff.as_secs_f64() * factor).unwrap_or(Duration::MAX);
        backoff.saturating_add(jitter)
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }
}

struct Envelope {
    task: DeliveryTask,
    queue_name: String,
    delay: Duration,
}

/// [`JobQueue`] backed by tokio tasks, one dispatcher per named connection.
///
/// Tasks live in memory only; anything still pending when the process exits
/// is lost.
pub struct InProcessQueue {
    connections: HashMap<String, mpsc::Sender<Envelope>>,
    worker: TaskWorker,
    shutdown: watch::Sender<bool>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl InProcessQueue {
    /// Spawn a dispatcher for every connection name.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<I, S>(connections: I, config: WorkerConfig, diagnostics: Arc<dyn Diagnostics>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let worker = TaskWorker::new(diagnostics).with_jitter(config.jitter_ratio);
        let (shutdown, _) = watch::channel(false);

        let mut senders = HashMap::new();
        let mut dispatchers = Vec::new();

        for name in connections {
            let name = name.into();
            let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
            dispatchers.push(tokio::spawn(dispatch(
                name.clone(),
                rx,
                worker.clone(),
                shutdown.subscribe(),
            )));
            senders.insert(name, tx);
        }

        info!(connections = senders.len(), "In-process queue started");

        Self {
            connections: senders,
            worker,
            shutdown,
            dispatchers: Mutex::new(dispatchers),
        }
    }

    /// Names of the configured connections.
    pub fn connections(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    pub fn stats(&self) -> WorkerStats {
        self.worker.stats()
    }

    /// Stop accepting tasks and wait up to `timeout` for queued and running
    /// tasks to finish. Returns `false` if some had to be abandoned.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = match self.dispatchers.lock() {
            Ok(mut dispatchers) => dispatchers.drain(..).collect(),
            Err(_) => return false,
        };
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        let drained = tokio::time::timeout(timeout, async {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Queue dispatcher panicked");
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(timeout_secs = timeout.as_secs(), "Queue shutdown timed out, abandoning pending tasks");
            aborts.iter().for_each(|handle| handle.abort());
        }

        drained
    }

    fn sender_for(&self, connection: &str) -> Result<&mpsc::Sender<Envelope>, EnqueueError> {
        let tx = self
            .connections
            .get(connection)
            .ok_or_else(|| EnqueueError::UnknownConnection {
                connection: connection.to_string(),
            })?;

        if *self.shutdown.borrow() || tx.is_closed() {
            return Err(EnqueueError::Closed {
                connection: connection.to_string(),
            });
        }

        Ok(tx)
    }
}

#[async_trait]
impl JobQueue for InProcessQueue {
    async fn check_connection(&self, connection: &str) -> Result<(), EnqueueError> {
        self.sender_for(connection).map(|_| ())
    }

    async fn enqueue(&self, task: DeliveryTask, route: &QueueRoute) -> Result<(), EnqueueError> {
        let tx = self.sender_for(&route.connection)?;
        let task_id = task.id();

        tx.try_send(Envelope {
            task,
            queue_name: route.queue_name.clone(),
            delay: route.delay,
        })
        .map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Unavailable {
                connection: route.connection.clone(),
                reason: "queue is full".to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed {
                connection: route.connection.clone(),
            },
        })?;

        self.worker.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(
            task_id = %task_id,
            connection = %route.connection,
            queue = %route.queue_name,
            delay_secs = route.delay.as_secs(),
            "Delivery task enqueued"
        );
        Ok(())
    }
}

/// Receive envelopes for one connection and run each as its own tokio task.
async fn dispatch(
    connection: String,
    mut rx: mpsc::Receiver<Envelope>,
    worker: TaskWorker,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            maybe_envelope = rx.recv() => {
                match maybe_envelope {
                    Some(envelope) => spawn_job(&mut running, &worker, envelope),
                    None => break,
                }
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            Some(_) = running.join_next(), if !running.is_empty() => {}
        }
    }

    // Run whatever was accepted before the channel closed
    rx.close();
    while let Some(envelope) = rx.recv().await {
        spawn_job(&mut running, &worker, envelope);
    }

    let remaining = running.len();
    if remaining > 0 {
        info!(connection = %connection, remaining = remaining, "Waiting for running tasks");
    }
    while running.join_next().await.is_some() {}

    info!(connection = %connection, "Queue dispatcher stopped");
}

fn spawn_job(running: &mut JoinSet<()>, worker: &TaskWorker, envelope: Envelope) {
    let worker = worker.clone();
    running.spawn(async move {
        let Envelope {
            task,
            queue_name,
            delay,
        } = envelope;
        let outcome = worker.run(&task, delay).await;
        debug!(task_id = %task.id(), queue = %queue_name, outcome = ?outcome, "Delivery task finished");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TransportError;
    use crate::config::Config;
    use crate::diagnostics::{DiagnosticLevel, MemoryDiagnostics};
    use crate::normalize::normalize;
    use crate::record::{LogRecord, Severity};
    use tokio::time::Instant;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Job using a real task's retry policy but scripted attempt results.
    struct ScriptedJob {
        policy: DeliveryTask,
        succeed_on: Option<u32>,
        attempts: Mutex<Vec<Instant>>,
        failures: Mutex<Vec<u32>>,
    }

    impl ScriptedJob {
        fn new(retry_after_secs: u64, max_tries: u32, succeed_on: Option<u32>) -> Self {
            Self {
                policy: delivery_task("http://localhost/logs", retry_after_secs, max_tries),
                succeed_on,
                attempts: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
            }
        }

        fn attempt_times(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Job for ScriptedJob {
        type Error = TransportError;

        async fn execute(&self) -> Result<(), TransportError> {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(Instant::now());
            if Some(attempts.len() as u32) == self.succeed_on {
                Ok(())
            } else {
                Err(TransportError::Timeout)
            }
        }

        fn max_tries(&self) -> u32 {
            self.policy.max_tries()
        }

        fn backoff(&self, attempts: u32) -> Duration {
            self.policy.backoff(attempts)
        }

        fn failed(&self, _error: TransportError, attempts: u32, _diagnostics: &dyn Diagnostics) {
            self.failures.lock().unwrap().push(attempts);
        }
    }

    fn delivery_task(api_url: &str, retry_after_secs: u64, max_tries: u32) -> DeliveryTask {
        let mut config = Config::new("secret", api_url, "billing");
        config.queue.retry_after_secs = retry_after_secs;
        config.queue.max_tries = max_tries;
        let payload = normalize(&LogRecord::new(Severity::Info, "queued"), &config);
        DeliveryTask::new(payload, config)
    }

    fn route(connection: &str) -> QueueRoute {
        QueueRoute {
            connection: connection.to_string(),
            queue_name: "logs".to_string(),
            delay: Duration::ZERO,
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(std::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_between_attempts() {
        let worker = TaskWorker::new(Arc::new(MemoryDiagnostics::new()));
        let job = ScriptedJob::new(60, 3, None);

        let outcome = worker.run(&job, Duration::ZERO).await;
        assert_eq!(outcome, JobOutcome::Exhausted { attempts: 3 });

        let times = job.attempt_times();
        assert_eq!(times.len(), 3, "no fourth attempt with max_tries=3");
        assert!(times[1] - times[0] >= Duration::from_secs(60));
        assert!(times[2] - times[1] >= Duration::from_secs(120));
        assert_eq!(*job.failures.lock().unwrap(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stops_retrying() {
        let worker = TaskWorker::new(Arc::new(MemoryDiagnostics::new()));
        let job = ScriptedJob::new(10, 5, Some(2));

        let outcome = worker.run(&job, Duration::ZERO).await;
        assert_eq!(outcome, JobOutcome::Delivered { attempts: 2 });
        assert_eq!(job.attempt_times().len(), 2);
        assert!(job.failures.lock().unwrap().is_empty());

        let stats = worker.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.exhausted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_delay_is_honoured() {
        let worker = TaskWorker::new(Arc::new(MemoryDiagnostics::new()));
        let job = ScriptedJob::new(10, 1, Some(1));

        let started = Instant::now();
        worker.run(&job, Duration::from_secs(30)).await;

        assert!(job.attempt_times()[0] - started >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_only_lengthens_backoff() {
        let worker = TaskWorker::new(Arc::new(MemoryDiagnostics::new())).with_jitter(0.5);
        let job = ScriptedJob::new(60, 2, None);

        worker.run(&job, Duration::ZERO).await;

        let times = job.attempt_times();
        let gap = times[1] - times[0];
        assert!(gap >= Duration::from_secs(60));
        assert!(gap <= Duration::from_secs(91));
    }

    #[test]
    fn test_jitter_ratio_is_bounded() {
        let worker = TaskWorker::new(Arc::new(MemoryDiagnostics::new())).with_jitter(5.0);
        assert_eq!(worker.jitter_ratio, 1.0);
        assert_eq!(TaskWorker::new(Arc::new(MemoryDiagnostics::new())).with_jitter(f64::NAN).jitter_ratio, 0.0);
        assert_eq!(TaskWorker::new(Arc::new(MemoryDiagnostics::new())).with_jitter(-0.5).jitter_ratio, 0.0);

        // Saturated backoffs stay saturated instead of overflowing
        let saturated = Duration::from_secs(u64::MAX);
        for _ in 0..100 {
            assert!(worker.retry_delay(saturated) >= saturated);
        }
        assert_eq!(worker.retry_delay(Duration::MAX), Duration::MAX);

        let small = worker.retry_delay(Duration::from_secs(60));
        assert!(small >= Duration::from_secs(60));
        assert!(small <= Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_unknown_connection_is_rejected() {
        let queue = InProcessQueue::start(["default"], WorkerConfig::default(), Arc::new(MemoryDiagnostics::new()));

        assert!(queue.check_connection("default").await.is_ok());
        assert_eq!(
            queue.check_connection("redis").await,
            Err(EnqueueError::UnknownConnection {
                connection: "redis".to_string()
            })
        );

        let task = delivery_task("http://localhost/logs", 60, 3);
        assert!(matches!(
            queue.enqueue(task, &route("redis")).await,
            Err(EnqueueError::UnknownConnection { .. })
        ));
    }

    #[tokio::test]
    async fn test_enqueued_task_is_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let queue = InProcessQueue::start(["default"], WorkerConfig::default(), Arc::new(MemoryDiagnostics::new()));
        let task = delivery_task(&format!("{}/logs", server.uri()), 60, 3);
        queue.enqueue(task, &route("default")).await.expect("enqueued");

        wait_until(|| queue.stats().delivered == 1).await;
        assert_eq!(queue.stats().enqueued, 1);
        assert!(queue.shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_exhausted_task_reports_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let diagnostics = Arc::new(MemoryDiagnostics::new());
        let queue = InProcessQueue::start(["default"], WorkerConfig::default(), diagnostics.clone());
        let task = delivery_task(&format!("{}/logs", server.uri()), 60, 1);
        queue.enqueue(task, &route("default")).await.expect("enqueued");

        wait_until(|| queue.stats().exhausted == 1).await;
        assert_eq!(diagnostics.count(DiagnosticLevel::Error), 1);
        assert_eq!(diagnostics.entries()[0].context["attempts"], 1);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let queue = InProcessQueue::start(["default"], WorkerConfig::default(), Arc::new(MemoryDiagnostics::new()));
        assert!(queue.shutdown(Duration::from_secs(1)).await);

        let task = delivery_task("http://localhost/logs", 60, 3);
        assert_eq!(
            queue.enqueue(task, &route("default")).await,
            Err(EnqueueError::Closed {
                connection: "default".to_string()
            })
        );
        assert!(queue.check_connection("default").await.is_err());
    }

    #[tokio::test]
    async fn test_full_channel_is_unavailable() {
        let config = WorkerConfig {
            channel_capacity: 1,
            ..WorkerConfig::default()
        };
        let queue = InProcessQueue::start(["default"], config, Arc::new(MemoryDiagnostics::new()));

        // The dispatcher has not had a chance to run on this single-threaded
        // runtime, so the second send finds the channel full.
        let first = delivery_task("http://localhost/logs", 60, 3);
        let second = delivery_task("http://localhost/logs", 60, 3);
        queue.enqueue(first, &route("default")).await.expect("first fits");

        let err = queue.enqueue(second, &route("default")).await.unwrap_err();
        assert!(matches!(err, EnqueueError::Unavailable { .. }));
    }
}
