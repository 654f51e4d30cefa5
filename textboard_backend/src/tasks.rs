use crate::config::QueueConfig;
use crate::error::{Rejection, SubmissionError};
use crate::kv::SharedStore;
use crate::pipeline::{Submission, SubmissionPipeline};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

const TASK_NAMESPACE: &str = "services.task";

pub type TaskUid = String;

/// Every queue slot is taken. Nothing was recorded for the submission.
#[derive(Debug, Error)]
#[error("task queue is full")]
pub struct QueueFull;

/// What a finished submission produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutcome {
    Topic { id: i64 },
    Post { id: i64 },
    Failure(Rejection),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Success { result: TaskOutcome },
    /// The job died on an error that is not a rejection: a missing target or
    /// an infrastructure fault that outlived its retries.
    Failure { error: String },
}

impl TaskState {
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskState::Pending)
    }
}

#[derive(Debug)]
pub struct Job {
    pub uid: TaskUid,
    pub submission: Submission,
}

/// Hands submissions to the worker pool and records their results in the
/// key-value store under the task UID.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::Sender<Job>,
    store: SharedStore,
    result_ttl: u64,
}

impl TaskQueue {
    pub fn new(store: SharedStore, buffer: usize, result_ttl: u64) -> (Self, mpsc::Receiver<Job>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (
            Self {
                sender,
                store,
                result_ttl,
            },
            receiver,
        )
    }

    /// Never waits for a slot: a full queue fails with [`QueueFull`].
    pub async fn enqueue(&self, submission: Submission) -> Result<TaskUid> {
        let permit = match self.sender.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                tracing::warn!(kind = submission.kind(), "task queue is full");
                return Err(QueueFull.into());
            }
            Err(TrySendError::Closed(())) => return Err(anyhow!("task queue is closed")),
        };
        let uid = Uuid::new_v4().to_string();
        self.store_state(&uid, &TaskState::Pending).await?;
        let kind = submission.kind();
        permit.send(Job {
            uid: uid.clone(),
            submission,
        });
        tracing::debug!(%uid, kind, "submission enqueued");
        Ok(uid)
    }

    /// Unknown and expired UIDs read as pending.
    pub async fn result(&self, uid: &str) -> Result<TaskState> {
        match self.store.get(&task_key(uid)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("corrupt task record for {uid}")),
            None => Ok(TaskState::Pending),
        }
    }

    pub(crate) async fn store_state(&self, uid: &str, state: &TaskState) -> Result<()> {
        let key = task_key(uid);
        let raw = serde_json::to_string(state)?;
        self.store.set_ex(&key, &raw, self.result_ttl).await?;
        Ok(())
    }
}

fn task_key(uid: &str) -> String {
    format!("{TASK_NAMESPACE}:{uid}")
}

/// Attempts per stage and the backoff between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.retry_base_delay,
        }
    }

    /// Delay before attempt `attempt + 1`; doubles each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error or uses
    /// up its attempts.
    pub async fn run<T, F, Fut>(&self, stage: &'static str, mut op: F) -> Result<T, SubmissionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SubmissionError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(stage, attempt, ?delay, error = %err, "retrying submission stage");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Fixed set of workers pulling jobs off one shared FIFO channel.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        receiver: mpsc::Receiver<Job>,
        queue: TaskQueue,
        pipeline: Arc<SubmissionPipeline>,
    ) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let workers = (0..count.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let shutdown_rx = shutdown_rx.clone();
                let queue = queue.clone();
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    run_worker(worker, receiver, shutdown_rx, queue, pipeline).await;
                })
            })
            .collect();
        tracing::info!(workers = count.max(1), "submission workers started");
        Self { workers, shutdown }
    }

    /// Stops accepting jobs, finishes the ones already queued and waits for
    /// every worker to exit.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for handle in self.workers {
            if let Err(err) = handle.await {
                tracing::error!(error = ?err, "submission worker panicked");
            }
        }
        tracing::info!("submission workers stopped");
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    mut shutdown: watch::Receiver<bool>,
    queue: TaskQueue,
    pipeline: Arc<SubmissionPipeline>,
) {
    tracing::debug!(worker, "worker started");
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            if *shutdown.borrow() {
                receiver.close();
            }
            tokio::select! {
                biased;
                job = receiver.recv() => job,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        receiver.close();
                    }
                    continue;
                }
            }
        };
        let Some(job) = job else {
            break;
        };
        process_job(&queue, &pipeline, job).await;
    }
    tracing::debug!(worker, "worker stopped");
}

async fn process_job(queue: &TaskQueue, pipeline: &SubmissionPipeline, job: Job) {
    let state = match pipeline.run(&job.submission).await {
        Ok(result) => TaskState::Success { result },
        Err(err) => {
            tracing::error!(
                uid = %job.uid,
                kind = job.submission.kind(),
                error = %err,
                "submission failed"
            );
            TaskState::Failure {
                error: err.to_string(),
            }
        }
    };
    if let Err(err) = queue.store_state(&job.uid, &state).await {
        tracing::error!(uid = %job.uid, error = ?err, "failed to record task result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::MemoryStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn queue() -> (TaskQueue, mpsc::Receiver<Job>) {
        let store = Arc::new(MemoryStore::new(Arc::new(ManualClock::new(Utc::now()))));
        TaskQueue::new(store, 8, 60)
    }

    #[test]
    fn task_state_json_shape() {
        let state = TaskState::Success {
            result: TaskOutcome::Failure(Rejection::StatusRejected {
                status: "locked".into(),
            }),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "state": "success",
                "result": {"type": "failure", "reason": "status_rejected", "status": "locked"}
            })
        );
        let back: TaskState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);

        let topic = serde_json::to_value(TaskOutcome::Topic { id: 7 }).unwrap();
        assert_eq!(topic, serde_json::json!({"type": "topic", "id": 7}));
    }

    #[tokio::test]
    async fn unknown_uid_reads_as_pending() {
        let (queue, _rx) = queue();
        assert_eq!(queue.result("no-such-task").await.unwrap(), TaskState::Pending);
    }

    #[tokio::test]
    async fn enqueue_records_pending_and_forwards_the_job() {
        let (queue, mut rx) = queue();
        let submission = Submission::Reply(crate::pipeline::ReplySubmission {
            topic_id: 1,
            body: "hi".into(),
            bumped: true,
            ip_address: "10.0.0.1".parse().unwrap(),
            payload: Default::default(),
        });
        let uid = queue.enqueue(submission).await.unwrap();
        assert!(queue.result(&uid).await.unwrap().is_pending());

        let job = rx.recv().await.expect("job");
        assert_eq!(job.uid, uid);

        let done = TaskState::Success {
            result: TaskOutcome::Post { id: 3 },
        };
        queue.store_state(&uid, &done).await.unwrap();
        assert_eq!(queue.result(&uid).await.unwrap(), done);
    }

    #[tokio::test]
    async fn closed_queue_refuses_jobs() {
        let (queue, rx) = queue();
        drop(rx);
        let submission = Submission::Reply(crate::pipeline::ReplySubmission {
            topic_id: 1,
            body: "hi".into(),
            bumped: true,
            ip_address: "10.0.0.1".parse().unwrap(),
            payload: Default::default(),
        });
        assert!(queue.enqueue(submission).await.is_err());
    }

    #[tokio::test]
    async fn full_queue_fails_fast_without_recording_the_task() {
        let store = Arc::new(MemoryStore::new(Arc::new(ManualClock::new(Utc::now()))));
        let (queue, mut rx) = TaskQueue::new(store.clone(), 1, 60);
        let reply = || {
            Submission::Reply(crate::pipeline::ReplySubmission {
                topic_id: 1,
                body: "hi".into(),
                bumped: true,
                ip_address: "10.0.0.1".parse().unwrap(),
                payload: Default::default(),
            })
        };
        let first = queue.enqueue(reply()).await.unwrap();
        assert_eq!(store.len(), 1);

        let err = tokio::time::timeout(Duration::from_secs(1), queue.enqueue(reply()))
            .await
            .expect("enqueue must not wait for a slot")
            .unwrap_err();
        assert!(err.downcast_ref::<QueueFull>().is_some());
        assert_eq!(store.len(), 1);

        assert_eq!(rx.recv().await.expect("job").uid, first);
        assert!(queue.enqueue(reply()).await.is_ok());
    }

    #[tokio::test]
    async fn retry_stops_at_non_retryable_errors_and_attempt_cap() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        };
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SubmissionError::Transient(anyhow!("disk")))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        calls.store(0, Ordering::SeqCst);
        let result: Result<(), _> = policy
            .run("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SubmissionError::Rejected(Rejection::BanRejected))
            })
            .await;
        assert!(matches!(result, Err(SubmissionError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        calls.store(0, Ordering::SeqCst);
        let result = policy
            .run("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(SubmissionError::Conflict(1))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }
}
