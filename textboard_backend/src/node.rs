use crate::bans::BanMatcher;
use crate::banwords::BanwordMatcher;
use crate::bootstrap;
use crate::clock::{SharedClock, SystemClock};
use crate::config::TextboardConfig;
use crate::database::Database;
use crate::filters::FilterChain;
use crate::identity::IdentityService;
use crate::kv::{MemoryStore, SharedStore, SqliteStore};
use crate::moderation::ModerationService;
use crate::pipeline::{ReplySubmission, Submission, SubmissionPipeline, TopicSubmission};
use crate::posting::{IdentPolicy, ModeratorReply, PostAppender, TopicAppender};
use crate::rate_limiter::RateLimiter;
use crate::tasks::{RetryPolicy, TaskQueue, TaskState, TaskUid, WorkerPool};
use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Wires the services together around one database and one key-value
/// store, and owns the worker pool that drains the submission queue.
pub struct TextboardNode {
    config: TextboardConfig,
    database: Database,
    store: SharedStore,
    queue: TaskQueue,
    workers: WorkerPool,
    moderation: ModerationService,
    posts: PostAppender,
}

impl TextboardNode {
    /// Creates the directories, opens and migrates the database and starts
    /// the workers. Key-value state lives in the same database file.
    pub async fn start(config: TextboardConfig) -> Result<Self> {
        let bootstrap = bootstrap::initialize(&config).await?;
        tracing::info!(
            directories_created = ?bootstrap.directories_created,
            database_initialized = bootstrap.database_initialized,
            db_path = %config.paths.db_path.display(),
            "textboard node initialized"
        );
        let clock: SharedClock = Arc::new(SystemClock);
        let store: SharedStore = Arc::new(SqliteStore::new(bootstrap.database.clone(), clock.clone()));
        Self::assemble_with_store(config, bootstrap.database, clock, store)
    }

    /// Builds a node over an already migrated database, backed by an
    /// in-process key-value store.
    pub fn assemble(config: TextboardConfig, database: Database, clock: SharedClock) -> Result<Self> {
        let store: SharedStore = Arc::new(MemoryStore::new(clock.clone()));
        Self::assemble_with_store(config, database, clock, store)
    }

    pub fn assemble_with_store(
        config: TextboardConfig,
        database: Database,
        clock: SharedClock,
        store: SharedStore,
    ) -> Result<Self> {
        let identity = IdentityService::new(store.clone(), config.identity.ident_size);
        let idents = IdentPolicy::new(identity, config.identity.time_zone);
        let filters = FilterChain::from_config(
            &config.filters,
            store.clone(),
            database.clone(),
            clock.clone(),
        )?;
        let posts = PostAppender::new(database.clone(), idents.clone(), clock.clone());
        let pipeline = SubmissionPipeline::new(
            database.clone(),
            BanMatcher::new(database.clone(), clock.clone()),
            BanwordMatcher::new(database.clone()),
            RateLimiter::new(store.clone()),
            filters,
            TopicAppender::new(database.clone(), idents.clone(), clock.clone()),
            posts.clone(),
            RetryPolicy::from_config(&config.queue),
        );

        let (queue, receiver) = TaskQueue::new(
            store.clone(),
            config.queue.buffer,
            config.queue.result_ttl_secs,
        );
        let workers = WorkerPool::spawn(
            config.queue.workers,
            receiver,
            queue.clone(),
            Arc::new(pipeline),
        );
        let moderation = ModerationService::new(database.clone(), clock);

        Ok(Self {
            config,
            database,
            store,
            queue,
            workers,
            moderation,
            posts,
        })
    }

    pub async fn submit_topic(&self, submission: TopicSubmission) -> Result<TaskUid> {
        self.queue.enqueue(Submission::Topic(submission)).await
    }

    pub async fn submit_reply(&self, submission: ReplySubmission) -> Result<TaskUid> {
        self.queue.enqueue(Submission::Reply(submission)).await
    }

    /// Posts straight to the topic as a moderator, outside the queue.
    pub async fn post_as_moderator(&self, reply: ModeratorReply) -> Result<i64> {
        Ok(self.posts.append_as_moderator(&reply).await?)
    }

    pub async fn task_status(&self, uid: &str) -> Result<TaskState> {
        self.queue.result(uid).await
    }

    /// Polls `task_status` until the task leaves `pending`.
    pub async fn wait_for(&self, uid: &str, timeout: Duration) -> Result<TaskState> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.task_status(uid).await?;
            if !state.is_pending() {
                return Ok(state);
            }
            if Instant::now() >= deadline {
                bail!("task {uid} still pending after {timeout:?}");
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    pub fn config(&self) -> &TextboardConfig {
        &self.config
    }

    pub fn database(&self) -> Database {
        self.database.clone()
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn moderation(&self) -> &ModerationService {
        &self.moderation
    }

    /// Lets queued submissions finish, then stops the workers.
    pub async fn shutdown(self) {
        self.workers.shutdown().await;
    }
}
