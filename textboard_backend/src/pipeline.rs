use crate::bans::BanMatcher;
use crate::banwords::BanwordMatcher;
use crate::database::models::BoardRecord;
use crate::database::repositories::{BoardRepository, TopicRepository};
use crate::database::Database;
use crate::error::{Rejection, SubmissionError};
use crate::filters::{CheckRequest, FilterChain, Payload};
use crate::posting::{check_reply, check_topic_creation, PostAppender, TopicAppender};
use crate::rate_limiter::RateLimiter;
use crate::scope::ScopeContext;
use crate::tasks::{RetryPolicy, TaskOutcome};
use std::net::IpAddr;

#[derive(Debug, Clone)]
pub struct TopicSubmission {
    pub board_slug: String,
    pub title: String,
    pub body: String,
    pub ip_address: IpAddr,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub struct ReplySubmission {
    pub topic_id: i64,
    pub body: String,
    /// `false` for a sage reply that leaves `bumped_at` alone.
    pub bumped: bool,
    pub ip_address: IpAddr,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub enum Submission {
    Topic(TopicSubmission),
    Reply(ReplySubmission),
}

impl Submission {
    pub fn kind(&self) -> &'static str {
        match self {
            Submission::Topic(_) => "topic",
            Submission::Reply(_) => "reply",
        }
    }

    pub fn ip_address(&self) -> IpAddr {
        match self {
            Submission::Topic(input) => input.ip_address,
            Submission::Reply(input) => input.ip_address,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Submission::Topic(input) => &input.body,
            Submission::Reply(input) => &input.body,
        }
    }

    pub fn payload(&self) -> &Payload {
        match self {
            Submission::Topic(input) => &input.payload,
            Submission::Reply(input) => &input.payload,
        }
    }
}

/// Board a submission writes to, with the scope dimensions its ban and
/// banword rules are matched against.
struct Target {
    board: BoardRecord,
    scopes: ScopeContext,
}

/// Runs one submission through the admission checks and the appender.
#[derive(Clone)]
pub struct SubmissionPipeline {
    database: Database,
    bans: BanMatcher,
    banwords: BanwordMatcher,
    rate_limiter: RateLimiter,
    filters: FilterChain,
    topics: TopicAppender,
    posts: PostAppender,
    retry: RetryPolicy,
}

impl SubmissionPipeline {
    pub fn new(
        database: Database,
        bans: BanMatcher,
        banwords: BanwordMatcher,
        rate_limiter: RateLimiter,
        filters: FilterChain,
        topics: TopicAppender,
        posts: PostAppender,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            database,
            bans,
            banwords,
            rate_limiter,
            filters,
            topics,
            posts,
            retry,
        }
    }

    /// Rejections come back as `TaskOutcome::Failure`; only missing targets
    /// and exhausted retries are errors.
    pub async fn run(&self, submission: &Submission) -> Result<TaskOutcome, SubmissionError> {
        match self.process(submission).await {
            Err(SubmissionError::Rejected(rejection)) => {
                tracing::info!(
                    kind = submission.kind(),
                    ip_address = %submission.ip_address(),
                    reason = rejection.reason(),
                    "submission rejected"
                );
                Ok(TaskOutcome::Failure(rejection))
            }
            other => other,
        }
    }

    async fn process(&self, submission: &Submission) -> Result<TaskOutcome, SubmissionError> {
        self.retry
            .run("admit", move || self.admit(submission))
            .await?;
        match submission {
            Submission::Topic(input) => {
                let id = self
                    .retry
                    .run("append topic", move || self.topics.append(input))
                    .await?;
                Ok(TaskOutcome::Topic { id })
            }
            Submission::Reply(input) => {
                let id = self
                    .retry
                    .run("append reply", move || self.posts.append(input))
                    .await?;
                Ok(TaskOutcome::Post { id })
            }
        }
    }

    /// Every check up to and including arming the rate limit. The first
    /// failing check decides the outcome.
    async fn admit(&self, submission: &Submission) -> Result<(), SubmissionError> {
        let Target { board, scopes } = self.load_target(submission)?;
        let ip_address = submission.ip_address();

        if self.bans.is_banned(ip_address, &scopes)? {
            return Err(Rejection::BanRejected.into());
        }
        if self.banwords.is_banned(submission.body(), &scopes)? {
            return Err(Rejection::BanwordRejected.into());
        }

        let ip = ip_address.to_string();
        let key = [("ip_address", ip.as_str()), ("board", board.slug.as_str())];
        if self.rate_limiter.is_limited(&key).await? {
            return Err(self.rate_limited(&key).await?.into());
        }

        let request = CheckRequest {
            ip_address,
            body: submission.body(),
            payload: submission.payload(),
        };
        if let Some(rejection) = self.filters.evaluate(&request).await? {
            return Err(rejection.into());
        }

        if !self
            .rate_limiter
            .try_limit_for(board.settings.post_delay, &key)
            .await?
        {
            return Err(self.rate_limited(&key).await?.into());
        }
        Ok(())
    }

    fn load_target(&self, submission: &Submission) -> Result<Target, SubmissionError> {
        match submission {
            Submission::Topic(input) => {
                let board = self
                    .database
                    .with_repositories(|repos| repos.boards().get_by_slug(&input.board_slug))?
                    .ok_or_else(|| SubmissionError::NotFound(format!("board {}", input.board_slug)))?;
                check_topic_creation(&board)?;
                let scopes = ScopeContext::new().with("board", &board.slug);
                Ok(Target { board, scopes })
            }
            Submission::Reply(input) => {
                let (topic, board) = self.database.with_repositories(|repos| {
                    let Some(topic) = repos.topics().get(input.topic_id)? else {
                        return Ok(None);
                    };
                    Ok(repos.boards().get(topic.board_id)?.map(|board| (topic, board)))
                })?
                .ok_or_else(|| SubmissionError::NotFound(format!("topic {}", input.topic_id)))?;
                check_reply(&board, &topic)?;
                let scopes = ScopeContext::new()
                    .with("board", &board.slug)
                    .with("topic", &topic.title);
                Ok(Target { board, scopes })
            }
        }
    }

    async fn rate_limited(&self, key: &[(&str, &str)]) -> Result<Rejection, SubmissionError> {
        let time_left = self.rate_limiter.time_left(key).await?.max(1);
        Ok(Rejection::RateLimited { time_left })
    }
}
