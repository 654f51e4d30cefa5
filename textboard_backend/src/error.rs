use crate::kv::KvError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Logical refusal of a submission. Committed as a task result, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("address is banned")]
    BanRejected,
    #[error("body contains a banned word")]
    BanwordRejected,
    #[error("posting too fast, {time_left}s left")]
    RateLimited { time_left: u64 },
    #[error("target is {status}")]
    StatusRejected { status: String },
    #[error("address looks like a proxy")]
    ProxyRejected,
    #[error("body identified as spam")]
    AkismetRejected,
    #[error("address is listed in a DNSBL")]
    DnsblRejected,
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::BanRejected => "ban_rejected",
            Rejection::BanwordRejected => "banword_rejected",
            Rejection::RateLimited { .. } => "rate_limited",
            Rejection::StatusRejected { .. } => "status_rejected",
            Rejection::ProxyRejected => "proxy_rejected",
            Rejection::AkismetRejected => "akismet_rejected",
            Rejection::DnsblRejected => "dnsbl_rejected",
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("post number conflict in topic {0}")]
    Conflict(i64),
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl SubmissionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmissionError::Conflict(_) | SubmissionError::Transient(_))
    }
}

impl From<KvError> for SubmissionError {
    fn from(err: KvError) -> Self {
        SubmissionError::Transient(err.into())
    }
}

/// True when the error chain bottoms out in a SQLite constraint violation.
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == rusqlite::ErrorCode::ConstraintViolation
        )
    })
}
