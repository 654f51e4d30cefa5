use super::{CheckRequest, ExternalCheck, Payload};
use crate::error::Rejection;
use anyhow::{Context, Result};
use async_trait::async_trait;

pub struct Akismet {
    client: reqwest::Client,
    endpoint: String,
}

impl Akismet {
    pub fn new(client: reqwest::Client, key: &str) -> Self {
        Self {
            client,
            endpoint: format!("https://{key}.rest.akismet.com/1.1/comment-check"),
        }
    }

    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

/// Form fields for `comment-check`, or `None` when the payload lacks the
/// request metadata Akismet needs.
fn comment_form<'a>(request: &CheckRequest<'a>, ip: &'a str) -> Option<[(&'static str, &'a str); 5]> {
    let payload: &'a Payload = request.payload;
    Some([
        ("comment_content", request.body),
        ("blog", payload.get("application_url")?.as_str()),
        ("user_ip", ip),
        ("user_agent", payload.get("user_agent")?.as_str()),
        ("referrer", payload.get("referrer")?.as_str()),
    ])
}

#[async_trait]
impl ExternalCheck for Akismet {
    fn name(&self) -> &'static str {
        "akismet"
    }

    fn rejection(&self) -> Rejection {
        Rejection::AkismetRejected
    }

    async fn should_reject(&self, request: &CheckRequest<'_>) -> Result<bool> {
        let ip = request.ip_address.to_string();
        let Some(form) = comment_form(request, &ip) else {
            tracing::debug!("payload lacks akismet fields, skipping");
            return Ok(false);
        };
        let response = self
            .client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .context("akismet request failed")?
            .error_for_status()
            .context("akismet returned an error status")?;
        let verdict = response.text().await.context("failed to read akismet response")?;
        Ok(verdict.trim() == "true")
    }
}
