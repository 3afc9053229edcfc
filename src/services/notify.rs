//! src/services/notify.rs
//!
//! Notification sinks: user-facing archival notices and the admin alert
//! channel. Every sink here is best-effort by contract: callers log
//! delivery failures and carry on, and a notification error never changes
//! the terminal state of a job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid notification endpoint `{0}`")]
    InvalidEndpoint(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type NotifyResult<T> = Result<T, NotifyError>;

/// Outcome communicated to the upload's owner.
#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum NoticeOutcome {
    Success,
    Failed,
}

impl NoticeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeOutcome::Success => "success",
            NoticeOutcome::Failed => "failed",
        }
    }
}

/// Details attached to a success notice.
#[derive(Serialize, Clone, Debug)]
pub struct ArchiveDetails {
    pub tape_location: String,
    pub tape_number: String,
    pub requested_at: DateTime<Utc>,
}

/// Job context attached to an admin alert.
#[derive(Serialize, Clone, Debug)]
pub struct AlertContext {
    pub file_id: i64,
    pub file_name: String,
}

/// Delivers archival notices to upload owners.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn file_processed(
        &self,
        to: &str,
        file_name: &str,
        outcome: NoticeOutcome,
        details: Option<&ArchiveDetails>,
    ) -> NotifyResult<()>;
}

/// Raises structured alerts on the admin channel when a job fails.
#[async_trait]
pub trait AdminAlerter: Send + Sync {
    async fn critical_error(
        &self,
        stage: &str,
        error: &str,
        context: &AlertContext,
    ) -> NotifyResult<()>;
}

fn build_client() -> NotifyResult<Client> {
    Ok(Client::builder().timeout(SEND_TIMEOUT).build()?)
}

fn parse_endpoint(endpoint: &str) -> NotifyResult<Url> {
    Url::parse(endpoint).map_err(|_| NotifyError::InvalidEndpoint(endpoint.to_string()))
}

/// Posts notices as JSON to a mail relay endpoint.
#[derive(Clone, Debug)]
pub struct WebhookMailer {
    client: Client,
    endpoint: Url,
}

impl WebhookMailer {
    pub fn new(endpoint: &str) -> NotifyResult<Self> {
        Ok(Self {
            client: build_client()?,
            endpoint: parse_endpoint(endpoint)?,
        })
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    async fn file_processed(
        &self,
        to: &str,
        file_name: &str,
        outcome: NoticeOutcome,
        details: Option<&ArchiveDetails>,
    ) -> NotifyResult<()> {
        let payload = serde_json::json!({
            "to": to,
            "file_name": file_name,
            "outcome": outcome,
            "details": details,
        });
        self.client
            .post(self.endpoint.clone())
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Posts alerts as JSON to the admin channel endpoint.
#[derive(Clone, Debug)]
pub struct WebhookAlerter {
    client: Client,
    endpoint: Url,
}

impl WebhookAlerter {
    pub fn new(endpoint: &str) -> NotifyResult<Self> {
        Ok(Self {
            client: build_client()?,
            endpoint: parse_endpoint(endpoint)?,
        })
    }
}

#[async_trait]
impl AdminAlerter for WebhookAlerter {
    async fn critical_error(
        &self,
        stage: &str,
        error: &str,
        context: &AlertContext,
    ) -> NotifyResult<()> {
        let payload = serde_json::json!({
            "stage": stage,
            "error": error,
            "context": context,
        });
        self.client
            .post(self.endpoint.clone())
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Fallback sink when no mail relay is configured; notices land in the log.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn file_processed(
        &self,
        to: &str,
        file_name: &str,
        outcome: NoticeOutcome,
        details: Option<&ArchiveDetails>,
    ) -> NotifyResult<()> {
        info!(
            to,
            file_name,
            outcome = outcome.as_str(),
            ?details,
            "mail relay not configured, notice logged only"
        );
        Ok(())
    }
}

/// Fallback sink when no admin channel is configured.
pub struct LogAlerter;

#[async_trait]
impl AdminAlerter for LogAlerter {
    async fn critical_error(
        &self,
        stage: &str,
        error: &str,
        context: &AlertContext,
    ) -> NotifyResult<()> {
        error!(
            stage,
            error,
            file_id = context.file_id,
            file_name = %context.file_name,
            "admin channel not configured, alert logged only"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn success_notice_posts_outcome_and_details() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(serde_json::json!({
                "to": "mira@example.com",
                "file_name": "report.pdf",
                "outcome": "success",
                "details": { "tape_number": "T1" }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mailer = WebhookMailer::new(&server.uri()).expect("mailer should build");
        let details = ArchiveDetails {
            tape_location: "/tapes/T1/physics/1_report.pdf".into(),
            tape_number: "T1".into(),
            requested_at: Utc::now(),
        };
        mailer
            .file_processed(
                "mira@example.com",
                "report.pdf",
                NoticeOutcome::Success,
                Some(&details),
            )
            .await
            .expect("notice should be delivered");
    }

    #[tokio::test]
    async fn relay_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let mailer = WebhookMailer::new(&server.uri()).expect("mailer should build");
        let err = mailer
            .file_processed("mira@example.com", "report.pdf", NoticeOutcome::Failed, None)
            .await
            .expect_err("relay failure should surface");
        assert!(matches!(err, NotifyError::Http(_)));
    }

    #[tokio::test]
    async fn alert_posts_stage_and_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(serde_json::json!({
                "stage": "file_verification",
                "context": { "file_id": 9, "file_name": "report.pdf" }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let alerter = WebhookAlerter::new(&server.uri()).expect("alerter should build");
        alerter
            .critical_error(
                "file_verification",
                "size mismatch",
                &AlertContext {
                    file_id: 9,
                    file_name: "report.pdf".into(),
                },
            )
            .await
            .expect("alert should be delivered");
    }

    #[test]
    fn bad_endpoint_is_rejected() {
        let err = WebhookMailer::new("not a url").expect_err("parse should fail");
        assert!(matches!(err, NotifyError::InvalidEndpoint(_)));
    }
}
