//! Mail submission collaborator and dispatch receipt.
//!
//! The at-most-once guarantee does NOT live here: the mediator's
//! compare-and-swap into the `Sending` phase is the exclusivity boundary, and
//! only the writer that wins that commit calls `deliver`. This module is the
//! thin submission client behind that gate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::generation::EmailDraft;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mail API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("dispatch timed out")]
    Timeout,
}

/// Proof that exactly one send happened for a conversation lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub message_id: String,
    pub dispatched_at: DateTime<Utc>,
}

#[async_trait]
pub trait MailSubmitter: Send + Sync {
    async fn deliver(&self, draft: &EmailDraft) -> Result<DispatchReceipt, DispatchError>;
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: String,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<RequestAttachment<'a>>,
}

/// Mail APIs take attachment bytes base64-encoded inside the JSON payload.
#[derive(Debug, Serialize)]
struct RequestAttachment<'a> {
    filename: &'a str,
    content: String,
}

fn build_request<'a>(from: String, draft: &'a EmailDraft) -> SendRequest<'a> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let attachments = draft
        .attachment
        .iter()
        .map(|a| RequestAttachment {
            filename: &a.filename,
            content: STANDARD.encode(&a.content),
        })
        .collect();

    SendRequest {
        from,
        to: &draft.recipient,
        subject: &draft.subject,
        text: &draft.body,
        attachments,
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

/// HTTP client for a JSON mail-submission API.
pub struct HttpMailSubmitter {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    sender_name: String,
    sender_email: String,
}

impl HttpMailSubmitter {
    pub fn new(
        api_url: String,
        api_key: String,
        sender_name: String,
        sender_email: String,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            api_url,
            api_key,
            sender_name,
            sender_email,
        }
    }
}

#[async_trait]
impl MailSubmitter for HttpMailSubmitter {
    async fn deliver(&self, draft: &EmailDraft) -> Result<DispatchReceipt, DispatchError> {
        let request = build_request(
            format!("{} <{}>", self.sender_name, self.sender_email),
            draft,
        );

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DispatchError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: SendResponse = response.json().await?;
        Ok(DispatchReceipt {
            message_id: body.id,
            dispatched_at: Utc::now(),
        })
    }
}
