//! Messaging-channel gateway. The rest of the service only ever sees
//! `InboundMessage`/`OutboundReply`; the provider's wire format lives here.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("channel API error ({status}): {message}")]
    Api { status: u16, message: String },
}

/// Outbound side of the messaging provider: push a reply to a user, and
/// fetch media the provider hosts behind authenticated URLs.
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    async fn send(&self, user_id: &str, text: &str) -> Result<(), ChannelError>;

    /// Downloads an inbound attachment. Provider media URLs require the
    /// account's basic-auth credentials.
    async fn fetch_media(&self, url: &str) -> Result<Bytes, ChannelError>;
}

/// Twilio-style REST gateway: form-encoded message create, basic auth on
/// both the API and media hosts.
pub struct HttpChannelGateway {
    client: Client,
    api_url: String,
    account_id: String,
    auth_token: String,
    sender: String,
}

impl HttpChannelGateway {
    pub fn new(api_url: String, account_id: String, auth_token: String, sender: String) -> Self {
        Self {
            client: Client::new(),
            api_url,
            account_id,
            auth_token,
            sender,
        }
    }
}

#[async_trait]
impl ChannelGateway for HttpChannelGateway {
    async fn send(&self, user_id: &str, text: &str) -> Result<(), ChannelError> {
        let url = format!("{}/Accounts/{}/Messages.json", self.api_url, self.account_id);
        let params = [("From", self.sender.as_str()), ("To", user_id), ("Body", text)];

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_id, Some(&self.auth_token))
            .form(&params)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ChannelError::Api {
                status: status.as_u16(),
                message,
            });
        }
        debug!("Delivered channel message to {user_id}");
        Ok(())
    }

    async fn fetch_media(&self, url: &str) -> Result<Bytes, ChannelError> {
        let response = self
            .client
            .get(url)
            .basic_auth(&self.account_id, Some(&self.auth_token))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Api {
                status: status.as_u16(),
                message: format!("media download from {url} failed"),
            });
        }
        Ok(response.bytes().await?)
    }
}
