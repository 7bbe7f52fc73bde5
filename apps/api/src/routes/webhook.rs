//! Inbound webhook for the messaging provider. Translates the provider's
//! form payload into an `InboundMessage`, runs the mediator turn, and pushes
//! the reply back out through the channel gateway. The HTTP response itself
//! is always an empty TwiML document; the real reply travels over the
//! provider's message API.
//!
//! Every request must carry a valid provider signature: HMAC-SHA256 over the
//! form parameters (sorted by key, key and value concatenated), keyed with
//! the shared auth token and base64-encoded. Anything else gets a 403.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Form;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{error, info, warn};

use crate::conversation::InboundMessage;
use crate::errors::AppError;
use crate::state::AppState;

const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

const SIGNATURE_HEADER: &str = "X-Channel-Signature";

type HmacSha256 = Hmac<Sha256>;

/// Twilio-style form payload. Only the first media item is considered; a
/// resume is a single document.
#[derive(Debug)]
pub struct WebhookPayload {
    pub from: String,
    pub body: Option<String>,
    pub num_media: Option<String>,
    pub media_url: Option<String>,
    pub media_content_type: Option<String>,
}

impl WebhookPayload {
    fn from_params(params: &BTreeMap<String, String>) -> Self {
        Self {
            from: params.get("From").cloned().unwrap_or_default(),
            body: params.get("Body").cloned(),
            num_media: params.get("NumMedia").cloned(),
            media_url: params.get("MediaUrl0").cloned(),
            media_content_type: params.get("MediaContentType0").cloned(),
        }
    }
}

/// Checks the provider signature header against the form parameters.
/// Comparison is constant-time via the MAC's own verifier.
fn verify_signature(
    auth_token: &str,
    headers: &HeaderMap,
    params: &BTreeMap<String, String>,
) -> bool {
    let Some(provided) = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| STANDARD.decode(v).ok())
    else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(auth_token.as_bytes()) else {
        return false;
    };
    for (key, value) in params {
        mac.update(key.as_bytes());
        mac.update(value.as_bytes());
    }
    mac.verify_slice(&provided).is_ok()
}

/// POST /webhook/message
pub async fn message_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<BTreeMap<String, String>>,
) -> Result<Response, AppError> {
    if !verify_signature(&state.config.channel_auth_token, &headers, &params) {
        warn!("Rejected message webhook with bad or missing signature");
        return Err(AppError::Forbidden);
    }

    let payload = WebhookPayload::from_params(&params);
    if payload.from.is_empty() {
        return Err(AppError::Validation("missing From field".to_string()));
    }
    // The channel address doubles as the conversation key.
    let user_id = payload.from.clone();
    let display_id = user_id.replace("whatsapp:", "");
    info!("Inbound message from {display_id}");

    let attachment = match pdf_media_url(&payload) {
        Some(url) => match state.channel.fetch_media(url).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                // Treat an undownloadable attachment like a missing one; the
                // mediator will re-prompt for whatever is still needed.
                error!("Media download failed for {display_id}: {e}");
                None
            }
        },
        None => None,
    };

    let text = payload.body.filter(|b| !b.trim().is_empty());
    let reply = state
        .mediator
        .handle_turn(InboundMessage {
            user_id: user_id.clone(),
            text,
            attachment,
        })
        .await;

    if let Err(e) = state.channel.send(&reply.user_id, &reply.text).await {
        error!("Failed to deliver reply to {display_id}: {e}");
    }

    Ok(([(header::CONTENT_TYPE, "application/xml")], EMPTY_TWIML).into_response())
}

/// Provider status callback payload.
#[derive(Debug)]
pub struct SessionPayload {
    pub from: String,
    pub status: String,
}

impl SessionPayload {
    fn from_params(params: &BTreeMap<String, String>) -> Self {
        Self {
            from: params.get("From").cloned().unwrap_or_default(),
            status: params.get("SessionStatus").cloned().unwrap_or_default(),
        }
    }
}

/// POST /webhook/session
/// The provider reports session lifecycle events here. An abandoned session
/// forcibly fails its conversation; one already dispatching is left alone.
pub async fn session_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<BTreeMap<String, String>>,
) -> Result<Response, AppError> {
    if !verify_signature(&state.config.channel_auth_token, &headers, &params) {
        warn!("Rejected session webhook with bad or missing signature");
        return Err(AppError::Forbidden);
    }

    let payload = SessionPayload::from_params(&params);
    if payload.status.eq_ignore_ascii_case("abandoned")
        || payload.status.eq_ignore_ascii_case("expired")
    {
        match state.mediator.fail_conversation(&payload.from).await {
            Ok(true) => info!("Session for {} reported {}; conversation failed", payload.from, payload.status),
            Ok(false) => info!("Session for {} reported {}; no transition needed", payload.from, payload.status),
            Err(e) => error!("Failed to terminate conversation for {}: {e}", payload.from),
        }
    }
    Ok(([(header::CONTENT_TYPE, "application/xml")], EMPTY_TWIML).into_response())
}

/// Picks the media URL if and only if the payload carries a PDF attachment.
fn pdf_media_url(payload: &WebhookPayload) -> Option<&str> {
    let count: usize = payload
        .num_media
        .as_deref()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    if count == 0 {
        return None;
    }
    match payload.media_content_type.as_deref() {
        Some(ct) if ct.eq_ignore_ascii_case("application/pdf") => payload.media_url.as_deref(),
        Some(ct) => {
            warn!("Ignoring non-PDF media: {ct}");
            None
        }
        None => None,
    }
}
