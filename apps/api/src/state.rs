use std::sync::Arc;

use crate::channel::ChannelGateway;
use crate::config::Config;
use crate::conversation::Mediator;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub mediator: Arc<Mediator>,
    pub channel: Arc<dyn ChannelGateway>,
    pub config: Config,
}
