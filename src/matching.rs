//! Matching service client: registration over HTTP and the per-user channel
//! that delivers match notifications and relays chat

use tracing::{debug, info};
use url::Url;

use crate::config::Config;
use crate::error::{ChannelError, RegisterError};
use crate::models::{MatchingCommand, MatchingEvent, RegisterRequest, RegisterResponse, RegisterStatus};
use crate::ws::{WsLink, WsUpdate};

/// HTTP half of the matching service
#[derive(Debug, Clone)]
pub struct MatchingClient {
    http: reqwest::Client,
    registration_url: Url,
}

impl MatchingClient {
    /// Resolve the registration URL and build the HTTP client
    pub fn new(config: &Config) -> Result<Self, RegisterError> {
        Ok(Self {
            http: reqwest::Client::new(),
            registration_url: config.registration_url()?,
        })
    }

    /// Put `name` into the matching queue
    pub async fn register(&self, name: &str) -> Result<RegisterStatus, RegisterError> {
        debug!("Registering {} at {}", name, self.registration_url);
        let body: RegisterResponse = self
            .http
            .post(self.registration_url.clone())
            .json(&RegisterRequest {
                name: name.to_string(),
            })
            .send()
            .await?
            .json()
            .await?;

        debug!(
            "Registration response for {}: {} ({:?})",
            name, body.status, body.message
        );
        Ok(RegisterStatus::from(body.status.as_str()))
    }
}

/// One bidirectional channel to the matching service, keyed by display name
#[derive(Debug)]
pub struct MatchingChannel {
    id: u64,
    name: String,
    link: WsLink<MatchingCommand>,
    open: bool,
}

impl MatchingChannel {
    /// Connect as `name`; events arrive on `on_update` tagged with `id`
    pub fn open<F>(url: Url, id: u64, name: &str, on_update: F) -> Self
    where
        F: Fn(WsUpdate<MatchingEvent>) + Send + Sync + 'static,
    {
        info!("Opening matching channel {} for {}", id, name);
        Self {
            id,
            name: name.to_string(),
            link: WsLink::connect(url, on_update),
            open: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn mark_open(&mut self) {
        self.open = true;
    }

    /// Relay a chat line to `peer` through the matching service
    pub fn send_chat(&self, peer: &str, message: &str) -> Result<(), ChannelError> {
        self.link.send(MatchingCommand::Chat {
            peer: peer.to_string(),
            message: message.to_string(),
        })
    }

    /// Close the socket
    pub fn close(self) {
        info!("Closing matching channel {} for {}", self.id, self.name);
        self.link.close();
    }
}
