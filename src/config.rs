//! Client configuration: service endpoints and ICE servers

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ChannelError;

pub const DEFAULT_MATCHING_URL: &str = "http://localhost:8000";
pub const DEFAULT_MATCHING_WS: &str = "ws://localhost:8000/ws";
pub const DEFAULT_SIGNALING_WS: &str = "ws://localhost:4000/ws";

/// How long to wait for the signaling channel to open after media is ready
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

const OPENRELAY_CREDENTIAL: &str = "openrelayproject";

/// A STUN or TURN endpoint handed to the negotiation backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    /// Unauthenticated STUN server
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    /// TURN relay with static credentials
    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

/// Public STUN/TURN list shared by every session
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer::stun("stun:stun.l.google.com:19302"),
        IceServer::stun("stun:stun1.l.google.com:19302"),
        IceServer::stun("stun:stun2.l.google.com:19302"),
        IceServer::stun("stun:stun3.l.google.com:19302"),
        IceServer::stun("stun:stun4.l.google.com:19302"),
        IceServer::turn(
            "turn:openrelay.metered.ca:80",
            OPENRELAY_CREDENTIAL,
            OPENRELAY_CREDENTIAL,
        ),
        IceServer::turn(
            "turn:openrelay.metered.ca:443",
            OPENRELAY_CREDENTIAL,
            OPENRELAY_CREDENTIAL,
        ),
        IceServer::turn(
            "turn:openrelay.metered.ca:443?transport=tcp",
            OPENRELAY_CREDENTIAL,
            OPENRELAY_CREDENTIAL,
        ),
    ]
}

/// Service endpoints and call settings
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the matching service HTTP API
    pub matching_url: String,
    /// Base URL of the matching WebSocket; the display name is appended
    pub matching_ws: String,
    /// Base URL of the signaling WebSocket; the display name is appended
    pub signaling_ws: String,
    pub ice_servers: Vec<IceServer>,
    pub ready_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            matching_url: DEFAULT_MATCHING_URL.to_string(),
            matching_ws: DEFAULT_MATCHING_WS.to_string(),
            signaling_ws: DEFAULT_SIGNALING_WS.to_string(),
            ice_servers: default_ice_servers(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

impl Config {
    /// `POST` target for registration, kept under any base path
    pub fn registration_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.matching_url)?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push("registerForMatching");
        Ok(url)
    }

    /// Matching channel URL for `name`
    pub fn matching_endpoint(&self, name: &str) -> Result<Url, ChannelError> {
        endpoint(&self.matching_ws, name)
    }

    /// Signaling channel URL for `name`
    pub fn signaling_endpoint(&self, name: &str) -> Result<Url, ChannelError> {
        endpoint(&self.signaling_ws, name)
    }
}

/// Append `name` to `base` as one percent-encoded path segment
pub fn endpoint(base: &str, name: &str) -> Result<Url, ChannelError> {
    let mut url = Url::parse(base)?;
    {
        let mut segments = url.path_segments_mut().map_err(|_| ChannelError::Connect {
            url: base.to_string(),
            reason: "cannot append path to this url".into(),
        })?;
        segments.pop_if_empty().push(name);
    }
    Ok(url)
}
