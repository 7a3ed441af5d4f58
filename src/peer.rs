//! Peer negotiation controller.
//!
//! The actual peer-to-peer object is an external, callback-driven
//! collaborator. It is reached only through [`NegotiatorFactory`] and
//! [`Negotiator`], and reports back on a [`NegotiationEvent`] channel.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::IceServer;
use crate::error::NegotiationError;
use crate::media::{LocalStream, RemoteStream};
use crate::models::SignalEnvelope;
use crate::session::Role;

/// Events raised by a negotiation object
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    /// Outbound negotiation payload for the peer
    Signal(Value),
    Stream(RemoteStream),
    Connect,
    /// The peer ended the call
    Close,
    Error(String),
}

/// Sink a negotiator reports its events on
pub type NegotiationEvents = mpsc::UnboundedSender<NegotiationEvent>;

/// One live peer-to-peer negotiation object
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Apply a payload received from the peer
    async fn feed_signal(&self, data: Value) -> Result<(), NegotiationError>;

    /// Release the connection; must tolerate repeated calls
    async fn destroy(&self);
}

/// Builds negotiators for new calls
#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    /// Create a negotiation object. An initiator starts emitting its offer on
    /// `events` right away.
    async fn create(
        &self,
        role: Role,
        stream: LocalStream,
        ice_servers: &[IceServer],
        events: NegotiationEvents,
    ) -> Result<Arc<dyn Negotiator>, NegotiationError>;
}

/// Routing for one controller: who we are talking to, and about which room
#[derive(Debug, Clone)]
pub struct PeerRoute {
    pub room_code: String,
    pub target: String,
    pub local_name: String,
}

/// Owns exactly one negotiation object for the current room
pub struct PeerController {
    id: u64,
    route: PeerRoute,
    negotiator: Arc<dyn Negotiator>,
    pump: JoinHandle<()>,
    destroyed: bool,
}

impl PeerController {
    /// Create the negotiation object and start forwarding its events,
    /// tagged with `id`, to `on_event`.
    pub async fn start<F>(
        id: u64,
        role: Role,
        stream: LocalStream,
        route: PeerRoute,
        factory: &dyn NegotiatorFactory,
        ice_servers: &[IceServer],
        on_event: F,
    ) -> Result<Self, NegotiationError>
    where
        F: Fn(u64, NegotiationEvent) + Send + Sync + 'static,
    {
        info!(
            "Creating {} peer {} for room {} -> {}",
            role, id, route.room_code, route.target
        );

        let (events, mut rx) = mpsc::unbounded_channel();
        let negotiator = factory.create(role, stream, ice_servers, events).await?;

        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                on_event(id, event);
            }
            debug!("Peer {} event stream ended", id);
        });

        Ok(Self {
            id,
            route,
            negotiator,
            pump,
            destroyed: false,
        })
    }

    /// Tag carried by every event this controller forwards
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Room and target this controller negotiates with
    pub fn route(&self) -> &PeerRoute {
        &self.route
    }

    /// True once [`PeerController::destroy`] has run
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Wrap an outbound negotiation payload for the signaling channel
    pub fn envelope_for(&self, data: Value) -> SignalEnvelope {
        SignalEnvelope {
            room_code: self.route.room_code.clone(),
            target: self.route.target.clone(),
            from: self.route.local_name.clone(),
            data,
        }
    }

    /// Hand an inbound payload to the negotiation object. Ignored after destroy.
    pub async fn feed(&self, data: Value) -> Result<(), NegotiationError> {
        if self.destroyed {
            debug!("Ignoring signal for destroyed peer {}", self.id);
            return Ok(());
        }
        self.negotiator.feed_signal(data).await
    }

    /// Close the negotiator and stop forwarding events. Runs once.
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.pump.abort();
        self.negotiator.destroy().await;
        info!("Destroyed peer {}", self.id);
    }
}

impl Drop for PeerController {
    fn drop(&mut self) {
        if !self.destroyed {
            warn!("Peer {} dropped without destroy", self.id);
            self.pump.abort();
        }
    }
}
