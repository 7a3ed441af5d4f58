//! Signaling service channel with a verification gate.
//!
//! Negotiation messages may only be transmitted once the service has
//! verified our room membership. Until then they are held in a
//! [`PendingSignalQueue`] and flushed, in order, on the `verified` event.

use tracing::{debug, info};
use url::Url;

use crate::error::ChannelError;
use crate::models::{SignalEnvelope, SignalingCommand, SignalingEvent};
use crate::queue::PendingSignalQueue;
use crate::session::RoomBinding;
use crate::ws::{WsLink, WsUpdate};

/// How far the signaling socket has come
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Connecting,
    Open,
    Verified,
}

/// What happened to an envelope handed to [`SignalingChannel::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
}

/// Per-call signaling socket with the verification gate
#[derive(Debug)]
pub struct SignalingChannel {
    id: u64,
    link: WsLink<SignalingCommand>,
    readiness: Readiness,
    pending: PendingSignalQueue,
}

impl SignalingChannel {
    /// Start connecting to `url`; socket events arrive on `on_update` tagged with `id`
    pub fn open<F>(url: Url, id: u64, on_update: F) -> Self
    where
        F: Fn(WsUpdate<SignalingEvent>) + Send + Sync + 'static,
    {
        info!("Opening signaling channel {} at {}", id, url);
        Self::with_link(id, WsLink::connect(url, on_update))
    }

    fn with_link(id: u64, link: WsLink<SignalingCommand>) -> Self {
        Self {
            id,
            link,
            readiness: Readiness::Connecting,
            pending: PendingSignalQueue::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn is_open(&self) -> bool {
        self.readiness != Readiness::Connecting
    }

    /// True once the service accepted our `join`
    pub fn is_verified(&self) -> bool {
        self.readiness == Readiness::Verified
    }

    /// Envelopes waiting for verification
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Record that the socket finished its handshake
    pub fn mark_open(&mut self) {
        if self.readiness == Readiness::Connecting {
            self.readiness = Readiness::Open;
        }
    }

    /// Request verification for the room. Goes out directly, ahead of any
    /// queued negotiation traffic.
    pub fn join(&self, binding: &RoomBinding) -> Result<(), ChannelError> {
        self.link.send(SignalingCommand::Join {
            room_code: binding.room_code.clone(),
            target: binding.peer_name.clone(),
            role: binding.role,
        })
    }

    /// Transmit `envelope` if verified, otherwise queue it
    pub fn send(&mut self, envelope: SignalEnvelope) -> Result<Delivery, ChannelError> {
        if !self.is_verified() {
            debug!(
                "Queued {} signal for {} (channel {:?})",
                envelope.kind().unwrap_or("unknown"),
                envelope.target,
                self.readiness
            );
            self.pending.push(envelope);
            return Ok(Delivery::Queued);
        }

        debug!(
            "Sent {} signal to {}",
            envelope.kind().unwrap_or("unknown"),
            envelope.target
        );
        self.link.send(SignalingCommand::Signal(envelope))?;
        Ok(Delivery::Sent)
    }

    /// Record verification and flush the queue, returning how many envelopes
    /// were sent. Later calls find the queue empty.
    pub fn mark_verified(&mut self) -> Result<usize, ChannelError> {
        self.readiness = Readiness::Verified;
        let pending = self.pending.drain();
        let count = pending.len();
        for envelope in pending {
            self.link.send(SignalingCommand::Signal(envelope))?;
        }
        if count > 0 {
            info!("Flushed {} queued signals on channel {}", count, self.id);
        }
        Ok(count)
    }

    /// Close the socket, discarding anything still queued
    pub fn close(mut self) {
        let dropped = self.pending.len();
        self.pending.clear();
        info!(
            "Closing signaling channel {} ({} queued signals dropped)",
            self.id, dropped
        );
        self.link.close();
    }

    #[cfg(test)]
    pub(crate) fn detached(id: u64) -> (Self, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (link, rx) = WsLink::detached();
        (Self::with_link(id, link), rx)
    }
}
