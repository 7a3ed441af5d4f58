//! Ordered buffer for negotiation messages awaiting a verified channel

use std::collections::VecDeque;

use crate::models::SignalEnvelope;

/// Outbound envelopes held back until the signaling channel is verified
#[derive(Debug, Default)]
pub struct PendingSignalQueue {
    entries: VecDeque<SignalEnvelope>,
}

impl PendingSignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the back
    pub fn push(&mut self, envelope: SignalEnvelope) {
        self.entries.push_back(envelope);
    }

    /// Take every queued envelope in insertion order, leaving the queue empty
    pub fn drain(&mut self) -> Vec<SignalEnvelope> {
        self.entries.drain(..).collect()
    }

    /// Drop everything queued
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
