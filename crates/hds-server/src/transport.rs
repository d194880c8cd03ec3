//! The transport boundary.
//!
//! Packet framing, reliability, and socket I/O live outside this crate; the
//! orchestration core only needs to hand labeled messages to an address or
//! an admitted node.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::OutboundMessage;

/// Outbound half of the transport collaborator.
pub trait Transport: Send + Sync {
    /// Fire-and-forget send to an address.
    fn send(&self, to: SocketAddr, message: OutboundMessage);

    /// Reliable, ordered delivery to an admitted node.
    fn send_reliable(&self, node_id: Uuid, messages: Vec<OutboundMessage>);
}

/// Transport double that records every send for inspection.
///
/// Used by the test suites and by the binary before a real transport is
/// attached.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(SocketAddr, OutboundMessage)>>,
    reliable: Mutex<Vec<(Uuid, Vec<OutboundMessage>)>>,
}

impl RecordingTransport {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything sent unreliably so far.
    #[must_use]
    pub fn sent(&self) -> Vec<(SocketAddr, OutboundMessage)> {
        self.sent.lock().clone()
    }

    /// Everything sent reliably so far.
    #[must_use]
    pub fn reliable(&self) -> Vec<(Uuid, Vec<OutboundMessage>)> {
        self.reliable.lock().clone()
    }

    /// Drop all recorded traffic.
    pub fn clear(&self) {
        self.sent.lock().clear();
        self.reliable.lock().clear();
    }
}

impl Transport for RecordingTransport {
    fn send(&self, to: SocketAddr, message: OutboundMessage) {
        debug!(%to, ?message, "transport send");
        self.sent.lock().push((to, message));
    }

    fn send_reliable(&self, node_id: Uuid, messages: Vec<OutboundMessage>) {
        debug!(node = %node_id, count = messages.len(), "transport reliable send");
        self.reliable.lock().push((node_id, messages));
    }
}
