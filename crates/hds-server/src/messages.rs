//! The closed message vocabulary of the event loop.
//!
//! Every inbound packet the transport can deliver decodes into exactly one
//! [`DomainMessage`] variant, matched exhaustively in one place. Outbound
//! traffic is a [`OutboundMessage`], handed back to the transport.

use std::net::SocketAddr;

use bytes::Bytes;
use uuid::Uuid;

use hds_core::{AssignmentKind, NodeDescriptor, NodeKind};
use hds_ice::SignedHeartbeat;
use hds_registry::RosterEntry;

/// Protocol version the server speaks.
pub const PROTOCOL_VERSION: u32 = 17;

/// A verified connect request from a new participant.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Session id the participant proposes for itself.
    pub candidate_id: Uuid,
    /// Role it wants to connect as.
    pub kind: NodeKind,
    /// Protocol version it speaks.
    pub protocol_version: u32,
    /// Address the request arrived from; denials are sent here.
    pub sender_socket: SocketAddr,
    /// Publicly reachable address it advertises.
    pub public_socket: SocketAddr,
    /// Local-network address it advertises.
    pub local_socket: SocketAddr,
    /// Kinds it wants disclosed to it.
    pub interest_set: Vec<NodeKind>,
    /// The ephemeral hand-out id, when connecting to fulfill an assignment.
    pub assignment_id: Option<Uuid>,
}

/// Everything the transport can deliver to the event loop.
#[derive(Debug, Clone)]
pub enum DomainMessage {
    /// Verified connect request.
    Connect(ConnectRequest),
    /// Roster refresh from an admitted node.
    ListRequest {
        /// The requesting node.
        node_id: Uuid,
        /// Possibly-changed public address.
        public_socket: SocketAddr,
        /// Possibly-changed local address.
        local_socket: SocketAddr,
        /// Possibly-changed interest set.
        interest_set: Vec<NodeKind>,
    },
    /// An unclaimed process asking for work.
    RequestAssignment {
        /// Requested kind, possibly `AllTypes`.
        kind: AssignmentKind,
        /// Requested pool.
        pool: String,
        /// Wallet the requester wants credited.
        wallet_id: Option<Uuid>,
        /// Requester's software version.
        version: Option<String>,
        /// Source address, checked against the subnet allow-list and used
        /// for the reply.
        sender_socket: SocketAddr,
    },
    /// Explicit disconnect notice from a node.
    Disconnect {
        /// The departing node.
        node_id: Uuid,
    },
    /// The rendezvous server acknowledged our heartbeat.
    IceHeartbeatAck,
    /// The rendezvous server denied our heartbeat.
    IceHeartbeatDenial,
}

/// Why a connect request was refused with an explicit reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDeniedReason {
    /// The client speaks a different protocol version. An explicit denial,
    /// not a silent drop, so outdated clients can show a meaningful error.
    ProtocolMismatch,
    /// The presented assignment hand-out is unknown or already claimed.
    InvalidAssignment,
}

/// Everything the event loop can hand to the transport.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Full roster for a node, with per-pair secrets.
    DomainList {
        /// The domain's own session id.
        domain_id: Uuid,
        /// Recipient's session id.
        node_id: Uuid,
        /// Recipient's compact alias.
        local_id: u16,
        /// Recipient's permission bits.
        permissions: u32,
        /// Visible peers.
        entries: Vec<RosterEntry>,
    },
    /// A node joined that the recipient declared interest in.
    NodeAdded {
        /// The newcomer.
        node: NodeDescriptor,
        /// Secret between the recipient and the newcomer.
        secret: Uuid,
    },
    /// A node the recipient knew about left.
    NodeRemoved {
        /// The departed node.
        node_id: Uuid,
    },
    /// An assignment offer for a requester.
    AssignmentOffer {
        /// Ephemeral hand-out id.
        id: Uuid,
        /// Kind of work.
        kind: AssignmentKind,
        /// Pool label.
        pool: String,
        /// Job payload.
        payload: Bytes,
    },
    /// Explicit refusal of a connect request.
    ConnectionDenied {
        /// Why.
        reason: ConnectionDeniedReason,
    },
    /// Signed heartbeat for the rendezvous server.
    IceHeartbeat(SignedHeartbeat),
}
