//! Assignment descriptions handed to connecting worker processes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::NodeKind;

/// The kind of work an assignment describes.
///
/// `AllTypes` is a request-side wildcard: it never appears on a queued
/// assignment, only on an incoming request that will take any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssignmentKind {
    /// Audio mixer worker.
    AudioMixer,
    /// Avatar mixer worker.
    AvatarMixer,
    /// Asset server worker.
    AssetServer,
    /// Entity server worker.
    EntityServer,
    /// Messages mixer worker.
    MessagesMixer,
    /// Scripted agent job.
    Agent,
    /// Request-side wildcard.
    AllTypes,
}

impl AssignmentKind {
    /// The node kind a worker fulfilling this assignment connects as.
    #[must_use]
    pub const fn node_kind(self) -> Option<NodeKind> {
        match self {
            Self::AudioMixer => Some(NodeKind::AudioMixer),
            Self::AvatarMixer => Some(NodeKind::AvatarMixer),
            Self::AssetServer => Some(NodeKind::AssetServer),
            Self::EntityServer => Some(NodeKind::EntityServer),
            Self::MessagesMixer => Some(NodeKind::MessagesMixer),
            Self::Agent => Some(NodeKind::Agent),
            Self::AllTypes => None,
        }
    }

    /// The assignment kind fulfilled by a node of the given kind.
    #[must_use]
    pub const fn for_node_kind(kind: NodeKind) -> Option<Self> {
        match kind {
            NodeKind::AudioMixer => Some(Self::AudioMixer),
            NodeKind::AvatarMixer => Some(Self::AvatarMixer),
            NodeKind::AssetServer => Some(Self::AssetServer),
            NodeKind::EntityServer => Some(Self::EntityServer),
            NodeKind::MessagesMixer => Some(Self::MessagesMixer),
            NodeKind::Agent => Some(Self::Agent),
            _ => None,
        }
    }
}

impl std::fmt::Display for AssignmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AudioMixer => "audio-mixer",
            Self::AvatarMixer => "avatar-mixer",
            Self::AssetServer => "asset-server",
            Self::EntityServer => "entity-server",
            Self::MessagesMixer => "messages-mixer",
            Self::Agent => "agent",
            Self::AllTypes => "all-types",
        };
        write!(f, "{name}")
    }
}

/// A unit of work to hand to a not-yet-connected process.
///
/// An assignment is either queued (unfulfilled, FIFO) or fulfilled (bound to
/// exactly one live node), never both. Static assignments are requeued under
/// a fresh id when their holder disconnects.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Current identity. Regenerated whenever a static assignment requeues.
    pub id: Uuid,
    /// Kind of work.
    pub kind: AssignmentKind,
    /// Optional partition label; empty means unpooled.
    pub pool: String,
    /// Opaque job payload (for Agent jobs, the script).
    pub payload: Bytes,
    /// Static assignments must perpetually exist.
    pub is_static: bool,
    /// Wallet credited while the assignment is fulfilled.
    pub wallet_id: Option<Uuid>,
}

impl Assignment {
    /// Create a static assignment of the given kind.
    #[must_use]
    pub fn new_static(kind: AssignmentKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            pool: String::new(),
            payload: Bytes::new(),
            is_static: true,
            wallet_id: None,
        }
    }

    /// Create a dynamic (one-shot) assignment of the given kind.
    #[must_use]
    pub fn new_dynamic(kind: AssignmentKind) -> Self {
        Self {
            is_static: false,
            ..Self::new_static(kind)
        }
    }

    /// Set the pool label.
    #[must_use]
    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Set the wallet.
    #[must_use]
    pub const fn with_wallet(mut self, wallet_id: Uuid) -> Self {
        self.wallet_id = Some(wallet_id);
        self
    }

    /// A copy of this assignment under a freshly generated id.
    ///
    /// Used both for hand-outs (the ephemeral id offered to a requester) and
    /// for requeueing statics, so a stale id is never reissued.
    #[must_use]
    pub fn with_fresh_id(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            ..self.clone()
        }
    }
}
