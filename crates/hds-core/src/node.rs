//! Node kinds, permissions, and the node record owned by the registry.

use std::collections::HashSet;
use std::net::SocketAddr;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of a connected participant.
///
/// Upstream/downstream mirror kinds exist only for the mixers that take part
/// in replication; they are synthesized by the topology reconciler and never
/// requested by a connecting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// A user or scripted client process.
    Agent,
    /// Serves static assets.
    AssetServer,
    /// Owns the entity tree.
    EntityServer,
    /// Mixes audio streams.
    AudioMixer,
    /// Mixes avatar state.
    AvatarMixer,
    /// Relays text messages.
    MessagesMixer,
    /// Upstream replication peer for an audio mixer.
    UpstreamAudioMixer,
    /// Upstream replication peer for an avatar mixer.
    UpstreamAvatarMixer,
    /// Downstream replication peer for an audio mixer.
    DownstreamAudioMixer,
    /// Downstream replication peer for an avatar mixer.
    DownstreamAvatarMixer,
    /// Not yet assigned a role.
    Unassigned,
}

impl NodeKind {
    /// Whether this kind is an upstream replication peer.
    #[must_use]
    pub const fn is_upstream(self) -> bool {
        matches!(self, Self::UpstreamAudioMixer | Self::UpstreamAvatarMixer)
    }

    /// Whether this kind is a downstream replication peer.
    #[must_use]
    pub const fn is_downstream(self) -> bool {
        matches!(
            self,
            Self::DownstreamAudioMixer | Self::DownstreamAvatarMixer
        )
    }

    /// The upstream mirror of a replicable kind.
    #[must_use]
    pub const fn upstream_mirror(self) -> Option<Self> {
        match self {
            Self::AudioMixer => Some(Self::UpstreamAudioMixer),
            Self::AvatarMixer => Some(Self::UpstreamAvatarMixer),
            _ => None,
        }
    }

    /// The downstream mirror of a replicable kind.
    #[must_use]
    pub const fn downstream_mirror(self) -> Option<Self> {
        match self {
            Self::AudioMixer => Some(Self::DownstreamAudioMixer),
            Self::AvatarMixer => Some(Self::DownstreamAvatarMixer),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Agent => "agent",
            Self::AssetServer => "asset-server",
            Self::EntityServer => "entity-server",
            Self::AudioMixer => "audio-mixer",
            Self::AvatarMixer => "avatar-mixer",
            Self::MessagesMixer => "messages-mixer",
            Self::UpstreamAudioMixer => "upstream-audio-mixer",
            Self::UpstreamAvatarMixer => "upstream-avatar-mixer",
            Self::DownstreamAudioMixer => "downstream-audio-mixer",
            Self::DownstreamAvatarMixer => "downstream-avatar-mixer",
            Self::Unassigned => "unassigned",
        };
        write!(f, "{name}")
    }
}

bitflags! {
    /// Capabilities granted to a connected node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodePermissions: u32 {
        /// May connect to the domain at all.
        const CONNECT = 1 << 0;
        /// May lock and unlock entities.
        const ADJUST_LOCKS = 1 << 1;
        /// May create entities.
        const REZ = 1 << 2;
        /// May write to the asset server.
        const WRITE_ASSETS = 1 << 3;
        /// May kick other nodes.
        const KICK = 1 << 4;
        /// May replace domain content wholesale.
        const REPLACE_CONTENT = 1 << 5;
    }
}

impl NodePermissions {
    /// Permissions granted to admitted worker processes.
    #[must_use]
    pub const fn worker() -> Self {
        Self::CONNECT
            .union(Self::ADJUST_LOCKS)
            .union(Self::REZ)
            .union(Self::WRITE_ASSETS)
    }
}

/// A connected participant, exclusively owned by the node registry.
///
/// Everything else refers to a node by `id`.
#[derive(Debug, Clone)]
pub struct Node {
    /// Stable session identity.
    pub id: Uuid,
    /// Compact wire alias, unique for the life of the session run.
    pub local_id: u16,
    /// Role of this node.
    pub kind: NodeKind,
    /// Publicly reachable address.
    pub public_socket: SocketAddr,
    /// Address on the node's local network.
    pub local_socket: SocketAddr,
    /// Kinds this node wants to be told about.
    pub interest_set: HashSet<NodeKind>,
    /// Set once the node has been matched to an assignment.
    pub assignment_id: Option<Uuid>,
    /// Wallet for assignment credit accounting.
    pub wallet_id: Option<Uuid>,
    /// Capabilities granted at admission.
    pub permissions: NodePermissions,
    /// Mirrored to replication peers.
    pub is_replicated: bool,
    /// Exempt from silence-based timeout, used for static replication peers.
    pub is_forced_never_silent: bool,
    /// Username verified by the metaverse, if any.
    pub verified_username: Option<String>,
    /// When the node was admitted.
    pub connected_at: DateTime<Utc>,
}

impl Node {
    /// Whether this node is an upstream replication peer.
    #[must_use]
    pub const fn is_upstream(&self) -> bool {
        self.kind.is_upstream()
    }

    /// Whether this node was admitted to fulfill an assignment.
    #[must_use]
    pub const fn was_assigned(&self) -> bool {
        self.assignment_id.is_some()
    }
}

/// Wire- and admin-facing summary of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Session identity.
    pub id: Uuid,
    /// Compact wire alias.
    pub local_id: u16,
    /// Role.
    pub kind: NodeKind,
    /// Publicly reachable address.
    pub public_socket: SocketAddr,
    /// Local-network address.
    pub local_socket: SocketAddr,
    /// Raw permission bits.
    pub permissions: u32,
    /// Whether the node is mirrored to replication peers.
    pub is_replicated: bool,
}

impl From<&Node> for NodeDescriptor {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id,
            local_id: node.local_id,
            kind: node.kind,
            public_socket: node.public_socket,
            local_socket: node.local_socket,
            permissions: node.permissions.bits(),
            is_replicated: node.is_replicated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_kinds_only_for_replicable_mixers() {
        assert_eq!(
            NodeKind::AudioMixer.upstream_mirror(),
            Some(NodeKind::UpstreamAudioMixer)
        );
        assert_eq!(
            NodeKind::AvatarMixer.downstream_mirror(),
            Some(NodeKind::DownstreamAvatarMixer)
        );
        assert_eq!(NodeKind::EntityServer.upstream_mirror(), None);
        assert_eq!(NodeKind::Agent.downstream_mirror(), None);
    }

    #[test]
    fn upstream_and_downstream_predicates() {
        assert!(NodeKind::UpstreamAudioMixer.is_upstream());
        assert!(NodeKind::DownstreamAvatarMixer.is_downstream());
        assert!(!NodeKind::AudioMixer.is_upstream());
        assert!(!NodeKind::Agent.is_downstream());
    }

    #[test]
    fn kind_serde_uses_kebab_case() {
        let json = serde_json::to_string(&NodeKind::AudioMixer).unwrap();
        assert_eq!(json, "\"audio-mixer\"");
        let parsed: NodeKind = serde_json::from_str("\"entity-server\"").unwrap();
        assert_eq!(parsed, NodeKind::EntityServer);
    }

    #[test]
    fn worker_permissions_include_connect() {
        let perms = NodePermissions::worker();
        assert!(perms.contains(NodePermissions::CONNECT));
        assert!(perms.contains(NodePermissions::REZ));
        assert!(!perms.contains(NodePermissions::KICK));
    }
}
