//! Replication topology reconciliation.
//!
//! Compares the configured upstream/downstream peer lists against the
//! registry and converges by synthesizing or removing replication nodes.
//! Re-running with unchanged configuration is a no-op.

use std::collections::HashSet;
use std::net::SocketAddr;

use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use hds_core::{NodeKind, NodePermissions};

use crate::{AdmitRequest, NodeRegistry};

/// Which side of the replication fabric a peer sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationDirection {
    /// Peers this server pulls from.
    Upstream,
    /// Peers this server pushes to.
    Downstream,
}

/// A configured replication peer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplicationPeerConfig {
    /// Base mixer kind being replicated, e.g. `audio-mixer`.
    pub server_type: NodeKind,
    /// Peer address.
    pub address: SocketAddr,
}

impl ReplicationPeerConfig {
    /// The registry kind for this peer in the given direction.
    #[must_use]
    pub fn directed_kind(&self, direction: ReplicationDirection) -> Option<NodeKind> {
        match direction {
            ReplicationDirection::Upstream => self.server_type.upstream_mirror(),
            ReplicationDirection::Downstream => self.server_type.downstream_mirror(),
        }
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Ids of synthesized peers.
    pub added: Vec<Uuid>,
    /// Removed peers, as `(id, kind)` so removal notices can fan out.
    pub removed: Vec<(Uuid, NodeKind)>,
}

impl ReconcileOutcome {
    /// Whether the pass changed anything.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Converge the registry's replication peers for one direction.
///
/// Desired peers absent from the registry are synthesized with a fresh id,
/// flagged permanently non-silent, and their socket treated as active
/// without a handshake (trusted static peers, not regular clients). Present
/// replication nodes no longer desired are removed.
pub fn reconcile(
    registry: &mut NodeRegistry,
    direction: ReplicationDirection,
    desired: &[ReplicationPeerConfig],
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    let matches_direction = |kind: NodeKind| match direction {
        ReplicationDirection::Upstream => kind.is_upstream(),
        ReplicationDirection::Downstream => kind.is_downstream(),
    };

    let known: HashSet<SocketAddr> = registry
        .nodes()
        .filter(|node| matches_direction(node.kind))
        .map(|node| node.public_socket)
        .collect();

    let mut desired_sockets: HashSet<SocketAddr> = HashSet::new();

    for peer in desired {
        let Some(kind) = peer.directed_kind(direction) else {
            debug!(server_type = %peer.server_type, "ignoring non-replicable peer type");
            continue;
        };
        desired_sockets.insert(peer.address);

        if !known.contains(&peer.address) {
            let id = registry
                .admit(AdmitRequest {
                    id: Uuid::new_v4(),
                    kind,
                    public_socket: peer.address,
                    local_socket: peer.address,
                    interest_set: HashSet::new(),
                    permissions: NodePermissions::empty(),
                    assignment_id: None,
                    wallet_id: None,
                })
                .id;

            let node = registry.by_id_mut(id).expect("peer admitted above");
            node.is_forced_never_silent = true;
            info!(node = %id, %kind, address = %peer.address, "added replication peer");
            outcome.added.push(id);
        }
    }

    let stale: Vec<(Uuid, NodeKind)> = registry
        .nodes()
        .filter(|node| matches_direction(node.kind) && !desired_sockets.contains(&node.public_socket))
        .map(|node| (node.id, node.kind))
        .collect();

    for (id, kind) in stale {
        info!(node = %id, %kind, "removing replication peer no longer in settings");
        registry.remove(id);
        outcome.removed.push((id, kind));
    }

    outcome
}

/// Flag Agents whose verified username is in the replicated-users list.
///
/// Returns `(id, flag)` for every node whose replicated state changed.
pub fn update_replicated_agents(
    registry: &mut NodeRegistry,
    replicated_usernames: &[String],
) -> Vec<(Uuid, bool)> {
    let agent_ids = registry.matching_ids(|node| node.kind == NodeKind::Agent);
    let mut changes = Vec::new();

    for id in agent_ids {
        let node = registry.by_id_mut(id).expect("id listed above");
        let should_replicate = node
            .verified_username
            .as_deref()
            .map(str::to_lowercase)
            .is_some_and(|username| replicated_usernames.contains(&username));

        if node.is_replicated != should_replicate {
            debug!(node = %id, replicated = should_replicate, "replicated flag changed");
            node.is_replicated = should_replicate;
            changes.push((id, should_replicate));
        }
    }

    changes
}
