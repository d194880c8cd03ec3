//! Broadcast planning for admission and removal.
//!
//! The registry never talks to the network. These methods compute *plans* —
//! who hears about whom, and with which pairwise secret — and the event loop
//! hands them to the transport.

use uuid::Uuid;

use hds_core::{NodeDescriptor, NodeKind};

use crate::NodeRegistry;

/// One roster line: a visible peer and the secret for that specific pair.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    /// The peer being disclosed.
    pub node: NodeDescriptor,
    /// Secret shared by the recipient and this peer.
    pub secret: Uuid,
}

/// The full roster sent to a node on admission or list request.
#[derive(Debug, Clone)]
pub struct RosterPlan {
    /// Node receiving the roster.
    pub recipient: Uuid,
    /// Visible peers, each with the pair's secret.
    pub entries: Vec<RosterEntry>,
}

/// Fan-out notice that a node joined, one secret per receiver.
#[derive(Debug, Clone)]
pub struct AddedNodePlan {
    /// The newcomer's descriptor.
    pub added: NodeDescriptor,
    /// `(receiver, secret between receiver and newcomer)` pairs.
    pub notifications: Vec<(Uuid, Uuid)>,
}

/// Fan-out notice that a node left.
#[derive(Debug, Clone)]
pub struct RemovedNodePlan {
    /// The departed node.
    pub removed: Uuid,
    /// Nodes whose interest set included the departed node's kind.
    pub recipients: Vec<Uuid>,
}

/// Whether `subject` may be disclosed to `viewer`.
///
/// Visibility is interest-driven and asymmetric. One safety rule overrides
/// declared interest: an Agent is never disclosed to another Agent.
fn visible_to(
    viewer_kind: NodeKind,
    viewer_interest: &std::collections::HashSet<NodeKind>,
    subject_kind: NodeKind,
) -> bool {
    if viewer_kind == NodeKind::Agent && subject_kind == NodeKind::Agent {
        return false;
    }
    viewer_interest.contains(&subject_kind)
}

impl NodeRegistry {
    /// Roster of peers visible to `recipient`, minting secrets as needed.
    ///
    /// Returns `None` if the recipient is unknown.
    pub fn roster_plan(&mut self, recipient: Uuid) -> Option<RosterPlan> {
        let viewer = self.by_id(recipient)?;
        let viewer_kind = viewer.kind;
        let viewer_interest = viewer.interest_set.clone();

        let visible: Vec<Uuid> = self
            .nodes()
            .filter(|other| {
                other.id != recipient && visible_to(viewer_kind, &viewer_interest, other.kind)
            })
            .map(|other| other.id)
            .collect();

        let entries = visible
            .into_iter()
            .map(|other| {
                let secret = self.secret_for(recipient, other);
                let descriptor =
                    NodeDescriptor::from(self.by_id(other).expect("visible peer is admitted"));
                RosterEntry {
                    node: descriptor,
                    secret,
                }
            })
            .collect();

        Some(RosterPlan { recipient, entries })
    }

    /// Fan-out plan announcing `added` to every interested existing node.
    ///
    /// Returns `None` if the added node is unknown.
    pub fn added_node_plan(&mut self, added: Uuid) -> Option<AddedNodePlan> {
        let added_node = self.by_id(added)?;
        let added_kind = added_node.kind;
        let descriptor = NodeDescriptor::from(added_node);

        let receivers: Vec<Uuid> = self
            .nodes()
            .filter(|other| {
                other.id != added && visible_to(other.kind, &other.interest_set, added_kind)
            })
            .map(|other| other.id)
            .collect();

        let notifications = receivers
            .into_iter()
            .map(|receiver| {
                let secret = self.secret_for(receiver, added);
                (receiver, secret)
            })
            .collect();

        Some(AddedNodePlan {
            added: descriptor,
            notifications,
        })
    }

    /// Fan-out plan for a node that is about to be (or was just) removed.
    ///
    /// Must be computed against the surviving population; call it after
    /// [`NodeRegistry::remove`] with the removed node's kind.
    #[must_use]
    pub fn removed_node_plan(&self, removed: Uuid, removed_kind: NodeKind) -> RemovedNodePlan {
        let recipients = self
            .nodes()
            .filter(|other| visible_to(other.kind, &other.interest_set, removed_kind))
            .map(|other| other.id)
            .collect();

        RemovedNodePlan {
            removed,
            recipients,
        }
    }
}
