//! The node registry: admission, removal, lookup, and secret exchange.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use hds_core::{Node, NodeKind, NodePermissions};

/// Parameters for admitting a node.
#[derive(Debug, Clone)]
pub struct AdmitRequest {
    /// Session id proposed for the node (from the verified connect packet).
    pub id: Uuid,
    /// Role the node connects as.
    pub kind: NodeKind,
    /// Publicly reachable address.
    pub public_socket: SocketAddr,
    /// Local-network address.
    pub local_socket: SocketAddr,
    /// Kinds the node wants disclosed to it.
    pub interest_set: HashSet<NodeKind>,
    /// Capabilities granted by the gatekeeper.
    pub permissions: NodePermissions,
    /// Assignment the node fulfills, if it connected for one.
    pub assignment_id: Option<Uuid>,
    /// Wallet for credit accounting.
    pub wallet_id: Option<Uuid>,
}

/// Tracks every connected node and the pairwise secrets between them.
///
/// Exclusively owns its [`Node`] values; other components hold ids. All
/// mutation happens under the caller's single-writer discipline.
#[derive(Debug)]
pub struct NodeRegistry {
    session_id: Uuid,
    nodes: HashMap<Uuid, Node>,
    secrets: HashMap<Uuid, HashMap<Uuid, Uuid>>,
    next_local_id: u16,
}

impl NodeRegistry {
    /// Create a registry for the given server session.
    #[must_use]
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            nodes: HashMap::new(),
            secrets: HashMap::new(),
            // local id 0 is reserved for the domain server itself
            next_local_id: 1,
        }
    }

    /// The server's own session id.
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Admit a node, allocating its compact local id.
    ///
    /// If a node with the same id is already present its sockets, kind, and
    /// interest set are updated in place and its local id is kept.
    pub fn admit(&mut self, request: AdmitRequest) -> &Node {
        let AdmitRequest {
            id,
            kind,
            public_socket,
            local_socket,
            interest_set,
            permissions,
            assignment_id,
            wallet_id,
        } = request;

        let interest_set = sanitize_interest(kind, interest_set);

        if self.nodes.contains_key(&id) {
            let node = self.nodes.get_mut(&id).expect("presence checked above");
            node.kind = kind;
            node.public_socket = public_socket;
            node.local_socket = local_socket;
            node.interest_set = interest_set;
            debug!(node = %id, %kind, "updated existing node on re-admission");
            return node;
        }

        let local_id = self.allocate_local_id();
        let node = Node {
            id,
            local_id,
            kind,
            public_socket,
            local_socket,
            interest_set,
            assignment_id,
            wallet_id,
            permissions,
            is_replicated: false,
            is_forced_never_silent: false,
            verified_username: None,
            connected_at: Utc::now(),
        };

        info!(node = %id, %kind, local_id, "admitted node");
        self.secrets.insert(id, HashMap::new());
        self.nodes.entry(id).or_insert(node)
    }

    /// Remove a node, purging its secrets from every survivor.
    ///
    /// Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: Uuid) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        self.secrets.remove(&id);
        for table in self.secrets.values_mut() {
            table.remove(&id);
        }
        info!(node = %id, kind = %node.kind, "removed node");
        Some(node)
    }

    /// Look up a node by id.
    #[must_use]
    pub fn by_id(&self, id: Uuid) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Mutable lookup by id.
    pub fn by_id_mut(&mut self, id: Uuid) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Iterate all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Ids of nodes matching a predicate.
    #[must_use]
    pub fn matching_ids(&self, predicate: impl Fn(&Node) -> bool) -> Vec<Uuid> {
        self.nodes
            .values()
            .filter(|node| predicate(node))
            .map(|node| node.id)
            .collect()
    }

    /// Number of connected users: Agents that did not come from an assignment.
    #[must_use]
    pub fn connected_user_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| node.kind == NodeKind::Agent && !node.was_assigned())
            .count()
    }

    /// Update a node's sockets and interest set from a list request.
    ///
    /// Returns false if the node is unknown.
    pub fn update_from_list_request(
        &mut self,
        id: Uuid,
        public_socket: SocketAddr,
        local_socket: SocketAddr,
        interest_set: HashSet<NodeKind>,
    ) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        node.public_socket = public_socket;
        node.local_socket = local_socket;
        node.interest_set = sanitize_interest(node.kind, interest_set);
        true
    }

    /// The pairwise secret for two admitted nodes, minting it on first use.
    ///
    /// The secret is inserted symmetrically into both nodes' tables and is
    /// stable for the lifetime of both nodes: repeated calls, in either
    /// argument order, observe the same value.
    ///
    /// # Panics
    /// Panics if either node has not been admitted; a broadcast plan for an
    /// unadmitted node is a programming error.
    pub fn secret_for(&mut self, a: Uuid, b: Uuid) -> Uuid {
        assert!(
            self.secrets.contains_key(&a) && self.secrets.contains_key(&b),
            "secret requested for a node that was never admitted"
        );

        if let Some(existing) = self.secrets[&a].get(&b) {
            return *existing;
        }
        if let Some(existing) = self.secrets[&b].get(&a).copied() {
            // heal a one-sided table, the first mint still wins
            self.secrets
                .get_mut(&a)
                .expect("table presence checked above")
                .insert(b, existing);
            return existing;
        }

        let secret = Uuid::new_v4();
        self.secrets
            .get_mut(&a)
            .expect("table presence checked above")
            .insert(b, secret);
        self.secrets
            .get_mut(&b)
            .expect("table presence checked above")
            .insert(a, secret);
        secret
    }

    fn allocate_local_id(&mut self) -> u16 {
        // wraps after 65534 admissions in one run; skip ids still in use
        loop {
            let candidate = self.next_local_id;
            self.next_local_id = self.next_local_id.wrapping_add(1).max(1);
            if !self.nodes.values().any(|node| node.local_id == candidate) {
                return candidate;
            }
        }
    }
}

/// Strip self-interest an Agent declares in other Agents.
///
/// Patched clients may ask to hear about other Agents; user address
/// disclosure goes through the avatar mixer, never through admission.
fn sanitize_interest(kind: NodeKind, mut interest_set: HashSet<NodeKind>) -> HashSet<NodeKind> {
    if kind == NodeKind::Agent {
        interest_set.remove(&NodeKind::Agent);
    }
    interest_set
}
