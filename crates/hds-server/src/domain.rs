//! The domain server aggregate and its single-writer event loop.
//!
//! Every mutable aggregate (registry, broker, ledger, ICE controller) sits
//! behind its own lock and is only mutated from handler methods called by
//! the event loop or the admin HTTP surface; locks are never held across an
//! await point. Long network calls run as spawned tasks whose completions
//! re-enter these same handlers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hds_broker::{
    AssignmentBroker, AssignmentRequest, BrokerListing, CreditLedger,
    allowed_subnets_from_settings, static_assignments_from_settings,
};
use hds_core::{
    Assignment, AssignmentKind, NodeDescriptor, NodeKind, NodePermissions, SettingsManager,
    value_at,
};
use hds_ice::{
    AddressUpdater, HeartbeatIdentity, IceController, IceEffect, UpdateFollowUp,
};
use hds_registry::{
    AdmitRequest, NodeRegistry, ReplicationDirection, ReplicationPeerConfig, reconcile,
    update_replicated_agents,
};

use crate::{
    ConnectRequest, ConnectionDeniedReason, DomainHeartbeat, DomainMessage, IceAddressUpdate,
    MetaverseApi, OutboundMessage, PROTOCOL_VERSION, Transport,
};

/// Fixed heartbeat period toward the rendezvous server.
pub const ICE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Fixed period for credit accrual and flushing.
pub const CREDIT_INTERVAL: Duration = Duration::from_secs(30);

/// Fixed period for the metaverse presence heartbeat.
pub const METAVERSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Static identity and addressing for this server process.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// This domain's session id.
    pub session_id: Uuid,
    /// Publicly reachable address.
    pub public_socket: SocketAddr,
    /// Local-network address.
    pub local_socket: SocketAddr,
    /// Hostname of the rendezvous service.
    pub ice_server_hostname: String,
    /// Port rendezvous servers listen on.
    pub ice_server_port: u16,
}

/// Asynchronous work a handler wants the event loop to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    /// Resolve the rendezvous hostname now.
    ResolveIceHostname,
    /// Resolve the rendezvous hostname after a delay.
    ResolveIceHostnameAfter(Duration),
    /// Publish the selected rendezvous address to the discovery API.
    PushIceAddress,
}

/// The orchestration core of the domain server.
pub struct DomainServer {
    config: DomainConfig,
    registry: Arc<Mutex<NodeRegistry>>,
    broker: Arc<Mutex<AssignmentBroker>>,
    ledger: Arc<Mutex<CreditLedger>>,
    ice: Mutex<IceController>,
    updater: Mutex<AddressUpdater>,
    settings: Mutex<SettingsManager>,
    transport: Arc<dyn Transport>,
    metaverse: Arc<dyn MetaverseApi>,
    last_accrual: Mutex<Instant>,
}

impl DomainServer {
    /// Wire up the server from parsed settings and its collaborators.
    pub fn new(
        config: DomainConfig,
        settings_root: Value,
        transport: Arc<dyn Transport>,
        metaverse: Arc<dyn MetaverseApi>,
    ) -> Arc<Self> {
        let registry = Arc::new(Mutex::new(NodeRegistry::new(config.session_id)));

        let mut broker = AssignmentBroker::new(allowed_subnets_from_settings(&settings_root));
        for assignment in static_assignments_from_settings(&settings_root) {
            broker.register(assignment);
        }
        broker.queue_unfulfilled();
        let broker = Arc::new(Mutex::new(broker));

        let mut settings = SettingsManager::new(Value::Null);

        // registry-facing subscribers run before anything that depends on
        // the registry's contents
        {
            let registry = Arc::clone(&registry);
            let transport = Arc::clone(&transport);
            settings.subscribe(
                "replication-topology",
                Box::new(move |root| {
                    apply_replication_settings(&registry, transport.as_ref(), root);
                }),
            );
        }
        {
            let broker = Arc::clone(&broker);
            settings.subscribe(
                "assignment-allow-list",
                Box::new(move |root| {
                    broker
                        .lock()
                        .set_allowed_subnets(allowed_subnets_from_settings(root));
                }),
            );
        }
        settings.apply(settings_root);

        let ice = Mutex::new(IceController::new(config.ice_server_port));

        Arc::new(Self {
            config,
            registry,
            broker,
            ledger: Arc::new(Mutex::new(CreditLedger::new())),
            ice,
            updater: Mutex::new(AddressUpdater::new()),
            settings: Mutex::new(settings),
            transport,
            metaverse,
            last_accrual: Mutex::new(Instant::now()),
        })
    }

    /// This domain's session id.
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.config.session_id
    }

    /// The identity material advertised in rendezvous heartbeats.
    #[must_use]
    pub fn heartbeat_identity(&self) -> HeartbeatIdentity {
        HeartbeatIdentity {
            session_id: self.config.session_id,
            public_socket: self.config.public_socket,
            local_socket: self.config.local_socket,
        }
    }

    /// Dispatch one inbound message. The single entry point of the event
    /// loop: every message kind is matched here, exhaustively.
    pub fn handle_message(&self, message: DomainMessage) -> Vec<FollowUp> {
        match message {
            DomainMessage::Connect(request) => {
                self.handle_connect(request);
                Vec::new()
            }
            DomainMessage::ListRequest {
                node_id,
                public_socket,
                local_socket,
                interest_set,
            } => {
                self.handle_list_request(node_id, public_socket, local_socket, interest_set);
                Vec::new()
            }
            DomainMessage::RequestAssignment {
                kind,
                pool,
                wallet_id,
                version,
                sender_socket,
            } => {
                self.handle_assignment_request(kind, pool, wallet_id, version, sender_socket);
                Vec::new()
            }
            DomainMessage::Disconnect { node_id } => {
                self.kill_node(node_id);
                Vec::new()
            }
            DomainMessage::IceHeartbeatAck => {
                let effects = self.ice.lock().handle_ack();
                self.run_ice_effects(effects)
            }
            DomainMessage::IceHeartbeatDenial => {
                let identity = self.heartbeat_identity();
                let effects = self.ice.lock().handle_denial(&identity);
                self.run_ice_effects(effects)
            }
        }
    }

    fn handle_connect(&self, request: ConnectRequest) {
        if request.protocol_version != PROTOCOL_VERSION {
            debug!(
                got = request.protocol_version,
                expected = PROTOCOL_VERSION,
                "denying connect with mismatched protocol version"
            );
            self.transport.send(
                request.sender_socket,
                OutboundMessage::ConnectionDenied {
                    reason: ConnectionDeniedReason::ProtocolMismatch,
                },
            );
            return;
        }

        let (assignment_id, wallet_id) = match request.assignment_id {
            Some(handout) => {
                match self
                    .broker
                    .lock()
                    .complete_assignment(handout, request.candidate_id)
                {
                    Some(fulfilled) => (Some(fulfilled.assignment_id), fulfilled.wallet_id),
                    None => {
                        debug!(handout = %handout, "denying connect with stale assignment hand-out");
                        self.transport.send(
                            request.sender_socket,
                            OutboundMessage::ConnectionDenied {
                                reason: ConnectionDeniedReason::InvalidAssignment,
                            },
                        );
                        return;
                    }
                }
            }
            None => (None, None),
        };

        let permissions = if assignment_id.is_some() {
            NodePermissions::worker()
        } else {
            NodePermissions::CONNECT
        };

        let mut registry = self.registry.lock();
        let node_id = registry
            .admit(AdmitRequest {
                id: request.candidate_id,
                kind: request.kind,
                public_socket: request.public_socket,
                local_socket: request.local_socket,
                interest_set: request.interest_set.into_iter().collect(),
                permissions,
                assignment_id,
                wallet_id,
            })
            .id;

        self.send_roster(&mut registry, node_id);

        if let Some(plan) = registry.added_node_plan(node_id) {
            for (receiver, secret) in plan.notifications {
                if let Some(receiver_node) = registry.by_id(receiver) {
                    self.transport.send(
                        receiver_node.public_socket,
                        OutboundMessage::NodeAdded {
                            node: plan.added.clone(),
                            secret,
                        },
                    );
                }
            }
        }
    }

    fn handle_list_request(
        &self,
        node_id: Uuid,
        public_socket: SocketAddr,
        local_socket: SocketAddr,
        interest_set: Vec<NodeKind>,
    ) {
        let mut registry = self.registry.lock();
        if !registry.update_from_list_request(
            node_id,
            public_socket,
            local_socket,
            interest_set.into_iter().collect(),
        ) {
            // packets from unknown senders are dropped, never answered
            debug!(node = %node_id, "dropping list request from unknown node");
            return;
        }
        self.send_roster(&mut registry, node_id);
    }

    fn handle_assignment_request(
        &self,
        kind: AssignmentKind,
        pool: String,
        wallet_id: Option<Uuid>,
        version: Option<String>,
        sender_socket: SocketAddr,
    ) {
        let offered = self.broker.lock().request_assignment(&AssignmentRequest {
            kind,
            pool,
            wallet_id,
            version,
            sender: sender_socket.ip(),
        });

        if let Some(assignment) = offered {
            self.transport.send(
                sender_socket,
                OutboundMessage::AssignmentOffer {
                    id: assignment.id,
                    kind: assignment.kind,
                    pool: assignment.pool,
                    payload: assignment.payload,
                },
            );
        }
    }

    fn send_roster(&self, registry: &mut NodeRegistry, node_id: Uuid) {
        let Some(plan) = registry.roster_plan(node_id) else {
            return;
        };
        let Some(node) = registry.by_id(node_id) else {
            return;
        };

        self.transport.send_reliable(
            node_id,
            vec![OutboundMessage::DomainList {
                domain_id: registry.session_id(),
                node_id,
                local_id: node.local_id,
                permissions: node.permissions.bits(),
                entries: plan.entries,
            }],
        );
    }

    /// Remove a node, notify interested survivors, and requeue its
    /// assignment. Returns false for unknown ids.
    pub fn kill_node(&self, node_id: Uuid) -> bool {
        let removed = {
            let mut registry = self.registry.lock();
            let Some(node) = registry.remove(node_id) else {
                return false;
            };

            let plan = registry.removed_node_plan(node_id, node.kind);
            for recipient in plan.recipients {
                if let Some(recipient_node) = registry.by_id(recipient) {
                    self.transport.send(
                        recipient_node.public_socket,
                        OutboundMessage::NodeRemoved { node_id },
                    );
                }
            }
            node
        };

        if let Some(assignment_id) = removed.assignment_id {
            self.broker.lock().requeue_on_disconnect(assignment_id);
        }
        true
    }

    /// Kill every connected node. Returns how many were removed.
    pub fn kill_all_nodes(&self) -> usize {
        let ids = self.registry.lock().matching_ids(|_| true);
        ids.into_iter().filter(|id| self.kill_node(*id)).count()
    }

    /// Apply a new settings document, notifying subscribers in order.
    pub fn apply_settings(&self, root: Value) {
        self.settings.lock().apply(root);
    }

    /// Admin view of the connected nodes.
    #[must_use]
    pub fn node_views(&self) -> Vec<NodeDescriptor> {
        self.registry.lock().nodes().map(NodeDescriptor::from).collect()
    }

    /// Admin view of the assignment catalog.
    #[must_use]
    pub fn assignment_listing(&self) -> BrokerListing {
        self.broker.lock().listing()
    }

    /// Register an uploaded scripted job and queue it.
    pub fn upload_scripted_assignment(&self, payload: Bytes, pool: String) -> Uuid {
        let assignment = Assignment::new_dynamic(AssignmentKind::Agent)
            .with_pool(pool)
            .with_payload(payload);
        let id = self.broker.lock().register_and_queue(assignment);
        info!(assignment = %id, "queued uploaded scripted assignment");
        id
    }

    /// The payload behind an assignment id, for script download.
    #[must_use]
    pub fn assignment_payload(&self, assignment_id: Uuid) -> Option<Bytes> {
        self.broker.lock().payload(assignment_id)
    }

    // ───────────────────────────────────────────────────────────────────
    // ICE controller plumbing
    // ───────────────────────────────────────────────────────────────────

    /// Fixed-period heartbeat tick.
    pub fn ice_tick(&self) -> Vec<FollowUp> {
        let identity = self.heartbeat_identity();
        let effects = self.ice.lock().tick(&identity);
        self.run_ice_effects(effects)
    }

    /// Feed a hostname lookup result to the controller.
    pub fn handle_ice_lookup_result(&self, addresses: Vec<std::net::IpAddr>) -> Vec<FollowUp> {
        let identity = self.heartbeat_identity();
        let effects = self.ice.lock().handle_lookup_result(addresses, &identity);
        self.run_ice_effects(effects)
    }

    /// Feed a hostname lookup failure to the controller.
    pub fn handle_ice_lookup_failure(&self) -> Vec<FollowUp> {
        let effects = self.ice.lock().handle_lookup_failure();
        self.run_ice_effects(effects)
    }

    fn run_ice_effects(&self, effects: Vec<IceEffect>) -> Vec<FollowUp> {
        let mut followups = Vec::new();
        for effect in effects {
            match effect {
                IceEffect::SendHeartbeat { to, payload } => {
                    self.transport.send(to, OutboundMessage::IceHeartbeat(payload));
                }
                IceEffect::RequestLookup => followups.push(FollowUp::ResolveIceHostname),
                IceEffect::RetryLookupAfter(delay) => {
                    followups.push(FollowUp::ResolveIceHostnameAfter(delay));
                }
                IceEffect::NotifyAddressChanged => {
                    // only one update in flight; a superseded one re-runs on
                    // completion via the redo flag
                    if self.updater.lock().request() {
                        followups.push(FollowUp::PushIceAddress);
                    }
                }
            }
        }
        followups
    }

    /// Publish the selected rendezvous address, honoring redo/retry.
    pub async fn push_ice_address(&self) {
        loop {
            let update = {
                let ice = self.ice.lock();
                IceAddressUpdate {
                    domain_id: self.config.session_id,
                    ice_address: ice.selected(),
                    connected: ice.is_connected(),
                }
            };

            let result = self.metaverse.update_ice_address(update).await;
            if let Err(error) = &result {
                warn!(%error, "discovery address update failed");
            }

            let follow_up = self.updater.lock().completed(result.is_ok());
            match follow_up {
                UpdateFollowUp::None => break,
                UpdateFollowUp::Immediate => continue,
                UpdateFollowUp::RetryAfter(delay) => {
                    tokio::time::sleep(delay).await;
                    if self.updater.lock().request() {
                        continue;
                    }
                    break;
                }
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Periodic work
    // ───────────────────────────────────────────────────────────────────

    /// Accrue credits for every wallet-bearing fulfilled assignment.
    pub fn accrue_credits(&self) {
        let elapsed = {
            let mut last = self.last_accrual.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let wallets: Vec<Uuid> = self
            .registry
            .lock()
            .nodes()
            .filter(|node| node.was_assigned())
            .filter_map(|node| node.wallet_id)
            .collect();

        let mut ledger = self.ledger.lock();
        for wallet in wallets {
            ledger.accrue(wallet, elapsed);
        }
    }

    /// Finalize pending credits and submit them to the metaverse.
    pub async fn flush_credits(&self) {
        let transactions = self.ledger.lock().flush();
        for transaction in transactions {
            match self.metaverse.post_transaction(&transaction).await {
                Ok(()) => {
                    self.ledger
                        .lock()
                        .confirm(transaction.wallet_id, transaction.id);
                }
                Err(error) => {
                    // stays finalized in the ledger; resubmitted next flush
                    warn!(%error, wallet = %transaction.wallet_id, "credit transaction submission failed");
                }
            }
        }
    }

    /// Advertise domain presence to the metaverse.
    pub async fn send_domain_heartbeat(&self) {
        let heartbeat = DomainHeartbeat {
            domain_id: self.config.session_id,
            network_address: Some(self.config.public_socket.ip().to_string()),
            num_connected_users: self.registry.lock().connected_user_count(),
            protocol_version: PROTOCOL_VERSION,
        };

        if let Err(error) = self.metaverse.send_domain_heartbeat(heartbeat).await {
            warn!(%error, "metaverse heartbeat failed");
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // The event loop
    // ───────────────────────────────────────────────────────────────────

    /// Run the event loop until the message channel closes.
    pub async fn run(self: Arc<Self>, mut messages: mpsc::Receiver<DomainMessage>) {
        let mut ice_timer = tokio::time::interval(ICE_HEARTBEAT_INTERVAL);
        let mut credit_timer = tokio::time::interval(CREDIT_INTERVAL);
        let mut heartbeat_timer = tokio::time::interval(METAVERSE_HEARTBEAT_INTERVAL);

        Self::dispatch_followups(&self, vec![FollowUp::ResolveIceHostname]);

        loop {
            tokio::select! {
                maybe_message = messages.recv() => {
                    let Some(message) = maybe_message else {
                        info!("message channel closed, stopping event loop");
                        break;
                    };
                    let followups = self.handle_message(message);
                    Self::dispatch_followups(&self, followups);
                }
                _ = ice_timer.tick() => {
                    let followups = self.ice_tick();
                    Self::dispatch_followups(&self, followups);
                }
                _ = credit_timer.tick() => {
                    self.accrue_credits();
                    self.flush_credits().await;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_domain_heartbeat().await;
                }
            }
        }
    }

    fn dispatch_followups(server: &Arc<Self>, followups: Vec<FollowUp>) {
        for followup in followups {
            let server = Arc::clone(server);
            match followup {
                FollowUp::ResolveIceHostname => {
                    tokio::spawn(async move { Self::resolve_ice_hostname(&server).await });
                }
                FollowUp::ResolveIceHostnameAfter(delay) => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        Self::resolve_ice_hostname(&server).await;
                    });
                }
                FollowUp::PushIceAddress => {
                    tokio::spawn(async move { server.push_ice_address().await });
                }
            }
        }
    }

    async fn resolve_ice_hostname(server: &Arc<Self>) {
        let target = (
            server.config.ice_server_hostname.as_str(),
            server.config.ice_server_port,
        );

        let followups = match tokio::net::lookup_host(target).await {
            Ok(addresses) => {
                let ips: Vec<std::net::IpAddr> =
                    addresses.map(|address| address.ip()).collect();
                server.handle_ice_lookup_result(ips)
            }
            Err(error) => {
                error!(%error, hostname = %server.config.ice_server_hostname, "rendezvous hostname lookup failed");
                server.handle_ice_lookup_failure()
            }
        };
        Self::dispatch_followups(server, followups);
    }
}

/// Re-run both replication reconcilers and the replicated-user flags.
fn apply_replication_settings(
    registry: &Arc<Mutex<NodeRegistry>>,
    transport: &dyn Transport,
    root: &Value,
) {
    let peers = |key: &str| -> Vec<ReplicationPeerConfig> {
        value_at(root, key)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    };

    let mut registry = registry.lock();
    for (direction, key) in [
        (ReplicationDirection::Upstream, "broadcasting.upstream_servers"),
        (
            ReplicationDirection::Downstream,
            "broadcasting.downstream_servers",
        ),
    ] {
        let outcome = reconcile(&mut registry, direction, &peers(key));
        for (removed_id, removed_kind) in outcome.removed {
            let plan = registry.removed_node_plan(removed_id, removed_kind);
            for recipient in plan.recipients {
                if let Some(recipient_node) = registry.by_id(recipient) {
                    transport.send(
                        recipient_node.public_socket,
                        OutboundMessage::NodeRemoved {
                            node_id: removed_id,
                        },
                    );
                }
            }
        }
    }

    let usernames: Vec<String> = value_at(root, "broadcasting.users")
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .map(|users: Vec<String>| users.into_iter().map(|name| name.to_lowercase()).collect())
        .unwrap_or_default();
    update_replicated_agents(&mut registry, &usernames);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::{NullMetaverse, RecordingTransport};

    use super::*;

    fn test_config() -> DomainConfig {
        DomainConfig {
            session_id: Uuid::new_v4(),
            public_socket: "198.51.100.4:40102".parse().unwrap(),
            local_socket: "192.168.1.4:40102".parse().unwrap(),
            ice_server_hostname: "ice.haven".into(),
            ice_server_port: 7337,
        }
    }

    fn server_with(settings: Value) -> (Arc<DomainServer>, Arc<RecordingTransport>) {
        let transport = RecordingTransport::new();
        let as_transport: Arc<dyn Transport> = transport.clone();
        let server = DomainServer::new(test_config(), settings, as_transport, Arc::new(NullMetaverse));
        (server, transport)
    }

    fn connect(kind: NodeKind, interest: &[NodeKind]) -> ConnectRequest {
        ConnectRequest {
            candidate_id: Uuid::new_v4(),
            kind,
            protocol_version: PROTOCOL_VERSION,
            sender_socket: "203.0.113.7:50000".parse().unwrap(),
            public_socket: "203.0.113.7:50000".parse().unwrap(),
            local_socket: "10.0.0.7:50000".parse().unwrap(),
            interest_set: interest.to_vec(),
            assignment_id: None,
        }
    }

    #[test]
    fn connect_sends_roster_and_broadcasts_to_interested() {
        let (server, transport) = server_with(json!({}));

        let mixer = connect(NodeKind::AudioMixer, &[NodeKind::Agent]);
        let mixer_id = mixer.candidate_id;
        server.handle_message(DomainMessage::Connect(mixer));

        let agent = connect(NodeKind::Agent, &[NodeKind::AudioMixer]);
        let agent_id = agent.candidate_id;
        server.handle_message(DomainMessage::Connect(agent));

        // both nodes got a reliable roster
        let reliable = transport.reliable();
        assert_eq!(reliable.len(), 2);
        let (recipient, messages) = &reliable[1];
        assert_eq!(*recipient, agent_id);
        let OutboundMessage::DomainList { entries, node_id, .. } = &messages[0] else {
            panic!("expected roster, got {:?}", messages[0]);
        };
        assert_eq!(*node_id, agent_id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node.id, mixer_id);

        // the interested mixer heard about the agent, with the same secret
        let added: Vec<_> = transport
            .sent()
            .into_iter()
            .filter_map(|(_, message)| match message {
                OutboundMessage::NodeAdded { node, secret } => Some((node.id, secret)),
                _ => None,
            })
            .collect();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].0, agent_id);
        assert_eq!(added[0].1, entries[0].secret);
    }

    #[test]
    fn protocol_mismatch_gets_an_explicit_denial() {
        let (server, transport) = server_with(json!({}));

        let mut request = connect(NodeKind::Agent, &[]);
        request.protocol_version = PROTOCOL_VERSION - 1;
        let sender = request.sender_socket;
        server.handle_message(DomainMessage::Connect(request));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, sender);
        assert!(matches!(
            sent[0].1,
            OutboundMessage::ConnectionDenied {
                reason: ConnectionDeniedReason::ProtocolMismatch
            }
        ));
        assert!(server.node_views().is_empty());
    }

    #[test]
    fn worker_connect_binds_its_assignment_and_requeues_on_disconnect() {
        let (server, transport) = server_with(json!({}));

        // a worker asks for work
        server.handle_message(DomainMessage::RequestAssignment {
            kind: AssignmentKind::AudioMixer,
            pool: String::new(),
            wallet_id: None,
            version: Some("2305".into()),
            sender_socket: "203.0.113.7:50000".parse().unwrap(),
        });
        let offer = transport
            .sent()
            .into_iter()
            .find_map(|(_, message)| match message {
                OutboundMessage::AssignmentOffer { id, .. } => Some(id),
                _ => None,
            })
            .expect("an offer was sent");

        // it connects with the hand-out id
        let mut request = connect(NodeKind::AudioMixer, &[]);
        request.assignment_id = Some(offer);
        let node_id = request.candidate_id;
        server.handle_message(DomainMessage::Connect(request));

        let queued_before = server.assignment_listing();
        assert_eq!(queued_before.fulfilled.len(), 1);
        let bound_assignment = queued_before.fulfilled[0].0.id;
        assert_eq!(queued_before.fulfilled[0].1, node_id);

        // disconnect requeues the static under a fresh id
        server.handle_message(DomainMessage::Disconnect { node_id });
        let listing = server.assignment_listing();
        assert!(listing.fulfilled.is_empty());
        assert!(
            listing
                .queued
                .iter()
                .any(|view| view.kind == AssignmentKind::AudioMixer && view.id != bound_assignment)
        );
    }

    #[test]
    fn stale_handout_connect_is_denied() {
        let (server, transport) = server_with(json!({}));

        let mut request = connect(NodeKind::AudioMixer, &[]);
        request.assignment_id = Some(Uuid::new_v4());
        server.handle_message(DomainMessage::Connect(request));

        assert!(matches!(
            transport.sent()[0].1,
            OutboundMessage::ConnectionDenied {
                reason: ConnectionDeniedReason::InvalidAssignment
            }
        ));
        assert!(server.node_views().is_empty());
    }

    #[test]
    fn unknown_list_request_is_silently_dropped() {
        let (server, transport) = server_with(json!({}));

        server.handle_message(DomainMessage::ListRequest {
            node_id: Uuid::new_v4(),
            public_socket: "203.0.113.7:50000".parse().unwrap(),
            local_socket: "10.0.0.7:50000".parse().unwrap(),
            interest_set: vec![NodeKind::AudioMixer],
        });

        assert!(transport.sent().is_empty());
        assert!(transport.reliable().is_empty());
    }

    #[test]
    fn kill_node_notifies_interested_survivors() {
        let (server, transport) = server_with(json!({}));

        let watcher = connect(NodeKind::AudioMixer, &[NodeKind::EntityServer]);
        let watcher_socket = watcher.public_socket;
        server.handle_message(DomainMessage::Connect(watcher));

        let entity = connect(NodeKind::EntityServer, &[]);
        let entity_id = entity.candidate_id;
        server.handle_message(DomainMessage::Connect(entity));
        transport.clear();

        assert!(server.kill_node(entity_id));
        assert!(!server.kill_node(entity_id));

        let removals: Vec<_> = transport
            .sent()
            .into_iter()
            .filter_map(|(to, message)| match message {
                OutboundMessage::NodeRemoved { node_id } => Some((to, node_id)),
                _ => None,
            })
            .collect();
        assert_eq!(removals, vec![(watcher_socket, entity_id)]);
    }

    #[test]
    fn settings_change_reconciles_replication_topology() {
        let (server, _transport) = server_with(json!({}));
        assert!(server.node_views().is_empty());

        server.apply_settings(json!({
            "broadcasting": {
                "downstream_servers": [
                    { "server_type": "audio-mixer", "address": "192.0.2.10:7000" }
                ]
            }
        }));

        let nodes = server.node_views();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].kind, NodeKind::DownstreamAudioMixer);

        // removing the peer from settings removes the node
        server.apply_settings(json!({ "broadcasting": { "downstream_servers": [] } }));
        assert!(server.node_views().is_empty());
    }

    #[test]
    fn ice_ack_requests_a_single_address_push() {
        let (server, _transport) = server_with(json!({}));

        // select a candidate first
        let followups = server.handle_ice_lookup_result(vec!["203.0.113.1".parse().unwrap()]);
        assert_eq!(followups, vec![FollowUp::PushIceAddress]);

        // the ACK's notify collapses into the already-in-flight update
        let followups = server.handle_message(DomainMessage::IceHeartbeatAck);
        assert!(followups.is_empty());
    }

    #[tokio::test]
    async fn push_ice_address_clears_the_in_flight_flag() {
        let (server, _transport) = server_with(json!({}));

        let followups = server.handle_ice_lookup_result(vec!["203.0.113.1".parse().unwrap()]);
        assert_eq!(followups, vec![FollowUp::PushIceAddress]);
        server.push_ice_address().await;

        // the first update finished, so a later notify starts a fresh one
        let followups = server.handle_message(DomainMessage::IceHeartbeatAck);
        assert_eq!(followups, vec![FollowUp::PushIceAddress]);
    }

    #[tokio::test]
    async fn credits_accrue_and_flush_for_assigned_wallets() {
        let (server, transport) = server_with(json!({}));

        let wallet = Uuid::new_v4();
        server.handle_message(DomainMessage::RequestAssignment {
            kind: AssignmentKind::AudioMixer,
            pool: String::new(),
            wallet_id: Some(wallet),
            version: None,
            sender_socket: "203.0.113.7:50000".parse().unwrap(),
        });
        let offer = transport
            .sent()
            .into_iter()
            .find_map(|(_, message)| match message {
                OutboundMessage::AssignmentOffer { id, .. } => Some(id),
                _ => None,
            })
            .unwrap();

        let mut request = connect(NodeKind::AudioMixer, &[]);
        request.assignment_id = Some(offer);
        server.handle_message(DomainMessage::Connect(request));

        server.accrue_credits();
        server.flush_credits().await;
        // flush + confirmation against the null metaverse leaves nothing pending
        server.accrue_credits();
        server.flush_credits().await;
    }
}
