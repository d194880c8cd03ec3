//! The assignment broker: queue, matching, hand-outs, and requeueing.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use hds_core::{Assignment, AssignmentKind};

/// An incoming request for work from an unclaimed process.
#[derive(Debug, Clone)]
pub struct AssignmentRequest {
    /// Requested kind, possibly the `AllTypes` wildcard.
    pub kind: AssignmentKind,
    /// Requested pool; empty means unpooled.
    pub pool: String,
    /// Wallet the requester wants credited.
    pub wallet_id: Option<Uuid>,
    /// Requester's declared software version.
    pub version: Option<String>,
    /// Source address of the request packet.
    pub sender: IpAddr,
}

/// Record of an ephemeral hand-out awaiting a connect handshake.
#[derive(Debug, Clone)]
pub struct PendingHandout {
    /// Durable id of the catalog entry this offer was cut from.
    pub assignment_id: Uuid,
    /// Wallet declared by the requester.
    pub wallet_id: Option<Uuid>,
    /// Version declared by the requester.
    pub version: Option<String>,
    /// When the offer went out.
    pub offered_at: DateTime<Utc>,
}

/// What an assignment resolved to once its holder connected.
#[derive(Debug, Clone)]
pub struct FulfilledAssignment {
    /// Durable assignment id now bound to the node.
    pub assignment_id: Uuid,
    /// Kind of work.
    pub kind: AssignmentKind,
    /// Pool label.
    pub pool: String,
    /// Whether the assignment is static.
    pub is_static: bool,
    /// Wallet to credit while fulfilled.
    pub wallet_id: Option<Uuid>,
}

/// Outcome of a holder disconnecting.
#[derive(Debug, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Static assignment requeued under a fresh id.
    Requeued {
        /// Id the assignment previously carried. Never reissued.
        old_id: Uuid,
        /// Freshly generated id now in the queue.
        new_id: Uuid,
    },
    /// Dynamic assignment destroyed.
    Gone,
    /// The id did not match any cataloged assignment.
    Unknown,
}

/// Introspection view of one assignment.
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentView {
    /// Current id.
    pub id: Uuid,
    /// Kind of work.
    pub kind: AssignmentKind,
    /// Pool label.
    pub pool: String,
    /// Whether the assignment is static.
    pub is_static: bool,
}

/// Introspection listing for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerListing {
    /// Fulfilled assignments and the node bound to each.
    pub fulfilled: Vec<(AssignmentView, Uuid)>,
    /// Queued assignments, FIFO order.
    pub queued: Vec<AssignmentView>,
}

/// Owns the assignment catalog and the queue of unfulfilled work.
#[derive(Debug)]
pub struct AssignmentBroker {
    catalog: HashMap<Uuid, Assignment>,
    queue: VecDeque<Uuid>,
    fulfilled: HashMap<Uuid, Uuid>,
    pending_handouts: HashMap<Uuid, PendingHandout>,
    allowed_subnets: Vec<IpNet>,
}

impl AssignmentBroker {
    /// Create a broker that only serves requesters inside `allowed_subnets`.
    #[must_use]
    pub fn new(allowed_subnets: Vec<IpNet>) -> Self {
        Self {
            catalog: HashMap::new(),
            queue: VecDeque::new(),
            fulfilled: HashMap::new(),
            pending_handouts: HashMap::new(),
            allowed_subnets,
        }
    }

    /// Replace the subnet allow-list, e.g. after a settings change.
    pub fn set_allowed_subnets(&mut self, allowed_subnets: Vec<IpNet>) {
        self.allowed_subnets = allowed_subnets;
    }

    /// Register a catalog entry without queueing it.
    pub fn register(&mut self, assignment: Assignment) {
        self.catalog.insert(assignment.id, assignment);
    }

    /// Register a dynamic assignment and queue it immediately.
    pub fn register_and_queue(&mut self, assignment: Assignment) -> Uuid {
        let id = assignment.id;
        self.catalog.insert(id, assignment);
        self.queue.push_back(id);
        id
    }

    /// Queue every cataloged assignment that is neither queued nor fulfilled.
    ///
    /// Run at boot after the catalog is built. Entries are refreshed under
    /// new ids and enqueued with server kinds ahead of Agent jobs, so the
    /// world's infrastructure comes up before scripted content.
    pub fn queue_unfulfilled(&mut self) {
        let mut pending: Vec<Uuid> = self
            .catalog
            .keys()
            .copied()
            .filter(|id| !self.queue.contains(id) && !self.fulfilled.contains_key(id))
            .collect();

        pending.sort_by_key(|id| {
            let assignment = &self.catalog[id];
            (assignment.kind == AssignmentKind::Agent, assignment.id)
        });

        for id in pending {
            self.refresh_and_enqueue(id);
        }
    }

    /// Offer a queued assignment matching the request, if any.
    ///
    /// The matched entry is not removed: it is re-enqueued at the tail so
    /// the same pending assignment can be offered to other simultaneous
    /// requesters until one completes a connect handshake. First connect
    /// wins; the rest of the hand-outs go stale.
    pub fn request_assignment(&mut self, request: &AssignmentRequest) -> Option<Assignment> {
        if !self
            .allowed_subnets
            .iter()
            .any(|subnet| subnet.contains(&request.sender))
        {
            debug!(sender = %request.sender, "assignment request from disallowed address");
            return None;
        }

        let position = self.queue.iter().position(|id| {
            let assignment = &self.catalog[id];
            let kind_matches = request.kind == AssignmentKind::AllTypes
                || assignment.kind == request.kind;
            let pool_matches = (assignment.pool.is_empty() && request.pool.is_empty())
                || assignment.pool == request.pool;
            kind_matches && pool_matches
        })?;

        let id = self.queue.remove(position).expect("position is in range");
        self.queue.push_back(id);

        let handout = self.catalog[&id].with_fresh_id();
        self.pending_handouts.insert(
            handout.id,
            PendingHandout {
                assignment_id: id,
                wallet_id: request.wallet_id,
                version: request.version.clone(),
                offered_at: Utc::now(),
            },
        );

        debug!(assignment = %id, handout = %handout.id, kind = %handout.kind, "offered assignment");
        Some(handout)
    }

    /// Bind a hand-out to the node that completed the connect handshake.
    ///
    /// Returns `None` for unknown hand-outs and for offers that lost the
    /// race: once one requester completes, the catalog entry leaves the
    /// queue and every other hand-out for it dies here.
    pub fn complete_assignment(
        &mut self,
        handout_id: Uuid,
        node_id: Uuid,
    ) -> Option<FulfilledAssignment> {
        let handout = self.pending_handouts.remove(&handout_id)?;
        let assignment_id = handout.assignment_id;

        if self.fulfilled.contains_key(&assignment_id) {
            debug!(handout = %handout_id, assignment = %assignment_id, "hand-out lost the connect race");
            return None;
        }

        let position = self.queue.iter().position(|id| *id == assignment_id)?;
        self.queue.remove(position);
        self.fulfilled.insert(assignment_id, node_id);

        let assignment = &self.catalog[&assignment_id];
        info!(assignment = %assignment_id, node = %node_id, kind = %assignment.kind, "assignment fulfilled");

        Some(FulfilledAssignment {
            assignment_id,
            kind: assignment.kind,
            pool: assignment.pool.clone(),
            is_static: assignment.is_static,
            wallet_id: handout.wallet_id,
        })
    }

    /// React to the disconnect of a node holding `assignment_id`.
    ///
    /// Static assignments go back in the queue under a freshly generated id;
    /// a stale id must never be reissued, or a disconnected worker's
    /// credentials could be replayed against a different process. Dynamic
    /// assignments are destroyed.
    pub fn requeue_on_disconnect(&mut self, assignment_id: Uuid) -> RequeueOutcome {
        self.fulfilled.remove(&assignment_id);

        let Some(assignment) = self.catalog.remove(&assignment_id) else {
            return RequeueOutcome::Unknown;
        };

        if assignment.is_static {
            let refreshed = assignment.with_fresh_id();
            let new_id = refreshed.id;
            info!(old = %assignment_id, new = %new_id, kind = %refreshed.kind, "requeued static assignment");
            self.catalog.insert(new_id, refreshed);
            self.queue.push_back(new_id);
            RequeueOutcome::Requeued {
                old_id: assignment_id,
                new_id,
            }
        } else {
            info!(assignment = %assignment_id, "dynamic assignment gone after disconnect");
            RequeueOutcome::Gone
        }
    }

    /// The payload of a queued or fulfilled assignment, for script download.
    #[must_use]
    pub fn payload(&self, assignment_id: Uuid) -> Option<bytes::Bytes> {
        self.catalog
            .get(&assignment_id)
            .map(|assignment| assignment.payload.clone())
    }

    /// Introspection listing for the admin surface.
    #[must_use]
    pub fn listing(&self) -> BrokerListing {
        let view = |assignment: &Assignment| AssignmentView {
            id: assignment.id,
            kind: assignment.kind,
            pool: assignment.pool.clone(),
            is_static: assignment.is_static,
        };

        BrokerListing {
            fulfilled: self
                .fulfilled
                .iter()
                .map(|(assignment_id, node_id)| (view(&self.catalog[assignment_id]), *node_id))
                .collect(),
            queued: self.queue.iter().map(|id| view(&self.catalog[id])).collect(),
        }
    }

    /// Number of queued assignments.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Number of hand-outs awaiting a connect handshake.
    #[must_use]
    pub fn pending_handout_count(&self) -> usize {
        self.pending_handouts.len()
    }

    fn refresh_and_enqueue(&mut self, id: Uuid) {
        let assignment = self
            .catalog
            .remove(&id)
            .expect("refresh_and_enqueue called with cataloged id");
        let refreshed = assignment.with_fresh_id();
        let new_id = refreshed.id;
        self.catalog.insert(new_id, refreshed);
        self.queue.push_back(new_id);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    use super::*;

    fn open_broker() -> AssignmentBroker {
        AssignmentBroker::new(vec!["0.0.0.0/0".parse().unwrap()])
    }

    fn request(kind: AssignmentKind, pool: &str) -> AssignmentRequest {
        AssignmentRequest {
            kind,
            pool: pool.into(),
            wallet_id: None,
            version: Some("2305".into()),
            sender: "203.0.113.9".parse().unwrap(),
        }
    }

    #[test]
    fn matching_request_keeps_queue_length() {
        let mut broker = open_broker();
        broker.register_and_queue(Assignment::new_static(AssignmentKind::EntityServer));
        broker.register_and_queue(Assignment::new_static(AssignmentKind::Agent).with_pool("x"));

        let offered = broker
            .request_assignment(&request(AssignmentKind::EntityServer, ""))
            .unwrap();

        assert_eq!(offered.kind, AssignmentKind::EntityServer);
        assert_eq!(broker.queued_len(), 2);
        // matched entry rotated to the tail
        let listing = broker.listing();
        assert_eq!(listing.queued[0].kind, AssignmentKind::Agent);
        assert_eq!(listing.queued[1].kind, AssignmentKind::EntityServer);
    }

    #[test]
    fn hand_out_id_differs_from_catalog_id() {
        let mut broker = open_broker();
        let id = broker.register_and_queue(Assignment::new_static(AssignmentKind::AudioMixer));

        let offered = broker
            .request_assignment(&request(AssignmentKind::AudioMixer, ""))
            .unwrap();

        assert_ne!(offered.id, id);
    }

    #[test]
    fn all_types_wildcard_matches_first_queued() {
        let mut broker = open_broker();
        broker.register_and_queue(Assignment::new_static(AssignmentKind::AvatarMixer));
        broker.register_and_queue(Assignment::new_static(AssignmentKind::AudioMixer));

        let offered = broker
            .request_assignment(&request(AssignmentKind::AllTypes, ""))
            .unwrap();
        assert_eq!(offered.kind, AssignmentKind::AvatarMixer);
    }

    #[test]
    fn pool_constraints_must_agree() {
        let mut broker = open_broker();
        broker.register_and_queue(Assignment::new_static(AssignmentKind::Agent).with_pool("blue"));

        assert!(broker.request_assignment(&request(AssignmentKind::Agent, "")).is_none());
        assert!(broker.request_assignment(&request(AssignmentKind::Agent, "red")).is_none());
        assert!(broker.request_assignment(&request(AssignmentKind::Agent, "blue")).is_some());
    }

    #[test]
    fn disallowed_subnet_is_rejected_without_side_effects() {
        let mut broker = AssignmentBroker::new(vec!["10.0.0.0/8".parse().unwrap()]);
        broker.register_and_queue(Assignment::new_static(AssignmentKind::AudioMixer));

        let mut req = request(AssignmentKind::AudioMixer, "");
        req.sender = "203.0.113.9".parse().unwrap();

        assert!(broker.request_assignment(&req).is_none());
        assert_eq!(broker.pending_handout_count(), 0);
        assert_eq!(broker.queued_len(), 1);
    }

    #[test]
    fn first_connect_wins_the_binding() {
        let mut broker = open_broker();
        broker.register_and_queue(Assignment::new_static(AssignmentKind::EntityServer));

        let first = broker
            .request_assignment(&request(AssignmentKind::EntityServer, ""))
            .unwrap();
        let second = broker
            .request_assignment(&request(AssignmentKind::EntityServer, ""))
            .unwrap();
        assert_ne!(first.id, second.id);

        let winner = Uuid::new_v4();
        let bound = broker.complete_assignment(second.id, winner).unwrap();
        assert_eq!(bound.kind, AssignmentKind::EntityServer);
        assert_eq!(broker.queued_len(), 0);

        // the earlier hand-out is now stale
        assert!(broker.complete_assignment(first.id, Uuid::new_v4()).is_none());
    }

    #[test]
    fn completion_carries_requester_wallet() {
        let mut broker = open_broker();
        broker.register_and_queue(Assignment::new_static(AssignmentKind::AudioMixer));

        let wallet = Uuid::new_v4();
        let mut req = request(AssignmentKind::AudioMixer, "");
        req.wallet_id = Some(wallet);

        let offered = broker.request_assignment(&req).unwrap();
        let bound = broker.complete_assignment(offered.id, Uuid::new_v4()).unwrap();
        assert_eq!(bound.wallet_id, Some(wallet));
    }

    #[test]
    fn unknown_handout_is_rejected() {
        let mut broker = open_broker();
        assert!(broker.complete_assignment(Uuid::new_v4(), Uuid::new_v4()).is_none());
    }

    #[test]
    fn static_requeue_never_reuses_the_old_id() {
        let mut broker = open_broker();
        broker.register_and_queue(Assignment::new_static(AssignmentKind::AudioMixer));

        let offered = broker
            .request_assignment(&request(AssignmentKind::AudioMixer, ""))
            .unwrap();
        let bound = broker.complete_assignment(offered.id, Uuid::new_v4()).unwrap();

        match broker.requeue_on_disconnect(bound.assignment_id) {
            RequeueOutcome::Requeued { old_id, new_id } => {
                assert_eq!(old_id, bound.assignment_id);
                assert_ne!(old_id, new_id);
            }
            other => panic!("expected requeue, got {other:?}"),
        }
        assert_eq!(broker.queued_len(), 1);
    }

    #[test]
    fn dynamic_assignment_is_gone_after_disconnect() {
        let mut broker = open_broker();
        broker.register_and_queue(
            Assignment::new_dynamic(AssignmentKind::Agent).with_payload(Bytes::from_static(b"print(1)")),
        );

        let offered = broker.request_assignment(&request(AssignmentKind::Agent, "")).unwrap();
        let bound = broker.complete_assignment(offered.id, Uuid::new_v4()).unwrap();

        assert_eq!(
            broker.requeue_on_disconnect(bound.assignment_id),
            RequeueOutcome::Gone
        );
        assert_eq!(broker.queued_len(), 0);
        assert_eq!(
            broker.requeue_on_disconnect(bound.assignment_id),
            RequeueOutcome::Unknown
        );
    }

    #[test]
    fn queue_unfulfilled_puts_servers_before_agents() {
        let mut broker = open_broker();
        broker.register(Assignment::new_static(AssignmentKind::Agent).with_pool("scripted"));
        broker.register(Assignment::new_static(AssignmentKind::AudioMixer));
        broker.register(Assignment::new_static(AssignmentKind::EntityServer));

        broker.queue_unfulfilled();

        let listing = broker.listing();
        assert_eq!(listing.queued.len(), 3);
        assert_eq!(listing.queued[2].kind, AssignmentKind::Agent);
        assert!(listing.queued[..2]
            .iter()
            .all(|view| view.kind != AssignmentKind::Agent));
    }

    #[test]
    fn queue_unfulfilled_is_idempotent_for_already_queued_entries() {
        let mut broker = open_broker();
        broker.register_and_queue(Assignment::new_static(AssignmentKind::AudioMixer));
        broker.queue_unfulfilled();
        assert_eq!(broker.queued_len(), 1);
    }
}
