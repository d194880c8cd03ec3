//! The heartbeat failover controller.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Consecutive silent heartbeats before the selected address is abandoned.
///
/// A hard threshold, not a backoff: failover latency must stay bounded.
pub const NO_REPLY_FAILOVER_THRESHOLD: u32 = 3;

/// Consecutive denials before the signing keypair is regenerated.
pub const DENIAL_KEYPAIR_REGEN_THRESHOLD: u32 = 3;

/// Retry delay for a failed hostname lookup with no address selected.
pub const LOOKUP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The identity material a heartbeat advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatIdentity {
    /// This server's session id.
    pub session_id: Uuid,
    /// Publicly reachable address.
    pub public_socket: SocketAddr,
    /// Local-network address.
    pub local_socket: SocketAddr,
}

impl HeartbeatIdentity {
    fn signable_bytes(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}",
            self.session_id, self.public_socket, self.local_socket
        )
        .into_bytes()
    }
}

/// A signed heartbeat ready to send to the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHeartbeat {
    /// Advertised identity.
    #[serde(flatten)]
    pub identity: HeartbeatIdentity,
    /// Hex-encoded Ed25519 signature over the identity.
    pub signature: String,
}

/// Side effects for the event loop to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceEffect {
    /// Send a heartbeat packet to the selected rendezvous address.
    SendHeartbeat {
        /// Destination.
        to: SocketAddr,
        /// Signed payload.
        payload: SignedHeartbeat,
    },
    /// Resolve the rendezvous hostname again.
    RequestLookup,
    /// Resolve again after a delay (lookup failed with nothing selected).
    RetryLookupAfter(Duration),
    /// Tell the discovery API which rendezvous address we now use.
    NotifyAddressChanged,
}

/// Heartbeat failover state machine.
///
/// Invariant: `selected` is always drawn from `candidates \ failed`; when
/// that set empties, `failed` is cleared and the full candidate list is
/// retried, so a single bad cycle cannot lock the controller out.
pub struct IceController {
    port: u16,
    candidates: Vec<SocketAddr>,
    failed: HashSet<SocketAddr>,
    selected: Option<SocketAddr>,
    connected: bool,
    no_reply_count: u32,
    denial_count: u32,
    signing_key: SigningKey,
    cached_heartbeat: Option<SignedHeartbeat>,
}

impl IceController {
    /// Create a controller heartbeating rendezvous servers on `port`.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            candidates: Vec::new(),
            failed: HashSet::new(),
            selected: None,
            connected: false,
            no_reply_count: 0,
            denial_count: 0,
            signing_key: SigningKey::generate(&mut OsRng),
            cached_heartbeat: None,
        }
    }

    /// Currently selected rendezvous address.
    #[must_use]
    pub const fn selected(&self) -> Option<SocketAddr> {
        self.selected
    }

    /// Whether an ACK has been seen since the last selection.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Addresses that went silent on us this cycle.
    #[must_use]
    pub const fn failed(&self) -> &HashSet<SocketAddr> {
        &self.failed
    }

    /// Public half of the current signing keypair.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// A hostname lookup finished with addresses.
    pub fn handle_lookup_result(
        &mut self,
        addresses: Vec<IpAddr>,
        identity: &HeartbeatIdentity,
    ) -> Vec<IceEffect> {
        if addresses.is_empty() {
            return self.handle_lookup_failure();
        }

        let had_none = self.candidates.is_empty();
        self.candidates = addresses
            .into_iter()
            .map(|ip| SocketAddr::new(ip, self.port))
            .collect();

        if had_none {
            info!(count = self.candidates.len(), "found rendezvous addresses");
        }

        if self.selected.is_none() {
            self.select_candidate(identity)
        } else {
            Vec::new()
        }
    }

    /// A hostname lookup failed or produced nothing usable.
    pub fn handle_lookup_failure(&mut self) -> Vec<IceEffect> {
        if self.selected.is_none() {
            warn!("rendezvous lookup failed with no address selected, will retry");
            vec![IceEffect::RetryLookupAfter(LOOKUP_RETRY_DELAY)]
        } else {
            Vec::new()
        }
    }

    /// Fixed-period heartbeat tick.
    ///
    /// Every tick counts as a send-with-no-reply until an ACK or denial
    /// resets the counter; the third consecutive silent tick triggers
    /// failover.
    pub fn tick(&mut self, identity: &HeartbeatIdentity) -> Vec<IceEffect> {
        let Some(selected) = self.selected else {
            debug!("no rendezvous address selected, waiting on host lookup");
            return Vec::new();
        };

        self.no_reply_count += 1;
        if self.no_reply_count >= NO_REPLY_FAILOVER_THRESHOLD {
            warn!(
                address = %selected,
                silent_heartbeats = self.no_reply_count,
                "rendezvous server went silent, failing over"
            );
            self.failed.insert(selected);
            self.selected = None;
            self.connected = false;
            self.no_reply_count = 0;

            let mut effects = vec![IceEffect::NotifyAddressChanged];
            effects.extend(self.select_candidate(identity));
            return effects;
        }

        vec![IceEffect::SendHeartbeat {
            to: selected,
            payload: self.signed_heartbeat(identity),
        }]
    }

    /// The rendezvous server acknowledged a heartbeat.
    pub fn handle_ack(&mut self) -> Vec<IceEffect> {
        self.no_reply_count = 0;
        if self.connected {
            Vec::new()
        } else {
            self.connected = true;
            info!(address = ?self.selected, "connected to rendezvous server");
            vec![IceEffect::NotifyAddressChanged]
        }
    }

    /// The rendezvous server explicitly denied a heartbeat.
    ///
    /// The server is reachable, so the no-reply counter resets; a denial
    /// usually means an expired or invalid signature, and three in a row
    /// force a fresh keypair.
    pub fn handle_denial(&mut self, identity: &HeartbeatIdentity) -> Vec<IceEffect> {
        self.no_reply_count = 0;
        self.denial_count += 1;

        if self.denial_count >= DENIAL_KEYPAIR_REGEN_THRESHOLD {
            info!(
                denials = self.denial_count,
                "rendezvous server keeps denying heartbeats, regenerating keypair"
            );
            self.signing_key = SigningKey::generate(&mut OsRng);
            self.cached_heartbeat = None;
            self.denial_count = 0;

            if let Some(selected) = self.selected {
                return vec![IceEffect::SendHeartbeat {
                    to: selected,
                    payload: self.signed_heartbeat(identity),
                }];
            }
        }

        Vec::new()
    }

    /// The server's own public or local socket changed.
    pub fn handle_sockets_changed(&mut self) -> Vec<IceEffect> {
        vec![IceEffect::RequestLookup]
    }

    fn select_candidate(&mut self, identity: &HeartbeatIdentity) -> Vec<IceEffect> {
        let mut pool: Vec<SocketAddr> = self
            .candidates
            .iter()
            .filter(|address| !self.failed.contains(address))
            .copied()
            .collect();

        if pool.is_empty() {
            if !self.failed.is_empty() {
                warn!("every rendezvous address has failed, retrying the full list");
                self.failed.clear();
            }
            pool.clone_from(&self.candidates);
        }

        if pool.is_empty() {
            return vec![IceEffect::RequestLookup];
        }

        let index = if pool.len() == 1 {
            0
        } else {
            rand::Rng::gen_range(&mut rand::thread_rng(), 0..pool.len())
        };

        let chosen = pool[index];
        info!(address = %chosen, "selected candidate rendezvous server");
        self.selected = Some(chosen);
        self.no_reply_count = 0;
        self.denial_count = 0;

        vec![
            IceEffect::SendHeartbeat {
                to: chosen,
                payload: self.signed_heartbeat(identity),
            },
            IceEffect::NotifyAddressChanged,
        ]
    }

    /// The signed heartbeat for `identity`, re-signing only when the
    /// identity or keypair changed since the last send.
    fn signed_heartbeat(&mut self, identity: &HeartbeatIdentity) -> SignedHeartbeat {
        if let Some(cached) = &self.cached_heartbeat
            && cached.identity == *identity
        {
            return cached.clone();
        }

        let signature = self.signing_key.sign(&identity.signable_bytes());
        let heartbeat = SignedHeartbeat {
            identity: identity.clone(),
            signature: hex::encode(signature.to_bytes()),
        };
        self.cached_heartbeat = Some(heartbeat.clone());
        heartbeat
    }
}

impl std::fmt::Debug for IceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceController")
            .field("candidates", &self.candidates)
            .field("failed", &self.failed)
            .field("selected", &self.selected)
            .field("connected", &self.connected)
            .field("no_reply_count", &self.no_reply_count)
            .field("denial_count", &self.denial_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn identity() -> HeartbeatIdentity {
        HeartbeatIdentity {
            session_id: Uuid::new_v4(),
            public_socket: "198.51.100.4:40102".parse().unwrap(),
            local_socket: "192.168.1.4:40102".parse().unwrap(),
        }
    }

    fn controller_with(addresses: &[&str]) -> (IceController, HeartbeatIdentity) {
        let mut controller = IceController::new(7337);
        let id = identity();
        let ips: Vec<IpAddr> = addresses.iter().map(|a| a.parse().unwrap()).collect();
        let effects = controller.handle_lookup_result(ips, &id);
        assert!(
            effects
                .iter()
                .any(|e| matches!(e, IceEffect::SendHeartbeat { .. })),
            "selection fires an immediate heartbeat"
        );
        (controller, id)
    }

    fn heartbeat_payload(effects: &[IceEffect]) -> Option<SignedHeartbeat> {
        effects.iter().find_map(|effect| match effect {
            IceEffect::SendHeartbeat { payload, .. } => Some(payload.clone()),
            _ => None,
        })
    }

    #[test]
    fn lookup_selects_a_candidate_and_notifies_discovery() {
        let (controller, _) = controller_with(&["203.0.113.1"]);
        assert_eq!(controller.selected(), Some("203.0.113.1:7337".parse().unwrap()));
        assert!(!controller.is_connected());
    }

    #[test]
    fn three_silent_ticks_fail_over_to_another_candidate() {
        let (mut controller, id) = controller_with(&["203.0.113.1", "203.0.113.2"]);
        let original = controller.selected().unwrap();

        controller.tick(&id);
        controller.tick(&id);
        let effects = controller.tick(&id);

        assert!(controller.failed().contains(&original));
        let reselected = controller.selected().unwrap();
        assert_ne!(reselected, original);
        assert!(effects.contains(&IceEffect::NotifyAddressChanged));
    }

    #[test]
    fn single_candidate_is_reselected_after_failover() {
        let (mut controller, id) = controller_with(&["203.0.113.1"]);
        let only = controller.selected().unwrap();

        controller.tick(&id);
        controller.tick(&id);
        controller.tick(&id);

        // no permanent lockout with one candidate: the failed set is cleared
        // and the same address selected again
        assert!(controller.failed().is_empty());
        assert_eq!(controller.selected(), Some(only));
    }

    #[test]
    fn ack_resets_the_silence_counter() {
        let (mut controller, id) = controller_with(&["203.0.113.1"]);
        let selected = controller.selected().unwrap();

        for _ in 0..10 {
            controller.tick(&id);
            controller.handle_ack();
        }

        assert_eq!(controller.selected(), Some(selected));
        assert!(controller.failed().is_empty());
    }

    #[test]
    fn first_ack_after_a_gap_notifies_discovery_once() {
        let (mut controller, _) = controller_with(&["203.0.113.1"]);

        assert_eq!(controller.handle_ack(), vec![IceEffect::NotifyAddressChanged]);
        assert!(controller.is_connected());
        assert!(controller.handle_ack().is_empty());
    }

    #[test]
    fn heartbeat_payload_is_cached_until_identity_changes() {
        let (mut controller, id) = controller_with(&["203.0.113.1"]);

        let first = heartbeat_payload(&controller.tick(&id)).unwrap();
        controller.handle_ack();
        let second = heartbeat_payload(&controller.tick(&id)).unwrap();
        controller.handle_ack();
        assert_eq!(first, second);

        let mut moved = id;
        moved.public_socket = "198.51.100.99:40102".parse().unwrap();
        let rebuilt = heartbeat_payload(&controller.tick(&moved)).unwrap();
        assert_ne!(first.signature, rebuilt.signature);
        assert_eq!(rebuilt.identity.public_socket, moved.public_socket);
    }

    #[test]
    fn three_denials_regenerate_the_keypair() {
        let (mut controller, id) = controller_with(&["203.0.113.1"]);
        let key_before = controller.verifying_key();
        let signature_before = heartbeat_payload(&controller.tick(&id)).unwrap().signature;

        assert!(controller.handle_denial(&id).is_empty());
        assert!(controller.handle_denial(&id).is_empty());
        let effects = controller.handle_denial(&id);

        assert_ne!(controller.verifying_key(), key_before);
        let resigned = heartbeat_payload(&effects).expect("immediate heartbeat after regen");
        assert_ne!(resigned.signature, signature_before);
    }

    #[test]
    fn denial_resets_the_no_reply_counter() {
        let (mut controller, id) = controller_with(&["203.0.113.1", "203.0.113.2"]);
        let selected = controller.selected().unwrap();

        // two silent ticks, then a denial: the server is reachable,
        // so no failover happens on the next tick
        controller.tick(&id);
        controller.tick(&id);
        controller.handle_denial(&id);
        controller.tick(&id);

        assert_eq!(controller.selected(), Some(selected));
        assert!(controller.failed().is_empty());
    }

    #[test]
    fn lookup_failure_without_selection_schedules_a_retry() {
        let mut controller = IceController::new(7337);
        assert_eq!(
            controller.handle_lookup_failure(),
            vec![IceEffect::RetryLookupAfter(LOOKUP_RETRY_DELAY)]
        );
    }

    #[test]
    fn lookup_failure_with_selection_is_ignored() {
        let (mut controller, _) = controller_with(&["203.0.113.1"]);
        assert!(controller.handle_lookup_failure().is_empty());
    }

    #[test]
    fn socket_change_triggers_a_lookup() {
        let (mut controller, _) = controller_with(&["203.0.113.1"]);
        assert_eq!(
            controller.handle_sockets_changed(),
            vec![IceEffect::RequestLookup]
        );
    }

    #[test]
    fn tick_without_selection_does_nothing() {
        let mut controller = IceController::new(7337);
        assert!(controller.tick(&identity()).is_empty());
    }
}
