//! Metaverse API collaborator: domain heartbeats, discovery address
//! updates, credit transactions, and temporary identity acquisition.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use hds_broker::CreditTransaction;

/// Fixed delay between temporary-identity attempts.
pub const TEMPORARY_IDENTITY_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Bounded retries for the one-shot temporary-identity flow.
pub const TEMPORARY_IDENTITY_MAX_ATTEMPTS: u32 = 5;

/// Errors from the metaverse API.
#[derive(Debug, Error)]
pub enum MetaverseError {
    /// Transport-level failure.
    #[error("metaverse request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The API refused the request.
    #[error("metaverse rejected request with status {0}")]
    Rejected(u16),
}

/// Periodic presence advertisement for the domain.
#[derive(Debug, Clone, Serialize)]
pub struct DomainHeartbeat {
    /// This domain's id.
    pub domain_id: Uuid,
    /// Public network address, when automatic networking advertises one.
    pub network_address: Option<String>,
    /// Number of connected users (unassigned Agents).
    pub num_connected_users: usize,
    /// Protocol version the domain speaks.
    pub protocol_version: u32,
}

/// Tells the discovery tier which rendezvous server fronts this domain.
#[derive(Debug, Clone, Serialize)]
pub struct IceAddressUpdate {
    /// This domain's id.
    pub domain_id: Uuid,
    /// Selected rendezvous address, if any.
    pub ice_address: Option<SocketAddr>,
    /// Whether the rendezvous server has acknowledged us.
    pub connected: bool,
}

/// A provisional domain identity for servers without an account.
#[derive(Debug, Clone, Deserialize)]
pub struct TemporaryIdentity {
    /// Assigned domain id.
    pub id: Uuid,
    /// Assigned placeholder name.
    pub name: String,
    /// Key authenticating future requests for this identity.
    pub api_key: String,
}

/// The metaverse API surface the orchestration core consumes.
#[async_trait]
pub trait MetaverseApi: Send + Sync {
    /// Advertise domain presence and population.
    async fn send_domain_heartbeat(&self, heartbeat: DomainHeartbeat) -> Result<(), MetaverseError>;

    /// Publish the selected rendezvous address.
    async fn update_ice_address(&self, update: IceAddressUpdate) -> Result<(), MetaverseError>;

    /// Submit a finalized credit transaction.
    async fn post_transaction(&self, transaction: &CreditTransaction) -> Result<(), MetaverseError>;

    /// Ask for a provisional domain identity.
    async fn acquire_temporary_identity(&self) -> Result<TemporaryIdentity, MetaverseError>;
}

/// `MetaverseApi` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMetaverseApi {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpMetaverseApi {
    /// Create a client against the given API base URL.
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(path);
        url
    }
}

#[async_trait]
impl MetaverseApi for HttpMetaverseApi {
    async fn send_domain_heartbeat(&self, heartbeat: DomainHeartbeat) -> Result<(), MetaverseError> {
        let url = self.endpoint(&format!("/api/v1/domains/{}", heartbeat.domain_id));
        let response = self.http.put(url).json(&heartbeat).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(MetaverseError::Rejected(response.status().as_u16()))
        }
    }

    async fn update_ice_address(&self, update: IceAddressUpdate) -> Result<(), MetaverseError> {
        let url = self.endpoint(&format!(
            "/api/v1/domains/{}/ice_server_address",
            update.domain_id
        ));
        let response = self.http.put(url).json(&update).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(MetaverseError::Rejected(response.status().as_u16()))
        }
    }

    async fn post_transaction(&self, transaction: &CreditTransaction) -> Result<(), MetaverseError> {
        let url = self.endpoint("/api/v1/transactions");
        let response = self.http.post(url).json(transaction).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(MetaverseError::Rejected(response.status().as_u16()))
        }
    }

    async fn acquire_temporary_identity(&self) -> Result<TemporaryIdentity, MetaverseError> {
        let url = self.endpoint("/api/v1/domains/temporary");
        let response = self.http.post(url).send().await?;
        if !response.status().is_success() {
            return Err(MetaverseError::Rejected(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}

/// `MetaverseApi` that accepts everything without network traffic.
///
/// Used when no metaverse URL is configured and by the test suites.
#[derive(Debug, Default)]
pub struct NullMetaverse;

#[async_trait]
impl MetaverseApi for NullMetaverse {
    async fn send_domain_heartbeat(&self, _: DomainHeartbeat) -> Result<(), MetaverseError> {
        Ok(())
    }

    async fn update_ice_address(&self, _: IceAddressUpdate) -> Result<(), MetaverseError> {
        Ok(())
    }

    async fn post_transaction(&self, _: &CreditTransaction) -> Result<(), MetaverseError> {
        Ok(())
    }

    async fn acquire_temporary_identity(&self) -> Result<TemporaryIdentity, MetaverseError> {
        Ok(TemporaryIdentity {
            id: Uuid::new_v4(),
            name: "disconnected-haven".into(),
            api_key: String::new(),
        })
    }
}

/// Acquire a temporary identity with bounded retries and fixed backoff.
pub async fn acquire_temporary_identity_with_retry(
    api: &dyn MetaverseApi,
) -> Result<TemporaryIdentity, MetaverseError> {
    let mut last_error = None;
    for attempt in 1..=TEMPORARY_IDENTITY_MAX_ATTEMPTS {
        match api.acquire_temporary_identity().await {
            Ok(identity) => return Ok(identity),
            Err(error) => {
                warn!(attempt, %error, "temporary identity request failed");
                last_error = Some(error);
                if attempt < TEMPORARY_IDENTITY_MAX_ATTEMPTS {
                    tokio::time::sleep(TEMPORARY_IDENTITY_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last_error.expect("at least one attempt ran"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct FlakyMetaverse {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl MetaverseApi for FlakyMetaverse {
        async fn send_domain_heartbeat(&self, _: DomainHeartbeat) -> Result<(), MetaverseError> {
            Ok(())
        }

        async fn update_ice_address(&self, _: IceAddressUpdate) -> Result<(), MetaverseError> {
            Ok(())
        }

        async fn post_transaction(&self, _: &CreditTransaction) -> Result<(), MetaverseError> {
            Ok(())
        }

        async fn acquire_temporary_identity(&self) -> Result<TemporaryIdentity, MetaverseError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(TemporaryIdentity {
                    id: Uuid::new_v4(),
                    name: "temporary-haven".into(),
                    api_key: "key".into(),
                })
            } else {
                Err(MetaverseError::Rejected(503))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn temporary_identity_retries_until_success() {
        let api = FlakyMetaverse {
            calls: AtomicU32::new(0),
            succeed_on: 3,
        };

        let identity = acquire_temporary_identity_with_retry(&api).await.unwrap();
        assert_eq!(identity.name, "temporary-haven");
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn temporary_identity_gives_up_after_max_attempts() {
        let api = FlakyMetaverse {
            calls: AtomicU32::new(0),
            succeed_on: u32::MAX,
        };

        let result = acquire_temporary_identity_with_retry(&api).await;
        assert!(result.is_err());
        assert_eq!(
            api.calls.load(Ordering::SeqCst),
            TEMPORARY_IDENTITY_MAX_ATTEMPTS
        );
    }
}
