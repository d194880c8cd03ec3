//! OAuth client and the two-hop callback flow.
//!
//! The callback is a pair of dependent network round-trips: authorization
//! code → access token, then access token → profile. Each in-progress
//! callback is an explicit [`CallbackFlow`] keyed by its anti-replay state
//! token and advanced by completion events, so there is no hidden
//! reentrancy between the hops.

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::WebProfile;

/// Errors from the provider round-trips.
#[derive(Debug, Error)]
pub enum OAuthError {
    /// Transport-level failure talking to the provider.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with something unusable.
    #[error("malformed provider response: {0}")]
    MalformedResponse(&'static str),

    /// A flow event arrived in the wrong order.
    #[error("callback flow for state {state} not in stage {expected}")]
    WrongStage {
        /// The flow's state token.
        state: Uuid,
        /// Stage the event required.
        expected: &'static str,
    },
}

#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ProfileEnvelope {
    data: ProfileData,
}

#[derive(Debug, Deserialize)]
struct ProfileData {
    user: WebProfile,
}

/// Client for the configured OAuth provider.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    provider_url: Url,
    client_id: String,
    client_secret: String,
    redirect_url: Url,
}

impl OAuthClient {
    /// Create a client for a provider.
    #[must_use]
    pub fn new(
        provider_url: Url,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_url: Url,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            provider_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_url,
        }
    }

    /// The provider authorize URL a browser is redirected to.
    #[must_use]
    pub fn authorization_url(&self, state: Uuid) -> Url {
        let mut url = self.provider_url.clone();
        url.set_path("/oauth/authorize");
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("state", &state.to_string())
            .append_pair("redirect_uri", self.redirect_url.as_str());
        url
    }

    /// Exchange an authorization code for an access token.
    pub async fn exchange_code(&self, code: &str) -> Result<String, OAuthError> {
        let mut url = self.provider_url.clone();
        url.set_path("/oauth/token");

        let grant: TokenGrant = self
            .http
            .post(url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("redirect_uri", self.redirect_url.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if grant.access_token.is_empty() {
            return Err(OAuthError::MalformedResponse("empty access_token"));
        }
        Ok(grant.access_token)
    }

    /// Fetch the profile behind an access token.
    pub async fn fetch_profile(&self, access_token: &str) -> Result<WebProfile, OAuthError> {
        let mut url = self.provider_url.clone();
        url.set_path("/api/v1/user/profile");
        url.query_pairs_mut()
            .append_pair("access_token", access_token);

        let envelope: ProfileEnvelope = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(envelope.data.user)
    }
}

/// Stage of an in-progress callback.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CallbackStage {
    AwaitingToken,
    AwaitingProfile { access_token: String },
    Complete { profile: WebProfile },
}

/// One in-progress OAuth callback, keyed by its consumed state token.
#[derive(Debug)]
pub struct CallbackFlow {
    state: Uuid,
    stage: CallbackStage,
}

impl CallbackFlow {
    /// Begin a flow for a state token that was just consumed.
    #[must_use]
    pub const fn begin(state: Uuid) -> Self {
        Self {
            state,
            stage: CallbackStage::AwaitingToken,
        }
    }

    /// The state token this flow belongs to.
    #[must_use]
    pub const fn state(&self) -> Uuid {
        self.state
    }

    /// Advance the flow with the token-grant result.
    pub fn token_received(&mut self, access_token: String) -> Result<(), OAuthError> {
        if self.stage != CallbackStage::AwaitingToken {
            return Err(OAuthError::WrongStage {
                state: self.state,
                expected: "awaiting-token",
            });
        }
        debug!(state = %self.state, "oauth callback received access token");
        self.stage = CallbackStage::AwaitingProfile { access_token };
        Ok(())
    }

    /// Advance the flow with the fetched profile.
    pub fn profile_received(&mut self, profile: WebProfile) -> Result<(), OAuthError> {
        if !matches!(self.stage, CallbackStage::AwaitingProfile { .. }) {
            return Err(OAuthError::WrongStage {
                state: self.state,
                expected: "awaiting-profile",
            });
        }
        debug!(state = %self.state, username = %profile.username, "oauth callback fetched profile");
        self.stage = CallbackStage::Complete { profile };
        Ok(())
    }

    /// The access token while the profile fetch is pending.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        match &self.stage {
            CallbackStage::AwaitingProfile { access_token } => Some(access_token),
            _ => None,
        }
    }

    /// The profile once the flow completed.
    #[must_use]
    pub fn profile(&self) -> Option<&WebProfile> {
        match &self.stage {
            CallbackStage::Complete { profile } => Some(profile),
            _ => None,
        }
    }
}

/// Drive a callback flow through both provider round-trips.
pub async fn run_callback_flow(
    client: &OAuthClient,
    flow: &mut CallbackFlow,
    code: &str,
) -> Result<WebProfile, OAuthError> {
    let access_token = client.exchange_code(code).await?;
    flow.token_received(access_token)?;

    let token = flow
        .access_token()
        .expect("flow advanced to awaiting-profile above")
        .to_owned();
    let profile = client.fetch_profile(&token).await?;
    flow.profile_received(profile.clone())?;
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client_for(base: &str) -> OAuthClient {
        OAuthClient::new(
            base.parse().unwrap(),
            "domain-client",
            "domain-secret",
            "https://domain.haven:40101/oauth".parse().unwrap(),
        )
    }

    #[test]
    fn authorization_url_carries_state_and_redirect() {
        let client = client_for("https://metaverse.haven");
        let state = Uuid::new_v4();
        let url = client.authorization_url(state);

        assert_eq!(url.path(), "/oauth/authorize");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("client_id".into(), "domain-client".into())));
        assert!(pairs.contains(&("response_type".into(), "code".into())));
        assert!(pairs.contains(&("state".into(), state.to_string())));
        assert!(
            pairs
                .iter()
                .any(|(k, v)| k == "redirect_uri" && v.contains("/oauth"))
        );
    }

    #[test]
    fn flow_advances_through_both_hops() {
        let mut flow = CallbackFlow::begin(Uuid::new_v4());
        assert!(flow.profile().is_none());

        flow.token_received("tok".into()).unwrap();
        assert_eq!(flow.access_token(), Some("tok"));

        let profile = WebProfile {
            username: "alice".into(),
            roles: vec![],
        };
        flow.profile_received(profile.clone()).unwrap();
        assert_eq!(flow.profile(), Some(&profile));
    }

    #[test]
    fn flow_rejects_out_of_order_events() {
        let mut flow = CallbackFlow::begin(Uuid::new_v4());
        let profile = WebProfile {
            username: "alice".into(),
            roles: vec![],
        };

        assert!(matches!(
            flow.profile_received(profile),
            Err(OAuthError::WrongStage { .. })
        ));

        flow.token_received("tok".into()).unwrap();
        assert!(matches!(
            flow.token_received("tok2".into()),
            Err(OAuthError::WrongStage { .. })
        ));
    }

    #[tokio::test]
    async fn callback_flow_runs_token_then_profile() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "token-xyz",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v1/user/profile"))
            .and(query_param("access_token", "token-xyz"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "user": { "username": "alice", "roles": ["admin"] } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let mut flow = CallbackFlow::begin(Uuid::new_v4());
        let profile = run_callback_flow(&client, &mut flow, "abc123").await.unwrap();

        assert_eq!(profile.username, "alice");
        assert_eq!(profile.roles, vec!["admin"]);
        assert_eq!(flow.profile(), Some(&profile));
    }

    #[tokio::test]
    async fn provider_error_surfaces_as_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let mut flow = CallbackFlow::begin(Uuid::new_v4());
        let result = run_callback_flow(&client, &mut flow, "abc123").await;
        assert!(matches!(result, Err(OAuthError::Http(_))));
    }
}
