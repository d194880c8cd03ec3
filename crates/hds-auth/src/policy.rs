//! Authorization policy for the admin HTTP surface.
//!
//! Three mutually exclusive policies, in priority order: an OAuth provider
//! plus an admin allow-list, HTTP Basic credentials, or no gate at all.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use hds_core::value_at;

use crate::{SessionStore, session_cookie_id, verify_basic_header};

/// Configured HTTP Basic credentials.
#[derive(Debug, Clone)]
pub struct BasicCredentials {
    /// Exact-match username.
    pub username: String,
    /// SHA-256 hex digest of the password.
    pub password_digest: String,
}

/// Single-use anti-replay tokens for the OAuth redirect flow.
///
/// A token is minted when a browser is redirected to the provider and must
/// be consumed exactly once on the callback; unknown or replayed tokens are
/// rejected there.
#[derive(Debug, Default)]
pub struct StateTokens {
    tokens: Mutex<HashSet<Uuid>>,
}

impl StateTokens {
    /// Create an empty token set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh state token.
    pub fn mint(&self) -> Uuid {
        let token = Uuid::new_v4();
        self.tokens.lock().insert(token);
        token
    }

    /// Consume a token. Returns false for unknown or already-used tokens.
    pub fn consume(&self, token: Uuid) -> bool {
        self.tokens.lock().remove(&token)
    }
}

/// The request attributes the policy looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthRequest<'a> {
    /// `Cookie` header, if present.
    pub cookie: Option<&'a str>,
    /// `Authorization` header, if present.
    pub authorization: Option<&'a str>,
    /// Whether `X-Requested-With: XMLHttpRequest` was sent. XHR callers
    /// cannot follow a redirect-based OAuth flow, so they get 401 instead.
    pub is_xhr: bool,
}

/// Outcome of evaluating a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Let the request through.
    Allow,
    /// Refuse with a plain 401.
    Unauthorized,
    /// Redirect the browser to the provider's authorize endpoint,
    /// carrying the minted anti-replay state token.
    RedirectToProvider {
        /// Token to embed as the `state` query parameter.
        state: Uuid,
    },
    /// Refuse with 401 and a `WWW-Authenticate: Basic` challenge.
    BasicChallenge {
        /// Realm shown by the browser prompt.
        realm: String,
    },
}

/// The authorization policy for the admin surface.
#[derive(Debug)]
pub struct AuthPolicy {
    oauth_configured: bool,
    admin_users: Vec<String>,
    admin_roles: Vec<String>,
    basic: Option<BasicCredentials>,
    hostname: String,
}

impl AuthPolicy {
    /// Build the policy from the settings document.
    #[must_use]
    pub fn from_settings(root: &Value) -> Self {
        let oauth_configured = value_at(root, "oauth.provider_url")
            .and_then(Value::as_str)
            .is_some();

        let string_list = |path: &str| {
            value_at(root, path)
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };

        let basic_username = value_at(root, "security.http_username").and_then(Value::as_str);
        let basic = basic_username.map(|username| BasicCredentials {
            username: username.to_owned(),
            password_digest: value_at(root, "security.http_password")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        });

        let policy = Self {
            oauth_configured,
            admin_users: string_list("admin.users"),
            admin_roles: string_list("admin.roles"),
            basic,
            hostname: value_at(root, "metaverse.local_hostname")
                .and_then(Value::as_str)
                .unwrap_or("localhost")
                .to_owned(),
        };

        if policy.uses_oauth() && policy.basic.is_some() {
            warn!(
                "settings contain both OAuth and basic HTTP admin credentials; \
                 these cannot be combined, using OAuth"
            );
        }

        policy
    }

    /// Whether requests are gated by the OAuth + allow-list policy.
    #[must_use]
    pub fn uses_oauth(&self) -> bool {
        self.oauth_configured && (!self.admin_users.is_empty() || !self.admin_roles.is_empty())
    }

    /// Evaluate a request against the active policy.
    pub fn authorize(
        &self,
        sessions: &SessionStore,
        states: &StateTokens,
        request: &AuthRequest<'_>,
    ) -> AuthDecision {
        if self.uses_oauth() {
            return self.authorize_oauth(sessions, states, request);
        }

        if let Some(basic) = &self.basic {
            let verified = request.authorization.is_some_and(|header| {
                verify_basic_header(header, &basic.username, &basic.password_digest)
            });
            return if verified {
                AuthDecision::Allow
            } else {
                AuthDecision::BasicChallenge {
                    realm: format!("{} domain-server", self.hostname),
                }
            };
        }

        // no admin gate configured
        AuthDecision::Allow
    }

    fn authorize_oauth(
        &self,
        sessions: &SessionStore,
        states: &StateTokens,
        request: &AuthRequest<'_>,
    ) -> AuthDecision {
        let profile = request
            .cookie
            .and_then(session_cookie_id)
            .and_then(|cookie_id| sessions.get(cookie_id));

        let Some(profile) = profile else {
            // not yet authenticated: browsers get the redirect flow,
            // XHR callers a plain 401
            return if request.is_xhr {
                AuthDecision::Unauthorized
            } else {
                AuthDecision::RedirectToProvider {
                    state: states.mint(),
                }
            };
        };

        if self.admin_users.contains(&profile.username) {
            return AuthDecision::Allow;
        }
        if profile
            .roles
            .iter()
            .any(|role| self.admin_roles.contains(role))
        {
            return AuthDecision::Allow;
        }

        AuthDecision::Unauthorized
    }
}
