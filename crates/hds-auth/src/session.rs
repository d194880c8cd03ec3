//! In-memory web session store.
//!
//! Sessions live for one month and do not survive a process restart.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cookie carrying the session id.
pub const SESSION_COOKIE_NAME: &str = "HAVEN_WEB_SESSION";

/// Session lifetime.
pub const SESSION_LIFETIME_DAYS: i64 = 30;

/// The slice of an OAuth profile the authorization layer cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebProfile {
    /// Username as verified by the provider.
    pub username: String,
    /// Roles granted by the provider.
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone)]
struct WebSession {
    profile: WebProfile,
    expires_at: DateTime<Utc>,
}

/// Cookie-id keyed store of authenticated profiles.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, WebSession>>,
}

impl SessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly fetched profile under a new cookie id.
    pub fn insert(&self, profile: WebProfile) -> Uuid {
        self.insert_with_expiry(profile, Utc::now() + Duration::days(SESSION_LIFETIME_DAYS))
    }

    fn insert_with_expiry(&self, profile: WebProfile, expires_at: DateTime<Utc>) -> Uuid {
        let cookie_id = Uuid::new_v4();
        self.sessions
            .write()
            .insert(cookie_id, WebSession { profile, expires_at });
        cookie_id
    }

    /// The profile behind a cookie id, if the session is still live.
    #[must_use]
    pub fn get(&self, cookie_id: Uuid) -> Option<WebProfile> {
        let sessions = self.sessions.read();
        let session = sessions.get(&cookie_id)?;
        (session.expires_at > Utc::now()).then(|| session.profile.clone())
    }

    /// Drop expired sessions, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        let now = Utc::now();
        sessions.retain(|_, session| session.expires_at > now);
        before - sessions.len()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

/// Pull the session cookie id out of a `Cookie` request header.
#[must_use]
pub fn session_cookie_id(cookie_header: &str) -> Option<Uuid> {
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE_NAME)
            .then(|| value.trim().parse().ok())
            .flatten()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(username: &str) -> WebProfile {
        WebProfile {
            username: username.into(),
            roles: vec!["user".into()],
        }
    }

    #[test]
    fn inserted_session_is_retrievable() {
        let store = SessionStore::new();
        let cookie = store.insert(profile("alice"));
        assert_eq!(store.get(cookie).unwrap().username, "alice");
    }

    #[test]
    fn expired_session_is_not_returned_and_purges() {
        let store = SessionStore::new();
        let cookie = store.insert_with_expiry(profile("bob"), Utc::now() - Duration::minutes(1));

        assert!(store.get(cookie).is_none());
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn cookie_header_parsing_finds_the_session_cookie() {
        let id = Uuid::new_v4();
        let header = format!("theme=dark; {SESSION_COOKIE_NAME}={id}; lang=en");
        assert_eq!(session_cookie_id(&header), Some(id));
    }

    #[test]
    fn cookie_header_without_session_cookie_is_none() {
        assert!(session_cookie_id("theme=dark; lang=en").is_none());
        assert!(session_cookie_id(&format!("{SESSION_COOKIE_NAME}=not-a-uuid")).is_none());
    }
}
