//! Error taxonomy for the domain server.

use thiserror::Error;

/// Fatal configuration errors detected at startup.
///
/// These are the only errors that terminate the process; each class maps to
/// a distinct exit code so supervisors can tell them apart.
#[derive(Debug, Error)]
pub enum StartupError {
    /// HTTPS was requested but the certificate or key is missing.
    #[error("https requested but certificate/key pair is incomplete: {detail}")]
    MissingTlsCredentials {
        /// Which half of the pair is missing.
        detail: String,
    },

    /// An OAuth provider was configured without a client secret.
    #[error("oauth provider configured without a client secret")]
    MissingOAuthSecret,

    /// The settings document could not be read or parsed.
    #[error("settings document invalid: {0}")]
    InvalidSettings(#[from] serde_json::Error),
}

impl StartupError {
    /// Exit code reported to the supervisor.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::MissingTlsCredentials { .. } => 64,
            Self::MissingOAuthSecret => 65,
            Self::InvalidSettings(_) => 66,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_errors_have_distinct_exit_codes() {
        let tls = StartupError::MissingTlsCredentials {
            detail: "key".into(),
        };
        let oauth = StartupError::MissingOAuthSecret;
        assert_ne!(tls.exit_code(), oauth.exit_code());
        assert_ne!(tls.exit_code(), 0);
    }
}
