// agent/src/sys/secrets.rs

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use tokio::process::Command;

const REDACTED: &str = "[REDACTED]";

/// AssumedCredentials is an ephemeral, memory-safe wrapper for the short-lived
/// access key, secret key and session token returned by the broker.
///
/// 1. It cannot be accidentally logged: `Debug` prints `[REDACTED]`.
/// 2. When it goes out of scope every field is zeroized by `secrecy`.
/// 3. The only way out is into a child process environment (`inject`).
pub struct AssumedCredentials {
    access_key_id: SecretString,
    secret_access_key: SecretString,
    session_token: SecretString,
    expires_at: Option<DateTime<Utc>>,
}

impl AssumedCredentials {
    pub fn new(
        access_key_id: SecretString,
        secret_access_key: SecretString,
        session_token: SecretString,
    ) -> Self {
        Self { access_key_id, secret_access_key, session_token, expires_at: None }
    }

    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Hands the credentials to a single child process.
    pub fn inject(&self, command: &mut Command) {
        command
            .env("AWS_ACCESS_KEY_ID", self.access_key_id.expose_secret())
            .env("AWS_SECRET_ACCESS_KEY", self.secret_access_key.expose_secret())
            .env("AWS_SESSION_TOKEN", self.session_token.expose_secret());
    }

    /// Replaces any verbatim occurrence of a credential value in `text`.
    pub fn redact(&self, text: &str) -> String {
        let mut scrubbed = text.to_string();
        for secret in [&self.access_key_id, &self.secret_access_key, &self.session_token] {
            let value = secret.expose_secret();
            if !value.is_empty() && scrubbed.contains(value.as_str()) {
                scrubbed = scrubbed.replace(value.as_str(), REDACTED);
            }
        }
        scrubbed
    }
}

impl fmt::Debug for AssumedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssumedCredentials")
            .field("access_key_id", &REDACTED)
            .field("secret_access_key", &REDACTED)
            .field("session_token", &REDACTED)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
