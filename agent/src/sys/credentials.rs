// agent/src/sys/credentials.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::error::CredentialError;
use crate::sys::aws_cli::{diagnostics, reject_flag_like, AwsCli};
use crate::sys::secrets::AssumedCredentials;
use crate::sys::traits::CredentialBroker;

/// STS session lifetime; long enough for init + plan + apply of a typical stack.
pub const SESSION_DURATION_SECS: u32 = 3600;

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResponse {
    credentials: StsCredentials,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsCredentials {
    access_key_id: SecretString,
    secret_access_key: SecretString,
    session_token: SecretString,
    expiration: Option<String>,
}

pub struct AwsStsBroker {
    cli: AwsCli,
    session_name: String,
}

impl AwsStsBroker {
    pub fn new(cli: AwsCli, session_name: impl Into<String>) -> Self {
        Self { cli, session_name: session_name.into() }
    }

    fn check_input(role_arn: &str, external_id: &str) -> Result<(), CredentialError> {
        reject_flag_like("role_arn", role_arn).map_err(CredentialError::InvalidInput)?;
        reject_flag_like("external_id", external_id).map_err(CredentialError::InvalidInput)?;
        if !role_arn.starts_with("arn:") {
            return Err(CredentialError::InvalidInput(format!(
                "role ARN must start with 'arn:' (got '{role_arn}')"
            )));
        }
        if external_id.trim().is_empty() {
            return Err(CredentialError::InvalidInput("external ID is empty".into()));
        }
        Ok(())
    }

    fn parse(stdout: &[u8]) -> Result<AssumedCredentials, CredentialError> {
        let response: AssumeRoleResponse = serde_json::from_slice(stdout)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        let creds = response.credentials;
        let expires_at = creds
            .expiration
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc));

        Ok(AssumedCredentials::new(
            creds.access_key_id,
            creds.secret_access_key,
            creds.session_token,
        )
        .with_expiry(expires_at))
    }
}

#[async_trait]
impl CredentialBroker for AwsStsBroker {
    async fn assume(
        &self,
        role_arn: &str,
        external_id: &str,
    ) -> Result<AssumedCredentials, CredentialError> {
        Self::check_input(role_arn, external_id)?;

        let duration = SESSION_DURATION_SECS.to_string();
        let output = self
            .cli
            .run([
                "sts",
                "assume-role",
                "--role-arn",
                role_arn,
                "--role-session-name",
                self.session_name.as_str(),
                "--external-id",
                external_id,
                "--duration-seconds",
                duration.as_str(),
            ])
            .await
            .map_err(|e| CredentialError::Unavailable(format!("aws call failed: {e}")))?;

        if !output.status.success() {
            let detail = diagnostics(&output);
            tracing::warn!(role_arn = %role_arn, "Role assumption failed");
            return Err(if detail.contains("AccessDenied") || detail.contains("not authorized") {
                CredentialError::Rejected(detail)
            } else {
                CredentialError::Unavailable(detail)
            });
        }

        // The raw response holds the secret key in plaintext; scrub it once parsed.
        let stdout = Zeroizing::new(output.stdout);
        let credentials = Self::parse(&stdout)?;
        tracing::info!(
            role_arn = %role_arn,
            expires_at = ?credentials.expires_at(),
            "Assumed cross-account role"
        );
        Ok(credentials)
    }
}
