// agent/src/config.rs

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    // 🛡️ SLA Boundary: Network & Identity
    pub socket_path: PathBuf,
    pub expected_api_uid: u32,

    // 📂 Execution
    pub sandbox_root: PathBuf,
    pub tool_binary: PathBuf,
    pub stage_timeout: Option<Duration>,

    // ☁️ Cloud
    pub source_bucket: String,
    pub region: String,
    pub aws_binary: PathBuf,
    pub aws_timeout: Option<Duration>,
    pub session_name: String,

    // ⚙️ Worker pool
    pub worker_count: usize,
    pub queue_capacity: usize,
}

/// Two hours: long enough for slow providers (databases, CDNs) to finish.
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 7200;

/// Upper bound on a single `aws` call.
pub const DEFAULT_AWS_TIMEOUT_SECS: u64 = 300;

impl AgentConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // 🛡️ Zero-Trust Identity Parsing
        // A non-numeric UID refuses startup instead of silently disabling the
        // peer credential check.
        let expected_api_uid = parse_or("IAC_API_UID", get("IAC_API_UID"), 1001u32)?;

        let source_bucket = get("IAC_SOURCE_BUCKET").ok_or(ConfigError::Missing("IAC_SOURCE_BUCKET"))?;

        let worker_count = parse_or("IAC_WORKERS", get("IAC_WORKERS"), 4usize)?;
        if worker_count == 0 {
            return Err(ConfigError::Invalid { var: "IAC_WORKERS", reason: "must be at least 1".into() });
        }
        let queue_capacity = parse_or("IAC_QUEUE_CAPACITY", get("IAC_QUEUE_CAPACITY"), 64usize)?;
        if queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                var: "IAC_QUEUE_CAPACITY",
                reason: "must be at least 1".into(),
            });
        }

        // 0 disables the limit.
        let timeout_secs =
            parse_or("IAC_STAGE_TIMEOUT_SECS", get("IAC_STAGE_TIMEOUT_SECS"), DEFAULT_STAGE_TIMEOUT_SECS)?;
        let stage_timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));
        let aws_secs = parse_or("IAC_AWS_TIMEOUT_SECS", get("IAC_AWS_TIMEOUT_SECS"), DEFAULT_AWS_TIMEOUT_SECS)?;
        let aws_timeout = (aws_secs > 0).then(|| Duration::from_secs(aws_secs));

        Ok(Self {
            socket_path: get("IAC_SOCKET_PATH")
                .unwrap_or_else(|| "/var/run/iac-agent/agent.sock".to_string())
                .into(),
            expected_api_uid,
            sandbox_root: get("IAC_SANDBOX_ROOT")
                .unwrap_or_else(|| "/var/lib/iac-agent/sandboxes".to_string())
                .into(),
            tool_binary: get("IAC_TOOL_BINARY").unwrap_or_else(|| "terraform".to_string()).into(),
            stage_timeout,
            source_bucket,
            region: get("IAC_REGION")
                .or_else(|| get("AWS_REGION"))
                .unwrap_or_else(|| "us-east-1".to_string()),
            aws_binary: get("IAC_AWS_BINARY").unwrap_or_else(|| "aws".to_string()).into(),
            aws_timeout,
            session_name: get("IAC_SESSION_NAME").unwrap_or_else(|| "iac-agent-deployment".to_string()),
            worker_count,
            queue_capacity,
        })
    }
}

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid { var, reason: e.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AgentConfig, ConfigError> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AgentConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_bucket_is_set() {
        let config = load(&[("IAC_SOURCE_BUCKET", "iac-source")]).unwrap();
        assert_eq!(config.source_bucket, "iac-source");
        assert_eq!(config.expected_api_uid, 1001);
        assert_eq!(config.socket_path, PathBuf::from("/var/run/iac-agent/agent.sock"));
        assert_eq!(config.stage_timeout, Some(Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS)));
        assert_eq!(config.worker_count, 4);
    }

    #[test]
    fn bucket_is_required() {
        assert_eq!(load(&[]).unwrap_err(), ConfigError::Missing("IAC_SOURCE_BUCKET"));
        assert_eq!(
            load(&[("IAC_SOURCE_BUCKET", "  ")]).unwrap_err(),
            ConfigError::Missing("IAC_SOURCE_BUCKET")
        );
    }

    #[test]
    fn non_numeric_uid_refuses_startup() {
        let err = load(&[("IAC_SOURCE_BUCKET", "b"), ("IAC_API_UID", "www-data")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "IAC_API_UID", .. }));
    }

    #[test]
    fn zero_timeout_disables_the_limit() {
        let config = load(&[("IAC_SOURCE_BUCKET", "b"), ("IAC_STAGE_TIMEOUT_SECS", "0")]).unwrap();
        assert_eq!(config.stage_timeout, None);
        assert_eq!(config.aws_timeout, Some(Duration::from_secs(DEFAULT_AWS_TIMEOUT_SECS)));

        let config = load(&[("IAC_SOURCE_BUCKET", "b"), ("IAC_AWS_TIMEOUT_SECS", "0")]).unwrap();
        assert_eq!(config.aws_timeout, None);
    }

    #[test]
    fn empty_worker_pool_is_rejected() {
        let err = load(&[("IAC_SOURCE_BUCKET", "b"), ("IAC_WORKERS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "IAC_WORKERS", .. }));
    }

    #[test]
    fn region_falls_back_to_aws_region() {
        let config = load(&[("IAC_SOURCE_BUCKET", "b"), ("AWS_REGION", "eu-west-1")]).unwrap();
        assert_eq!(config.region, "eu-west-1");
    }
}
