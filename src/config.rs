//! `SyncConfig` and its sub-configuration, per spec §3.

use serde::{Deserialize, Serialize};

use crate::table_filter::TableFilterConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicyKind {
    LocalWins,
    RemoteWins,
    LatestWins,
    Merge,
    Manual,
}

/// How the `credential` field should be resolved at `initialize()` time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Credential {
    Literal(String),
    /// `CREDENTIAL_ENV = "X"` means read from env `X` at startup.
    Env { credential_env: String },
}

impl Credential {
    pub fn resolve(&self) -> Result<String, crate::change::SyncError> {
        match self {
            Credential::Literal(s) => {
                if s.trim().is_empty() {
                    return Err(crate::change::SyncError::Auth {
                        requires_refresh: false,
                        message: "empty credential".to_string(),
                    });
                }
                Ok(s.clone())
            }
            Credential::Env { credential_env } => std::env::var(credential_env).map_err(|_| {
                crate::change::SyncError::Auth {
                    requires_refresh: false,
                    message: format!("environment variable {credential_env} is not set"),
                }
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub credential: Credential,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_conflict_policy")]
    pub conflict_policy: ConflictPolicyKind,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub compression_enabled: bool,
    #[serde(default = "default_compression_threshold_bytes")]
    pub compression_threshold_bytes: usize,
    #[serde(default)]
    pub table_filter: TableFilterConfig,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_sync_interval_ms() -> u64 {
    30_000
}
fn default_conflict_policy() -> ConflictPolicyKind {
    ConflictPolicyKind::LatestWins
}
fn default_batch_size() -> usize {
    1_000
}
fn default_concurrency() -> usize {
    3
}
fn default_compression_threshold_bytes() -> usize {
    1_024
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_retry_delay_ms() -> u64 {
    200
}
fn default_max_retry_delay_ms() -> u64 {
    10_000
}
fn default_backoff_factor() -> f64 {
    2.0
}

impl SyncConfig {
    pub fn retry_options(&self) -> crate::batch::RetryOptions {
        crate::batch::RetryOptions {
            max_attempts: self.max_retries,
            initial_delay: std::time::Duration::from_millis(self.initial_retry_delay_ms),
            max_delay: std::time::Duration::from_millis(self.max_retry_delay_ms),
            factor: self.backoff_factor,
        }
    }

    pub fn batch_options(&self) -> crate::batch::BatchOptions {
        crate::batch::BatchOptions {
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            delay_between_batches: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_credential_resolves_from_environment() {
        unsafe {
            std::env::set_var("SYNC_TEST_CREDENTIAL", "secret-token");
        }
        let cred = Credential::Env {
            credential_env: "SYNC_TEST_CREDENTIAL".to_string(),
        };
        assert_eq!(cred.resolve().unwrap(), "secret-token");
    }

    #[test]
    fn missing_env_credential_is_auth_error() {
        let cred = Credential::Env {
            credential_env: "SYNC_TEST_CREDENTIAL_MISSING".to_string(),
        };
        let err = cred.resolve().unwrap_err();
        assert!(matches!(err, crate::change::SyncError::Auth { .. }));
    }
}
