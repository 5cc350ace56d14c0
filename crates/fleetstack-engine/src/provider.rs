//! Provider plugin capability interface

use crate::resource::PropertyMap;
use crate::urn::Urn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Resource provider plugin
///
/// The engine only ever talks to plugins through this trait; how a concrete
/// plugin is reached (subprocess, RPC, in-process) is the loader's concern.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Validate and apply provider-level configuration
    async fn configure(&self, _config: &PropertyMap) -> ProviderResult<()> {
        Ok(())
    }

    /// Normalize desired inputs and report validation failures
    async fn check(
        &self,
        _urn: &Urn,
        _olds: Option<&PropertyMap>,
        news: &PropertyMap,
    ) -> ProviderResult<CheckResult> {
        Ok(CheckResult::ok(news.clone()))
    }

    /// Compare prior and desired inputs
    async fn diff(
        &self,
        _urn: &Urn,
        _olds: &PropertyMap,
        _news: &PropertyMap,
    ) -> ProviderResult<DiffResult> {
        Ok(DiffResult::unknown())
    }

    async fn create(
        &self,
        urn: &Urn,
        inputs: &PropertyMap,
        timeout: Duration,
        preview: bool,
    ) -> ProviderResult<CreateResult>;

    async fn update(
        &self,
        urn: &Urn,
        id: &str,
        olds: &PropertyMap,
        news: &PropertyMap,
        timeout: Duration,
        preview: bool,
    ) -> ProviderResult<UpdateResult>;

    async fn delete(
        &self,
        urn: &Urn,
        id: &str,
        inputs: &PropertyMap,
        outputs: &PropertyMap,
        timeout: Duration,
    ) -> ProviderResult<()>;

    async fn read(&self, urn: &Urn, _id: &str) -> ProviderResult<ReadResult> {
        Err(ProviderError::permanent(format!(
            "read is not supported for {}",
            urn.resource_type()
        )))
    }
}

/// Locates and starts provider plugins
#[async_trait]
pub trait ProviderLoader: Send + Sync {
    async fn load(&self, identity: &ProviderIdentity) -> ProviderResult<Arc<dyn Provider>>;
}

/// The tuple that makes two provider registrations "the same" provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderIdentity {
    pub package: String,
    pub version: String,
    /// Empty when the plugin comes from the default source
    pub download_source: String,
    pub config_fingerprint: String,
}

impl ProviderIdentity {
    pub fn new(
        package: impl Into<String>,
        version: impl Into<String>,
        download_source: impl Into<String>,
        config: &PropertyMap,
    ) -> Self {
        Self {
            package: package.into(),
            version: version.into(),
            download_source: download_source.into(),
            config_fingerprint: fingerprint(config),
        }
    }
}

impl fmt::Display for ProviderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.package, self.version)?;
        if !self.download_source.is_empty() {
            write!(f, " ({})", self.download_source)?;
        }
        Ok(())
    }
}

/// Hex sha256 of the canonical JSON form of a property map
pub fn fingerprint(properties: &PropertyMap) -> String {
    let canonical = serde_json::to_vec(properties).unwrap_or_default();
    Sha256::digest(&canonical)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Worth retrying (throttling, flaky network)
    Transient,
    /// The operation failed; only the owning step is affected
    Permanent,
    /// The plugin itself died; the whole run is cancelled
    Crashed,
    /// The operation exceeded the step timeout; not retried
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Crashed,
            message: message.into(),
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::TimedOut,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }

    pub fn is_crash(&self) -> bool {
        self.kind == ProviderErrorKind::Crashed
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFailure {
    pub property: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    /// Normalized inputs, used for diffing and the provider operation
    pub inputs: PropertyMap,
    pub failures: Vec<CheckFailure>,
}

impl CheckResult {
    pub fn ok(inputs: PropertyMap) -> Self {
        Self {
            inputs,
            failures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffChanges {
    None,
    Some,
    /// Provider cannot tell; the engine compares inputs itself
    Unknown,
}

#[derive(Debug, Clone)]
pub struct DiffResult {
    pub changes: DiffChanges,
    /// Changed properties that cannot be updated in place
    pub replace_keys: Vec<String>,
    pub changed_keys: Vec<String>,
    pub delete_before_replace: bool,
}

impl DiffResult {
    pub fn none() -> Self {
        Self {
            changes: DiffChanges::None,
            replace_keys: Vec::new(),
            changed_keys: Vec::new(),
            delete_before_replace: false,
        }
    }

    pub fn unknown() -> Self {
        Self {
            changes: DiffChanges::Unknown,
            ..Self::none()
        }
    }

    pub fn update(changed_keys: Vec<String>) -> Self {
        Self {
            changes: DiffChanges::Some,
            changed_keys,
            ..Self::none()
        }
    }

    pub fn replace(replace_keys: Vec<String>) -> Self {
        Self {
            changes: DiffChanges::Some,
            changed_keys: replace_keys.clone(),
            replace_keys,
            ..Self::none()
        }
    }
}

/// Outcome status reported by a provider operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Ok,
    PartialFailure,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct CreateResult {
    pub id: String,
    pub outputs: PropertyMap,
    pub status: OperationStatus,
}

#[derive(Debug, Clone)]
pub struct UpdateResult {
    pub outputs: PropertyMap,
    pub status: OperationStatus,
}

#[derive(Debug, Clone)]
pub struct ReadResult {
    pub inputs: PropertyMap,
    pub outputs: PropertyMap,
}

/// Retry configuration for transient provider failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry following `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        self.initial_delay.mul_f64(factor)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}
