//! Steps: atomic transitions applied to a single resource

use crate::provider::{OperationStatus, Provider, ProviderError, ProviderResult, RetryConfig};
use crate::resource::ResourceRecord;
use crate::urn::Urn;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Type of transition to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// No changes needed; carry the prior record forward
    Same,
    /// Create a new resource
    Create,
    /// Update an existing resource in place
    Update,
    /// Delete a resource
    Delete,
    /// Create the new resource and delete the old one
    Replace,
    /// Read an existing, externally managed resource
    Read,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Same => write!(f, "same"),
            StepKind::Create => write!(f, "create"),
            StepKind::Update => write!(f, "update"),
            StepKind::Delete => write!(f, "delete"),
            StepKind::Replace => write!(f, "replace"),
            StepKind::Read => write!(f, "read"),
        }
    }
}

/// Node identity in the step graph
///
/// Deletes get their own key because a replaced record awaiting deletion
/// shares its URN with the live record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepKey {
    Resource(Urn),
    Delete { urn: Urn, id: Option<String> },
}

impl StepKey {
    pub fn urn(&self) -> &Urn {
        match self {
            StepKey::Resource(urn) => urn,
            StepKey::Delete { urn, .. } => urn,
        }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKey::Resource(urn) => write!(f, "{urn}"),
            StepKey::Delete { urn, id: Some(id) } => write!(f, "delete {urn} ({id})"),
            StepKey::Delete { urn, id: None } => write!(f, "delete {urn}"),
        }
    }
}

/// A planned transition for one resource
#[derive(Clone)]
pub struct Step {
    pub kind: StepKind,
    pub urn: Urn,
    /// Prior record, if the resource already exists
    pub before: Option<ResourceRecord>,
    /// Desired record; ID and outputs are filled in when the step runs
    pub after: Option<ResourceRecord>,
    /// Plugin performing the operation, absent for components and provider records
    pub provider: Option<Arc<dyn Provider>>,
    /// Plugin that owns the old resource when a replace moves it to another provider
    pub old_provider: Option<Arc<dyn Provider>>,
    pub delete_before_replace: bool,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("kind", &self.kind)
            .field("urn", &self.urn)
            .field("before", &self.before)
            .field("after", &self.after)
            .field("has_provider", &self.provider.is_some())
            .field("has_old_provider", &self.old_provider.is_some())
            .field("delete_before_replace", &self.delete_before_replace)
            .finish()
    }
}

impl Step {
    pub fn new(kind: StepKind, urn: Urn) -> Self {
        Self {
            kind,
            urn,
            before: None,
            after: None,
            provider: None,
            old_provider: None,
            delete_before_replace: false,
        }
    }

    pub fn same(before: ResourceRecord, after: ResourceRecord) -> Self {
        Self::new(StepKind::Same, after.urn.clone())
            .with_before(before)
            .with_after(after)
    }

    pub fn delete(before: ResourceRecord, provider: Option<Arc<dyn Provider>>) -> Self {
        let mut step = Self::new(StepKind::Delete, before.urn.clone()).with_before(before);
        step.provider = provider;
        step
    }

    pub fn with_before(mut self, before: ResourceRecord) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: ResourceRecord) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_provider(mut self, provider: Option<Arc<dyn Provider>>) -> Self {
        self.provider = provider;
        self
    }

    pub fn key(&self) -> StepKey {
        match self.kind {
            StepKind::Delete => StepKey::Delete {
                urn: self.urn.clone(),
                id: self.before.as_ref().and_then(|b| b.id.clone()),
            },
            _ => StepKey::Resource(self.urn.clone()),
        }
    }
}

/// Terminal state of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed(String),
    Skipped(String),
}

impl StepStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, StepStatus::Completed)
    }
}

/// What happened to a step, as journaled by the snapshot manager
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub kind: StepKind,
    pub urn: Urn,
    pub status: StepStatus,
    pub before: Option<ResourceRecord>,
    /// Record the resource ends up with; `None` when it no longer exists
    pub after: Option<ResourceRecord>,
    /// Old record kept alongside `after`, marked pending deletion
    pub retained: Option<ResourceRecord>,
    pub operation_status: OperationStatus,
}

impl StepOutcome {
    pub fn completed(
        kind: StepKind,
        urn: Urn,
        applied: Applied,
        before: Option<ResourceRecord>,
    ) -> Self {
        Self {
            kind,
            urn,
            status: StepStatus::Completed,
            before,
            after: applied.after,
            retained: applied.retained,
            operation_status: applied.status,
        }
    }

    /// Failed or skipped step: the resource keeps whatever it had before
    pub fn unchanged(
        kind: StepKind,
        urn: Urn,
        status: StepStatus,
        before: Option<ResourceRecord>,
    ) -> Self {
        Self {
            kind,
            urn,
            status,
            after: before.clone(),
            before,
            retained: None,
            operation_status: OperationStatus::Unknown,
        }
    }
}

/// Records produced by a step that ran
#[derive(Debug, Clone, Default)]
pub struct Applied {
    pub after: Option<ResourceRecord>,
    pub retained: Option<ResourceRecord>,
    pub status: OperationStatus,
}

impl Applied {
    fn record(after: ResourceRecord, status: OperationStatus) -> Self {
        Self {
            after: Some(after),
            retained: None,
            status,
        }
    }

    fn gone() -> Self {
        Self::default()
    }
}

/// A step that ran and failed
///
/// `partial` carries records that changed before the failure, e.g. the new
/// half of a replacement whose old half could not be deleted.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub error: ProviderError,
    pub partial: Option<Applied>,
}

impl From<ProviderError> for StepFailure {
    fn from(error: ProviderError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

/// Per-call settings for provider operations
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub retry: RetryConfig,
    pub preview: bool,
}

impl CallPolicy {
    /// Run a provider operation under the timeout, retrying transient failures
    async fn call<T, F, Fut>(&self, operation: &str, urn: &Urn, mut op: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        %urn,
                        operation,
                        attempt,
                        ?delay,
                        error = %e,
                        "transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(ProviderError::timed_out(format!(
                        "{operation} timed out after {:?}",
                        self.timeout
                    )));
                }
            }
        }
    }
}

fn require_provider(step: &Step) -> ProviderResult<&Arc<dyn Provider>> {
    step.provider
        .as_ref()
        .ok_or_else(|| ProviderError::permanent(format!("no provider bound to {}", step.urn)))
}

fn require_after(step: &Step) -> ProviderResult<ResourceRecord> {
    step.after.clone().ok_or_else(|| {
        ProviderError::permanent(format!(
            "{} step for {} has no desired state",
            step.kind, step.urn
        ))
    })
}

fn require_before(step: &Step) -> ProviderResult<&ResourceRecord> {
    step.before.as_ref().ok_or_else(|| {
        ProviderError::permanent(format!(
            "{} step for {} has no prior state",
            step.kind, step.urn
        ))
    })
}

impl Step {
    /// Execute the step against its provider
    pub async fn apply(&self, policy: &CallPolicy) -> Result<Applied, StepFailure> {
        match self.kind {
            StepKind::Same => Ok(Applied::record(require_after(self)?, OperationStatus::Ok)),
            StepKind::Create => Ok(self.create(policy).await?),
            StepKind::Update => Ok(self.update(policy).await?),
            StepKind::Delete => {
                self.delete_before(policy).await?;
                Ok(Applied::gone())
            }
            StepKind::Replace => self.replace(policy).await,
            StepKind::Read => Ok(self.read(policy).await?),
        }
    }

    async fn create(&self, policy: &CallPolicy) -> ProviderResult<Applied> {
        let mut after = require_after(self)?;
        if !after.custom {
            return Ok(Applied::record(after, OperationStatus::Ok));
        }
        let provider = require_provider(self)?;
        let result = policy
            .call("create", &self.urn, || {
                provider.create(&self.urn, &after.inputs, policy.timeout, policy.preview)
            })
            .await?;
        let now = Utc::now();
        after.id = Some(result.id);
        after.outputs = result.outputs;
        after.created_at = now;
        after.updated_at = now;
        Ok(Applied::record(after, result.status))
    }

    async fn update(&self, policy: &CallPolicy) -> ProviderResult<Applied> {
        let before = require_before(self)?;
        let mut after = require_after(self)?;
        after.id = before.id.clone();
        after.created_at = before.created_at;
        after.touch();
        if !after.custom {
            after.outputs = before.outputs.clone();
            return Ok(Applied::record(after, OperationStatus::Ok));
        }
        let provider = require_provider(self)?;
        let id = before.id.clone().unwrap_or_default();
        let result = policy
            .call("update", &self.urn, || {
                provider.update(
                    &self.urn,
                    &id,
                    &before.inputs,
                    &after.inputs,
                    policy.timeout,
                    policy.preview,
                )
            })
            .await?;
        after.outputs = result.outputs;
        Ok(Applied::record(after, result.status))
    }

    async fn delete_before(&self, policy: &CallPolicy) -> ProviderResult<()> {
        let before = require_before(self)?;
        if before.protect {
            return Err(ProviderError::permanent(format!(
                "{} is protected and cannot be deleted",
                before.urn
            )));
        }
        if !before.is_managed() || policy.preview {
            return Ok(());
        }
        let provider = match &self.old_provider {
            Some(provider) => provider,
            None => require_provider(self)?,
        };
        let id = before.id.clone().unwrap_or_default();
        policy
            .call("delete", &self.urn, || {
                provider.delete(&self.urn, &id, &before.inputs, &before.outputs, policy.timeout)
            })
            .await
    }

    async fn replace(&self, policy: &CallPolicy) -> Result<Applied, StepFailure> {
        let before = require_before(self)?;
        if self.delete_before_replace {
            self.delete_before(policy).await?;
            // The old resource is gone; a failed create must not bring its record back
            return self.create(policy).await.map_err(|error| StepFailure {
                error,
                partial: Some(Applied::gone()),
            });
        }

        let created = self.create(policy).await?;
        match self.delete_before(policy).await {
            Ok(()) => Ok(created),
            Err(error) => {
                let mut retained = before.clone();
                retained.pending_delete = true;
                Err(StepFailure {
                    error,
                    partial: Some(Applied {
                        retained: Some(retained),
                        ..created
                    }),
                })
            }
        }
    }

    async fn read(&self, policy: &CallPolicy) -> ProviderResult<Applied> {
        let mut after = require_after(self)?;
        let provider = require_provider(self)?;
        let id = after.id.clone().unwrap_or_default();
        let result = policy
            .call("read", &self.urn, || provider.read(&self.urn, &id))
            .await?;
        after.inputs = result.inputs;
        after.outputs = result.outputs;
        after.external = true;
        after.touch();
        Ok(Applied::record(after, OperationStatus::Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CreateResult, UpdateResult};
    use crate::resource::PropertyMap;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Provider whose creates fail transiently a configured number of times
    #[derive(Default)]
    struct StubProvider {
        transient_creates: Mutex<u32>,
        fail_create: bool,
        fail_delete: bool,
        create_delay: Duration,
        calls: Mutex<Vec<&'static str>>,
    }

    impl StubProvider {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        async fn create(
            &self,
            urn: &Urn,
            inputs: &PropertyMap,
            _timeout: Duration,
            _preview: bool,
        ) -> ProviderResult<CreateResult> {
            self.calls.lock().unwrap().push("create");
            {
                let mut remaining = self.transient_creates.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ProviderError::transient("throttled"));
                }
            }
            if self.fail_create {
                return Err(ProviderError::permanent("quota exceeded"));
            }
            tokio::time::sleep(self.create_delay).await;
            Ok(CreateResult {
                id: format!("{}-new", urn.name()),
                outputs: inputs.clone(),
                status: OperationStatus::Ok,
            })
        }

        async fn update(
            &self,
            _urn: &Urn,
            _id: &str,
            _olds: &PropertyMap,
            news: &PropertyMap,
            _timeout: Duration,
            _preview: bool,
        ) -> ProviderResult<UpdateResult> {
            self.calls.lock().unwrap().push("update");
            Ok(UpdateResult {
                outputs: news.clone(),
                status: OperationStatus::Ok,
            })
        }

        async fn delete(
            &self,
            _urn: &Urn,
            _id: &str,
            _inputs: &PropertyMap,
            _outputs: &PropertyMap,
            _timeout: Duration,
        ) -> ProviderResult<()> {
            self.calls.lock().unwrap().push("delete");
            if self.fail_delete {
                return Err(ProviderError::permanent("resource is in use"));
            }
            Ok(())
        }
    }

    fn policy() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(5),
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                backoff_multiplier: 2.0,
            },
            preview: false,
        }
    }

    fn record(name: &str) -> ResourceRecord {
        ResourceRecord::new(
            Urn::new("dev", "web", None, "pkgA:m:typA", name),
            "pkgA:m:typA",
            true,
        )
    }

    fn replace_step(provider: &Arc<StubProvider>, delete_before_replace: bool) -> Step {
        let before = record("db").with_id("db-old");
        let after = record("db");
        let mut step = Step::new(StepKind::Replace, before.urn.clone())
            .with_before(before)
            .with_after(after)
            .with_provider(Some(provider.clone() as Arc<dyn Provider>));
        step.delete_before_replace = delete_before_replace;
        step
    }

    #[tokio::test]
    async fn test_replace_keeps_old_record_when_delete_fails() {
        let provider = Arc::new(StubProvider {
            fail_delete: true,
            ..StubProvider::default()
        });

        let failure = replace_step(&provider, false)
            .apply(&policy())
            .await
            .unwrap_err();

        assert_eq!(provider.calls(), vec!["create", "delete"]);
        let partial = failure.partial.unwrap();
        assert_eq!(partial.after.unwrap().id.as_deref(), Some("db-new"));
        let retained = partial.retained.unwrap();
        assert!(retained.pending_delete);
        assert_eq!(retained.id.as_deref(), Some("db-old"));
    }

    #[tokio::test]
    async fn test_delete_before_replace_order() {
        let provider = Arc::new(StubProvider::default());
        let applied = replace_step(&provider, true)
            .apply(&policy())
            .await
            .unwrap();

        assert_eq!(provider.calls(), vec!["delete", "create"]);
        assert!(applied.retained.is_none());
    }

    #[tokio::test]
    async fn test_delete_before_replace_failed_create_drops_old_record() {
        let provider = Arc::new(StubProvider {
            fail_create: true,
            ..StubProvider::default()
        });

        let failure = replace_step(&provider, true)
            .apply(&policy())
            .await
            .unwrap_err();

        assert_eq!(provider.calls(), vec!["delete", "create"]);
        let partial = failure.partial.unwrap();
        assert!(partial.after.is_none());
        assert!(partial.retained.is_none());
    }

    #[tokio::test]
    async fn test_protected_delete_never_reaches_provider() {
        let provider = Arc::new(StubProvider::default());
        let mut before = record("vault").with_id("v-1");
        before.protect = true;
        let step = Step::delete(before, Some(provider.clone() as Arc<dyn Provider>));

        let failure = step.apply(&policy()).await.unwrap_err();
        assert!(failure.error.message.contains("protected"));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_up_to_the_limit() {
        let provider = Arc::new(StubProvider {
            transient_creates: Mutex::new(2),
            ..StubProvider::default()
        });
        let step = Step::new(StepKind::Create, record("a").urn.clone())
            .with_after(record("a"))
            .with_provider(Some(provider.clone() as Arc<dyn Provider>));
        step.apply(&policy()).await.unwrap();
        assert_eq!(provider.calls().len(), 3);

        let provider = Arc::new(StubProvider {
            transient_creates: Mutex::new(3),
            ..StubProvider::default()
        });
        let step = step.with_provider(Some(provider.clone() as Arc<dyn Provider>));
        let failure = step.apply(&policy()).await.unwrap_err();
        assert!(failure.error.is_transient());
        assert_eq!(provider.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_slow_operation_times_out() {
        let provider = Arc::new(StubProvider {
            create_delay: Duration::from_millis(200),
            ..StubProvider::default()
        });
        let step = Step::new(StepKind::Create, record("slow").urn.clone())
            .with_after(record("slow"))
            .with_provider(Some(provider as Arc<dyn Provider>));
        let policy = CallPolicy {
            timeout: Duration::from_millis(10),
            ..policy()
        };

        let failure = step.apply(&policy).await.unwrap_err();
        assert_eq!(failure.error.kind, crate::provider::ProviderErrorKind::TimedOut);
        assert!(failure.error.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_preview_delete_skips_provider() {
        let provider = Arc::new(StubProvider::default());
        let step = Step::delete(
            record("a").with_id("a-1"),
            Some(provider.clone() as Arc<dyn Provider>),
        );
        let policy = CallPolicy {
            preview: true,
            ..policy()
        };

        let applied = step.apply(&policy).await.unwrap();
        assert!(applied.after.is_none());
        assert!(provider.calls().is_empty());
    }
}
