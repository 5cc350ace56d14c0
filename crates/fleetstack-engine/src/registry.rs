//! Provider registry
//!
//! Deduplicates provider registrations for one deployment run. The first
//! request for an identity inserts a shared placeholder future into the
//! identity map and spawns the plugin load; every other request for the same
//! identity awaits that placeholder. Lookup and insertion happen under one
//! lock acquisition, so two placeholders for the same identity cannot exist.

use crate::error::{EngineError, Result};
use crate::executor::ExecutorHandle;
use crate::provider::{Provider, ProviderIdentity, ProviderLoader};
use crate::resource::{PropertyMap, ResourceRecord};
use crate::snapshot::SnapshotManager;
use crate::step::{Applied, StepKey, StepKind, StepOutcome};
use crate::urn::{PROVIDER_TYPE_PREFIX, ProviderReference, Urn};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A provider registration request
#[derive(Debug, Clone)]
pub struct ProviderRegistration {
    pub package: String,
    pub version: String,
    pub download_source: String,
    pub config: PropertyMap,
}

impl ProviderRegistration {
    pub fn new(package: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            version: version.into(),
            download_source: String::new(),
            config: PropertyMap::new(),
        }
    }

    pub fn with_download_source(mut self, download_source: impl Into<String>) -> Self {
        self.download_source = download_source.into();
        self
    }

    pub fn with_config(mut self, config: PropertyMap) -> Self {
        self.config = config;
        self
    }

    pub fn identity(&self) -> ProviderIdentity {
        ProviderIdentity::new(
            &self.package,
            &self.version,
            &self.download_source,
            &self.config,
        )
    }

    pub fn resource_type(&self) -> String {
        format!("{PROVIDER_TYPE_PREFIX}{}", self.package)
    }

    /// `default_<version>` for plain dotted versions with no source or config
    ///
    /// Anything else gets `-<fingerprint>` of the full inputs appended, since
    /// mapping `-` and `+` to `_` alone would merge distinct versions.
    pub fn resource_name(&self) -> String {
        let version = if self.version.is_empty() {
            "latest".to_string()
        } else {
            self.version.replace(['.', '-', '+'], "_")
        };
        let dotted = self.version.chars().all(|c| c.is_ascii_digit() || c == '.');
        if dotted && self.download_source.is_empty() && self.config.is_empty() {
            return format!("default_{version}");
        }
        let fingerprint = crate::provider::fingerprint(&self.inputs());
        format!("default_{version}-{}", &fingerprint[..8])
    }

    pub fn urn(&self, stack: &str, project: &str) -> Urn {
        Urn::new(
            stack,
            project,
            None,
            &self.resource_type(),
            &self.resource_name(),
        )
    }

    /// Inputs stored on the provider record; enough to reload the plugin later
    pub fn inputs(&self) -> PropertyMap {
        let mut inputs = PropertyMap::new();
        inputs.insert("package".into(), json!(self.package));
        inputs.insert("version".into(), json!(self.version));
        inputs.insert("downloadSource".into(), json!(self.download_source));
        inputs.insert("config".into(), json!(self.config));
        inputs
    }

    /// Rebuild a registration from a persisted provider record
    pub fn from_record(record: &ResourceRecord) -> Result<Self> {
        let text = |key: &str| {
            record
                .inputs
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let package = text("package").ok_or_else(|| {
            EngineError::SnapshotConsistency(format!(
                "provider record {} has no package input",
                record.urn
            ))
        })?;
        let config = match record.inputs.get("config") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => PropertyMap::new(),
        };
        Ok(Self {
            package,
            version: text("version").unwrap_or_default(),
            download_source: text("downloadSource").unwrap_or_default(),
            config,
        })
    }
}

/// Load failure shared by every waiter on an identity
#[derive(Debug, Clone)]
enum LoadFailure {
    PluginLoad(String),
    InvalidConfig(String),
}

type LoadOutcome = std::result::Result<ProviderReference, LoadFailure>;

/// A loaded provider and the record it contributes once a resource uses it
struct Binding {
    provider: Arc<dyn Provider>,
    kind: StepKind,
    record: ResourceRecord,
    prior: Option<ResourceRecord>,
}
type PendingLoad = Shared<BoxFuture<'static, LoadOutcome>>;

/// Deduplicating provider registry, scoped to one deployment run
#[derive(Clone)]
pub struct ProviderRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    stack: String,
    project: String,
    loader: Arc<dyn ProviderLoader>,
    snapshots: SnapshotManager,
    executor: ExecutorHandle,
    pending: Mutex<HashMap<ProviderIdentity, PendingLoad>>,
    bound: Mutex<HashMap<ProviderReference, Binding>>,
    /// Providers whose record is in the journal
    journaled: tokio::sync::Mutex<HashSet<ProviderReference>>,
    loads: AtomicUsize,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProviderRegistry {
    pub fn new(
        stack: impl Into<String>,
        project: impl Into<String>,
        loader: Arc<dyn ProviderLoader>,
        snapshots: SnapshotManager,
        executor: ExecutorHandle,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                stack: stack.into(),
                project: project.into(),
                loader,
                snapshots,
                executor,
                pending: Mutex::new(HashMap::new()),
                bound: Mutex::new(HashMap::new()),
                journaled: tokio::sync::Mutex::new(HashSet::new()),
                loads: AtomicUsize::new(0),
            }),
        }
    }

    /// Register a provider, loading its plugin at most once per identity
    pub async fn register(&self, registration: ProviderRegistration) -> Result<ProviderReference> {
        let identity = registration.identity();
        let pending = {
            let mut map = locked(&self.inner.pending);
            match map.get(&identity) {
                Some(existing) => {
                    tracing::debug!(provider = %identity, "joining pending provider registration");
                    existing.clone()
                }
                None => {
                    let load = self.spawn_load(registration);
                    map.insert(identity.clone(), load.clone());
                    load
                }
            }
        };

        match pending.clone().await {
            Ok(reference) => Ok(reference),
            Err(failure) => {
                self.evict(&identity, &pending);
                Err(match failure {
                    LoadFailure::PluginLoad(message) => EngineError::PluginLoad {
                        package: identity.package,
                        version: identity.version,
                        message,
                    },
                    LoadFailure::InvalidConfig(message) => EngineError::InvalidConfig {
                        package: identity.package,
                        version: identity.version,
                        message,
                    },
                })
            }
        }
    }

    /// Register the default provider for a package
    pub async fn default_provider(
        &self,
        package: &str,
        version: Option<&str>,
    ) -> Result<ProviderReference> {
        self.register(ProviderRegistration::new(
            package,
            version.unwrap_or_default(),
        ))
        .await
    }

    /// Plugin loaded for a reference registered in this run
    pub fn resolve(&self, reference: &ProviderReference) -> Result<Arc<dyn Provider>> {
        locked(&self.inner.bound)
            .get(reference)
            .map(|binding| Arc::clone(&binding.provider))
            .ok_or_else(|| EngineError::InvalidProviderReference(reference.to_string()))
    }

    /// Resolve a provider for a resource about to use it
    ///
    /// The first bind journals the provider record, so providers land in the
    /// snapshot in the order resources first use them and unused ones not at all.
    pub async fn bind(&self, reference: &ProviderReference) -> Result<Arc<dyn Provider>> {
        let provider = self.resolve(reference)?;
        let mut journaled = self.inner.journaled.lock().await;
        if journaled.contains(reference) {
            return Ok(provider);
        }
        let outcome = locked(&self.inner.bound).get(reference).map(|binding| {
            StepOutcome::completed(
                binding.kind,
                reference.urn().clone(),
                Applied {
                    after: Some(binding.record.clone()),
                    ..Applied::default()
                },
                binding.prior.clone(),
            )
        });
        if let Some(outcome) = outcome {
            tracing::debug!(%reference, kind = %outcome.kind, "provider bound");
            self.inner.snapshots.record(outcome).await;
            self.inner
                .executor
                .mark_completed(StepKey::Resource(reference.urn().clone()));
            journaled.insert(reference.clone());
        }
        Ok(provider)
    }

    /// Plugin for a prior record, reloading its provider from the prior snapshot if needed
    pub async fn provider_for(&self, reference: &ProviderReference) -> Result<Arc<dyn Provider>> {
        if let Ok(provider) = self.resolve(reference) {
            return Ok(provider);
        }
        let record = self
            .inner
            .snapshots
            .prior()
            .find(reference.urn())
            .ok_or_else(|| EngineError::InvalidProviderReference(reference.to_string()))?;
        let registration = ProviderRegistration::from_record(record)?;
        let reloaded = self.register(registration).await?;
        if &reloaded != reference {
            return Err(EngineError::InvalidProviderReference(format!(
                "{reference} resolved to {reloaded} on reload"
            )));
        }
        self.resolve(&reloaded)
    }

    /// URNs of providers a resource bound to in this run
    pub async fn bound_urns(&self) -> HashSet<Urn> {
        self.inner
            .journaled
            .lock()
            .await
            .iter()
            .map(|r| r.urn().clone())
            .collect()
    }

    /// Number of plugin loads performed
    pub fn plugin_loads(&self) -> usize {
        self.inner.loads.load(Ordering::SeqCst)
    }

    fn spawn_load(&self, registration: ProviderRegistration) -> PendingLoad {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.load(registration).await });
        async move {
            task.await.unwrap_or_else(|e| {
                Err(LoadFailure::PluginLoad(format!(
                    "provider load task failed: {e}"
                )))
            })
        }
        .boxed()
        .shared()
    }

    /// Drop a failed placeholder so a later request can retry, unless it was already replaced
    fn evict(&self, identity: &ProviderIdentity, failed: &PendingLoad) {
        let mut map = locked(&self.inner.pending);
        if map.get(identity).is_some_and(|current| current.ptr_eq(failed)) {
            map.remove(identity);
        }
    }
}

impl RegistryInner {
    async fn load(&self, registration: ProviderRegistration) -> LoadOutcome {
        let identity = registration.identity();
        self.loads.fetch_add(1, Ordering::SeqCst);
        tracing::info!(provider = %identity, "loading provider plugin");

        let provider = self
            .loader
            .load(&identity)
            .await
            .map_err(|e| LoadFailure::PluginLoad(e.to_string()))?;
        provider
            .configure(&registration.config)
            .await
            .map_err(|e| LoadFailure::InvalidConfig(e.to_string()))?;

        let urn = registration.urn(&self.stack, &self.project);
        let inputs = registration.inputs();
        let prior = self
            .snapshots
            .prior()
            .find(&urn)
            .filter(|r| r.id.is_some())
            .cloned();

        let (kind, record) = match &prior {
            Some(before) if before.inputs == inputs => (StepKind::Same, before.clone()),
            Some(before) => {
                let mut record = before.clone().with_inputs(inputs);
                record.touch();
                (StepKind::Update, record)
            }
            None => {
                let record = ResourceRecord::new(urn.clone(), registration.resource_type(), true)
                    .with_id(uuid::Uuid::new_v4().to_string())
                    .with_inputs(inputs);
                (StepKind::Create, record)
            }
        };
        let reference = ProviderReference::new(urn, record.id.clone().unwrap_or_default());

        locked(&self.bound).insert(
            reference.clone(),
            Binding {
                provider,
                kind,
                record,
                prior,
            },
        );

        tracing::debug!(%reference, %kind, "provider registered");
        Ok(reference)
    }
}
