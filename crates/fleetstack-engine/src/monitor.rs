//! Resource monitor: the program-facing registration surface
//!
//! Every method may be called concurrently from any number of tasks. A
//! resource registration resolves once its own step has run; independent
//! registrations proceed in parallel.

use crate::error::{EngineError, Result};
use crate::executor::ExecutorHandle;
use crate::generator::{ResourceGoal, StepGenerator};
use crate::provider::{OperationStatus, Provider};
use crate::registry::{ProviderRegistration, ProviderRegistry};
use crate::resource::{PropertyMap, ResourceRecord};
use crate::snapshot::SnapshotManager;
use crate::step::{Step, StepKey, StepKind};
use crate::urn::{ProviderReference, Urn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;

/// Options accompanying a resource registration
#[derive(Debug, Clone, Default)]
pub struct ResourceOptions {
    /// Explicit provider reference (`<provider urn>::<id>`)
    pub provider: Option<String>,
    pub parent: Option<Urn>,
    pub dependencies: Vec<Urn>,
    /// Version of the default provider when no explicit reference is given
    pub version: Option<String>,
    pub protect: bool,
    pub delete_before_replace: bool,
}

impl ResourceOptions {
    pub fn provider(mut self, reference: impl Into<String>) -> Self {
        self.provider = Some(reference.into());
        self
    }

    pub fn parent(mut self, parent: Urn) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn depends_on(mut self, dependency: Urn) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn protect(mut self) -> Self {
        self.protect = true;
        self
    }

    pub fn delete_before_replace(mut self) -> Self {
        self.delete_before_replace = true;
        self
    }
}

/// What a registration resolves to once its step has run
#[derive(Debug, Clone)]
pub struct RegisterResourceResponse {
    pub urn: Urn,
    pub id: Option<String>,
    pub outputs: PropertyMap,
    pub status: OperationStatus,
    pub kind: StepKind,
}

#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    stack: String,
    project: String,
    registry: ProviderRegistry,
    generator: StepGenerator,
    executor: ExecutorHandle,
    snapshots: SnapshotManager,
    claimed: Mutex<HashSet<Urn>>,
    /// `true` once intake has closed
    closed: RwLock<bool>,
}

impl ResourceMonitor {
    pub fn new(
        stack: impl Into<String>,
        project: impl Into<String>,
        registry: ProviderRegistry,
        generator: StepGenerator,
        executor: ExecutorHandle,
        snapshots: SnapshotManager,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                stack: stack.into(),
                project: project.into(),
                registry,
                generator,
                executor,
                snapshots,
                claimed: Mutex::new(HashSet::new()),
                closed: RwLock::new(false),
            }),
        }
    }

    pub fn stack(&self) -> &str {
        &self.inner.stack
    }

    pub fn project(&self) -> &str {
        &self.inner.project
    }

    /// URN a resource registration with these arguments resolves to
    pub fn urn(&self, resource_type: &str, name: &str, parent: Option<&Urn>) -> Urn {
        Urn::new(
            &self.inner.stack,
            &self.inner.project,
            parent,
            resource_type,
            name,
        )
    }

    pub async fn register_provider(
        &self,
        package: &str,
        version: &str,
        download_source: &str,
        config: PropertyMap,
    ) -> Result<ProviderReference> {
        self.ensure_open().await?;
        self.inner
            .registry
            .register(
                ProviderRegistration::new(package, version)
                    .with_download_source(download_source)
                    .with_config(config),
            )
            .await
    }

    /// Register a resource and wait for its step to finish
    pub async fn register_resource(
        &self,
        resource_type: &str,
        name: &str,
        custom: bool,
        inputs: PropertyMap,
        options: ResourceOptions,
    ) -> Result<RegisterResourceResponse> {
        let urn = self.urn(resource_type, name, options.parent.as_ref());
        self.claim(&urn).await?;
        let before = self.inner.generator.prior_record(&urn).cloned();

        let prepared = self
            .prepare(&urn, resource_type, custom, inputs, &options)
            .await;
        let (goal, step) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                let kind = if before.is_some() {
                    StepKind::Update
                } else {
                    StepKind::Create
                };
                self.inner
                    .executor
                    .fail(StepKey::Resource(urn.clone()), kind, before, &e);
                return Err(e);
            }
        };

        let dependencies = step_dependencies(&goal);
        self.submit(urn, step, dependencies).await
    }

    /// Adopt an existing resource by reading it through its provider
    pub async fn read_resource(
        &self,
        resource_type: &str,
        name: &str,
        id: &str,
        options: ResourceOptions,
    ) -> Result<RegisterResourceResponse> {
        let urn = self.urn(resource_type, name, options.parent.as_ref());
        self.claim(&urn).await?;
        let before = self.inner.generator.prior_record(&urn).cloned();

        let resolved = self.resolve_provider(resource_type, &options).await;
        let (reference, provider) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                self.inner.executor.fail(
                    StepKey::Resource(urn.clone()),
                    StepKind::Read,
                    before,
                    &e,
                );
                return Err(e);
            }
        };

        let mut after = ResourceRecord::new(urn.clone(), resource_type, true)
            .with_id(id)
            .with_provider(reference.clone())
            .with_dependencies(options.dependencies.clone());
        after.parent = options.parent.clone();
        after.external = true;

        let mut step = Step::new(StepKind::Read, urn.clone())
            .with_after(after)
            .with_provider(Some(provider));
        step.before = before;

        let mut dependencies: Vec<StepKey> = options
            .dependencies
            .iter()
            .chain(options.parent.iter())
            .cloned()
            .map(StepKey::Resource)
            .collect();
        dependencies.push(StepKey::Resource(reference.urn().clone()));
        self.submit(urn, step, dependencies).await
    }

    /// Attach outputs to a component registered earlier in this run
    pub async fn register_resource_outputs(&self, urn: &Urn, outputs: PropertyMap) -> Result<()> {
        self.inner.snapshots.replace_outputs(urn, outputs).await
    }

    /// Stop accepting registrations; waits for in-progress submissions
    pub async fn close(&self) {
        *self.inner.closed.write().await = true;
    }

    /// URNs registered through this monitor
    pub fn claimed_urns(&self) -> HashSet<Urn> {
        self.claimed().clone()
    }

    fn claimed(&self) -> MutexGuard<'_, HashSet<Urn>> {
        self.inner
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn ensure_open(&self) -> Result<()> {
        if *self.inner.closed.read().await {
            return Err(EngineError::Program(
                "resource monitor is closed; the program has already finished".to_string(),
            ));
        }
        Ok(())
    }

    async fn claim(&self, urn: &Urn) -> Result<()> {
        self.ensure_open().await?;
        if !self.claimed().insert(urn.clone()) {
            tracing::warn!(%urn, "duplicate resource registration");
            return Err(EngineError::DuplicateUrn(urn.to_string()));
        }
        Ok(())
    }

    async fn prepare(
        &self,
        urn: &Urn,
        resource_type: &str,
        custom: bool,
        inputs: PropertyMap,
        options: &ResourceOptions,
    ) -> Result<(ResourceGoal, Step)> {
        let (reference, provider) = if custom {
            let (reference, provider) = self.resolve_provider(resource_type, options).await?;
            (Some(reference), Some(provider))
        } else {
            (None, None)
        };

        let goal = ResourceGoal {
            urn: urn.clone(),
            resource_type: resource_type.to_string(),
            custom,
            inputs,
            provider: reference,
            parent: options.parent.clone(),
            dependencies: options.dependencies.clone(),
            protect: options.protect,
            delete_before_replace: options.delete_before_replace,
        };
        let step = self.inner.generator.generate(&goal, provider).await?;
        tracing::debug!(%urn, kind = %step.kind, "generated step");
        Ok((goal, step))
    }

    async fn resolve_provider(
        &self,
        resource_type: &str,
        options: &ResourceOptions,
    ) -> Result<(ProviderReference, Arc<dyn Provider>)> {
        let reference = match &options.provider {
            Some(text) => ProviderReference::parse(text)?,
            None => {
                let package = resource_type.split(':').next().unwrap_or(resource_type);
                self.inner
                    .registry
                    .default_provider(package, options.version.as_deref())
                    .await?
            }
        };
        let provider = self.inner.registry.bind(&reference).await?;
        Ok((reference, provider))
    }

    async fn submit(
        &self,
        urn: Urn,
        step: Step,
        dependencies: Vec<StepKey>,
    ) -> Result<RegisterResourceResponse> {
        let kind = step.kind;
        let receiver = {
            let closed = self.inner.closed.read().await;
            if *closed {
                let error = EngineError::Program(format!(
                    "{urn} was registered after the program finished"
                ));
                self.inner.executor.fail(
                    StepKey::Resource(urn.clone()),
                    kind,
                    step.before.clone(),
                    &error,
                );
                return Err(error);
            }
            self.inner.executor.submit(step, dependencies)?
        };

        let response = receiver.await.map_err(|_| {
            EngineError::Cancelled(format!("step for {urn} was dropped by the executor"))
        })??;
        let (id, outputs) = response
            .record
            .map(|record| (record.id, record.outputs))
            .unwrap_or_default();
        Ok(RegisterResourceResponse {
            urn,
            id,
            outputs,
            status: response.status,
            kind,
        })
    }
}

/// Explicit dependencies, the parent and the provider all order before the resource
fn step_dependencies(goal: &ResourceGoal) -> Vec<StepKey> {
    goal.dependencies
        .iter()
        .chain(goal.parent.iter())
        .chain(goal.provider.iter().map(ProviderReference::urn))
        .cloned()
        .map(StepKey::Resource)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_options_builder() {
        let parent = Urn::new("dev", "web", None, "pkgA:m:Group", "g");
        let options = ResourceOptions::default()
            .parent(parent.clone())
            .version("2.0.0")
            .protect()
            .delete_before_replace();
        assert_eq!(options.parent, Some(parent));
        assert_eq!(options.version.as_deref(), Some("2.0.0"));
        assert!(options.protect && options.delete_before_replace);
    }

    #[test]
    fn test_step_dependencies_include_parent_and_provider() {
        let parent = Urn::new("dev", "web", None, "pkgA:m:Group", "g");
        let dep = Urn::new("dev", "web", None, "pkgA:m:typA", "a");
        let provider = Urn::new("dev", "web", None, "fleetstack:providers:pkgA", "default");
        let goal = ResourceGoal {
            urn: Urn::new("dev", "web", Some(&parent), "pkgA:m:typA", "b"),
            resource_type: "pkgA:m:typA".into(),
            custom: true,
            inputs: PropertyMap::new(),
            provider: Some(ProviderReference::new(provider.clone(), "p1")),
            parent: Some(parent.clone()),
            dependencies: vec![dep.clone()],
            protect: false,
            delete_before_replace: false,
        };
        assert_eq!(
            step_dependencies(&goal),
            vec![
                StepKey::Resource(dep),
                StepKey::Resource(parent),
                StepKey::Resource(provider)
            ]
        );
    }
}
