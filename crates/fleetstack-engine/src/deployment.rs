//! Deployment driver: one run of a program against a stack

use crate::error::{EngineError, Result};
use crate::executor::{ExecutorHandle, ExecutorOptions, StepExecutor};
use crate::generator::{DeletePlan, StepGenerator};
use crate::monitor::ResourceMonitor;
use crate::provider::{ProviderLoader, RetryConfig};
use crate::registry::ProviderRegistry;
use crate::report::{RunReport, RunStatus, StepReport};
use crate::snapshot::SnapshotManager;
use crate::step::{CallPolicy, Step, StepKind, StepStatus};
use crate::store::SnapshotStore;
use fleetstack_config::EngineSettings;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct DeploymentOptions {
    pub stack: String,
    pub project: String,
    /// Maximum number of steps executed at once
    pub parallel: usize,
    pub step_timeout: Duration,
    pub retry: RetryConfig,
    /// Compute the new snapshot without committing it
    pub preview: bool,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for DeploymentOptions {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            stack: settings.stack.clone(),
            project: settings.project.clone(),
            parallel: settings.parallel.max(1),
            step_timeout: settings.step_timeout(),
            retry: RetryConfig {
                max_attempts: settings.retry.max_attempts.max(1),
                initial_delay: Duration::from_millis(settings.retry.initial_delay_ms),
                max_delay: Duration::from_millis(settings.retry.max_delay_ms),
                backoff_multiplier: settings.retry.backoff_multiplier,
            },
            preview: false,
        }
    }
}

impl DeploymentOptions {
    pub fn new(stack: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            project: project.into(),
            ..Self::default()
        }
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn preview(mut self) -> Self {
        self.preview = true;
        self
    }
}

pub struct Deployment {
    options: DeploymentOptions,
    store: Arc<dyn SnapshotStore>,
    loader: Arc<dyn ProviderLoader>,
    cancel: CancellationToken,
}

impl Deployment {
    pub fn new(
        options: DeploymentOptions,
        store: Arc<dyn SnapshotStore>,
        loader: Arc<dyn ProviderLoader>,
    ) -> Self {
        Self {
            options,
            store,
            loader,
            cancel: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &DeploymentOptions {
        &self.options
    }

    /// Token that cancels the current run; in-flight steps finish, queued ones are skipped
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a program to completion and commit the resulting snapshot
    pub async fn run<F, Fut>(&self, program: F) -> Result<RunReport>
    where
        F: FnOnce(ResourceMonitor) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let started = Instant::now();
        let stack = self.options.stack.clone();
        let project = self.options.project.clone();
        tracing::info!(%stack, %project, preview = self.options.preview, "starting deployment");

        let lock = self.store.acquire_lock(&stack).await?;
        let prior = self.store.load(&stack, &project).await?;
        prior.verify()?;
        let prior = Arc::new(prior);

        let snapshots = SnapshotManager::new(Arc::clone(&prior));
        let cancel = self.cancel.child_token();
        let executor = StepExecutor::start(
            ExecutorOptions {
                parallel: self.options.parallel,
                policy: CallPolicy {
                    timeout: self.options.step_timeout,
                    retry: self.options.retry.clone(),
                    preview: self.options.preview,
                },
            },
            snapshots.clone(),
            cancel.clone(),
        );
        let handle = executor.handle();
        let registry = ProviderRegistry::new(
            &stack,
            &project,
            Arc::clone(&self.loader),
            snapshots.clone(),
            handle.clone(),
        );
        let generator = StepGenerator::new(Arc::clone(&prior), registry.clone());
        let monitor = ResourceMonitor::new(
            &stack,
            &project,
            registry.clone(),
            generator.clone(),
            handle.clone(),
            snapshots.clone(),
        );

        let program_result = program(monitor.clone()).await;
        if let Err(e) = &program_result {
            tracing::warn!(error = %e, "program failed");
        }
        monitor.close().await;
        handle.seal().await;

        if program_result.is_ok() && !cancel.is_cancelled() {
            let mut registered = monitor.claimed_urns();
            registered.extend(registry.bound_urns().await);
            let referenced = snapshots.referenced_urns().await;
            schedule_deletes(
                &registry,
                &handle,
                generator.plan_deletes(&registered, &referenced),
            )
            .await;
        }

        handle.drain().await;
        executor.finish().await;

        let steps: Vec<StepReport> = snapshots
            .outcomes()
            .await
            .iter()
            .map(StepReport::from)
            .collect();
        let had_errors = steps
            .iter()
            .any(|s| !matches!(s.status, StepStatus::Completed));

        let built = snapshots.build().await;
        let fatal = handle.fatal_error();
        let run_error = match (&program_result, &fatal) {
            (_, Some(message)) => Some(message.clone()),
            (Err(e), _) => Some(e.to_string()),
            _ if cancel.is_cancelled() => {
                Some(EngineError::Cancelled("run was cancelled".to_string()).to_string())
            }
            _ => None,
        };

        let mut report = RunReport {
            status: RunStatus::Failed,
            steps,
            snapshot: prior.as_ref().clone(),
            committed: false,
            preview: self.options.preview,
            error: run_error.clone(),
            duration_ms: 0,
        };

        // Completed steps changed real infrastructure, so a verified snapshot is
        // committed even when the program failed or the run was cancelled
        match built {
            Err(e) => {
                tracing::error!(error = %e, "built snapshot is inconsistent, keeping previous");
                report.error = Some(e.to_string());
            }
            Ok(_) if fatal.is_some() => {}
            Ok(snapshot) => {
                if run_error.is_none() {
                    report.status = if had_errors {
                        RunStatus::SucceededWithErrors
                    } else {
                        RunStatus::Succeeded
                    };
                }
                if self.options.preview {
                    report.snapshot = snapshot;
                } else if let Err(e) = self.store.save(&snapshot).await {
                    tracing::error!(error = %e, "failed to commit snapshot");
                    report.status = RunStatus::Failed;
                    report.error = Some(e.to_string());
                } else {
                    report.committed = true;
                    report.snapshot = snapshot;
                }
            }
        }

        if let Err(e) = lock.release().await {
            tracing::warn!(error = %e, "failed to release state lock");
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            status = %report.status,
            summary = %report.summary(),
            committed = report.committed,
            "deployment finished"
        );
        Ok(report)
    }
}

/// Submit deletions of unregistered prior records; completion is awaited via drain
async fn schedule_deletes(
    registry: &ProviderRegistry,
    handle: &ExecutorHandle,
    plans: Vec<DeletePlan>,
) {
    for plan in plans {
        let key = plan.key();
        let record = plan.record;

        let provider = match &record.provider {
            Some(reference) if record.is_managed() => match registry.provider_for(reference).await
            {
                Ok(provider) => Some(provider),
                Err(e) => {
                    handle.fail(key, StepKind::Delete, Some(record), &e);
                    continue;
                }
            },
            _ => None,
        };

        tracing::debug!(urn = %record.urn, "scheduling delete");
        if let Err(e) = handle.submit(Step::delete(record, provider), plan.dependencies) {
            tracing::warn!(error = %e, "could not schedule delete");
        }
    }
}
