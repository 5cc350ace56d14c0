//! Step executor
//!
//! One coordinator task owns the step graph. Steps arrive over a channel
//! together with the keys of the steps they depend on; the coordinator
//! decides when each becomes eligible, runs at most `parallel` of them at a
//! time and answers each submitter through its own oneshot channel.
//!
//! A failed step makes every step depending on it (transitively) `Skipped`.
//! Independent steps keep running. Completed steps are never rolled back.

use crate::error::{EngineError, Result};
use crate::provider::{OperationStatus, ProviderErrorKind};
use crate::resource::ResourceRecord;
use crate::snapshot::SnapshotManager;
use crate::step::{Applied, CallPolicy, Step, StepFailure, StepKey, StepKind, StepOutcome, StepStatus};
use crate::urn::Urn;
use futures_util::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum number of steps in flight
    pub parallel: usize,
    pub policy: CallPolicy,
}

/// Result handed back to the submitter of a step
#[derive(Debug, Clone)]
pub struct StepResponse {
    pub kind: StepKind,
    /// The resource's record after the step; `None` once deleted
    pub record: Option<ResourceRecord>,
    pub status: OperationStatus,
}

type Reply = oneshot::Sender<Result<StepResponse>>;

enum Command {
    Submit {
        step: Step,
        dependencies: Vec<StepKey>,
        reply: Reply,
    },
    Fail {
        key: StepKey,
        kind: StepKind,
        before: Option<ResourceRecord>,
        message: String,
    },
    MarkCompleted(StepKey),
    Seal(oneshot::Sender<()>),
    Drain(oneshot::Sender<()>),
    Shutdown,
}

/// Cloneable handle for submitting work to the coordinator
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    /// First run-aborting error reported through [`ExecutorHandle::fail`]
    fatal: Arc<OnceLock<String>>,
}

impl ExecutorHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| EngineError::Cancelled("step executor has shut down".to_string()))
    }

    /// Queue a step; the receiver resolves once the step reaches a terminal state
    pub fn submit(
        &self,
        step: Step,
        dependencies: Vec<StepKey>,
    ) -> Result<oneshot::Receiver<Result<StepResponse>>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit {
            step,
            dependencies,
            reply,
        })?;
        Ok(rx)
    }

    /// Submit and wait for the step to finish
    pub async fn execute(&self, step: Step, dependencies: Vec<StepKey>) -> Result<StepResponse> {
        let urn = step.urn.clone();
        self.submit(step, dependencies)?.await.map_err(|_| {
            EngineError::Cancelled(format!("step for {urn} was dropped by the executor"))
        })?
    }

    /// Report a step that failed before it could be scheduled
    ///
    /// A fatal error also cancels the run.
    pub fn fail(
        &self,
        key: StepKey,
        kind: StepKind,
        before: Option<ResourceRecord>,
        error: &EngineError,
    ) {
        if error.is_fatal() {
            tracing::error!(step = %key, %error, "fatal error, cancelling deployment");
            let _ = self.fatal.set(error.to_string());
            self.cancel.cancel();
        }
        let _ = self.send(Command::Fail {
            key,
            kind,
            before,
            message: error.to_string(),
        });
    }

    /// The error that aborted the run, if any
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.get().cloned()
    }

    /// Mark a step that completed outside the executor (provider registrations)
    pub fn mark_completed(&self, key: StepKey) {
        let _ = self.send(Command::MarkCompleted(key));
    }

    /// No further resource steps will arrive; dependencies on unknown steps now fail
    pub async fn seal(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Seal(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Wait until every submitted step is terminal
    pub async fn drain(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Drain(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The running coordinator
pub struct StepExecutor {
    handle: ExecutorHandle,
    task: JoinHandle<()>,
}

impl StepExecutor {
    pub fn start(
        options: ExecutorOptions,
        snapshots: SnapshotManager,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            parallel: options.parallel.max(1),
            policy: options.policy,
            snapshots,
            cancel: cancel.clone(),
            cancel_handled: false,
            nodes: HashMap::new(),
            waiting: Vec::new(),
            ready: VecDeque::new(),
            running: JoinSet::new(),
            in_flight: HashMap::new(),
            sealed: false,
            drains: Vec::new(),
        };
        let task = tokio::spawn(coordinator.run(rx));
        Self {
            handle: ExecutorHandle {
                tx,
                cancel,
                fatal: Arc::new(OnceLock::new()),
            },
            task,
        }
    }

    pub fn handle(&self) -> ExecutorHandle {
        self.handle.clone()
    }

    /// Finish in-flight work and stop the coordinator
    pub async fn finish(self) {
        let _ = self.handle.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "step coordinator terminated abnormally");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Waiting,
    Running,
    Succeeded,
    /// Failed or skipped; dependents will be skipped
    Failed,
}

struct Pending {
    step: Step,
    dependencies: Vec<StepKey>,
    reply: Option<Reply>,
}

impl Pending {
    fn answer(&mut self, result: Result<StepResponse>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

enum Readiness {
    Ready,
    Wait,
    Blocked(StepKey),
    Unresolved(StepKey),
}

struct Coordinator {
    parallel: usize,
    policy: CallPolicy,
    snapshots: SnapshotManager,
    cancel: CancellationToken,
    cancel_handled: bool,
    nodes: HashMap<StepKey, Node>,
    waiting: Vec<Pending>,
    ready: VecDeque<Pending>,
    running: JoinSet<(StepKey, std::result::Result<Applied, StepFailure>)>,
    in_flight: HashMap<StepKey, Pending>,
    sealed: bool,
    drains: Vec<oneshot::Sender<()>>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut open = true;
        loop {
            self.dispatch();
            self.notify_drains();
            if !open && self.is_idle() {
                break;
            }

            tokio::select! {
                command = rx.recv(), if open => match command {
                    Some(Command::Shutdown) | None => {
                        open = false;
                        self.sealed = true;
                        self.settle().await;
                    }
                    Some(command) => self.handle(command).await,
                },
                Some(joined) = self.running.join_next(), if !self.running.is_empty() => {
                    match joined {
                        Ok((key, result)) => self.complete(key, result).await,
                        Err(e) => tracing::error!(error = %e, "step task was aborted"),
                    }
                }
                _ = self.cancel.cancelled(), if !self.cancel_handled => {
                    self.cancel_handled = true;
                    self.abandon_queued().await;
                }
                else => break,
            }
        }

        for mut pending in self.in_flight.drain().map(|(_, p)| p) {
            pending.answer(Err(EngineError::Cancelled(format!(
                "step for {} did not finish",
                pending.step.urn
            ))));
        }
        for drain in self.drains.drain(..) {
            let _ = drain.send(());
        }
        tracing::debug!("step coordinator stopped");
    }

    fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.ready.is_empty() && self.running.is_empty()
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Submit {
                step,
                dependencies,
                reply,
            } => {
                let mut pending = Pending {
                    step,
                    dependencies,
                    reply: Some(reply),
                };
                let key = pending.step.key();
                if self.nodes.contains_key(&key) {
                    pending.answer(Err(EngineError::DuplicateUrn(key.to_string())));
                    return;
                }
                if self.cancel.is_cancelled() {
                    self.nodes.insert(key, Node::Failed);
                    self.skip(pending, "deployment cancelled".to_string()).await;
                    return;
                }
                tracing::debug!(step = %key, kind = %pending.step.kind, "step submitted");
                self.nodes.insert(key, Node::Waiting);
                self.waiting.push(pending);
                self.settle().await;
            }
            Command::Fail {
                key,
                kind,
                before,
                message,
            } => {
                tracing::warn!(step = %key, error = %message, "step failed before scheduling");
                let urn = key.urn().clone();
                self.nodes.insert(key, Node::Failed);
                self.snapshots
                    .record(StepOutcome::unchanged(
                        kind,
                        urn,
                        StepStatus::Failed(message),
                        before,
                    ))
                    .await;
                self.settle().await;
            }
            Command::MarkCompleted(key) => {
                self.nodes.entry(key).or_insert(Node::Succeeded);
                self.settle().await;
            }
            Command::Seal(reply) => {
                self.sealed = true;
                self.settle().await;
                let _ = reply.send(());
            }
            Command::Drain(reply) => self.drains.push(reply),
            Command::Shutdown => {}
        }
    }

    fn readiness(&self, pending: &Pending) -> Readiness {
        let mut ready = true;
        for dependency in &pending.dependencies {
            match self.nodes.get(dependency) {
                Some(Node::Succeeded) => {}
                Some(Node::Failed) => return Readiness::Blocked(dependency.clone()),
                Some(Node::Waiting | Node::Running) => ready = false,
                None if self.sealed => return Readiness::Unresolved(dependency.clone()),
                None => ready = false,
            }
        }
        if ready { Readiness::Ready } else { Readiness::Wait }
    }

    /// Move waiting steps to the ready queue, or skip them, until nothing changes
    async fn settle(&mut self) {
        loop {
            let mut changed = false;
            for pending in std::mem::take(&mut self.waiting) {
                match self.readiness(&pending) {
                    Readiness::Ready => {
                        self.ready.push_back(pending);
                        changed = true;
                    }
                    Readiness::Wait => self.waiting.push(pending),
                    Readiness::Blocked(dependency) => {
                        self.nodes.insert(pending.step.key(), Node::Failed);
                        self.skip(pending, format!("dependency {dependency} did not succeed"))
                            .await;
                        changed = true;
                    }
                    Readiness::Unresolved(dependency) => {
                        self.nodes.insert(pending.step.key(), Node::Failed);
                        let error = EngineError::UnresolvedDependency {
                            urn: pending.step.urn.to_string(),
                            dependency: dependency.to_string(),
                        };
                        self.fail(pending, error.to_string()).await;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        // Nothing can ever unblock the remaining steps: they wait on each other
        if self.sealed
            && self.running.is_empty()
            && self.ready.is_empty()
            && !self.waiting.is_empty()
        {
            for pending in std::mem::take(&mut self.waiting) {
                self.nodes.insert(pending.step.key(), Node::Failed);
                self.fail(pending, "dependency cycle".to_string()).await;
            }
        }
    }

    fn dispatch(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        while self.running.len() < self.parallel {
            let Some(pending) = self.ready.pop_front() else {
                break;
            };
            let key = pending.step.key();
            let step = pending.step.clone();
            let policy = self.policy.clone();
            tracing::debug!(step = %key, kind = %step.kind, "dispatching step");

            self.nodes.insert(key.clone(), Node::Running);
            self.in_flight.insert(key.clone(), pending);
            self.running.spawn(async move {
                let result = AssertUnwindSafe(step.apply(&policy))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(StepFailure::from(crate::provider::ProviderError::crashed(
                            format!("provider panicked during {} of {}", step.kind, step.urn),
                        )))
                    });
                (key, result)
            });
        }
    }

    async fn complete(&mut self, key: StepKey, result: std::result::Result<Applied, StepFailure>) {
        let Some(mut pending) = self.in_flight.remove(&key) else {
            return;
        };
        let kind = pending.step.kind;
        let urn = pending.step.urn.clone();
        let before = pending.step.before.clone();

        match result {
            Ok(applied) => {
                tracing::debug!(step = %key, %kind, "step completed");
                self.nodes.insert(key, Node::Succeeded);
                let response = StepResponse {
                    kind,
                    record: applied.after.clone(),
                    status: applied.status,
                };
                self.snapshots
                    .record(StepOutcome::completed(kind, urn, applied, before))
                    .await;
                pending.answer(Ok(response));
            }
            Err(failure) => {
                tracing::warn!(step = %key, %kind, error = %failure.error, "step failed");
                self.nodes.insert(key, Node::Failed);
                if failure.error.is_crash() {
                    tracing::error!(%urn, "provider crashed, cancelling deployment");
                    self.cancel.cancel();
                }
                let timed_out = failure.error.kind == ProviderErrorKind::TimedOut;
                let message = failure.error.message.clone();
                let outcome = match failure.partial {
                    Some(applied) => StepOutcome {
                        status: StepStatus::Failed(message.clone()),
                        ..StepOutcome::completed(kind, urn.clone(), applied, before)
                    },
                    None => StepOutcome::unchanged(
                        kind,
                        urn.clone(),
                        StepStatus::Failed(message.clone()),
                        before,
                    ),
                };
                self.snapshots.record(outcome).await;
                let urn = urn.to_string();
                pending.answer(Err(if timed_out {
                    EngineError::Timeout { urn, kind, message }
                } else {
                    EngineError::StepExecution { urn, kind, message }
                }));
            }
        }
        self.settle().await;
    }

    async fn skip(&mut self, mut pending: Pending, reason: String) {
        let step = &pending.step;
        tracing::warn!(urn = %step.urn, kind = %step.kind, %reason, "step skipped");
        let outcome = StepOutcome::unchanged(
            step.kind,
            step.urn.clone(),
            StepStatus::Skipped(reason.clone()),
            step.before.clone(),
        );
        let urn = step.urn.to_string();
        self.snapshots.record(outcome).await;
        pending.answer(Err(EngineError::Skipped { urn, reason }));
    }

    async fn fail(&mut self, mut pending: Pending, message: String) {
        let step = &pending.step;
        tracing::warn!(urn = %step.urn, kind = %step.kind, error = %message, "step failed");
        let kind = step.kind;
        let urn: Urn = step.urn.clone();
        self.snapshots
            .record(StepOutcome::unchanged(
                kind,
                urn.clone(),
                StepStatus::Failed(message.clone()),
                step.before.clone(),
            ))
            .await;
        pending.answer(Err(EngineError::StepExecution {
            urn: urn.to_string(),
            kind,
            message,
        }));
    }

    /// Skip everything not yet running after cancellation
    async fn abandon_queued(&mut self) {
        let queued: Vec<Pending> = self
            .ready
            .drain(..)
            .chain(std::mem::take(&mut self.waiting))
            .collect();
        if !queued.is_empty() {
            tracing::warn!(count = queued.len(), "deployment cancelled, skipping queued steps");
        }
        for pending in queued {
            self.nodes.insert(pending.step.key(), Node::Failed);
            self.skip(pending, "deployment cancelled".to_string()).await;
        }
    }

    fn notify_drains(&mut self) {
        if self.is_idle() {
            for drain in self.drains.drain(..) {
                let _ = drain.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CreateResult, Provider, ProviderError, ProviderResult, RetryConfig, UpdateResult};
    use crate::resource::PropertyMap;
    use crate::snapshot::Snapshot;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Creates succeed unless the resource name starts with "fail"
    struct CountingProvider {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        async fn create(
            &self,
            urn: &Urn,
            inputs: &PropertyMap,
            _timeout: Duration,
            _preview: bool,
        ) -> ProviderResult<CreateResult> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if urn.name().starts_with("fail") {
                return Err(ProviderError::permanent("create rejected"));
            }
            Ok(CreateResult {
                id: format!("{}-id", urn.name()),
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
            Ok(())
        }
    }

    fn executor(parallel: usize) -> (StepExecutor, SnapshotManager) {
        executor_with_timeout(parallel, Duration::from_secs(5))
    }

    fn executor_with_timeout(
        parallel: usize,
        timeout: Duration,
    ) -> (StepExecutor, SnapshotManager) {
        let snapshots = SnapshotManager::new(Arc::new(Snapshot::empty("dev", "web")));
        let options = ExecutorOptions {
            parallel,
            policy: CallPolicy {
                timeout,
                retry: RetryConfig::none(),
                preview: false,
            },
        };
        let executor = StepExecutor::start(options, snapshots.clone(), CancellationToken::new());
        (executor, snapshots)
    }

    fn create_step(provider: &Arc<CountingProvider>, name: &str) -> Step {
        let urn = Urn::new("dev", "web", None, "pkgA:m:typA", name);
        let provider: Arc<dyn Provider> = provider.clone();
        Step::new(StepKind::Create, urn.clone())
            .with_after(ResourceRecord::new(urn, "pkgA:m:typA", true))
            .with_provider(Some(provider))
    }

    fn counting() -> Arc<CountingProvider> {
        Arc::new(CountingProvider {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let (executor, _) = executor(2);
        let handle = executor.handle();
        let provider = counting();

        let receivers: Vec<_> = (0..6)
            .map(|i| {
                handle
                    .submit(create_step(&provider, &format!("r{i}")), Vec::new())
                    .unwrap()
            })
            .collect();
        for rx in receivers {
            assert!(rx.await.unwrap().is_ok());
        }
        assert!(provider.peak.load(Ordering::SeqCst) <= 2);
        executor.finish().await;
    }

    #[tokio::test]
    async fn test_dependent_waits_for_dependency() {
        let (executor, snapshots) = executor(4);
        let handle = executor.handle();
        let provider = counting();

        let child = create_step(&provider, "child");
        let parent = create_step(&provider, "parent");
        let parent_key = parent.key();

        // Submitted out of order; the dependency edge decides
        let child_rx = handle.submit(child, vec![parent_key]).unwrap();
        let parent_rx = handle.submit(parent, Vec::new()).unwrap();
        assert!(parent_rx.await.unwrap().is_ok());
        assert!(child_rx.await.unwrap().is_ok());

        let order: Vec<String> = snapshots
            .outcomes()
            .await
            .iter()
            .map(|o| o.urn.name().to_string())
            .collect();
        assert_eq!(order, vec!["parent", "child"]);
        executor.finish().await;
    }

    #[tokio::test]
    async fn test_failure_skips_transitive_dependents_only() {
        let (executor, _) = executor(4);
        let handle = executor.handle();
        let provider = counting();

        let a = create_step(&provider, "fail-a");
        let b = create_step(&provider, "b");
        let c = create_step(&provider, "c");
        let d = create_step(&provider, "d");
        let (a_key, b_key) = (a.key(), b.key());

        let a_rx = handle.submit(a, Vec::new()).unwrap();
        let b_rx = handle.submit(b, vec![a_key]).unwrap();
        let c_rx = handle.submit(c, vec![b_key]).unwrap();
        let d_rx = handle.submit(d, Vec::new()).unwrap();

        assert!(matches!(a_rx.await.unwrap(), Err(EngineError::StepExecution { .. })));
        assert!(matches!(b_rx.await.unwrap(), Err(EngineError::Skipped { .. })));
        assert!(matches!(c_rx.await.unwrap(), Err(EngineError::Skipped { .. })));
        assert!(d_rx.await.unwrap().is_ok());
        executor.finish().await;
    }

    #[tokio::test]
    async fn test_seal_fails_unresolved_dependencies() {
        let (executor, _) = executor(4);
        let handle = executor.handle();
        let provider = counting();

        let ghost = StepKey::Resource(Urn::new("dev", "web", None, "pkgA:m:typA", "ghost"));
        let rx = handle
            .submit(create_step(&provider, "orphan"), vec![ghost])
            .unwrap();
        handle.seal().await;

        match rx.await.unwrap() {
            Err(EngineError::StepExecution { message, .. }) => {
                assert!(message.contains("never registered"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
        executor.finish().await;
    }

    #[tokio::test]
    async fn test_cancellation_skips_queued_steps() {
        let (executor, _) = executor(1);
        let handle = executor.handle();
        let provider = counting();

        handle.cancel();
        let rx = handle.submit(create_step(&provider, "late"), Vec::new()).unwrap();
        assert!(matches!(rx.await.unwrap(), Err(EngineError::Skipped { .. })));
        executor.finish().await;
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected() {
        let (executor, _) = executor(1);
        let handle = executor.handle();
        let provider = counting();

        let first = handle.submit(create_step(&provider, "dup"), Vec::new()).unwrap();
        let second = handle.submit(create_step(&provider, "dup"), Vec::new()).unwrap();
        assert!(matches!(second.await.unwrap(), Err(EngineError::DuplicateUrn(_))));
        assert!(first.await.unwrap().is_ok());
        executor.finish().await;
    }

    #[tokio::test]
    async fn test_timed_out_step_reports_timeout() {
        let (executor, snapshots) = executor_with_timeout(1, Duration::from_millis(5));
        let handle = executor.handle();
        let provider = counting();

        let rx = handle.submit(create_step(&provider, "slow"), Vec::new()).unwrap();
        assert!(matches!(rx.await.unwrap(), Err(EngineError::Timeout { .. })));

        let outcomes = snapshots.outcomes().await;
        assert!(matches!(outcomes[0].status, StepStatus::Failed(_)));
        executor.finish().await;
    }

    #[tokio::test]
    async fn test_fatal_failure_cancels_the_run() {
        let (executor, _) = executor(1);
        let handle = executor.handle();
        let provider = counting();

        let broken = StepKey::Resource(Urn::new("dev", "web", None, "pkgA:m:typA", "broken"));
        handle.fail(
            broken.clone(),
            StepKind::Delete,
            None,
            &EngineError::SnapshotConsistency("provider record has no package input".into()),
        );
        assert!(handle.is_cancelled());
        assert!(handle.fatal_error().unwrap().contains("no package input"));

        let rx = handle.submit(create_step(&provider, "after"), Vec::new()).unwrap();
        assert!(matches!(rx.await.unwrap(), Err(EngineError::Skipped { .. })));
        executor.finish().await;
    }
}
