//! Scripted provider plugins for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use fleetstack_engine::{
    CheckFailure, CheckResult, CreateResult, Deployment, DeploymentOptions, DiffResult,
    OperationStatus, PropertyMap, Provider, ProviderError, ProviderIdentity, ProviderLoader,
    ProviderResult, ReadResult, RetryConfig, SnapshotStore, UpdateResult, Urn,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn props(value: serde_json::Value) -> PropertyMap {
    serde_json::from_value(value).unwrap()
}

/// Behaviour shared by every plugin a [`ScriptedLoader`] hands out
#[derive(Default)]
pub struct Script {
    /// Fixed create ID per plugin version
    pub ids_by_version: Mutex<HashMap<String, String>>,
    /// Resource names whose create fails permanently
    pub fail_create: Mutex<HashSet<String>>,
    /// Resource names whose create crashes the plugin
    pub crash_create: Mutex<HashSet<String>>,
    /// Resource names whose delete fails
    pub fail_delete: Mutex<HashSet<String>>,
    /// Remaining transient failures per resource name
    pub flaky: Mutex<HashMap<String, u32>>,
    /// Properties that cannot be updated in place
    pub replace_keys: Mutex<HashSet<String>>,
    /// Properties rejected by check
    pub required: Mutex<HashSet<String>>,
    /// Calls in the order they happened, e.g. `create pkgA@1.0.0 resA`
    pub calls: Mutex<Vec<String>>,
    pub create_delay: Mutex<Duration>,
    next_id: AtomicUsize,
    active: AtomicUsize,
    pub peak_active: AtomicUsize,
}

impl Script {
    pub fn fail_create(&self, name: &str) {
        self.fail_create.lock().unwrap().insert(name.to_string());
    }

    pub fn crash_create(&self, name: &str) {
        self.crash_create.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_delete(&self, name: &str) {
        self.fail_delete.lock().unwrap().insert(name.to_string());
    }

    pub fn flaky(&self, name: &str, failures: u32) {
        self.flaky.lock().unwrap().insert(name.to_string(), failures);
    }

    pub fn replace_on(&self, key: &str) {
        self.replace_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn require(&self, key: &str) {
        self.required.lock().unwrap().insert(key.to_string());
    }

    pub fn id_for_version(&self, version: &str, id: &str) {
        self.ids_by_version
            .lock()
            .unwrap()
            .insert(version.to_string(), id.to_string());
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls starting with `op` (`create`, `update`, `delete`, `read`)
    pub fn calls_of(&self, op: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(&format!("{op} ")))
            .collect()
    }

    fn log(&self, op: &str, identity: &ProviderIdentity, urn: &Urn) {
        self.calls.lock().unwrap().push(format!(
            "{op} {}@{} {}",
            identity.package,
            identity.version,
            urn.name()
        ));
    }
}

pub struct ScriptedProvider {
    identity: ProviderIdentity,
    script: Arc<Script>,
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn configure(&self, config: &PropertyMap) -> ProviderResult<()> {
        if config.contains_key("invalid") {
            return Err(ProviderError::permanent("unsupported configuration key: invalid"));
        }
        Ok(())
    }

    async fn check(
        &self,
        _urn: &Urn,
        _olds: Option<&PropertyMap>,
        news: &PropertyMap,
    ) -> ProviderResult<CheckResult> {
        let failures = self
            .script
            .required
            .lock()
            .unwrap()
            .iter()
            .filter(|key| !news.contains_key(*key))
            .map(|key| CheckFailure {
                property: key.clone(),
                reason: "missing required property".to_string(),
            })
            .collect();
        Ok(CheckResult {
            inputs: news.clone(),
            failures,
        })
    }

    async fn diff(
        &self,
        _urn: &Urn,
        olds: &PropertyMap,
        news: &PropertyMap,
    ) -> ProviderResult<DiffResult> {
        let keys: HashSet<&String> = olds.keys().chain(news.keys()).collect();
        let mut changed: Vec<String> = keys
            .into_iter()
            .filter(|k| olds.get(*k) != news.get(*k))
            .cloned()
            .collect();
        changed.sort();
        if changed.is_empty() {
            return Ok(DiffResult::none());
        }
        let replace_keys = self.script.replace_keys.lock().unwrap();
        let replace: Vec<String> = changed
            .iter()
            .filter(|k| replace_keys.contains(*k))
            .cloned()
            .collect();
        if replace.is_empty() {
            Ok(DiffResult::update(changed))
        } else {
            let mut diff = DiffResult::replace(replace);
            diff.changed_keys = changed;
            Ok(diff)
        }
    }

    async fn create(
        &self,
        urn: &Urn,
        inputs: &PropertyMap,
        _timeout: Duration,
        preview: bool,
    ) -> ProviderResult<CreateResult> {
        let name = urn.name().to_string();
        if let Some(remaining) = self.script.flaky.lock().unwrap().get_mut(&name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::transient("service unavailable"));
            }
        }
        if self.script.crash_create.lock().unwrap().contains(&name) {
            return Err(ProviderError::crashed("plugin process exited"));
        }
        if self.script.fail_create.lock().unwrap().contains(&name) {
            return Err(ProviderError::permanent("quota exceeded"));
        }

        let now = self.script.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.peak_active.fetch_max(now, Ordering::SeqCst);
        let delay = *self.script.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.script.active.fetch_sub(1, Ordering::SeqCst);

        if preview {
            return Ok(CreateResult {
                id: String::new(),
                outputs: inputs.clone(),
                status: OperationStatus::Ok,
            });
        }
        self.script.log("create", &self.identity, urn);
        let fixed = self
            .script
            .ids_by_version
            .lock()
            .unwrap()
            .get(&self.identity.version)
            .cloned();
        let id = fixed.unwrap_or_else(|| {
            format!(
                "{name}-{}",
                self.script.next_id.fetch_add(1, Ordering::SeqCst)
            )
        });
        let mut outputs = inputs.clone();
        outputs.insert("id".into(), serde_json::json!(id));
        Ok(CreateResult {
            id,
            outputs,
            status: OperationStatus::Ok,
        })
    }

    async fn update(
        &self,
        urn: &Urn,
        id: &str,
        _olds: &PropertyMap,
        news: &PropertyMap,
        _timeout: Duration,
        preview: bool,
    ) -> ProviderResult<UpdateResult> {
        if !preview {
            self.script.log("update", &self.identity, urn);
        }
        let mut outputs = news.clone();
        outputs.insert("id".into(), serde_json::json!(id));
        Ok(UpdateResult {
            outputs,
            status: OperationStatus::Ok,
        })
    }

    async fn delete(
        &self,
        urn: &Urn,
        _id: &str,
        _inputs: &PropertyMap,
        _outputs: &PropertyMap,
        _timeout: Duration,
    ) -> ProviderResult<()> {
        if self.script.fail_delete.lock().unwrap().contains(urn.name()) {
            return Err(ProviderError::permanent("resource is still in use"));
        }
        self.script.log("delete", &self.identity, urn);
        Ok(())
    }

    async fn read(&self, urn: &Urn, id: &str) -> ProviderResult<ReadResult> {
        self.script.log("read", &self.identity, urn);
        Ok(ReadResult {
            inputs: props(serde_json::json!({ "imported": id })),
            outputs: props(serde_json::json!({ "id": id, "state": "available" })),
        })
    }
}

/// Loader handing out [`ScriptedProvider`]s; counts loads per package
#[derive(Default)]
pub struct ScriptedLoader {
    pub script: Arc<Script>,
    missing: Mutex<HashSet<String>>,
    loads: Mutex<HashMap<String, usize>>,
    pub load_delay: Mutex<Duration>,
}

impl ScriptedLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            load_delay: Mutex::new(Duration::from_millis(10)),
            ..Self::default()
        })
    }

    pub fn missing(&self, package: &str) {
        self.missing.lock().unwrap().insert(package.to_string());
    }

    pub fn loads_of(&self, package: &str) -> usize {
        self.loads
            .lock()
            .unwrap()
            .get(package)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_loads(&self) -> usize {
        self.loads.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ProviderLoader for ScriptedLoader {
    async fn load(&self, identity: &ProviderIdentity) -> ProviderResult<Arc<dyn Provider>> {
        *self
            .loads
            .lock()
            .unwrap()
            .entry(identity.package.clone())
            .or_default() += 1;

        // Widen the window in which concurrent registrations race
        let delay = *self.load_delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        if self.missing.lock().unwrap().contains(&identity.package) {
            return Err(ProviderError::permanent(format!(
                "plugin {} not found",
                identity.package
            )));
        }
        Ok(Arc::new(ScriptedProvider {
            identity: identity.clone(),
            script: Arc::clone(&self.script),
        }))
    }
}

pub fn options() -> DeploymentOptions {
    DeploymentOptions::new("dev", "web")
        .with_parallel(4)
        .with_step_timeout(Duration::from_secs(5))
        .with_retry(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        })
}

pub fn deployment(store: Arc<dyn SnapshotStore>, loader: &Arc<ScriptedLoader>) -> Deployment {
    Deployment::new(options(), store, loader.clone())
}
