//! Snapshots and the snapshot manager
//!
//! The manager is the only writer of deployment state during a run. Every
//! terminal step is reported through [`SnapshotManager::record`], which
//! journals records in completion order; the new snapshot is only assembled
//! (and verified) once the run is over.

use crate::error::{EngineError, Result};
use crate::resource::{PropertyMap, RecordKey, ResourceRecord};
use crate::step::StepOutcome;
use crate::urn::Urn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Ordered, topologically sorted resource state of one stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot format version
    pub version: u32,

    pub stack: String,

    pub project: String,

    /// Last commit timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
}

impl Snapshot {
    pub fn empty(stack: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            stack: stack.into(),
            project: project.into(),
            updated_at: None,
            resources: Vec::new(),
        }
    }

    pub fn with_resources(mut self, resources: Vec<ResourceRecord>) -> Self {
        self.resources = resources;
        self
    }

    /// The live (not pending deletion) record for a URN
    pub fn find(&self, urn: &Urn) -> Option<&ResourceRecord> {
        self.resources
            .iter()
            .find(|r| &r.urn == urn && !r.pending_delete)
    }

    pub fn providers(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.resources.iter().filter(|r| r.is_provider())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Check the snapshot invariants
    ///
    /// - live URNs are unique
    /// - dependencies, parents and providers refer to records earlier in the sequence
    /// - every provider reference names an existing provider record by URN and ID
    pub fn verify(&self) -> Result<()> {
        let mut live: HashSet<&Urn> = HashSet::new();
        let mut seen: HashSet<&Urn> = HashSet::new();
        let mut provider_ids: HashMap<&Urn, Option<&str>> = HashMap::new();

        for record in &self.resources {
            let violation = |message: String| {
                Err(EngineError::SnapshotConsistency(format!(
                    "{}: {}",
                    record.urn, message
                )))
            };

            if let Some(reference) = &record.provider {
                match provider_ids.get(reference.urn()) {
                    None => {
                        return violation(format!(
                            "provider {} does not appear earlier in the snapshot",
                            reference.urn()
                        ));
                    }
                    Some(id) if *id != Some(reference.id()) => {
                        return violation(format!(
                            "provider reference {reference} does not match the provider record's ID"
                        ));
                    }
                    Some(_) => {}
                }
            }

            for referenced in record.dependencies.iter().chain(record.parent.iter()) {
                if !seen.contains(referenced) {
                    return violation(format!(
                        "depends on {referenced}, which does not appear earlier in the snapshot"
                    ));
                }
            }

            if !record.pending_delete && !live.insert(&record.urn) {
                return violation("duplicate resource URN".to_string());
            }
            if record.is_provider() && !record.pending_delete {
                provider_ids.insert(&record.urn, record.id.as_deref());
            }
            seen.insert(&record.urn);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Journal {
    /// Records in the order their steps reached a terminal state
    entries: Vec<ResourceRecord>,
    /// Prior records the run has taken responsibility for
    accounted: HashSet<RecordKey>,
    outcomes: Vec<StepOutcome>,
}

impl Journal {
    fn push(&mut self, record: ResourceRecord) {
        let key = record.key();
        if !self.entries.iter().any(|e| e.key() == key) {
            self.entries.push(record);
        }
    }

    fn upsert(&mut self, record: ResourceRecord) {
        let key = record.key();
        match self.entries.iter_mut().find(|e| e.key() == key) {
            Some(existing) => *existing = record,
            None => self.entries.push(record),
        }
    }

    fn remove(&mut self, key: &RecordKey) {
        self.entries.retain(|e| &e.key() != key);
    }
}

/// Sole writer of deployment state for one run
#[derive(Clone)]
pub struct SnapshotManager {
    prior: Arc<Snapshot>,
    journal: Arc<Mutex<Journal>>,
}

impl SnapshotManager {
    pub fn new(prior: Arc<Snapshot>) -> Self {
        Self {
            prior,
            journal: Arc::new(Mutex::new(Journal::default())),
        }
    }

    /// The snapshot the run started from; never modified
    pub fn prior(&self) -> &Arc<Snapshot> {
        &self.prior
    }

    /// Journal one terminal step
    pub async fn record(&self, outcome: StepOutcome) {
        let mut journal = self.journal.lock().await;

        if let Some(before) = &outcome.before {
            journal.accounted.insert(before.key());
        }
        if outcome.status.is_completed() {
            if let (Some(before), after) = (&outcome.before, &outcome.after) {
                // A completed delete or replace also drops any copy journaled earlier in the run
                if after.as_ref().map(ResourceRecord::key) != Some(before.key()) {
                    journal.remove(&before.key());
                }
            }
            if let Some(after) = &outcome.after {
                journal.upsert(after.clone());
            }
            if let Some(retained) = &outcome.retained {
                journal.push(retained.clone());
            }
        } else {
            for record in outcome.after.iter().chain(outcome.retained.iter()) {
                journal.push(record.clone());
            }
        }

        tracing::debug!(
            urn = %outcome.urn,
            kind = %outcome.kind,
            status = ?outcome.status,
            "recorded step"
        );
        journal.outcomes.push(outcome);
    }

    /// Attach outputs to a component resource already journaled in this run
    pub async fn replace_outputs(&self, urn: &Urn, outputs: PropertyMap) -> Result<()> {
        let mut journal = self.journal.lock().await;
        let record = journal
            .entries
            .iter_mut()
            .find(|r| &r.urn == urn && !r.pending_delete)
            .ok_or_else(|| {
                EngineError::InvalidUrn(format!("{urn} has not been registered in this run"))
            })?;
        if record.custom {
            return Err(EngineError::InvalidUrn(format!(
                "{urn} is a custom resource; its outputs come from its provider"
            )));
        }
        record.outputs = outputs;
        record.touch();
        Ok(())
    }

    pub async fn outcomes(&self) -> Vec<StepOutcome> {
        self.journal.lock().await.outcomes.clone()
    }

    /// URNs with a journaled record
    pub async fn journaled_urns(&self) -> HashSet<Urn> {
        self.journal
            .lock()
            .await
            .entries
            .iter()
            .map(|r| r.urn.clone())
            .collect()
    }

    /// URNs that journaled records depend on, parent or bind to
    pub async fn referenced_urns(&self) -> HashSet<Urn> {
        self.journal
            .lock()
            .await
            .entries
            .iter()
            .flat_map(|r| r.referenced_urns().cloned())
            .collect()
    }

    /// Assemble the new snapshot: journaled records in completion order, then
    /// untouched prior records in their original order
    ///
    /// Records carried forward by failed or skipped steps may be journaled
    /// ahead of what they reference; those are moved down just far enough.
    pub async fn build(&self) -> Result<Snapshot> {
        let journal = self.journal.lock().await;
        let mut resources = journal.entries.clone();
        resources.extend(
            self.prior
                .resources
                .iter()
                .filter(|r| !journal.accounted.contains(&r.key()))
                .cloned(),
        );
        let resources = stable_topological(resources);

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            stack: self.prior.stack.clone(),
            project: self.prior.project.clone(),
            updated_at: Some(Utc::now()),
            resources,
        };
        snapshot.verify()?;
        Ok(snapshot)
    }
}

/// Reorder so every record follows what it references, otherwise keeping input order
fn stable_topological(mut pending: Vec<ResourceRecord>) -> Vec<ResourceRecord> {
    let mut ordered = Vec::with_capacity(pending.len());
    let mut placed: HashSet<Urn> = HashSet::new();
    while !pending.is_empty() {
        let ready = pending.iter().position(|record| {
            record.referenced_urns().all(|urn| {
                placed.contains(urn) || !pending.iter().any(|other| &other.urn == urn)
            })
        });
        // A cycle cannot be ordered; verification reports it
        let Some(index) = ready else {
            ordered.append(&mut pending);
            break;
        };
        let record = pending.remove(index);
        placed.insert(record.urn.clone());
        ordered.push(record);
    }
    ordered
}
