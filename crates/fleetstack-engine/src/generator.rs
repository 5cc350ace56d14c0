//! Step generator: classifies registrations against the prior snapshot

use crate::error::{EngineError, Result};
use crate::provider::{DiffChanges, DiffResult, Provider};
use crate::registry::ProviderRegistry;
use crate::resource::{PropertyMap, ResourceRecord};
use crate::snapshot::Snapshot;
use crate::step::{Step, StepKey, StepKind};
use crate::urn::{ProviderReference, Urn};
use std::collections::HashSet;
use std::sync::Arc;

/// Desired state of one resource, as registered by the program
#[derive(Debug, Clone)]
pub struct ResourceGoal {
    pub urn: Urn,
    pub resource_type: String,
    pub custom: bool,
    pub inputs: PropertyMap,
    pub provider: Option<ProviderReference>,
    pub parent: Option<Urn>,
    pub dependencies: Vec<Urn>,
    pub protect: bool,
    pub delete_before_replace: bool,
}

impl ResourceGoal {
    fn record(&self) -> ResourceRecord {
        let mut record = ResourceRecord::new(self.urn.clone(), &self.resource_type, self.custom)
            .with_inputs(self.inputs.clone())
            .with_dependencies(self.dependencies.clone());
        record.provider = self.provider.clone();
        record.parent = self.parent.clone();
        record.protect = self.protect;
        record
    }

    /// The prior record carried forward with this registration's metadata
    fn carry(&self, before: &ResourceRecord) -> ResourceRecord {
        let mut record = before.clone();
        record.provider = self.provider.clone();
        record.parent = self.parent.clone();
        record.dependencies = self.dependencies.clone();
        record.protect = self.protect;
        record
    }
}

/// A scheduled deletion of a prior record no longer registered
#[derive(Debug, Clone)]
pub struct DeletePlan {
    pub record: ResourceRecord,
    /// Deletes that must finish first: those of records depending on this one
    pub dependencies: Vec<StepKey>,
}

impl DeletePlan {
    pub fn key(&self) -> StepKey {
        StepKey::Delete {
            urn: self.record.urn.clone(),
            id: self.record.id.clone(),
        }
    }
}

#[derive(Clone)]
pub struct StepGenerator {
    prior: Arc<Snapshot>,
    registry: ProviderRegistry,
}

impl StepGenerator {
    pub fn new(prior: Arc<Snapshot>, registry: ProviderRegistry) -> Self {
        Self { prior, registry }
    }

    pub fn prior_record(&self, urn: &Urn) -> Option<&ResourceRecord> {
        self.prior.find(urn)
    }

    /// Decide the step for one registration
    pub async fn generate(
        &self,
        goal: &ResourceGoal,
        provider: Option<Arc<dyn Provider>>,
    ) -> Result<Step> {
        let before = self.prior.find(&goal.urn).cloned();

        if !goal.custom {
            return Ok(Self::component_step(goal, before));
        }
        let provider = provider.ok_or_else(|| {
            EngineError::InvalidProviderReference(format!("no provider bound to {}", goal.urn))
        })?;

        let check = provider
            .check(&goal.urn, before.as_ref().map(|b| &b.inputs), &goal.inputs)
            .await
            .map_err(|e| step_error(goal, before.as_ref(), format!("check failed: {e}")))?;
        if !check.failures.is_empty() {
            return Err(EngineError::InvalidInputs {
                urn: goal.urn.to_string(),
                failures: check
                    .failures
                    .iter()
                    .map(|f| format!("{}: {}", f.property, f.reason))
                    .collect(),
            });
        }
        let mut after = goal.record();
        after.inputs = check.inputs;

        let Some(before) = before else {
            return Ok(Step::new(StepKind::Create, goal.urn.clone())
                .with_after(after)
                .with_provider(Some(provider)));
        };

        let old_provider = before.provider.as_ref().map(ProviderReference::urn);
        let new_provider = goal.provider.as_ref().map(ProviderReference::urn);
        if old_provider.is_some() && old_provider != new_provider {
            tracing::debug!(urn = %goal.urn, "provider changed, replacing");
            let mut step = self.replace(goal, &before, after, provider, false)?;
            if let Some(reference) = &before.provider {
                step.old_provider = Some(self.registry.provider_for(reference).await?);
            }
            return Ok(step);
        }

        let diff = provider
            .diff(&goal.urn, &before.inputs, &after.inputs)
            .await
            .map_err(|e| step_error(goal, Some(&before), format!("diff failed: {e}")))?;

        match classify(&diff, &before.inputs, &after.inputs) {
            StepKind::Same => Ok(Step::same(before.clone(), goal.carry(&before))),
            StepKind::Replace => {
                self.replace(goal, &before, after, provider, diff.delete_before_replace)
            }
            kind => Ok(Step::new(kind, goal.urn.clone())
                .with_before(before)
                .with_after(after)
                .with_provider(Some(provider))),
        }
    }

    fn component_step(goal: &ResourceGoal, before: Option<ResourceRecord>) -> Step {
        match before {
            None => Step::new(StepKind::Create, goal.urn.clone()).with_after(goal.record()),
            Some(before) if before.inputs == goal.inputs => {
                let after = goal.carry(&before);
                Step::same(before, after)
            }
            Some(before) => Step::new(StepKind::Update, goal.urn.clone())
                .with_before(before)
                .with_after(goal.record()),
        }
    }

    fn replace(
        &self,
        goal: &ResourceGoal,
        before: &ResourceRecord,
        after: ResourceRecord,
        provider: Arc<dyn Provider>,
        delete_first: bool,
    ) -> Result<Step> {
        if before.protect {
            return Err(EngineError::ProtectedResource(goal.urn.to_string()));
        }
        let mut step = Step::new(StepKind::Replace, goal.urn.clone())
            .with_before(before.clone())
            .with_after(after)
            .with_provider(Some(provider));
        step.delete_before_replace = goal.delete_before_replace || delete_first;
        Ok(step)
    }

    /// Prior records that were not registered this run, with their ordering edges
    ///
    /// Records still referenced by the new state (directly or through other kept
    /// records) are carried forward instead. The result is in reverse prior order.
    pub fn plan_deletes(
        &self,
        registered: &HashSet<Urn>,
        referenced: &HashSet<Urn>,
    ) -> Vec<DeletePlan> {
        let mut candidates: Vec<&ResourceRecord> = self
            .prior
            .resources
            .iter()
            .filter(|r| r.pending_delete || !registered.contains(&r.urn))
            .collect();

        // Keep whatever the surviving state still points at
        let mut kept: HashSet<Urn> = referenced.clone();
        loop {
            let before = kept.len();
            for record in &candidates {
                if kept.contains(&record.urn) && !record.pending_delete {
                    kept.extend(record.referenced_urns().cloned());
                }
            }
            if kept.len() == before {
                break;
            }
        }
        candidates.retain(|r| r.pending_delete || !kept.contains(&r.urn));

        candidates
            .iter()
            .rev()
            .map(|record| DeletePlan {
                record: (*record).clone(),
                dependencies: candidates
                    .iter()
                    .filter(|other| other.key() != record.key() && other.references(&record.urn))
                    .map(|other| StepKey::Delete {
                        urn: other.urn.clone(),
                        id: other.id.clone(),
                    })
                    .collect(),
            })
            .collect()
    }
}

/// Map a provider diff to a step kind; replace signals win over update signals
fn classify(diff: &DiffResult, olds: &PropertyMap, news: &PropertyMap) -> StepKind {
    match diff.changes {
        DiffChanges::None => StepKind::Same,
        DiffChanges::Unknown if olds == news => StepKind::Same,
        DiffChanges::Unknown => StepKind::Update,
        DiffChanges::Some if !diff.replace_keys.is_empty() => StepKind::Replace,
        DiffChanges::Some => StepKind::Update,
    }
}

fn step_error(goal: &ResourceGoal, before: Option<&ResourceRecord>, message: String) -> EngineError {
    EngineError::StepExecution {
        urn: goal.urn.to_string(),
        kind: if before.is_some() {
            StepKind::Update
        } else {
            StepKind::Create
        },
        message,
    }
}
