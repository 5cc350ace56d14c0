//! FleetStack deployment engine
//!
//! Reconciles the resources a program declares against the last committed
//! snapshot of a stack:
//!
//! - [`ProviderRegistry`] loads each provider plugin once per identity
//! - [`ResourceMonitor`] accepts concurrent registrations from the program
//! - [`StepGenerator`] classifies each registration as a [`Step`]
//! - [`StepExecutor`] runs steps with bounded parallelism along dependency edges
//! - [`SnapshotManager`] journals every terminal step and assembles the new snapshot
//!
//! [`Deployment`] ties them together for one run.

pub mod deployment;
pub mod error;
pub mod executor;
pub mod generator;
pub mod monitor;
pub mod provider;
pub mod registry;
pub mod report;
pub mod resource;
pub mod snapshot;
pub mod step;
pub mod store;
pub mod urn;

pub use deployment::{Deployment, DeploymentOptions};
pub use error::{EngineError, Result};
pub use executor::{ExecutorHandle, ExecutorOptions, StepExecutor, StepResponse};
pub use generator::{DeletePlan, ResourceGoal, StepGenerator};
pub use monitor::{RegisterResourceResponse, ResourceMonitor, ResourceOptions};
pub use provider::{
    CheckFailure, CheckResult, CreateResult, DiffChanges, DiffResult, OperationStatus, Provider,
    ProviderError, ProviderErrorKind, ProviderIdentity, ProviderLoader, ProviderResult,
    ReadResult, RetryConfig, UpdateResult,
};
pub use registry::{ProviderRegistration, ProviderRegistry};
pub use report::{PlanSummary, RunReport, RunStatus, StepReport};
pub use resource::{PropertyMap, ResourceRecord};
pub use snapshot::{SNAPSHOT_VERSION, Snapshot, SnapshotManager};
pub use step::{Step, StepKey, StepKind, StepStatus};
pub use store::{FileSnapshotStore, LockInfo, MemorySnapshotStore, SnapshotStore, StateLock};
pub use urn::{ProviderReference, Urn};
