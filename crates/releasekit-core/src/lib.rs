pub mod adapters;
pub mod backends;
pub mod changelog;
pub mod commits;
pub mod config;
pub mod errors;
pub mod graph;
pub mod journal;
pub mod lock;
pub mod pin;
pub mod plan;
pub mod publisher;
pub mod release_pr;
pub mod scheduler;
pub mod types;
pub mod versioning;
pub mod workspace;

// Re-export commonly used items
pub use adapters::EcosystemAdapter;
pub use backends::{Forge, PrState, Registry, Vcs};
pub use commits::{Commit, CommitType};
pub use config::{Config, PackageOverrides, ReleaseMode, WorkspaceConfig};
pub use errors::{ReleaseKitError, Result};
pub use graph::{DependencyGraph, PackageFilter, wildcard_match};
pub use journal::{PackageStatus, RunState};
pub use lock::{DEFAULT_STALE_AFTER, ProcessLock};
pub use pin::PinSession;
pub use plan::{PlanInputs, build_plan, collect_inputs, direct_bump, plan_hash};
pub use publisher::{PreflightFinding, PublisherOptions, run_preflight, run_publish};
pub use release_pr::{
    PENDING_LABEL, PUBLISHED_LABEL, PrManifest, PrepareOutcome, ReleaseOutcome, TAGGED_LABEL,
    run_prepare, run_release,
};
pub use scheduler::{NodeState, Scheduler, SchedulerObserver, SchedulerResult, SchedulerState};
pub use types::{
    Bump, BumpReason, Ecosystem, PackageInfo, PrHandle, ReleaseHandle, ReleasePlan, VersionBump,
    Workspace,
};
pub use versioning::{VersioningScheme, scheme_by_name};
pub use workspace::{Discovery, discover};
