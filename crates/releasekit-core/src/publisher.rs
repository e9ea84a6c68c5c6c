use crate::adapters::EcosystemAdapter;
use crate::backends::registry::poll_available;
use crate::backends::{Registry, Vcs};
use crate::config::Config;
use crate::errors::{ReleaseKitError, Result};
use crate::graph::DependencyGraph;
use crate::journal::{self, JournalBump, PackageStatus, RunState};
use crate::pin::PinSession;
use crate::plan::plan_hash;
use crate::scheduler::{Scheduler, SchedulerObserver, SchedulerResult};
use crate::types::{Ecosystem, ReleasePlan, VersionBump, Workspace};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Knobs for a publish run, resolved from configuration.
#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub concurrency: usize,
    pub max_retries: u32,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub dry_run: bool,
    /// Run configured hook commands between verify and done.
    pub run_hooks: bool,
}

impl PublisherOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency,
            max_retries: config.max_retries,
            poll_interval: Duration::from_secs(config.poll_interval),
            poll_timeout: Duration::from_secs(config.poll_timeout),
            dry_run: false,
            run_hooks: false,
        }
    }
}

/// One failed pre-flight check, with a stable code and a remediation hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightFinding {
    pub code: &'static str,
    pub summary: String,
    pub remediation: &'static str,
}

/// Pre-flight pass before the scheduler starts. Returns the failed checks;
/// an empty list means the run may proceed.
pub fn run_preflight(
    vcs: &dyn Vcs,
    forge_available: Option<bool>,
    workspace: &Workspace,
    plan: &ReleasePlan,
) -> Result<Vec<PreflightFinding>> {
    let mut findings = Vec::new();

    if !vcs.is_clean()? {
        findings.push(PreflightFinding {
            code: "RK-DIRTY",
            summary: "the worktree has uncommitted changes".into(),
            remediation: "commit or stash local changes before publishing",
        });
    }
    if vcs.is_shallow()? {
        findings.push(PreflightFinding {
            code: "RK-SHALLOW",
            summary: "the repository is a shallow clone".into(),
            remediation: "fetch full history (git fetch --unshallow) so release windows resolve",
        });
    }
    if let Some(false) = forge_available {
        findings.push(PreflightFinding {
            code: "RK-FORGE",
            summary: "the forge API is not reachable".into(),
            remediation: "check the forge token and network connectivity",
        });
    }
    if let Err(err) = DependencyGraph::build(workspace) {
        findings.push(PreflightFinding {
            code: "RK-CYCLE",
            summary: err.to_string(),
            remediation: "break the dependency cycle before releasing",
        });
    }
    if plan.is_empty() {
        findings.push(PreflightFinding {
            code: "RK-EMPTY",
            summary: "the plan contains no packages to publish".into(),
            remediation: "run `plan` to inspect why no package qualifies",
        });
    }

    Ok(findings)
}

struct PublishContext {
    root: PathBuf,
    run_id: String,
    packages: BTreeMap<String, crate::types::PackageInfo>,
    bumps: BTreeMap<String, VersionBump>,
    registries: BTreeMap<Ecosystem, Arc<dyn Registry>>,
    hooks_by_package: BTreeMap<String, Vec<String>>,
    options: PublisherOptions,
    journal: Mutex<RunState>,
}

impl PublishContext {
    fn record(&self, package: &str, status: PackageStatus) -> Result<()> {
        let mut state = self.journal.lock().expect("journal state poisoned");
        state.record(package, status);
        journal::save(&self.root, &state)
    }

    fn record_error(&self, package: &str, error: &str) {
        let mut state = self.journal.lock().expect("journal state poisoned");
        state.record_error(package, error);
        let _ = journal::save(&self.root, &state);
    }

    fn registry_for(&self, ecosystem: Ecosystem) -> Result<Arc<dyn Registry>> {
        self.registries.get(&ecosystem).cloned().ok_or_else(|| {
            ReleaseKitError::Registry(format!(
                "no registry backend configured for {}",
                ecosystem.display_name()
            ))
        })
    }

    /// The per-package state machine:
    /// pinning -> building -> publishing -> polling -> verifying ->
    /// restoring -> done, with restoration on every exit path.
    async fn publish_one(self: Arc<Self>, package: String) -> Result<()> {
        let info = self
            .packages
            .get(&package)
            .ok_or_else(|| {
                ReleaseKitError::Publish(format!("internal error: '{package}' not in workspace"))
            })?
            .clone();
        let bump = self
            .bumps
            .get(&package)
            .ok_or_else(|| {
                ReleaseKitError::Publish(format!("internal error: '{package}' not in plan"))
            })?
            .clone();

        if self.options.dry_run {
            println!(
                "  [dry-run] {} {} -> {}",
                info.display_name(true),
                bump.from_version,
                bump.to_version
            );
            self.record(&package, PackageStatus::Done)?;
            return Ok(());
        }

        // pinning: rewrite internal deps of this package to their planned
        // versions, scoped to this publish attempt.
        self.record(&package, PackageStatus::Pinning)?;
        let scope = format!("{}/{}", self.run_id, sanitize(&package));
        let session = PinSession::new(&self.root, &scope)?;
        let adapter = EcosystemAdapter::for_ecosystem(info.ecosystem);

        let outcome = self
            .run_states(&package, &info, &bump, adapter, &session)
            .await;

        // restoring: every path out of the machine releases the pins.
        self.record(&package, PackageStatus::Restoring)?;
        let restored = session.restore_all();

        match (outcome, restored) {
            (Ok(()), Ok(())) => {
                self.record(&package, PackageStatus::Done)?;
                Ok(())
            }
            (Err(err), _) => {
                self.record(&package, PackageStatus::Failed)?;
                self.record_error(&package, &err.to_string());
                Err(err)
            }
            (_, Err(err)) => {
                self.record(&package, PackageStatus::Failed)?;
                self.record_error(&package, &err.to_string());
                Err(err)
            }
        }
    }

    async fn run_states(
        &self,
        package: &str,
        info: &crate::types::PackageInfo,
        bump: &VersionBump,
        adapter: EcosystemAdapter,
        session: &Arc<PinSession>,
    ) -> Result<()> {
        let manifest_path = adapter.manifest_path(&info.path);
        for dep in &info.internal_deps {
            let Some(dep_bump) = self.bumps.get(dep) else {
                continue;
            };
            let current = std::fs::read_to_string(&manifest_path)
                .map_err(|e| crate::errors::io_error_with_path(e, &manifest_path))?;
            if let Some(rewritten) =
                adapter.rewrite_dependency_version(&current, dep, &dep_bump.to_version)?
            {
                session.mutate(&manifest_path, &rewritten)?;
            }
        }

        // building
        self.record(package, PackageStatus::Building)?;
        let build_info = info.clone();
        let artifacts = tokio::task::spawn_blocking(move || adapter.build(&build_info))
            .await
            .map_err(|e| ReleaseKitError::Publish(format!("build task failed: {e}")))??;
        {
            let mut state = self.journal.lock().expect("journal state poisoned");
            state.record_artifacts(
                package,
                artifacts.iter().map(|a| a.sha256.clone()).collect(),
            );
            journal::save(&self.root, &state)?;
        }

        // publishing: validate with the ecosystem's dry-run first when the
        // tool supports it; "already exists" counts as success either way.
        self.record(package, PackageStatus::Publishing)?;
        if adapter.supports_publish_dry_run() {
            let validate_info = info.clone();
            tokio::task::spawn_blocking(move || adapter.publish(&validate_info, true, &[]))
                .await
                .map_err(|e| ReleaseKitError::Publish(format!("publish task failed: {e}")))??;
        }
        let publish_info = info.clone();
        tokio::task::spawn_blocking(move || adapter.publish(&publish_info, false, &[]))
            .await
            .map_err(|e| ReleaseKitError::Publish(format!("publish task failed: {e}")))??;

        // polling
        self.record(package, PackageStatus::Polling)?;
        let registry = self.registry_for(info.ecosystem)?;
        poll_available(
            Arc::clone(&registry),
            &info.name,
            &bump.to_version,
            self.options.poll_timeout,
            self.options.poll_interval,
        )
        .await?;

        // verifying: compare the registry artifact against the local build.
        self.record(package, PackageStatus::Verifying)?;
        if let Some(artifact) = artifacts.first() {
            let registry = Arc::clone(&registry);
            let name = info.name.clone();
            let version = bump.to_version.clone();
            let expected = artifact.sha256.clone();
            tokio::task::spawn_blocking(move || {
                registry.verify_checksum(&name, &version, &expected)
            })
            .await
            .map_err(|e| ReleaseKitError::Publish(format!("verify task failed: {e}")))??;
        }

        if self.options.run_hooks {
            run_hook_commands(info, self.hooks_by_package.get(package))?;
        }

        Ok(())
    }
}

/// Smoke-test hooks configured for the package, run in its directory.
fn run_hook_commands(
    info: &crate::types::PackageInfo,
    hooks: Option<&Vec<String>>,
) -> Result<()> {
    let Some(hooks) = hooks else { return Ok(()) };
    for hook in hooks {
        let status = if cfg!(windows) {
            std::process::Command::new("cmd")
                .args(["/C", hook])
                .current_dir(&info.path)
                .status()
        } else {
            std::process::Command::new("sh")
                .args(["-c", hook])
                .current_dir(&info.path)
                .status()
        }
        .map_err(ReleaseKitError::Io)?;
        if !status.success() {
            return Err(ReleaseKitError::Publish(format!(
                "hook '{hook}' failed for {} with status {status}",
                info.name
            )));
        }
    }
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Publish every package in the plan in dependency order.
///
/// On start the previous run journal is consulted: when it describes the
/// same git sha and plan, packages whose target version the registry
/// already reports are seeded as published and their dependents'
/// counters pre-decremented.
#[allow(clippy::too_many_arguments)]
pub async fn run_publish(
    workspace: &Workspace,
    graph: &DependencyGraph,
    plan: &ReleasePlan,
    config: &Config,
    registries: BTreeMap<Ecosystem, Arc<dyn Registry>>,
    git_sha: &str,
    options: PublisherOptions,
    observer: Option<Arc<dyn SchedulerObserver>>,
) -> Result<SchedulerResult> {
    let hash = plan_hash(plan);
    let run_id = format!("run-{}", &hash[..12.min(hash.len())]);

    // Resume: reuse the journal only for the same commit and plan.
    let previous = journal::load(&workspace.root)?
        .filter(|state| journal::matches_run(state, git_sha, &hash));

    let mut already_published: BTreeSet<String> = BTreeSet::new();
    if let Some(previous) = &previous {
        // The registry is authoritative: a package counts as published
        // even when the journal missed the final transition.
        for bump in &plan.bumps {
            let on_registry = registries
                .get(&bump.ecosystem)
                .map(|registry| {
                    registry
                        .check_published(&bump.package, &bump.to_version)
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            if on_registry {
                already_published.insert(bump.package.clone());
            }
        }
    }

    let state = match previous {
        Some(state) => state,
        None => RunState::new(
            &run_id,
            git_sha,
            &hash,
            plan.bumps
                .iter()
                .map(|b| JournalBump {
                    package: b.package.clone(),
                    from: b.from_version.clone(),
                    to: b.to_version.clone(),
                })
                .collect(),
        ),
    };
    journal::save(&workspace.root, &state)?;

    // Scheduler nodes: plan packages with their in-plan internal deps.
    let plan_set: BTreeSet<String> = plan.bumps.iter().map(|b| b.package.clone()).collect();
    let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for name in &plan_set {
        let in_plan: BTreeSet<String> = graph
            .dependencies_of(name)
            .filter(|d| plan_set.contains(*d))
            .map(|d| d.to_string())
            .collect();
        deps.insert(name.clone(), in_plan);
    }

    let mut hooks_by_package = BTreeMap::new();
    if options.run_hooks {
        for member in &workspace.members {
            let overrides = Config::load_package_overrides(&member.path)?;
            hooks_by_package.insert(
                member.name.clone(),
                config.resolved_hooks(None, Some(&overrides)),
            );
        }
    }

    let context = Arc::new(PublishContext {
        root: workspace.root.clone(),
        run_id: run_id.clone(),
        packages: workspace
            .members
            .iter()
            .map(|m| (m.name.clone(), m.clone()))
            .collect(),
        bumps: plan
            .bumps
            .iter()
            .map(|b| (b.package.clone(), b.clone()))
            .collect(),
        registries,
        hooks_by_package,
        options: options.clone(),
        journal: Mutex::new(state),
    });

    let scheduler = match observer {
        Some(observer) => Scheduler::with_observer(
            &deps,
            &already_published,
            options.concurrency,
            options.max_retries,
            observer,
        ),
        None => Scheduler::new(
            &deps,
            &already_published,
            options.concurrency,
            options.max_retries,
        ),
    };
    let scheduler = Arc::new(scheduler);

    install_signal_cancel(Arc::clone(&scheduler));

    let run_context = Arc::clone(&context);
    let result = scheduler
        .run(move |package| {
            let context = Arc::clone(&run_context);
            context.publish_one(package)
        })
        .await;

    if scheduler.is_cancelled() {
        // Belt and braces: every live pin session restores before exit.
        crate::pin::restore_all_registered()?;
    }

    if result.is_clean() && !options.dry_run {
        journal::clear(&workspace.root)?;
    }

    Ok(result)
}

/// Signal handling: the handler only requests cancellation; restoration
/// runs on the loop (and in `Drop` as a last resort).
fn install_signal_cancel(scheduler: Arc<Scheduler>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        for kind in [
            SignalKind::interrupt(),
            SignalKind::terminate(),
            SignalKind::hangup(),
        ] {
            let scheduler = Arc::clone(&scheduler);
            if let Ok(mut stream) = signal(kind) {
                tokio::spawn(async move {
                    stream.recv().await;
                    scheduler.cancel();
                });
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                scheduler.cancel();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PackageInfo;
    use serial_test::serial;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubRegistry {
        published: Mutex<BTreeSet<(String, String)>>,
        checks: AtomicUsize,
    }

    impl StubRegistry {
        fn new(published: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                published: Mutex::new(
                    published
                        .iter()
                        .map(|(n, v)| (n.to_string(), v.to_string()))
                        .collect(),
                ),
                checks: AtomicUsize::new(0),
            })
        }
    }

    impl Registry for StubRegistry {
        fn check_published(&self, name: &str, version: &str) -> Result<bool> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .published
                .lock()
                .unwrap()
                .contains(&(name.to_string(), version.to_string())))
        }
        fn latest_version(&self, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }
        fn verify_checksum(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
    }

    struct StubVcs {
        clean: bool,
        shallow: bool,
    }

    impl Vcs for StubVcs {
        fn is_clean(&self) -> Result<bool> {
            Ok(self.clean)
        }
        fn is_shallow(&self) -> Result<bool> {
            Ok(self.shallow)
        }
        fn current_sha(&self) -> Result<String> {
            Ok("stub-sha".into())
        }
        fn current_branch(&self) -> Result<String> {
            Ok("main".into())
        }
        fn log(
            &self,
            _: Option<&str>,
            _: &[PathBuf],
        ) -> Result<Vec<crate::commits::Commit>> {
            Ok(vec![])
        }
        fn diff(&self, _: &str) -> Result<Vec<PathBuf>> {
            Ok(vec![])
        }
        fn commit(&self, _: &[PathBuf], _: &str) -> Result<String> {
            Ok("stub-sha".into())
        }
        fn tag(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn tag_exists(&self, _: &str) -> Result<bool> {
            Ok(false)
        }
        fn list_tags(&self, _: Option<&str>) -> Result<Vec<String>> {
            Ok(vec![])
        }
        fn push(&self, _: &str, _: bool) -> Result<()> {
            Ok(())
        }
        fn checkout(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn cherry_pick(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn make_workspace(root: &Path, names: &[(&str, &[&str])]) -> Workspace {
        Workspace {
            root: root.to_path_buf(),
            members: names
                .iter()
                .map(|(name, deps)| PackageInfo {
                    name: name.to_string(),
                    identifier: PackageInfo::dependency_identifier(Ecosystem::Cargo, name),
                    version: "1.0.0".to_string(),
                    path: root.join(name),
                    internal_deps: deps.iter().map(|s| s.to_string()).collect(),
                    ecosystem: Ecosystem::Cargo,
                    group: None,
                })
                .collect(),
        }
    }

    fn make_plan(workspace: &Workspace) -> ReleasePlan {
        ReleasePlan {
            bumps: workspace
                .members
                .iter()
                .map(|m| VersionBump {
                    package: m.name.clone(),
                    identifier: m.identifier.clone(),
                    ecosystem: m.ecosystem,
                    from_version: "1.0.0".into(),
                    to_version: "1.1.0".into(),
                    kind: crate::types::Bump::Minor,
                    reason: crate::types::BumpReason::Direct,
                    commits: vec![],
                })
                .collect(),
        }
    }

    #[test]
    fn preflight_flags_dirty_and_empty() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = make_workspace(temp.path(), &[("core", &[])]);
        let vcs = StubVcs {
            clean: false,
            shallow: true,
        };
        let findings =
            run_preflight(&vcs, Some(true), &workspace, &ReleasePlan::default()).unwrap();
        let codes: Vec<&str> = findings.iter().map(|f| f.code).collect();
        assert!(codes.contains(&"RK-DIRTY"));
        assert!(codes.contains(&"RK-SHALLOW"));
        assert!(codes.contains(&"RK-EMPTY"));
    }

    #[test]
    fn preflight_flags_cycles() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = make_workspace(temp.path(), &[("a", &["b"]), ("b", &["a"])]);
        let vcs = StubVcs {
            clean: true,
            shallow: false,
        };
        let plan = make_plan(&workspace);
        let findings = run_preflight(&vcs, None, &workspace, &plan).unwrap();
        assert!(findings.iter().any(|f| f.code == "RK-CYCLE"));
    }

    #[test]
    fn preflight_clean_run_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = make_workspace(temp.path(), &[("core", &[])]);
        let vcs = StubVcs {
            clean: true,
            shallow: false,
        };
        let plan = make_plan(&workspace);
        let findings = run_preflight(&vcs, Some(true), &workspace, &plan).unwrap();
        assert!(findings.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn dry_run_publishes_nothing_and_reports_done() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = make_workspace(temp.path(), &[("core", &[]), ("app", &["core"])]);
        let graph = DependencyGraph::build(&workspace).unwrap();
        let plan = make_plan(&workspace);
        let registry = StubRegistry::new(&[]);
        let mut registries: BTreeMap<Ecosystem, Arc<dyn Registry>> = BTreeMap::new();
        registries.insert(Ecosystem::Cargo, registry.clone());

        let options = PublisherOptions {
            concurrency: 2,
            max_retries: 0,
            poll_interval: Duration::from_millis(10),
            poll_timeout: Duration::from_millis(100),
            dry_run: true,
            run_hooks: false,
        };
        let result = run_publish(
            &workspace,
            &graph,
            &plan,
            &Config::default(),
            registries,
            "sha-1",
            options,
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.done.len(), 2);
        assert!(result.is_clean());
        // No registry traffic in dry-run.
        assert_eq!(registry.checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    #[serial]
    async fn resume_skips_packages_present_on_registry() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = make_workspace(temp.path(), &[("core", &[]), ("app", &["core"])]);
        let graph = DependencyGraph::build(&workspace).unwrap();
        let plan = make_plan(&workspace);
        let hash = plan_hash(&plan);

        // A prior run journal for the same sha and plan, core mid-publish.
        let mut previous = RunState::new(
            "run-old",
            "sha-1",
            &hash,
            plan.bumps
                .iter()
                .map(|b| JournalBump {
                    package: b.package.clone(),
                    from: b.from_version.clone(),
                    to: b.to_version.clone(),
                })
                .collect(),
        );
        previous.record("core", PackageStatus::Publishing);
        journal::save(temp.path(), &previous).unwrap();

        // The registry already has core@1.1.0.
        let registry = StubRegistry::new(&[("core", "1.1.0")]);
        let mut registries: BTreeMap<Ecosystem, Arc<dyn Registry>> = BTreeMap::new();
        registries.insert(Ecosystem::Cargo, registry);

        let options = PublisherOptions {
            concurrency: 2,
            max_retries: 0,
            poll_interval: Duration::from_millis(10),
            poll_timeout: Duration::from_millis(100),
            dry_run: true,
            run_hooks: false,
        };
        let result = run_publish(
            &workspace,
            &graph,
            &plan,
            &Config::default(),
            registries,
            "sha-1",
            options,
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.skipped, vec!["core"]);
        assert_eq!(result.done, vec!["app"]);
    }

    #[tokio::test]
    #[serial]
    async fn journal_from_other_sha_starts_fresh() {
        let temp = tempfile::tempdir().unwrap();
        let workspace = make_workspace(temp.path(), &[("core", &[])]);
        let graph = DependencyGraph::build(&workspace).unwrap();
        let plan = make_plan(&workspace);

        let previous = RunState::new("run-old", "other-sha", "other-hash", vec![]);
        journal::save(temp.path(), &previous).unwrap();

        let registry = StubRegistry::new(&[("core", "1.1.0")]);
        let mut registries: BTreeMap<Ecosystem, Arc<dyn Registry>> = BTreeMap::new();
        registries.insert(Ecosystem::Cargo, registry);

        let options = PublisherOptions {
            concurrency: 1,
            max_retries: 0,
            poll_interval: Duration::from_millis(10),
            poll_timeout: Duration::from_millis(100),
            dry_run: true,
            run_hooks: false,
        };
        let result = run_publish(
            &workspace,
            &graph,
            &plan,
            &Config::default(),
            registries,
            "sha-1",
            options,
            None,
        )
        .await
        .unwrap();

        // Mismatched journal does not seed skips.
        assert!(result.skipped.is_empty());
        assert_eq!(result.done, vec!["core"]);
    }
}
