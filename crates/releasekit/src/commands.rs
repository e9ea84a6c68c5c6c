use crate::cli::{Cli, PlanArgs, PromoteArgs, PublishArgs, PublishFrom, SnapshotArgs};
use releasekit_core::backends::git::GitCli;
use releasekit_core::backends::github::GitHubForge;
use releasekit_core::backends::registry::HttpRegistry;
use releasekit_core::backends::{Forge, PrState, Registry, Vcs};
use releasekit_core::release_pr::{self, PrManifest, TAGGED_LABEL};
use releasekit_core::{
    Bump, BumpReason, Config, DependencyGraph, Discovery, Ecosystem, EcosystemAdapter,
    NodeState, PackageFilter, PlanInputs, ProcessLock, PublisherOptions, ReleaseKitError,
    ReleasePlan, Result, SchedulerObserver, VersionBump, build_plan, collect_inputs, discover,
    plan_hash, run_preflight, run_prepare, scheme_by_name,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

pub struct Context {
    pub root: PathBuf,
    pub config: Config,
    pub discovery: Discovery,
    pub graph: DependencyGraph,
    pub vcs: GitCli,
}

pub fn load_context() -> Result<Context> {
    let root = std::env::current_dir().map_err(ReleaseKitError::Io)?;
    let config = Config::load(&root)?;
    let discovery = discover(&root, &config)?;
    let graph = DependencyGraph::build(&discovery.workspace)?;
    let vcs = GitCli::new(&root);
    Ok(Context {
        root,
        config,
        discovery,
        graph,
        vcs,
    })
}

fn package_filter(cli: &Cli) -> PackageFilter {
    PackageFilter {
        groups: cli.group.clone(),
        packages: cli.package.clone(),
        excludes: cli.exclude.clone(),
    }
}

/// Compute the plan for the current window, restricted by CLI filters.
fn compute_plan(cli: &Cli, ctx: &Context, force_unchanged: bool) -> Result<(ReleasePlan, PlanInputs)> {
    let mut inputs = collect_inputs(
        &ctx.vcs,
        &ctx.discovery.workspace,
        &ctx.config,
        ctx.discovery.label_by_package.clone(),
    )?;
    inputs.force_unchanged = force_unchanged;

    let mut plan = build_plan(&ctx.discovery.workspace, &ctx.graph, &ctx.config, &inputs)?;

    let filter = package_filter(cli);
    if !filter.is_empty() {
        let selected = filter.select(&ctx.discovery.workspace, &ctx.graph)?;
        plan.bumps.retain(|b| selected.contains(&b.package));
    }
    if !cli.workspace.is_empty() {
        plan.bumps.retain(|b| {
            ctx.discovery
                .label_by_package
                .get(&b.package)
                .map(|label| cli.workspace.contains(label))
                .unwrap_or(false)
        });
    }

    Ok((plan, inputs))
}

fn print_plan(plan: &ReleasePlan, quiet: bool) {
    if quiet {
        return;
    }
    println!("Planned releases:");
    for bump in &plan.bumps {
        println!(
            "  {}: {} -> {} ({}, {:?})",
            bump.package, bump.from_version, bump.to_version, bump.kind, bump.reason
        );
    }
}

fn forge_for(config: &Config) -> Option<GitHubForge> {
    if config.forge != "github" {
        eprintln!(
            "Warning: forge '{}' has no backend; PR operations are skipped",
            config.forge
        );
        return None;
    }
    let (Some(owner), Some(repo)) = (config.repo_owner.as_deref(), config.repo_name.as_deref())
    else {
        eprintln!("Warning: repo_owner/repo_name not configured; PR operations are skipped");
        return None;
    };
    match GitHubForge::new(owner, repo) {
        Ok(forge) => Some(forge),
        Err(e) => {
            eprintln!("Warning: {e}; PR operations are skipped");
            None
        }
    }
}

fn registries_for(workspace_members: &[releasekit_core::PackageInfo]) -> Result<BTreeMap<Ecosystem, Arc<dyn Registry>>> {
    let mut registries: BTreeMap<Ecosystem, Arc<dyn Registry>> = BTreeMap::new();
    let ecosystems: BTreeSet<Ecosystem> =
        workspace_members.iter().map(|m| m.ecosystem).collect();
    for ecosystem in ecosystems {
        registries.insert(ecosystem, Arc::new(HttpRegistry::new(ecosystem, None)?));
    }
    Ok(registries)
}

struct PrintObserver;

impl SchedulerObserver for PrintObserver {
    fn on_state_change(&self, package: &str, state: NodeState) {
        println!("  {package}: {state:?}");
    }
    fn on_retry(&self, package: &str, attempt: u32, delay: std::time::Duration) {
        println!("  {package}: retry {attempt} in {delay:?}");
    }
}

pub fn cmd_init() -> Result<()> {
    let root = std::env::current_dir().map_err(ReleaseKitError::Io)?;
    let path = root.join("releasekit.toml");
    if path.exists() {
        println!("releasekit.toml already exists at {}", path.display());
        return Ok(());
    }
    let starter = "\
# ReleaseKit configuration. See the README for every key.
forge = \"github\"
# repo_owner = \"acme\"
# repo_name = \"monorepo\"
default_branch = \"main\"
tag_format = \"{name}-v{version}\"
release_mode = \"pr\"
versioning_scheme = \"semver\"

# [workspace.rust]
# ecosystem = \"cargo\"
# root = \".\"
";
    std::fs::write(&path, starter)?;
    println!("Created {}", path.display());
    Ok(())
}

pub fn cmd_discover(ctx: &Context) -> Result<()> {
    for member in &ctx.discovery.workspace.members {
        let deps: Vec<&str> = member.internal_deps.iter().map(String::as_str).collect();
        println!(
            "{} {} ({})\n  path: {}\n  internal deps: {}",
            member.name,
            if member.version.is_empty() {
                "(tag-versioned)"
            } else {
                &member.version
            },
            member.ecosystem.display_name(),
            member.path.display(),
            if deps.is_empty() {
                "-".to_string()
            } else {
                deps.join(", ")
            }
        );
    }
    Ok(())
}

pub fn cmd_graph(ctx: &Context) -> Result<()> {
    for name in ctx.graph.topo_order() {
        let level = ctx.graph.level(&name).unwrap_or(0);
        println!("{}{} (level {level})", "  ".repeat(level), name);
    }
    Ok(())
}

pub fn cmd_check(cli: &Cli, ctx: &Context) -> Result<()> {
    let (plan, _) = compute_plan(cli, ctx, false)?;
    let forge = forge_for(&ctx.config);
    let forge_available = forge.as_ref().map(|f| f.is_available().unwrap_or(false));
    let findings = run_preflight(&ctx.vcs, forge_available, &ctx.discovery.workspace, &plan)?;
    if findings.is_empty() {
        println!("All pre-flight checks passed.");
        return Ok(());
    }
    for finding in &findings {
        eprintln!("{}: {}\n  hint: {}", finding.code, finding.summary, finding.remediation);
    }
    Err(ReleaseKitError::Release(format!(
        "{} pre-flight check(s) failed",
        findings.len()
    )))
}

pub fn cmd_plan(cli: &Cli, ctx: &Context, args: &PlanArgs) -> Result<()> {
    let (plan, _) = compute_plan(cli, ctx, args.force_unchanged)?;
    if plan.is_empty() {
        return Err(ReleaseKitError::NothingToRelease);
    }
    print_plan(&plan, cli.quiet);
    if cli.verbose {
        println!("plan hash: {}", plan_hash(&plan));
    }
    Ok(())
}

pub fn cmd_version(cli: &Cli, ctx: &Context, args: &PlanArgs) -> Result<()> {
    let (plan, inputs) = compute_plan(cli, ctx, args.force_unchanged)?;
    print_plan(&plan, cli.quiet);
    // Apply bumps and changelogs locally; no PR, no push.
    run_prepare(
        &ctx.discovery.workspace,
        &plan,
        &ctx.config,
        &ctx.discovery.label_by_package,
        &inputs.commits_by_package,
        &ctx.vcs,
        None,
        cli.dry_run,
    )?;
    Ok(())
}

pub fn cmd_prepare(cli: &Cli, ctx: &Context, args: &PlanArgs) -> Result<()> {
    let (plan, inputs) = compute_plan(cli, ctx, args.force_unchanged)?;
    print_plan(&plan, cli.quiet);

    // Continuous mode collapses prepare + release + publish: no Release
    // PR, tags created directly from the current branch.
    if ctx.config.release_mode == releasekit_core::ReleaseMode::Continuous {
        let outcome = run_prepare(
            &ctx.discovery.workspace,
            &plan,
            &ctx.config,
            &ctx.discovery.label_by_package,
            &inputs.commits_by_package,
            &ctx.vcs,
            None,
            cli.dry_run,
        )?;
        if !cli.dry_run {
            for package in &outcome.manifest.packages {
                if ctx.vcs.tag_exists(&package.tag)? {
                    continue;
                }
                ctx.vcs
                    .tag(&package.tag, &format!("Release {} {}", package.name, package.to))?;
                ctx.vcs.push(&package.tag, false)?;
            }
            if let Some(umbrella) = &outcome.manifest.umbrella {
                if !ctx.vcs.tag_exists(umbrella)? {
                    ctx.vcs.tag(umbrella, &format!("Release {umbrella}"))?;
                    ctx.vcs.push(umbrella, false)?;
                }
            }
            let _lock = ProcessLock::acquire(
                &ctx.root,
                "prepare (continuous)",
                releasekit_core::DEFAULT_STALE_AFTER,
                cli.force_lock || cli.force,
            )?;
            publish_plan(cli, ctx, &plan, None, None, false)?;
        }
        return Ok(());
    }

    let forge = forge_for(&ctx.config);
    let outcome = run_prepare(
        &ctx.discovery.workspace,
        &plan,
        &ctx.config,
        &ctx.discovery.label_by_package,
        &inputs.commits_by_package,
        &ctx.vcs,
        forge.as_ref().map(|f| f as &dyn Forge),
        cli.dry_run,
    )?;
    if let Some(pr) = outcome.pr {
        println!("Release PR: {}", pr.url);
    } else if !cli.dry_run {
        println!("Release prepared locally (no forge configured).");
    }
    Ok(())
}

pub fn cmd_release(cli: &Cli, ctx: &Context) -> Result<()> {
    let forge = forge_for(&ctx.config).ok_or_else(|| {
        ReleaseKitError::Forge("the release step requires a configured forge".into())
    })?;
    let outcome = release_pr::run_release(&ctx.vcs, &forge, cli.dry_run)?;
    for tag in &outcome.created_tags {
        println!("Created tag {tag}");
    }
    for tag in &outcome.existing_tags {
        println!("Tag {tag} already exists; left unchanged");
    }
    Ok(())
}

/// Reconstruct a publishable plan from the embedded PR manifest.
pub fn plan_from_manifest(
    manifest: &PrManifest,
    workspace: &releasekit_core::Workspace,
) -> Result<ReleasePlan> {
    let mut bumps = Vec::new();
    for package in &manifest.packages {
        let member = workspace.find_by_name(&package.name).ok_or_else(|| {
            ReleaseKitError::Release(format!(
                "manifest names '{}' but the workspace does not contain it",
                package.name
            ))
        })?;
        bumps.push(VersionBump {
            package: package.name.clone(),
            identifier: member.identifier.clone(),
            ecosystem: member.ecosystem,
            from_version: package.from.clone(),
            to_version: package.to.clone(),
            kind: Bump::Patch,
            reason: BumpReason::Direct,
            commits: vec![],
        });
    }
    Ok(ReleasePlan { bumps })
}

pub fn cmd_publish(cli: &Cli, ctx: &Context, args: &PublishArgs) -> Result<()> {
    let _lock = ProcessLock::acquire(
        &ctx.root,
        "publish",
        releasekit_core::DEFAULT_STALE_AFTER,
        cli.force_lock || cli.force,
    )?;

    let forge = forge_for(&ctx.config);
    let mut pr_handle = None;

    let plan = match (args.publish_from, forge.as_ref()) {
        (PublishFrom::Ci, Some(forge)) => {
            let tagged = forge.list_prs(Some(TAGGED_LABEL), PrState::Merged)?;
            let pr = tagged.first().ok_or_else(|| {
                ReleaseKitError::NotFound(format!(
                    "no merged pull request carries the '{TAGGED_LABEL}' label"
                ))
            })?;
            let body = forge.get_pr_body(pr)?;
            let manifest = PrManifest::extract(&body)?;
            if let Some(sha) = &manifest.commit_sha {
                ctx.vcs.checkout(sha)?;
            }
            pr_handle = Some(pr.clone());
            plan_from_manifest(&manifest, &ctx.discovery.workspace)?
        }
        _ => {
            let (plan, _) = compute_plan(cli, ctx, false)?;
            plan
        }
    };

    if plan.is_empty() {
        return Err(ReleaseKitError::NothingToRelease);
    }
    print_plan(&plan, cli.quiet);

    publish_plan(
        cli,
        ctx,
        &plan,
        forge.as_ref(),
        pr_handle.as_ref(),
        args.run_hooks,
    )
}

/// Shared tail of the publish flows: preflight, scheduler run, report,
/// and post-publish labelling.
fn publish_plan(
    cli: &Cli,
    ctx: &Context,
    plan: &ReleasePlan,
    forge: Option<&GitHubForge>,
    pr_handle: Option<&releasekit_core::PrHandle>,
    run_hooks: bool,
) -> Result<()> {
    let forge_available = forge.map(|f| f.is_available().unwrap_or(false));
    let findings = run_preflight(&ctx.vcs, forge_available, &ctx.discovery.workspace, plan)?;
    let findings = if cli.force {
        for finding in &findings {
            eprintln!("Warning ({}): {} (--force)", finding.code, finding.summary);
        }
        Vec::new()
    } else {
        findings
    };
    if !findings.is_empty() {
        for finding in &findings {
            eprintln!(
                "{}: {}\n  hint: {}",
                finding.code, finding.summary, finding.remediation
            );
        }
        return Err(ReleaseKitError::Publish("pre-flight checks failed".into()));
    }

    let registries = registries_for(&ctx.discovery.workspace.members)?;
    let mut options = PublisherOptions::from_config(&ctx.config);
    options.dry_run = cli.dry_run;
    options.run_hooks = run_hooks;
    if let Some(concurrency) = cli.concurrency {
        options.concurrency = concurrency;
    }
    if let Some(max_retries) = cli.max_retries {
        options.max_retries = max_retries;
    }
    let observer: Option<Arc<dyn SchedulerObserver>> = if cli.verbose {
        Some(Arc::new(PrintObserver))
    } else {
        None
    };

    let git_sha = ctx.vcs.current_sha()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ReleaseKitError::Io)?;
    let result = runtime.block_on(releasekit_core::run_publish(
        &ctx.discovery.workspace,
        &ctx.graph,
        plan,
        &ctx.config,
        registries,
        &git_sha,
        options,
        observer,
    ))?;

    if !cli.quiet {
        for name in &result.skipped {
            println!("Skipped {name} (already on registry)");
        }
        for name in &result.done {
            println!("Published {name}");
        }
        for (name, error) in &result.failed {
            eprintln!("Failed {name}: {error}");
        }
        for (name, blocked_by) in &result.blocked {
            eprintln!("Blocked {name} (by {blocked_by})");
        }
    }

    if let (Some(forge), Some(pr)) = (forge, pr_handle) {
        let ecosystems: BTreeMap<String, Ecosystem> = ctx
            .discovery
            .workspace
            .members
            .iter()
            .map(|m| (m.name.clone(), m.ecosystem))
            .collect();
        release_pr::apply_publish_labels(forge, pr, &result, &ecosystems)?;
        if !cli.dry_run {
            let payload = serde_json::json!({
                "published": result.done,
                "skipped": result.skipped,
                "failed": result.failed.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            });
            forge.repository_dispatch("releasekit-published", &payload)?;
        }
    }

    if !result.failed.is_empty() || !result.blocked.is_empty() {
        return Err(ReleaseKitError::Publish(format!(
            "{} package(s) failed, {} blocked",
            result.failed.len(),
            result.blocked.len()
        )));
    }
    if !result.cancelled.is_empty() {
        return Err(ReleaseKitError::Cancelled(format!(
            "{} package(s) were not published",
            result.cancelled.len()
        )));
    }
    Ok(())
}

pub fn cmd_rollback(ctx: &Context) -> Result<()> {
    let restored = releasekit_core::pin::restore_from_disk(&ctx.root)?;
    if restored > 0 {
        println!("Restored {restored} pinned manifest(s) from backups.");
    }
    releasekit_core::journal::clear(&ctx.root)?;
    if ProcessLock::is_locked(&ctx.root) {
        if let Ok(info) = ProcessLock::read_info(&ctx.root) {
            println!("Removing lock held by pid {} on {}", info.pid, info.hostname);
        }
        std::fs::remove_file(ProcessLock::lock_path(&ctx.root)).map_err(ReleaseKitError::Io)?;
    }
    println!("Workspace state reset.");
    Ok(())
}

pub fn cmd_promote(cli: &Cli, ctx: &Context, args: &PromoteArgs) -> Result<()> {
    let mut promoted = 0;
    for member in &ctx.discovery.workspace.members {
        if !args.packages.is_empty() && !args.packages.contains(&member.name) {
            continue;
        }
        if member.version.is_empty() {
            continue;
        }
        let label = ctx
            .discovery
            .label_by_package
            .get(&member.name)
            .map(String::as_str);
        let scheme = scheme_by_name(&ctx.config.resolved_scheme(label, None))?;
        let stable = scheme
            .strip_prerelease(&member.version)
            .map_err(ReleaseKitError::InvalidData)?;
        if stable == member.version {
            continue;
        }
        println!("{}: {} -> {}", member.name, member.version, stable);
        if !cli.dry_run {
            rewrite_member_version(member, &stable)?;
        }
        promoted += 1;
    }
    if promoted == 0 {
        println!("No pre-release versions to promote.");
    }
    Ok(())
}

pub fn cmd_snapshot(cli: &Cli, ctx: &Context, args: &SnapshotArgs) -> Result<()> {
    let mut snapshotted = 0;
    for member in &ctx.discovery.workspace.members {
        if !args.packages.is_empty() && !args.packages.contains(&member.name) {
            continue;
        }
        if member.version.is_empty() {
            continue;
        }
        let label = ctx
            .discovery
            .label_by_package
            .get(&member.name)
            .map(String::as_str);
        let scheme = scheme_by_name(&ctx.config.resolved_scheme(label, None))?;
        let next = scheme
            .with_prerelease(&member.version, &args.label)
            .map_err(ReleaseKitError::InvalidData)?;
        println!("{}: {} -> {}", member.name, member.version, next);
        if !cli.dry_run {
            rewrite_member_version(member, &next)?;
        }
        snapshotted += 1;
    }
    if snapshotted == 0 {
        return Err(ReleaseKitError::NothingToRelease);
    }
    Ok(())
}

fn rewrite_member_version(member: &releasekit_core::PackageInfo, version: &str) -> Result<()> {
    let adapter = EcosystemAdapter::for_ecosystem(member.ecosystem);
    let manifest_path = adapter.manifest_path(&member.path);
    let current = std::fs::read_to_string(&manifest_path).map_err(ReleaseKitError::Io)?;
    let rewritten = adapter.rewrite_version(&current, version)?;
    if rewritten != current {
        std::fs::write(&manifest_path, rewritten).map_err(ReleaseKitError::Io)?;
    }
    Ok(())
}

pub fn cmd_should_release(cli: &Cli, ctx: &Context) -> Result<()> {
    let (plan, _) = compute_plan(cli, ctx, false)?;
    if plan.is_empty() {
        return Err(ReleaseKitError::NothingToRelease);
    }
    println!("{} package(s) have releasable changes.", plan.bumps.len());
    Ok(())
}

pub fn cmd_migrate() -> Result<()> {
    let root = std::env::current_dir().map_err(ReleaseKitError::Io)?;
    let legacy = root.join(".releasekit.toml");
    let target = root.join("releasekit.toml");
    if !legacy.exists() {
        println!("No legacy configuration found; nothing to migrate.");
        return Ok(());
    }
    if target.exists() {
        return Err(ReleaseKitError::Config(
            "both .releasekit.toml and releasekit.toml exist; remove one".into(),
        ));
    }
    std::fs::rename(&legacy, &target).map_err(ReleaseKitError::Io)?;
    // Validate the migrated file parses.
    Config::load(&root)?;
    println!("Moved {} to {}", legacy.display(), target.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use releasekit_core::{PackageInfo, Workspace};

    #[test]
    fn plan_from_manifest_maps_members() {
        let workspace = Workspace {
            root: PathBuf::from("/repo"),
            members: vec![PackageInfo {
                name: "core".into(),
                identifier: "cargo:core".into(),
                version: "1.0.0".into(),
                path: PathBuf::from("/repo/core"),
                internal_deps: Default::default(),
                ecosystem: Ecosystem::Cargo,
                group: None,
            }],
        };
        let manifest = PrManifest {
            version_manifest_version: 1,
            packages: vec![releasekit_core::release_pr::ManifestPackage {
                name: "core".into(),
                from: "1.0.0".into(),
                to: "1.1.0".into(),
                tag: "core-v1.1.0".into(),
            }],
            umbrella: None,
            commit_sha: None,
        };
        let plan = plan_from_manifest(&manifest, &workspace).unwrap();
        assert_eq!(plan.bumps.len(), 1);
        assert_eq!(plan.bumps[0].to_version, "1.1.0");
        assert_eq!(plan.bumps[0].ecosystem, Ecosystem::Cargo);
    }

    #[test]
    fn plan_from_manifest_rejects_unknown_package() {
        let workspace = Workspace {
            root: PathBuf::from("/repo"),
            members: vec![],
        };
        let manifest = PrManifest {
            version_manifest_version: 1,
            packages: vec![releasekit_core::release_pr::ManifestPackage {
                name: "ghost".into(),
                from: "1.0.0".into(),
                to: "1.1.0".into(),
                tag: "ghost-v1.1.0".into(),
            }],
            umbrella: None,
            commit_sha: None,
        };
        assert!(plan_from_manifest(&manifest, &workspace).is_err());
    }
}
