use crate::backends::Vcs;
use crate::backends::git::last_release_tag;
use crate::commits::Commit;
use crate::config::Config;
use crate::errors::{ReleaseKitError, Result};
use crate::graph::DependencyGraph;
use crate::types::{Bump, BumpReason, ReleasePlan, VersionBump, Workspace};
use crate::versioning::scheme_by_name;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Per-package inputs to the version engine.
#[derive(Debug, Clone, Default)]
pub struct PlanInputs {
    /// Release-window commits per package, newest first.
    pub commits_by_package: BTreeMap<String, Vec<Commit>>,
    /// Current version per package where the manifest does not carry one
    /// (Go: resolved from the newest matching tag).
    pub tag_versions: BTreeMap<String, String>,
    /// Workspace label per package, for tiered key resolution.
    pub label_by_package: BTreeMap<String, String>,
    pub force_unchanged: bool,
}

/// Collect the release-window commits for every package:
/// `log(since_tag = last_tag(package), paths = [package directory])`.
pub fn collect_inputs(
    vcs: &dyn Vcs,
    workspace: &Workspace,
    config: &Config,
    label_by_package: BTreeMap<String, String>,
) -> Result<PlanInputs> {
    let mut commits_by_package = BTreeMap::new();
    let mut tag_versions = BTreeMap::new();

    for member in &workspace.members {
        let overrides = Config::load_package_overrides(&member.path)?;
        let label = label_by_package.get(&member.name).map(String::as_str);
        let tag_format = config.resolved_tag_format(label, Some(&overrides));

        let last_tag = last_release_tag(vcs, &tag_format, &member.name)?;
        if member.version.is_empty() {
            if let Some(tag) = &last_tag {
                let prefix = tag_format
                    .replace("{name}", &member.name)
                    .find("{version}")
                    .unwrap_or(0);
                let version = tag.get(prefix..).unwrap_or_default().to_string();
                tag_versions.insert(member.name.clone(), version);
            }
        }

        let rel_path = member
            .path
            .strip_prefix(&workspace.root)
            .unwrap_or(&member.path)
            .to_path_buf();
        let since = last_tag.as_deref().or(config.bootstrap_sha.as_deref());
        let commits = vcs.log(since, &[rel_path])?;
        commits_by_package.insert(member.name.clone(), commits);
    }

    Ok(PlanInputs {
        commits_by_package,
        tag_versions,
        label_by_package,
        force_unchanged: false,
    })
}

/// Phase 1: direct bump per package from its commit window.
///
/// Per-kind counters are walked over the window; a revert decrements the
/// counter of the commit it reverts when that commit is inside the same
/// window, and is ignored otherwise. The direct bump is the highest kind
/// with a positive counter.
pub fn direct_bump(commits: &[Commit]) -> (Bump, Vec<String>) {
    let mut cancelled: BTreeSet<usize> = BTreeSet::new();

    for (idx, commit) in commits.iter().enumerate() {
        if !commit.is_revert {
            continue;
        }
        let target = commits.iter().enumerate().position(|(other_idx, other)| {
            if other_idx == idx || other.is_revert || cancelled.contains(&other_idx) {
                return false;
            }
            if let Some(sha) = &commit.reverts_sha {
                if other.sha.starts_with(sha.as_str()) || sha.starts_with(&other.sha) {
                    return true;
                }
            }
            commit.reverted_subject().as_deref() == Some(other.subject.as_str())
        });
        if let Some(target_idx) = target {
            cancelled.insert(target_idx);
        }
    }

    let mut counters: BTreeMap<Bump, u32> = BTreeMap::new();
    let mut contributing = Vec::new();
    for (idx, commit) in commits.iter().enumerate() {
        if cancelled.contains(&idx) {
            continue;
        }
        let bump = commit.bump();
        if bump == Bump::None {
            continue;
        }
        *counters.entry(bump).or_insert(0) += 1;
        contributing.push(commit.short_sha().to_string());
    }

    let kind = [Bump::Major, Bump::Minor, Bump::Patch]
        .into_iter()
        .find(|kind| counters.get(kind).copied().unwrap_or(0) > 0)
        .unwrap_or(Bump::None);

    (kind, contributing)
}

/// Build the release plan: direct bumps, transitive patch propagation,
/// synchronize mode, and scheme application.
pub fn build_plan(
    workspace: &Workspace,
    graph: &DependencyGraph,
    config: &Config,
    inputs: &PlanInputs,
) -> Result<ReleasePlan> {
    // Phase 1 — direct bumps.
    let mut kind_by_package: BTreeMap<String, (Bump, BumpReason, Vec<String>)> = BTreeMap::new();
    for member in &workspace.members {
        let commits = inputs
            .commits_by_package
            .get(&member.name)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let (kind, shas) = direct_bump(commits);
        if kind != Bump::None {
            kind_by_package.insert(member.name.clone(), (kind, BumpReason::Direct, shas));
        } else if inputs.force_unchanged {
            kind_by_package.insert(member.name.clone(), (Bump::Patch, BumpReason::Forced, vec![]));
        }
    }

    // Phase 2 — transitive propagation: any direct bump induces patch on
    // dependents, never more. BFS along reverse internal edges.
    let mut queue: VecDeque<String> = kind_by_package.keys().cloned().collect();
    let mut seen: BTreeSet<String> = queue.iter().cloned().collect();
    while let Some(changed) = queue.pop_front() {
        for dependent in graph.dependents_of(&changed) {
            kind_by_package
                .entry(dependent.to_string())
                .or_insert((Bump::Patch, BumpReason::Transitive, vec![]));
            if seen.insert(dependent.to_string()) {
                queue.push_back(dependent.to_string());
            }
        }
    }

    if kind_by_package.is_empty() {
        return Ok(ReleasePlan::default());
    }

    // Phase 3 — synchronize mode. Each workspace section (each ecosystem's
    // graph) synchronizes independently.
    let sync_groups = synchronize_groups(workspace, config, inputs);
    for group in sync_groups {
        let max_kind = group
            .iter()
            .filter_map(|name| kind_by_package.get(name.as_str()))
            .map(|(kind, _, _)| *kind)
            .max();
        let Some(max_kind) = max_kind else { continue };
        for name in &group {
            kind_by_package
                .entry(name.clone())
                .and_modify(|entry| {
                    if entry.0 < max_kind {
                        entry.0 = max_kind;
                    }
                })
                .or_insert((max_kind, BumpReason::Synchronize, vec![]));
        }
    }

    // Phase 4 — scheme application.
    let mut bumps = Vec::new();
    for member in &workspace.members {
        let Some((kind, reason, commits)) = kind_by_package.get(&member.name) else {
            continue;
        };
        let label = inputs.label_by_package.get(&member.name).map(String::as_str);
        let overrides = Config::load_package_overrides(&member.path)?;
        let scheme = scheme_by_name(&config.resolved_scheme(label, Some(&overrides)))?;

        let from_version = if member.version.is_empty() {
            inputs
                .tag_versions
                .get(&member.name)
                .cloned()
                .unwrap_or_else(|| "0.0.0".to_string())
        } else {
            member.version.clone()
        };

        let to_version = scheme.bump(&from_version, *kind).map_err(|e| {
            ReleaseKitError::Release(format!("cannot bump {}: {e}", member.name))
        })?;

        bumps.push(VersionBump {
            package: member.name.clone(),
            identifier: member.identifier.clone(),
            ecosystem: member.ecosystem,
            from_version,
            to_version,
            kind: *kind,
            reason: *reason,
            commits: commits.clone(),
        });
    }

    // Synchronize shares one target version string per group.
    if !bumps.is_empty() {
        align_synchronized_versions(workspace, config, inputs, &mut bumps)?;
    }

    Ok(ReleasePlan { bumps })
}

/// Names of packages that synchronize together: one group per workspace
/// section with `synchronize = true` (or the root flag when the package has
/// no section). Grouping follows the section so that each ecosystem's graph
/// stays independent.
fn synchronize_groups(
    workspace: &Workspace,
    config: &Config,
    inputs: &PlanInputs,
) -> Vec<Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for member in &workspace.members {
        let label = inputs.label_by_package.get(&member.name);
        let enabled = label
            .and_then(|l| config.workspaces.iter().find(|w| &w.label == l))
            .and_then(|w| w.synchronize)
            .unwrap_or(config.synchronize);
        if !enabled {
            continue;
        }
        let key = label
            .cloned()
            .unwrap_or_else(|| member.ecosystem.as_str().to_string());
        groups.entry(key).or_default().push(member.name.clone());
    }
    groups.into_values().collect()
}

fn align_synchronized_versions(
    workspace: &Workspace,
    config: &Config,
    inputs: &PlanInputs,
    bumps: &mut [VersionBump],
) -> Result<()> {
    for group in synchronize_groups(workspace, config, inputs) {
        let group_set: BTreeSet<&str> = group.iter().map(String::as_str).collect();
        let members: Vec<usize> = bumps
            .iter()
            .enumerate()
            .filter(|(_, b)| group_set.contains(b.package.as_str()))
            .map(|(idx, _)| idx)
            .collect();
        if members.len() < 2 {
            continue;
        }
        // The shared target is the highest computed target in the group.
        let label = group
            .first()
            .and_then(|name| inputs.label_by_package.get(name))
            .map(String::as_str);
        let scheme = scheme_by_name(&config.resolved_scheme(label, None))?;
        let mut target: Option<String> = None;
        for &idx in &members {
            let candidate = &bumps[idx].to_version;
            let better = match &target {
                None => true,
                Some(current) => scheme
                    .compare(candidate, current)
                    .map(|ord| ord == std::cmp::Ordering::Greater)
                    .unwrap_or(false),
            };
            if better {
                target = Some(candidate.clone());
            }
        }
        if let Some(target) = target {
            for idx in members {
                bumps[idx].to_version = target.clone();
            }
        }
    }
    Ok(())
}

/// Stable hash of a plan, used to match run journals across restarts.
pub fn plan_hash(plan: &ReleasePlan) -> String {
    let mut hasher = Sha256::new();
    for bump in &plan.bumps {
        hasher.update(bump.identifier.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(bump.from_version.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(bump.to_version.as_bytes());
        hasher.update(b"\x1e");
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Ecosystem, PackageInfo};
    use std::path::PathBuf;

    fn make_package(name: &str, version: &str, deps: &[&str]) -> PackageInfo {
        PackageInfo {
            name: name.to_string(),
            identifier: PackageInfo::dependency_identifier(Ecosystem::Cargo, name),
            version: version.to_string(),
            path: PathBuf::from(format!("/repo/crates/{name}")),
            internal_deps: deps.iter().map(|s| s.to_string()).collect(),
            ecosystem: Ecosystem::Cargo,
            group: None,
        }
    }

    fn make_workspace(members: Vec<PackageInfo>) -> Workspace {
        Workspace {
            root: PathBuf::from("/repo"),
            members,
        }
    }

    fn commit(sha: &str, message: &str) -> Commit {
        Commit::parse(sha, "alice", message)
    }

    fn inputs_with(commits: &[(&str, Vec<Commit>)]) -> PlanInputs {
        PlanInputs {
            commits_by_package: commits
                .iter()
                .map(|(name, list)| (name.to_string(), list.clone()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn direct_and_transitive_bumps() {
        // Graph: plugin-b -> core, plugin-c -> core. One feat on core.
        let ws = make_workspace(vec![
            make_package("core", "1.0.0", &[]),
            make_package("plugin-b", "0.5.0", &["core"]),
            make_package("plugin-c", "0.5.0", &["core"]),
        ]);
        let graph = DependencyGraph::build(&ws).unwrap();
        let inputs = inputs_with(&[("core", vec![commit("aaa1111aaa", "feat: add X")])]);

        let plan = build_plan(&ws, &graph, &Config::default(), &inputs).unwrap();
        assert_eq!(plan.bumps.len(), 3);

        let core = plan.bump_for("core").unwrap();
        assert_eq!(core.to_version, "1.1.0");
        assert_eq!(core.kind, Bump::Minor);
        assert_eq!(core.reason, BumpReason::Direct);

        for name in ["plugin-b", "plugin-c"] {
            let bump = plan.bump_for(name).unwrap();
            assert_eq!(bump.to_version, "0.5.1");
            assert_eq!(bump.kind, Bump::Patch);
            assert_eq!(bump.reason, BumpReason::Transitive);
        }
    }

    #[test]
    fn transitive_never_exceeds_patch() {
        // Breaking change on core must still only patch the dependents.
        let ws = make_workspace(vec![
            make_package("core", "1.0.0", &[]),
            make_package("app", "2.3.0", &["core"]),
        ]);
        let graph = DependencyGraph::build(&ws).unwrap();
        let inputs = inputs_with(&[("core", vec![commit("aaa1111aaa", "feat!: rework API")])]);

        let plan = build_plan(&ws, &graph, &Config::default(), &inputs).unwrap();
        assert_eq!(plan.bump_for("core").unwrap().to_version, "2.0.0");
        let app = plan.bump_for("app").unwrap();
        assert_eq!(app.kind, Bump::Patch);
        assert_eq!(app.to_version, "2.3.1");
    }

    #[test]
    fn revert_cancels_matching_commit() {
        let ws = make_workspace(vec![make_package("core", "1.0.0", &[])]);
        let graph = DependencyGraph::build(&ws).unwrap();
        let inputs = inputs_with(&[(
            "core",
            vec![
                commit("bbb2222bbb", "revert: feat: add Y"),
                commit("aaa1111aaa", "feat: add Y"),
            ],
        )]);

        let plan = build_plan(&ws, &graph, &Config::default(), &inputs).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn revert_by_sha_cancels() {
        let ws = make_workspace(vec![make_package("core", "1.0.0", &[])]);
        let graph = DependencyGraph::build(&ws).unwrap();
        let revert = commit(
            "ccc3333ccc",
            "Revert \"feat: add Y\"\n\nThis reverts commit aaa1111aaa1111aaa1111aaa1111aaa1111aaaa.",
        );
        let inputs = inputs_with(&[(
            "core",
            vec![
                revert,
                commit("aaa1111aaa1111aaa1111aaa1111aaa1111aaaa", "feat: add Y"),
                commit("ddd4444ddd", "fix: keep this"),
            ],
        )]);

        let plan = build_plan(&ws, &graph, &Config::default(), &inputs).unwrap();
        let core = plan.bump_for("core").unwrap();
        // The feat was cancelled; only the fix remains.
        assert_eq!(core.kind, Bump::Patch);
        assert_eq!(core.to_version, "1.0.1");
    }

    #[test]
    fn revert_without_match_has_no_effect() {
        let ws = make_workspace(vec![make_package("core", "1.0.0", &[])]);
        let graph = DependencyGraph::build(&ws).unwrap();
        let inputs = inputs_with(&[(
            "core",
            vec![
                commit("bbb2222bbb", "revert: feat: from a previous window"),
                commit("aaa1111aaa", "fix: current work"),
            ],
        )]);

        let plan = build_plan(&ws, &graph, &Config::default(), &inputs).unwrap();
        assert_eq!(plan.bump_for("core").unwrap().kind, Bump::Patch);
    }

    #[test]
    fn one_revert_cancels_one_of_two_identical_feats() {
        let ws = make_workspace(vec![make_package("core", "1.0.0", &[])]);
        let graph = DependencyGraph::build(&ws).unwrap();
        let inputs = inputs_with(&[(
            "core",
            vec![
                commit("ccc3333ccc", "revert: feat: add Z"),
                commit("bbb2222bbb", "feat: add Z"),
                commit("aaa1111aaa", "feat: add Z"),
            ],
        )]);

        let plan = build_plan(&ws, &graph, &Config::default(), &inputs).unwrap();
        // One feat survives.
        assert_eq!(plan.bump_for("core").unwrap().kind, Bump::Minor);
    }

    #[test]
    fn empty_window_yields_empty_plan() {
        let ws = make_workspace(vec![make_package("core", "1.0.0", &[])]);
        let graph = DependencyGraph::build(&ws).unwrap();
        let plan = build_plan(&ws, &graph, &Config::default(), &PlanInputs::default()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn chore_only_window_is_skipped() {
        let ws = make_workspace(vec![make_package("core", "1.0.0", &[])]);
        let graph = DependencyGraph::build(&ws).unwrap();
        let inputs = inputs_with(&[("core", vec![commit("aaa1111aaa", "chore: tidy")])]);
        let plan = build_plan(&ws, &graph, &Config::default(), &inputs).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn force_unchanged_bumps_quiet_packages() {
        let ws = make_workspace(vec![make_package("core", "1.0.0", &[])]);
        let graph = DependencyGraph::build(&ws).unwrap();
        let mut inputs = PlanInputs::default();
        inputs.force_unchanged = true;
        let plan = build_plan(&ws, &graph, &Config::default(), &inputs).unwrap();
        let core = plan.bump_for("core").unwrap();
        assert_eq!(core.reason, BumpReason::Forced);
        assert_eq!(core.to_version, "1.0.1");
    }

    #[test]
    fn synchronize_aligns_all_packages() {
        let ws = make_workspace(vec![
            make_package("a", "1.2.0", &[]),
            make_package("b", "1.2.0", &[]),
            make_package("c", "1.2.0", &[]),
        ]);
        let graph = DependencyGraph::build(&ws).unwrap();
        let mut config = Config::default();
        config.synchronize = true;
        let inputs = inputs_with(&[("a", vec![commit("aaa1111aaa", "feat: add X")])]);

        let plan = build_plan(&ws, &graph, &config, &inputs).unwrap();
        assert_eq!(plan.bumps.len(), 3);
        for name in ["a", "b", "c"] {
            assert_eq!(plan.bump_for(name).unwrap().to_version, "1.3.0");
        }
        assert_eq!(plan.bump_for("b").unwrap().reason, BumpReason::Synchronize);
    }

    #[test]
    fn synchronize_shares_highest_target_on_skewed_versions() {
        let ws = make_workspace(vec![
            make_package("a", "1.2.0", &[]),
            make_package("b", "0.9.0", &[]),
        ]);
        let graph = DependencyGraph::build(&ws).unwrap();
        let mut config = Config::default();
        config.synchronize = true;
        let inputs = inputs_with(&[("a", vec![commit("aaa1111aaa", "feat: add X")])]);

        let plan = build_plan(&ws, &graph, &config, &inputs).unwrap();
        assert_eq!(plan.bump_for("a").unwrap().to_version, "1.3.0");
        assert_eq!(plan.bump_for("b").unwrap().to_version, "1.3.0");
    }

    #[test]
    fn tag_version_backfills_manifest_less_packages() {
        let mut member = make_package("core", "", &[]);
        member.ecosystem = Ecosystem::Go;
        let ws = make_workspace(vec![member]);
        let graph = DependencyGraph::build(&ws).unwrap();
        let mut inputs = inputs_with(&[("core", vec![commit("aaa1111aaa", "feat: add X")])]);
        inputs.tag_versions.insert("core".into(), "1.4.0".into());

        let plan = build_plan(&ws, &graph, &Config::default(), &inputs).unwrap();
        let core = plan.bump_for("core").unwrap();
        assert_eq!(core.from_version, "1.4.0");
        assert_eq!(core.to_version, "1.5.0");
    }

    #[test]
    fn plan_hash_is_stable_and_content_sensitive() {
        let ws = make_workspace(vec![make_package("core", "1.0.0", &[])]);
        let graph = DependencyGraph::build(&ws).unwrap();
        let inputs = inputs_with(&[("core", vec![commit("aaa1111aaa", "feat: add X")])]);
        let plan_a = build_plan(&ws, &graph, &Config::default(), &inputs).unwrap();
        let plan_b = build_plan(&ws, &graph, &Config::default(), &inputs).unwrap();
        assert_eq!(plan_hash(&plan_a), plan_hash(&plan_b));

        let inputs2 = inputs_with(&[("core", vec![commit("aaa1111aaa", "feat!: rework")])]);
        let plan_c = build_plan(&ws, &graph, &Config::default(), &inputs2).unwrap();
        assert_ne!(plan_hash(&plan_a), plan_hash(&plan_c));
    }
}
