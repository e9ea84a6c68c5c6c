use crate::adapters::EcosystemAdapter;
use crate::backends::{Forge, PrState, Vcs};
use crate::changelog;
use crate::commits::Commit;
use crate::config::Config;
use crate::errors::{ReleaseKitError, Result};
use crate::types::{Ecosystem, PrHandle, ReleasePlan, Workspace};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Canonical labels driving the Release-PR lifecycle.
pub const PENDING_LABEL: &str = "autorelease: pending";
pub const TAGGED_LABEL: &str = "autorelease: tagged";
pub const PUBLISHED_LABEL: &str = "autorelease: published";
pub const PARTIAL_PUBLISHED_LABEL: &str = "autorelease: partial-published";

pub const RELEASE_BRANCH: &str = "release/releasekit";
const COMMIT_PREFIX: &str = "chore(release):";

/// Exact markers for the embedded manifest block. Parsing requires a
/// byte-exact match; any variant is rejected with a diagnostic.
const MANIFEST_BEGIN: &str = "<!-- releasekit:manifest:v1 -->";
const MANIFEST_END: &str = "<!-- releasekit:manifest:end -->";

/// The machine-readable plan embedded in the PR body: the single source
/// of truth for the downstream tag and publish steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrManifest {
    pub version_manifest_version: u32,
    pub packages: Vec<ManifestPackage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub umbrella: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPackage {
    pub name: String,
    pub from: String,
    pub to: String,
    pub tag: String,
}

impl PrManifest {
    /// Build the manifest from a plan, expanding each package's tag format.
    pub fn from_plan(
        plan: &ReleasePlan,
        config: &Config,
        label_by_package: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut packages = Vec::new();
        for bump in &plan.bumps {
            let label = label_by_package.get(&bump.package).map(String::as_str);
            let format = config.resolved_tag_format(label, None);
            packages.push(ManifestPackage {
                name: bump.package.clone(),
                from: bump.from_version.clone(),
                to: bump.to_version.clone(),
                tag: Config::format_tag(&format, &bump.package, &bump.to_version),
            });
        }
        Ok(Self {
            version_manifest_version: 1,
            packages,
            umbrella: umbrella_tag(plan, config),
            commit_sha: None,
        })
    }

    /// Render the fenced, delimited JSON block for embedding in a PR body.
    pub fn render(&self) -> Result<String> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ReleaseKitError::InvalidData(format!("manifest serialization: {e}")))?;
        Ok(format!(
            "{MANIFEST_BEGIN}\n```json\n{json}\n```\n{MANIFEST_END}"
        ))
    }

    /// Extract the manifest from a PR body. The magic strings must match
    /// exactly; a missing or malformed block is a diagnostic error.
    pub fn extract(body: &str) -> Result<Self> {
        let begin = body.find(MANIFEST_BEGIN).ok_or_else(|| {
            ReleaseKitError::InvalidData(format!(
                "PR body carries no release manifest (missing '{MANIFEST_BEGIN}')"
            ))
        })?;
        let after_begin = &body[begin + MANIFEST_BEGIN.len()..];
        let end = after_begin.find(MANIFEST_END).ok_or_else(|| {
            ReleaseKitError::InvalidData(format!(
                "release manifest block is not terminated (missing '{MANIFEST_END}')"
            ))
        })?;
        let block = &after_begin[..end];

        let json = block
            .trim()
            .strip_prefix("```json")
            .and_then(|rest| rest.trim_end().strip_suffix("```"))
            .ok_or_else(|| {
                ReleaseKitError::InvalidData(
                    "release manifest block is not a fenced json code block".into(),
                )
            })?;

        let manifest: PrManifest = serde_json::from_str(json.trim()).map_err(|e| {
            ReleaseKitError::InvalidData(format!("release manifest is not valid JSON: {e}"))
        })?;
        if manifest.version_manifest_version != 1 {
            return Err(ReleaseKitError::InvalidData(format!(
                "unsupported manifest version {}",
                manifest.version_manifest_version
            )));
        }
        Ok(manifest)
    }
}

fn umbrella_tag(plan: &ReleasePlan, config: &Config) -> Option<String> {
    let format = config
        .workspaces
        .iter()
        .find_map(|ws| ws.umbrella_tag.clone())?;
    // The umbrella version is the highest target in the plan.
    let version = plan
        .bumps
        .iter()
        .map(|b| b.to_version.as_str())
        .max_by(|a, b| {
            match (
                crate::versioning::parse_version_string(a),
                crate::versioning::parse_version_string(b),
            ) {
                (Ok(va), Ok(vb)) => va.cmp(&vb),
                _ => a.cmp(b),
            }
        })?
        .to_string();
    Some(format.replace("{version}", &version))
}

/// Outcome of a `prepare` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareOutcome {
    pub pr: Option<PrHandle>,
    pub committed: bool,
    pub manifest: PrManifest,
}

/// Rewrite manifests and changelogs for the plan, commit on the release
/// branch, and open or update the Release PR carrying the embedded
/// manifest. Re-running with no new commits rewrites the PR body
/// identically and pushes nothing.
#[allow(clippy::too_many_arguments)]
pub fn run_prepare(
    workspace: &Workspace,
    plan: &ReleasePlan,
    config: &Config,
    label_by_package: &BTreeMap<String, String>,
    commits_by_package: &BTreeMap<String, Vec<Commit>>,
    vcs: &dyn Vcs,
    forge: Option<&dyn Forge>,
    dry_run: bool,
) -> Result<PrepareOutcome> {
    if plan.is_empty() {
        return Err(ReleaseKitError::NothingToRelease);
    }

    let mut manifest = PrManifest::from_plan(plan, config, label_by_package)?;
    let title = pr_title(plan, config);

    if dry_run {
        let body = render_pr_body(plan, commits_by_package, &manifest)?;
        println!("{body}");
        return Ok(PrepareOutcome {
            pr: None,
            committed: false,
            manifest,
        });
    }

    // Rewrite each bumped package's manifest and changelog.
    let mut touched: Vec<PathBuf> = Vec::new();
    for bump in &plan.bumps {
        let member = workspace.find_by_name(&bump.package).ok_or_else(|| {
            ReleaseKitError::Release(format!("planned package '{}' not in workspace", bump.package))
        })?;
        let adapter = EcosystemAdapter::for_ecosystem(member.ecosystem);

        if member.ecosystem != Ecosystem::Go {
            let manifest_path = adapter.manifest_path(&member.path);
            let current = std::fs::read_to_string(&manifest_path)
                .map_err(|e| crate::errors::io_error_with_path(e, &manifest_path))?;
            let rewritten = adapter.rewrite_version(&current, &bump.to_version)?;
            if rewritten != current {
                std::fs::write(&manifest_path, rewritten)
                    .map_err(|e| crate::errors::io_error_with_path(e, &manifest_path))?;
            }
            touched.push(manifest_path);
        }

        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let commits = commits_by_package
            .get(&bump.package)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        changelog::update_changelog(
            &member.path,
            &bump.package,
            &bump.to_version,
            Some(&date),
            commits,
        )?;
        touched.push(member.path.join("CHANGELOG.md"));
    }

    // Refresh lockfiles so the release branch stays consistent.
    for bump in &plan.bumps {
        let Some(member) = workspace.find_by_name(&bump.package) else {
            continue;
        };
        let adapter = EcosystemAdapter::for_ecosystem(member.ecosystem);
        let ws_root = workspace_root_for(workspace, config, label_by_package, &bump.package);
        if let Err(e) = adapter.lock(&ws_root, Some(&bump.package)) {
            // A missing lockfile tool must not sink the whole prepare.
            eprintln!("Warning: lockfile refresh failed for {}: {e}", bump.package);
        }
    }

    // Commit only when the rewrites changed anything (idempotent rerun).
    let committed = if vcs.is_clean()? {
        false
    } else {
        let message = format!("{COMMIT_PREFIX} {}", release_summary(plan));
        vcs.commit(&touched, &message)?;
        true
    };
    manifest.commit_sha = Some(vcs.current_sha()?);
    let body = render_pr_body(plan, commits_by_package, &manifest)?;

    let pr = match forge {
        Some(forge) => {
            if committed {
                // Push HEAD as the release branch; no local branch needed.
                vcs.push(&format!("HEAD:refs/heads/{RELEASE_BRANCH}"), true)?;
            }
            let handle = forge.create_pr(
                RELEASE_BRANCH,
                &config.default_branch,
                &title,
                &body,
                &[PENDING_LABEL.to_string()],
            )?;
            forge.update_pr(&handle, &title, &body)?;
            Some(handle)
        }
        None => None,
    };

    Ok(PrepareOutcome {
        pr,
        committed,
        manifest,
    })
}

fn workspace_root_for(
    workspace: &Workspace,
    config: &Config,
    label_by_package: &BTreeMap<String, String>,
    package: &str,
) -> PathBuf {
    label_by_package
        .get(package)
        .and_then(|label| config.workspaces.iter().find(|w| &w.label == label))
        .map(|w| workspace.root.join(&w.root))
        .unwrap_or_else(|| workspace.root.clone())
}

fn pr_title(plan: &ReleasePlan, config: &Config) -> String {
    config
        .pr_title_template
        .replace("{version}", &release_summary(plan))
}

fn release_summary(plan: &ReleasePlan) -> String {
    if plan.bumps.len() == 1 {
        let bump = &plan.bumps[0];
        format!("{} {}", bump.package, bump.to_version)
    } else {
        format!("{} packages", plan.bumps.len())
    }
}

fn render_pr_body(
    plan: &ReleasePlan,
    commits_by_package: &BTreeMap<String, Vec<Commit>>,
    manifest: &PrManifest,
) -> Result<String> {
    let umbrella = changelog::render_umbrella(&plan.bumps, commits_by_package);
    Ok(format!("{umbrella}\n\n---\n\n{}", manifest.render()?))
}

/// Outcome of a `release` run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub created_tags: Vec<String>,
    pub existing_tags: Vec<String>,
    pub pr: Option<PrHandle>,
}

/// On merge of the Release PR: extract the embedded manifest, create the
/// per-package tags plus the umbrella tag, create forge releases, and
/// move the PR label from pending to tagged. Existing tags and releases
/// are detected and left unchanged.
pub fn run_release(
    vcs: &dyn Vcs,
    forge: &dyn Forge,
    dry_run: bool,
) -> Result<ReleaseOutcome> {
    let merged = forge.list_prs(Some(PENDING_LABEL), PrState::Merged)?;
    let pr = merged.first().ok_or_else(|| {
        ReleaseKitError::NotFound(format!(
            "no merged pull request carries the '{PENDING_LABEL}' label"
        ))
    })?;
    let body = forge.get_pr_body(pr)?;
    let manifest = PrManifest::extract(&body)?;

    let mut outcome = ReleaseOutcome {
        pr: Some(pr.clone()),
        ..Default::default()
    };

    let mut all_tags: Vec<(String, String)> = manifest
        .packages
        .iter()
        .map(|p| (p.tag.clone(), format!("Release {} {}", p.name, p.to)))
        .collect();
    if let Some(umbrella) = &manifest.umbrella {
        all_tags.push((umbrella.clone(), format!("Release {umbrella}")));
    }

    for (tag, message) in all_tags {
        if vcs.tag_exists(&tag)? {
            outcome.existing_tags.push(tag);
            continue;
        }
        if dry_run {
            println!("  [dry-run] would tag {tag}");
            continue;
        }
        vcs.tag(&tag, &message)?;
        vcs.push(&tag, false)?;
        outcome.created_tags.push(tag);
    }

    if !dry_run {
        for package in &manifest.packages {
            if forge.release_exists(&package.tag)? {
                continue;
            }
            let prerelease = package.to.contains('-');
            forge.create_release(
                &package.tag,
                &package.tag,
                &format!("{} {} → {}", package.name, package.from, package.to),
                false,
                prerelease,
            )?;
        }
        forge.add_labels(pr, &[TAGGED_LABEL.to_string()])?;
        forge.remove_labels(pr, &[PENDING_LABEL.to_string()])?;
    }

    Ok(outcome)
}

/// Label the PR after a publish run. A clean run is `published`; a run
/// where some ecosystems failed gets `partial-published` plus a
/// per-ecosystem sub-label for each ecosystem that fully succeeded.
pub fn apply_publish_labels(
    forge: &dyn Forge,
    pr: &PrHandle,
    result: &crate::scheduler::SchedulerResult,
    ecosystem_by_package: &BTreeMap<String, Ecosystem>,
) -> Result<()> {
    if result.failed.is_empty() && result.blocked.is_empty() && result.cancelled.is_empty() {
        forge.add_labels(pr, &[PUBLISHED_LABEL.to_string()])?;
        forge.remove_labels(pr, &[TAGGED_LABEL.to_string()])?;
        return Ok(());
    }

    let mut failed_ecosystems: std::collections::BTreeSet<Ecosystem> =
        std::collections::BTreeSet::new();
    for (name, _) in result.failed.iter().chain(result.blocked.iter()) {
        if let Some(eco) = ecosystem_by_package.get(name) {
            failed_ecosystems.insert(*eco);
        }
    }
    for name in &result.cancelled {
        if let Some(eco) = ecosystem_by_package.get(name) {
            failed_ecosystems.insert(*eco);
        }
    }

    let mut labels = vec![PARTIAL_PUBLISHED_LABEL.to_string()];
    let all_ecosystems: std::collections::BTreeSet<Ecosystem> =
        ecosystem_by_package.values().copied().collect();
    for eco in all_ecosystems.difference(&failed_ecosystems) {
        labels.push(format!("published: {eco}"));
    }
    forge.add_labels(pr, &labels)?;
    Ok(())
}
