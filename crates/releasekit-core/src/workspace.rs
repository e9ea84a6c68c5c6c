use crate::adapters::EcosystemAdapter;
use crate::config::Config;
use crate::errors::{ReleaseKitError, Result};
use crate::types::{Ecosystem, Workspace};
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::path::Path;

/// Discovery result: the flattened workspace plus the configuration label
/// each package came from (for tiered key resolution).
#[derive(Debug, Clone)]
pub struct Discovery {
    pub workspace: Workspace,
    pub label_by_package: BTreeMap<String, String>,
}

/// Discover all packages declared by the configuration.
///
/// Each `[workspace.<label>]` section names an ecosystem and a root; the
/// matching adapter parses the manifests. Without any configured section,
/// every registered adapter is probed at the repository root (single-
/// ecosystem repositories need no configuration).
pub fn discover(root: &Path, config: &Config) -> Result<Discovery> {
    let mut members = Vec::new();
    let mut label_by_package = BTreeMap::new();

    if config.workspaces.is_empty() {
        for adapter in EcosystemAdapter::all() {
            if adapter.can_discover(root) {
                members.extend(adapter.discover(root)?);
            }
        }
        if members.is_empty() {
            return Err(ReleaseKitError::Workspace(format!(
                "no workspace found at {} (no configured sections, no recognizable manifests)",
                root.display()
            )));
        }
    } else {
        for ws in &config.workspaces {
            let ecosystem = Ecosystem::parse(&ws.ecosystem).ok_or_else(|| {
                ReleaseKitError::Config(format!(
                    "[workspace.{}] has unsupported ecosystem '{}'",
                    ws.label, ws.ecosystem
                ))
            })?;
            let adapter = EcosystemAdapter::for_ecosystem(ecosystem);
            let ws_root = root.join(&ws.root);
            if !adapter.can_discover(&ws_root) {
                return Err(ReleaseKitError::Workspace(format!(
                    "[workspace.{}] points at {} but no {} workspace was found there",
                    ws.label,
                    ws_root.display(),
                    ecosystem.display_name()
                )));
            }
            let packages = adapter.discover(&ws_root)?;
            for package in &packages {
                label_by_package.insert(package.name.clone(), ws.label.clone());
            }
            members.extend(packages);
        }
    }

    // Attach group labels from per-package config files.
    for member in &mut members {
        let overrides = Config::load_package_overrides(&member.path)?;
        member.group = overrides.group;
    }

    // Name collisions are fatal: the plan keys packages by name.
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for member in &members {
        if !seen.insert(member.name.as_str()) {
            return Err(ReleaseKitError::Workspace(format!(
                "package name collision: '{}' is declared by more than one workspace member",
                member.name
            )));
        }
    }

    Ok(Discovery {
        workspace: Workspace {
            root: root.to_path_buf(),
            members,
        },
        label_by_package,
    })
}
