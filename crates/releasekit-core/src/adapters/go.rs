use crate::errors::{ReleaseKitError, Result, io_error_with_path};
use crate::types::{Artifact, Ecosystem, PackageInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

// Go modules carry their version in the git tag, not in a manifest field.
// `rewrite_version` is therefore a no-op (see adapters::EcosystemAdapter)
// and discovery reports an empty version; the release flow resolves the
// current version from the newest matching tag.

pub fn can_discover(root: &Path) -> bool {
    root.join("go.work").exists()
}

pub fn discover(root: &Path) -> Result<Vec<PackageInfo>> {
    let work_path = root.join("go.work");
    let text = fs::read_to_string(&work_path).map_err(|e| io_error_with_path(e, &work_path))?;
    let member_dirs: Vec<PathBuf> = parse_use_directives(&text)
        .into_iter()
        .map(|rel| root.join(rel))
        .filter(|dir| dir.join("go.mod").exists())
        .collect();

    // First pass: module paths.
    let mut module_by_dir: BTreeMap<PathBuf, String> = BTreeMap::new();
    for dir in &member_dirs {
        let mod_path = dir.join("go.mod");
        let text = fs::read_to_string(&mod_path).map_err(|e| io_error_with_path(e, &mod_path))?;
        let module = parse_module_path(&text).ok_or_else(|| {
            ReleaseKitError::Workspace(format!("missing module directive in {}", mod_path.display()))
        })?;
        module_by_dir.insert(dir.clone(), module);
    }
    let member_modules: BTreeSet<&str> =
        module_by_dir.values().map(|s| s.as_str()).collect();

    // Second pass: requires on other workspace modules are internal; the
    // go.work use-list is the workspace mechanism.
    let mut out = Vec::new();
    for dir in &member_dirs {
        let mod_path = dir.join("go.mod");
        let text = fs::read_to_string(&mod_path).map_err(|e| io_error_with_path(e, &mod_path))?;
        let internal_deps: BTreeSet<String> = parse_require_paths(&text)
            .into_iter()
            .filter(|required| member_modules.contains(required.as_str()))
            .collect();
        let module = module_by_dir[dir].clone();
        out.push(PackageInfo {
            identifier: PackageInfo::dependency_identifier(Ecosystem::Go, &module),
            name: module,
            version: String::new(),
            path: dir.clone(),
            internal_deps,
            ecosystem: Ecosystem::Go,
            group: None,
        });
    }
    Ok(out)
}

fn parse_use_directives(work: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_block = false;
    for line in work.lines() {
        let trimmed = strip_comment(line).trim();
        if trimmed.is_empty() {
            continue;
        }
        if in_block {
            if trimmed == ")" {
                in_block = false;
            } else {
                out.push(trimmed.to_string());
            }
        } else if trimmed == "use (" {
            in_block = true;
        } else if let Some(rest) = trimmed.strip_prefix("use ") {
            out.push(rest.trim().to_string());
        }
    }
    out
}

fn parse_module_path(go_mod: &str) -> Option<String> {
    go_mod.lines().find_map(|line| {
        strip_comment(line)
            .trim()
            .strip_prefix("module ")
            .map(|rest| rest.trim().to_string())
    })
}

fn parse_require_paths(go_mod: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_block = false;
    for line in go_mod.lines() {
        let trimmed = strip_comment(line).trim();
        if trimmed.is_empty() {
            continue;
        }
        if in_block {
            if trimmed == ")" {
                in_block = false;
            } else if let Some(path) = trimmed.split_whitespace().next() {
                out.push(path.to_string());
            }
        } else if trimmed == "require (" {
            in_block = true;
        } else if let Some(rest) = trimmed.strip_prefix("require ") {
            if let Some(path) = rest.split_whitespace().next() {
                out.push(path.to_string());
            }
        }
    }
    out
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Publishing a Go module is the tag push; there is no build artifact.
/// Availability is confirmed against the module proxy afterwards.
pub fn build(_package: &PackageInfo) -> Result<Vec<Artifact>> {
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_use_block_and_single_use() {
        let work = "go 1.22\n\nuse (\n\t./core\n\t./plugin // plugin module\n)\nuse ./extra\n";
        assert_eq!(parse_use_directives(work), vec!["./core", "./plugin", "./extra"]);
    }

    #[test]
    fn parses_module_and_requires() {
        let go_mod = "module github.com/acme/plugin\n\ngo 1.22\n\nrequire (\n\tgithub.com/acme/core v1.0.0\n\tgithub.com/pkg/errors v0.9.1\n)\nrequire github.com/extra/mod v2.0.0\n";
        assert_eq!(
            parse_module_path(go_mod).as_deref(),
            Some("github.com/acme/plugin")
        );
        assert_eq!(
            parse_require_paths(go_mod),
            vec![
                "github.com/acme/core",
                "github.com/pkg/errors",
                "github.com/extra/mod"
            ]
        );
    }

    #[test]
    fn discovers_workspace_modules() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::write(root.join("go.work"), "go 1.22\n\nuse (\n\t./core\n\t./plugin\n)\n").unwrap();
        fs::create_dir_all(root.join("core")).unwrap();
        fs::create_dir_all(root.join("plugin")).unwrap();
        fs::write(
            root.join("core/go.mod"),
            "module github.com/acme/core\n\ngo 1.22\n",
        )
        .unwrap();
        fs::write(
            root.join("plugin/go.mod"),
            "module github.com/acme/plugin\n\ngo 1.22\n\nrequire github.com/acme/core v1.0.0\n",
        )
        .unwrap();

        let packages = discover(root).unwrap();
        assert_eq!(packages.len(), 2);
        let plugin = packages
            .iter()
            .find(|p| p.name == "github.com/acme/plugin")
            .unwrap();
        assert!(plugin.internal_deps.contains("github.com/acme/core"));
        // Version comes from tags, not the manifest.
        assert!(plugin.version.is_empty());
    }

    #[test]
    fn module_outside_workspace_is_external() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::write(root.join("go.work"), "use ./core\n").unwrap();
        fs::create_dir_all(root.join("core")).unwrap();
        fs::write(
            root.join("core/go.mod"),
            "module github.com/acme/core\n\nrequire github.com/other/mod v1.0.0\n",
        )
        .unwrap();
        let packages = discover(root).unwrap();
        assert!(packages[0].internal_deps.is_empty());
    }
}
