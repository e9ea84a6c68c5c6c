use crate::adapters::file_sha256;
use crate::errors::{ReleaseKitError, Result, io_error_with_path};
use crate::types::{Artifact, Ecosystem, PackageInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use toml_edit::{DocumentMut, Item};

pub fn can_discover(root: &Path) -> bool {
    let path = root.join("pyproject.toml");
    let Ok(text) = fs::read_to_string(&path) else {
        return false;
    };
    text.parse::<toml::Value>()
        .ok()
        .and_then(|v| {
            v.get("tool")?
                .get("uv")?
                .get("workspace")
                .map(|_| ())
        })
        .is_some()
}

/// Some uv installs are `.cmd` shims on Windows, which `Command::new`
/// will not resolve (rust-lang/rust#37519); cmd.exe applies PATHEXT.
fn uv() -> Command {
    #[cfg(windows)]
    {
        let mut shell = Command::new("cmd");
        shell.arg("/C").arg("uv");
        shell
    }
    #[cfg(not(windows))]
    {
        Command::new("uv")
    }
}

/// PEP 503 name normalization: case-insensitive, runs of `-_.` collapse to `-`.
fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for ch in name.chars() {
        if ch == '-' || ch == '_' || ch == '.' {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(ch.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

/// Extract the distribution name from a PEP 508 requirement string.
fn requirement_name(spec: &str) -> &str {
    let trimmed = spec.trim();
    let end = trimmed
        .find(|c: char| " ([<>=!~;".contains(c))
        .unwrap_or(trimmed.len());
    &trimmed[..end]
}

pub fn discover(root: &Path) -> Result<Vec<PackageInfo>> {
    let root_manifest = root.join("pyproject.toml");
    let text = fs::read_to_string(&root_manifest)
        .map_err(|e| io_error_with_path(e, &root_manifest))?;
    let value: toml::Value = text.parse().map_err(|e| {
        ReleaseKitError::Workspace(format!("{}: {e}", root_manifest.display()))
    })?;

    let workspace = value
        .get("tool")
        .and_then(|v| v.get("uv"))
        .and_then(|v| v.get("workspace"))
        .and_then(|v| v.as_table())
        .ok_or_else(|| {
            ReleaseKitError::Workspace(format!(
                "missing [tool.uv.workspace] in {}",
                root_manifest.display()
            ))
        })?;

    let mut member_dirs = Vec::new();
    if let Some(members) = workspace.get("members").and_then(|v| v.as_array()) {
        for member in members {
            let Some(pattern) = member.as_str() else {
                continue;
            };
            let full = root.join(pattern);
            if pattern.contains('*') {
                for entry in glob::glob(&full.to_string_lossy()).map_err(|e| {
                    ReleaseKitError::Workspace(format!("invalid members pattern '{pattern}': {e}"))
                })? {
                    let path = entry
                        .map_err(|e| ReleaseKitError::Workspace(format!("glob error: {e}")))?;
                    if path.join("pyproject.toml").exists() {
                        member_dirs.push(path);
                    }
                }
            } else if full.join("pyproject.toml").exists() {
                member_dirs.push(full);
            }
        }
    }

    struct Parsed {
        name: String,
        version: String,
        dir: PathBuf,
        requirements: Vec<String>,
        workspace_sources: BTreeSet<String>,
    }

    let mut parsed = Vec::new();
    for dir in member_dirs {
        let manifest_path = dir.join("pyproject.toml");
        let text = fs::read_to_string(&manifest_path)
            .map_err(|e| io_error_with_path(e, &manifest_path))?;
        let value: toml::Value = text.parse().map_err(|e| {
            ReleaseKitError::Workspace(format!("{}: {e}", manifest_path.display()))
        })?;
        let project = value
            .get("project")
            .and_then(|v| v.as_table())
            .ok_or_else(|| {
                ReleaseKitError::Workspace(format!(
                    "missing [project] in {}",
                    manifest_path.display()
                ))
            })?;
        let name = project
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ReleaseKitError::Workspace(format!(
                    "missing project.name in {}",
                    manifest_path.display()
                ))
            })?
            .to_string();
        let version = project
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let requirements: Vec<String> = project
            .get("dependencies")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();
        // Dependencies routed through the workspace mechanism.
        let workspace_sources: BTreeSet<String> = value
            .get("tool")
            .and_then(|v| v.get("uv"))
            .and_then(|v| v.get("sources"))
            .and_then(|v| v.as_table())
            .map(|sources| {
                sources
                    .iter()
                    .filter(|(_, spec)| {
                        spec.as_table()
                            .and_then(|t| t.get("workspace"))
                            .and_then(|v| v.as_bool())
                            == Some(true)
                    })
                    .map(|(name, _)| normalize_name(name))
                    .collect()
            })
            .unwrap_or_default();

        parsed.push(Parsed {
            name,
            version,
            dir,
            requirements,
            workspace_sources,
        });
    }

    let members_by_normalized: BTreeMap<String, ()> = parsed
        .iter()
        .map(|p| (normalize_name(&p.name), ()))
        .collect();
    let canonical_by_normalized: BTreeMap<String, String> = parsed
        .iter()
        .map(|p| (normalize_name(&p.name), p.name.clone()))
        .collect();

    let mut out = Vec::new();
    for p in parsed {
        let internal_deps: BTreeSet<String> = p
            .requirements
            .iter()
            .map(|spec| normalize_name(requirement_name(spec)))
            .filter(|normalized| {
                members_by_normalized.contains_key(normalized)
                    && p.workspace_sources.contains(normalized)
            })
            .filter_map(|normalized| canonical_by_normalized.get(&normalized).cloned())
            .collect();
        out.push(PackageInfo {
            identifier: PackageInfo::dependency_identifier(Ecosystem::Python, &p.name),
            name: p.name,
            version: p.version,
            path: p.dir,
            internal_deps,
            ecosystem: Ecosystem::Python,
            group: None,
        });
    }
    Ok(out)
}

pub fn is_publishable(manifest_path: &Path) -> Result<bool> {
    let text = fs::read_to_string(manifest_path)
        .map_err(|e| io_error_with_path(e, manifest_path))?;
    let value: toml::Value = text.parse().map_err(|e| {
        ReleaseKitError::InvalidData(format!("{}: {e}", manifest_path.display()))
    })?;
    // Classifiers carry the private marker by convention.
    let private = value
        .get("project")
        .and_then(|v| v.get("classifiers"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .any(|c| c == "Private :: Do Not Upload")
        })
        .unwrap_or(false);
    Ok(value.get("project").is_some() && !private)
}

pub fn rewrite_version(input: &str, new_version: &str) -> Result<String> {
    let mut doc: DocumentMut = input
        .parse()
        .map_err(|e| ReleaseKitError::InvalidData(format!("failed to parse pyproject.toml: {e}")))?;
    let project = doc
        .get_mut("project")
        .and_then(Item::as_table_mut)
        .ok_or_else(|| ReleaseKitError::InvalidData("pyproject.toml has no [project] table".into()))?;
    project["version"] = toml_edit::value(new_version);
    Ok(doc.to_string())
}

/// Pin an internal dependency: replace its entry in `project.dependencies`
/// with `name==version` and drop the `[tool.uv.sources]` workspace entry so
/// the built distribution resolves against the registry.
pub fn rewrite_dependency_version(
    input: &str,
    dep_name: &str,
    version: &str,
) -> Result<Option<String>> {
    let mut doc: DocumentMut = input
        .parse()
        .map_err(|e| ReleaseKitError::InvalidData(format!("failed to parse pyproject.toml: {e}")))?;
    let normalized = normalize_name(dep_name);
    let mut changed = false;

    if let Some(deps) = doc
        .get_mut("project")
        .and_then(Item::as_table_mut)
        .and_then(|t| t.get_mut("dependencies"))
        .and_then(Item::as_array_mut)
    {
        for entry in deps.iter_mut() {
            let Some(spec) = entry.as_str() else { continue };
            if normalize_name(requirement_name(spec)) == normalized {
                let canonical = requirement_name(spec).to_string();
                *entry = format!("{canonical}=={version}").into();
                changed = true;
            }
        }
    }

    let sources = doc
        .get_mut("tool")
        .and_then(Item::as_table_mut)
        .and_then(|t| t.get_mut("uv"))
        .and_then(Item::as_table_mut)
        .and_then(|t| t.get_mut("sources"))
        .and_then(Item::as_table_mut);
    if let Some(sources) = sources {
        let keys: Vec<String> = sources
            .iter()
            .map(|(k, _)| k.to_string())
            .filter(|k| normalize_name(k) == normalized)
            .collect();
        for key in keys {
            sources.remove(&key);
            changed = true;
        }
    }

    Ok(changed.then(|| doc.to_string()))
}

pub fn lock(workspace_root: &Path, upgrade_package: Option<&str>) -> Result<()> {
    let mut cmd = uv();
    cmd.arg("lock").current_dir(workspace_root);
    if let Some(package) = upgrade_package {
        cmd.args(["--upgrade-package", package]);
    }
    let status = cmd.status().map_err(ReleaseKitError::Io)?;
    if !status.success() {
        return Err(ReleaseKitError::PackageManager(format!(
            "uv lock failed with status {status}"
        )));
    }
    Ok(())
}

pub fn build(package: &PackageInfo) -> Result<Vec<Artifact>> {
    let status = uv()
        .args(["build", "--no-sources"])
        .current_dir(&package.path)
        .status()
        .map_err(ReleaseKitError::Io)?;
    if !status.success() {
        return Err(ReleaseKitError::PackageManager(format!(
            "uv build failed for {} with status {status}",
            package.name
        )));
    }

    let dist = package.path.join("dist");
    let needle = format!(
        "{}-{}",
        normalize_name(&package.name).replace('-', "_"),
        package.version
    );
    let mut artifacts = Vec::new();
    for entry in fs::read_dir(&dist).map_err(|e| io_error_with_path(e, &dist))? {
        let entry = entry?;
        let path = entry.path();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if file_name.starts_with(&needle) {
            artifacts.push(Artifact {
                sha256: file_sha256(&path)?,
                path,
            });
        }
    }
    if artifacts.is_empty() {
        return Err(ReleaseKitError::PackageManager(format!(
            "uv build produced no distributions for {}@{}",
            package.name, package.version
        )));
    }
    Ok(artifacts)
}

pub fn publish(package: &PackageInfo, dry_run: bool, extra_args: &[String]) -> Result<()> {
    if dry_run {
        return Ok(());
    }
    let mut cmd = uv();
    cmd.arg("publish").current_dir(&package.path);
    for arg in extra_args {
        cmd.arg(arg);
    }
    let output = cmd.output().map_err(ReleaseKitError::Io)?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("already exists") {
        return Ok(());
    }
    Err(ReleaseKitError::Publish(format!(
        "uv publish failed for {}: {}",
        package.name,
        stderr.trim()
    )))
}
