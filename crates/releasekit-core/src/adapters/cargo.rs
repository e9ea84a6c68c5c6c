use crate::adapters::file_sha256;
use crate::errors::{ReleaseKitError, Result, io_error_with_path};
use crate::types::{Artifact, Ecosystem, PackageInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use toml_edit::{DocumentMut, Item, Value};

pub fn can_discover(root: &Path) -> bool {
    root.join("Cargo.toml").exists()
}

pub fn discover(root: &Path) -> Result<Vec<PackageInfo>> {
    let toml_path = root.join("Cargo.toml");
    let text =
        fs::read_to_string(&toml_path).map_err(|e| io_error_with_path(e, &toml_path))?;
    let value: toml::Value = text.parse().map_err(|e| {
        ReleaseKitError::Workspace(format!("{}: {e}", toml_path.display()))
    })?;

    let members = if value.get("workspace").is_some() {
        parse_workspace_members(root, &value)?
    } else {
        // Single-package repository.
        vec![root.to_path_buf()]
    };

    // First pass: parse per-crate metadata (name, version).
    let mut crates = Vec::new();
    let mut name_to_path: BTreeMap<String, PathBuf> = BTreeMap::new();
    for member_dir in &members {
        let manifest_path = member_dir.join("Cargo.toml");
        let text = fs::read_to_string(&manifest_path)
            .map_err(|e| io_error_with_path(e, &manifest_path))?;
        let value: toml::Value = text.parse().map_err(|e| {
            ReleaseKitError::Workspace(format!("{}: {e}", manifest_path.display()))
        })?;
        let pkg = value
            .get("package")
            .and_then(|v| v.as_table())
            .ok_or_else(|| {
                ReleaseKitError::Workspace(format!(
                    "missing [package] in {}",
                    manifest_path.display()
                ))
            })?;
        let name = pkg
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ReleaseKitError::Workspace(format!(
                    "missing package.name in {}",
                    manifest_path.display()
                ))
            })?
            .to_string();
        let version = pkg
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        name_to_path.insert(name.clone(), member_dir.clone());
        crates.push((name, version, member_dir.clone(), value));
    }

    // Second pass: classify internal dependencies.
    let mut out = Vec::new();
    for (name, version, path, manifest) in crates {
        let internal_deps = collect_internal_deps(&path, &name_to_path, &manifest);
        out.push(PackageInfo {
            identifier: PackageInfo::dependency_identifier(Ecosystem::Cargo, &name),
            name,
            version,
            path,
            internal_deps,
            ecosystem: Ecosystem::Cargo,
            group: None,
        });
    }
    Ok(out)
}

fn parse_workspace_members(root: &Path, root_toml: &toml::Value) -> Result<Vec<PathBuf>> {
    let workspace = root_toml
        .get("workspace")
        .and_then(|v| v.as_table())
        .ok_or_else(|| ReleaseKitError::Workspace("missing [workspace] table".into()))?;

    let members = workspace
        .get("members")
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            ReleaseKitError::Workspace("missing 'members' in [workspace]".into())
        })?;

    let mut paths = Vec::new();
    for member in members {
        let pattern = member.as_str().ok_or_else(|| {
            ReleaseKitError::Workspace("non-string member in workspace.members".into())
        })?;
        expand_member_pattern(root, pattern, &mut paths)?;
    }
    Ok(paths)
}

fn expand_member_pattern(root: &Path, pattern: &str, paths: &mut Vec<PathBuf>) -> Result<()> {
    if pattern.contains('*') {
        let full_pattern = root.join(pattern);
        let pattern_str = full_pattern.to_string_lossy();
        let entries = glob::glob(&pattern_str).map_err(|e| {
            ReleaseKitError::Workspace(format!("invalid glob pattern '{pattern}': {e}"))
        })?;
        for entry in entries {
            let path = entry
                .map_err(|e| ReleaseKitError::Workspace(format!("glob error: {e}")))?;
            if path.join("Cargo.toml").exists() {
                paths.push(path);
            }
        }
    } else {
        let member_path = resolve_manifest_dir(root, pattern);
        if member_path.join("Cargo.toml").exists() {
            paths.push(member_path);
        } else {
            return Err(ReleaseKitError::Workspace(format!(
                "member '{pattern}' does not contain Cargo.toml"
            )));
        }
    }
    Ok(())
}

fn collect_internal_deps(
    crate_dir: &Path,
    name_to_path: &BTreeMap<String, PathBuf>,
    manifest: &toml::Value,
) -> BTreeSet<String> {
    let mut internal = BTreeSet::new();
    for key in ["dependencies", "dev-dependencies", "build-dependencies"] {
        if let Some(tbl) = manifest.get(key).and_then(|v| v.as_table()) {
            for (dep_name, dep_val) in tbl {
                if is_internal_dep(crate_dir, name_to_path, dep_name, dep_val) {
                    internal.insert(dep_name.clone());
                }
            }
        }
    }
    internal
}

/// A dependency is internal iff it is workspace-sourced: a `path` entry
/// resolving to another member, or `workspace = true` with the name being a
/// member. A bare pinned version on a member name stays external.
fn is_internal_dep(
    crate_dir: &Path,
    name_to_path: &BTreeMap<String, PathBuf>,
    dep_name: &str,
    dep_val: &toml::Value,
) -> bool {
    if let Some(tbl) = dep_val.as_table() {
        if let Some(path_val) = tbl.get("path")
            && let Some(path_str) = path_val.as_str()
        {
            let dep_path = resolve_manifest_dir(crate_dir, path_str);
            return name_to_path.values().any(|p| *p == dep_path);
        }
        if let Some(workspace_val) = tbl.get("workspace")
            && workspace_val.as_bool() == Some(true)
        {
            return name_to_path.contains_key(dep_name);
        }
    }
    false
}

pub fn is_publishable(manifest_path: &Path) -> Result<bool> {
    let text = fs::read_to_string(manifest_path)
        .map_err(|e| io_error_with_path(e, manifest_path))?;
    let value: toml::Value = text.parse().map_err(|e| {
        ReleaseKitError::InvalidData(format!("{}: {e}", manifest_path.display()))
    })?;
    let Some(pkg) = value.get("package").and_then(|v| v.as_table()) else {
        return Ok(false);
    };
    match pkg.get("publish") {
        None => Ok(true),
        Some(toml::Value::Boolean(allowed)) => Ok(*allowed),
        Some(toml::Value::Array(registries)) => Ok(registries
            .iter()
            .any(|r| r.as_str() == Some("crates-io"))),
        Some(_) => Ok(true),
    }
}

/// Set `package.version` while preserving manifest formatting.
pub fn rewrite_version(input: &str, new_version: &str) -> Result<String> {
    let mut doc: DocumentMut = input
        .parse()
        .map_err(|e| ReleaseKitError::InvalidData(format!("failed to parse manifest: {e}")))?;
    let package = doc
        .get_mut("package")
        .and_then(Item::as_table_mut)
        .ok_or_else(|| ReleaseKitError::InvalidData("manifest has no [package] table".into()))?;
    package["version"] = toml_edit::value(new_version);
    Ok(doc.to_string())
}

/// Pin one internal dependency to a concrete version, preserving any `path`
/// entry (cargo strips path deps at publish when a version is present).
/// `workspace = true` markers are replaced by the concrete version.
pub fn rewrite_dependency_version(
    input: &str,
    dep_name: &str,
    version: &str,
) -> Result<Option<String>> {
    let mut doc: DocumentMut = input
        .parse()
        .map_err(|e| ReleaseKitError::InvalidData(format!("failed to parse manifest: {e}")))?;

    let mut changed = false;
    for section in ["dependencies", "dev-dependencies", "build-dependencies"] {
        let Some(table) = doc.get_mut(section).and_then(Item::as_table_mut) else {
            continue;
        };
        let Some(entry) = table.get_mut(dep_name) else {
            continue;
        };
        match entry {
            Item::Value(Value::InlineTable(dep)) => {
                dep.remove("workspace");
                dep.insert("version", version.into());
                changed = true;
            }
            Item::Table(dep) => {
                dep.remove("workspace");
                dep["version"] = toml_edit::value(version);
                changed = true;
            }
            Item::Value(Value::String(_)) => {
                *entry = toml_edit::value(version);
                changed = true;
            }
            _ => {}
        }
    }

    Ok(changed.then(|| doc.to_string()))
}

pub fn lock(workspace_root: &Path, upgrade_package: Option<&str>) -> Result<()> {
    let mut cmd = Command::new("cargo");
    match upgrade_package {
        Some(package) => {
            cmd.args(["update", "-p", package]).current_dir(workspace_root);
        }
        None => {
            cmd.arg("generate-lockfile").current_dir(workspace_root);
        }
    }
    let status = cmd.status().map_err(ReleaseKitError::Io)?;
    if !status.success() {
        return Err(ReleaseKitError::PackageManager(format!(
            "cargo lockfile update failed with status {status}"
        )));
    }
    Ok(())
}

pub fn build(package: &PackageInfo) -> Result<Vec<Artifact>> {
    let status = Command::new("cargo")
        .args(["package", "--no-verify", "--allow-dirty"])
        .current_dir(&package.path)
        .status()
        .map_err(ReleaseKitError::Io)?;
    if !status.success() {
        return Err(ReleaseKitError::PackageManager(format!(
            "cargo package failed for {} with status {status}",
            package.name
        )));
    }

    // cargo writes the crate file under the workspace target directory.
    let metadata = cargo_metadata::MetadataCommand::new()
        .manifest_path(package.path.join("Cargo.toml"))
        .no_deps()
        .exec()
        .map_err(|e| {
            ReleaseKitError::PackageManager(format!(
                "failed to load cargo metadata for {}: {e}",
                package.name
            ))
        })?;
    let crate_file: PathBuf = metadata
        .target_directory
        .join("package")
        .join(format!("{}-{}.crate", package.name, package.version))
        .into();
    if !crate_file.exists() {
        return Err(ReleaseKitError::PackageManager(format!(
            "expected artifact {} was not produced",
            crate_file.display()
        )));
    }
    Ok(vec![Artifact {
        sha256: file_sha256(&crate_file)?,
        path: crate_file,
    }])
}

pub fn publish(package: &PackageInfo, dry_run: bool, extra_args: &[String]) -> Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.arg("publish")
        .arg("--no-verify")
        .arg("--allow-dirty")
        .current_dir(&package.path);
    if dry_run {
        cmd.arg("--dry-run");
    }
    for arg in extra_args {
        cmd.arg(arg);
    }
    let output = cmd.output().map_err(ReleaseKitError::Io)?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    // Resume-friendly: a version that already exists counts as published.
    if stderr.contains("already exists") || stderr.contains("already uploaded") {
        return Ok(());
    }
    Err(ReleaseKitError::Publish(format!(
        "cargo publish failed for {}: {}",
        package.name,
        stderr.trim()
    )))
}

/// Resolve a manifest-relative directory reference lexically.
///
/// `path` entries like `../core` must compare equal to member paths, so
/// `.` and `..` segments collapse without touching the filesystem (the
/// target may not exist during discovery). A `..` that would climb past
/// the root is dropped.
fn resolve_manifest_dir(base: &Path, relative: &str) -> PathBuf {
    let joined = base.join(relative);
    let mut segments: Vec<Component> = Vec::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(segments.last(), Some(Component::Normal(_))) {
                    segments.pop();
                }
            }
            other => segments.push(other),
        }
    }
    segments.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_manifest_dir_collapses_dot_segments() {
        assert_eq!(
            resolve_manifest_dir(Path::new("/repo/crates/plugin"), "../core"),
            PathBuf::from("/repo/crates/core")
        );
        assert_eq!(
            resolve_manifest_dir(Path::new("/repo"), "./crates/./core"),
            PathBuf::from("/repo/crates/core")
        );
    }

    #[test]
    fn resolve_manifest_dir_cannot_climb_past_root() {
        assert_eq!(
            resolve_manifest_dir(Path::new("/repo"), "../../.."),
            PathBuf::from("/")
        );
    }

    #[test]
    fn discovers_workspace_members_and_internal_deps() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::write(
            root.join("Cargo.toml"),
            "[workspace]\nmembers = [\"crates/*\"]\n",
        )
        .unwrap();
        let crates_dir = root.join("crates");
        fs::create_dir_all(crates_dir.join("core")).unwrap();
        fs::create_dir_all(crates_dir.join("plugin")).unwrap();
        fs::write(
            crates_dir.join("core/Cargo.toml"),
            "[package]\nname = \"core\"\nversion = \"1.0.0\"\n",
        )
        .unwrap();
        fs::write(
            crates_dir.join("plugin/Cargo.toml"),
            "[package]\nname = \"plugin\"\nversion = \"0.5.0\"\n[dependencies]\ncore = { path = \"../core\" }\nserde = \"1\"\n",
        )
        .unwrap();

        let packages = discover(root).unwrap();
        assert_eq!(packages.len(), 2);
        let plugin = packages.iter().find(|p| p.name == "plugin").unwrap();
        assert!(plugin.internal_deps.contains("core"));
        assert!(!plugin.internal_deps.contains("serde"));
    }

    #[test]
    fn pinned_version_reference_is_external() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::write(
            root.join("Cargo.toml"),
            "[workspace]\nmembers = [\"a\", \"b\"]\n",
        )
        .unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(
            root.join("a/Cargo.toml"),
            // Version-only reference to a member: external by the spec rule.
            "[package]\nname = \"a\"\nversion = \"0.1.0\"\n[dependencies]\nb = \"0.1\"\n",
        )
        .unwrap();
        fs::write(
            root.join("b/Cargo.toml"),
            "[package]\nname = \"b\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();

        let packages = discover(root).unwrap();
        let a = packages.iter().find(|p| p.name == "a").unwrap();
        assert!(a.internal_deps.is_empty());
    }

    #[test]
    fn workspace_true_dep_is_internal() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::write(
            root.join("Cargo.toml"),
            "[workspace]\nmembers = [\"x\", \"y\"]\n",
        )
        .unwrap();
        for (name, extra) in [("x", "[dependencies]\ny = { workspace = true }\n"), ("y", "")] {
            fs::create_dir_all(root.join(name)).unwrap();
            fs::write(
                root.join(name).join("Cargo.toml"),
                format!("[package]\nname = \"{name}\"\nversion = \"0.1.0\"\n{extra}"),
            )
            .unwrap();
        }
        let packages = discover(root).unwrap();
        let x = packages.iter().find(|p| p.name == "x").unwrap();
        assert!(x.internal_deps.contains("y"));
    }

    #[test]
    fn rewrite_version_preserves_formatting() {
        let input = "[package]\nname = \"core\"   # the core crate\nversion = \"1.0.0\"\n\n[dependencies]\nserde = \"1\"\n";
        let output = rewrite_version(input, "1.1.0").unwrap();
        assert!(output.contains("version = \"1.1.0\""));
        assert!(output.contains("# the core crate"));
        assert!(output.contains("serde = \"1\""));
    }

    #[test]
    fn rewrite_dependency_pins_path_dep() {
        let input = "[package]\nname = \"plugin\"\nversion = \"0.5.0\"\n\n[dependencies]\ncore = { path = \"../core\" }\n";
        let output = rewrite_dependency_version(input, "core", "1.1.0")
            .unwrap()
            .unwrap();
        assert!(output.contains("path = \"../core\""));
        assert!(output.contains("version = \"1.1.0\""));
    }

    #[test]
    fn rewrite_dependency_replaces_workspace_marker() {
        let input = "[package]\nname = \"plugin\"\nversion = \"0.5.0\"\n\n[dependencies]\ncore = { workspace = true }\n";
        let output = rewrite_dependency_version(input, "core", "1.1.0")
            .unwrap()
            .unwrap();
        assert!(!output.contains("workspace = true"));
        assert!(output.contains("version = \"1.1.0\""));
    }

    #[test]
    fn rewrite_dependency_absent_is_none() {
        let input = "[package]\nname = \"plugin\"\nversion = \"0.5.0\"\n";
        assert!(
            rewrite_dependency_version(input, "core", "1.1.0")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn publish_field_controls_publishability() {
        let temp = tempfile::tempdir().unwrap();
        let manifest = temp.path().join("Cargo.toml");

        fs::write(
            &manifest,
            "[package]\nname = \"x\"\nversion = \"0.1.0\"\npublish = false\n",
        )
        .unwrap();
        assert!(!is_publishable(&manifest).unwrap());

        fs::write(
            &manifest,
            "[package]\nname = \"x\"\nversion = \"0.1.0\"\npublish = [\"crates-io\"]\n",
        )
        .unwrap();
        assert!(is_publishable(&manifest).unwrap());

        fs::write(&manifest, "[package]\nname = \"x\"\nversion = \"0.1.0\"\n").unwrap();
        assert!(is_publishable(&manifest).unwrap());

        fs::write(&manifest, "[dependencies]\nserde = \"1\"\n").unwrap();
        assert!(!is_publishable(&manifest).unwrap());
    }
}
