use crate::adapters::file_sha256;
use crate::errors::{ReleaseKitError, Result, io_error_with_path};
use crate::types::{Artifact, Ecosystem, PackageInfo};
use serde::Deserialize;
use serde_json::value::RawValue;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub fn can_discover(root: &Path) -> bool {
    root.join("pnpm-workspace.yaml").exists()
}

/// pnpm installs as a `.cmd` batch script on Windows, which
/// `Command::new` will not resolve (rust-lang/rust#37519); cmd.exe
/// applies PATHEXT and finds it.
fn pnpm() -> Command {
    #[cfg(windows)]
    {
        let mut shell = Command::new("cmd");
        shell.arg("/C").arg("pnpm");
        shell
    }
    #[cfg(not(windows))]
    {
        Command::new("pnpm")
    }
}

#[derive(Debug, Deserialize)]
struct PnpmWorkspace {
    #[serde(default)]
    packages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PackageJson {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    private: Option<bool>,
    #[serde(default)]
    dependencies: HashMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: HashMap<String, String>,
    #[serde(default, rename = "peerDependencies")]
    peer_dependencies: HashMap<String, String>,
    #[serde(default, rename = "optionalDependencies")]
    optional_dependencies: HashMap<String, String>,
}

impl PackageJson {
    fn all_dependencies(&self) -> impl Iterator<Item = (&String, &String)> {
        self.dependencies
            .iter()
            .chain(self.dev_dependencies.iter())
            .chain(self.peer_dependencies.iter())
            .chain(self.optional_dependencies.iter())
    }
}

pub fn discover(root: &Path) -> Result<Vec<PackageInfo>> {
    let ws_path = root.join("pnpm-workspace.yaml");
    let text = fs::read_to_string(&ws_path).map_err(|e| io_error_with_path(e, &ws_path))?;
    let workspace: PnpmWorkspace = serde_yaml::from_str(&text)
        .map_err(|e| ReleaseKitError::Workspace(format!("{}: {e}", ws_path.display())))?;

    let mut member_dirs = Vec::new();
    for pattern in &workspace.packages {
        if pattern.starts_with('!') {
            continue;
        }
        let full = root.join(pattern);
        for entry in glob::glob(&full.to_string_lossy()).map_err(|e| {
            ReleaseKitError::Workspace(format!("invalid packages pattern '{pattern}': {e}"))
        })? {
            let path =
                entry.map_err(|e| ReleaseKitError::Workspace(format!("glob error: {e}")))?;
            if path.join("package.json").exists() {
                member_dirs.push(path);
            }
        }
    }

    let mut parsed: Vec<(PackageJson, PathBuf)> = Vec::new();
    for dir in member_dirs {
        let manifest_path = dir.join("package.json");
        let text = fs::read_to_string(&manifest_path)
            .map_err(|e| io_error_with_path(e, &manifest_path))?;
        let manifest: PackageJson = serde_json::from_str(&text).map_err(|e| {
            ReleaseKitError::Workspace(format!("{}: {e}", manifest_path.display()))
        })?;
        parsed.push((manifest, dir));
    }

    let member_names: BTreeSet<String> = parsed.iter().map(|(m, _)| m.name.clone()).collect();

    let mut out = Vec::new();
    for (manifest, dir) in parsed {
        let internal_deps: BTreeSet<String> = manifest
            .all_dependencies()
            .filter(|(name, spec)| {
                spec.starts_with("workspace:") && member_names.contains(name.as_str())
            })
            .map(|(name, _)| name.clone())
            .collect();
        out.push(PackageInfo {
            identifier: PackageInfo::dependency_identifier(Ecosystem::Npm, &manifest.name),
            name: manifest.name,
            version: manifest.version.unwrap_or_default(),
            path: dir,
            internal_deps,
            ecosystem: Ecosystem::Npm,
            group: None,
        });
    }
    Ok(out)
}

pub fn is_publishable(manifest_path: &Path) -> Result<bool> {
    let text = fs::read_to_string(manifest_path)
        .map_err(|e| io_error_with_path(e, manifest_path))?;
    let manifest: PackageJson = serde_json::from_str(&text).map_err(|e| {
        ReleaseKitError::InvalidData(format!("{}: {e}", manifest_path.display()))
    })?;
    Ok(!manifest.private.unwrap_or(false))
}

/// Byte span of a raw JSON value within the document it was parsed from.
fn raw_span(raw: &RawValue, input: &str) -> (usize, usize) {
    let slice = raw.get();
    let start = slice.as_ptr() as usize - input.as_ptr() as usize;
    (start, start + slice.len())
}

#[derive(Deserialize)]
struct PackageJsonBorrowed<'a> {
    #[serde(borrow)]
    version: Option<&'a RawValue>,
    #[serde(borrow)]
    dependencies: Option<HashMap<String, &'a RawValue>>,
    #[serde(borrow, rename = "devDependencies")]
    dev_dependencies: Option<HashMap<String, &'a RawValue>>,
    #[serde(borrow, rename = "peerDependencies")]
    peer_dependencies: Option<HashMap<String, &'a RawValue>>,
    #[serde(borrow, rename = "optionalDependencies")]
    optional_dependencies: Option<HashMap<String, &'a RawValue>>,
}

struct Replacement {
    start: usize,
    end: usize,
    text: String,
}

fn apply_replacements(input: &str, mut replacements: Vec<Replacement>) -> String {
    replacements.sort_by_key(|r| r.start);
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0;
    for replacement in replacements {
        out.push_str(&input[cursor..replacement.start]);
        out.push_str(&replacement.text);
        cursor = replacement.end;
    }
    out.push_str(&input[cursor..]);
    out
}

/// Set the package's own version, preserving all other formatting.
pub fn rewrite_version(input: &str, new_version: &str) -> Result<String> {
    let borrowed: PackageJsonBorrowed = serde_json::from_str(input)
        .map_err(|e| ReleaseKitError::InvalidData(format!("failed to parse package.json: {e}")))?;
    let raw = borrowed
        .version
        .ok_or_else(|| ReleaseKitError::InvalidData("package.json has no version field".into()))?;
    let (start, end) = raw_span(raw, input);
    Ok(apply_replacements(
        input,
        vec![Replacement {
            start,
            end,
            text: format!("\"{new_version}\""),
        }],
    ))
}

/// Pin one `workspace:` dependency to a concrete version. The range prefix
/// survives: `workspace:^` becomes `^<version>`, `workspace:~` becomes
/// `~<version>`, and `workspace:*` becomes the exact version.
pub fn rewrite_dependency_version(
    input: &str,
    dep_name: &str,
    version: &str,
) -> Result<Option<String>> {
    let borrowed: PackageJsonBorrowed = serde_json::from_str(input)
        .map_err(|e| ReleaseKitError::InvalidData(format!("failed to parse package.json: {e}")))?;

    let sections = [
        borrowed.dependencies.as_ref(),
        borrowed.dev_dependencies.as_ref(),
        borrowed.peer_dependencies.as_ref(),
        borrowed.optional_dependencies.as_ref(),
    ];

    let mut replacements = Vec::new();
    for section in sections.into_iter().flatten() {
        let Some(raw) = section.get(dep_name) else {
            continue;
        };
        let current: String = serde_json::from_str(raw.get()).map_err(|e| {
            ReleaseKitError::InvalidData(format!(
                "dependency specifier for '{dep_name}' is not a string: {e}"
            ))
        })?;
        let Some(marker) = current.strip_prefix("workspace:") else {
            continue;
        };
        let pinned = match marker {
            "^" => format!("^{version}"),
            "~" => format!("~{version}"),
            _ => version.to_string(),
        };
        let (start, end) = raw_span(raw, input);
        replacements.push(Replacement {
            start,
            end,
            text: format!("\"{pinned}\""),
        });
    }

    if replacements.is_empty() {
        return Ok(None);
    }
    Ok(Some(apply_replacements(input, replacements)))
}

pub fn lock(workspace_root: &Path, _upgrade_package: Option<&str>) -> Result<()> {
    let status = pnpm()
        .args(["install", "--lockfile-only"])
        .current_dir(workspace_root)
        .status()
        .map_err(ReleaseKitError::Io)?;
    if !status.success() {
        return Err(ReleaseKitError::PackageManager(format!(
            "pnpm install --lockfile-only failed with status {status}"
        )));
    }
    Ok(())
}

pub fn build(package: &PackageInfo) -> Result<Vec<Artifact>> {
    let output = pnpm()
        .arg("pack")
        .current_dir(&package.path)
        .output()
        .map_err(ReleaseKitError::Io)?;
    if !output.status.success() {
        return Err(ReleaseKitError::PackageManager(format!(
            "pnpm pack failed for {}: {}",
            package.name,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    // pnpm prints the tarball filename on the last stdout line.
    let stdout = String::from_utf8_lossy(&output.stdout);
    let tarball = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.ends_with(".tgz"))
        .ok_or_else(|| {
            ReleaseKitError::PackageManager(format!(
                "pnpm pack produced no tarball for {}",
                package.name
            ))
        })?;
    let path = package.path.join(tarball);
    Ok(vec![Artifact {
        sha256: file_sha256(&path)?,
        path,
    }])
}

pub fn publish(package: &PackageInfo, dry_run: bool, extra_args: &[String]) -> Result<()> {
    let mut cmd = pnpm();
    cmd.args(["publish", "--no-git-checks"])
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
    if stderr.contains("previously published") || stderr.contains("cannot publish over") {
        return Ok(());
    }
    Err(ReleaseKitError::Publish(format!(
        "pnpm publish failed for {}: {}",
        package.name,
        stderr.trim()
    )))
}
