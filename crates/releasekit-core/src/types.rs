use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;

/// Identifies the ecosystem a package belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Cargo,
    Npm,
    Python,
    Go,
}

impl Ecosystem {
    /// Returns the canonical lowercase string representation (e.g. "cargo").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cargo => "cargo",
            Self::Npm => "npm",
            Self::Python => "python",
            Self::Go => "go",
        }
    }

    /// Returns a human-friendly display name (e.g. "Cargo").
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Cargo => "Cargo",
            Self::Npm => "npm",
            Self::Python => "Python",
            Self::Go => "Go",
        }
    }

    /// Parse an ecosystem from a case-insensitive string.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "cargo" | "rust" => Some(Self::Cargo),
            "npm" | "javascript" | "js" => Some(Self::Npm),
            "python" | "uv" => Some(Self::Python),
            "go" => Some(Self::Go),
            _ => None,
        }
    }
}

impl std::fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ecosystem {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(())
    }
}

/// Information about a package in the workspace.
///
/// `internal_deps` holds only workspace-mechanism edges: the target must
/// both be a workspace member and be declared through the workspace
/// mechanism (path dep, `workspace = true`, `workspace:*`). A pinned-
/// version reference to another member is an external dependency and does
/// not participate in the release graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    /// Canonical identifier in the form "<ecosystem>:<name>" (e.g. "cargo:releasekit-core")
    pub identifier: String,
    pub version: String,
    pub path: PathBuf,
    pub internal_deps: BTreeSet<String>,
    pub ecosystem: Ecosystem,
    /// Optional group label from the package-level config file.
    pub group: Option<String>,
}

impl PackageInfo {
    /// Returns the canonical identifier for this package.
    pub fn canonical_identifier(&self) -> &str {
        &self.identifier
    }

    /// Human-friendly name for display, optionally including the ecosystem.
    pub fn display_name(&self, include_ecosystem: bool) -> String {
        if include_ecosystem {
            format!("{} ({})", self.name, self.ecosystem.display_name())
        } else {
            self.name.clone()
        }
    }

    /// Helper to build a dependency identifier for a given ecosystem/name pair.
    pub fn dependency_identifier(ecosystem: Ecosystem, name: &str) -> String {
        format!("{}:{}", ecosystem.as_str(), name)
    }
}

/// Represents a workspace with its package members
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
    pub members: Vec<PackageInfo>,
}

impl Workspace {
    /// Returns the package matching the given canonical identifier, if any.
    pub fn find_by_identifier(&self, identifier: &str) -> Option<&PackageInfo> {
        self.members
            .iter()
            .find(|info| info.identifier == identifier)
    }

    /// Returns the first package matching the bare name.
    pub fn find_by_name(&self, name: &str) -> Option<&PackageInfo> {
        self.members.iter().find(|info| info.name == name)
    }

    /// Returns true when the workspace contains packages from multiple ecosystems.
    pub fn has_multiple_ecosystems(&self) -> bool {
        let mut ecosystems = self.members.iter().map(|info| info.ecosystem);
        if let Some(first) = ecosystems.next() {
            ecosystems.any(|eco| eco != first)
        } else {
            false
        }
    }
}

/// Semantic version bump kinds, ordered by impact
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bump {
    None,
    Prerelease,
    Patch,
    Minor,
    Major,
}

impl FromStr for Bump {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "prerelease" => Ok(Self::Prerelease),
            "patch" => Ok(Self::Patch),
            "minor" => Ok(Self::Minor),
            "major" => Ok(Self::Major),
            _ => Err(()),
        }
    }
}

impl Bump {
    /// Parse a bump kind from a string (convenient method that returns Option)
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Convert bump to string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Prerelease => "prerelease",
            Self::Patch => "patch",
            Self::Minor => "minor",
            Self::Major => "major",
        }
    }
}

impl std::fmt::Display for Bump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a package received its bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpReason {
    /// Commits touched the package directly.
    Direct,
    /// An internal dependency was bumped.
    Transitive,
    /// Synchronize mode aligned the whole workspace.
    Synchronize,
    /// Forced by `--force-unchanged`.
    Forced,
}

/// One planned version change for a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionBump {
    pub package: String,
    /// Canonical identifier of the package ("<ecosystem>:<name>").
    pub identifier: String,
    pub ecosystem: Ecosystem,
    pub from_version: String,
    pub to_version: String,
    pub kind: Bump,
    pub reason: BumpReason,
    /// Short shas of the commits that contributed to this bump.
    pub commits: Vec<String>,
}

/// A complete release plan: at most one bump per package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleasePlan {
    pub bumps: Vec<VersionBump>,
}

impl ReleasePlan {
    pub fn is_empty(&self) -> bool {
        self.bumps.is_empty()
    }

    /// Look up the planned bump for a package by name.
    pub fn bump_for(&self, package: &str) -> Option<&VersionBump> {
        self.bumps.iter().find(|b| b.package == package)
    }

    /// New versions keyed by package name, for manifest rewrites.
    pub fn new_versions(&self) -> std::collections::BTreeMap<String, String> {
        self.bumps
            .iter()
            .map(|b| (b.package.clone(), b.to_version.clone()))
            .collect()
    }
}

/// A built artifact with its local checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub sha256: String,
}

/// Handle to a forge pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrHandle {
    pub number: u64,
    pub url: String,
}

/// Handle to a forge release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseHandle {
    pub tag: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_package(name: &str) -> PackageInfo {
        PackageInfo {
            name: name.to_string(),
            identifier: PackageInfo::dependency_identifier(Ecosystem::Cargo, name),
            version: "0.1.0".to_string(),
            path: PathBuf::from(format!("crates/{name}")),
            internal_deps: BTreeSet::new(),
            ecosystem: Ecosystem::Cargo,
            group: None,
        }
    }

    #[test]
    fn bump_ordering_by_impact() {
        assert!(Bump::Major > Bump::Minor);
        assert!(Bump::Minor > Bump::Patch);
        assert!(Bump::Patch > Bump::Prerelease);
        assert!(Bump::Prerelease > Bump::None);
    }

    #[test]
    fn ecosystem_parse_accepts_aliases() {
        assert_eq!(Ecosystem::parse("rust"), Some(Ecosystem::Cargo));
        assert_eq!(Ecosystem::parse("uv"), Some(Ecosystem::Python));
        assert_eq!(Ecosystem::parse("JS"), Some(Ecosystem::Npm));
        assert_eq!(Ecosystem::parse("elixir"), None);
    }

    #[test]
    fn find_by_identifier_matches() {
        let workspace = Workspace {
            root: PathBuf::new(),
            members: vec![make_package("core")],
        };
        assert!(workspace.find_by_identifier("cargo:core").is_some());
        assert!(workspace.find_by_identifier("npm:core").is_none());
    }

    #[test]
    fn detects_multiple_ecosystems() {
        let mut pkg_b = make_package("web");
        pkg_b.ecosystem = Ecosystem::Npm;
        pkg_b.identifier = PackageInfo::dependency_identifier(Ecosystem::Npm, "web");
        let workspace = Workspace {
            root: PathBuf::new(),
            members: vec![make_package("core"), pkg_b],
        };
        assert!(workspace.has_multiple_ecosystems());
    }

    #[test]
    fn plan_lookup_and_new_versions() {
        let plan = ReleasePlan {
            bumps: vec![VersionBump {
                package: "core".into(),
                identifier: "cargo:core".into(),
                ecosystem: Ecosystem::Cargo,
                from_version: "1.0.0".into(),
                to_version: "1.1.0".into(),
                kind: Bump::Minor,
                reason: BumpReason::Direct,
                commits: vec!["abc1234".into()],
            }],
        };
        assert_eq!(plan.bump_for("core").unwrap().to_version, "1.1.0");
        assert_eq!(plan.new_versions().get("core").unwrap(), "1.1.0");
    }
}
