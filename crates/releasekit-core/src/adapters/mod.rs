//! Ecosystem-specific adapters (Cargo, npm/pnpm, Python/uv, Go) for
//! workspace discovery, manifest rewrites, builds, and publishing.
//!
//! Dart/pub, Gradle, and Bazel slot in here as further variants; the
//! rewrite-rule catalogs those tools need live behind the same method set.

pub mod cargo;
pub mod go;
pub mod npm;
pub mod python;

use crate::errors::Result;
use crate::types::{Artifact, Ecosystem, PackageInfo};
use std::path::{Path, PathBuf};

/// Package ecosystem adapter, selected by the `(ecosystem, tool)` keys of a
/// workspace section. Static dispatch, zero-cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcosystemAdapter {
    Cargo,
    Npm,
    Python,
    Go,
}

impl EcosystemAdapter {
    /// All registered adapters, checked in order during workspace discovery.
    pub fn all() -> &'static [EcosystemAdapter] {
        &[Self::Cargo, Self::Npm, Self::Python, Self::Go]
    }

    pub fn for_ecosystem(ecosystem: Ecosystem) -> Self {
        match ecosystem {
            Ecosystem::Cargo => Self::Cargo,
            Ecosystem::Npm => Self::Npm,
            Ecosystem::Python => Self::Python,
            Ecosystem::Go => Self::Go,
        }
    }

    pub fn ecosystem(&self) -> Ecosystem {
        match self {
            Self::Cargo => Ecosystem::Cargo,
            Self::Npm => Ecosystem::Npm,
            Self::Python => Ecosystem::Python,
            Self::Go => Ecosystem::Go,
        }
    }

    /// Check if this adapter can handle the given directory.
    pub fn can_discover(&self, root: &Path) -> bool {
        match self {
            Self::Cargo => cargo::can_discover(root),
            Self::Npm => npm::can_discover(root),
            Self::Python => python::can_discover(root),
            Self::Go => go::can_discover(root),
        }
    }

    /// Discover all packages in the workspace rooted at `root`.
    pub fn discover(&self, root: &Path) -> Result<Vec<PackageInfo>> {
        match self {
            Self::Cargo => cargo::discover(root),
            Self::Npm => npm::discover(root),
            Self::Python => python::discover(root),
            Self::Go => go::discover(root),
        }
    }

    /// Get the path to the manifest file for a package directory.
    pub fn manifest_path(&self, package_dir: &Path) -> PathBuf {
        match self {
            Self::Cargo => package_dir.join("Cargo.toml"),
            Self::Npm => package_dir.join("package.json"),
            Self::Python => package_dir.join("pyproject.toml"),
            Self::Go => package_dir.join("go.mod"),
        }
    }

    /// Check if a package is publishable to its primary registry.
    pub fn is_publishable(&self, manifest_path: &Path) -> Result<bool> {
        match self {
            Self::Cargo => cargo::is_publishable(manifest_path),
            Self::Npm => npm::is_publishable(manifest_path),
            Self::Python => python::is_publishable(manifest_path),
            Self::Go => Ok(true),
        }
    }

    /// Rewrite the package's own version in its manifest text.
    ///
    /// Go is a no-op: the git tag is the authoritative version source.
    pub fn rewrite_version(&self, input: &str, new_version: &str) -> Result<String> {
        match self {
            Self::Cargo => cargo::rewrite_version(input, new_version),
            Self::Npm => npm::rewrite_version(input, new_version),
            Self::Python => python::rewrite_version(input, new_version),
            Self::Go => Ok(input.to_string()),
        }
    }

    /// Rewrite one internal dependency to a concrete hosted version for the
    /// duration of a publish. Returns the rewritten manifest text, or
    /// `None` when the dependency needs no pinning in this ecosystem.
    pub fn rewrite_dependency_version(
        &self,
        input: &str,
        dep_name: &str,
        version: &str,
    ) -> Result<Option<String>> {
        match self {
            Self::Cargo => cargo::rewrite_dependency_version(input, dep_name, version),
            Self::Npm => npm::rewrite_dependency_version(input, dep_name, version),
            Self::Python => python::rewrite_dependency_version(input, dep_name, version),
            Self::Go => Ok(None),
        }
    }

    /// Regenerate the workspace lockfile after version updates.
    pub fn lock(&self, workspace_root: &Path, upgrade_package: Option<&str>) -> Result<()> {
        match self {
            Self::Cargo => cargo::lock(workspace_root, upgrade_package),
            Self::Npm => npm::lock(workspace_root, upgrade_package),
            Self::Python => python::lock(workspace_root, upgrade_package),
            Self::Go => Ok(()),
        }
    }

    /// Build the package and return the produced artifacts with checksums.
    pub fn build(&self, package: &PackageInfo) -> Result<Vec<Artifact>> {
        match self {
            Self::Cargo => cargo::build(package),
            Self::Npm => npm::build(package),
            Self::Python => python::build(package),
            Self::Go => go::build(package),
        }
    }

    /// Execute the publish command for a package.
    ///
    /// Go publishing is the tag push performed by the release step; the
    /// adapter only confirms through registry polling.
    pub fn publish(
        &self,
        package: &PackageInfo,
        dry_run: bool,
        extra_args: &[String],
    ) -> Result<()> {
        match self {
            Self::Cargo => cargo::publish(package, dry_run, extra_args),
            Self::Npm => npm::publish(package, dry_run, extra_args),
            Self::Python => python::publish(package, dry_run, extra_args),
            Self::Go => Ok(()),
        }
    }

    pub fn supports_publish_dry_run(&self) -> bool {
        matches!(self, Self::Cargo | Self::Npm)
    }
}

/// Compute the sha256 of a file on disk for artifact records.
pub(crate) fn file_sha256(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .map_err(|e| crate::errors::io_error_with_path(e, path))?;
    Ok(crate::backends::registry::hex_sha256(&bytes))
}
