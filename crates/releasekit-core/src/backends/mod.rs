//! Abstract backend contracts. The core depends only on these traits;
//! concrete adapters live in the submodules and are selected from
//! configuration at startup.

pub mod git;
pub mod github;
pub mod registry;

use crate::commits::Commit;
use crate::errors::Result;
use crate::types::{PrHandle, ReleaseHandle};
use std::path::PathBuf;

/// Version-control operations.
///
/// Implementations are blocking; async layers offload calls with
/// `spawn_blocking`.
pub trait Vcs: Send + Sync {
    fn is_clean(&self) -> Result<bool>;
    fn is_shallow(&self) -> Result<bool>;
    fn current_sha(&self) -> Result<String>;
    fn current_branch(&self) -> Result<String>;
    /// Commits reachable from HEAD since (exclusive) the given tag,
    /// optionally scoped to paths.
    fn log(&self, since_tag: Option<&str>, paths: &[PathBuf]) -> Result<Vec<Commit>>;
    /// Files changed since the given sha.
    fn diff(&self, sha: &str) -> Result<Vec<PathBuf>>;
    fn commit(&self, paths: &[PathBuf], message: &str) -> Result<String>;
    fn tag(&self, name: &str, message: &str) -> Result<()>;
    fn tag_exists(&self, name: &str) -> Result<bool>;
    fn list_tags(&self, pattern: Option<&str>) -> Result<Vec<String>>;
    fn push(&self, reference: &str, force: bool) -> Result<()>;
    fn checkout(&self, reference: &str) -> Result<()>;
    fn cherry_pick(&self, sha: &str) -> Result<()>;
}

/// PR state filter for [`Forge::list_prs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Merged,
    All,
}

/// Forge (GitHub, …) operations. Features a forge does not support must
/// log a warning and return success rather than fail the release.
pub trait Forge: Send + Sync {
    fn is_available(&self) -> Result<bool>;
    fn create_pr(
        &self,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<PrHandle>;
    fn update_pr(&self, handle: &PrHandle, title: &str, body: &str) -> Result<()>;
    fn get_pr_body(&self, handle: &PrHandle) -> Result<String>;
    fn list_prs(&self, label: Option<&str>, state: PrState) -> Result<Vec<PrHandle>>;
    fn merge_pr(&self, handle: &PrHandle) -> Result<()>;
    fn create_release(
        &self,
        tag: &str,
        name: &str,
        body: &str,
        draft: bool,
        prerelease: bool,
    ) -> Result<ReleaseHandle>;
    fn release_exists(&self, tag: &str) -> Result<bool>;
    fn add_labels(&self, handle: &PrHandle, labels: &[String]) -> Result<()>;
    fn remove_labels(&self, handle: &PrHandle, labels: &[String]) -> Result<()>;
    fn repository_dispatch(&self, event_type: &str, payload: &serde_json::Value) -> Result<()>;
}

/// Registry queries. All operations are bounded by the caller's configured
/// timeouts; transient failures surface as
/// [`crate::errors::ReleaseKitError::RegistryTransient`].
pub trait Registry: Send + Sync {
    fn check_published(&self, name: &str, version: &str) -> Result<bool>;
    fn latest_version(&self, name: &str) -> Result<Option<String>>;
    /// Compare the registry's artifact checksum against the locally built
    /// one. `Ok(())` on match; a mismatch is a permanent failure.
    fn verify_checksum(&self, name: &str, version: &str, expected_sha256: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // The traits must stay object-safe: they are held as Arc<dyn …>
    // throughout the publisher.
    fn _assert_object_safe(
        _vcs: &dyn Vcs,
        _forge: &dyn Forge,
        _registry: &dyn Registry,
    ) {
    }
}
