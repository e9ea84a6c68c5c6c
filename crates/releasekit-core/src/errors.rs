use std::io;
use std::path::Path;

/// Common error type for ReleaseKit operations
#[derive(Debug, thiserror::Error)]
pub enum ReleaseKitError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Dependency cycle: {0}")]
    Cycle(String),

    #[error("Git error: {0}")]
    Vcs(String),

    #[error("Git error (transient): {0}")]
    VcsTransient(String),

    #[error("Forge error: {0}")]
    Forge(String),

    #[error("Forge error (transient): {0}")]
    ForgeTransient(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Registry error (transient): {0}")]
    RegistryTransient(String),

    #[error("Package manager error: {0}")]
    PackageManager(String),

    #[error("Release error: {0}")]
    Release(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Run journal error: {0}")]
    Journal(String),

    #[error("Pin integrity error: {0}")]
    PinIntegrity(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("No releasable changes")]
    NothingToRelease,
}

pub type Result<T> = std::result::Result<T, ReleaseKitError>;

impl ReleaseKitError {
    /// Whether the scheduler may retry the failed operation.
    ///
    /// Only explicitly transient classes retry; everything else is
    /// permanent for the attempt that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RegistryTransient(_) | Self::VcsTransient(_) | Self::ForgeTransient(_)
        )
    }

    /// Process exit code for this error class.
    ///
    /// 1 = user error, 2 = remote/transient, 3 = fatal state,
    /// 10 = no releasable changes (only meaningful under `--if-needed`).
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::RegistryTransient(_) | Self::VcsTransient(_) | Self::ForgeTransient(_) => 2,
            Self::Cycle(_) | Self::PinIntegrity(_) => 3,
            Self::NothingToRelease => 10,
            _ => 1,
        }
    }
}

/// Attach the offending path to an opaque IO error.
pub fn io_error_with_path(err: io::Error, path: &Path) -> io::Error {
    io::Error::new(err.kind(), format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ReleaseKitError::RegistryTransient("503".into()).is_transient());
        assert!(!ReleaseKitError::Registry("auth".into()).is_transient());
        assert!(!ReleaseKitError::Publish("rejected".into()).is_transient());
    }

    #[test]
    fn exit_codes_follow_taxonomy() {
        assert_eq!(ReleaseKitError::Config("bad key".into()).exit_code(), 1);
        assert_eq!(
            ReleaseKitError::RegistryTransient("timeout".into()).exit_code(),
            2
        );
        assert_eq!(ReleaseKitError::Cycle("a -> b -> a".into()).exit_code(), 3);
        assert_eq!(
            ReleaseKitError::PinIntegrity("backup missing".into()).exit_code(),
            3
        );
        assert_eq!(ReleaseKitError::NothingToRelease.exit_code(), 10);
    }
}
