//! Backend modules producing and consuming raw backup artifacts.
//!
//! Currently the following backends are implemented:
//!
//! - [MariaDb]: SQL dump of the point-of-sale database.
//! - [FilesArchive]: tar archive of the configured asset directories.

pub mod files;
pub mod mariadb;

use std::path::{Path, PathBuf};

pub use files::{ArchiveError, FilesArchive, FilesConfig};
pub use mariadb::{ConnectionDescriptor, DumpError, MariaDb};

/// Overrides where a restore writes to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreTarget {
    /// Restore the dump into this database instead of the configured one.
    pub database: Option<String>,
    /// Extract the files archive below this directory instead of the configured root.
    pub files_root: Option<PathBuf>,
}

/// Generic backup backend.
pub trait Backend: Send + Sync {
    /// Error that may happen on backup or restore.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates the raw artifact inside `work_dir`.
    ///
    /// The artifact's file name starts with `prefix` followed by an underscore
    /// and the backend specific file name.
    fn backup(&self, work_dir: &Path, prefix: &str) -> Result<PathBuf, Self::Error>;

    /// Applies a raw artifact previously created by [backup](Self::backup).
    fn restore(&self, artifact: &Path, target: &RestoreTarget) -> Result<(), Self::Error>;
}

/// Backend producing SQL dumps.
pub type DatabaseBackend = dyn Backend<Error = DumpError>;

/// Backend producing file archives.
pub type FilesBackend = dyn Backend<Error = ArchiveError>;

#[cfg(test)]
pub(crate) mod fake {
    use std::fs;
    use std::sync::Mutex;

    use super::*;

    /// Database stand-in writing a fixed dump and recording restores.
    pub(crate) struct FakeDatabase {
        dump: Vec<u8>,
        pub restored: Mutex<Vec<(Vec<u8>, RestoreTarget)>>,
    }

    impl FakeDatabase {
        pub(crate) fn new(dump: Vec<u8>) -> Self {
            Self {
                dump,
                restored: Mutex::new(Vec::new()),
            }
        }
    }

    impl Backend for FakeDatabase {
        type Error = DumpError;

        fn backup(&self, work_dir: &Path, prefix: &str) -> Result<PathBuf, Self::Error> {
            let path = work_dir.join(format!("{prefix}_database.sql"));
            fs::write(&path, &self.dump)?;
            Ok(path)
        }

        fn restore(&self, artifact: &Path, target: &RestoreTarget) -> Result<(), Self::Error> {
            let content = fs::read(artifact)?;
            self.restored.lock().unwrap().push((content, target.clone()));
            Ok(())
        }
    }
}
