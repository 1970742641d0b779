use std::fs;
use std::path::{Path, PathBuf};

use super::{artifact_name, DestinationError, StorageDestination};
use crate::model::DestinationKind;

/// Copies artifacts into a directory.
#[derive(Debug, Clone)]
pub struct LocalDestination {
    dir: PathBuf,
}

impl LocalDestination {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if dir.is_relative() {
            log::warn!(target: "destination::local", "Destination directory is relative: {}", dir.display());
        }

        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl StorageDestination for LocalDestination {
    fn kind(&self) -> DestinationKind {
        DestinationKind::Local
    }

    fn upload(&self, local_path: &Path, logical_name: &str) -> Result<String, DestinationError> {
        fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(artifact_name(logical_name)?);
        fs::copy(local_path, &target)?;

        log::info!(target: "destination::local", "Stored artifact at {}", target.display());
        Ok(target.to_string_lossy().into_owned())
    }

    fn download(&self, handle: &str, into: &Path) -> Result<PathBuf, DestinationError> {
        let source = Path::new(handle);
        let target = into.join(artifact_name(handle)?);
        fs::copy(source, &target)?;

        log::debug!(target: "destination::local", "Fetched {} into {}", source.display(), into.display());
        Ok(target)
    }

    fn delete(&self, handle: &str) -> Result<(), DestinationError> {
        fs::remove_file(handle)?;
        log::debug!(target: "destination::local", "Removed {handle}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_creates_directory_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("nightly.sql.gz");
        fs::write(&artifact, b"dump").unwrap();

        let destination = LocalDestination::new(dir.path().join("nested/backups"));
        let handle = destination.upload(&artifact, "nightly.sql.gz").unwrap();
        assert!(Path::new(&handle).starts_with(destination.dir()));

        let scratch = dir.path().join("scratch");
        fs::create_dir(&scratch).unwrap();
        let fetched = destination.download(&handle, &scratch).unwrap();
        assert_eq!(fs::read(fetched).unwrap(), b"dump");

        destination.delete(&handle).unwrap();
        assert!(!Path::new(&handle).exists());
        assert!(destination.delete(&handle).is_err());
    }

    #[test]
    fn upload_fails_below_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        fs::write(dir.path().join("a"), b"x").unwrap();

        let destination = LocalDestination::new(blocker.join("backups"));
        assert!(destination.upload(&dir.path().join("a"), "a").is_err());
    }
}
