//! Places artifacts are uploaded to.
//!
//! - [LocalDestination]: copy into a directory on the local filesystem.
//! - [ObjectStorageDestination]: upload through an [ObjectStore].

pub mod local;
pub mod object;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use derive_more::{Display, Error, From};

pub use local::LocalDestination;
pub use object::{HttpObjectStore, ObjectStorageDestination, ObjectStore};

use crate::model::{ArtifactLocation, DestinationConfig, DestinationKind};

/// Default logical prefix of artifacts in object storage.
pub const DEFAULT_OBJECT_PREFIX: &str = "backups";

#[derive(Debug, Display, Error, From)]
pub enum DestinationError {
    #[display("destination I/O failed: {_0}")]
    Io(io::Error),
    #[display("object storage request failed: {_0}")]
    Http(reqwest::Error),
    #[display("object storage answered {status} for {url}")]
    #[from(ignore)]
    Status { status: u16, url: String },
    #[display("no object storage configured")]
    #[from(ignore)]
    NoObjectStore,
    #[display("invalid location handle: {_0}")]
    #[from(ignore)]
    InvalidHandle(#[error(ignore)] String),
}

impl DestinationError {
    /// The artifact isn't there (any more).
    pub fn is_not_found(&self) -> bool {
        match self {
            DestinationError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            DestinationError::Status { status, .. } => *status == 404,
            _ => false,
        }
    }
}

/// An upload target for backup artifacts.
pub trait StorageDestination: Send + Sync {
    fn kind(&self) -> DestinationKind;

    /// Stores `local_path` under `logical_name` and returns the location handle.
    fn upload(&self, local_path: &Path, logical_name: &str) -> Result<String, DestinationError>;

    /// Fetches the artifact identified by `handle` into the directory `into`.
    fn download(&self, handle: &str, into: &Path) -> Result<PathBuf, DestinationError>;

    /// Removes the artifact identified by `handle`.
    fn delete(&self, handle: &str) -> Result<(), DestinationError>;
}

/// File name of the artifact behind `handle`, refusing anything that could escape a directory.
pub(crate) fn artifact_name(handle: &str) -> Result<String, DestinationError> {
    let name = handle
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .ok_or_else(|| DestinationError::InvalidHandle(handle.to_string()))?;
    Ok(name.to_string())
}

/// Builds [StorageDestination]s from configurations and recorded locations.
#[derive(Clone, Default)]
pub struct Destinations {
    object_store: Option<Arc<dyn ObjectStore>>,
    object_prefix: Option<String>,
}

impl Destinations {
    pub fn new(object_store: Option<Arc<dyn ObjectStore>>, object_prefix: Option<String>) -> Self {
        Self {
            object_store,
            object_prefix,
        }
    }

    fn object_storage(&self, prefix: Option<&str>) -> Result<ObjectStorageDestination, DestinationError> {
        let store = self
            .object_store
            .clone()
            .ok_or(DestinationError::NoObjectStore)?;
        let prefix = prefix
            .or(self.object_prefix.as_deref())
            .unwrap_or(DEFAULT_OBJECT_PREFIX);
        Ok(ObjectStorageDestination::new(store, prefix))
    }

    /// Destination to upload to.
    pub fn resolve(
        &self,
        config: &DestinationConfig,
    ) -> Result<Box<dyn StorageDestination>, DestinationError> {
        Ok(match config {
            DestinationConfig::ObjectStorage { prefix } => {
                Box::new(self.object_storage(prefix.as_deref())?)
            }
            DestinationConfig::Local { path } => Box::new(LocalDestination::new(path)),
        })
    }

    /// Destination able to download or delete an already stored artifact.
    pub fn for_location(
        &self,
        location: &ArtifactLocation,
    ) -> Result<Box<dyn StorageDestination>, DestinationError> {
        Ok(match location.kind {
            DestinationKind::ObjectStorage => Box::new(self.object_storage(None)?),
            DestinationKind::Local => {
                let dir = Path::new(&location.handle)
                    .parent()
                    .ok_or_else(|| DestinationError::InvalidHandle(location.handle.clone()))?;
                Box::new(LocalDestination::new(dir))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_name_strips_directories() {
        assert_eq!(
            artifact_name("https://s3.example.com/backups/a.sql.gz").unwrap(),
            "a.sql.gz"
        );
        assert_eq!(artifact_name("/var/backups/b.tar").unwrap(), "b.tar");
        assert!(artifact_name("/var/backups/").is_err());
        assert!(artifact_name("..").is_err());
    }

    #[test]
    fn missing_artifacts_are_recognized() {
        assert!(DestinationError::Io(io::ErrorKind::NotFound.into()).is_not_found());
        assert!(DestinationError::Status {
            status: 404,
            url: "https://s3.example.com/backups/a.sql.gz".into()
        }
        .is_not_found());
        assert!(!DestinationError::Io(io::ErrorKind::PermissionDenied.into()).is_not_found());
        assert!(!DestinationError::Status {
            status: 503,
            url: "https://s3.example.com/backups/a.sql.gz".into()
        }
        .is_not_found());
    }

    #[test]
    fn object_storage_requires_store() {
        let destinations = Destinations::default();
        let err = destinations
            .resolve(&DestinationConfig::ObjectStorage { prefix: None })
            .err()
            .unwrap();
        assert!(matches!(err, DestinationError::NoObjectStore));
    }
}
