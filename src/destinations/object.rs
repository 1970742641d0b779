use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::blocking::Client;

use super::{artifact_name, DestinationError, StorageDestination};
use crate::model::DestinationKind;

/// Object storage collaborator.
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `name` and returns the object URL.
    fn upload(&self, bytes: Vec<u8>, name: &str) -> Result<String, DestinationError>;
    fn download(&self, url: &str) -> Result<Vec<u8>, DestinationError>;
    fn delete(&self, url: &str) -> Result<(), DestinationError>;
}

/// [ObjectStore] speaking plain HTTP: `PUT`, `GET` and `DELETE` on `<base_url>/<name>`.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn authorize(&self, request: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn check(response: reqwest::blocking::Response, url: &str) -> Result<reqwest::blocking::Response, DestinationError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(DestinationError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            })
        }
    }
}

impl ObjectStore for HttpObjectStore {
    fn upload(&self, bytes: Vec<u8>, name: &str) -> Result<String, DestinationError> {
        let url = format!("{}/{}", self.base_url, name.trim_start_matches('/'));
        let response = self.authorize(self.client.put(&url).body(bytes)).send()?;
        Self::check(response, &url)?;
        Ok(url)
    }

    fn download(&self, url: &str) -> Result<Vec<u8>, DestinationError> {
        let response = self.authorize(self.client.get(url)).send()?;
        Ok(Self::check(response, url)?.bytes()?.to_vec())
    }

    fn delete(&self, url: &str) -> Result<(), DestinationError> {
        let response = self.authorize(self.client.delete(url)).send()?;
        Self::check(response, url)?;
        Ok(())
    }
}

/// Uploads artifacts to an [ObjectStore] under a fixed logical prefix.
#[derive(Clone)]
pub struct ObjectStorageDestination {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStorageDestination {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }
}

impl StorageDestination for ObjectStorageDestination {
    fn kind(&self) -> DestinationKind {
        DestinationKind::ObjectStorage
    }

    fn upload(&self, local_path: &Path, logical_name: &str) -> Result<String, DestinationError> {
        let bytes = fs::read(local_path)?;
        let name = format!("{}/{}", self.prefix, artifact_name(logical_name)?);
        let url = self.store.upload(bytes, &name)?;

        log::info!(target: "destination::object", "Uploaded artifact to {url}");
        Ok(url)
    }

    fn download(&self, handle: &str, into: &Path) -> Result<PathBuf, DestinationError> {
        let target = into.join(artifact_name(handle)?);
        fs::write(&target, self.store.download(handle)?)?;

        log::debug!(target: "destination::object", "Downloaded {handle} into {}", into.display());
        Ok(target)
    }

    fn delete(&self, handle: &str) -> Result<(), DestinationError> {
        self.store.delete(handle)?;
        log::debug!(target: "destination::object", "Deleted {handle}");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory [ObjectStore] handing out `mem://` URLs.
    #[derive(Default)]
    pub(crate) struct MemoryObjectStore {
        pub objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl ObjectStore for MemoryObjectStore {
        fn upload(&self, bytes: Vec<u8>, name: &str) -> Result<String, DestinationError> {
            let url = format!("mem://bucket/{name}");
            self.objects.lock().unwrap().insert(url.clone(), bytes);
            Ok(url)
        }

        fn download(&self, url: &str) -> Result<Vec<u8>, DestinationError> {
            self.objects
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| DestinationError::Status {
                    status: 404,
                    url: url.to_string(),
                })
        }

        fn delete(&self, url: &str) -> Result<(), DestinationError> {
            self.objects.lock().unwrap().remove(url);
            Ok(())
        }
    }

    #[test]
    fn names_artifacts_under_prefix() {
        let store = Arc::new(MemoryObjectStore::default());
        let destination = ObjectStorageDestination::new(store.clone(), "/pos/backups/");

        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("nightly.tar.bz2");
        fs::write(&artifact, b"archive").unwrap();

        let url = destination.upload(&artifact, "nightly.tar.bz2").unwrap();
        assert_eq!(url, "mem://bucket/pos/backups/nightly.tar.bz2");

        let scratch = dir.path().join("scratch");
        fs::create_dir(&scratch).unwrap();
        let fetched = destination.download(&url, &scratch).unwrap();
        assert_eq!(fetched, scratch.join("nightly.tar.bz2"));
        assert_eq!(fs::read(&fetched).unwrap(), b"archive");

        destination.delete(&url).unwrap();
        assert!(store.objects.lock().unwrap().is_empty());
    }
}
