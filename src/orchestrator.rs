//! Runs a single backup end to end.
//!
//! dump/archive → compress → encrypt → checksum → upload → record → notify

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use derive_more::{Display, Error, From};
use tempfile::TempDir;

use crate::backends::{ArchiveError, DatabaseBackend, DumpError, FilesBackend};
use crate::destinations::Destinations;
use crate::model::{
    ArtifactLocation, BackupConfig, BackupResult, BackupStatus, BackupType, ConfigError,
};
use crate::notify::{self, Notifier};
use crate::store::{BackupRepository, StoreError};
use crate::util::encryption::{self, CryptoError, EncryptionKeyProvider};
use crate::util::{checksum, compression};

#[derive(Debug, Display, Error, From)]
pub enum BackupError {
    /// Configuration rejected before anything ran.
    #[from]
    Config(ConfigError),
    #[display("creating working directory failed: {_0}")]
    #[from(ignore)]
    WorkDir(io::Error),
    #[display("database dump failed: {_0}")]
    #[from]
    Dump(DumpError),
    #[display("files archive failed: {_0}")]
    #[from]
    Archive(ArchiveError),
    #[display("compression failed: {_0}")]
    #[from(ignore)]
    Compression(io::Error),
    #[display("encryption failed: {_0}")]
    #[from]
    Encryption(CryptoError),
    #[display("checksum failed: {_0}")]
    #[from(ignore)]
    Checksum(io::Error),
    #[display("upload to every destination failed: {_0}")]
    #[from(ignore)]
    Upload(#[error(ignore)] String),
    #[display("persisting backup result failed: {_0}")]
    #[from]
    Store(StoreError),
    #[display("run lock of configuration {_0} is poisoned")]
    #[from(ignore)]
    Poisoned(#[error(ignore)] String),
}

/// Final artifact of a run, before upload.
struct Artifact {
    path: PathBuf,
    size: u64,
    checksum: String,
}

/// Composes the backends, codecs and destinations into backup runs.
///
/// Runs of the same configuration are serialized by a per-configuration lock.
pub struct BackupOrchestrator {
    repository: BackupRepository,
    destinations: Destinations,
    database: Arc<DatabaseBackend>,
    files: Arc<FilesBackend>,
    keys: Arc<dyn EncryptionKeyProvider>,
    notifier: Arc<dyn Notifier>,
    work_root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BackupOrchestrator {
    pub fn new(
        repository: BackupRepository,
        destinations: Destinations,
        database: Arc<DatabaseBackend>,
        files: Arc<FilesBackend>,
        keys: Arc<dyn EncryptionKeyProvider>,
        notifier: Arc<dyn Notifier>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repository,
            destinations,
            database,
            files,
            keys,
            notifier,
            work_root: work_root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &BackupRepository {
        &self.repository
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    pub(crate) fn database(&self) -> &DatabaseBackend {
        self.database.as_ref()
    }

    pub(crate) fn files(&self) -> &FilesBackend {
        self.files.as_ref()
    }

    pub(crate) fn keys(&self) -> &dyn EncryptionKeyProvider {
        self.keys.as_ref()
    }

    /// Root of the per-run working directories.
    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    /// Creates an isolated working directory, removed when dropped.
    pub(crate) fn work_dir(&self, prefix: &str) -> io::Result<TempDir> {
        fs::create_dir_all(&self.work_root)?;
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.work_root)
    }

    fn run_lock(&self, config_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(config_id.to_string()).or_default().clone()
    }

    /// Runs the backup matching the configuration's kind, waiting for a running one to finish.
    pub fn run_backup(&self, config: &BackupConfig) -> Result<BackupResult, BackupError> {
        if config.backup_type.is_database() {
            self.run_database_backup(config)
        } else {
            self.run_files_backup(config)
        }
    }

    /// Like [run_backup](Self::run_backup) but returns `None` if a run of the same
    /// configuration is already in progress.
    pub fn try_run_backup(&self, config: &BackupConfig) -> Result<Option<BackupResult>, BackupError> {
        config.validate()?;
        let lock = self.run_lock(&config.id);
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Poisoned(_)) => return Err(BackupError::Poisoned(config.id.clone())),
        };

        let backup_type = if config.backup_type.is_database() {
            config.backup_type
        } else {
            BackupType::Files
        };
        self.execute(config, backup_type).map(Some)
    }

    /// Dumps the database and stores the artifact at every destination.
    pub fn run_database_backup(&self, config: &BackupConfig) -> Result<BackupResult, BackupError> {
        let backup_type = if config.backup_type.is_database() {
            config.backup_type
        } else {
            BackupType::Database
        };
        self.run_locked(config, backup_type)
    }

    /// Archives the asset directories and stores the artifact at every destination.
    pub fn run_files_backup(&self, config: &BackupConfig) -> Result<BackupResult, BackupError> {
        self.run_locked(config, BackupType::Files)
    }

    fn run_locked(&self, config: &BackupConfig, backup_type: BackupType) -> Result<BackupResult, BackupError> {
        config.validate()?;
        let lock = self.run_lock(&config.id);
        let _guard: MutexGuard<'_, ()> = lock
            .lock()
            .map_err(|_| BackupError::Poisoned(config.id.clone()))?;

        self.execute(config, backup_type)
    }

    fn execute(&self, config: &BackupConfig, backup_type: BackupType) -> Result<BackupResult, BackupError> {
        let started = Instant::now();
        let timestamp = Utc::now();
        log::info!(target: "orchestrator", "Starting {backup_type} backup '{}'", config.name);

        let mut result = BackupResult {
            id: uuid::Uuid::new_v4().to_string(),
            config_id: config.id.clone(),
            timestamp,
            backup_type,
            size: 0,
            duration_secs: 0.0,
            status: BackupStatus::Failed,
            locations: Vec::new(),
            error: None,
            checksum: None,
        };

        match self.work_dir("backup-") {
            Ok(work_dir) => {
                self.produce_and_upload(config, backup_type, work_dir.path(), &mut result);
                if let Err(e) = work_dir.close() {
                    log::warn!(target: "orchestrator", "Removing working directory failed: {e}");
                }
            }
            Err(e) => result.error = Some(BackupError::WorkDir(e).to_string()),
        }
        result.duration_secs = started.elapsed().as_secs_f64();

        match result.status {
            BackupStatus::Success => {
                log::info!(target: "orchestrator", "Backup '{}' finished in {:.1}s ({} bytes)", config.name, result.duration_secs, result.size)
            }
            BackupStatus::Partial => {
                log::warn!(target: "orchestrator", "Backup '{}' only partially uploaded: {}", config.name, result.error.as_deref().unwrap_or_default())
            }
            BackupStatus::Failed => {
                log::error!(target: "orchestrator", "Backup '{}' failed: {}", config.name, result.error.as_deref().unwrap_or_default())
            }
        }

        let persisted = self.repository.save_result(&result);
        notify::notify(self.notifier.as_ref(), config, &result);

        if let Err(e) = persisted {
            log::error!(target: "orchestrator", "Persisting result of backup '{}' failed: {e}", config.name);
            return Err(e.into());
        }
        Ok(result)
    }

    fn produce_and_upload(
        &self,
        config: &BackupConfig,
        backup_type: BackupType,
        work_dir: &Path,
        result: &mut BackupResult,
    ) {
        let artifact = match self.produce(config, backup_type, work_dir, result.timestamp) {
            Ok(artifact) => artifact,
            Err(e) => {
                result.error = Some(e.to_string());
                return;
            }
        };
        result.size = artifact.size;
        result.checksum = Some(artifact.checksum.clone());

        let logical_name = artifact
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut failures = Vec::new();
        for destination_config in &config.destinations {
            let uploaded = self
                .destinations
                .resolve(destination_config)
                .and_then(|destination| destination.upload(&artifact.path, &logical_name));
            match uploaded {
                Ok(handle) => result.locations.push(ArtifactLocation {
                    kind: destination_config.kind(),
                    handle,
                }),
                Err(e) => {
                    log::warn!(target: "orchestrator", "Upload of {logical_name} to {} failed: {e}", destination_config.kind());
                    failures.push(format!("{}: {e}", destination_config.kind()));
                }
            }
        }

        (result.status, result.error) = match (failures.is_empty(), result.locations.is_empty()) {
            (true, _) => (BackupStatus::Success, None),
            (false, false) => (
                BackupStatus::Partial,
                Some(format!(
                    "upload to {} of {} destinations failed: {}",
                    failures.len(),
                    config.destinations.len(),
                    failures.join("; ")
                )),
            ),
            (false, true) => (
                BackupStatus::Failed,
                Some(BackupError::Upload(failures.join("; ")).to_string()),
            ),
        };
    }

    /// Creates, compresses, encrypts and hashes the artifact.
    fn produce(
        &self,
        config: &BackupConfig,
        backup_type: BackupType,
        work_dir: &Path,
        timestamp: DateTime<Utc>,
    ) -> Result<Artifact, BackupError> {
        // resolve the key first so a missing key fails before the dump
        let key = if config.encryption {
            Some(self.keys.key()?)
        } else {
            None
        };

        let prefix = artifact_prefix(&config.name, timestamp);
        let mut path = if backup_type == BackupType::Files {
            self.files.backup(work_dir, &prefix)?
        } else {
            self.database.backup(work_dir, &prefix)?
        };

        let compressed =
            compression::compress(&path, config.compression).map_err(BackupError::Compression)?;
        if compressed != path {
            discard(&path);
            path = compressed;
        }

        if let Some(key) = key {
            let encrypted = encryption::encrypt(&path, &key)?;
            discard(&path);
            path = encrypted;
        }

        let size = fs::metadata(&path).map_err(BackupError::Checksum)?.len();
        let checksum = checksum::digest(&path).map_err(BackupError::Checksum)?;
        log::debug!(target: "orchestrator", "Artifact {} ({size} bytes, sha256 {checksum})", path.display());

        Ok(Artifact {
            path,
            size,
            checksum,
        })
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        log::warn!(target: "orchestrator", "Removing intermediate {} failed: {e}", path.display());
    }
}

/// `<name>_<ISO 8601 timestamp with ':' and '.' replaced by '-'>`
pub fn artifact_prefix(config_name: &str, timestamp: DateTime<Utc>) -> String {
    let name: String = config_name
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let timestamp = timestamp
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
        .replace([':', '.'], "-");

    format!("{name}_{timestamp}")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::backends::fake::FakeDatabase;
    use crate::backends::{FilesArchive, FilesConfig, MariaDb};
    use crate::destinations::object::tests::MemoryObjectStore;
    use crate::destinations::ObjectStore;
    use crate::model::DestinationConfig;
    use crate::notify::tests::RecordingNotifier;
    use crate::store::MemoryStore;
    use crate::util::compression::CompressionAlgorithm;
    use crate::util::encryption::{EncryptionKey, StaticKeyProvider};

    struct Fixture {
        dir: TempDir,
        orchestrator: BackupOrchestrator,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture_with(database: Arc<DatabaseBackend>, key: Option<EncryptionKey>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let orchestrator = BackupOrchestrator::new(
            BackupRepository::new(Arc::new(MemoryStore::new())),
            Destinations::default(),
            database,
            Arc::new(FilesArchive::new(FilesConfig {
                root: dir.path().join("app"),
                directories: vec!["uploads".into()],
            })),
            Arc::new(StaticKeyProvider::new(key)),
            notifier.clone(),
            dir.path().join("work"),
        );

        Fixture {
            dir,
            orchestrator,
            notifier,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            Arc::new(FakeDatabase::new(b"INSERT INTO sales VALUES (1);".to_vec())),
            Some(EncryptionKey::from_bytes([7; 32])),
        )
    }

    fn config(dir: &Path) -> BackupConfig {
        let mut config = BackupConfig::new("nightly db", BackupType::Database);
        config.destinations.push(DestinationConfig::Local {
            path: dir.join("dest-a"),
        });
        config.notifications.on_success = vec!["owner@example.com".into()];
        config.notifications.on_failure = vec!["ops@example.com".into()];
        config
    }

    fn work_root_is_empty(orchestrator: &BackupOrchestrator) -> bool {
        fs::read_dir(orchestrator.work_root())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[test]
    fn artifact_prefix_follows_naming_convention() {
        let timestamp = Utc.with_ymd_and_hms(2024, 7, 1, 2, 30, 5).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(
            artifact_prefix("Nightly DB/main", timestamp),
            "Nightly-DB-main_2024-07-01T02-30-05-042Z"
        );
    }

    #[test]
    fn successful_compressed_encrypted_backup() {
        let Fixture {
            dir,
            orchestrator,
            notifier,
        } = fixture();
        let mut config = config(dir.path());
        config.compression = CompressionAlgorithm::Bzip2;
        config.encryption = true;

        let result = orchestrator.run_database_backup(&config).unwrap();
        assert_eq!(result.status, BackupStatus::Success);
        assert_eq!(result.error, None);
        assert_eq!(result.locations.len(), 1);

        let stored = PathBuf::from(&result.locations[0].handle);
        let name = stored.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("nightly-db_"), "{name}");
        assert!(name.ends_with("_database.sql.bz2.enc"), "{name}");
        assert_eq!(fs::metadata(&stored).unwrap().len(), result.size);
        assert_eq!(
            checksum::digest(&stored).unwrap(),
            result.checksum.clone().unwrap()
        );

        assert_eq!(
            orchestrator.repository().result(&result.id).unwrap(),
            Some(result.clone())
        );
        assert!(work_root_is_empty(&orchestrator));

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, vec!["owner@example.com".to_string()]);
    }

    #[test]
    fn second_destination_failing_is_partial() {
        let Fixture {
            dir,
            orchestrator,
            notifier,
        } = fixture();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();

        let mut config = config(dir.path());
        config.destinations.push(DestinationConfig::Local {
            path: blocker.join("dest-b"),
        });

        let result = orchestrator.run_database_backup(&config).unwrap();
        assert_eq!(result.status, BackupStatus::Partial);
        assert_eq!(result.locations.len(), 1);
        assert!(result.checksum.is_some());
        assert!(result.error.unwrap().contains("1 of 2"));
        assert_eq!(notifier.sent.lock().unwrap()[0].0, vec!["ops@example.com".to_string()]);
    }

    #[test]
    fn every_destination_failing_is_failed() {
        let Fixture { dir, orchestrator, .. } = fixture();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();

        let mut config = config(dir.path());
        config.destinations = vec![
            DestinationConfig::Local {
                path: blocker.join("a"),
            },
            DestinationConfig::ObjectStorage { prefix: None },
        ];

        let result = orchestrator.run_database_backup(&config).unwrap();
        assert_eq!(result.status, BackupStatus::Failed);
        assert!(result.locations.is_empty());
    }

    #[test]
    fn unreachable_database_fails_and_cleans_up() {
        let connection = "mysql://pos:pw@127.0.0.1:1/pos".parse().unwrap();
        let database = MariaDb::new(Some(connection))
            .with_commands("pos-backup-test-missing-dump", "pos-backup-test-missing-restore")
            .with_timeout(Duration::from_secs(5));
        let Fixture {
            dir,
            orchestrator,
            notifier,
        } = fixture_with(Arc::new(database), None);
        let config = config(dir.path());

        let result = orchestrator.run_database_backup(&config).unwrap();
        assert_eq!(result.status, BackupStatus::Failed);
        assert!(result.locations.is_empty());
        assert!(result.checksum.is_none());
        assert!(!result.error.clone().unwrap_or_default().is_empty());
        assert!(work_root_is_empty(&orchestrator));
        assert!(!dir.path().join("dest-a").exists());

        assert_eq!(
            orchestrator.repository().results(&config.id).unwrap(),
            vec![result]
        );
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn encryption_without_key_fails_loudly() {
        let Fixture { dir, orchestrator, .. } = fixture_with(
            Arc::new(FakeDatabase::new(b"dump".to_vec())),
            None,
        );
        let mut config = config(dir.path());
        config.encryption = true;

        let result = orchestrator.run_database_backup(&config).unwrap();
        assert_eq!(result.status, BackupStatus::Failed);
        assert!(result.error.unwrap().contains("no encryption key"));
    }

    #[test]
    fn files_backup_archives_assets() {
        let Fixture { dir, orchestrator, .. } = fixture();
        fs::create_dir_all(dir.path().join("app/uploads")).unwrap();
        fs::write(dir.path().join("app/uploads/logo.png"), b"png").unwrap();

        let mut config = config(dir.path());
        config.backup_type = BackupType::Files;
        config.compression = CompressionAlgorithm::None;

        let result = orchestrator.run_backup(&config).unwrap();
        assert_eq!(result.status, BackupStatus::Success);
        assert_eq!(result.backup_type, BackupType::Files);
        assert!(result.locations[0].handle.ends_with("_files.tar"));
    }

    #[test]
    fn uploads_to_object_storage_under_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(MemoryObjectStore::default());
        let orchestrator = BackupOrchestrator::new(
            BackupRepository::new(Arc::new(MemoryStore::new())),
            Destinations::new(Some(objects.clone() as Arc<dyn ObjectStore>), Some("pos".into())),
            Arc::new(FakeDatabase::new(b"dump".to_vec())),
            Arc::new(FilesArchive::new(FilesConfig::default())),
            Arc::new(StaticKeyProvider::default()),
            Arc::new(RecordingNotifier::default()),
            dir.path().join("work"),
        );

        let mut config = config(dir.path());
        config.destinations.push(DestinationConfig::ObjectStorage {
            prefix: Some("nightly".into()),
        });
        config.compression = CompressionAlgorithm::None;

        let result = orchestrator.run_database_backup(&config).unwrap();
        assert_eq!(result.status, BackupStatus::Success);
        assert_eq!(result.locations.len(), 2);
        assert_eq!(result.locations[1].kind, crate::model::DestinationKind::ObjectStorage);
        assert!(result.locations[1].handle.starts_with("mem://bucket/nightly/nightly-db_"));
        assert_eq!(
            objects.objects.lock().unwrap().get(&result.locations[1].handle),
            Some(&b"dump".to_vec())
        );
    }

    #[test]
    fn invalid_config_is_rejected_synchronously() {
        let Fixture { dir, orchestrator, .. } = fixture();
        let mut config = config(dir.path());
        config.destinations.clear();

        assert!(matches!(
            orchestrator.run_database_backup(&config),
            Err(BackupError::Config(ConfigError::NoDestination(_)))
        ));
        assert!(orchestrator.repository().results(&config.id).unwrap().is_empty());
    }

    #[test]
    fn concurrent_runs_of_one_config_are_serialized() {
        let Fixture { dir, orchestrator, .. } = fixture();
        let config = config(dir.path());

        let lock = orchestrator.run_lock(&config.id);
        let guard = lock.lock().unwrap();
        assert!(orchestrator.try_run_backup(&config).unwrap().is_none());

        let mut other = config.clone();
        other.id = "other".into();
        assert!(orchestrator.try_run_backup(&other).unwrap().is_some());

        drop(guard);
        assert!(orchestrator.try_run_backup(&config).unwrap().is_some());
    }
}
