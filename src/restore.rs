//! Restores recorded backups and manages restore points.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use derive_more::{Display, Error, From};

use crate::backends::{ArchiveError, DumpError, RestoreTarget};
use crate::model::{BackupResult, BackupStatus, BackupType, RestorePoint};
use crate::orchestrator::BackupOrchestrator;
use crate::store::StoreError;
use crate::util::encryption::{self, CryptoError};
use crate::util::{checksum, compression};

#[derive(Debug, Display, Error, From)]
pub enum RestoreError {
    #[display("backup result {_0} does not exist")]
    #[from(ignore)]
    NotFound(#[error(ignore)] String),
    #[display("restore point {_0} does not exist")]
    #[from(ignore)]
    RestorePointNotFound(#[error(ignore)] String),
    /// Failed results or results without checksum can't be restored.
    #[display("backup result {_0} is not restorable")]
    #[from(ignore)]
    NotRestorable(#[error(ignore)] String),
    #[display("creating working directory failed: {_0}")]
    #[from(ignore)]
    WorkDir(io::Error),
    /// No recorded location could be downloaded.
    #[display("downloading artifact failed: {_0}")]
    #[from(ignore)]
    Download(#[error(ignore)] String),
    #[display("hashing downloaded artifact failed: {_0}")]
    #[from(ignore)]
    Checksum(io::Error),
    /// The downloaded artifact is not the one that was uploaded.
    #[display("integrity check failed: expected sha256 {expected}, got {actual}")]
    #[from(ignore)]
    IntegrityMismatch { expected: String, actual: String },
    #[display("decryption failed: {_0}")]
    #[from]
    Decryption(CryptoError),
    #[display("decompression failed: {_0}")]
    #[from(ignore)]
    Decompression(io::Error),
    #[display("database restore failed: {_0}")]
    #[from]
    Database(DumpError),
    #[display("files restore failed: {_0}")]
    #[from]
    Files(ArchiveError),
    #[from]
    Store(StoreError),
}

/// Reverses the backup chain: download → verify → decrypt → decompress → restore.
pub struct RestoreOrchestrator {
    backups: Arc<BackupOrchestrator>,
}

impl RestoreOrchestrator {
    pub fn new(backups: Arc<BackupOrchestrator>) -> Self {
        Self { backups }
    }

    fn restorable(&self, backup_id: &str) -> Result<BackupResult, RestoreError> {
        let result = self
            .backups
            .repository()
            .result(backup_id)?
            .ok_or_else(|| RestoreError::NotFound(backup_id.to_string()))?;
        if !result.is_restorable() {
            return Err(RestoreError::NotRestorable(backup_id.to_string()));
        }
        Ok(result)
    }

    /// Downloads the artifact from the first working location into `into` and checks its digest.
    fn fetch_verified(&self, result: &BackupResult, into: &Path) -> Result<PathBuf, RestoreError> {
        let expected = result.checksum.as_deref().unwrap_or_default();

        let mut errors = Vec::new();
        let mut downloaded = None;
        for location in &result.locations {
            let fetched = self
                .backups
                .destinations()
                .for_location(location)
                .and_then(|destination| destination.download(&location.handle, into));
            match fetched {
                Ok(path) => {
                    downloaded = Some(path);
                    break;
                }
                Err(e) => {
                    log::warn!(target: "restore", "Downloading {} failed: {e}", location.handle);
                    errors.push(format!("{}: {e}", location.handle));
                }
            }
        }
        let path = downloaded.ok_or_else(|| RestoreError::Download(errors.join("; ")))?;

        let actual = checksum::digest(&path).map_err(RestoreError::Checksum)?;
        if !checksum::matches(&actual, expected) {
            log::error!(target: "restore", "Artifact of backup {} does not match its checksum", result.id);
            return Err(RestoreError::IntegrityMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        log::debug!(target: "restore", "Artifact of backup {} verified", result.id);
        Ok(path)
    }

    /// Downloads the artifact of `backup_id` and compares it to the recorded checksum.
    pub fn verify_result(&self, backup_id: &str) -> Result<bool, RestoreError> {
        let result = self.restorable(backup_id)?;
        let work_dir = self
            .backups
            .work_dir("verify-")
            .map_err(RestoreError::WorkDir)?;

        let verified = match self.fetch_verified(&result, work_dir.path()) {
            Ok(_) => Ok(true),
            Err(RestoreError::IntegrityMismatch { .. }) => Ok(false),
            Err(e) => Err(e),
        };
        close(work_dir);
        verified
    }

    /// Restores `backup_id`, preceded by a best-effort safety backup of the current state.
    ///
    /// The safety backup is of the same kind as `backup_id`: a database backup before a
    /// database restore, an asset archive before a files restore.
    ///
    /// A failing restore is not rolled back; use [rollback_to](Self::rollback_to) with
    /// the pre-restore point.
    pub fn restore(&self, backup_id: &str, target: Option<RestoreTarget>) -> Result<(), RestoreError> {
        self.restore_inner(backup_id, &target.unwrap_or_default(), true)
    }

    /// Restores the backup a restore point refers to, without a further safety backup.
    pub fn rollback_to(&self, restore_point_id: &str) -> Result<(), RestoreError> {
        let point = self
            .backups
            .repository()
            .restore_point(restore_point_id)?
            .ok_or_else(|| RestoreError::RestorePointNotFound(restore_point_id.to_string()))?;
        log::warn!(target: "restore", "Rolling back to restore point {} ({})", point.id, point.description);

        self.restore_inner(&point.backup_id, &RestoreTarget::default(), false)
    }

    fn restore_inner(
        &self,
        backup_id: &str,
        target: &RestoreTarget,
        safety_backup: bool,
    ) -> Result<(), RestoreError> {
        let result = self.restorable(backup_id)?;
        log::info!(target: "restore", "Restoring {} backup {backup_id} from {}", result.backup_type, result.timestamp);

        let work_dir = self
            .backups
            .work_dir("restore-")
            .map_err(RestoreError::WorkDir)?;
        let restored = self
            .fetch_verified(&result, work_dir.path())
            .and_then(|artifact| {
                if safety_backup {
                    self.pre_restore_point(&result);
                }
                self.apply(&result, &artifact, target)
            });
        close(work_dir);

        match &restored {
            Ok(()) => log::info!(target: "restore", "Restore of backup {backup_id} finished"),
            Err(e) => log::error!(target: "restore", "Restore of backup {backup_id} failed: {e}"),
        }
        restored
    }

    fn apply(&self, result: &BackupResult, artifact: &Path, target: &RestoreTarget) -> Result<(), RestoreError> {
        let mut path = artifact.to_path_buf();
        if encryption::is_encrypted(&path) {
            let key = self.backups.keys().key()?;
            path = encryption::decrypt(&path, &key)?;
        }
        path = compression::decompress(&path).map_err(RestoreError::Decompression)?;

        if result.backup_type == BackupType::Files {
            self.backups.files().restore(&path, target)?;
        } else {
            self.backups.database().restore(&path, target)?;
        }
        Ok(())
    }

    /// Backs up the current state through the result's configuration and records a restore point.
    fn pre_restore_point(&self, result: &BackupResult) {
        let config = match self.backups.repository().config(&result.config_id) {
            Ok(Some(config)) => config,
            Ok(None) => {
                log::warn!(target: "restore", "Skipping pre-restore backup: configuration {} no longer exists", result.config_id);
                return;
            }
            Err(e) => {
                log::warn!(target: "restore", "Skipping pre-restore backup: {e}");
                return;
            }
        };

        let safety = match self.backups.run_backup(&config) {
            Ok(safety) if safety.status != BackupStatus::Failed => safety,
            Ok(safety) => {
                log::warn!(target: "restore", "Pre-restore backup failed: {}", safety.error.unwrap_or_default());
                return;
            }
            Err(e) => {
                log::warn!(target: "restore", "Pre-restore backup failed: {e}");
                return;
            }
        };

        let point = RestorePoint::new(
            safety.id,
            format!("Pre-restore safety backup before restoring {}", result.id),
        );
        match self.backups.repository().save_restore_point(&point) {
            Ok(()) => log::info!(target: "restore", "Created pre-restore point {}", point.id),
            Err(e) => log::warn!(target: "restore", "Saving pre-restore point failed: {e}"),
        }
    }

    /// Records a restore point for `backup_id` after verifying the backup.
    pub fn create_restore_point(
        &self,
        backup_id: &str,
        description: impl Into<String>,
    ) -> Result<RestorePoint, RestoreError> {
        let verified = self.verify_result(backup_id)?;
        let mut point = RestorePoint::new(backup_id, description);
        point.verified = verified;
        point.last_verified = Some(Utc::now());

        self.backups.repository().save_restore_point(&point)?;
        log::info!(target: "restore", "Created restore point {} for backup {backup_id} (verified: {verified})", point.id);
        Ok(point)
    }

    /// Re-verifies the backup behind a restore point and records the outcome.
    pub fn verify_restore_point(&self, restore_point_id: &str) -> Result<RestorePoint, RestoreError> {
        let repository = self.backups.repository();
        let mut point = repository
            .restore_point(restore_point_id)?
            .ok_or_else(|| RestoreError::RestorePointNotFound(restore_point_id.to_string()))?;

        point.verified = match self.verify_result(&point.backup_id) {
            Ok(verified) => verified,
            Err(e @ (RestoreError::NotFound(_) | RestoreError::NotRestorable(_))) => {
                log::warn!(target: "restore", "Restore point {restore_point_id} is dangling: {e}");
                false
            }
            Err(e) => return Err(e),
        };
        point.last_verified = Some(Utc::now());
        repository.save_restore_point(&point)?;
        Ok(point)
    }
}

fn close(work_dir: tempfile::TempDir) {
    if let Err(e) = work_dir.close() {
        log::warn!(target: "restore", "Removing working directory failed: {e}");
    }
}
