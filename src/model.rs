//! Records persisted by the backup engine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use derive_more::{Display, Error};

use crate::util::compression::CompressionAlgorithm;
use crate::util::retention::RetentionConfig;
use crate::util::schedule::{Schedule, ScheduleError};

/// What a [BackupConfig] backs up.
///
/// Every kind except [BackupType::Files] produces a database dump.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    #[display("full")]
    Full,
    #[display("incremental")]
    Incremental,
    #[display("differential")]
    Differential,
    #[display("database")]
    Database,
    #[display("files")]
    Files,
}

impl BackupType {
    /// Returns if the kind needs the relational database.
    pub fn is_database(self) -> bool {
        !matches!(self, Self::Files)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    /// Artifact uploaded to every destination.
    #[display("success")]
    Success,
    /// Artifact created but no upload succeeded, or creating it failed.
    #[display("failed")]
    Failed,
    /// Artifact uploaded to some, but not all destinations.
    #[display("partial")]
    Partial,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    #[display("object_storage")]
    ObjectStorage,
    #[display("local")]
    Local,
}

/// Where a [BackupConfig] uploads its artifacts.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestinationConfig {
    /// Upload to the configured object storage.
    ObjectStorage {
        /// Overrides the process-wide logical prefix.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
    /// Copy into a local directory, created if absent.
    Local { path: PathBuf },
}

impl DestinationConfig {
    pub fn kind(&self) -> DestinationKind {
        match self {
            Self::ObjectStorage { .. } => DestinationKind::ObjectStorage,
            Self::Local { .. } => DestinationKind::Local,
        }
    }
}

/// Email recipients notified after a run.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub on_success: Vec<String>,
    #[serde(default)]
    pub on_failure: Vec<String>,
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[display("backup configuration needs a name")]
    MissingName,
    #[display("backup configuration '{_0}' has no destination")]
    NoDestination(#[error(ignore)] String),
    #[display("local destination of '{_0}' has an empty path")]
    EmptyLocalPath(#[error(ignore)] String),
    #[display("invalid schedule of '{name}': {source}")]
    InvalidSchedule { name: String, source: ScheduleError },
}

/// A named, scheduled backup job.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BackupConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    /// Cron-like schedule expression, see [Schedule].
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub compression: CompressionAlgorithm,
    #[serde(default)]
    pub encryption: bool,
    pub destinations: Vec<DestinationConfig>,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub enabled: bool,
}

impl BackupConfig {
    /// Configuration with a fresh id and defaults for everything optional.
    pub fn new(name: impl Into<String>, backup_type: BackupType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            backup_type,
            schedule: String::new(),
            retention: RetentionConfig::default(),
            compression: CompressionAlgorithm::default(),
            encryption: false,
            destinations: Vec::new(),
            notifications: NotificationConfig::default(),
            enabled: false,
        }
    }

    /// Parsed schedule, if one is set.
    pub fn parsed_schedule(&self) -> Result<Option<Schedule>, ConfigError> {
        if self.schedule.trim().is_empty() {
            return Ok(None);
        }
        self.schedule
            .parse()
            .map(Some)
            .map_err(|source| ConfigError::InvalidSchedule {
                name: self.name.clone(),
                source,
            })
    }

    /// Checks the invariants every stored configuration upholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        if self.destinations.is_empty() {
            return Err(ConfigError::NoDestination(self.name.clone()));
        }
        for destination in &self.destinations {
            if let DestinationConfig::Local { path } = destination {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::EmptyLocalPath(self.name.clone()));
                }
            }
        }

        match self.parsed_schedule()? {
            None if self.enabled => Err(ConfigError::InvalidSchedule {
                name: self.name.clone(),
                source: ScheduleError::Empty,
            }),
            _ => Ok(()),
        }
    }
}

/// Where one artifact of a [BackupResult] was stored.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ArtifactLocation {
    pub kind: DestinationKind,
    /// Destination specific handle: a path for local, an URL for object storage.
    pub handle: String,
}

/// Outcome of a single backup run.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BackupResult {
    pub id: String,
    pub config_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    /// Size of the final artifact in bytes.
    pub size: u64,
    pub duration_secs: f64,
    pub status: BackupStatus,
    pub locations: Vec<ArtifactLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SHA-256 of the final artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl BackupResult {
    /// Returns if the result refers to an artifact that can be restored.
    pub fn is_restorable(&self) -> bool {
        self.status != BackupStatus::Failed && self.checksum.is_some() && !self.locations.is_empty()
    }
}

/// Operator visible safety checkpoint referencing a backup.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RestorePoint {
    pub id: String,
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified: Option<DateTime<Utc>>,
}

impl RestorePoint {
    pub fn new(backup_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            backup_id: backup_id.into(),
            timestamp: Utc::now(),
            description: description.into(),
            verified: false,
            last_verified: None,
        }
    }
}
