//! Administrative surface composing store, orchestrators, retention and scheduler.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use derive_more::{Display, Error, From};

use crate::backends::{DumpError, FilesArchive, MariaDb, RestoreTarget};
use crate::destinations::{Destinations, HttpObjectStore, ObjectStore};
use crate::model::{BackupConfig, BackupResult, BackupStatus, ConfigError, RestorePoint};
use crate::notify::{LogNotifier, Notifier, SendmailNotifier};
use crate::orchestrator::{BackupError, BackupOrchestrator};
use crate::restore::{RestoreError, RestoreOrchestrator};
use crate::scheduler::{BackupRunner, BackupScheduler, SchedulerHandle};
use crate::settings::{AppConfig, NotifierKind};
use crate::store::{BackupRepository, JsonFileStore, StoreError};
use crate::util::encryption::{CryptoError, StaticKeyProvider};
use crate::util::retention::{RetentionPolicy, RetentionReport};

#[derive(Debug, Display, Error, From)]
pub enum ManagerError {
    #[display("backup configuration {_0} does not exist")]
    #[from(ignore)]
    UnknownConfig(#[error(ignore)] String),
    #[from]
    Config(ConfigError),
    #[from]
    Backup(BackupError),
    #[from]
    Restore(RestoreError),
    #[from]
    Store(StoreError),
    #[display("invalid database connection: {_0}")]
    #[from]
    Connection(DumpError),
    #[display("invalid encryption key: {_0}")]
    #[from]
    Key(CryptoError),
}

/// Runs retention for one configuration, protecting results referenced by restore points.
fn retention_pass(
    orchestrator: &BackupOrchestrator,
    config: &BackupConfig,
) -> Result<RetentionReport, StoreError> {
    let repository = orchestrator.repository();
    let pinned: HashSet<String> = repository
        .restore_points()?
        .into_iter()
        .map(|point| point.backup_id)
        .collect();
    let results = repository.results(&config.id)?;

    log::info!(target: "retention", "Applying retention to '{}' ({} results)", config.name, results.len());
    let policy = RetentionPolicy::new(config.retention, Utc::now());
    Ok(policy.apply(repository, orchestrator.destinations(), &results, &pinned))
}

/// [BackupRunner] used for timer driven runs: backup, then retention.
struct ScheduledRuns {
    orchestrator: Arc<BackupOrchestrator>,
}

impl BackupRunner for ScheduledRuns {
    fn run_scheduled(&self, config: &BackupConfig) {
        match self.orchestrator.try_run_backup(config) {
            Ok(Some(result)) => {
                log::debug!(target: "scheduler", "Scheduled backup '{}' finished with status {}", config.name, result.status);
            }
            Ok(None) => {
                log::warn!(target: "scheduler", "Skipping scheduled backup '{}': a run is still in progress", config.name);
                return;
            }
            Err(e) => {
                log::error!(target: "scheduler", "Scheduled backup '{}' failed: {e}", config.name);
                return;
            }
        }

        if let Err(e) = retention_pass(&self.orchestrator, config) {
            log::error!(target: "retention", "Retention of '{}' failed: {e}", config.name);
        }
    }
}

/// Entry point for every administrative operation.
pub struct BackupManager {
    orchestrator: Arc<BackupOrchestrator>,
    restores: RestoreOrchestrator,
    scheduler: Arc<BackupScheduler>,
}

impl BackupManager {
    pub fn new(orchestrator: Arc<BackupOrchestrator>) -> Self {
        let scheduler = Arc::new(BackupScheduler::new(Arc::new(ScheduledRuns {
            orchestrator: orchestrator.clone(),
        })));

        Self {
            restores: RestoreOrchestrator::new(orchestrator.clone()),
            orchestrator,
            scheduler,
        }
    }

    /// Wires the production collaborators described by `settings`.
    pub fn from_settings(settings: &AppConfig) -> Result<Self, ManagerError> {
        let repository = BackupRepository::new(Arc::new(JsonFileStore::open(&settings.store_path)?));

        let database = MariaDb::new(settings.connection()?)
            .with_commands(&settings.dump_command, &settings.restore_command)
            .with_timeout(settings.subprocess_timeout());
        let files = FilesArchive::new(settings.files.clone());

        let destinations = match &settings.object_storage {
            Some(object_storage) => {
                let store: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(
                    &object_storage.base_url,
                    object_storage.token.clone(),
                ));
                Destinations::new(Some(store), Some(object_storage.prefix.clone()))
            }
            None => Destinations::default(),
        };

        let keys = StaticKeyProvider::from_hex(settings.encryption_key.as_deref())?;
        let notifier: Arc<dyn Notifier> = match settings.notification.kind {
            NotifierKind::Log => Arc::new(LogNotifier),
            NotifierKind::Sendmail => Arc::new(SendmailNotifier::new(
                &settings.notification.sendmail_command,
                &settings.notification.from,
            )),
        };

        Ok(Self::new(Arc::new(BackupOrchestrator::new(
            repository,
            destinations,
            Arc::new(database),
            Arc::new(files),
            Arc::new(keys),
            notifier,
            &settings.work_dir,
        ))))
    }

    fn repository(&self) -> &BackupRepository {
        self.orchestrator.repository()
    }

    fn existing_config(&self, id: &str) -> Result<BackupConfig, ManagerError> {
        self.repository()
            .config(id)?
            .ok_or_else(|| ManagerError::UnknownConfig(id.to_string()))
    }

    /// Validates, stores and schedules a new configuration.
    pub fn create_config(&self, config: BackupConfig) -> Result<BackupConfig, ManagerError> {
        config.validate()?;
        self.repository().save_config(&config)?;
        self.scheduler.schedule_backup(&config)?;
        log::info!(target: "manager", "Created backup configuration '{}' ({})", config.name, config.id);
        Ok(config)
    }

    /// Replaces an existing configuration and reschedules it.
    pub fn update_config(&self, config: BackupConfig) -> Result<BackupConfig, ManagerError> {
        self.existing_config(&config.id)?;
        config.validate()?;
        self.repository().save_config(&config)?;
        self.scheduler.schedule_backup(&config)?;
        log::info!(target: "manager", "Updated backup configuration '{}'", config.name);
        Ok(config)
    }

    /// Removes a configuration and its timer. Its result history is kept.
    pub fn delete_config(&self, id: &str) -> Result<(), ManagerError> {
        let config = self.existing_config(id)?;
        self.scheduler.unschedule(id);
        self.repository().delete_config(id)?;
        log::info!(target: "manager", "Deleted backup configuration '{}'", config.name);
        Ok(())
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<BackupConfig, ManagerError> {
        let mut config = self.existing_config(id)?;
        config.enabled = enabled;
        self.update_config(config)
    }

    pub fn get_config(&self, id: &str) -> Result<Option<BackupConfig>, ManagerError> {
        Ok(self.repository().config(id)?)
    }

    pub fn list_configs(&self) -> Result<Vec<BackupConfig>, ManagerError> {
        Ok(self.repository().configs()?)
    }

    /// Runs a backup of `config_id` now, waiting for a scheduled run of it to finish first.
    pub fn trigger_backup(&self, config_id: &str) -> Result<BackupResult, ManagerError> {
        let config = self.existing_config(config_id)?;
        Ok(self.orchestrator.run_backup(&config)?)
    }

    pub fn list_results(&self, config_id: &str) -> Result<Vec<BackupResult>, ManagerError> {
        Ok(self.repository().results(config_id)?)
    }

    pub fn verify_result(&self, result_id: &str) -> Result<bool, ManagerError> {
        Ok(self.restores.verify_result(result_id)?)
    }

    pub fn restore(&self, result_id: &str, target: Option<RestoreTarget>) -> Result<(), ManagerError> {
        Ok(self.restores.restore(result_id, target)?)
    }

    pub fn create_restore_point(
        &self,
        result_id: &str,
        description: impl Into<String>,
    ) -> Result<RestorePoint, ManagerError> {
        Ok(self.restores.create_restore_point(result_id, description)?)
    }

    pub fn list_restore_points(&self) -> Result<Vec<RestorePoint>, ManagerError> {
        Ok(self.repository().restore_points()?)
    }

    pub fn verify_restore_point(&self, restore_point_id: &str) -> Result<RestorePoint, ManagerError> {
        Ok(self.restores.verify_restore_point(restore_point_id)?)
    }

    pub fn rollback_to(&self, restore_point_id: &str) -> Result<(), ManagerError> {
        Ok(self.restores.rollback_to(restore_point_id)?)
    }

    /// Applies retention to one configuration or, without id, to all of them.
    pub fn run_retention(
        &self,
        config_id: Option<&str>,
    ) -> Result<Vec<(BackupConfig, RetentionReport)>, ManagerError> {
        let configs = match config_id {
            Some(id) => vec![self.existing_config(id)?],
            None => self.list_configs()?,
        };

        configs
            .into_iter()
            .map(|config| {
                let report = retention_pass(&self.orchestrator, &config)?;
                Ok((config, report))
            })
            .collect()
    }

    /// Schedules every stored configuration and starts the timer thread.
    pub fn start_scheduler(&self) -> Result<SchedulerHandle, ManagerError> {
        let jobs = self.scheduler.load_all(self.repository())?;
        log::info!(target: "manager", "Loaded {jobs} scheduled backup configurations");
        Ok(self.scheduler.start())
    }

    pub fn scheduler(&self) -> &BackupScheduler {
        &self.scheduler
    }

    /// Results of `config_id` that did not fail.
    pub fn restorable_results(&self, config_id: &str) -> Result<Vec<BackupResult>, ManagerError> {
        Ok(self
            .list_results(config_id)?
            .into_iter()
            .filter(|result| result.status != BackupStatus::Failed)
            .collect())
    }
}
