//! Fires backups of enabled configurations according to their schedules.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::model::{BackupConfig, ConfigError};
use crate::store::{BackupRepository, StoreError};
use crate::util::schedule::Schedule;

const TICK: Duration = Duration::from_secs(1);

/// Executes a scheduled run. Implementations handle and log their own errors.
pub trait BackupRunner: Send + Sync {
    fn run_scheduled(&self, config: &BackupConfig);
}

struct Job {
    config: BackupConfig,
    schedule: Schedule,
    next_run: DateTime<Local>,
}

/// Keeps at most one timer per configuration id.
pub struct BackupScheduler {
    runner: Arc<dyn BackupRunner>,
    jobs: Mutex<HashMap<String, Job>>,
}

impl BackupScheduler {
    pub fn new(runner: Arc<dyn BackupRunner>) -> Self {
        Self {
            runner,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re-)schedules `config`, replacing any timer of the same id.
    ///
    /// Disabled configurations are unscheduled. Invalid ones are rejected
    /// without touching the existing timer.
    pub fn schedule_backup(&self, config: &BackupConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let schedule = match config.parsed_schedule()? {
            Some(schedule) if config.enabled => schedule,
            _ => {
                self.unschedule(&config.id);
                return Ok(());
            }
        };

        let next_run = schedule
            .next_after(Local::now())
            .map_err(|source| ConfigError::InvalidSchedule {
                name: config.name.clone(),
                source,
            })?;
        log::info!(target: "scheduler", "Scheduled '{}' ({}), next run at {next_run}", config.name, schedule.as_str());

        let job = Job {
            config: config.clone(),
            schedule,
            next_run,
        };
        if self.jobs().insert(config.id.clone(), job).is_some() {
            log::debug!(target: "scheduler", "Replaced previous timer of '{}'", config.name);
        }
        Ok(())
    }

    /// Removes the timer of `config_id`. Returns if one existed.
    pub fn unschedule(&self, config_id: &str) -> bool {
        let removed = self.jobs().remove(config_id);
        if let Some(job) = &removed {
            log::info!(target: "scheduler", "Unscheduled '{}'", job.config.name);
        }
        removed.is_some()
    }

    pub fn is_scheduled(&self, config_id: &str) -> bool {
        self.jobs().contains_key(config_id)
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs().len()
    }

    /// Next run of `config_id`, if scheduled.
    pub fn next_run(&self, config_id: &str) -> Option<DateTime<Local>> {
        self.jobs().get(config_id).map(|job| job.next_run)
    }

    /// Schedules every stored configuration, logging the ones that are invalid.
    pub fn load_all(&self, repository: &BackupRepository) -> Result<usize, StoreError> {
        for config in repository.configs()? {
            if let Err(e) = self.schedule_backup(&config) {
                log::error!(target: "scheduler", "Not scheduling '{}': {e}", config.name);
            }
        }
        Ok(self.active_jobs())
    }

    /// Starts a run for every job due at `now` and advances its timer.
    pub fn fire_due(&self, now: DateTime<Local>) -> Vec<JoinHandle<()>> {
        let mut due = Vec::new();
        {
            let mut jobs = self.jobs();
            let mut exhausted = Vec::new();
            for (id, job) in jobs.iter_mut() {
                if job.next_run > now {
                    continue;
                }
                due.push(job.config.clone());

                match job.schedule.next_after(now) {
                    Ok(next_run) => job.next_run = next_run,
                    Err(e) => {
                        log::error!(target: "scheduler", "'{}' has no further run: {e}", job.config.name);
                        exhausted.push(id.clone());
                    }
                }
            }
            for id in exhausted {
                jobs.remove(&id);
            }
        }

        due.into_iter()
            .map(|config| {
                let runner = self.runner.clone();
                log::debug!(target: "scheduler", "Firing scheduled backup '{}'", config.name);
                thread::spawn(move || runner.run_scheduled(&config))
            })
            .collect()
    }

    /// Starts the timer thread.
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        let (shutdown, signal) = mpsc::channel();
        let scheduler = self.clone();
        let thread = thread::spawn(move || loop {
            match signal.recv_timeout(TICK) {
                Err(RecvTimeoutError::Timeout) => {
                    scheduler.fire_due(Local::now());
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        log::info!(target: "scheduler", "Scheduler started with {} jobs", self.active_jobs());

        SchedulerHandle { shutdown, thread }
    }
}

/// Running timer thread of a [BackupScheduler].
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops firing new runs. Runs already in progress continue.
    pub fn stop(self) {
        let _ = self.shutdown.send(());
        if self.thread.join().is_err() {
            log::error!(target: "scheduler", "Scheduler thread panicked");
        }
    }

    /// Blocks until the timer thread exits.
    pub fn wait(self) {
        if self.thread.join().is_err() {
            log::error!(target: "scheduler", "Scheduler thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::model::{BackupType, DestinationConfig};
    use crate::store::MemoryStore;

    #[derive(Default)]
    struct CountingRunner {
        runs: AtomicUsize,
    }

    impl BackupRunner for CountingRunner {
        fn run_scheduled(&self, _config: &BackupConfig) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(schedule: &str) -> BackupConfig {
        let mut config = BackupConfig::new("every minute", BackupType::Database);
        config.schedule = schedule.into();
        config.enabled = true;
        config.destinations.push(DestinationConfig::Local {
            path: "/var/backups/pos".into(),
        });
        config
    }

    fn tick(scheduler: &BackupScheduler, now: DateTime<Local>) {
        for handle in scheduler.fire_due(now) {
            handle.join().unwrap();
        }
    }

    #[test]
    fn rescheduling_keeps_a_single_timer() {
        let runner = Arc::new(CountingRunner::default());
        let scheduler = BackupScheduler::new(runner.clone());
        let config = config("* * * * *");

        scheduler.schedule_backup(&config).unwrap();
        scheduler.schedule_backup(&config).unwrap();
        assert_eq!(scheduler.active_jobs(), 1);

        let start = scheduler.next_run(&config.id).unwrap();
        let ticks = 5;
        for minute in 0..ticks {
            tick(&scheduler, start + ChronoDuration::minutes(minute));
        }
        assert_eq!(runner.runs.load(Ordering::SeqCst), ticks as usize);
    }

    #[test]
    fn jobs_fire_only_when_due() {
        let runner = Arc::new(CountingRunner::default());
        let scheduler = BackupScheduler::new(runner.clone());
        let config = config("0 3 * * *");
        scheduler.schedule_backup(&config).unwrap();

        let next = scheduler.next_run(&config.id).unwrap();
        tick(&scheduler, next - ChronoDuration::seconds(1));
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);

        tick(&scheduler, next);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        assert!(scheduler.next_run(&config.id).unwrap() > next);
    }

    #[test]
    fn disabled_and_invalid_configs() {
        let scheduler = BackupScheduler::new(Arc::new(CountingRunner::default()));
        let mut config = config("@daily");
        scheduler.schedule_backup(&config).unwrap();
        assert!(scheduler.is_scheduled(&config.id));

        let mut broken = config.clone();
        broken.schedule = "61 * * * *".into();
        assert!(matches!(
            scheduler.schedule_backup(&broken),
            Err(ConfigError::InvalidSchedule { .. })
        ));
        assert!(scheduler.is_scheduled(&config.id));

        config.enabled = false;
        scheduler.schedule_backup(&config).unwrap();
        assert!(!scheduler.is_scheduled(&config.id));
        assert!(!scheduler.unschedule(&config.id));
    }

    #[test]
    fn startup_schedules_only_enabled_valid_configs() {
        let repository = BackupRepository::new(Arc::new(MemoryStore::new()));
        let enabled = config("@hourly");
        let mut disabled = config("@hourly");
        disabled.enabled = false;
        let mut invalid = config("@hourly");
        invalid.schedule = "99 * * * *".into();
        for config in [&enabled, &disabled, &invalid] {
            repository.save_config(config).unwrap();
        }

        let scheduler = BackupScheduler::new(Arc::new(CountingRunner::default()));
        assert_eq!(scheduler.load_all(&repository).unwrap(), 1);
        assert!(scheduler.is_scheduled(&enabled.id));
        assert!(!scheduler.is_scheduled(&disabled.id));
        assert!(!scheduler.is_scheduled(&invalid.id));
    }

    #[test]
    fn timer_thread_stops() {
        let scheduler = Arc::new(BackupScheduler::new(Arc::new(CountingRunner::default())));
        scheduler.start().stop();
    }
}
