//! Tiered pruning of historical [BackupResult]s.
//!
//! The decision ([RetentionPolicy::plan]) is pure and works on timestamps only.
//! Executing the plan ([RetentionPolicy::apply]) removes the artifacts from every
//! recorded location and then the result record itself.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, Months, Utc};

use crate::destinations::Destinations;
use crate::model::BackupResult;
use crate::store::BackupRepository;

/// Retention horizons of a backup configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct RetentionConfig {
    /// Every result younger than this many days is kept.
    pub daily: u32,

    /// Results older than this many weeks are thinned to one per ISO week.
    ///
    /// Results between the daily and the weekly horizon are deleted.
    pub weekly: u32,

    /// Results older than this many months are thinned to one per calendar month.
    pub monthly: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 4,
            monthly: 6,
        }
    }
}

/// Outcome of [RetentionPolicy::plan].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Ids of results to keep, oldest first.
    pub keep: Vec<String>,
    /// Ids of results to delete, oldest first.
    pub delete: Vec<String>,
}

/// Summary of an executed retention pass.
#[derive(Debug, Default, Clone)]
pub struct RetentionReport {
    pub kept: usize,
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Daily,
    Pruned,
    Weekly,
    Monthly,
}

/// Applies a [RetentionConfig] relative to a point in time.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub config: RetentionConfig,
    daily_cutoff: DateTime<Utc>,
    weekly_cutoff: DateTime<Utc>,
    monthly_cutoff: DateTime<Utc>,
}

impl RetentionPolicy {
    pub fn new(config: RetentionConfig, now: DateTime<Utc>) -> Self {
        let daily_cutoff = now - Duration::days(config.daily.into());
        let weekly_cutoff = now - Duration::weeks(config.weekly.into());
        let monthly_cutoff = now
            .checked_sub_months(Months::new(config.monthly))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Self {
            config,
            daily_cutoff,
            weekly_cutoff,
            monthly_cutoff,
        }
    }

    fn tier(&self, timestamp: DateTime<Utc>) -> Tier {
        if timestamp >= self.daily_cutoff {
            Tier::Daily
        } else if timestamp < self.monthly_cutoff {
            Tier::Monthly
        } else if timestamp < self.weekly_cutoff {
            Tier::Weekly
        } else {
            Tier::Pruned
        }
    }

    /// Decides which results survive.
    ///
    /// Within a week or month only the chronologically first result is kept.
    /// Ids in `pinned` are always kept.
    pub fn plan<'a>(
        &self,
        results: impl IntoIterator<Item = &'a BackupResult>,
        pinned: &HashSet<String>,
    ) -> RetentionPlan {
        let mut results: Vec<_> = results.into_iter().collect();
        results.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let mut weekly = HashSet::new();
        let mut monthly = HashSet::new();
        let mut plan = RetentionPlan::default();

        for result in results {
            let date = result.timestamp;
            let retain = match self.tier(date) {
                Tier::Daily => true,
                Tier::Pruned => false,
                Tier::Weekly => {
                    let week = date.iso_week();
                    weekly.insert((week.year(), week.week()))
                }
                Tier::Monthly => monthly.insert((date.year(), date.month())),
            };

            if retain || pinned.contains(&result.id) {
                plan.keep.push(result.id.clone());
            } else {
                plan.delete.push(result.id.clone());
            }
        }

        plan
    }

    /// Deletes everything [plan](Self::plan) rejects.
    ///
    /// Failures are logged and skipped; the pass always visits every result.
    /// Artifacts that are already missing count as removed.
    pub fn apply(
        &self,
        repository: &BackupRepository,
        destinations: &Destinations,
        results: &[BackupResult],
        pinned: &HashSet<String>,
    ) -> RetentionReport {
        let plan = self.plan(results, pinned);
        let mut report = RetentionReport {
            kept: plan.keep.len(),
            ..Default::default()
        };

        for id in plan.delete {
            let Some(result) = results.iter().find(|r| r.id == id) else {
                continue;
            };

            let mut artifacts_removed = true;
            for location in &result.locations {
                let removed = destinations
                    .for_location(location)
                    .and_then(|destination| destination.delete(&location.handle));
                match removed {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        log::debug!(target: "retention", "Artifact {} of result {id} is already gone", location.handle);
                    }
                    Err(e) => {
                        log::warn!(target: "retention", "Removing artifact {} of result {id} failed: {e}", location.handle);
                        artifacts_removed = false;
                    }
                }
            }

            if !artifacts_removed {
                report.failed.push(id);
                continue;
            }

            match repository.delete_result(&id) {
                Ok(()) => {
                    log::debug!(target: "retention", "Deleted result {id} from {}", result.timestamp);
                    report.deleted.push(id);
                }
                Err(e) => {
                    log::warn!(target: "retention", "Deleting result record {id} failed: {e}");
                    report.failed.push(id);
                }
            }
        }

        log::info!(
            target: "retention",
            "Retention pass finished: {} kept, {} deleted, {} failed",
            report.kept,
            report.deleted.len(),
            report.failed.len()
        );

        report
    }
}
