//! Library to back up and restore a point-of-sale installation.
//!
//! Backups of the database ([`backends::MariaDb`]) and of the file assets
//! ([`backends::FilesArchive`]) are compressed, optionally encrypted, checksummed
//! and stored at one or more [`destinations`]. The [`orchestrator`] runs single
//! backups, the [`restore`] module reverses them and the [`scheduler`] fires them
//! on their cron-like schedules. [`manager::BackupManager`] ties everything together.

#![forbid(unsafe_code)]

pub mod backends;
pub mod cli;
pub mod destinations;
pub mod manager;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod restore;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod util;
