//! Building blocks shared by backup and restore.

pub mod checksum;
pub mod compression;
pub mod encryption;
pub mod process;
pub mod retention;
pub mod schedule;
