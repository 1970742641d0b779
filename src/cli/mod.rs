use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Configuration file of the backup engine. Created with defaults if missing.
    #[arg(
        long,
        short = 'c',
        env = "POS_BACKUP_CONFIG",
        default_value = "/etc/pos-backup/config.toml"
    )]
    pub config: PathBuf,

    /// Hex encoded 256 bit encryption key. Overrides the key of the config file.
    #[arg(long, env = "POS_BACKUP_ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<String>,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Run scheduled backups until terminated.
    Daemon,
    /// Manage backup configurations.
    #[command(subcommand)]
    Config(ConfigAction),
    /// Run a backup of a configuration now.
    Backup {
        config_id: String,
    },
    /// List the backup history of a configuration.
    Results {
        config_id: String,
    },
    /// Download a backup and compare it with its recorded checksum.
    Verify {
        result_id: String,
    },
    /// Restore a backup.
    Restore(RestoreArgs),
    /// Manage restore points.
    #[command(subcommand)]
    RestorePoint(RestorePointAction),
    /// Restore the backup a restore point refers to.
    Rollback {
        restore_point_id: String,

        /// Confirm overwriting the current state.
        #[arg(long)]
        yes: bool,
    },
    /// Prune old backups of one or all configurations.
    Retention {
        config_id: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Create or replace a configuration from a TOML file.
    Import {
        file: PathBuf,
    },
    List,
    Show {
        id: String,
    },
    Delete {
        id: String,
    },
    Enable {
        id: String,
    },
    Disable {
        id: String,
    },
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    pub result_id: String,

    /// Restore the dump into this database instead of the configured one.
    #[arg(long)]
    pub database: Option<String>,

    /// Extract file archives below this directory instead of the configured root.
    #[arg(long)]
    pub files_root: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum RestorePointAction {
    /// Verify a backup and record a restore point for it.
    Create {
        result_id: String,

        #[arg(long, short = 'm', default_value = "Manual restore point")]
        description: String,
    },
    List,
    /// Re-verify the backup behind a restore point.
    Verify {
        id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_restore_overrides() {
        let cli = Cli::try_parse_from([
            "pos-backup",
            "--config",
            "/tmp/pos.toml",
            "restore",
            "r-1",
            "--database",
            "pos_staging",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("/tmp/pos.toml"));
        match cli.action {
            Action::Restore(args) => {
                assert_eq!(args.result_id, "r-1");
                assert_eq!(args.database.as_deref(), Some("pos_staging"));
                assert_eq!(args.files_root, None);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn parses_nested_subcommands() {
        let cli = Cli::try_parse_from(["pos-backup", "restore-point", "create", "r-2", "-m", "before upgrade"]).unwrap();
        assert!(matches!(
            cli.action,
            Action::RestorePoint(RestorePointAction::Create { ref description, .. }) if description == "before upgrade"
        ));

        let cli = Cli::try_parse_from(["pos-backup", "config", "disable", "c-1"]).unwrap();
        assert!(matches!(cli.action, Action::Config(ConfigAction::Disable { .. })));
    }
}
