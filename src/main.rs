use std::fs;
use std::process::ExitCode;

use clap::Parser;
use pos_backup_lib::backends::RestoreTarget;
use pos_backup_lib::cli::{Action, Cli, ConfigAction, RestoreArgs, RestorePointAction};
use pos_backup_lib::manager::BackupManager;
use pos_backup_lib::model::{BackupConfig, BackupResult};
use pos_backup_lib::settings::AppConfig;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    env_logger.try_init().expect("env_logger should not fail");

    let mut settings = match AppConfig::load_or_init(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Reading the config file failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    if cli.encryption_key.is_some() {
        settings.encryption_key = cli.encryption_key;
    }

    let manager = match BackupManager::from_settings(&settings) {
        Ok(manager) => manager,
        Err(e) => {
            log::error!("Setting up the backup engine failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(&manager, cli.action) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_result(result: &BackupResult) {
    println!(
        "{}\t{}\t{}\t{}\t{} bytes\t{:.1}s\t{}",
        result.id,
        result.timestamp.to_rfc3339(),
        result.backup_type,
        result.status,
        result.size,
        result.duration_secs,
        result.error.as_deref().unwrap_or("-"),
    );
}

fn print_config(config: &BackupConfig) -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn run(manager: &BackupManager, action: Action) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        Action::Daemon => {
            let scheduler = manager.start_scheduler()?;
            log::info!("Waiting for scheduled backups");
            scheduler.wait();
        }
        Action::Config(ConfigAction::Import { file }) => {
            let content = fs::read_to_string(&file)?;
            let config: BackupConfig = if file.extension().is_some_and(|ext| ext == "json") {
                serde_json::from_str(&content)?
            } else {
                toml::from_str(&content)?
            };
            let config = if manager.get_config(&config.id)?.is_some() {
                manager.update_config(config)?
            } else {
                manager.create_config(config)?
            };
            println!("{}", config.id);
        }
        Action::Config(ConfigAction::List) => {
            for config in manager.list_configs()? {
                let schedule = if config.schedule.is_empty() { "-" } else { config.schedule.as_str() };
                let state = if config.enabled { "enabled" } else { "disabled" };
                println!("{}\t{}\t{}\t{schedule}\t{state}", config.id, config.name, config.backup_type);
            }
        }
        Action::Config(ConfigAction::Show { id }) => match manager.get_config(&id)? {
            Some(config) => print_config(&config)?,
            None => return Err(format!("backup configuration {id} does not exist").into()),
        },
        Action::Config(ConfigAction::Delete { id }) => manager.delete_config(&id)?,
        Action::Config(ConfigAction::Enable { id }) => {
            manager.set_enabled(&id, true)?;
        }
        Action::Config(ConfigAction::Disable { id }) => {
            manager.set_enabled(&id, false)?;
        }
        Action::Backup { config_id } => {
            let result = manager.trigger_backup(&config_id)?;
            print_result(&result);
            for location in &result.locations {
                println!("\t{}: {}", location.kind, location.handle);
            }
        }
        Action::Results { config_id } => {
            for result in manager.list_results(&config_id)? {
                print_result(&result);
            }
        }
        Action::Verify { result_id } => {
            if !manager.verify_result(&result_id)? {
                return Err(format!("backup {result_id} does not match its checksum").into());
            }
            println!("backup {result_id} verified");
        }
        Action::Restore(RestoreArgs {
            result_id,
            database,
            files_root,
        }) => {
            manager.restore(&result_id, Some(RestoreTarget { database, files_root }))?;
            println!("backup {result_id} restored");
        }
        Action::RestorePoint(RestorePointAction::Create {
            result_id,
            description,
        }) => {
            let point = manager.create_restore_point(&result_id, description)?;
            println!("{}\tverified: {}", point.id, point.verified);
        }
        Action::RestorePoint(RestorePointAction::List) => {
            for point in manager.list_restore_points()? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    point.id,
                    point.backup_id,
                    point.timestamp.to_rfc3339(),
                    if point.verified { "verified" } else { "unverified" },
                    point.description
                );
            }
        }
        Action::RestorePoint(RestorePointAction::Verify { id }) => {
            let point = manager.verify_restore_point(&id)?;
            println!("{}\tverified: {}", point.id, point.verified);
        }
        Action::Rollback {
            restore_point_id,
            yes,
        } => {
            if !yes {
                return Err("rollback overwrites the current state, confirm with --yes".into());
            }
            manager.rollback_to(&restore_point_id)?;
            println!("rolled back to restore point {restore_point_id}");
        }
        Action::Retention { config_id } => {
            for (config, report) in manager.run_retention(config_id.as_deref())? {
                println!(
                    "{}\tkept {}\tdeleted {}\tfailed {}",
                    config.name,
                    report.kept,
                    report.deleted.len(),
                    report.failed.len()
                );
            }
        }
    }

    Ok(())
}
