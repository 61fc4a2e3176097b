use clap::{Parser, Subcommand};
use kbackupd::backup::config::EngineConfig;
use kbackupd::backup::model::{BackupKind, BackupTarget, NewSchedule, ScheduleUpdate};
use kbackupd::backup::result_error::error::Error;
use kbackupd::backup::result_error::result::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::process::exit;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Backup engine: create, list, delete and restore backups, and run scheduled backups
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until the process is killed
    Daemon,
    /// Create a backup now
    Create {
        /// full, instance or database
        #[arg(long = "type")]
        kind: String,
        #[arg(long)]
        instance: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// List backups, newest first
    List {
        #[arg(long = "type")]
        kind: Option<String>,
    },
    Show {
        id: String,
    },
    Delete {
        id: String,
    },
    /// Restore a backup over the live files
    Restore {
        id: String,
        /// Instance to restore an instance backup into
        #[arg(long)]
        instance: Option<String>,
    },
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Show the most recent audit events
    Audit {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    Add {
        #[arg(long)]
        instance: String,
        /// Five-field cron expression
        #[arg(long)]
        cron: String,
        #[arg(long = "type")]
        kind: String,
        #[arg(long, default_value_t = 7)]
        retention: u32,
        #[arg(long)]
        disabled: bool,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    List {
        #[arg(long)]
        instance: Option<String>,
    },
    Update {
        id: String,
        #[arg(long)]
        cron: Option<String>,
        #[arg(long = "type")]
        kind: Option<String>,
        #[arg(long)]
        retention: Option<u32>,
        #[arg(long)]
        enabled: Option<bool>,
    },
    Remove {
        id: String,
    },
    /// Run every due schedule once and exit
    RunDue,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_kind(kind: Option<&str>) -> Result<Option<BackupKind>> {
    kind.map(str::parse::<BackupKind>).transpose()
}

fn run(args: Args) -> Result<()> {
    let config = EngineConfig::from_yaml_file(&args.config)?;
    let engine = config.build_engine()?;

    match args.command {
        Command::Daemon => {
            engine.scheduler.start()?;
            loop {
                std::thread::park();
            }
        }
        Command::Create {
            kind,
            instance,
            name,
            user,
        } => {
            let target = BackupTarget::parse(&kind, instance)?;
            print_json(&engine.store.create_backup(&target, name.as_deref(), &user)?)
        }
        Command::List { kind } => {
            print_json(&engine.store.list_backups(parse_kind(kind.as_deref())?)?)
        }
        Command::Show { id } => match engine.store.get_backup(&id)? {
            Some(record) => print_json(&record),
            None => Err(Error::not_found("backup", id)),
        },
        Command::Delete { id } => print_json(&engine.store.delete_backup(&id)?),
        Command::Restore { id, instance } => {
            print_json(&engine.restore.restore_backup(&id, instance.as_deref())?)
        }
        Command::Schedule(ScheduleCommand::Add {
            instance,
            cron,
            kind,
            retention,
            disabled,
            user,
        }) => print_json(
            &engine.scheduler.create_schedule(
                NewSchedule::builder()
                    .instance_id(instance)
                    .cron_schedule(cron)
                    .kind(kind.parse()?)
                    .retention(retention)
                    .enabled(!disabled)
                    .created_by(user)
                    .build(),
            )?,
        ),
        Command::Schedule(ScheduleCommand::List { instance }) => {
            print_json(&engine.scheduler.list_schedules(instance.as_deref())?)
        }
        Command::Schedule(ScheduleCommand::Update {
            id,
            cron,
            kind,
            retention,
            enabled,
        }) => print_json(
            &engine.scheduler.update_schedule(
                &id,
                ScheduleUpdate::builder()
                    .maybe_cron_schedule(cron)
                    .maybe_kind(parse_kind(kind.as_deref())?)
                    .maybe_retention(retention)
                    .maybe_enabled(enabled)
                    .build(),
            )?,
        ),
        Command::Schedule(ScheduleCommand::Remove { id }) => engine.scheduler.delete_schedule(&id),
        Command::Schedule(ScheduleCommand::RunDue) => {
            print_json(&engine.scheduler.poll_once(chrono::Utc::now())?)
        }
        Command::Audit { limit } => print_json(&engine.catalog.list_audit_events(limit)?),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("{e}");
        exit(if e.kind().is_client_error() { 2 } else { 1 });
    }
}
