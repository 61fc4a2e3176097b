//! # kbackupd
//!
//! Backup and scheduled-backup engine for a host running managed instances.
//!
//! ## Features
//!
//! - **Backup kinds**: full system, single instance, or database only
//! - **Archives**: tar, optionally XZ (LZMA) compressed, written atomically
//! - **Catalog**: SQLite-backed records of backups, schedules and audit events
//! - **Restore**: staged extraction, then overwrite of the live target
//! - **Scheduled Backups**: cron-based polling loop with failure bookkeeping
//!
//! ## Quick Start
//!
//! ```no_run
//! use kbackupd::backup::config::EngineConfig;
//!
//! let config: EngineConfig = serde_yml::from_reader(std::fs::File::open("config.yml")?)?;
//! let engine = config.build_engine()?;
//! engine.scheduler.start()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
