use crate::backup::audit::BestEffortAudit;
use crate::backup::catalog::sqlite::SqliteCatalog;
use crate::backup::compress::CompressorConfig;
use crate::backup::instances::StaticInstanceNames;
use crate::backup::locks::TargetLocks;
use crate::backup::restore::RestoreEngine;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::scheduler::Scheduler;
use crate::backup::store::BackupStore;
use crate::backup::tar::ArchiveCodec;
use crate::backup::validate::{validate_dir_exist_or_created, validate_parent_dir_exist};
use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

static DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

/// How the system database is captured into an archive.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    /// Copy the file as it is on disk.
    #[default]
    File,
    /// Take a consistent SQLite snapshot before archiving.
    Sqlite,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[validate(custom(function = validate_parent_dir_exist))]
    #[builder(into)]
    pub path: PathBuf,
    #[serde(default)]
    #[builder(default)]
    pub kind: DatabaseKind,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Where archives and the transient `.staging/` tree live.
    #[validate(custom(function = validate_dir_exist_or_created))]
    #[builder(into)]
    pub backup_dir: PathBuf,
    /// Parent of every instance root directory, one directory per instance id.
    #[validate(custom(function = validate_dir_exist_or_created))]
    #[builder(into)]
    pub instances_root: PathBuf,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(custom(function = validate_parent_dir_exist))]
    #[builder(into)]
    pub catalog_path: PathBuf,
    #[serde(default)]
    #[validate(nested)]
    #[builder(default)]
    pub compressor: CompressorConfig,
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    #[builder(default = default_poll_interval())]
    pub poll_interval: Duration,
    /// Watchdog for a single scheduled backup, unbounded when absent.
    #[serde(with = "humantime_serde", default)]
    pub execution_timeout: Option<Duration>,
    #[serde(default)]
    #[builder(default)]
    pub instance_names: HashMap<String, String>,
}

/// Everything a caller needs, wired from one [`EngineConfig`].
pub struct Engine {
    pub catalog: Arc<SqliteCatalog>,
    pub store: Arc<BackupStore>,
    pub restore: RestoreEngine,
    pub scheduler: Scheduler,
}

impl EngineConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(Error::from)
            .add_msg(format!("Open config failed: {path:?}"))?;
        let config: EngineConfig = serde_yml::from_reader(file)
            .map_err(Error::from)
            .add_msg(format!("Parse YAML config failed: {path:?}"))?;
        config
            .validate()
            .map_err(Error::from)
            .add_msg(format!("Config validation failed: {path:?}"))?;
        Ok(config)
    }

    pub fn build_engine(&self) -> Result<Engine> {
        let catalog = Arc::new(
            SqliteCatalog::open(&self.catalog_path)
                .add_msg(format!("Open catalog failed: {:?}", self.catalog_path))?,
        );
        let audit = BestEffortAudit::new(catalog.clone());
        let locks = Arc::new(TargetLocks::new());

        let store = Arc::new(
            BackupStore::builder()
                .backup_dir(&self.backup_dir)
                .instances_root(&self.instances_root)
                .database(self.database.clone())
                .codec(ArchiveCodec::new(self.compressor.clone()))
                .catalog(catalog.clone())
                .audit(audit.clone())
                .locks(locks)
                .build(),
        );
        let restore = RestoreEngine::new(store.clone());
        let scheduler = Scheduler::builder()
            .store(store.clone())
            .catalog(catalog.clone())
            .audit(audit)
            .instance_names(Arc::new(StaticInstanceNames::new(self.instance_names.clone())))
            .poll_interval(self.poll_interval)
            .maybe_execution_timeout(self.execution_timeout)
            .build();

        Ok(Engine {
            catalog,
            store,
            restore,
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::compress::xz::XzConfig;
    use tempfile::TempDir;

    fn yaml(dir: &Path, extra: &str) -> String {
        format!(
            "backup_dir: {0}/backups\ninstances_root: {0}/instances\ndatabase:\n  path: {0}/dashboard.db\ncatalog_path: {0}/catalog.db\n{extra}",
            dir.display()
        )
    }

    #[test]
    fn test_minimal_config_defaults() {
        let dir = TempDir::new().unwrap();
        let config: EngineConfig = serde_yml::from_str(&yaml(dir.path(), "")).unwrap();

        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.execution_timeout, None);
        assert_eq!(config.database.kind, DatabaseKind::File);
        assert_eq!(config.compressor, CompressorConfig::Xz(XzConfig::default()));
        assert!(config.validate().is_ok());
        assert!(dir.path().join("backups").is_dir());
        assert!(dir.path().join("instances").is_dir());
    }

    #[test]
    fn test_full_config() {
        let dir = TempDir::new().unwrap();
        let extra = "compressor:\n  compressor_type: none\npoll_interval: 30s\nexecution_timeout: 15m\ninstance_names:\n  a1: billing\n";
        let mut text = yaml(dir.path(), extra);
        text = text.replace(
            "dashboard.db\n",
            "dashboard.db\n  kind: sqlite\n",
        );
        let config: EngineConfig = serde_yml::from_str(&text).unwrap();

        assert_eq!(config.compressor, CompressorConfig::None);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.execution_timeout, Some(Duration::from_secs(900)));
        assert_eq!(config.database.kind, DatabaseKind::Sqlite);
        assert_eq!(config.instance_names["a1"], "billing");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let dir = TempDir::new().unwrap();
        let text = yaml(dir.path(), "retention_days: 3\n");
        assert!(serde_yml::from_str::<EngineConfig>(&text).is_err());
    }

    #[test]
    fn test_validation_rejects_missing_database_parent() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::builder()
            .backup_dir(dir.path().join("backups"))
            .instances_root(dir.path().join("instances"))
            .database(DatabaseConfig::builder().path(dir.path().join("nope/dashboard.db")).build())
            .catalog_path(dir.path().join("catalog.db"))
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_compressor() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::builder()
            .backup_dir(dir.path().join("backups"))
            .instances_root(dir.path().join("instances"))
            .database(DatabaseConfig::builder().path(dir.path().join("dashboard.db")).build())
            .catalog_path(dir.path().join("catalog.db"))
            .compressor(CompressorConfig::Xz(XzConfig { level: Some(12), thread: None }))
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_yaml_file_and_build_engine() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, yaml(dir.path(), "")).unwrap();

        let config = EngineConfig::from_yaml_file(&path).unwrap();
        let engine = config.build_engine().unwrap();
        assert!(engine.store.list_backups(None).unwrap().is_empty());
        assert!(dir.path().join("catalog.db").is_file());
        assert!(!engine.scheduler.is_running());
    }

    #[test]
    fn test_from_yaml_file_missing() {
        let dir = TempDir::new().unwrap();
        let err = EngineConfig::from_yaml_file(dir.path().join("missing.yml")).unwrap_err();
        assert!(err.to_string().contains("Open config failed"));
    }
}
