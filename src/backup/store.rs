//! Backup store: owns the backup directory and the backup records in the
//! catalog. Every archive in the directory is created and deleted here.

use crate::backup::archive::sqlite::snapshot_entry;
use crate::backup::archive::{path_entries, ArchiveEntry};
use crate::backup::audit::{AuditEvent, BestEffortAudit, BACKUP_CREATE, BACKUP_DELETE};
use crate::backup::catalog::Catalog;
use crate::backup::config::{DatabaseConfig, DatabaseKind};
use crate::backup::file_ext::FileExtProvider;
use crate::backup::function_path;
use crate::backup::locks::TargetLocks;
use crate::backup::model::{BackupKind, BackupRecord, BackupTarget};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::tar::ArchiveCodec;
use crate::backup::validate::validate_backup_name;
use bon::Builder;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::TempDir;

static STAGING_DIR_NAME: &str = ".staging";
static STAGING_PREFIX: &str = "restore-";

#[derive(Builder, Getters)]
pub struct BackupStore {
    #[builder(into)]
    #[getset(get = "pub")]
    backup_dir: PathBuf,
    #[builder(into)]
    #[getset(get = "pub")]
    instances_root: PathBuf,
    #[getset(get = "pub")]
    database: DatabaseConfig,
    #[builder(default)]
    #[getset(get = "pub")]
    codec: ArchiveCodec,
    catalog: Arc<dyn Catalog>,
    #[builder(default)]
    #[getset(get = "pub(crate)")]
    audit: BestEffortAudit,
    #[builder(default)]
    #[getset(get = "pub(crate)")]
    locks: Arc<TargetLocks>,
    #[builder(skip)]
    mutation: Mutex<()>,
}

/// `backup-{type}-{timestamp}` with the RFC 3339 separators made file-name safe.
pub fn default_backup_name(kind: BackupKind, at: DateTime<Utc>) -> String {
    let stamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("backup-{kind}-{stamp}")
}

impl BackupStore {
    fn lock_mutation(&self) -> MutexGuard<'_, ()> {
        self.mutation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Archives `target` into `{backup_dir}/{name}.{ext}` and records it.
    pub fn create_backup(
        &self,
        target: &BackupTarget,
        name: Option<&str>,
        created_by: &str,
    ) -> Result<BackupRecord> {
        self.create_backup_claimed(target, name, created_by, &AtomicBool::new(false))
    }

    /// Same as [`Self::create_backup`], but the record is only persisted if
    /// this call is first to set `claim`. If `claim` is already set when the
    /// locks are taken, or when the archive is about to be recorded, the
    /// archive is discarded and [`Error::Abandoned`] returned.
    #[named]
    pub fn create_backup_claimed(
        &self,
        target: &BackupTarget,
        name: Option<&str>,
        created_by: &str,
        claim: &AtomicBool,
    ) -> Result<BackupRecord> {
        let res = self.create_backup_unaudited(target, name, created_by, claim);

        let details = match &res {
            Ok(record) => json!({
                "backupId": record.id(),
                "name": record.name(),
                "type": target.kind(),
                "instanceId": target.instance_id(),
            }),
            Err(e) => json!({
                "type": target.kind(),
                "instanceId": target.instance_id(),
                "error": e.to_string(),
            }),
        };
        self.audit.record(
            AuditEvent::builder()
                .action(BACKUP_CREATE)
                .resource("backup")
                .user_id(created_by)
                .success(res.is_ok())
                .details(details)
                .build(),
        );

        match res {
            Ok(record) => {
                tracing::info!(
                    "Created {} backup {:?} ({} bytes) at {:?}",
                    record.kind(),
                    record.name(),
                    record.size(),
                    record.path()
                );
                Ok(record)
            }
            Err(e) => {
                tracing::error!("Creating {} backup failed: {e}", target.kind());
                Err(e.add_fn_name(function_path!()))
            }
        }
    }

    fn create_backup_unaudited(
        &self,
        target: &BackupTarget,
        name: Option<&str>,
        created_by: &str,
        claim: &AtomicBool,
    ) -> Result<BackupRecord> {
        let created_at = Utc::now().trunc_subsecs(3);
        let name = match name {
            Some(name) => {
                validate_backup_name(name).map_err(|_| Error::InvalidBackupName(name.to_string()))?;
                name.to_string()
            }
            None => default_backup_name(target.kind(), created_at),
        };
        let file_name = match self.codec.file_ext() {
            Some(ext) => format!("{name}.{ext}"),
            None => name.clone(),
        };
        let archive_path = self.backup_dir.join(file_name);
        if let BackupTarget::Instance(id) = target {
            self.instance_dir(id)?;
        }

        let _target = self.locks.lock(target);
        let _mutation = self.lock_mutation();

        if archive_path.exists() {
            return Err(Error::archive_write(
                &archive_path,
                Error::from(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "an archive with this name already exists",
                )),
            ));
        }
        if claim.load(Ordering::SeqCst) {
            return Err(Error::Abandoned(name));
        }

        let entries = self
            .resolve_entries(target)
            .map_err(|e| Error::archive_write(&archive_path, e))?;
        self.codec.pack_entries(entries, &archive_path)?;

        let persisted = std::fs::metadata(&archive_path)
            .map_err(Error::from)
            .add_msg(format!("Stat archive failed: {archive_path:?}"))
            .and_then(|metadata| {
                let record = BackupRecord::builder()
                    .id(uuid::Uuid::new_v4().to_string())
                    .name(name)
                    .kind(target.kind())
                    .maybe_instance_id(target.instance_id())
                    .size(metadata.len())
                    .path(archive_path.clone())
                    .created_by(created_by)
                    .created_at(created_at)
                    .build();
                if claim.swap(true, Ordering::SeqCst) {
                    return Err(Error::Abandoned(record.name().clone()));
                }
                self.catalog
                    .insert_backup(&record)
                    .add_msg("Persist backup record failed")?;
                Ok(record)
            });

        persisted.map_err(|e| match std::fs::remove_file(&archive_path) {
            Ok(()) => {
                tracing::warn!("Removed unrecorded archive {:?}", archive_path);
                e
            }
            Err(e2) => e.chain(Error::from(e2).add_msg(format!(
                "Remove unrecorded archive failed: {archive_path:?}"
            ))),
        })
    }

    fn resolve_entries(&self, target: &BackupTarget) -> Result<Vec<ArchiveEntry>> {
        match target {
            BackupTarget::Database => self.database_entries(),
            BackupTarget::Instance(id) => path_entries(self.instance_dir(id)?),
            BackupTarget::Full => {
                let mut entries = Vec::new();
                for dir in self.instance_dirs()? {
                    entries.extend(path_entries(dir)?);
                }
                // Last, so a failure above leaves no snapshot behind.
                entries.extend(self.database_entries()?);
                Ok(entries)
            }
        }
    }

    fn database_entries(&self) -> Result<Vec<ArchiveEntry>> {
        match self.database.kind {
            DatabaseKind::File => path_entries(&self.database.path),
            DatabaseKind::Sqlite => Ok(vec![snapshot_entry(
                &self.database.path,
                self.database_file_name()?,
            )?]),
        }
    }

    /// Name of the database file inside an archive.
    pub fn database_file_name(&self) -> Result<PathBuf> {
        self.database
            .path
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| {
                Error::from(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{:?} has no file name", self.database.path),
                ))
            })
    }

    /// `{instances_root}/{id}`, for ids that are a single plain path component.
    pub fn instance_dir(&self, instance_id: &str) -> Result<PathBuf> {
        let mut components = Path::new(instance_id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.instances_root.join(instance_id)),
            _ => Err(Error::not_found("instance", instance_id)),
        }
    }

    fn instance_dirs(&self) -> Result<Vec<PathBuf>> {
        let dirs = std::fs::read_dir(&self.instances_root)?
            .map_ok(|e| e.path())
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(dirs.into_iter().sorted().collect())
    }

    /// Newest first, optionally only one type.
    pub fn list_backups(&self, kind: Option<BackupKind>) -> Result<Vec<BackupRecord>> {
        self.catalog.list_backups(kind, None)
    }

    pub fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        self.catalog.find_backup(id)
    }

    pub(crate) fn require_backup(&self, id: &str) -> Result<BackupRecord> {
        self.get_backup(id)?
            .ok_or_else(|| Error::not_found("backup", id))
    }

    /// Removes the archive, then the record.
    ///
    /// An archive that is already gone counts as removed, so a delete that
    /// failed between the two steps can simply be retried.
    #[named]
    pub fn delete_backup(&self, id: &str) -> Result<BackupRecord> {
        let res = (|| -> Result<BackupRecord> {
            let _mutation = self.lock_mutation();
            let record = self.require_backup(id)?;

            match std::fs::remove_file(record.path()) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    return Err(Error::from(e)
                        .add_msg(format!("Remove archive failed: {:?}", record.path())));
                }
                _ => {}
            }

            if !self.catalog.delete_backup(id).add_msg(format!(
                "Archive {:?} removed but its record remains, retry the delete",
                record.path()
            ))? {
                return Err(Error::not_found("backup", id));
            }
            Ok(record)
        })();

        self.audit.record(
            AuditEvent::builder()
                .action(BACKUP_DELETE)
                .resource("backup")
                .success(res.is_ok())
                .details(match &res {
                    Ok(record) => json!({ "backupId": id, "name": record.name() }),
                    Err(e) => json!({ "backupId": id, "error": e.to_string() }),
                })
                .build(),
        );

        match res {
            Ok(record) => {
                tracing::info!("Deleted backup {:?} ({})", record.name(), id);
                Ok(record)
            }
            Err(e) => {
                tracing::warn!("Deleting backup {id} failed: {e}");
                Err(e.add_fn_name(function_path!()))
            }
        }
    }

    /// Fresh, uniquely named `{backup_dir}/.staging/restore-XXXX`, removed on drop.
    pub fn staging_dir(&self) -> Result<TempDir> {
        let root = self.backup_dir.join(STAGING_DIR_NAME);
        std::fs::create_dir_all(&root)?;
        Ok(tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&root)?)
    }
}
