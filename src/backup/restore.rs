//! Restore engine: extracts a backup into a private staging directory, checks
//! its layout, then copies it over the live target.
//!
//! Database and full placement is create-or-overwrite: files present in the
//! live target but missing from the backup are left where they are. An
//! instance restore replaces the instance directory as a whole.

use crate::backup::audit::{AuditEvent, BACKUP_RESTORE};
use crate::backup::function_path;
use crate::backup::model::{BackupKind, BackupRecord, BackupTarget};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::store::BackupStore;
use function_name::named;
use itertools::Itertools;
use serde::Serialize;
use serde_json::json;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub backup_id: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    /// Live paths that were written, one per top-level archive entry.
    pub restored_paths: Vec<PathBuf>,
}

/// Staged source and the live path it is copied over.
#[derive(Debug)]
struct Placement {
    src: PathBuf,
    dst: PathBuf,
    /// Swap `dst` out entirely instead of copying over it.
    replace: bool,
}

impl Placement {
    fn apply(&self) -> Result<()> {
        if self.replace {
            replace_dir(&self.src, &self.dst)
        } else {
            copy_over(&self.src, &self.dst)
        }
    }
}

pub struct RestoreEngine {
    store: Arc<BackupStore>,
}

impl RestoreEngine {
    pub fn new(store: Arc<BackupStore>) -> Self {
        Self { store }
    }

    /// Restores backup `backup_id`. Instance backups are restored into
    /// `instance_id`, which may differ from the instance they were taken from.
    #[named]
    pub fn restore_backup(&self, backup_id: &str, instance_id: Option<&str>) -> Result<RestoreOutcome> {
        let res = self.restore_unaudited(backup_id, instance_id);

        self.store.audit().record(
            AuditEvent::builder()
                .action(BACKUP_RESTORE)
                .resource("backup")
                .success(res.is_ok())
                .details(match &res {
                    Ok(outcome) => json!({
                        "backupId": backup_id,
                        "instanceId": instance_id,
                        "type": outcome.kind,
                        "restoredPaths": outcome.restored_paths,
                    }),
                    Err(e) => json!({
                        "backupId": backup_id,
                        "instanceId": instance_id,
                        "error": e.to_string(),
                        "liveStateModified": e.live_state_modified(),
                    }),
                })
                .build(),
        );

        match res {
            Ok(outcome) => {
                tracing::info!(
                    "Restored {} backup {} into {:?}",
                    outcome.kind,
                    backup_id,
                    outcome.restored_paths
                );
                Ok(outcome)
            }
            Err(e) => {
                if e.live_state_modified() {
                    tracing::error!("Restore of backup {backup_id} failed during placement: {e}");
                } else {
                    tracing::warn!("Restore of backup {backup_id} failed, nothing was changed: {e}");
                }
                Err(e.add_fn_name(function_path!()))
            }
        }
    }

    fn restore_unaudited(&self, backup_id: &str, instance_id: Option<&str>) -> Result<RestoreOutcome> {
        let record = self.store.require_backup(backup_id)?;
        let target = match record.kind() {
            BackupKind::Full => BackupTarget::Full,
            BackupKind::Database => BackupTarget::Database,
            BackupKind::Instance => {
                let id = instance_id
                    .filter(|id| !id.is_empty())
                    .ok_or(Error::MissingInstanceId("instance restore"))?;
                self.store.instance_dir(id)?;
                BackupTarget::Instance(id.to_string())
            }
        };

        let staging = self.store.staging_dir()?;
        tracing::debug!("Staging backup {} in {:?}", backup_id, staging.path());
        self.store.codec().unpack(record.path(), staging.path())?;
        let plan = self
            .plan(&record, &target, staging.path())
            .map_err(|e| Error::archive_read(record.path(), e))?;

        let restored_paths = {
            let _target = self.store.locks().lock(&target);
            plan.iter()
                .map(|p| p.apply().map(|_| p.dst.clone()))
                .collect::<Result<Vec<_>>>()
                .map_err(|e| Error::RestorePlacement {
                    backup_id: backup_id.to_string(),
                    error: Box::new(e),
                })?
        };

        let staging_path = staging.path().to_path_buf();
        if let Err(e) = staging.close() {
            tracing::warn!("Removing staging directory {:?} failed: {e}", staging_path);
        }

        Ok(RestoreOutcome {
            backup_id: backup_id.to_string(),
            kind: record.kind(),
            restored_paths,
        })
    }

    /// Maps the staged top-level entries to live paths, rejecting archives
    /// that do not have the layout their backup type implies.
    fn plan(&self, record: &BackupRecord, target: &BackupTarget, staged: &Path) -> Result<Vec<Placement>> {
        let top_level = std::fs::read_dir(staged)?
            .map_ok(|e| e.file_name())
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .sorted()
            .collect_vec();

        match target {
            BackupTarget::Database => Ok(vec![self.database_placement(staged)?]),
            BackupTarget::Full => {
                let mut plan = vec![self.database_placement(staged)?];
                let db_name = self.store.database_file_name()?;
                plan.extend(
                    top_level
                        .into_iter()
                        .filter(|name| Path::new(name) != db_name)
                        .map(|name| Placement {
                            src: staged.join(&name),
                            dst: self.store.instances_root().join(name),
                            replace: false,
                        }),
                );
                Ok(plan)
            }
            BackupTarget::Instance(id) => match top_level.as_slice() {
                [root] if staged.join(root).is_dir() => Ok(vec![Placement {
                    src: staged.join(root),
                    dst: self.store.instance_dir(id)?,
                    replace: true,
                }]),
                _ => Err(Error::InvalidArchive(format!(
                    "instance backup {} must hold exactly one root directory, found {:?}",
                    record.id(),
                    top_level
                ))),
            },
        }
    }

    fn database_placement(&self, staged: &Path) -> Result<Placement> {
        let db_name = self.store.database_file_name()?;
        let src = staged.join(&db_name);
        if !src.is_file() {
            return Err(Error::InvalidArchive(format!("no database file {db_name:?}")));
        }
        Ok(Placement {
            src,
            dst: self.store.database().path.clone(),
            replace: false,
        })
    }
}

/// Copies `src` over `dst`, recursing into directories.
fn copy_over(src: &Path, dst: &Path) -> Result<()> {
    if src.is_file() {
        return replace_file(src, dst);
    }

    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry?;
        let target = dst.join(entry.path().strip_prefix(src)?);
        if entry.file_type().is_dir() {
            if target.exists() && !target.is_dir() {
                std::fs::remove_file(&target)?;
            }
            std::fs::create_dir_all(&target)
                .map_err(Error::from)
                .add_msg(format!("Create directory failed: {target:?}"))?;
        } else {
            replace_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// `{dst}{suffix}`, next to `dst`.
fn sibling(dst: &Path, suffix: &str) -> PathBuf {
    let mut name = dst.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    dst.with_file_name(name)
}

/// Copies `src` into a sibling of `dst`, then swaps it in, so entries only
/// present in the live `dst` are gone afterwards.
fn replace_dir(src: &Path, dst: &Path) -> Result<()> {
    let incoming = sibling(dst, ".restoring");
    let outgoing = sibling(dst, ".replaced");
    for leftover in [&incoming, &outgoing] {
        if leftover.exists() {
            std::fs::remove_dir_all(leftover)?;
        }
    }
    copy_over(src, &incoming)?;

    if dst.is_dir() {
        std::fs::rename(dst, &outgoing)
            .map_err(Error::from)
            .add_msg(format!("Move aside failed: {dst:?}"))?;
    } else if dst.exists() {
        std::fs::remove_file(dst)?;
    }
    std::fs::rename(&incoming, dst)
        .map_err(Error::from)
        .add_msg(format!("Replace directory failed: {dst:?}"))?;

    if outgoing.exists() {
        if let Err(e) = std::fs::remove_dir_all(&outgoing) {
            tracing::warn!("Removing replaced directory {:?} failed: {e}", outgoing);
        }
    }
    Ok(())
}

/// Writes a sibling copy first so `dst` is swapped in one rename.
fn replace_file(src: &Path, dst: &Path) -> Result<()> {
    let tmp = sibling(dst, ".restoring");

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)
            .map_err(Error::from)
            .add_msg(format!("Create directory failed: {parent:?}"))?;
    }
    if dst.is_dir() {
        std::fs::remove_dir_all(dst)?;
    }
    std::fs::copy(src, &tmp)
        .and_then(|_| std::fs::rename(&tmp, dst))
        .map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            Error::from(e).add_msg(format!("Replace file failed: {dst:?}"))
        })
}
