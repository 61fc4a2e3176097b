//! Catalog data model: backup records, backup schedules and the request-side
//! [`BackupTarget`] sum type.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use bon::Builder;
use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::PathBuf;
use std::str::FromStr;

/// `created_by` value for backups triggered by the scheduler.
pub static SYSTEM_USER: &str = "SYSTEM";

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    #[display("full")]
    Full,
    #[display("instance")]
    Instance,
    #[display("database")]
    Database,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Instance => "instance",
            BackupKind::Database => "database",
        }
    }
}

impl FromStr for BackupKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupKind::Full),
            "instance" => Ok(BackupKind::Instance),
            "database" => Ok(BackupKind::Database),
            other => Err(Error::UnsupportedBackupType(other.to_string())),
        }
    }
}

/// What a backup covers. The instance id only exists for instance backups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupTarget {
    Full,
    Instance(String),
    Database,
}

impl BackupTarget {
    pub fn from_parts(kind: BackupKind, instance_id: Option<String>) -> Result<Self> {
        match kind {
            BackupKind::Full => Ok(BackupTarget::Full),
            BackupKind::Database => Ok(BackupTarget::Database),
            BackupKind::Instance => instance_id
                .filter(|id| !id.is_empty())
                .map(BackupTarget::Instance)
                .ok_or(Error::MissingInstanceId("instance backup")),
        }
    }

    /// Parses a raw type string coming from a caller.
    pub fn parse(kind: &str, instance_id: Option<String>) -> Result<Self> {
        Self::from_parts(kind.parse()?, instance_id)
    }

    pub fn kind(&self) -> BackupKind {
        match self {
            BackupTarget::Full => BackupKind::Full,
            BackupTarget::Instance(_) => BackupKind::Instance,
            BackupTarget::Database => BackupKind::Database,
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        match self {
            BackupTarget::Instance(id) => Some(id),
            _ => None,
        }
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder, Getters, CopyGetters)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    #[builder(into)]
    #[getset(get = "pub")]
    id: String,
    #[builder(into)]
    #[getset(get = "pub")]
    name: String,
    #[serde(rename = "type")]
    #[getset(get_copy = "pub")]
    kind: BackupKind,
    #[builder(into)]
    #[getset(get = "pub")]
    instance_id: Option<String>,
    #[getset(get_copy = "pub")]
    size: u64,
    #[builder(into)]
    #[getset(get = "pub")]
    path: PathBuf,
    #[builder(into)]
    #[getset(get = "pub")]
    created_by: String,
    #[getset(get_copy = "pub")]
    created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    #[display("pending")]
    Pending,
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Pending => "pending",
            ScheduleStatus::Success => "success",
            ScheduleStatus::Failed => "failed",
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "pending" => Ok(ScheduleStatus::Pending),
            "success" => Ok(ScheduleStatus::Success),
            "failed" => Ok(ScheduleStatus::Failed),
            other => Err(format!("unknown schedule status {other:?}")),
        }
    }
}

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Builder, Getters, CopyGetters)]
#[serde(rename_all = "camelCase")]
pub struct BackupSchedule {
    #[builder(into)]
    #[getset(get = "pub")]
    id: String,
    #[builder(into)]
    #[getset(get = "pub")]
    instance_id: String,
    #[builder(into)]
    #[getset(get = "pub")]
    cron_schedule: String,
    #[serde(rename = "type")]
    #[getset(get_copy = "pub")]
    kind: BackupKind,
    /// Advisory only, nothing prunes old backups.
    #[getset(get_copy = "pub")]
    retention: u32,
    #[getset(get_copy = "pub")]
    enabled: bool,
    #[getset(get_copy = "pub")]
    next_run: DateTime<Utc>,
    #[getset(get_copy = "pub")]
    last_run: Option<DateTime<Utc>>,
    #[getset(get_copy = "pub")]
    last_status: Option<ScheduleStatus>,
    #[builder(into)]
    #[getset(get = "pub")]
    created_by: String,
}

impl BackupSchedule {
    /// Target this schedule backs up when it fires.
    pub fn target(&self) -> Result<BackupTarget> {
        BackupTarget::from_parts(self.kind, Some(self.instance_id.clone()))
    }

    pub(crate) fn set_admin_fields(
        &mut self,
        update: &ScheduleUpdate,
        next_run: DateTime<Utc>,
    ) {
        if let Some(cron) = &update.cron_schedule {
            self.cron_schedule = cron.clone();
        }
        if let Some(kind) = update.kind {
            self.kind = kind;
        }
        if let Some(retention) = update.retention {
            self.retention = retention;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        self.next_run = next_run;
    }
}

/// Payload to create a schedule.
#[derive(Clone, Debug, Builder)]
pub struct NewSchedule {
    #[builder(into)]
    pub instance_id: String,
    #[builder(into)]
    pub cron_schedule: String,
    pub kind: BackupKind,
    #[builder(default = 7)]
    pub retention: u32,
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(into)]
    pub created_by: String,
}

/// Partial administrative edit, `None` fields are left unchanged.
#[derive(Clone, Debug, Default, Builder)]
pub struct ScheduleUpdate {
    #[builder(into)]
    pub cron_schedule: Option<String>,
    pub kind: Option<BackupKind>,
    pub retention: Option<u32>,
    pub enabled: Option<bool>,
}
