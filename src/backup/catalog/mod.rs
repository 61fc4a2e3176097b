//! Persistence seam for backup records and schedules.

pub mod sqlite;

use crate::backup::model::{BackupKind, BackupRecord, BackupSchedule, ScheduleStatus};
use crate::backup::result_error::result::Result;
use chrono::{DateTime, Utc};

pub trait Catalog: Send + Sync {
    fn insert_backup(&self, record: &BackupRecord) -> Result<()>;

    fn find_backup(&self, id: &str) -> Result<Option<BackupRecord>>;

    /// Newest first. `None` filters match everything.
    fn list_backups(
        &self,
        kind: Option<BackupKind>,
        instance_id: Option<&str>,
    ) -> Result<Vec<BackupRecord>>;

    /// Returns whether a record was removed.
    fn delete_backup(&self, id: &str) -> Result<bool>;

    fn insert_schedule(&self, schedule: &BackupSchedule) -> Result<()>;

    /// Overwrites every column of an existing schedule, returns whether it existed.
    fn update_schedule(&self, schedule: &BackupSchedule) -> Result<bool>;

    fn find_schedule(&self, id: &str) -> Result<Option<BackupSchedule>>;

    fn list_schedules(&self, instance_id: Option<&str>) -> Result<Vec<BackupSchedule>>;

    fn delete_schedule(&self, id: &str) -> Result<bool>;

    /// Enabled schedules with `next_run <= now`, earliest `next_run` first.
    fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<BackupSchedule>>;

    /// Run bookkeeping written by the scheduler after each execution attempt.
    fn record_schedule_run(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
        status: ScheduleStatus,
        next_run: DateTime<Utc>,
    ) -> Result<bool>;
}
