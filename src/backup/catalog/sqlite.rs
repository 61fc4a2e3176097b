use crate::backup::audit::{AuditEvent, AuditSink};
use crate::backup::catalog::Catalog;
use crate::backup::model::{BackupKind, BackupRecord, BackupSchedule, ScheduleStatus};
use crate::backup::result_error::result::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

static SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS backups (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    type        TEXT NOT NULL,
    instance_id TEXT,
    size        INTEGER NOT NULL,
    path        TEXT NOT NULL,
    created_by  TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS backups_created_at ON backups (created_at);
CREATE TABLE IF NOT EXISTS backup_schedules (
    id            TEXT PRIMARY KEY,
    instance_id   TEXT NOT NULL,
    cron_schedule TEXT NOT NULL,
    type          TEXT NOT NULL,
    retention     INTEGER NOT NULL,
    enabled       INTEGER NOT NULL,
    next_run      INTEGER NOT NULL,
    last_run      INTEGER,
    last_status   TEXT,
    created_by    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS backup_schedules_next_run ON backup_schedules (enabled, next_run);
CREATE TABLE IF NOT EXISTS audit_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    action     TEXT NOT NULL,
    resource   TEXT NOT NULL,
    user_id    TEXT,
    success    INTEGER NOT NULL,
    details    TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
";

static BACKUP_COLUMNS: &str = "id, name, type, instance_id, size, path, created_by, created_at";
static SCHEDULE_COLUMNS: &str =
    "id, instance_id, cron_schedule, type, retention, enabled, next_run, last_run, last_status, created_by";

/// Catalog stored in a single SQLite database. Timestamps are epoch millis.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        tracing::debug!("Opening catalog {:?}", path.as_ref());
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most recent audit events first.
    pub fn list_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT action, resource, user_id, success, details, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let details: String = row.get(4)?;
            Ok(AuditEvent::builder()
                .action(row.get::<_, String>(0)?)
                .resource(row.get::<_, String>(1)?)
                .maybe_user_id(row.get::<_, Option<String>>(2)?)
                .success(row.get(3)?)
                .details(serde_json::from_str(&details).map_err(|e| conversion_error(4, e.to_string()))?)
                .created_at(millis_to_datetime(5, row.get(5)?)?)
                .build())
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn millis_to_datetime(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp {millis} out of range").into(),
        )
    })
}

fn kind_column(row: &Row, idx: usize) -> rusqlite::Result<BackupKind> {
    let kind: String = row.get(idx)?;
    kind.parse::<BackupKind>()
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn backup_from_row(row: &Row) -> rusqlite::Result<BackupRecord> {
    Ok(BackupRecord::builder()
        .id(row.get::<_, String>(0)?)
        .name(row.get::<_, String>(1)?)
        .kind(kind_column(row, 2)?)
        .maybe_instance_id(row.get::<_, Option<String>>(3)?)
        .size(row.get::<_, i64>(4)? as u64)
        .path(PathBuf::from(row.get::<_, String>(5)?))
        .created_by(row.get::<_, String>(6)?)
        .created_at(millis_to_datetime(7, row.get(7)?)?)
        .build())
}

fn schedule_from_row(row: &Row) -> rusqlite::Result<BackupSchedule> {
    let last_status = row
        .get::<_, Option<String>>(8)?
        .map(|s| s.parse::<ScheduleStatus>().map_err(|e| conversion_error(8, e)))
        .transpose()?;
    let last_run = row
        .get::<_, Option<i64>>(7)?
        .map(|ms| millis_to_datetime(7, ms))
        .transpose()?;

    Ok(BackupSchedule::builder()
        .id(row.get::<_, String>(0)?)
        .instance_id(row.get::<_, String>(1)?)
        .cron_schedule(row.get::<_, String>(2)?)
        .kind(kind_column(row, 3)?)
        .retention(row.get(4)?)
        .enabled(row.get(5)?)
        .next_run(millis_to_datetime(6, row.get(6)?)?)
        .maybe_last_run(last_run)
        .maybe_last_status(last_status)
        .created_by(row.get::<_, String>(9)?)
        .build())
}

impl Catalog for SqliteCatalog {
    fn insert_backup(&self, record: &BackupRecord) -> Result<()> {
        self.conn().execute(
            &format!("INSERT INTO backups ({BACKUP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                record.id(),
                record.name(),
                record.kind().as_str(),
                record.instance_id(),
                record.size() as i64,
                record.path().to_string_lossy(),
                record.created_by(),
                record.created_at().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn find_backup(&self, id: &str) -> Result<Option<BackupRecord>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = ?1"),
                [id],
                backup_from_row,
            )
            .optional()?)
    }

    fn list_backups(
        &self,
        kind: Option<BackupKind>,
        instance_id: Option<&str>,
    ) -> Result<Vec<BackupRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backups
             WHERE (?1 IS NULL OR type = ?1) AND (?2 IS NULL OR instance_id = ?2)
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(
            params![kind.map(|k| k.as_str()), instance_id],
            backup_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_backup(&self, id: &str) -> Result<bool> {
        Ok(self.conn().execute("DELETE FROM backups WHERE id = ?1", [id])? > 0)
    }

    fn insert_schedule(&self, schedule: &BackupSchedule) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO backup_schedules ({SCHEDULE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                schedule.id(),
                schedule.instance_id(),
                schedule.cron_schedule(),
                schedule.kind().as_str(),
                schedule.retention(),
                schedule.enabled(),
                schedule.next_run().timestamp_millis(),
                schedule.last_run().map(|dt| dt.timestamp_millis()),
                schedule.last_status().map(|s| s.as_str()),
                schedule.created_by(),
            ],
        )?;
        Ok(())
    }

    fn update_schedule(&self, schedule: &BackupSchedule) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE backup_schedules
             SET instance_id = ?2, cron_schedule = ?3, type = ?4, retention = ?5, enabled = ?6,
                 next_run = ?7, last_run = ?8, last_status = ?9, created_by = ?10
             WHERE id = ?1",
            params![
                schedule.id(),
                schedule.instance_id(),
                schedule.cron_schedule(),
                schedule.kind().as_str(),
                schedule.retention(),
                schedule.enabled(),
                schedule.next_run().timestamp_millis(),
                schedule.last_run().map(|dt| dt.timestamp_millis()),
                schedule.last_status().map(|s| s.as_str()),
                schedule.created_by(),
            ],
        )?;
        Ok(updated > 0)
    }

    fn find_schedule(&self, id: &str) -> Result<Option<BackupSchedule>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM backup_schedules WHERE id = ?1"),
                [id],
                schedule_from_row,
            )
            .optional()?)
    }

    fn list_schedules(&self, instance_id: Option<&str>) -> Result<Vec<BackupSchedule>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM backup_schedules
             WHERE (?1 IS NULL OR instance_id = ?1)
             ORDER BY next_run ASC, id ASC"
        ))?;
        let rows = stmt.query_map([instance_id], schedule_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_schedule(&self, id: &str) -> Result<bool> {
        Ok(self
            .conn()
            .execute("DELETE FROM backup_schedules WHERE id = ?1", [id])?
            > 0)
    }

    fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<BackupSchedule>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM backup_schedules
             WHERE enabled = 1 AND next_run <= ?1
             ORDER BY next_run ASC, id ASC"
        ))?;
        let rows = stmt.query_map([now.timestamp_millis()], schedule_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn record_schedule_run(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
        status: ScheduleStatus,
        next_run: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE backup_schedules SET last_run = ?2, last_status = ?3, next_run = ?4 WHERE id = ?1",
            params![
                id,
                last_run.timestamp_millis(),
                status.as_str(),
                next_run.timestamp_millis()
            ],
        )?;
        Ok(updated > 0)
    }
}

impl AuditSink for SqliteCatalog {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        self.conn().execute(
            "INSERT INTO audit_log (action, resource, user_id, success, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.action(),
                event.resource(),
                event.user_id(),
                event.success(),
                event.details().to_string(),
                event.created_at().timestamp_millis(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()
    }

    fn record(id: &str, kind: BackupKind, instance: Option<&str>, created_at: DateTime<Utc>) -> BackupRecord {
        BackupRecord::builder()
            .id(id)
            .name(format!("backup-{id}"))
            .kind(kind)
            .maybe_instance_id(instance.map(str::to_string))
            .size(42)
            .path(format!("/backups/backup-{id}.tar.xz"))
            .created_by("alice")
            .created_at(created_at)
            .build()
    }

    fn schedule(id: &str, enabled: bool, next_run: DateTime<Utc>) -> BackupSchedule {
        BackupSchedule::builder()
            .id(id)
            .instance_id("alpha")
            .cron_schedule("* * * * *")
            .kind(BackupKind::Instance)
            .retention(5)
            .enabled(enabled)
            .next_run(next_run)
            .last_status(ScheduleStatus::Pending)
            .created_by("admin")
            .build()
    }

    #[test]
    fn test_backup_insert_find_delete() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let r = record("b1", BackupKind::Instance, Some("alpha"), at(0));
        catalog.insert_backup(&r).unwrap();

        assert_eq!(catalog.find_backup("b1").unwrap(), Some(r));
        assert!(catalog.delete_backup("b1").unwrap());
        assert!(!catalog.delete_backup("b1").unwrap());
        assert_eq!(catalog.find_backup("b1").unwrap(), None);
    }

    #[test]
    fn test_duplicate_backup_id_rejected() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let r = record("b1", BackupKind::Full, None, at(0));
        catalog.insert_backup(&r).unwrap();
        assert!(catalog.insert_backup(&r).is_err());
    }

    #[test]
    fn test_list_backups_newest_first_with_filters() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog.insert_backup(&record("old", BackupKind::Full, None, at(1))).unwrap();
        catalog
            .insert_backup(&record("mid", BackupKind::Instance, Some("alpha"), at(2)))
            .unwrap();
        catalog
            .insert_backup(&record("new", BackupKind::Instance, Some("beta"), at(3)))
            .unwrap();

        let ids = |v: Vec<BackupRecord>| v.iter().map(|r| r.id().clone()).collect::<Vec<_>>();
        assert_eq!(ids(catalog.list_backups(None, None).unwrap()), ["new", "mid", "old"]);
        assert_eq!(
            ids(catalog.list_backups(Some(BackupKind::Instance), None).unwrap()),
            ["new", "mid"]
        );
        assert_eq!(
            ids(catalog.list_backups(Some(BackupKind::Instance), Some("alpha")).unwrap()),
            ["mid"]
        );
        assert!(catalog
            .list_backups(Some(BackupKind::Database), None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_schedule_roundtrip_and_update() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let s = schedule("s1", true, at(5));
        catalog.insert_schedule(&s).unwrap();
        assert_eq!(catalog.find_schedule("s1").unwrap(), Some(s.clone()));

        let mut edited = s.clone();
        edited.set_admin_fields(
            &crate::backup::model::ScheduleUpdate::builder()
                .cron_schedule("0 * * * *")
                .enabled(false)
                .build(),
            at(30),
        );
        assert!(catalog.update_schedule(&edited).unwrap());
        let found = catalog.find_schedule("s1").unwrap().unwrap();
        assert_eq!(found.cron_schedule(), "0 * * * *");
        assert!(!found.enabled());
        assert_eq!(found.next_run(), at(30));

        assert!(catalog.delete_schedule("s1").unwrap());
        assert!(!catalog.update_schedule(&edited).unwrap());
    }

    #[test]
    fn test_due_schedules_only_enabled_and_past() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let now = at(10);
        catalog.insert_schedule(&schedule("late", true, now - Duration::minutes(1))).unwrap();
        catalog.insert_schedule(&schedule("later", true, now - Duration::minutes(5))).unwrap();
        catalog.insert_schedule(&schedule("exact", true, now)).unwrap();
        catalog.insert_schedule(&schedule("future", true, now + Duration::minutes(1))).unwrap();
        catalog.insert_schedule(&schedule("disabled", false, now - Duration::minutes(1))).unwrap();

        let due: Vec<String> = catalog
            .due_schedules(now)
            .unwrap()
            .into_iter()
            .map(|s| s.id().clone())
            .collect();
        assert_eq!(due, ["later", "late", "exact"]);
    }

    #[test]
    fn test_record_schedule_run() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        catalog.insert_schedule(&schedule("s1", true, at(0))).unwrap();

        assert!(catalog
            .record_schedule_run("s1", at(1), ScheduleStatus::Failed, at(2))
            .unwrap());
        let s = catalog.find_schedule("s1").unwrap().unwrap();
        assert_eq!(s.last_run(), Some(at(1)));
        assert_eq!(s.last_status(), Some(ScheduleStatus::Failed));
        assert_eq!(s.next_run(), at(2));

        assert!(!catalog
            .record_schedule_run("missing", at(1), ScheduleStatus::Success, at(2))
            .unwrap());
    }

    #[test]
    fn test_audit_events_persisted() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let event = AuditEvent::builder()
            .action("BACKUP_CREATE")
            .resource("backup")
            .user_id("alice")
            .success(true)
            .details(serde_json::json!({ "backupId": "b1" }))
            .created_at(at(0))
            .build();
        catalog.record(&event).unwrap();

        assert_eq!(catalog.list_audit_events(10).unwrap(), vec![event]);
    }

    #[test]
    fn test_open_file_catalog_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalog.db");
        {
            let catalog = SqliteCatalog::open(&path).unwrap();
            catalog.insert_backup(&record("b1", BackupKind::Database, None, at(0))).unwrap();
        }
        let catalog = SqliteCatalog::open(&path).unwrap();
        assert!(catalog.find_backup("b1").unwrap().is_some());
    }
}
