//! Scheduled backups.
//!
//! A single timer thread polls the catalog for due schedules and runs them one
//! after the other. A failing schedule is recorded as failed and its next run
//! is advanced like any other, it never stops the loop.

use crate::backup::audit::{
    AuditEvent, BestEffortAudit, BACKUP_AUTO_CREATE, SCHEDULE_CREATE, SCHEDULE_DELETE,
    SCHEDULE_UPDATE,
};
use crate::backup::catalog::Catalog;
use crate::backup::cron;
use crate::backup::function_path;
use crate::backup::instances::{InstanceNames, StaticInstanceNames};
use crate::backup::model::{
    BackupKind, BackupRecord, BackupSchedule, BackupTarget, NewSchedule, ScheduleStatus,
    ScheduleUpdate, SYSTEM_USER,
};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use crate::backup::store::BackupStore;
use bon::bon;
use chrono::{DateTime, SubsecRound, Utc};
use function_name::named;
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

static DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Hours until the next attempt of a schedule whose stored cron no longer parses.
static BROKEN_CRON_RETRY_HOURS: i64 = 1;

/// Schedule ids handled by one poll, by outcome.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

/// `auto-{instance name}-{type}-{epoch millis}`.
pub fn auto_backup_name(instance_name: &str, kind: BackupKind, at: DateTime<Utc>) -> String {
    format!(
        "auto-{}-{kind}-{}",
        sanitize_filename::sanitize(instance_name),
        at.timestamp_millis()
    )
}

struct Timer {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

struct SchedulerCore {
    store: Arc<BackupStore>,
    catalog: Arc<dyn Catalog>,
    audit: BestEffortAudit,
    instance_names: Arc<dyn InstanceNames>,
    execution_timeout: Option<Duration>,
    /// Serializes read-modify-write of schedule rows.
    schedules: Mutex<()>,
}

pub struct Scheduler {
    core: Arc<SchedulerCore>,
    poll_interval: Duration,
    timer: Mutex<Option<Timer>>,
}

#[bon]
impl Scheduler {
    #[builder]
    pub fn new(
        store: Arc<BackupStore>,
        catalog: Arc<dyn Catalog>,
        #[builder(default)] audit: BestEffortAudit,
        #[builder(default = Arc::new(StaticInstanceNames::default()) as Arc<dyn InstanceNames>)]
        instance_names: Arc<dyn InstanceNames>,
        #[builder(default = DEFAULT_POLL_INTERVAL)] poll_interval: Duration,
        execution_timeout: Option<Duration>,
    ) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                store,
                catalog,
                audit,
                instance_names,
                execution_timeout,
                schedules: Mutex::new(()),
            }),
            poll_interval,
            timer: Mutex::new(None),
        }
    }
}

impl Scheduler {
    fn timer(&self) -> MutexGuard<'_, Option<Timer>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the timer thread. Polls once right away, then every
    /// `poll_interval`. Calling it while running does nothing.
    pub fn start(&self) -> Result<()> {
        let mut timer = self.timer();
        if timer.is_some() {
            tracing::debug!("Scheduler already running");
            return Ok(());
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let core = self.core.clone();
        let interval = self.poll_interval;
        let handle = std::thread::Builder::new()
            .name("kbackupd-scheduler".into())
            .spawn(move || {
                tracing::info!("Scheduler started, polling every {:?}", interval);
                loop {
                    if let Err(e) = core.poll_once(Utc::now()) {
                        tracing::error!("Polling schedules failed: {e}");
                    }
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::info!("Scheduler stopped");
            })?;

        *timer = Some(Timer { stop, handle });
        Ok(())
    }

    /// Cancels the timer and waits for the poll in progress, if any, to finish.
    pub fn stop(&self) {
        let Some(Timer { stop, handle }) = self.timer().take() else {
            return;
        };
        let _ = stop.send(());
        if handle.join().is_err() {
            tracing::error!("Scheduler thread panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer().is_some()
    }

    /// Runs every schedule due at `now`, sequentially, earliest first.
    pub fn poll_once(&self, now: DateTime<Utc>) -> Result<PollReport> {
        self.core.poll_once(now)
    }

    #[named]
    pub fn create_schedule(&self, new: NewSchedule) -> Result<BackupSchedule> {
        let res = (|| -> Result<BackupSchedule> {
            BackupTarget::from_parts(new.kind, Some(new.instance_id.clone()))?;
            let next_run = cron::next_run(&new.cron_schedule, Utc::now())?;
            let schedule = BackupSchedule::builder()
                .id(uuid::Uuid::new_v4().to_string())
                .instance_id(new.instance_id.clone())
                .cron_schedule(new.cron_schedule.clone())
                .kind(new.kind)
                .retention(new.retention)
                .enabled(new.enabled)
                .next_run(next_run.trunc_subsecs(3))
                .last_status(ScheduleStatus::Pending)
                .created_by(new.created_by.clone())
                .build();
            self.core.catalog.insert_schedule(&schedule)?;
            Ok(schedule)
        })();

        self.core.audit_schedule(SCHEDULE_CREATE, Some(new.created_by.as_str()), &res, || {
            json!({ "instanceId": new.instance_id, "cronSchedule": new.cron_schedule })
        });
        res.add_fn_name(function_path!())
    }

    /// Applies `update` and recomputes `next_run` from now.
    #[named]
    pub fn update_schedule(&self, id: &str, update: ScheduleUpdate) -> Result<BackupSchedule> {
        let res = (|| -> Result<BackupSchedule> {
            let _schedules = self.core.lock_schedules();
            let mut schedule = self
                .core
                .catalog
                .find_schedule(id)?
                .ok_or_else(|| Error::not_found("schedule", id))?;
            let cron_expr = update
                .cron_schedule
                .as_deref()
                .unwrap_or(schedule.cron_schedule());
            let next_run = cron::next_run(cron_expr, Utc::now())?;
            schedule.set_admin_fields(&update, next_run.trunc_subsecs(3));
            schedule.target()?;
            if !self.core.catalog.update_schedule(&schedule)? {
                return Err(Error::not_found("schedule", id));
            }
            Ok(schedule)
        })();

        self.core
            .audit_schedule(SCHEDULE_UPDATE, None, &res, || json!({ "scheduleId": id }));
        res.add_fn_name(function_path!())
    }

    #[named]
    pub fn delete_schedule(&self, id: &str) -> Result<()> {
        let res = (|| -> Result<()> {
            let _schedules = self.core.lock_schedules();
            if !self.core.catalog.delete_schedule(id)? {
                return Err(Error::not_found("schedule", id));
            }
            Ok(())
        })();

        self.core
            .audit_schedule(SCHEDULE_DELETE, None, &res, || json!({ "scheduleId": id }));
        res.add_fn_name(function_path!())
    }

    pub fn get_schedule(&self, id: &str) -> Result<Option<BackupSchedule>> {
        self.core.catalog.find_schedule(id)
    }

    pub fn list_schedules(&self, instance_id: Option<&str>) -> Result<Vec<BackupSchedule>> {
        self.core.catalog.list_schedules(instance_id)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SchedulerCore {
    fn lock_schedules(&self) -> MutexGuard<'_, ()> {
        self.schedules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn audit_schedule<T, F: FnOnce() -> serde_json::Value>(
        &self,
        action: &str,
        user_id: Option<&str>,
        res: &Result<T>,
        details: F,
    ) {
        let mut details = details();
        if let (Err(e), Some(map)) = (res, details.as_object_mut()) {
            map.insert("error".into(), e.to_string().into());
        }
        self.audit.record(
            AuditEvent::builder()
                .action(action)
                .resource("backup_schedule")
                .maybe_user_id(user_id)
                .success(res.is_ok())
                .details(details)
                .build(),
        );
    }

    fn poll_once(&self, now: DateTime<Utc>) -> Result<PollReport> {
        let due = self.catalog.due_schedules(now)?;
        if due.is_empty() {
            tracing::trace!("No schedule due at {now}");
            return Ok(PollReport::default());
        }
        tracing::info!("{} schedule(s) due at {now}", due.len());

        let mut report = PollReport::default();
        for schedule in due {
            match self.run_schedule(&schedule, now) {
                Ok(_) => report.succeeded.push(schedule.id().clone()),
                Err(_) => report.failed.push(schedule.id().clone()),
            }
        }
        Ok(report)
    }

    fn run_schedule(&self, schedule: &BackupSchedule, now: DateTime<Utc>) -> Result<BackupRecord> {
        let res = self.execute(schedule, now);

        let status = match &res {
            Ok(_) => ScheduleStatus::Success,
            Err(_) => ScheduleStatus::Failed,
        };
        let next_run = self.record_run(schedule, now, status);

        let details = match &res {
            Ok(record) => json!({
                "scheduleId": schedule.id(),
                "backupId": record.id(),
                "type": schedule.kind(),
            }),
            Err(e) => json!({
                "scheduleId": schedule.id(),
                "type": schedule.kind(),
                "error": e.to_string(),
            }),
        };
        self.audit.record(
            AuditEvent::builder()
                .action(BACKUP_AUTO_CREATE)
                .resource("backup_schedule")
                .user_id(SYSTEM_USER)
                .success(res.is_ok())
                .details(details)
                .build(),
        );

        match &res {
            Ok(record) => tracing::info!(
                "Schedule {} created backup {:?}, next run at {:?}",
                schedule.id(),
                record.name(),
                next_run
            ),
            Err(e) => tracing::warn!(
                "Schedule {} failed, next run at {:?}: {e}",
                schedule.id(),
                next_run
            ),
        }
        res
    }

    /// Stores the outcome of a run. The next run is computed from the row as
    /// it is now, since an admin edit may have changed its cron while the
    /// backup ran. Returns the stored next run, if the row still exists.
    fn record_run(
        &self,
        schedule: &BackupSchedule,
        now: DateTime<Utc>,
        status: ScheduleStatus,
    ) -> Option<DateTime<Utc>> {
        let _schedules = self.lock_schedules();
        let res = (|| -> Result<Option<DateTime<Utc>>> {
            let Some(current) = self.catalog.find_schedule(schedule.id())? else {
                return Ok(None);
            };
            let next_run = cron::next_run(current.cron_schedule(), now).unwrap_or_else(|e| {
                tracing::error!("Schedule {} has a broken cron expression: {e}", schedule.id());
                now + chrono::Duration::hours(BROKEN_CRON_RETRY_HOURS)
            });
            let recorded = self
                .catalog
                .record_schedule_run(schedule.id(), now, status, next_run)?;
            Ok(recorded.then_some(next_run))
        })();

        match res {
            Ok(Some(next_run)) => Some(next_run),
            Ok(None) => {
                tracing::warn!("Schedule {} was removed while it ran", schedule.id());
                None
            }
            Err(e) => {
                tracing::error!("Recording run of schedule {} failed: {e}", schedule.id());
                None
            }
        }
    }

    fn execute(&self, schedule: &BackupSchedule, now: DateTime<Utc>) -> Result<BackupRecord> {
        let target = schedule.target()?;
        let instance_name = self
            .instance_names
            .display_name(schedule.instance_id())
            .unwrap_or_else(|e| {
                tracing::debug!("Using raw instance id for schedule {}: {e}", schedule.id());
                schedule.instance_id().clone()
            });
        let name = auto_backup_name(&instance_name, schedule.kind(), now);

        let Some(timeout) = self.execution_timeout else {
            return self.store.create_backup(&target, Some(&name), SYSTEM_USER);
        };

        // Set by whichever of the worker (about to record) or the watchdog
        // (giving up) gets there first.
        let claim = Arc::new(AtomicBool::new(false));
        let (done, result) = mpsc::channel();
        let store = self.store.clone();
        let worker_claim = claim.clone();
        std::thread::Builder::new()
            .name(format!("kbackupd-schedule-{}", schedule.id()))
            .spawn(move || {
                let _ = done.send(store.create_backup_claimed(
                    &target,
                    Some(&name),
                    SYSTEM_USER,
                    &worker_claim,
                ));
            })?;

        let disconnected = || {
            Error::from(std::io::Error::other("backup worker exited without a result"))
        };
        match result.recv_timeout(timeout) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) if !claim.swap(true, Ordering::SeqCst) => {
                Err(Error::Timeout(timeout))
            }
            // The worker is already recording, its outcome stands.
            Err(RecvTimeoutError::Timeout) => result.recv().unwrap_or_else(|_| Err(disconnected())),
            Err(RecvTimeoutError::Disconnected) => Err(disconnected()),
        }
    }
}
