use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use serde::Serialize;
use serde_json::json;
use tablevault_core::model::{ActivityStatus, ActivityType, NewActivityLogEntry};
use tablevault_core::{BackupStatus, BackupType, TriggerType};
use tablevault_notify::{Notification, Notifier, Severity};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{CreateBackupRequest, Engine, EngineError};

pub const SCHEDULE_ENABLED_KEY: &str = "schedule.enabled";
pub const SCHEDULE_CRON_KEY: &str = "schedule.cron";
pub const SCHEDULE_BACKUP_TYPE_KEY: &str = "schedule.backup_type";
pub const SCHEDULE_LAST_RUN_KEY: &str = "schedule.last_run";

const DEFAULT_CRON: &str = "0 2 * * *";
/// A matching minute is considered already-served if the last run is younger
/// than this, so one cron minute never triggers twice.
const DEDUP_WINDOW_SECS: i64 = 59;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CronField {
    Any,
    Exact(u32),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Exact(expected) => *expected == value,
        }
    }
}

/// Five-field expression: minute, hour, day-of-month, month, day-of-week.
/// Each field is `*` or a single literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    pub fn parse(raw: &str) -> Result<Self> {
        let fields: Vec<&str> = raw.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(EngineError::InvalidCron(format!(
                "expected 5 fields, got {} in {raw:?}",
                fields.len()
            ))
            .into());
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59, raw)?,
            hour: parse_field(fields[1], 0, 23, raw)?,
            day_of_month: parse_field(fields[2], 1, 31, raw)?,
            month: parse_field(fields[3], 1, 12, raw)?,
            day_of_week: parse_field(fields[4], 0, 6, raw)?,
        })
    }

    /// Field-by-field match against a wall-clock instant. Day-of-week counts
    /// from Sunday = 0.
    pub fn matches(&self, t: &DateTime<Local>) -> bool {
        self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day_of_month.matches(t.day())
            && self.month.matches(t.month())
            && self.day_of_week.matches(t.weekday().num_days_from_sunday())
    }

    /// Next wall-clock match strictly after `from`. Display only; the engine
    /// polls and re-evaluates rather than sleeping until this instant.
    pub fn next_run_after(&self, from: DateTime<Local>) -> Option<DateTime<Local>> {
        let start = from
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(from);
        // Scan a year of minutes; any literal-only expression matches within
        // that window or never (e.g. Feb 30).
        let mut candidate = start;
        for _ in 0..(366 * 24 * 60) {
            candidate += chrono::Duration::minutes(1);
            if self.matches(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

fn parse_field(raw: &str, min: u32, max: u32, expr: &str) -> Result<CronField> {
    if raw == "*" {
        return Ok(CronField::Any);
    }
    let value: u32 = raw
        .parse()
        .map_err(|_| EngineError::InvalidCron(format!("field {raw:?} in {expr:?}")))?;
    if value < min || value > max {
        return Err(
            EngineError::InvalidCron(format!("field {raw} out of range {min}-{max} in {expr:?}"))
                .into(),
        );
    }
    Ok(CronField::Exact(value))
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub cron: String,
    pub backup_type: BackupType,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub enabled: bool,
    pub cron: String,
    pub backup_type: BackupType,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Local>>,
    pub in_flight: bool,
}

/// What one poll decided to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Disabled,
    NotDue,
    /// The matching minute already ran.
    DedupSkipped,
    /// Another scheduled backup is still in flight.
    AlreadyRunning,
    Triggered(Uuid),
    BackupFailed(String),
}

impl Engine {
    pub async fn schedule_config(&self) -> Result<ScheduleConfig> {
        let enabled = self
            .store
            .get_setting(SCHEDULE_ENABLED_KEY)
            .await?
            .map(|v| v == "true")
            .unwrap_or(false);
        let cron = self
            .store
            .get_setting(SCHEDULE_CRON_KEY)
            .await?
            .unwrap_or_else(|| DEFAULT_CRON.to_owned());
        let backup_type = self
            .store
            .get_setting(SCHEDULE_BACKUP_TYPE_KEY)
            .await?
            .map(|v| BackupType::parse(&v))
            .unwrap_or(BackupType::Full);
        let last_run = self
            .store
            .get_setting(SCHEDULE_LAST_RUN_KEY)
            .await?
            .and_then(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            });
        Ok(ScheduleConfig {
            enabled,
            cron,
            backup_type,
            last_run,
        })
    }

    /// Partial schedule update; the cron expression is validated before it
    /// is stored.
    pub async fn update_schedule(
        &self,
        enabled: Option<bool>,
        cron: Option<String>,
        backup_type: Option<BackupType>,
        actor: &str,
    ) -> Result<ScheduleConfig> {
        if let Some(expr) = &cron {
            CronExpr::parse(expr)?;
        }
        if let Some(enabled) = enabled {
            self.store
                .set_setting(SCHEDULE_ENABLED_KEY, if enabled { "true" } else { "false" })
                .await?;
        }
        if let Some(expr) = &cron {
            self.store.set_setting(SCHEDULE_CRON_KEY, expr).await?;
        }
        if let Some(backup_type) = backup_type {
            self.store
                .set_setting(SCHEDULE_BACKUP_TYPE_KEY, backup_type.as_str())
                .await?;
        }

        let config = self.schedule_config().await?;
        self.log_activity(
            NewActivityLogEntry::new(
                ActivityType::ScheduleUpdated,
                actor,
                ActivityStatus::Success,
            )
            .with_details(json!({
                "enabled": config.enabled,
                "cron": config.cron,
                "backup_type": config.backup_type,
            })),
        )
        .await;
        Ok(config)
    }
}

/// Time-driven backup trigger. Owns its poll task; `start`/`stop` bracket
/// the lifecycle, and all schedule state lives in settings so ticks always
/// re-read the current configuration.
pub struct Scheduler {
    engine: Arc<Engine>,
    notifier: Arc<dyn Notifier>,
    poll_interval: Duration,
    in_flight: Arc<AtomicBool>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            engine,
            notifier,
            poll_interval: Duration::from_secs(60),
            in_flight: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let engine = self.engine.clone();
        let notifier = self.notifier.clone();
        let in_flight = self.in_flight.clone();
        let poll_interval = self.poll_interval;
        self.handle = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                match run_tick(&engine, notifier.as_ref(), &in_flight, Local::now()).await {
                    Ok(TickOutcome::Triggered(id)) => {
                        info!(backup_id = %id, "scheduled backup created")
                    }
                    Ok(TickOutcome::BackupFailed(message)) => {
                        error!(error = %message, "scheduled backup failed")
                    }
                    Ok(outcome) => debug!(?outcome, "scheduler tick"),
                    Err(e) => error!(error = %e, "scheduler tick errored"),
                }
            }
        }));
        info!("scheduler started");
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("scheduler stopped");
        }
    }

    /// One evaluation against the current wall clock.
    pub async fn tick(&self) -> Result<TickOutcome> {
        self.tick_at(Local::now()).await
    }

    /// One evaluation against an explicit instant.
    pub async fn tick_at(&self, now: DateTime<Local>) -> Result<TickOutcome> {
        run_tick(&self.engine, self.notifier.as_ref(), &self.in_flight, now).await
    }

    /// Pure status query; makes no scheduling decisions.
    pub async fn status(&self) -> Result<ScheduleStatus> {
        let config = self.engine.schedule_config().await?;
        let next_run = if config.enabled {
            CronExpr::parse(&config.cron)
                .ok()
                .and_then(|expr| expr.next_run_after(Local::now()))
        } else {
            None
        };
        Ok(ScheduleStatus {
            enabled: config.enabled,
            cron: config.cron,
            backup_type: config.backup_type,
            last_run: config.last_run,
            next_run,
            in_flight: self.in_flight.load(Ordering::SeqCst),
        })
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_tick(
    engine: &Engine,
    notifier: &dyn Notifier,
    in_flight: &AtomicBool,
    now: DateTime<Local>,
) -> Result<TickOutcome> {
    let config = engine.schedule_config().await?;
    if !config.enabled {
        return Ok(TickOutcome::Disabled);
    }
    let expr = CronExpr::parse(&config.cron)?;
    if !expr.matches(&now) {
        return Ok(TickOutcome::NotDue);
    }
    if let Some(last_run) = config.last_run {
        let elapsed = (now.with_timezone(&Utc) - last_run).num_seconds();
        if elapsed < DEDUP_WINDOW_SECS {
            return Ok(TickOutcome::DedupSkipped);
        }
    }
    if in_flight.swap(true, Ordering::SeqCst) {
        return Ok(TickOutcome::AlreadyRunning);
    }

    let request = CreateBackupRequest {
        name: format!("scheduled_{}", now.format("%Y%m%d_%H%M")),
        description: Some(format!("scheduled backup ({})", config.cron)),
        backup_type: config.backup_type,
        trigger_type: TriggerType::Scheduled,
        created_by: "system".to_owned(),
        tables: None,
    };
    let result = engine.create_backup(request).await;
    in_flight.store(false, Ordering::SeqCst);

    let failure_message = match &result {
        Ok(backup) if backup.status != BackupStatus::Failed => None,
        Ok(backup) => Some(
            backup
                .error_message
                .clone()
                .unwrap_or_else(|| "backup failed".to_owned()),
        ),
        Err(e) => Some(format!("{e:#}")),
    };

    match failure_message {
        None => {
            let backup = result.context("backup result vanished")?;
            engine
                .store
                .set_setting(
                    SCHEDULE_LAST_RUN_KEY,
                    &now.with_timezone(&Utc).to_rfc3339(),
                )
                .await?;

            // Housekeeping rides on successful scheduled runs.
            if engine.retention_policy().await?.enabled {
                if let Err(e) = engine.apply_retention_policy().await {
                    error!(error = %e, "post-backup retention run failed");
                }
            }
            Ok(TickOutcome::Triggered(backup.id))
        }
        Some(message) => {
            // Last run stays untouched so the next eligible tick retries.
            let delivery = notifier
                .notify(&Notification {
                    subject: "scheduled backup failed".to_owned(),
                    body: format!("schedule {:?}: {message}", config.cron),
                    severity: Severity::Error,
                })
                .await;
            if let Err(e) = delivery {
                error!(error = %e, "operator notification failed");
            }
            Ok(TickOutcome::BackupFailed(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Local, TimeZone};
    use tablevault_notify::{Notification, Notifier};
    use tokio::sync::Mutex;

    use super::*;
    use crate::testutil::{engine_with, users_rows, FailingTable, MemTable};

    #[derive(Default)]
    struct RecordingNotifier {
        delivered: Mutex<Vec<Notification>>,
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> Result<()> {
            self.delivered.lock().await.push(notification.clone());
            Ok(())
        }
    }

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .single()
            .expect("unambiguous local time")
    }

    #[test]
    fn cron_parse_accepts_wildcards_and_literals() {
        assert!(CronExpr::parse("0 2 * * *").is_ok());
        assert!(CronExpr::parse("* * * * *").is_ok());
        assert!(CronExpr::parse("59 23 31 12 6").is_ok());

        assert!(CronExpr::parse("0 2 * *").is_err());
        assert!(CronExpr::parse("60 2 * * *").is_err());
        assert!(CronExpr::parse("0 24 * * *").is_err());
        assert!(CronExpr::parse("0 2 0 * *").is_err());
        assert!(CronExpr::parse("*/5 * * * *").is_err());
    }

    #[test]
    fn cron_matches_field_by_field() {
        let expr = CronExpr::parse("30 4 * * *").expect("parse");
        assert!(expr.matches(&local(2026, 3, 10, 4, 30, 0)));
        assert!(expr.matches(&local(2026, 3, 10, 4, 30, 59)));
        assert!(!expr.matches(&local(2026, 3, 10, 4, 31, 0)));
        assert!(!expr.matches(&local(2026, 3, 10, 5, 30, 0)));

        // 2026-03-08 is a Sunday.
        let sundays = CronExpr::parse("0 0 * * 0").expect("parse");
        assert!(sundays.matches(&local(2026, 3, 8, 0, 0, 0)));
        assert!(!sundays.matches(&local(2026, 3, 9, 0, 0, 0)));
    }

    #[test]
    fn next_run_is_the_following_match() {
        let expr = CronExpr::parse("30 4 * * *").expect("parse");
        let next = expr
            .next_run_after(local(2026, 3, 10, 4, 30, 10))
            .expect("next");
        // Strictly after: the current matching minute does not count.
        assert_eq!(next, local(2026, 3, 11, 4, 30, 0));

        let soon = expr
            .next_run_after(local(2026, 3, 10, 3, 0, 0))
            .expect("next");
        assert_eq!(soon, local(2026, 3, 10, 4, 30, 0));
    }

    async fn scheduler_env(
        tables: Vec<(&str, Arc<dyn tablevault_storage::TableHandle>)>,
        cron: &str,
    ) -> (
        Scheduler,
        Arc<Engine>,
        Arc<RecordingNotifier>,
        tempfile::TempDir,
    ) {
        let (engine, tmp) = engine_with(tables).into_parts();
        let engine = Arc::new(engine);
        engine
            .update_schedule(Some(true), Some(cron.to_owned()), None, "tester")
            .await
            .expect("schedule");
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = Scheduler::new(engine.clone(), notifier.clone());
        (scheduler, engine, notifier, tmp)
    }

    #[tokio::test]
    async fn matching_tick_triggers_once_and_dedups() {
        let (scheduler, engine, _notifier, _tmp) = scheduler_env(
            vec![("users", Arc::new(MemTable::new(users_rows())) as _)],
            "30 4 * * *",
        )
        .await;

        let t0 = local(2026, 3, 10, 4, 30, 0);
        let outcome = scheduler.tick_at(t0).await.expect("tick");
        let TickOutcome::Triggered(backup_id) = outcome else {
            panic!("expected trigger, got {outcome:?}");
        };
        let backup = engine
            .get_backup(backup_id)
            .await
            .expect("get")
            .expect("found");
        assert_eq!(backup.trigger_type, TriggerType::Scheduled);
        assert_eq!(backup.created_by, "system");

        // One second later, same matching minute: deduplicated.
        let again = scheduler
            .tick_at(t0 + chrono::Duration::seconds(1))
            .await
            .expect("tick");
        assert_eq!(again, TickOutcome::DedupSkipped);

        // The next day's matching minute runs again.
        let next_day = scheduler
            .tick_at(t0 + chrono::Duration::days(1))
            .await
            .expect("tick");
        assert!(matches!(next_day, TickOutcome::Triggered(_)));
    }

    #[tokio::test]
    async fn non_matching_and_disabled_ticks_are_no_ops() {
        let (scheduler, engine, _notifier, _tmp) = scheduler_env(
            vec![("users", Arc::new(MemTable::new(users_rows())) as _)],
            "30 4 * * *",
        )
        .await;

        let off_minute = scheduler
            .tick_at(local(2026, 3, 10, 4, 31, 0))
            .await
            .expect("tick");
        assert_eq!(off_minute, TickOutcome::NotDue);

        engine
            .update_schedule(Some(false), None, None, "tester")
            .await
            .expect("disable");
        let disabled = scheduler
            .tick_at(local(2026, 3, 10, 4, 30, 0))
            .await
            .expect("tick");
        assert_eq!(disabled, TickOutcome::Disabled);

        assert!(engine.list_backups().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn failed_backup_notifies_and_leaves_last_run_unset() {
        let (scheduler, engine, notifier, _tmp) = scheduler_env(
            vec![(
                "users",
                Arc::new(FailingTable {
                    message: "source db offline".into(),
                }) as _,
            )],
            "* * * * *",
        )
        .await;

        let outcome = scheduler
            .tick_at(local(2026, 3, 10, 9, 0, 0))
            .await
            .expect("tick");
        assert!(matches!(outcome, TickOutcome::BackupFailed(_)));

        let delivered = notifier.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].body.contains("source db offline"));
        assert_eq!(delivered[0].severity, Severity::Error);
        drop(delivered);

        // Retry is possible because last_run stayed unset.
        let config = engine.schedule_config().await.expect("config");
        assert!(config.last_run.is_none());
        let retry = scheduler
            .tick_at(local(2026, 3, 10, 9, 1, 0))
            .await
            .expect("tick");
        assert!(matches!(retry, TickOutcome::BackupFailed(_)));
    }

    #[tokio::test]
    async fn successful_run_applies_enabled_retention() {
        let (scheduler, engine, _notifier, _tmp) = scheduler_env(
            vec![("users", Arc::new(MemTable::new(users_rows())) as _)],
            "* * * * *",
        )
        .await;
        engine
            .update_retention_policy(
                tablevault_core::RetentionPolicyUpdate {
                    enabled: Some(true),
                    retention_days: Some(30),
                    protect_labeled: Some(false),
                    protect_manual: Some(false),
                },
                "tester",
            )
            .await
            .expect("policy");

        // An expired backup that the post-run retention pass should delete.
        let mut expired = tablevault_core::Backup::begin(
            "ancient".into(),
            None,
            BackupType::Full,
            TriggerType::Automatic,
            "tester".into(),
        );
        expired.status = BackupStatus::Completed;
        expired.created_at = Utc::now() - chrono::Duration::days(90);
        engine.store.insert_backup(&expired).await.expect("insert");

        let outcome = scheduler
            .tick_at(local(2026, 3, 10, 9, 0, 0))
            .await
            .expect("tick");
        assert!(matches!(outcome, TickOutcome::Triggered(_)));

        let reloaded = engine
            .get_backup(expired.id)
            .await
            .expect("get")
            .expect("found");
        assert_eq!(reloaded.status, BackupStatus::Deleted);
        assert!(engine
            .schedule_config()
            .await
            .expect("config")
            .last_run
            .is_some());
    }

    #[tokio::test]
    async fn status_reports_next_run_for_enabled_schedule() {
        let (scheduler, _engine, _notifier, _tmp) = scheduler_env(
            vec![("users", Arc::new(MemTable::new(users_rows())) as _)],
            "0 2 * * *",
        )
        .await;

        let status = scheduler.status().await.expect("status");
        assert!(status.enabled);
        assert_eq!(status.cron, "0 2 * * *");
        assert!(!status.in_flight);
        let next = status.next_run.expect("next run");
        assert_eq!(next.hour(), 2);
        assert_eq!(next.minute(), 0);
    }
}
