//! Reconciliation scheduler that runs "synchronize all mapped groups" on a
//! configurable interval and on demand (SIGHUP).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tokio::time;
use tracing::{error, info, warn};

use ldapsync_core::db::Database;
use ldapsync_core::errors::SyncError;
use ldapsync_core::sync_engine::{SyncAllReport, SyncEngine};

/// Tracks aggregate statistics across passes.
pub struct SchedulerStats {
    pub total_passes: AtomicU64,
    pub total_group_failures: AtomicU64,
    pub total_member_failures: AtomicU64,
    pub total_errors: AtomicU64,
    pub consecutive_errors: AtomicU64,
}

impl SchedulerStats {
    fn new() -> Self {
        Self {
            total_passes: AtomicU64::new(0),
            total_group_failures: AtomicU64::new(0),
            total_member_failures: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            consecutive_errors: AtomicU64::new(0),
        }
    }
}

/// The reconciliation scheduler.
///
/// Passes run on the blocking thread pool. If a pass is still running when
/// the next one is due, the engine rejects it and the tick is skipped.
pub struct Scheduler {
    engine: Arc<SyncEngine<Database>>,
    poll_interval: Duration,
    trigger_rx: mpsc::Receiver<()>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine<Database>>, poll_interval: Duration, trigger_rx: mpsc::Receiver<()>) -> Self {
        Self {
            engine,
            poll_interval,
            trigger_rx,
            stats: Arc::new(SchedulerStats::new()),
        }
    }

    /// Main scheduler loop. Returns once `shutdown` is notified.
    pub async fn run(&mut self, shutdown: Arc<Notify>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "scheduler started"
        );

        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.run_pass("scheduled").await;
                }
                Some(()) = self.trigger_rx.recv() => {
                    info!("immediate reconciliation requested");
                    self.run_pass("signal").await;
                    interval.reset();
                }
            }
        }

        info!(
            passes = self.stats.total_passes.load(Ordering::SeqCst),
            group_failures = self.stats.total_group_failures.load(Ordering::SeqCst),
            member_failures = self.stats.total_member_failures.load(Ordering::SeqCst),
            errors = self.stats.total_errors.load(Ordering::SeqCst),
            "scheduler stopped"
        );
    }

    async fn run_pass(&self, trigger: &str) {
        let pass = self.stats.total_passes.fetch_add(1, Ordering::SeqCst) + 1;
        info!(pass, trigger, "starting reconciliation pass");

        let pass_start = Utc::now();
        let engine = Arc::clone(&self.engine);
        let result = match tokio::task::spawn_blocking(move || engine.sync_all()).await {
            Ok(result) => result,
            Err(e) => {
                error!(pass, error = %e, "reconciliation task panicked");
                self.record_error();
                return;
            }
        };

        match result {
            Ok(report) => {
                let member_failures: usize = report.groups.iter().map(|g| g.failures.len()).sum();
                self.stats
                    .total_group_failures
                    .fetch_add(report.failed.len() as u64, Ordering::SeqCst);
                self.stats
                    .total_member_failures
                    .fetch_add(member_failures as u64, Ordering::SeqCst);

                if report.failed.is_empty() {
                    self.stats.consecutive_errors.store(0, Ordering::SeqCst);
                } else {
                    self.record_error();
                }
                for failure in &report.failed {
                    warn!(pass, group = %failure.group, error = %failure.error, "group pass failed");
                }

                let now = Utc::now();
                let duration_ms = (now - pass_start).num_milliseconds().max(0);
                let summary = pass_summary(pass, &report, duration_ms, now);
                let _ = self.engine.store().set_state("last_pass_summary", &summary.to_string());

                info!(
                    pass,
                    groups = report.groups.len(),
                    failed = report.failed.len(),
                    member_failures,
                    cancelled = report.cancelled,
                    duration_ms,
                    "reconciliation pass completed"
                );
            }
            Err(SyncError::AlreadyRunning { started_at }) => {
                warn!(pass, %started_at, "skipping pass: previous pass still running");
            }
            Err(e) => {
                self.record_error();
                error!(pass, error = %e, "reconciliation pass failed");
            }
        }
    }

    fn record_error(&self) {
        let errors = self.stats.total_errors.fetch_add(1, Ordering::SeqCst) + 1;
        let consecutive = self.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        if consecutive > 1 {
            warn!(total_errors = errors, consecutive_errors = consecutive, "repeated reconciliation failures");
        }
    }
}

/// JSON stored under `last_pass_summary` after each completed pass.
fn pass_summary(pass: u64, report: &SyncAllReport, duration_ms: i64, recorded_at: DateTime<Utc>) -> serde_json::Value {
    let member_failures: usize = report.groups.iter().map(|g| g.failures.len()).sum();
    serde_json::json!({
        "pass": pass,
        "duration_ms": duration_ms,
        "recorded_at": recorded_at.to_rfc3339(),
        "groups": report.groups.len(),
        "failed": report.failed.len(),
        "member_failures": member_failures,
        "cancelled": report.cancelled,
        "started_at": report.started_at,
        "completed_at": report.completed_at,
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_pass_summary_records_timing() {
        let report = SyncAllReport {
            cancelled: true,
            started_at: "2026-01-05T10:00:00+00:00".into(),
            ..Default::default()
        };
        let recorded_at = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 2).unwrap();

        let summary = pass_summary(7, &report, 2_000, recorded_at);
        assert_eq!(summary["pass"], 7);
        assert_eq!(summary["duration_ms"], 2_000);
        assert_eq!(summary["recorded_at"], "2026-01-05T10:00:02+00:00");
        assert_eq!(summary["groups"], 0);
        assert_eq!(summary["member_failures"], 0);
        assert_eq!(summary["cancelled"], true);
        assert!(summary["completed_at"].is_null());
    }
}
