//! Job orchestrator.
//!
//! Six fixed-cadence jobs run on independent wall-clock timers inside one
//! process. There is no inter-job locking: overlapping firings are legal and
//! correctness rests on the idempotent upsert in the risk engine and the
//! claim-based delivery in the notification service. Every firing is bounded
//! by a timeout and wrapped in a catch-log boundary so a failed or stuck
//! invocation never cancels another job's future runs.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::DbPool;
use crate::error::Result;
use crate::notify::Notifier;
use crate::reminders;
use crate::risk;

/// Per-invocation timeout. Generous, but keeps a stuck external call from
/// stalling the job's own timer loop indefinitely.
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Shared state handed to every job invocation.
pub struct Context {
    pub pool: DbPool,
    pub notifier: Notifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Full risk sweep across every student.
    RiskSweep,
    /// Deliver scheduled notifications that have come due.
    FlushScheduled,
    /// Direct reminders for students below the attendance threshold.
    LowAttendanceCheck,
    /// Reminders for tests coming up in the next few days.
    UpcomingTestCheck,
    /// Monthly payment reminder to all students.
    FeeReminder,
    /// Aggregate critical-risk alert to teachers.
    TeacherAlert,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::RiskSweep,
        JobKind::FlushScheduled,
        JobKind::LowAttendanceCheck,
        JobKind::UpcomingTestCheck,
        JobKind::FeeReminder,
        JobKind::TeacherAlert,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::RiskSweep => "risk-sweep",
            JobKind::FlushScheduled => "flush-scheduled",
            JobKind::LowAttendanceCheck => "low-attendance-check",
            JobKind::UpcomingTestCheck => "upcoming-test-check",
            JobKind::FeeReminder => "fee-reminder",
            JobKind::TeacherAlert => "teacher-alert",
        }
    }

    /// Seconds-resolution cron expression for this job's cadence.
    pub fn cron_expr(&self) -> &'static str {
        match self {
            JobKind::RiskSweep => "0 0 0 * * *",
            JobKind::FlushScheduled => "0 */5 * * * *",
            JobKind::LowAttendanceCheck => "0 0 21 * * *",
            JobKind::UpcomingTestCheck => "0 0 8 * * *",
            JobKind::FeeReminder => "0 0 9 1 * *",
            JobKind::TeacherAlert => "0 0 */6 * * *",
        }
    }

    async fn run(&self, ctx: &Context) -> Result<String> {
        match self {
            JobKind::RiskSweep => {
                let sweep = risk::compute_all_risks(&ctx.pool).await?;
                Ok(format!(
                    "{} students, {} at-risk, {} critical, {} failed",
                    sweep.total, sweep.at_risk, sweep.critical, sweep.failed
                ))
            }
            JobKind::FlushScheduled => {
                let delivered = ctx.notifier.flush_due().await?;
                Ok(format!("{delivered} notifications delivered"))
            }
            JobKind::LowAttendanceCheck => {
                let n = reminders::low_attendance(&ctx.pool, &ctx.notifier).await?;
                Ok(format!("{n} students reminded"))
            }
            JobKind::UpcomingTestCheck => {
                let n = reminders::upcoming_tests(&ctx.pool, &ctx.notifier).await?;
                Ok(format!("{n} enrollees reminded"))
            }
            JobKind::FeeReminder => {
                let n = reminders::fee_reminder(&ctx.pool, &ctx.notifier).await?;
                Ok(format!("{n} students reminded"))
            }
            JobKind::TeacherAlert => {
                let n = reminders::teacher_alerts(&ctx.pool, &ctx.notifier).await?;
                Ok(format!("{n} teachers alerted"))
            }
        }
    }
}

pub struct Scheduler {
    ctx: Arc<Context>,
    cancel: CancellationToken,
    job_timeout: Duration,
}

impl Scheduler {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx: Arc::new(ctx),
            cancel: CancellationToken::new(),
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    /// Token that stops every job loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn one timer loop per job and return the handles.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        JobKind::ALL
            .iter()
            .map(|&kind| {
                let ctx = Arc::clone(&self.ctx);
                let cancel = self.cancel.clone();
                let timeout = self.job_timeout;
                tokio::spawn(job_loop(kind, ctx, cancel, timeout))
            })
            .collect()
    }

    /// Stop all job loops.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run every job loop until the cancellation token fires.
    pub async fn run_until_cancelled(&self) {
        let handles = self.start();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "job loop panicked");
            }
        }
    }
}

async fn job_loop(kind: JobKind, ctx: Arc<Context>, cancel: CancellationToken, timeout: Duration) {
    let schedule = match Schedule::from_str(kind.cron_expr()) {
        Ok(schedule) => schedule,
        Err(e) => {
            error!(job = kind.name(), error = %e, "invalid cron expression, job disabled");
            return;
        }
    };

    info!(job = kind.name(), cadence = kind.cron_expr(), "job registered");

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            break;
        };
        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {
                match tokio::time::timeout(timeout, kind.run(&ctx)).await {
                    Ok(Ok(outcome)) => {
                        info!(job = kind.name(), %outcome, "job completed");
                    }
                    Ok(Err(e)) => {
                        warn!(job = kind.name(), error = %e, "job failed; next run unaffected");
                    }
                    Err(_) => {
                        warn!(job = kind.name(), "job timed out; next run unaffected");
                    }
                }
            }
        }
    }
}
