//! Firing the job at cron instants.
//!
//! One trigger task per job instance cycles through `Idle → Armed →
//! Firing`. While armed it sleeps until the next cron instant, or until it
//! is preempted by a configuration reload, a health change, shutdown, an
//! on-demand nudge (manual trigger or failover claim), or a make-up
//! request for shards flagged `misfire`. A pass is awaited before the
//! trigger re-arms, so passes never overlap.
//!
//! Misfire: if the instant after the one just fired is already in the past
//! when the pass returns, ticks were missed. With `misfire` the executed
//! shards are flagged and exactly one make-up pass runs; without it the
//! missed ticks are dropped. Either way the trigger re-arms from the
//! current time. Shards skipped because they were still running elsewhere
//! are made up once the dispatcher sees that run end.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config_store::ConfigSnapshot;
use crate::error::SchedulerError;
use crate::executor::{ExecutionReport, JobExecutor};
use crate::health::HealthState;
use crate::job::ExecutionSource;
use crate::schedule::CronSchedule;

/// Where the trigger is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Idle,
    Armed,
    Firing,
}

enum Wake {
    Scheduled(DateTime<Utc>),
    OnDemand,
    Makeup,
    Rearm,
    Stop,
}

/// The per-job timer.
pub struct CronTrigger {
    config: Arc<ConfigSnapshot>,
    executor: Arc<JobExecutor>,
    health: watch::Receiver<HealthState>,
    nudge: Arc<Notify>,
    makeup: Arc<Notify>,
    state: watch::Sender<TriggerState>,
    reports: watch::Sender<Option<ExecutionReport>>,
}

impl CronTrigger {
    pub fn new(
        config: Arc<ConfigSnapshot>,
        executor: Arc<JobExecutor>,
        health: watch::Receiver<HealthState>,
        nudge: Arc<Notify>,
        makeup: Arc<Notify>,
    ) -> Self {
        let (state, _) = watch::channel(TriggerState::Idle);
        let (reports, _) = watch::channel(None);
        Self {
            config,
            executor,
            health,
            nudge,
            makeup,
            state,
            reports,
        }
    }

    pub fn state(&self) -> watch::Receiver<TriggerState> {
        self.state.subscribe()
    }

    /// Report of the most recent pass.
    pub fn reports(&self) -> watch::Receiver<Option<ExecutionReport>> {
        self.reports.subscribe()
    }

    /// Run until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut versions = self.config.subscribe();
        info!(cron = self.config.load().cron().unwrap_or("<on demand>"), "Starting trigger");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if *self.health.borrow() != HealthState::Running {
                self.state.send_replace(TriggerState::Idle);
                tokio::select! {
                    changed = self.health.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            let config = self.config.load();
            let schedule = config.schedule();
            let next = schedule.as_ref().and_then(|s| s.next_after(Utc::now()));
            self.state.send_replace(TriggerState::Armed);
            if let Some(next) = next {
                debug!(next = %next, "Trigger armed");
            }

            let wake = tokio::select! {
                _ = sleep_until(next) => match next {
                    Some(next) => Wake::Scheduled(next),
                    None => Wake::Rearm,
                },
                _ = self.nudge.notified() => Wake::OnDemand,
                _ = self.makeup.notified() => Wake::Makeup,
                changed = versions.changed() => {
                    if changed.is_err() { Wake::Stop } else { Wake::Rearm }
                }
                changed = self.health.changed() => {
                    if changed.is_err() { Wake::Stop } else { Wake::Rearm }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() { Wake::Stop } else { Wake::Rearm }
                }
            };

            match wake {
                Wake::Stop => break,
                Wake::Rearm => continue,
                Wake::OnDemand => {
                    self.state.send_replace(TriggerState::Firing);
                    self.pass(ExecutionSource::Ready).await;
                }
                Wake::Makeup => {
                    self.state.send_replace(TriggerState::Firing);
                    debug!("Running make-up pass for misfired shards");
                    self.pass(ExecutionSource::Misfire).await;
                }
                Wake::Scheduled(fired_at) => {
                    self.state.send_replace(TriggerState::Firing);
                    let report = self.pass(ExecutionSource::Ready).await;
                    if let Some(schedule) = &schedule {
                        self.handle_misfire(schedule, fired_at, report).await;
                    }
                }
            }
            self.state.send_replace(TriggerState::Idle);
        }

        self.state.send_replace(TriggerState::Idle);
        info!("Trigger stopped");
    }

    async fn pass(&self, source: ExecutionSource) -> Option<ExecutionReport> {
        match self.executor.run_pass(source).await {
            Ok(report) => {
                self.reports.send_replace(Some(report.clone()));
                Some(report)
            }
            Err(SchedulerError::ShuttingDown) => None,
            Err(e) => {
                error!(source = %source, error = %e, "Pass failed");
                None
            }
        }
    }

    async fn handle_misfire(
        &self,
        schedule: &CronSchedule,
        fired_at: DateTime<Utc>,
        report: Option<ExecutionReport>,
    ) {
        let Some(following) = schedule.next_after(fired_at) else {
            return;
        };
        if following > Utc::now() {
            return;
        }

        if !self.config.load().misfire() {
            debug!(missed_since = %following, "Missed ticks discarded");
            return;
        }

        warn!(missed_since = %following, "Missed ticks, running one make-up pass");
        if let Some(report) = report {
            if let Err(e) = self.executor.mark_misfired(&report.executed()).await {
                warn!(error = %e, "Failed to flag misfired shards");
            }
        }
        self.pass(ExecutionSource::Misfire).await;
    }
}

async fn sleep_until(at: Option<DateTime<Utc>>) {
    match at {
        Some(at) => {
            let delay = (at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;
        }
        None => std::future::pending().await,
    }
}
