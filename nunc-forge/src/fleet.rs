//! Fleet manager: periodic reconciliation and eviction.
//!
//! Every tick the manager:
//! - Lists instances from the provider and runners from GitHub
//! - Evicts dead runners, runners stuck on a job, and idle runners close to
//!   their next billing boundary
//! - Deletes every instance and every registered runner that has no fleet entry
//!
//! Eviction only removes the fleet entry. The orphan sweep in the same pass
//! deletes what is left behind on the provider and on GitHub.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::github::RunnerRegistry;
use crate::provider::InstanceProvider;
use crate::runner_state::{Runner, RunnerStatus, RunnerStore};

/// Thresholds for evicting runners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// A working runner whose job began longer ago than this is stuck
    pub stuck_job_timeout: chrono::Duration,
    /// Provider billing increment, counted from instance creation
    pub billing_period: chrono::Duration,
    /// Idle runners closer than this to the next boundary are evicted
    pub idle_eviction_margin: chrono::Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            stuck_job_timeout: chrono::Duration::minutes(55),
            billing_period: chrono::Duration::minutes(60),
            idle_eviction_margin: chrono::Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Reset failed after its last job
    Dead,
    /// Working for longer than the stuck job timeout
    StuckJob,
    /// Idle and about to be billed for another period
    BillingBoundary,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionReason::Dead => write!(f, "dead"),
            EvictionReason::StuckJob => write!(f, "stuck job"),
            EvictionReason::BillingBoundary => write!(f, "approaching billing boundary"),
        }
    }
}

/// First `created_at + k * period` (k >= 1) strictly after `now`.
pub fn next_billing_boundary(
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    period: chrono::Duration,
) -> DateTime<Utc> {
    let period_ms = period.num_milliseconds().max(1);
    let elapsed_ms = (now - created_at).num_milliseconds().max(0);
    let periods = elapsed_ms / period_ms + 1;
    created_at + chrono::Duration::milliseconds(period_ms * periods)
}

/// Decide whether a runner should leave the fleet.
pub fn eviction_reason(
    runner: &Runner,
    now: DateTime<Utc>,
    policy: &EvictionPolicy,
) -> Option<EvictionReason> {
    match runner.status {
        RunnerStatus::Dead => Some(EvictionReason::Dead),
        RunnerStatus::Working => {
            (now - runner.last_job_began_at > policy.stuck_job_timeout)
                .then_some(EvictionReason::StuckJob)
        }
        RunnerStatus::Idle => {
            let boundary = next_billing_boundary(runner.created_at, now, policy.billing_period);
            (boundary - now < policy.idle_eviction_margin)
                .then_some(EvictionReason::BillingBoundary)
        }
    }
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub evicted: Vec<(String, EvictionReason)>,
    pub deleted_instances: Vec<String>,
    pub deleted_runners: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.deleted_instances.is_empty() && self.deleted_runners.is_empty()
    }
}

/// Reconciles the fleet against the provider and GitHub on a fixed interval.
pub struct FleetManager {
    store: Arc<RunnerStore>,
    provider: Arc<dyn InstanceProvider>,
    registry: Arc<dyn RunnerRegistry>,
    policy: EvictionPolicy,
    interval: Duration,
}

impl FleetManager {
    pub fn new(
        store: Arc<RunnerStore>,
        provider: Arc<dyn InstanceProvider>,
        registry: Arc<dyn RunnerRegistry>,
        policy: EvictionPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            registry,
            policy,
            interval,
        }
    }

    /// Start the fleet manager loop.
    ///
    /// Runs forever. The first pass happens immediately; a failed pass is
    /// logged and the next tick tries again.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Fleet manager started, reconciling every {:?}", self.interval);

        loop {
            ticker.tick().await;
            match self.reconcile_once().await {
                Ok(report) if report.is_empty() => debug!("Fleet is consistent"),
                Ok(report) => info!(
                    "Reconciled fleet: evicted {:?}, deleted instances {:?}, deleted runners {:?}",
                    report.evicted, report.deleted_instances, report.deleted_runners
                ),
                Err(e) => error!("Reconciliation failed: {:#}", e),
            }
        }
    }

    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        self.reconcile_at(Utc::now()).await
    }

    /// One reconciliation pass as of `now`.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let instances = self
            .provider
            .list_instances()
            .await
            .context("Failed to list instances")?;
        let registered = self
            .registry
            .list_runners()
            .await
            .context("Failed to list registered runners")?;

        let mut fleet = self.store.lock().await;
        let mut report = ReconcileReport::default();

        for runner in fleet.iter() {
            debug!(
                "Checking runner {} ({}, {})",
                runner.id, runner.architecture, runner.status
            );
            if let Some(reason) = eviction_reason(runner, now, &self.policy) {
                report.evicted.push((runner.id.clone(), reason));
            }
        }
        report.evicted.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, reason) in &report.evicted {
            info!("Evicting runner {}: {}", id, reason);
            fleet.remove(id);
        }
        debug!(
            "{} runner(s) kept, checking {} instance(s) and {} registration(s)",
            fleet.len(),
            instances.len(),
            registered.len()
        );

        for instance in instances {
            if fleet.contains(&instance.name) {
                continue;
            }
            info!("Deleting orphaned instance {}", instance.name);
            self.provider
                .delete_instance(&instance)
                .await
                .with_context(|| format!("Failed to delete instance {}", instance.name))?;
            report.deleted_instances.push(instance.name);
        }

        for runner in registered {
            if fleet.contains(&runner.name) {
                continue;
            }
            info!("Deleting orphaned runner {} (id {})", runner.name, runner.id);
            self.registry
                .delete_runner(runner.id)
                .await
                .with_context(|| format!("Failed to delete runner {}", runner.name))?;
            report.deleted_runners.push(runner.name);
        }

        Ok(report)
    }
}
