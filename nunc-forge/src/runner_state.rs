//! In-memory runner state.
//!
//! The fleet is the only record of which instances the controller intends to
//! keep. Anything the cloud provider or GitHub reports that is not in here is
//! considered orphaned and gets cleaned up by the fleet manager.
//!
//! All access goes through a single async mutex. Callers hold the guard for
//! the whole read-then-write sequence they perform, including any provider
//! calls that decide the outcome.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::provider::Instance;

/// CPU architecture of a runner. Fixed for the lifetime of the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    /// Label used in `runs-on` and when registering the runner.
    pub fn label(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }

    /// Architecture suffix used by the actions/runner release assets.
    pub fn runner_asset_arch(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "x64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" => Ok(Architecture::Amd64),
            "arm64" => Ok(Architecture::Arm64),
            _ => Err(anyhow!("Unknown architecture: {s}")),
        }
    }
}

/// Lifecycle status of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    /// Claimed by a job; the bootstrap task owns the machine.
    Working,
    /// Reset to the base image and ready for the next job.
    Idle,
    /// Reset failed. Never reused, evicted on the next reconcile.
    Dead,
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerStatus::Working => write!(f, "working"),
            RunnerStatus::Idle => write!(f, "idle"),
            RunnerStatus::Dead => write!(f, "dead"),
        }
    }
}

/// One leased cloud instance.
#[derive(Debug, Clone)]
pub struct Runner {
    /// Fleet id, also the server name and the GitHub runner name
    pub id: String,
    pub architecture: Architecture,
    pub status: RunnerStatus,
    /// When the backing instance was created (billing starts here)
    pub created_at: DateTime<Utc>,
    /// Last transition into `Working`
    pub last_job_began_at: DateTime<Utc>,
    /// Provider handle for the backing instance
    pub instance: Instance,
}

impl Runner {
    /// A freshly provisioned runner, already claimed for a job.
    pub fn new_working(
        id: String,
        architecture: Architecture,
        instance: Instance,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            architecture,
            status: RunnerStatus::Working,
            created_at: now,
            last_job_began_at: now,
            instance,
        }
    }
}

/// The set of runners known to the controller.
///
/// Only reachable through [`RunnerStore::lock`].
#[derive(Debug, Default)]
pub struct Fleet {
    runners: HashMap<String, Runner>,
    /// Next id suffix per architecture. Only ever grows, so evicted ids are
    /// never handed out again.
    next_index: HashMap<Architecture, u64>,
}

impl Fleet {
    /// Claim any idle runner of the given architecture.
    ///
    /// Which runner is picked when several qualify is unspecified.
    pub fn claim_idle(&mut self, architecture: Architecture, now: DateTime<Utc>) -> Option<Runner> {
        let runner = self
            .runners
            .values_mut()
            .find(|r| r.architecture == architecture && r.status == RunnerStatus::Idle)?;

        runner.status = RunnerStatus::Working;
        runner.last_job_began_at = now;
        Some(runner.clone())
    }

    /// Allocate the next runner id for an architecture, e.g. `arm64-3`.
    pub fn allocate_id(&mut self, architecture: Architecture) -> String {
        let index = self.next_index.entry(architecture).or_insert(0);
        let id = format!("{}-{}", architecture, index);
        *index += 1;
        id
    }

    pub fn insert(&mut self, runner: Runner) {
        debug!("Adding runner {} to fleet", runner.id);
        self.runners.insert(runner.id.clone(), runner);
    }

    pub fn remove(&mut self, id: &str) -> Option<Runner> {
        let removed = self.runners.remove(id);
        if removed.is_some() {
            debug!("Removed runner {} from fleet", id);
        }
        removed
    }

    /// Update the status of a runner. Returns false if the runner has already
    /// been evicted.
    pub fn set_status(&mut self, id: &str, status: RunnerStatus) -> bool {
        match self.runners.get_mut(id) {
            Some(runner) => {
                runner.status = status;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Runner> {
        self.runners.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.runners.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Runner> {
        self.runners.values()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

/// Shared handle to the fleet. Lives for the whole process.
#[derive(Debug, Default)]
pub struct RunnerStore {
    fleet: Mutex<Fleet>,
}

impl RunnerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the fleet lock.
    pub async fn lock(&self) -> MutexGuard<'_, Fleet> {
        self.fleet.lock().await
    }

    /// Set a runner's status in its own critical section.
    pub async fn release(&self, id: &str, status: RunnerStatus) -> bool {
        self.lock().await.set_status(id, status)
    }

    /// Copy of all runners, sorted by id.
    pub async fn snapshot(&self) -> Vec<Runner> {
        let fleet = self.lock().await;
        let mut runners: Vec<Runner> = fleet.iter().cloned().collect();
        runners.sort_by(|a, b| a.id.cmp(&b.id));
        runners
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::instance;
    use chrono::Duration;

    fn idle_runner(id: &str, arch: Architecture, now: DateTime<Utc>) -> Runner {
        let mut runner = Runner::new_working(id.to_string(), arch, instance(1, id), now);
        runner.status = RunnerStatus::Idle;
        runner
    }

    #[test]
    fn test_architecture_parsing() {
        assert_eq!("amd64".parse::<Architecture>().unwrap(), Architecture::Amd64);
        assert_eq!("arm64".parse::<Architecture>().unwrap(), Architecture::Arm64);
        assert!("x86".parse::<Architecture>().is_err());
        assert_eq!(Architecture::Amd64.runner_asset_arch(), "x64");
        assert_eq!(Architecture::Arm64.to_string(), "arm64");
    }

    #[test]
    fn test_allocate_id_is_monotonic() {
        let mut fleet = Fleet::default();
        let now = Utc::now();

        let first = fleet.allocate_id(Architecture::Arm64);
        assert_eq!(first, "arm64-0");
        fleet.insert(idle_runner(&first, Architecture::Arm64, now));
        assert_eq!(fleet.len(), 1);

        assert_eq!(fleet.allocate_id(Architecture::Arm64), "arm64-1");
        assert_eq!(fleet.allocate_id(Architecture::Amd64), "amd64-0");

        // Evicting a runner must not free its id
        fleet.remove(&first);
        assert!(fleet.is_empty());
        assert_eq!(fleet.allocate_id(Architecture::Arm64), "arm64-2");
    }

    #[test]
    fn test_claim_idle_matches_architecture() {
        let mut fleet = Fleet::default();
        let earlier = Utc::now() - Duration::minutes(10);
        fleet.insert(idle_runner("amd64-0", Architecture::Amd64, earlier));

        let now = Utc::now();
        assert!(fleet.claim_idle(Architecture::Arm64, now).is_none());

        let claimed = fleet.claim_idle(Architecture::Amd64, now).unwrap();
        assert_eq!(claimed.id, "amd64-0");
        assert_eq!(claimed.status, RunnerStatus::Working);
        assert_eq!(claimed.last_job_began_at, now);
        assert_eq!(claimed.created_at, earlier);

        // Already working, cannot be claimed twice
        assert!(fleet.claim_idle(Architecture::Amd64, now).is_none());
    }

    #[test]
    fn test_dead_runner_is_not_claimed() {
        let mut fleet = Fleet::default();
        let now = Utc::now();
        fleet.insert(idle_runner("arm64-0", Architecture::Arm64, now));
        assert!(fleet.set_status("arm64-0", RunnerStatus::Dead));

        assert!(fleet.claim_idle(Architecture::Arm64, now).is_none());
    }

    #[tokio::test]
    async fn test_release_after_eviction_is_noop() {
        let store = RunnerStore::new();
        let now = Utc::now();
        store
            .lock()
            .await
            .insert(Runner::new_working("amd64-0".into(), Architecture::Amd64, instance(1, "amd64-0"), now));

        assert!(store.release("amd64-0", RunnerStatus::Idle).await);
        store.lock().await.remove("amd64-0");
        assert!(!store.release("amd64-0", RunnerStatus::Idle).await);
        assert!(store.snapshot().await.is_empty());
    }
}
