//! In-memory fakes of the collaborator traits for unit tests.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

use crate::github::{RegisteredRunner, RunnerRegistry};
use crate::provider::{Instance, InstanceProvider};
use crate::ssh::{RemoteExecutor, RemoteSession, ScriptOutcome};

pub fn instance(id: u64, name: &str) -> Instance {
    Instance {
        id,
        name: name.to_string(),
        public_ip: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, (id % 250) as u8 + 1))),
    }
}

#[derive(Default)]
pub struct FakeProvider {
    pub instances: Mutex<Vec<Instance>>,
    pub created: Mutex<Vec<(String, String)>>,
    pub deleted: Mutex<Vec<String>>,
    pub rebuilt: Mutex<Vec<String>>,
    pub fail_create: AtomicBool,
    pub fail_delete: AtomicBool,
    pub fail_rebuild: AtomicBool,
    pub fail_list: AtomicBool,
    /// Simulated latency of `create_instance`
    pub create_delay: Mutex<Option<Duration>>,
    next_id: AtomicU64,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend an instance exists that the controller does not know about.
    pub fn add_instance(&self, name: &str) -> Instance {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1000;
        let instance = instance(id, name);
        self.instances.lock().unwrap().push(instance.clone());
        instance
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .instances
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn created_names(&self) -> Vec<String> {
        self.created.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn rebuild_count(&self) -> usize {
        self.rebuilt.lock().unwrap().len()
    }
}

#[async_trait]
impl InstanceProvider for FakeProvider {
    async fn list_instances(&self) -> Result<Vec<Instance>> {
        if self.fail_list.load(Ordering::SeqCst) {
            bail!("provider unavailable");
        }
        Ok(self.instances.lock().unwrap().clone())
    }

    async fn create_instance(&self, size: &str, name: &str) -> Result<Instance> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            bail!("quota exceeded");
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let instance = instance(id, name);
        self.instances.lock().unwrap().push(instance.clone());
        self.created
            .lock()
            .unwrap()
            .push((name.to_string(), size.to_string()));
        Ok(instance)
    }

    async fn delete_instance(&self, instance: &Instance) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            bail!("delete failed");
        }
        self.instances.lock().unwrap().retain(|i| i.id != instance.id);
        self.deleted.lock().unwrap().push(instance.name.clone());
        Ok(())
    }

    async fn rebuild_instance(&self, instance: &Instance) -> Result<()> {
        self.rebuilt.lock().unwrap().push(instance.name.clone());
        if self.fail_rebuild.load(Ordering::SeqCst) {
            bail!("rebuild failed");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRegistry {
    pub runners: Mutex<Vec<RegisteredRunner>>,
    pub deleted: Mutex<Vec<u64>>,
    pub token_requests: AtomicUsize,
    pub fail_token: AtomicBool,
    pub fail_delete: AtomicBool,
    next_id: AtomicU64,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.runners.lock().unwrap().push(RegisteredRunner {
            id,
            name: name.to_string(),
        });
        id
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .runners
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl RunnerRegistry for FakeRegistry {
    async fn list_runners(&self) -> Result<Vec<RegisteredRunner>> {
        Ok(self.runners.lock().unwrap().clone())
    }

    async fn delete_runner(&self, runner_id: u64) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            bail!("delete failed");
        }
        self.runners.lock().unwrap().retain(|r| r.id != runner_id);
        self.deleted.lock().unwrap().push(runner_id);
        Ok(())
    }

    async fn registration_token(&self) -> Result<String> {
        let n = self.token_requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_token.load(Ordering::SeqCst) {
            bail!("token endpoint unavailable");
        }
        Ok(format!("REGTOKEN{n}"))
    }
}

/// Executor that replays queued outcomes. An empty queue means success.
#[derive(Default)]
pub struct FakeExecutor {
    /// `Err` fails the connect, `Ok` is what the script run reports
    pub outcomes: Mutex<VecDeque<std::result::Result<ScriptOutcome, String>>>,
    pub connects: Mutex<Vec<IpAddr>>,
    pub scripts: Arc<Mutex<Vec<String>>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `attempts` connects fail.
    pub fn always_failing(attempts: usize) -> Self {
        let executor = Self::default();
        for _ in 0..attempts {
            executor.push_connect_failure();
        }
        executor
    }

    pub fn push_connect_failure(&self) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(Err("connection refused".into()));
    }

    pub fn push_exit_status(&self, status: u32) {
        self.outcomes.lock().unwrap().push_back(Ok(ScriptOutcome {
            exit_status: Some(status),
            ..Default::default()
        }));
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn connect(&self, addr: IpAddr) -> Result<Box<dyn RemoteSession>> {
        self.connects.lock().unwrap().push(addr);
        let next = self.outcomes.lock().unwrap().pop_front();
        let outcome = match next {
            Some(Err(message)) => return Err(anyhow!(message)),
            Some(Ok(outcome)) => outcome,
            None => ScriptOutcome {
                exit_status: Some(0),
                ..Default::default()
            },
        };
        Ok(Box::new(FakeSession {
            outcome,
            scripts: self.scripts.clone(),
        }))
    }
}

struct FakeSession {
    outcome: ScriptOutcome,
    scripts: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn run(&mut self, script: &str) -> Result<ScriptOutcome> {
        self.scripts.lock().unwrap().push(script.to_string());
        Ok(self.outcome.clone())
    }
}
