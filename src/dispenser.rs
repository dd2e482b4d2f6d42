//! Instance dispenser
//!
//! Admits new apps under the configured limit, drives each instance through
//! its lifecycle, and keeps the name registry and router in step with it.

use crate::config::{Config, DispenserConfig};
use crate::docker::DockerRuntime;
use crate::error::{CreateError, DispenserError};
use crate::names::NameRegistry;
use crate::routing::{RouteTable, RoutingController, SharedRouter};
use crate::runtime::{InstanceId, RuntimeClient, SharedRuntime};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a dispensed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Start requested, waiting for the runtime to report alive
    Pending,
    /// Alive and routed
    Running,
    /// Stopped, resources kept for inspection
    Stopped,
    /// Destroyed. Terminal.
    Killed,
}

impl InstanceState {
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Killed) | (Running, Stopped) | (Running, Killed) | (Stopped, Killed)
        )
    }

    /// Whether the instance still holds its name and a capacity slot
    pub fn is_live(self) -> bool {
        self != InstanceState::Killed
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Pending => write!(f, "pending"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Killed => write!(f, "killed"),
        }
    }
}

/// Snapshot of a dispensed instance
#[derive(Debug, Clone, serde::Serialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub state: InstanceState,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Reason given for the most recent stop or kill
    pub reason: Option<String>,
}

impl Instance {
    fn new(id: InstanceId, name: &str, url: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.to_string(),
            state: InstanceState::Pending,
            url,
            created_at: now,
            updated_at: now,
            reason: None,
        }
    }
}

#[derive(Debug, Default)]
struct InstanceTable {
    instances: HashMap<InstanceId, Instance>,
    /// Admitted creations whose runtime start has not returned yet
    starting: usize,
}

impl InstanceTable {
    fn live_count(&self) -> usize {
        self.starting + self.instances.values().filter(|i| i.state.is_live()).count()
    }
}

/// Dispenses app instances.
///
/// `InstanceDispenser` is meant to be shared between request handlers, so
/// [`new`](InstanceDispenser::new) returns `Arc<Self>`.
///
/// Locks guard only in-memory bookkeeping. Runtime and router calls are made
/// with no lock held, and every runtime call is bounded by
/// `runtime_timeout_secs`.
pub struct InstanceDispenser {
    config: DispenserConfig,
    runtime: SharedRuntime,
    router: SharedRouter,
    names: NameRegistry,
    table: Mutex<InstanceTable>,
}

impl InstanceDispenser {
    /// Create a dispenser, failing if the runtime does not answer a ping
    pub async fn new(
        config: DispenserConfig,
        runtime: SharedRuntime,
        router: SharedRouter,
    ) -> Result<Arc<Self>, DispenserError> {
        match tokio::time::timeout(config.runtime_timeout(), runtime.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Cannot contact container runtime");
                return Err(DispenserError::RuntimeClientUnreachable(e));
            }
            Err(_) => {
                error!(
                    timeout_secs = config.runtime_timeout_secs,
                    "Container runtime ping timed out"
                );
                return Err(DispenserError::RuntimeClientUnreachable(anyhow::anyhow!(
                    "ping timed out after {}s",
                    config.runtime_timeout_secs
                )));
            }
        }

        match config.limit() {
            Some(0) => info!("App limit is 0, app creation is disabled"),
            Some(limit) => info!(limit, domain = %config.domain, "Dispenser ready"),
            None => info!(domain = %config.domain, "Dispenser ready with no app limit"),
        }

        Ok(Arc::new(Self {
            config,
            runtime,
            router,
            names: NameRegistry::new(),
            table: Mutex::new(InstanceTable::default()),
        }))
    }

    /// Create a dispenser backed by Docker and an in-memory route table
    ///
    /// The returned [`RouteTable`] is what a proxy front end resolves request
    /// hosts against.
    pub async fn with_docker(config: Config) -> Result<(Arc<Self>, Arc<RouteTable>), DispenserError> {
        let runtime = DockerRuntime::connect(config.dispenser.docker_host.as_deref(), config.container)
            .await
            .map_err(|e| {
                error!(error = %e, "Cannot contact Docker daemon, check the docker service");
                DispenserError::RuntimeClientUnreachable(e)
            })?;
        let routes = Arc::new(RouteTable::new(config.dispenser.domain.clone()));
        let dispenser = Self::new(config.dispenser, Arc::new(runtime), routes.clone()).await?;
        Ok((dispenser, routes))
    }

    pub fn config(&self) -> &DispenserConfig {
        &self.config
    }

    /// Create and start an app, returning its URL once it is alive and routed
    ///
    /// Dropping the returned future gives the admission back: a creation
    /// cancelled before the runtime answered frees its slot and name, and one
    /// cancelled after that is moved to Killed and torn down in the background.
    pub async fn create_instance(&self, name: &str) -> Result<String, CreateError> {
        let mut admission = self.admit(name)?;

        let started = self.with_timeout(self.runtime.start(name)).await;
        let id = match started {
            Some(Ok(id)) => id,
            Some(Err(e)) => return Err(start_failed(name, e)),
            None => {
                let e = anyhow::anyhow!(
                    "runtime start timed out after {}s",
                    self.config.runtime_timeout_secs
                );
                return Err(start_failed(name, e));
            }
        };

        let url = self.config.url_for(name);
        admission.record_pending(&id, &url)?;
        debug!(name, instance_id = %id.short(), "Instance pending, waiting for it to come alive");

        if !self.wait_until_alive(&id).await {
            warn!(name, instance_id = %id.short(), "Instance did not come alive");
            self.discard(&id).await;
            admission.complete();
            return Err(CreateError::RuntimeNotAlive {
                name: name.to_string(),
                id,
            });
        }

        if self.transition(&id, InstanceState::Running, None).is_none() {
            // Killed by someone else while we were polling
            admission.complete();
            return Err(CreateError::RuntimeNotAlive {
                name: name.to_string(),
                id,
            });
        }

        self.router.route(name, &id).await;
        admission.complete();

        if self.state_of(&id) != Some(InstanceState::Running) {
            // Stopped or killed while the route was going in
            self.router.unroute(name, &id).await;
            return Err(CreateError::RuntimeNotAlive {
                name: name.to_string(),
                id,
            });
        }

        info!(name, instance_id = %id.short(), url, "App started");
        Ok(url)
    }

    /// Kill an instance and free its name
    ///
    /// Returns false if the instance is unknown, already killed, or still
    /// alive after the kill request. A false return leaves state unchanged
    /// and the call may be retried.
    pub async fn kill_instance(&self, id: &InstanceId, reason: Option<&str>) -> bool {
        match self.state_of(id) {
            None => {
                debug!(instance_id = %id.short(), "Kill requested for unknown instance");
                return false;
            }
            Some(InstanceState::Killed) => return false,
            Some(_) => {}
        }

        match self.with_timeout(self.runtime.kill(id)).await {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!(instance_id = %id.short(), error = %e, "Runtime kill failed");
                return false;
            }
            None => {
                warn!(instance_id = %id.short(), "Runtime kill timed out");
                return false;
            }
        }

        if !self.confirm_gone(id, "kill").await {
            return false;
        }

        let Some(killed) = self.transition(id, InstanceState::Killed, reason) else {
            return false;
        };
        self.names.release(&killed.name);
        self.router.unroute(&killed.name, id).await;

        info!(name = %killed.name, instance_id = %id.short(), reason, "App killed");
        true
    }

    /// Stop a running instance, keeping its name and resources
    ///
    /// Returns false if the instance is unknown, not running, or did not stop.
    pub async fn stop_instance(&self, id: &InstanceId, reason: Option<&str>) -> bool {
        if self.state_of(id) != Some(InstanceState::Running) {
            debug!(instance_id = %id.short(), "Stop requested for instance that is not running");
            return false;
        }

        match self.with_timeout(self.runtime.stop(id)).await {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!(instance_id = %id.short(), error = %e, "Runtime stop failed");
                return false;
            }
            None => {
                warn!(instance_id = %id.short(), "Runtime stop timed out");
                return false;
            }
        }

        if !self.confirm_gone(id, "stop").await {
            return false;
        }

        let Some(stopped) = self.transition(id, InstanceState::Stopped, reason) else {
            return false;
        };
        self.router.unroute(&stopped.name, id).await;

        info!(name = %stopped.name, instance_id = %id.short(), reason, "App stopped");
        true
    }

    /// Kill every live instance, returning how many were killed
    pub async fn shutdown(&self, reason: Option<&str>) -> usize {
        let ids: Vec<InstanceId> = {
            let table = self.table.lock();
            table
                .instances
                .values()
                .filter(|i| i.state.is_live())
                .map(|i| i.id.clone())
                .collect()
        };

        info!(count = ids.len(), "Shutting down all apps");
        let results =
            futures::future::join_all(ids.iter().map(|id| self.kill_instance(id, reason))).await;
        results.into_iter().filter(|killed| *killed).count()
    }

    pub fn get(&self, id: &InstanceId) -> Option<Instance> {
        self.table.lock().instances.get(id).cloned()
    }

    /// Live instance currently holding a name
    pub fn find_by_name(&self, name: &str) -> Option<Instance> {
        self.table
            .lock()
            .instances
            .values()
            .find(|i| i.state.is_live() && i.name == name)
            .cloned()
    }

    /// All known instances, oldest first
    pub fn list(&self) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self.table.lock().instances.values().cloned().collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        instances
    }

    /// Number of instances counting against the app limit
    pub fn live_count(&self) -> usize {
        self.table.lock().live_count()
    }

    /// Free slots under the app limit, or `None` when unlimited
    pub fn remaining_capacity(&self) -> Option<usize> {
        let limit = self.config.limit()?;
        Some(limit.saturating_sub(self.live_count()))
    }

    /// Forget killed instances, returning how many were dropped
    pub fn prune_killed(&self) -> usize {
        let mut table = self.table.lock();
        let before = table.instances.len();
        table.instances.retain(|_, i| i.state.is_live());
        before - table.instances.len()
    }

    /// Capacity check, validation and reservation as one step
    fn admit<'a>(&'a self, name: &'a str) -> Result<Admission<'a>, CreateError> {
        let mut table = self.table.lock();

        if let Some(limit) = self.config.limit() {
            if table.live_count() >= limit {
                debug!(name, limit, "App limit reached");
                return Err(CreateError::CapacityExceeded { limit });
            }
        }

        if !NameRegistry::validate(name) {
            debug!(name, "App name is not a valid subdomain");
            return Err(CreateError::InvalidName(name.to_string()));
        }

        if self.names.reserve(name).is_err() {
            debug!(name, "App name already taken");
            return Err(CreateError::NameTaken(name.to_string()));
        }

        table.starting += 1;
        Ok(Admission {
            dispenser: self,
            name,
            stage: AdmissionStage::Starting,
        })
    }

    /// Kill the record of a creation whose future was dropped
    ///
    /// Runs from `Drop`, so the runtime teardown is spawned onto the current
    /// tokio runtime, if there is one.
    fn abandon_creation(&self, id: InstanceId) {
        let Some(killed) = self.transition(&id, InstanceState::Killed, Some("creation cancelled")) else {
            return;
        };
        self.names.release(&killed.name);
        warn!(name = %killed.name, instance_id = %id.short(), "App creation cancelled");

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        let router = Arc::clone(&self.router);
        let timeout = self.config.runtime_timeout();
        handle.spawn(async move {
            match tokio::time::timeout(timeout, runtime.kill(&id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(instance_id = %id.short(), error = %e, "Failed to clean up cancelled instance")
                }
                Err(_) => warn!(instance_id = %id.short(), "Timed out cleaning up cancelled instance"),
            }
            router.unroute(&killed.name, &id).await;
        });
    }

    /// Best-effort teardown of an instance that never came alive
    async fn discard(&self, id: &InstanceId) {
        match self.with_timeout(self.runtime.kill(id)).await {
            Some(Ok(())) => {}
            Some(Err(e)) => warn!(instance_id = %id.short(), error = %e, "Failed to clean up instance"),
            None => warn!(instance_id = %id.short(), "Timed out cleaning up instance"),
        }

        if let Some(killed) = self.transition(id, InstanceState::Killed, Some("did not come alive")) {
            self.names.release(&killed.name);
        }
    }

    async fn wait_until_alive(&self, id: &InstanceId) -> bool {
        let deadline = Instant::now() + self.config.startup_timeout();

        loop {
            if self.state_of(id) != Some(InstanceState::Pending) {
                return false;
            }
            if self.check_alive(id).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.liveness_poll_interval()).await;
        }
    }

    /// Whether the runtime reports the instance gone after a stop or kill
    ///
    /// A liveness check that times out counts as not confirmed.
    async fn confirm_gone(&self, id: &InstanceId, action: &str) -> bool {
        match self.with_timeout(self.runtime.is_alive(id)).await {
            Some(false) => true,
            Some(true) => {
                warn!(instance_id = %id.short(), "Instance still alive after {}", action);
                false
            }
            None => {
                warn!(instance_id = %id.short(), "Liveness check after {} timed out", action);
                false
            }
        }
    }

    async fn check_alive(&self, id: &InstanceId) -> bool {
        self.with_timeout(self.runtime.is_alive(id))
            .await
            .unwrap_or_else(|| {
                warn!(instance_id = %id.short(), "Liveness check timed out");
                false
            })
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::time::timeout(self.config.runtime_timeout(), fut)
            .await
            .ok()
    }

    fn state_of(&self, id: &InstanceId) -> Option<InstanceState> {
        self.table.lock().instances.get(id).map(|i| i.state)
    }

    /// Move an instance to `next` if its current state allows it
    fn transition(
        &self,
        id: &InstanceId,
        next: InstanceState,
        reason: Option<&str>,
    ) -> Option<Instance> {
        let mut table = self.table.lock();
        let instance = table.instances.get_mut(id)?;

        if !instance.state.can_transition_to(next) {
            debug!(
                instance_id = %id.short(),
                from = %instance.state,
                to = %next,
                "Rejected state transition"
            );
            return None;
        }

        debug!(instance_id = %id.short(), from = %instance.state, to = %next, "State transition");
        instance.state = next;
        instance.updated_at = Utc::now();
        if reason.is_some() {
            instance.reason = reason.map(str::to_string);
        }
        Some(instance.clone())
    }
}

fn start_failed(name: &str, source: anyhow::Error) -> CreateError {
    warn!(name, error = %source, "Failed to start app");
    CreateError::RuntimeStartFailed {
        name: name.to_string(),
        source,
    }
}

enum AdmissionStage {
    /// Counted in `InstanceTable::starting`, no record yet
    Starting,
    /// Recorded in the table, not yet routed
    Recorded(InstanceId),
    Done,
}

/// A slot and name held by an in-flight `create_instance`
///
/// Whatever stage the creation reached is undone on drop unless it was
/// marked complete.
struct Admission<'a> {
    dispenser: &'a InstanceDispenser,
    name: &'a str,
    stage: AdmissionStage,
}

impl Admission<'_> {
    /// Swap the in-flight slot for a Pending record, under one lock
    fn record_pending(&mut self, id: &InstanceId, url: &str) -> Result<(), CreateError> {
        {
            let mut table = self.dispenser.table.lock();
            if let Entry::Vacant(slot) = table.instances.entry(id.clone()) {
                slot.insert(Instance::new(id.clone(), self.name, url.to_string()));
                table.starting -= 1;
                self.stage = AdmissionStage::Recorded(id.clone());
                return Ok(());
            }
        }

        Err(start_failed(
            self.name,
            anyhow::anyhow!("runtime returned instance id {} which is already tracked", id),
        ))
    }

    fn complete(&mut self) {
        self.stage = AdmissionStage::Done;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.stage, AdmissionStage::Done) {
            AdmissionStage::Starting => {
                let mut table = self.dispenser.table.lock();
                table.starting -= 1;
                self.dispenser.names.release(self.name);
                debug!(name = self.name, "Admission given back");
            }
            AdmissionStage::Recorded(id) => self.dispenser.abandon_creation(id),
            AdmissionStage::Done => {}
        }
    }
}
