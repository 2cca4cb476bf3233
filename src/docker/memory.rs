// In-memory provider
// Records every operation and enforces runtime rules (networks in use cannot
// be removed, names are unique) so orchestration can be tested without Docker.

use crate::docker::provider::{
    ContainerHandle, ExecOutput, InfrastructureProvider, NetworkHandle,
};
use crate::errors::{Result, TbError};
use crate::launcher::ContainerSpec;
use crate::naming::ResourceName;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct MemContainer {
    network: String,
    running: bool,
}

#[derive(Default)]
struct State {
    networks: BTreeMap<String, String>,
    images: BTreeSet<String>,
    containers: BTreeMap<String, MemContainer>,
    operations: Vec<String>,
    build_counts: HashMap<String, usize>,
    probe_counts: HashMap<String, usize>,
    failing_builds: HashSet<String>,
    failing_runs: HashSet<String>,
    failing_removals: HashSet<String>,
    never_ready: HashSet<String>,
    ready_after: HashMap<String, usize>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    latency: Mutex<Duration>,
    next_id: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Recording provider with fault injection
///
/// Faults are keyed by role, the resource name minus its environment id, so
/// tests can target "tmptaskservice" in every environment without knowing ids.
#[derive(Clone, Default)]
pub struct InMemoryProvider {
    inner: Arc<Inner>,
}

/// Strip the 32-character hex environment id from a resource name
pub fn role_of(name: &str) -> &str {
    if name.len() > 32 {
        let (role, suffix) = name.split_at(name.len() - 32);
        if suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            return role;
        }
    }
    name
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every container start and image build
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Pretend `image` already exists in the store
    pub fn seed_image(&self, image: &str) {
        self.inner.state.lock().images.insert(image.to_string());
    }

    pub fn fail_build(&self, image: &str) {
        self.inner
            .state
            .lock()
            .failing_builds
            .insert(image.to_string());
    }

    pub fn fail_run(&self, role: &str) {
        self.inner.state.lock().failing_runs.insert(role.to_string());
    }

    pub fn fail_removal(&self, role: &str) {
        self.inner
            .state
            .lock()
            .failing_removals
            .insert(role.to_string());
    }

    /// Clear a removal fault so a later teardown can succeed
    pub fn allow_removal(&self, role: &str) {
        self.inner.state.lock().failing_removals.remove(role);
    }

    /// Every readiness check against containers of `role` fails
    pub fn never_ready(&self, role: &str) {
        self.inner.state.lock().never_ready.insert(role.to_string());
    }

    /// The first `attempts` readiness checks against `role` fail
    pub fn ready_after(&self, role: &str, attempts: usize) {
        self.inner
            .state
            .lock()
            .ready_after
            .insert(role.to_string(), attempts);
    }

    /// Recorded operations, in call order
    pub fn operations(&self) -> Vec<String> {
        self.inner.state.lock().operations.clone()
    }

    pub fn build_count(&self, image: &str) -> usize {
        self.inner
            .state
            .lock()
            .build_counts
            .get(image)
            .copied()
            .unwrap_or(0)
    }

    pub fn probe_count(&self, role: &str) -> usize {
        self.inner
            .state
            .lock()
            .probe_counts
            .get(role)
            .copied()
            .unwrap_or(0)
    }

    /// Names of containers that exist (running or stopped)
    pub fn containers(&self) -> Vec<String> {
        self.inner.state.lock().containers.keys().cloned().collect()
    }

    pub fn running_containers(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| c.running)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.inner.state.lock().networks.keys().cloned().collect()
    }

    pub fn images(&self) -> Vec<String> {
        self.inner.state.lock().images.iter().cloned().collect()
    }

    /// Highest number of container starts or builds observed at once
    pub fn peak_concurrency(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, entry: impl Into<String>) {
        self.inner.state.lock().operations.push(entry.into());
    }

    fn next_id(&self, prefix: &str) -> String {
        let idx = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", prefix, idx)
    }

    /// Mark one slow operation as in flight for its simulated duration
    async fn simulate_work(&self) {
        let current = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .peak_in_flight
            .fetch_max(current, Ordering::SeqCst);

        let latency = *self.inner.latency.lock();
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }

        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Decide whether the next readiness check against `name` passes
    fn observe_readiness(&self, name: &str) -> Result<bool> {
        let role = role_of(name).to_string();
        let mut state = self.inner.state.lock();

        match state.containers.get(name) {
            Some(container) if container.running => {}
            Some(_) => return Ok(false),
            None => return Err(TbError::NotFound(format!("container '{}'", name))),
        }

        let count = state.probe_counts.entry(role.clone()).or_insert(0);
        *count += 1;
        let attempt = *count;

        if state.never_ready.contains(&role) {
            return Ok(false);
        }

        Ok(match state.ready_after.get(&role) {
            Some(&needed) => attempt > needed,
            None => true,
        })
    }
}

#[async_trait]
impl InfrastructureProvider for InMemoryProvider {
    async fn create_network(&self, name: &ResourceName) -> Result<NetworkHandle> {
        self.record(format!("network:create:{}", name));
        let id = self.next_id("net");

        let mut state = self.inner.state.lock();
        if state.networks.contains_key(name.as_str()) {
            return Err(TbError::NameConflict(name.to_string()));
        }
        state.networks.insert(name.to_string(), id.clone());

        Ok(NetworkHandle {
            name: name.clone(),
            id,
        })
    }

    async fn remove_network(&self, name: &ResourceName) -> Result<()> {
        self.record(format!("network:remove:{}", name));

        let mut state = self.inner.state.lock();
        if !state.networks.contains_key(name.as_str()) {
            return Err(TbError::NotFound(format!("network '{}'", name)));
        }
        if state
            .containers
            .values()
            .any(|c| c.network == name.as_str())
        {
            return Err(TbError::ProviderError(format!(
                "network '{}' has active endpoints",
                name
            )));
        }
        state.networks.remove(name.as_str());
        Ok(())
    }

    async fn image_exists(&self, name: &str) -> Result<bool> {
        self.record(format!("image:exists:{}", name));
        Ok(self.inner.state.lock().images.contains(name))
    }

    async fn build_image(&self, name: &str, _context_dir: &Path, _descriptor: &str) -> Result<()> {
        self.record(format!("image:build:{}", name));
        self.simulate_work().await;

        let mut state = self.inner.state.lock();
        *state.build_counts.entry(name.to_string()).or_insert(0) += 1;

        if state.failing_builds.contains(name) {
            return Err(TbError::BuildFailure {
                image: name.to_string(),
                reason: "injected build failure".to_string(),
            });
        }

        state.images.insert(name.to_string());
        Ok(())
    }

    async fn remove_image(&self, name: &str) -> Result<()> {
        self.record(format!("image:remove:{}", name));
        if self.inner.state.lock().images.remove(name) {
            Ok(())
        } else {
            Err(TbError::NotFound(format!("image '{}'", name)))
        }
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.record(format!("container:run:{}", spec.name));
        self.simulate_work().await;

        let mut state = self.inner.state.lock();
        if !state.networks.contains_key(spec.network.as_str()) {
            return Err(TbError::NotFound(format!("network '{}'", spec.network)));
        }
        if state.containers.contains_key(spec.name.as_str()) {
            return Err(TbError::NameConflict(spec.name.to_string()));
        }

        // Like `docker run`, a failed start still leaves a created container
        let running = !state.failing_runs.contains(role_of(spec.name.as_str()));
        state.containers.insert(
            spec.name.to_string(),
            MemContainer {
                network: spec.network.to_string(),
                running,
            },
        );
        if !running {
            return Err(TbError::ProviderError(format!(
                "container '{}' exited on start",
                spec.name
            )));
        }
        drop(state);

        Ok(ContainerHandle {
            name: spec.name.clone(),
            id: self.next_id("ctr"),
            image: spec.image.clone(),
            network: spec.network.clone(),
            port: spec.port,
            started_at: Utc::now(),
        })
    }

    async fn is_running(&self, name: &ResourceName) -> Result<bool> {
        self.inner
            .state
            .lock()
            .containers
            .get(name.as_str())
            .map(|c| c.running)
            .ok_or_else(|| TbError::NotFound(format!("container '{}'", name)))
    }

    async fn stop_container(&self, name: &ResourceName) -> Result<()> {
        self.record(format!("container:stop:{}", name));
        let mut state = self.inner.state.lock();
        match state.containers.get_mut(name.as_str()) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(TbError::NotFound(format!("container '{}'", name))),
        }
    }

    async fn remove_container(&self, name: &ResourceName) -> Result<()> {
        self.record(format!("container:remove:{}", name));
        let mut state = self.inner.state.lock();

        if state.failing_removals.contains(role_of(name.as_str())) {
            return Err(TbError::ProviderError(format!(
                "container '{}' could not be removed",
                name
            )));
        }

        state
            .containers
            .remove(name.as_str())
            .map(|_| ())
            .ok_or_else(|| TbError::NotFound(format!("container '{}'", name)))
    }

    async fn exec(&self, name: &ResourceName, command: &[String]) -> Result<ExecOutput> {
        let ready = self.observe_readiness(name.as_str())?;
        Ok(ExecOutput {
            exit_code: if ready { 0 } else { 1 },
            output: if ready {
                String::new()
            } else {
                format!("{}: no response", command.join(" "))
            },
        })
    }

    async fn check_port(&self, container: &ContainerHandle, _container_port: u16) -> Result<bool> {
        self.observe_readiness(container.name.as_str())
    }

    async fn check_http(
        &self,
        container: &ContainerHandle,
        _container_port: u16,
        _path: &str,
    ) -> Result<u16> {
        let ready = self.observe_readiness(container.name.as_str())?;
        Ok(if ready { 200 } else { 503 })
    }
}
