// Environment orchestration
// Builds one isolated environment (network, then one store -> image -> service
// branch per configured service, branches in parallel) and owns its teardown.

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ServiceConfig};
use crate::docker::images::{ImageProvisioner, ImageRef};
use crate::docker::network::NetworkManager;
use crate::docker::ports::PortAllocator;
use crate::docker::provider::{ContainerHandle, InfrastructureProvider, NetworkHandle, PortBinding};
use crate::errors::{Result, TbError};
use crate::launcher::{ContainerLauncher, ContainerSpec};
use crate::naming::{self, EnvironmentId, ResourceName};
use crate::readiness::{PollSettings, ReadinessPolicy};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle of one environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    Unbuilt,
    Building,
    Ready,
    Failed,
    Disposed,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentState::Unbuilt => "unbuilt",
            EnvironmentState::Building => "building",
            EnvironmentState::Ready => "ready",
            EnvironmentState::Failed => "failed",
            EnvironmentState::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

/// Container specs for one service branch, computed before anything starts
#[derive(Debug, Clone)]
pub struct ServicePlan {
    pub service: String,
    pub image: String,
    pub source_dir: std::path::PathBuf,
    pub store: ContainerSpec,
    pub app: ContainerSpec,
}

/// What one completed branch produced
#[derive(Debug, Clone)]
pub struct ServiceBranchResult {
    pub service: String,
    pub store: ContainerHandle,
    pub image: ImageRef,
    pub container: ContainerHandle,
    /// Host port on which the service is reachable
    pub port: u16,
}

/// A fully built environment
#[derive(Debug, Clone)]
pub struct ManagedEnvironment {
    pub id: EnvironmentId,
    pub host: String,
    pub network: NetworkHandle,
    pub services: Vec<ServiceBranchResult>,
}

impl ManagedEnvironment {
    pub fn service(&self, name: &str) -> Option<&ServiceBranchResult> {
        self.services.iter().find(|s| s.service == name)
    }

    /// `(host, port)` on which `service` accepts requests
    pub fn endpoint(&self, service: &str) -> Option<(String, u16)> {
        self.service(service).map(|s| (self.host.clone(), s.port))
    }

    pub fn base_url(&self, service: &str) -> Option<String> {
        self.endpoint(service)
            .map(|(host, port)| format!("http://{}:{}", host, port))
    }
}

/// Builds and tears down one environment
pub struct EnvironmentOrchestrator {
    id: EnvironmentId,
    config: Arc<Config>,
    allocator: Arc<PortAllocator>,
    images: ImageProvisioner,
    networks: NetworkManager,
    launcher: ContainerLauncher,
    state: EnvironmentState,
    /// Recorded before creation, so a build dropped mid-way still owns it
    network: Option<ResourceName>,
    /// Containers in launch order, recorded before each launch and removed
    /// only by teardown
    containers: Mutex<Vec<ResourceName>>,
    environment: Option<ManagedEnvironment>,
}

impl EnvironmentOrchestrator {
    pub fn new(
        config: Arc<Config>,
        provider: Arc<dyn InfrastructureProvider>,
        allocator: Arc<PortAllocator>,
    ) -> Self {
        Self::new_with_clock(config, provider, allocator, Arc::new(SystemClock))
    }

    pub fn new_with_clock(
        config: Arc<Config>,
        provider: Arc<dyn InfrastructureProvider>,
        allocator: Arc<PortAllocator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let images = ImageProvisioner::new(Arc::clone(&provider), &config.build_descriptor);
        Self::with_images(config, provider, allocator, clock, images)
    }

    /// Share one image provisioner across orchestrators so concurrent
    /// environments build each image once
    pub fn with_images(
        config: Arc<Config>,
        provider: Arc<dyn InfrastructureProvider>,
        allocator: Arc<PortAllocator>,
        clock: Arc<dyn Clock>,
        images: ImageProvisioner,
    ) -> Self {
        Self {
            id: EnvironmentId::new(),
            networks: NetworkManager::new(Arc::clone(&provider)),
            launcher: ContainerLauncher::new_with_clock(provider, clock),
            images,
            config,
            allocator,
            state: EnvironmentState::Unbuilt,
            network: None,
            containers: Mutex::new(Vec::new()),
            environment: None,
        }
    }

    pub fn id(&self) -> EnvironmentId {
        self.id
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    /// The built environment, present only in `Ready`
    pub fn environment(&self) -> Option<&ManagedEnvironment> {
        self.environment.as_ref()
    }

    pub fn network_name(&self) -> ResourceName {
        ResourceName::derive(&self.config.network_role, &self.id)
    }

    pub fn store_name(&self, service: &str) -> ResourceName {
        ResourceName::derive(&naming::store_role(service), &self.id)
    }

    pub fn service_name(&self, service: &str) -> ResourceName {
        ResourceName::derive(&naming::service_role(service), &self.id)
    }

    /// Names of every resource this orchestrator still has to remove
    pub fn live_resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.lock().iter().map(|c| c.to_string()).collect();
        if let Some(network) = &self.network {
            names.push(network.to_string());
        }
        names
    }

    /// Compute container specs for `service` with the given host ports
    pub fn plan_service(&self, service: &ServiceConfig, store_port: u16, app_port: u16) -> ServicePlan {
        let db = &self.config.database;
        let keys = &self.config.env_keys;
        let network = self.network_name();
        let store_name = self.store_name(&service.name);
        let poll = PollSettings::from(&self.config.readiness);

        let mut store_env = BTreeMap::new();
        store_env.insert("POSTGRES_USER".to_string(), db.user.clone());
        store_env.insert("POSTGRES_PASSWORD".to_string(), db.password.clone());
        store_env.insert("POSTGRES_DB".to_string(), store_name.to_string());

        let store = ContainerSpec {
            name: store_name.clone(),
            image: db.image.clone(),
            network: network.clone(),
            port: PortBinding {
                host: store_port,
                container: db.port,
            },
            env: store_env,
            depends_on: None,
            readiness: ReadinessPolicy::Command(vec![
                "pg_isready".to_string(),
                "-U".to_string(),
                db.user.clone(),
                "-d".to_string(),
                store_name.to_string(),
            ]),
            poll,
        };

        let mut app_env = BTreeMap::new();
        app_env.insert(keys.environment.clone(), self.config.aspnet_environment.clone());
        app_env.insert(
            keys.default_connection.clone(),
            format!(
                "Host={name};Port={port};Database={name};Username={user};Password={password}",
                name = store_name,
                port = db.port,
                user = db.user,
                password = db.password,
            ),
        );
        if service.database_init {
            app_env.insert(keys.database_init.clone(), "true".to_string());
        }
        // Links are static names; the linked service may still be starting
        for link in &service.links {
            if let Some(linked) = self.config.service(link) {
                app_env.insert(
                    linked.link_key(&keys.link_prefix),
                    format!(
                        "http://{}:{}",
                        self.service_name(&linked.name),
                        self.config.service_port
                    ),
                );
            }
        }

        let readiness = match (&service.readiness_command, &service.readiness_path) {
            (Some(command), _) => ReadinessPolicy::Command(command.clone()),
            (None, Some(path)) => ReadinessPolicy::Http {
                port: self.config.service_port,
                path: path.clone(),
            },
            (None, None) => ReadinessPolicy::Port(self.config.service_port),
        };

        let app = ContainerSpec {
            name: self.service_name(&service.name),
            image: service.image.clone(),
            network,
            port: PortBinding {
                host: app_port,
                container: self.config.service_port,
            },
            env: app_env,
            depends_on: Some(store_name),
            readiness,
            poll,
        };

        ServicePlan {
            service: service.name.clone(),
            image: service.image.clone(),
            source_dir: service.source_dir.clone(),
            store,
            app,
        }
    }

    /// Allocate ports and plan every configured service without starting anything
    pub fn plan(&self) -> Result<Vec<ServicePlan>> {
        self.config
            .services
            .iter()
            .map(|service| {
                let (store_port, app_port) = self.allocate_ports(service)?;
                Ok(self.plan_service(service, store_port, app_port))
            })
            .collect()
    }

    fn allocate_ports(&self, service: &ServiceConfig) -> Result<(u16, u16)> {
        let range = self.config.ports;
        let store = self
            .allocator
            .allocate_for(self.store_name(&service.name).as_str(), range.start, range.end)?;
        let app = self
            .allocator
            .allocate_for(self.service_name(&service.name).as_str(), range.start, range.end)?;
        Ok((store.port, app.port))
    }

    /// Build the environment
    ///
    /// On any failure everything already started is torn down before the
    /// original error is returned; the orchestrator is then `Failed`. If the
    /// returned future is dropped before completion the orchestrator stays
    /// `Building` and `dispose_services` removes whatever was started.
    pub async fn build(&mut self) -> Result<&ManagedEnvironment> {
        if self.state != EnvironmentState::Unbuilt {
            return Err(TbError::InvalidState(format!(
                "cannot build an environment that is {}",
                self.state
            )));
        }
        self.state = EnvironmentState::Building;
        tracing::info!(environment = %self.id, services = self.config.services.len(), "building environment");

        let network_name = self.network_name();
        self.network = Some(network_name.clone());
        let network = match self.networks.create(&network_name).await {
            Ok(network) => network,
            Err(e) => {
                if matches!(e, TbError::NameConflict(_)) {
                    self.network = None;
                }
                self.teardown_services().await;
                self.state = EnvironmentState::Failed;
                return Err(e);
            }
        };

        let cancelled = AtomicBool::new(false);
        let outcomes = {
            let this = &*self;
            let branches = this
                .config
                .services
                .iter()
                .map(|service| this.run_branch(service, &network, &cancelled));
            join_all(branches).await
        };

        let mut results = Vec::with_capacity(outcomes.len());
        let mut first_error: Option<TbError> = None;
        for outcome in outcomes {
            match outcome {
                Ok(result) => results.push(result),
                // A branch that stopped because another failed is not the cause
                Err(TbError::Cancelled(step)) => {
                    tracing::debug!(environment = %self.id, %step, "branch cancelled");
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(error) = first_error {
            tracing::error!(environment = %self.id, error = %error, "build failed, rolling back");
            let failures = self.teardown_services().await;
            if !failures.is_empty() {
                tracing::error!(
                    environment = %self.id,
                    leftovers = ?self.live_resources(),
                    "rollback incomplete: {}",
                    failures.join("; ")
                );
            }
            self.state = EnvironmentState::Failed;
            return Err(error);
        }

        tracing::info!(environment = %self.id, "environment ready");
        self.state = EnvironmentState::Ready;
        Ok(&*self.environment.insert(ManagedEnvironment {
            id: self.id,
            host: self.config.host.clone(),
            network,
            services: results,
        }))
    }

    async fn run_branch(
        &self,
        service: &ServiceConfig,
        network: &NetworkHandle,
        cancelled: &AtomicBool,
    ) -> Result<ServiceBranchResult> {
        let result = self.run_branch_steps(service, network, cancelled).await;

        if let Err(e) = &result {
            if !matches!(e, TbError::Cancelled(_)) {
                tracing::warn!(environment = %self.id, service = %service.name, error = %e, "branch failed");
                cancelled.store(true, Ordering::SeqCst);
            }
        }

        result
    }

    /// store -> image -> service, each step only after the previous one is ready
    async fn run_branch_steps(
        &self,
        service: &ServiceConfig,
        network: &NetworkHandle,
        cancelled: &AtomicBool,
    ) -> Result<ServiceBranchResult> {
        checkpoint(cancelled, &service.name)?;
        let (store_port, app_port) = self.allocate_ports(service)?;
        let plan = self.plan_service(service, store_port, app_port);
        debug_assert_eq!(plan.store.network, network.name);

        checkpoint(cancelled, plan.store.name.as_str())?;
        let store = self.launch_tracked(&plan.store, &[]).await?;

        checkpoint(cancelled, &plan.image)?;
        let image = self.images.resolve(&plan.image, &plan.source_dir).await?;

        checkpoint(cancelled, plan.app.name.as_str())?;
        let container = self
            .launch_tracked(&plan.app, std::slice::from_ref(&store))
            .await?;

        tracing::info!(
            environment = %self.id,
            service = %service.name,
            port = app_port,
            "service ready"
        );

        Ok(ServiceBranchResult {
            service: service.name.clone(),
            store,
            image,
            container,
            port: app_port,
        })
    }

    /// Launch `spec` with its dependency picked from `ready` by name
    ///
    /// The name is tracked before the launch starts, so teardown covers a
    /// container even when this future is dropped mid-launch.
    async fn launch_tracked(
        &self,
        spec: &ContainerSpec,
        ready: &[ContainerHandle],
    ) -> Result<ContainerHandle> {
        self.containers.lock().push(spec.name.clone());

        let dependency = ready
            .iter()
            .find(|c| Some(&c.name) == spec.depends_on.as_ref());
        let result = self.launcher.launch(spec, dependency).await;

        // A conflicting name belongs to someone else
        if let Err(TbError::NameConflict(_)) = &result {
            self.containers.lock().retain(|name| name != &spec.name);
        }
        result
    }

    /// Remove live containers (latest first) and then the network
    ///
    /// Keeps going past failures; resources that could not be removed stay
    /// tracked so a later call can retry them.
    async fn teardown_services(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        let mut pending = std::mem::take(self.containers.get_mut());
        let mut remaining = Vec::new();
        while let Some(container) = pending.pop() {
            if let Err(e) = self.launcher.stop_and_remove(&container).await {
                failures.push(format!("container '{}': {}", container, e));
                remaining.push(container);
            }
        }
        remaining.reverse();
        *self.containers.get_mut() = remaining;

        if let Some(network) = self.network.take() {
            if let Err(e) = self.networks.destroy(&network).await {
                failures.push(format!("network '{}': {}", network, e));
                self.network = Some(network);
            }
        }

        failures
    }

    /// Stop and remove every container, then the network
    ///
    /// Idempotent: absent resources count as removed, and calling it again
    /// after success is a no-op.
    pub async fn dispose_services(&mut self) -> Result<()> {
        match self.state {
            // `build` holds `&mut self`, so reaching here means its future was dropped
            EnvironmentState::Building => {
                tracing::warn!(environment = %self.id, "build was abandoned, cleaning up");
                self.state = EnvironmentState::Failed;
            }
            EnvironmentState::Unbuilt => {
                self.state = EnvironmentState::Disposed;
                return Ok(());
            }
            EnvironmentState::Ready | EnvironmentState::Failed | EnvironmentState::Disposed => {}
        }

        let failures = self.teardown_services().await;
        if !failures.is_empty() {
            return Err(TbError::TeardownFailure(failures));
        }

        if self.state != EnvironmentState::Disposed {
            tracing::info!(environment = %self.id, "environment disposed");
        }
        self.environment = None;
        self.state = EnvironmentState::Disposed;
        Ok(())
    }

    /// Remove every configured service image if present
    ///
    /// Independent of container disposal and safe when images never existed.
    pub async fn dispose_images(&self) -> Result<()> {
        let removals = self.config.services.iter().map(|service| async move {
            self.images
                .remove(&service.image)
                .await
                .map_err(|e| format!("image '{}': {}", service.image, e))
        });

        let failures: Vec<String> = join_all(removals)
            .await
            .into_iter()
            .filter_map(|r| r.err())
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TbError::TeardownFailure(failures))
        }
    }
}

impl Drop for EnvironmentOrchestrator {
    fn drop(&mut self) {
        let live = self.live_resources();
        if !live.is_empty() {
            tracing::warn!(
                environment = %self.id,
                resources = ?live,
                "orchestrator dropped with live resources; call dispose_services()"
            );
        }
    }
}

fn checkpoint(cancelled: &AtomicBool, step: &str) -> Result<()> {
    if cancelled.load(Ordering::SeqCst) {
        Err(TbError::Cancelled(step.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::docker::memory::InMemoryProvider;
    use crate::launcher::ContainerSpec;

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.readiness.interval_ms = 10;
        config.readiness.timeout_ms = 100;
        Arc::new(config)
    }

    fn orchestrator(provider: &InMemoryProvider) -> EnvironmentOrchestrator {
        EnvironmentOrchestrator::new_with_clock(
            test_config(),
            Arc::new(provider.clone()),
            Arc::new(PortAllocator::new()),
            Arc::new(FakeClock::new()),
        )
    }

    fn app_spec<'a>(plans: &'a [ServicePlan], service: &str) -> &'a ContainerSpec {
        &plans.iter().find(|p| p.service == service).unwrap().app
    }

    #[test]
    fn test_plan_wires_store_and_links() {
        let provider = InMemoryProvider::new();
        let orch = orchestrator(&provider);
        let plans = orch.plan().unwrap();

        assert_eq!(plans.len(), 2);
        let task = app_spec(&plans, "taskservice");
        let store = orch.store_name("taskservice");

        assert_eq!(task.depends_on.as_ref(), Some(&store));
        assert_eq!(
            task.env["ConnectionStrings__DefaultConnection"],
            format!(
                "Host={0};Port=5432;Database={0};Username=myuser;Password=mypassword",
                store
            )
        );
        assert_eq!(task.env["ASPNETCORE_ENVIRONMENT"], "Development");
        assert_eq!(task.env["DataBaseInit"], "true");
        assert_eq!(
            task.env["ConnectionStrings__AuthenticationService"],
            format!("http://{}:8080", orch.service_name("authenticationservice"))
        );
        assert_eq!(task.readiness, ReadinessPolicy::Port(8080));
        assert_eq!(task.port.container, 8080);

        let auth = app_spec(&plans, "authenticationservice");
        assert!(!auth.env.keys().any(|k| k.ends_with("AuthenticationService")));
    }

    #[test]
    fn test_plan_allocates_distinct_ports() {
        let provider = InMemoryProvider::new();
        let orch = orchestrator(&provider);
        let plans = orch.plan().unwrap();

        let mut ports: Vec<u16> = plans
            .iter()
            .flat_map(|p| [p.store.port.host, p.app.port.host])
            .collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 4);
    }

    #[tokio::test]
    async fn test_build_then_dispose() {
        let provider = InMemoryProvider::new();
        let mut orch = orchestrator(&provider);

        let env = orch.build().await.unwrap().clone();
        assert_eq!(orch.state(), EnvironmentState::Ready);
        assert_eq!(provider.running_containers().len(), 4);
        assert_eq!(provider.networks(), vec![orch.network_name().to_string()]);
        assert!(env.base_url("taskservice").unwrap().starts_with("http://127.0.0.1:"));
        assert!(env.endpoint("missing").is_none());

        orch.dispose_services().await.unwrap();
        assert_eq!(orch.state(), EnvironmentState::Disposed);
        assert!(provider.containers().is_empty());
        assert!(provider.networks().is_empty());
        assert!(orch.live_resources().is_empty());
    }

    #[tokio::test]
    async fn test_store_ready_before_service_starts() {
        let provider = InMemoryProvider::new();
        provider.ready_after("tmptaskservicedb", 2);
        let mut orch = orchestrator(&provider);
        orch.build().await.unwrap();

        let ops = provider.operations();
        let pos = |entry: String| ops.iter().position(|op| *op == entry).unwrap();
        let store_run = pos(format!("container:run:{}", orch.store_name("taskservice")));
        let build = pos("image:build:tmptaskservice:test".to_string());
        let app_run = pos(format!("container:run:{}", orch.service_name("taskservice")));
        assert!(store_run < build);
        assert!(build < app_run);
        assert_eq!(provider.probe_count("tmptaskservicedb"), 3);

        orch.dispose_services().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_branch_rolls_back_everything() {
        let provider = InMemoryProvider::new();
        provider.never_ready("tmptaskservice");
        let mut orch = orchestrator(&provider);

        let err = orch.build().await.unwrap_err();

        assert!(matches!(err, TbError::ReadinessTimeout { .. }));
        assert_eq!(orch.state(), EnvironmentState::Failed);
        assert!(provider.containers().is_empty());
        assert!(provider.networks().is_empty());
        assert!(orch.environment().is_none());
    }

    #[tokio::test]
    async fn test_build_failure_surfaces_original_error() {
        let provider = InMemoryProvider::new();
        provider.fail_build("tmpauthenticationservice:test");
        let mut orch = orchestrator(&provider);

        let err = orch.build().await.unwrap_err();

        assert!(matches!(err, TbError::BuildFailure { ref image, .. } if image == "tmpauthenticationservice:test"));
        assert!(provider.containers().is_empty());
        assert!(provider.networks().is_empty());
    }

    #[tokio::test]
    async fn test_build_twice_is_rejected() {
        let provider = InMemoryProvider::new();
        let mut orch = orchestrator(&provider);
        orch.build().await.unwrap();

        assert!(matches!(orch.build().await, Err(TbError::InvalidState(_))));
        orch.dispose_services().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let provider = InMemoryProvider::new();
        let mut orch = orchestrator(&provider);
        orch.build().await.unwrap();

        orch.dispose_services().await.unwrap();
        let ops_after_first = provider.operations().len();
        orch.dispose_services().await.unwrap();

        assert_eq!(provider.operations().len(), ops_after_first);
        assert_eq!(orch.state(), EnvironmentState::Disposed);
    }

    #[tokio::test]
    async fn test_dispose_unbuilt_is_noop() {
        let provider = InMemoryProvider::new();
        let mut orch = orchestrator(&provider);

        orch.dispose_services().await.unwrap();

        assert_eq!(orch.state(), EnvironmentState::Disposed);
        assert!(provider.operations().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_reports_failures_and_retries() {
        let provider = InMemoryProvider::new();
        let mut orch = orchestrator(&provider);
        orch.build().await.unwrap();
        provider.fail_removal("tmptaskservicedb");

        let err = orch.dispose_services().await.unwrap_err();
        match err {
            TbError::TeardownFailure(failures) => {
                assert!(failures.iter().any(|f| f.contains("tmptaskservicedb")));
                assert!(failures.iter().any(|f| f.contains("network")));
            }
            other => panic!("expected TeardownFailure, got {:?}", other),
        }
        assert_eq!(provider.containers().len(), 1);
        assert_eq!(orch.live_resources().len(), 2);

        provider.allow_removal("tmptaskservicedb");
        orch.dispose_services().await.unwrap();
        assert!(provider.containers().is_empty());
        assert!(provider.networks().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_tolerates_externally_removed_resources() {
        let provider = InMemoryProvider::new();
        let mut orch = orchestrator(&provider);
        orch.build().await.unwrap();

        let store = orch.store_name("authenticationservice");
        provider.stop_container(&store).await.unwrap();
        provider.remove_container(&store).await.unwrap();

        orch.dispose_services().await.unwrap();
        assert!(provider.containers().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_images_only_touches_images() {
        let provider = InMemoryProvider::new();
        let mut orch = orchestrator(&provider);
        orch.build().await.unwrap();

        orch.dispose_images().await.unwrap();
        assert!(provider.images().is_empty());
        assert_eq!(provider.running_containers().len(), 4);

        // Nothing left to remove
        orch.dispose_images().await.unwrap();
        orch.dispose_services().await.unwrap();
    }
}
