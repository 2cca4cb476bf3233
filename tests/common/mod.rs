/// Common test utilities for testbed integration tests
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use testbed::clock::SystemClock;
use testbed::config::Config;
use testbed::docker::images::ImageProvisioner;
use testbed::docker::memory::InMemoryProvider;
use testbed::docker::ports::PortAllocator;
use testbed::orchestrator::EnvironmentOrchestrator;

/// Route tracing output through the test harness; safe to call repeatedly
#[allow(dead_code)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[allow(dead_code)]
/// Default two-service topology with readiness tuned for in-memory runs
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.readiness.interval_ms = 5;
    config.readiness.timeout_ms = 60;
    config
}

/// One provider, port allocator and image provisioner shared by every
/// orchestrator created from it, the way parallel test fixtures share them
#[allow(dead_code)]
pub struct Harness {
    pub provider: InMemoryProvider,
    pub allocator: Arc<PortAllocator>,
    pub images: ImageProvisioner,
    pub config: Arc<Config>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: Config) -> Self {
        init_test_logging();
        let provider = InMemoryProvider::new();
        let images = ImageProvisioner::new(Arc::new(provider.clone()), &config.build_descriptor);
        Self {
            provider,
            allocator: Arc::new(PortAllocator::new()),
            images,
            config: Arc::new(config),
        }
    }

    pub fn orchestrator(&self) -> EnvironmentOrchestrator {
        EnvironmentOrchestrator::with_images(
            Arc::clone(&self.config),
            Arc::new(self.provider.clone()),
            Arc::clone(&self.allocator),
            Arc::new(SystemClock),
            self.images.clone(),
        )
    }

    /// Resources whose name carries `id`
    pub fn resources_of(&self, id: &str) -> Vec<String> {
        self.provider
            .containers()
            .into_iter()
            .chain(self.provider.networks())
            .filter(|name| name.ends_with(id))
            .collect()
    }
}

/// Directory holding the service sources when running against Docker
#[allow(dead_code)]
pub fn e2e_config_dir() -> Option<PathBuf> {
    std::env::var_os("TESTBED_E2E_DIR").map(PathBuf::from)
}

#[allow(dead_code)]
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to build HTTP client")
}
