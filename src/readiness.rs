// Readiness polling
// Blocks a container start until an observable condition holds or the
// timeout runs out

use crate::clock::Clock;
use crate::config::ReadinessConfig;
use crate::docker::provider::{ContainerHandle, InfrastructureProvider};
use crate::errors::{Result, TbError};
use std::sync::Arc;
use std::time::Duration;

/// Condition that marks a container as ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessPolicy {
    /// Command run inside the container exits with code zero
    Command(Vec<String>),
    /// Container port accepts TCP connections
    Port(u16),
    /// GET `path` on the container port returns a 2xx status
    Http { port: u16, path: String },
}

impl ReadinessPolicy {
    pub fn describe(&self) -> String {
        match self {
            ReadinessPolicy::Command(args) => format!("command `{}`", args.join(" ")),
            ReadinessPolicy::Port(port) => format!("port {}", port),
            ReadinessPolicy::Http { port, path } => format!("GET {} on port {}", path, port),
        }
    }
}

/// Interval and timeout for one readiness wait
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
    /// Interval multiplier after each failed attempt; `None` polls at a fixed rate
    pub backoff: Option<f64>,
    pub max_interval: Option<Duration>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&ReadinessConfig::default())
    }
}

impl From<&ReadinessConfig> for PollSettings {
    fn from(config: &ReadinessConfig) -> Self {
        Self {
            interval: config.interval(),
            timeout: config.timeout(),
            backoff: config.backoff,
            max_interval: config.max_interval_ms.map(Duration::from_millis),
        }
    }
}

impl PollSettings {
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            backoff: None,
            max_interval: None,
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let cap = self.max_interval.unwrap_or(Duration::MAX);
        let next = match self.backoff {
            // Overflow saturates at the cap; the wait loop clamps to the deadline
            Some(factor) => Duration::try_from_secs_f64(current.as_secs_f64() * factor)
                .unwrap_or(cap),
            None => current,
        };
        next.min(cap)
    }
}

/// Polls a readiness condition; only observes, never changes the target
pub struct ReadinessProbe {
    provider: Arc<dyn InfrastructureProvider>,
    clock: Arc<dyn Clock>,
}

impl ReadinessProbe {
    pub fn new(provider: Arc<dyn InfrastructureProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { provider, clock }
    }

    /// Wait until `policy` holds for `container`
    ///
    /// Returns the number of attempts. Fails with `ReadinessTimeout` no
    /// earlier than `settings.timeout`; the final check happens at the
    /// deadline, so the overshoot is bounded by one check.
    pub async fn wait(
        &self,
        container: &ContainerHandle,
        policy: &ReadinessPolicy,
        settings: &PollSettings,
    ) -> Result<u32> {
        let start = self.clock.now();
        let mut interval = settings.interval;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let last_failure = match self.check(container, policy).await {
                Ok(()) => {
                    tracing::debug!(
                        container = %container.name,
                        attempts,
                        "ready ({})",
                        policy.describe()
                    );
                    return Ok(attempts);
                }
                Err(reason) => reason,
            };

            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed >= settings.timeout {
                return Err(TbError::ReadinessTimeout {
                    resource: container.name.to_string(),
                    waited: elapsed,
                    last_failure,
                });
            }

            tracing::trace!(container = %container.name, attempts, %last_failure, "not ready");
            let remaining = settings.timeout - elapsed;
            self.clock.sleep(interval.min(remaining)).await;
            interval = settings.next_interval(interval);
        }
    }

    /// One observation; the error string describes why it is not ready yet
    async fn check(
        &self,
        container: &ContainerHandle,
        policy: &ReadinessPolicy,
    ) -> std::result::Result<(), String> {
        match policy {
            ReadinessPolicy::Command(command) => {
                match self.provider.exec(&container.name, command).await {
                    Ok(output) if output.exit_code == 0 => Ok(()),
                    Ok(output) => Err(format!(
                        "`{}` exited with {}: {}",
                        command.join(" "),
                        output.exit_code,
                        output.output
                    )),
                    Err(e) => Err(e.to_string()),
                }
            }
            ReadinessPolicy::Port(port) => match self.provider.check_port(container, *port).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(format!("port {} refused connection", port)),
                Err(e) => Err(e.to_string()),
            },
            ReadinessPolicy::Http { port, path } => {
                match self.provider.check_http(container, *port, path).await {
                    Ok(status) if (200..300).contains(&status) => Ok(()),
                    Ok(status) => Err(format!("GET {} returned {}", path, status)),
                    Err(e) => Err(e.to_string()),
                }
            }
        }
    }
}
