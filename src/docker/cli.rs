// Docker CLI provider
// Drives the `docker` binary with argument vectors (no shell, no injection)

use crate::docker::provider::{
    ContainerHandle, ExecOutput, InfrastructureProvider, NetworkHandle,
};
use crate::errors::{Result, TbError};
use crate::launcher::ContainerSpec;
use crate::naming::ResourceName;
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Provider backed by the local docker CLI
pub struct DockerCli {
    program: String,
    host: String,
    http: reqwest::Client,
}

impl DockerCli {
    /// Create a provider whose published ports are reachable on `host`
    pub fn new(host: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TbError::ProviderError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            program: "docker".to_string(),
            host: host.to_string(),
            http,
        })
    }

    /// Check if Docker is available on the system
    pub async fn is_docker_available(&self) -> bool {
        Command::new(&self.program)
            .arg("version")
            .arg("--format")
            .arg("{{.Server.Version}}")
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Build `docker run` arguments for a spec
    pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            spec.name.to_string(),
            "--network".to_string(),
            spec.network.to_string(),
            "--network-alias".to_string(),
            spec.name.to_string(),
            "--publish".to_string(),
            format!("{}:{}", spec.port.host, spec.port.container),
        ];

        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());
        args
    }

    /// Build `docker build` arguments
    pub fn build_args(name: &str, context_dir: &Path, descriptor: &str) -> Vec<String> {
        vec![
            "build".to_string(),
            "--tag".to_string(),
            name.to_string(),
            "--file".to_string(),
            context_dir.join(descriptor).to_string_lossy().to_string(),
            "--rm".to_string(),
            "--force-rm".to_string(),
            context_dir.to_string_lossy().to_string(),
        ]
    }

    async fn output(&self, args: &[String]) -> Result<Output> {
        tracing::trace!(program = %self.program, ?args, "docker");
        Ok(Command::new(&self.program).args(args).output().await?)
    }

    /// Execute a docker command, mapping a failed exit status to an error
    async fn execute_command_safe(&self, args: &[String], subject: &str) -> Result<String> {
        let output = self.output(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(subject, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn host_port(&self, container: &ContainerHandle, container_port: u16) -> Result<u16> {
        container.host_port(container_port).ok_or_else(|| {
            TbError::NotFound(format!(
                "port {} on container '{}'",
                container_port, container.name
            ))
        })
    }
}

/// Docker reports absent objects with "No such ..." or "not found"
fn classify_failure(subject: &str, stderr: &str) -> TbError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("no such") || lowered.contains("not found") {
        TbError::NotFound(subject.to_string())
    } else if lowered.contains("already in use") || lowered.contains("already exists") {
        TbError::NameConflict(subject.to_string())
    } else {
        TbError::ProviderError(format!("{}: {}", subject, stderr.trim()))
    }
}

/// Last lines of build output, enough to see why it failed
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[async_trait]
impl InfrastructureProvider for DockerCli {
    async fn create_network(&self, name: &ResourceName) -> Result<NetworkHandle> {
        let args = vec![
            "network".to_string(),
            "create".to_string(),
            name.to_string(),
        ];
        let id = self
            .execute_command_safe(&args, &format!("network '{}'", name))
            .await?;

        Ok(NetworkHandle {
            name: name.clone(),
            id,
        })
    }

    async fn remove_network(&self, name: &ResourceName) -> Result<()> {
        let args = vec!["network".to_string(), "rm".to_string(), name.to_string()];
        self.execute_command_safe(&args, &format!("network '{}'", name))
            .await?;
        Ok(())
    }

    async fn image_exists(&self, name: &str) -> Result<bool> {
        let args = vec![
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            name.to_string(),
        ];

        match self
            .execute_command_safe(&args, &format!("image '{}'", name))
            .await
        {
            Ok(_) => Ok(true),
            Err(TbError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn build_image(&self, name: &str, context_dir: &Path, descriptor: &str) -> Result<()> {
        if !context_dir.join(descriptor).exists() {
            return Err(TbError::BuildFailure {
                image: name.to_string(),
                reason: format!(
                    "{} not found in {}",
                    descriptor,
                    context_dir.display()
                ),
            });
        }

        let output = self
            .output(&Self::build_args(name, context_dir, descriptor))
            .await?;

        if !output.status.success() {
            return Err(TbError::BuildFailure {
                image: name.to_string(),
                reason: tail(&String::from_utf8_lossy(&output.stderr), 20),
            });
        }

        Ok(())
    }

    async fn remove_image(&self, name: &str) -> Result<()> {
        let args = vec![
            "rmi".to_string(),
            "--force".to_string(),
            "--no-prune".to_string(),
            name.to_string(),
        ];
        self.execute_command_safe(&args, &format!("image '{}'", name))
            .await?;
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let id = self
            .execute_command_safe(&Self::run_args(spec), &format!("container '{}'", spec.name))
            .await?;

        Ok(ContainerHandle {
            name: spec.name.clone(),
            id,
            image: spec.image.clone(),
            network: spec.network.clone(),
            port: spec.port,
            started_at: Utc::now(),
        })
    }

    async fn is_running(&self, name: &ResourceName) -> Result<bool> {
        let args = vec![
            "container".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .State.Running}}".to_string(),
            name.to_string(),
        ];
        let stdout = self
            .execute_command_safe(&args, &format!("container '{}'", name))
            .await?;

        serde_json::from_str::<bool>(&stdout).map_err(|e| {
            TbError::ProviderError(format!(
                "Unexpected inspect output for '{}': {} ({})",
                name, stdout, e
            ))
        })
    }

    async fn stop_container(&self, name: &ResourceName) -> Result<()> {
        let args = vec!["stop".to_string(), name.to_string()];
        self.execute_command_safe(&args, &format!("container '{}'", name))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, name: &ResourceName) -> Result<()> {
        let args = vec![
            "rm".to_string(),
            "--force".to_string(),
            "--volumes".to_string(),
            name.to_string(),
        ];
        self.execute_command_safe(&args, &format!("container '{}'", name))
            .await?;
        Ok(())
    }

    async fn exec(&self, name: &ResourceName, command: &[String]) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string(), name.to_string()];
        args.extend_from_slice(command);

        let output = self.output(&args).await?;
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        // docker exec itself reports a missing container with exit code 1
        if !output.status.success() && text.to_lowercase().contains("no such container") {
            return Err(TbError::NotFound(format!("container '{}'", name)));
        }

        Ok(ExecOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            output: text.trim().to_string(),
        })
    }

    async fn check_port(&self, container: &ContainerHandle, container_port: u16) -> Result<bool> {
        let port = self.host_port(container, container_port)?;
        let connect = TcpStream::connect((self.host.as_str(), port));

        match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(_)) | Err(_) => Ok(false),
        }
    }

    async fn check_http(
        &self,
        container: &ContainerHandle,
        container_port: u16,
        path: &str,
    ) -> Result<u16> {
        let port = self.host_port(container, container_port)?;
        let url = format!("http://{}:{}/{}", self.host, port, path.trim_start_matches('/'));

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TbError::ProviderError(format!("GET {}: {}", url, e)))?;

        Ok(response.status().as_u16())
    }
}
