//! Docker-backed runtime for dispensed apps

use crate::config::{parse_cpu_limit, parse_memory_limit, ContainerConfig, PullPolicy};
use crate::runtime::{InstanceId, RuntimeClient};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Label attached to every container this crate creates
pub const APP_LABEL: &str = "appdispenser.app";

/// Runs each app as a Docker container
pub struct DockerRuntime {
    client: Docker,
    container: ContainerConfig,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    ///
    /// The connection is not verified here; the dispenser pings the runtime
    /// when it is constructed.
    pub async fn connect(
        docker_host: Option<&str>,
        container: ContainerConfig,
    ) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            debug!(host, "Connecting to remote Docker daemon");
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker at '{}': {}", host, e)
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            debug!(host, "Connecting to Docker daemon from DOCKER_HOST");
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker via DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            debug!("Connecting to local Docker daemon");
            Self::connect_with_defaults()?
        };

        Ok(Self { client, container })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.starts_with('/') && !path.starts_with("//") && std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                    Ok(client) => return Ok(client),
                    Err(e) => debug!(path, error = %e, "Docker socket connection failed"),
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot connect to Docker daemon: {}. \
                 Start dockerd or set docker_host / DOCKER_HOST.",
                e
            )
        })
    }

    async fn pull_image_if_needed(&self) -> anyhow::Result<()> {
        let image = self.container.image.as_str();
        let should_pull = match self.container.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::Never => {
                if self.client.inspect_image(image).await.is_err() {
                    anyhow::bail!(
                        "Image '{}' not found locally and pull_policy is 'never'",
                        image
                    );
                }
                false
            }
            PullPolicy::IfNotPresent => self.client.inspect_image(image).await.is_err(),
        };

        if !should_pull {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| anyhow::anyhow!("Failed to pull image '{}': {}", image, e))?;
            if let Some(error) = info.error {
                anyhow::bail!("Failed to pull image '{}': {}", image, error);
            }
            if let Some(status) = info.status {
                debug!(image, status, "Pull progress");
            }
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }

    fn container_config(&self, name: &str) -> anyhow::Result<Config<String>> {
        let mut env: Vec<String> = self
            .container
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.push(format!("PORT={}", self.container.port));
        env.push(format!("APP_NAME={}", name));

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(format!("{}/tcp", self.container.port), HashMap::new());

        let mut host_config = HostConfig {
            network_mode: self.container.network.clone(),
            ..Default::default()
        };
        if let Some(ref memory) = self.container.memory {
            host_config.memory = Some(parse_memory_limit(memory)?);
        }
        if let Some(ref cpus) = self.container.cpus {
            host_config.nano_cpus = Some(parse_cpu_limit(cpus)?);
        }

        let cmd = if self.container.args.is_empty() {
            None
        } else {
            Some(self.container.args.clone())
        };

        Ok(Config {
            image: Some(self.container.image.clone()),
            cmd,
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            labels: Some(HashMap::from([(APP_LABEL.to_string(), name.to_string())])),
            ..Default::default()
        })
    }

    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(_) => {
                debug!(container_id, "Removed Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to remove container: {}", e)),
        }
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn ping(&self) -> anyhow::Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("Docker daemon is not responding: {}", e))?;
        debug!("Connected to Docker daemon");
        Ok(())
    }

    async fn start(&self, name: &str) -> anyhow::Result<InstanceId> {
        self.pull_image_if_needed().await?;

        let container_name = container_name(name);
        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), self.container_config(name)?)
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create container '{}' from image '{}': {}",
                    container_name,
                    self.container.image,
                    e
                )
            })?;

        let container_id = response.id;
        debug!(name, container_id, container_name, "Created app container");

        if let Err(e) = self
            .client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.remove_container(&container_id).await {
                warn!(container_id, error = %cleanup, "Failed to clean up container after start failure");
            }
            anyhow::bail!("Failed to start container '{}': {}", container_name, e);
        }

        info!(name, container_id, "Started app container");
        Ok(InstanceId::from(container_id))
    }

    async fn is_alive(&self, id: &InstanceId) -> bool {
        match self.client.inspect_container(id.as_str(), None).await {
            Ok(info) => info.state.and_then(|s| s.running).unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn stop(&self, id: &InstanceId) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: self.container.stop_grace_period_secs as i64,
        };

        match self.client.stop_container(id.as_str(), Some(options)).await {
            Ok(_) => {
                info!(container_id = %id, "Stopped app container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id = %id, "Container was already stopped");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container: {}", e)),
        }
    }

    async fn kill(&self, id: &InstanceId) -> anyhow::Result<()> {
        match self.client.kill_container::<String>(id.as_str(), None).await {
            Ok(_) => info!(container_id = %id, "Killed app container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => debug!(container_id = %id, "Container not running"),
            Err(e) => return Err(anyhow::anyhow!("Failed to kill container: {}", e)),
        }

        self.remove_container(id.as_str()).await
    }
}

/// Docker container name for an app
///
/// App names may contain spaces, which Docker rejects, so anything outside
/// `[A-Za-z0-9_-]` becomes a hyphen. A random suffix keeps names unique
/// when an app name is reused after its previous container was killed.
fn container_name(app_name: &str) -> String {
    let sanitized: String = app_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("appdispenser-{}-{}", sanitized, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_sanitizes() {
        let name = container_name("my app");
        assert!(name.starts_with("appdispenser-my-app-"));
        assert_eq!(name.len(), "appdispenser-my-app-".len() + 8);
    }

    #[test]
    fn test_container_name_unique() {
        assert_ne!(container_name("blog"), container_name("blog"));
    }

    #[test]
    fn test_connect_to_host_rejects_unknown_scheme() {
        let Err(err) = DockerRuntime::connect_to_host("ftp://docker") else {
            panic!("ftp:// should be rejected");
        };
        assert!(err.to_string().contains("Invalid docker_host format"));
    }
}
