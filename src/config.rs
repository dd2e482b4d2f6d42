use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admission and lifecycle settings
    #[serde(default)]
    pub dispenser: DispenserConfig,

    /// How app containers are created
    #[serde(default)]
    pub container: ContainerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispenserConfig {
    /// Maximum number of live apps. Negative means unlimited, 0 disables creation.
    #[serde(default = "default_app_limit")]
    pub app_limit: i64,

    /// Base domain apps are served under (app URL is `name.domain`)
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Docker daemon endpoint, e.g. "tcp://10.0.0.5:2375" or "unix:///var/run/docker.sock".
    /// Uses the local daemon when unset.
    pub docker_host: Option<String>,

    /// Upper bound on any single runtime call in seconds
    #[serde(default = "default_runtime_timeout")]
    pub runtime_timeout_secs: u64,

    /// How long a started app has to report alive, in seconds
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Interval between liveness checks during startup, in milliseconds
    #[serde(default = "default_liveness_poll_interval")]
    pub liveness_poll_interval_ms: u64,
}

impl DispenserConfig {
    /// App limit as a count, or `None` when unlimited
    pub fn limit(&self) -> Option<usize> {
        usize::try_from(self.app_limit).ok()
    }

    pub fn runtime_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn liveness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_interval_ms)
    }

    /// URL an app with the given name is served at
    pub fn url_for(&self, name: &str) -> String {
        format!("{}.{}", name, self.domain)
    }

    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.domain.is_empty() {
            errors.push("dispenser: 'domain' must not be empty".to_string());
        } else if self.domain.starts_with('.') || self.domain.ends_with('.') {
            errors.push(format!(
                "dispenser: 'domain' must not start or end with a dot (got '{}')",
                self.domain
            ));
        }

        if self.runtime_timeout_secs == 0 {
            errors.push("dispenser: 'runtime_timeout_secs' must be greater than 0".to_string());
        }

        if self.liveness_poll_interval_ms == 0 {
            errors.push("dispenser: 'liveness_poll_interval_ms' must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for DispenserConfig {
    fn default() -> Self {
        Self {
            app_limit: default_app_limit(),
            domain: default_domain(),
            docker_host: None,
            runtime_timeout_secs: default_runtime_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            liveness_poll_interval_ms: default_liveness_poll_interval(),
        }
    }
}

/// Image pull policy for app containers
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before starting
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

/// Container settings shared by every dispensed app
#[derive(Debug, Deserialize, Clone)]
pub struct ContainerConfig {
    /// Docker image each app runs
    #[serde(default = "default_image")]
    pub image: String,

    /// Port the app listens on inside the container
    #[serde(default = "default_container_port")]
    pub port: u16,

    /// Arguments passed as the container command
    #[serde(default)]
    pub args: Vec<String>,

    /// Docker network to attach containers to (default: bridge)
    pub network: Option<String>,

    /// Image pull policy: "always", "never", or "if-not-present" (default)
    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Memory limit (e.g., "512m", "1g")
    pub memory: Option<String>,

    /// CPU limit (e.g., "0.5", "2")
    pub cpus: Option<String>,

    /// Seconds Docker waits after SIGTERM before SIGKILL on stop
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_secs: u64,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ContainerConfig {
    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.image.trim().is_empty() {
            errors.push("container: 'image' must not be empty".to_string());
        }

        if self.port == 0 {
            errors.push("container: 'port' must be greater than 0".to_string());
        }

        if let Some(ref memory) = self.memory {
            if let Err(e) = parse_memory_limit(memory) {
                errors.push(format!("container: {}", e));
            }
        }

        if let Some(ref cpus) = self.cpus {
            if let Err(e) = parse_cpu_limit(cpus) {
                errors.push(format!("container: {}", e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            port: default_container_port(),
            args: Vec::new(),
            network: None,
            pull_policy: PullPolicy::default(),
            memory: None,
            cpus: None,
            stop_grace_period_secs: default_stop_grace_period(),
            env: HashMap::new(),
        }
    }
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
pub fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if let Some(num) = limit.strip_suffix("gb").or(limit.strip_suffix('g')) {
        (num, 1024 * 1024 * 1024i64)
    } else if let Some(num) = limit.strip_suffix("mb").or(limit.strip_suffix('m')) {
        (num, 1024 * 1024i64)
    } else if let Some(num) = limit.strip_suffix("kb").or(limit.strip_suffix('k')) {
        (num, 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;

    if num <= 0.0 {
        anyhow::bail!("Invalid memory limit: {}", limit);
    }

    Ok((num * multiplier as f64) as i64)
}

/// Parse CPU limit string (e.g., "0.5") to Docker NanoCPUs
pub fn parse_cpu_limit(cpus: &str) -> anyhow::Result<i64> {
    let cpu_count: f64 = cpus
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid CPU limit: {}", cpus))?;

    if cpu_count <= 0.0 {
        anyhow::bail!("Invalid CPU limit: {}", cpus);
    }

    Ok((cpu_count * 1_000_000_000.0) as i64)
}

// Default value functions
fn default_app_limit() -> i64 {
    -1 // unlimited
}

fn default_domain() -> String {
    "domain.com".to_string()
}

fn default_runtime_timeout() -> u64 {
    30
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_liveness_poll_interval() -> u64 {
    250
}

fn default_image() -> String {
    "nginx:alpine".to_string()
}

fn default_container_port() -> u16 {
    80
}

fn default_stop_grace_period() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.dispenser.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.container.validate() {
            errors.extend(e);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[dispenser]
app_limit = 5
domain = "apps.example.com"
docker_host = "tcp://10.0.0.5:2375"
runtime_timeout_secs = 10
startup_timeout_secs = 20
liveness_poll_interval_ms = 100

[container]
image = "ghcr.io/acme/demo:1.2"
port = 3000
args = ["serve", "--quiet"]
network = "apps"
pull_policy = "always"
memory = "256m"
cpus = "0.25"
stop_grace_period_secs = 3

[container.env]
RUST_LOG = "info"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.dispenser.app_limit, 5);
        assert_eq!(config.dispenser.limit(), Some(5));
        assert_eq!(config.dispenser.domain, "apps.example.com");
        assert_eq!(config.dispenser.docker_host.as_deref(), Some("tcp://10.0.0.5:2375"));
        assert_eq!(config.dispenser.runtime_timeout(), Duration::from_secs(10));
        assert_eq!(config.dispenser.startup_timeout(), Duration::from_secs(20));
        assert_eq!(config.dispenser.liveness_poll_interval(), Duration::from_millis(100));

        assert_eq!(config.container.image, "ghcr.io/acme/demo:1.2");
        assert_eq!(config.container.port, 3000);
        assert_eq!(config.container.args, vec!["serve", "--quiet"]);
        assert_eq!(config.container.network.as_deref(), Some("apps"));
        assert_eq!(config.container.pull_policy, PullPolicy::Always);
        assert_eq!(config.container.stop_grace_period(), Duration::from_secs(3));
        assert_eq!(config.container.env.get("RUST_LOG").unwrap(), "info");
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.dispenser.app_limit, -1);
        assert_eq!(config.dispenser.limit(), None);
        assert_eq!(config.dispenser.domain, "domain.com");
        assert!(config.dispenser.docker_host.is_none());
        assert_eq!(config.dispenser.runtime_timeout_secs, 30);
        assert_eq!(config.dispenser.startup_timeout_secs, 30);
        assert_eq!(config.dispenser.liveness_poll_interval_ms, 250);
        assert_eq!(config.container.image, "nginx:alpine");
        assert_eq!(config.container.port, 80);
        assert_eq!(config.container.pull_policy, PullPolicy::IfNotPresent);
    }

    #[test]
    fn test_app_limit_semantics() {
        let mut config = DispenserConfig::default();

        config.app_limit = 0;
        assert_eq!(config.limit(), Some(0));

        config.app_limit = -7;
        assert_eq!(config.limit(), None);

        config.app_limit = 3;
        assert_eq!(config.limit(), Some(3));
    }

    #[test]
    fn test_url_for() {
        let config = DispenserConfig {
            domain: "example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(config.url_for("myapp"), "myapp.example.com");
    }

    #[test]
    fn test_pull_policy_if_not_present_alias() {
        let container: ContainerConfig = toml::from_str(r#"pull_policy = "if-not-present""#).unwrap();
        assert_eq!(container.pull_policy, PullPolicy::IfNotPresent);

        let container: ContainerConfig = toml::from_str(r#"pull_policy = "never""#).unwrap();
        assert_eq!(container.pull_policy, PullPolicy::Never);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let toml = r#"
[dispenser]
domain = ".example.com"
liveness_poll_interval_ms = 0

[container]
image = ""
port = 0
memory = "lots"
cpus = "-1"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("'domain' must not start or end with a dot"));
        assert!(err.contains("'liveness_poll_interval_ms' must be greater than 0"));
        assert!(err.contains("'image' must not be empty"));
        assert!(err.contains("'port' must be greater than 0"));
        assert!(err.contains("Invalid memory limit"));
        assert!(err.contains("Invalid CPU limit"));
    }

    #[test]
    fn test_validate_empty_domain() {
        let config = Config {
            dispenser: DispenserConfig {
                domain: String::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'domain' must not be empty"));
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("256mb").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory_limit("1024k").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory_limit("1048576").unwrap(), 1048576);
        assert!(parse_memory_limit("invalid").is_err());
        assert!(parse_memory_limit("0m").is_err());
    }

    #[test]
    fn test_parse_cpu_limit() {
        assert_eq!(parse_cpu_limit("0.5").unwrap(), 500_000_000);
        assert_eq!(parse_cpu_limit("2").unwrap(), 2_000_000_000);
        assert!(parse_cpu_limit("two").is_err());
        assert!(parse_cpu_limit("0").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[dispenser]
app_limit = 1
domain = "example.com"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.dispenser.limit(), Some(1));
        assert_eq!(config.dispenser.domain, "example.com");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[container]\nport = 0").unwrap();

        assert!(Config::load(file.path()).is_err());
        assert!(Config::load("/nonexistent/appdispenser.toml").is_err());
    }
}
