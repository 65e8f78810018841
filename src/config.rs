// Provider configuration consumed by the build engine.
//
// These types are read-only from this crate's perspective. The embedding
// application's config loader deserializes them (JSON or YAML) and hands
// them to the orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Build backend used to produce and publish container images.
///
/// Selected once per provider configuration. Adding a backend means adding a
/// variant here and a driver in `build/`, not registering a handler at
/// runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    /// Build with the local Docker engine, optionally pushing to the
    /// deployment registry.
    LocalDocker,
    /// Build inside an in-cluster Docker daemon pod via exec.
    ClusterDocker,
    /// Build inside an in-cluster buildkitd pod via exec, pushing directly
    /// to the deployment registry.
    ClusterBuildkit,
    /// Build with a dedicated short-lived kaniko Job, pushing directly to
    /// the deployment registry.
    Kaniko,
}

impl BuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::LocalDocker => "local-docker",
            BuildMode::ClusterDocker => "cluster-docker",
            BuildMode::ClusterBuildkit => "cluster-buildkit",
            BuildMode::Kaniko => "kaniko",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildMode {
    type Err = crate::error::BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-docker" => Ok(BuildMode::LocalDocker),
            "cluster-docker" => Ok(BuildMode::ClusterDocker),
            "cluster-buildkit" => Ok(BuildMode::ClusterBuildkit),
            "kaniko" => Ok(BuildMode::Kaniko),
            _ => Err(crate::error::BuildError::Configuration(format!(
                "invalid build mode '{}'. Supported: local-docker, cluster-docker, cluster-buildkit, kaniko",
                s
            ))),
        }
    }
}

/// Deployment registry endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub hostname: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Namespace segment prefixed to repository names
    /// (`host/namespace/name:tag`).
    #[serde(default)]
    pub namespace: Option<String>,
    /// Plain-HTTP registry without TLS (e.g. an in-cluster registry).
    #[serde(default)]
    pub insecure: bool,
}

impl RegistryConfig {
    /// `host` or `host:port` as used in image references.
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.hostname, port),
            None => self.hostname.clone(),
        }
    }

    /// Base URL of the registry's HTTP API.
    pub fn base_url(&self) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{}://{}", scheme, self.authority())
    }
}

/// Reference to an existing `kubernetes.io/dockerconfigjson` Secret that
/// holds credentials for pulling private base images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSecretRef {
    pub name: String,
    pub namespace: String,
}

/// Per-operation timeout bounds, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildTimeouts {
    /// Ancillary pod-exec commands (image listing, cleanup).
    pub exec_secs: u64,
    /// Build and push commands. Builds can legitimately run for minutes.
    pub build_secs: u64,
    /// Registry manifest requests.
    pub registry_secs: u64,
    /// Dispatch-and-wait for build Jobs.
    pub job_secs: u64,
}

impl Default for BuildTimeouts {
    fn default() -> Self {
        Self {
            exec_secs: 300,
            build_secs: 1200,
            registry_secs: 30,
            job_secs: 1200,
        }
    }
}

impl BuildTimeouts {
    pub fn exec(&self) -> Duration {
        Duration::from_secs(self.exec_secs)
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }

    pub fn registry(&self) -> Duration {
        Duration::from_secs(self.registry_secs)
    }

    pub fn job(&self) -> Duration {
        Duration::from_secs(self.job_secs)
    }
}

/// Full provider configuration for the build engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub build_mode: BuildMode,
    /// Namespace that holds in-cluster build resources (daemon pods, build
    /// Jobs, provisioned pull secrets).
    pub namespace: String,
    #[serde(default)]
    pub deployment_registry: Option<RegistryConfig>,
    #[serde(default)]
    pub image_pull_secrets: Vec<PullSecretRef>,
    #[serde(default)]
    pub timeouts: BuildTimeouts,
    /// Name of the in-cluster Docker daemon Deployment (cluster-docker mode).
    #[serde(default = "default_docker_daemon_deployment")]
    pub docker_daemon_deployment: String,
    /// Name of the in-cluster buildkitd Deployment (cluster-buildkit mode).
    #[serde(default = "default_buildkit_deployment")]
    pub buildkit_deployment: String,
    /// Executor image used for build Jobs (kaniko mode).
    #[serde(default = "default_kaniko_image")]
    pub kaniko_image: String,
    /// Directory inside in-cluster builders where module build contexts are
    /// staged by the sync collaborator. The context for a module lives at
    /// `<staging_dir>/<module name>`.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    /// PersistentVolumeClaim backing `staging_dir`, mounted into build Jobs
    /// (kaniko mode).
    #[serde(default = "default_staging_volume_claim")]
    pub staging_volume_claim: String,
}

fn default_docker_daemon_deployment() -> String {
    "bosun-docker-daemon".to_string()
}

fn default_buildkit_deployment() -> String {
    "bosun-buildkit".to_string()
}

fn default_kaniko_image() -> String {
    "gcr.io/kaniko-project/executor:v1.23.2".to_string()
}

fn default_staging_dir() -> String {
    "/build-staging".to_string()
}

fn default_staging_volume_claim() -> String {
    "bosun-build-staging".to_string()
}

impl ProviderConfig {
    /// Staged build context directory for a module inside in-cluster
    /// builders.
    pub fn staged_context_dir(&self, module_name: &str) -> String {
        format!("{}/{}", self.staging_dir.trim_end_matches('/'), module_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_mode_round_trip() {
        for (s, mode) in [
            ("local-docker", BuildMode::LocalDocker),
            ("cluster-docker", BuildMode::ClusterDocker),
            ("cluster-buildkit", BuildMode::ClusterBuildkit),
            ("kaniko", BuildMode::Kaniko),
        ] {
            assert_eq!(s.parse::<BuildMode>().unwrap(), mode);
            assert_eq!(mode.to_string(), s);
        }
    }

    #[test]
    fn test_build_mode_invalid() {
        let err = "podman".parse::<BuildMode>().unwrap_err();
        assert!(err.to_string().contains("invalid build mode 'podman'"));
    }

    #[test]
    fn test_registry_authority() {
        let registry = RegistryConfig {
            hostname: "registry.example.com".to_string(),
            port: None,
            namespace: None,
            insecure: false,
        };
        assert_eq!(registry.authority(), "registry.example.com");
        assert_eq!(registry.base_url(), "https://registry.example.com");

        let registry = RegistryConfig {
            hostname: "127.0.0.1".to_string(),
            port: Some(5000),
            namespace: Some("apps".to_string()),
            insecure: true,
        };
        assert_eq!(registry.authority(), "127.0.0.1:5000");
        assert_eq!(registry.base_url(), "http://127.0.0.1:5000");
    }

    #[test]
    fn test_provider_config_defaults_from_yaml() {
        let config: ProviderConfig = serde_yaml::from_str(
            "build_mode: kaniko\n\
             namespace: demo\n",
        )
        .unwrap();

        assert_eq!(config.build_mode, BuildMode::Kaniko);
        assert_eq!(config.namespace, "demo");
        assert!(config.deployment_registry.is_none());
        assert!(config.image_pull_secrets.is_empty());
        assert_eq!(config.timeouts, BuildTimeouts::default());
        assert_eq!(config.timeouts.exec(), Duration::from_secs(300));
        assert_eq!(config.docker_daemon_deployment, "bosun-docker-daemon");
        assert_eq!(config.staged_context_dir("api"), "/build-staging/api");
    }

    #[test]
    fn test_provider_config_full_from_json() {
        let config: ProviderConfig = serde_json::from_value(serde_json::json!({
            "build_mode": "cluster-docker",
            "namespace": "demo",
            "deployment_registry": {
                "hostname": "registry.demo.example.com",
                "namespace": "demo",
            },
            "image_pull_secrets": [
                {"name": "registry-creds", "namespace": "default"},
            ],
            "timeouts": {"build_secs": 3600},
        }))
        .unwrap();

        let registry = config.deployment_registry.unwrap();
        assert_eq!(registry.hostname, "registry.demo.example.com");
        assert!(!registry.insecure);
        assert_eq!(config.image_pull_secrets.len(), 1);
        assert_eq!(config.timeouts.build_secs, 3600);
        // Unspecified timeouts keep their defaults.
        assert_eq!(config.timeouts.exec_secs, 300);
    }
}
