// Canonical image identity resolution.
//
// Resolution is a pure function of the module and the registry
// configuration. The scheduler relies on this determinism to skip builds
// whenever the prober reports an existing image at the computed identity,
// so nothing here may read the environment or the cluster.

use crate::config::RegistryConfig;
use crate::module::Module;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical, version-qualified name of a built image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageIdentity {
    /// Bare repository name (the module name).
    pub repository: String,
    /// Always the module version.
    pub tag: String,
    /// Deployment registry host; unset for local-only identities.
    #[serde(default)]
    pub registry_host: Option<String>,
    #[serde(default)]
    pub registry_port: Option<u16>,
    #[serde(default)]
    pub registry_namespace: Option<String>,
}

/// Resolve the image identity for a module under the given registry
/// configuration.
pub fn resolve_identity(module: &Module, registry: Option<&RegistryConfig>) -> ImageIdentity {
    ImageIdentity {
        repository: module.name.clone(),
        tag: module.version.to_string(),
        registry_host: registry.map(|r| r.hostname.clone()),
        registry_port: registry.and_then(|r| r.port),
        registry_namespace: registry.and_then(|r| r.namespace.clone()),
    }
}

impl ImageIdentity {
    /// `name:version`, as known to a local engine without a registry.
    pub fn local_ref(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// `host` or `host:port` of the deployment registry, if configured.
    pub fn registry_authority(&self) -> Option<String> {
        self.registry_host.as_ref().map(|host| match self.registry_port {
            Some(port) => format!("{}:{}", host, port),
            None => host.clone(),
        })
    }

    /// Repository path used in registry API calls and registry-side tags:
    /// `namespace/name`, or just `name` when no namespace is configured.
    pub fn remote_repository(&self) -> String {
        match &self.registry_namespace {
            Some(ns) => format!("{}/{}", ns, self.repository),
            None => self.repository.clone(),
        }
    }

    /// The reference images are tagged with when deployed: registry
    /// qualified (`host[:port]/namespace/name:version`) when a deployment
    /// registry is configured, otherwise the local reference.
    pub fn deployed_ref(&self) -> String {
        match self.registry_authority() {
            Some(authority) => format!("{}/{}:{}", authority, self.remote_repository(), self.tag),
            None => self.local_ref(),
        }
    }

    /// Registry-qualified repository without the tag, for `docker tag`.
    pub fn deployed_repository(&self) -> String {
        match self.registry_authority() {
            Some(authority) => format!("{}/{}", authority, self.remote_repository()),
            None => self.repository.clone(),
        }
    }
}

impl fmt::Display for ImageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.deployed_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleVersion;

    fn module(name: &str, version: &str) -> Module {
        Module::new(name, "/tmp/does-not-matter", ModuleVersion::new(version))
    }

    fn registry(host: &str, port: Option<u16>, namespace: Option<&str>) -> RegistryConfig {
        RegistryConfig {
            hostname: host.to_string(),
            port,
            namespace: namespace.map(str::to_string),
            insecure: false,
        }
    }

    #[test]
    fn test_local_identity() {
        let identity = resolve_identity(&module("simple-service", "v-9cfd748cd2"), None);
        assert_eq!(identity.local_ref(), "simple-service:v-9cfd748cd2");
        assert_eq!(identity.deployed_ref(), "simple-service:v-9cfd748cd2");
        assert_eq!(identity.registry_authority(), None);
    }

    #[test]
    fn test_registry_identity_with_namespace_and_port() {
        let registry = registry("127.0.0.1", Some(5000), Some("demo"));
        let identity = resolve_identity(&module("api", "v-5a6db2d124"), Some(&registry));
        assert_eq!(identity.deployed_ref(), "127.0.0.1:5000/demo/api:v-5a6db2d124");
        assert_eq!(identity.deployed_repository(), "127.0.0.1:5000/demo/api");
        assert_eq!(identity.remote_repository(), "demo/api");
        assert_eq!(identity.local_ref(), "api:v-5a6db2d124");
    }

    #[test]
    fn test_registry_identity_without_namespace() {
        let registry = registry("registry.example.com", None, None);
        let identity = resolve_identity(&module("api", "v-5a6db2d124"), Some(&registry));
        assert_eq!(identity.deployed_ref(), "registry.example.com/api:v-5a6db2d124");
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let registry = registry("registry.example.com", Some(443), Some("team"));
        let a = resolve_identity(&module("worker", "v-0000000000"), Some(&registry));
        let b = resolve_identity(&module("worker", "v-0000000000"), Some(&registry));
        assert_eq!(a, b);
        assert_eq!(a.deployed_ref(), b.deployed_ref());
    }

    #[test]
    fn test_display_matches_deployed_ref() {
        let identity = resolve_identity(&module("web", "v-12ab34cd56"), None);
        assert_eq!(identity.to_string(), identity.deployed_ref());
    }
}
