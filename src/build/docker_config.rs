// Push credentials for the local Docker engine.
//
// local-docker builds push with whatever the developer's `docker login`
// state provides: `auths` entries in the Docker config file, or a
// credential helper (`credsStore` / per-registry `credHelpers`).

use crate::error::{BuildError, Result};
use base64::Engine;
use bollard::auth::DockerCredentials;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(default)]
    creds_store: Option<String>,
    #[serde(default)]
    cred_helpers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    /// Base64 `username:password`.
    auth: Option<String>,
}

pub(crate) struct DockerConfigAuth {
    config_path: PathBuf,
}

impl DockerConfigAuth {
    pub(crate) fn new() -> Self {
        let config_path = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|home| home.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            })
            .join("config.json");
        Self { config_path }
    }

    #[cfg(test)]
    fn with_config_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// Credentials for a registry authority (`host` or `host:port`), or
    /// `None` for anonymous push.
    pub(crate) fn credentials_for(&self, registry: &str) -> Result<Option<DockerCredentials>> {
        if !self.config_path.exists() {
            debug!("No Docker config at {:?}, pushing anonymously", self.config_path);
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&self.config_path)?;
        let config: DockerConfigFile = serde_json::from_str(&contents).map_err(|e| {
            BuildError::Configuration(format!(
                "failed to parse {}: {}",
                self.config_path.display(),
                e
            ))
        })?;

        if let Some(entry) = config.auths.get(registry) {
            if let Some(auth) = &entry.auth {
                if let Some(credentials) = decode_auth(auth, registry)? {
                    debug!("Using stored credentials for {}", registry);
                    return Ok(Some(credentials));
                }
            }
        }

        if let Some(helper) = helper_for(&config, registry) {
            debug!("Using credential helper {} for {}", helper, registry);
            return run_credential_helper(&helper, registry);
        }

        debug!("No credentials found for {}", registry);
        Ok(None)
    }
}

/// Credential helper for a registry: the per-registry `credHelpers` entry
/// wins over the global `credsStore`.
fn helper_for(config: &DockerConfigFile, registry: &str) -> Option<String> {
    config
        .cred_helpers
        .get(registry)
        .cloned()
        .or_else(|| config.creds_store.clone())
}

fn decode_auth(auth_b64: &str, registry: &str) -> Result<Option<DockerCredentials>> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth_b64)
        .map_err(|e| {
            BuildError::Configuration(format!("invalid auth entry for {}: {}", registry, e))
        })?;
    let auth = String::from_utf8(decoded).map_err(|e| {
        BuildError::Configuration(format!("invalid auth entry for {}: {}", registry, e))
    })?;

    Ok(auth.split_once(':').map(|(username, password)| DockerCredentials {
        username: Some(username.to_string()),
        password: Some(password.to_string()),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    }))
}

fn run_credential_helper(helper: &str, registry: &str) -> Result<Option<DockerCredentials>> {
    #[derive(Deserialize)]
    #[serde(rename_all = "PascalCase")]
    struct HelperResponse {
        username: String,
        secret: String,
    }

    let helper_cmd = format!("docker-credential-{}", helper);
    let mut child = Command::new(&helper_cmd)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            BuildError::Configuration(format!("failed to run {}: {}", helper_cmd, e))
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(registry.as_bytes()).ok();
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        // The helper has no credentials for this registry.
        debug!(
            "{} returned an error for {}: {}",
            helper_cmd,
            registry,
            String::from_utf8_lossy(&output.stderr)
        );
        return Ok(None);
    }

    let response: HelperResponse = serde_json::from_slice(&output.stdout).map_err(|e| {
        BuildError::Configuration(format!("invalid response from {}: {}", helper_cmd, e))
    })?;

    Ok(Some(DockerCredentials {
        username: Some(response.username),
        password: Some(response.secret),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_from_auths_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        // "user:pass"
        std::fs::write(
            &path,
            r#"{"auths":{"registry.example.com":{"auth":"dXNlcjpwYXNz"}}}"#,
        )
        .unwrap();

        let auth = DockerConfigAuth::with_config_path(path);
        let credentials = auth.credentials_for("registry.example.com").unwrap().unwrap();
        assert_eq!(credentials.username.as_deref(), Some("user"));
        assert_eq!(credentials.password.as_deref(), Some("pass"));
        assert_eq!(
            credentials.serveraddress.as_deref(),
            Some("registry.example.com")
        );
    }

    #[test]
    fn test_missing_config_is_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let auth = DockerConfigAuth::with_config_path(dir.path().join("config.json"));
        assert!(auth.credentials_for("registry.example.com").unwrap().is_none());
    }

    #[test]
    fn test_unknown_registry_is_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"auths":{"other.example.com":{"auth":"dXNlcjpwYXNz"}}}"#)
            .unwrap();

        let auth = DockerConfigAuth::with_config_path(path);
        assert!(auth.credentials_for("registry.example.com").unwrap().is_none());
    }

    #[test]
    fn test_helper_selection_prefers_per_registry_entry() {
        let config: DockerConfigFile = serde_json::from_str(
            r#"{
                "credsStore": "desktop",
                "credHelpers": {"123456.dkr.ecr.us-east-1.amazonaws.com": "ecr-login"}
            }"#,
        )
        .unwrap();

        assert_eq!(
            helper_for(&config, "123456.dkr.ecr.us-east-1.amazonaws.com").as_deref(),
            Some("ecr-login")
        );
        assert_eq!(helper_for(&config, "ghcr.io").as_deref(), Some("desktop"));
    }
}
