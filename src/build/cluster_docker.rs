// cluster-docker strategy: drive a Docker daemon running inside the target
// cluster through pod exec, against a build context staged there by the
// sync collaborator.

use crate::build::{BuildDriver, BuildResult, BuildStatus};
use crate::cluster::{find_deployment_pod, PodExecutor};
use crate::config::ProviderConfig;
use crate::context::BuildContext;
use crate::error::{classify_build_failure, BuildError, Result};
use crate::registry::RegistryClient;
use async_trait::async_trait;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Container name inside the daemon pod.
const DOCKER_DAEMON_CONTAINER: &str = "docker-daemon";

pub(crate) struct ClusterDockerDriver<'a> {
    config: &'a ProviderConfig,
    client: Client,
}

impl<'a> ClusterDockerDriver<'a> {
    pub(crate) fn new(config: &'a ProviderConfig, client: Client) -> Self {
        Self { config, client }
    }

    async fn daemon_pod(&self, ctx: &BuildContext) -> Result<String> {
        find_deployment_pod(
            self.client.clone(),
            &ctx.namespace,
            &self.config.docker_daemon_deployment,
        )
        .await
    }

    fn executor(&self, ctx: &BuildContext) -> PodExecutor {
        PodExecutor::new(self.client.clone(), &ctx.namespace)
    }
}

#[async_trait]
impl BuildDriver for ClusterDockerDriver<'_> {
    /// Check the daemon's local image store first; when a deployment
    /// registry is configured, an image missing from the daemon may still
    /// have been pushed, so fall through to a registry manifest check.
    async fn status(&self, ctx: &BuildContext) -> Result<BuildStatus> {
        let reference = ctx.identity.deployed_ref();
        let pod = self.daemon_pod(ctx).await?;

        let output = self
            .executor(ctx)
            .exec(
                &pod,
                Some(DOCKER_DAEMON_CONTAINER),
                &docker_images_command(&reference),
                self.config.timeouts.exec(),
                &CancellationToken::new(),
                None,
            )
            .await?;

        if !output.success() {
            return Err(BuildError::Infrastructure(format!(
                "image listing in daemon pod {} failed: {}",
                pod,
                output.output.trim()
            )));
        }

        if !output.output.trim().is_empty() {
            return Ok(BuildStatus::ready());
        }

        if let Some(registry) = &self.config.deployment_registry {
            debug!(
                "Image {} not in the in-cluster daemon, checking deployment registry",
                reference
            );
            let client = RegistryClient::new(self.config.timeouts.registry())?;
            if client.manifest_exists(registry, &ctx.identity).await? {
                return Ok(BuildStatus::ready());
            }
        }

        Ok(BuildStatus::not_ready(format!(
            "image {} not found in the in-cluster daemon",
            reference
        )))
    }

    async fn build(&self, ctx: &BuildContext, cancel: &CancellationToken) -> Result<BuildResult> {
        let module = &ctx.module;
        let reference = ctx.identity.deployed_ref();
        let context_dir = self.config.staged_context_dir(&module.name);
        info!(
            "Building module {} in the in-cluster Docker daemon from {}",
            module.name, context_dir
        );

        let pod = self.daemon_pod(ctx).await?;
        let executor = self.executor(ctx);

        let output = executor
            .exec(
                &pod,
                Some(DOCKER_DAEMON_CONTAINER),
                &docker_build_command(&reference, module.dockerfile.as_deref(), &context_dir),
                self.config.timeouts.build(),
                cancel,
                Some(&ctx.log),
            )
            .await?;

        if !output.success() {
            return Err(classify_build_failure(
                &module.name,
                self.config.build_mode,
                &format!("docker build exited with code {}", output.exit_code),
                &output.output,
            ));
        }

        if self.config.deployment_registry.is_some() {
            let output = executor
                .exec(
                    &pod,
                    Some(DOCKER_DAEMON_CONTAINER),
                    &docker_push_command(&reference),
                    self.config.timeouts.build(),
                    cancel,
                    Some(&ctx.log),
                )
                .await?;

            if !output.success() {
                return Err(BuildError::BuildFailed {
                    module: module.name.clone(),
                    mode: self.config.build_mode,
                    message: format!("docker push exited with code {}", output.exit_code),
                    log: output.output,
                });
            }
            info!("Pushed {}", reference);
        }

        Ok(BuildResult {
            fresh: true,
            build_log: Some(ctx.log.contents()),
        })
    }

    /// Remove the image from the daemon's local store. The registry copy,
    /// if any, is left alone.
    async fn remove_image(&self, ctx: &BuildContext) -> Result<()> {
        let pod = self.daemon_pod(ctx).await?;
        let output = self
            .executor(ctx)
            .exec(
                &pod,
                Some(DOCKER_DAEMON_CONTAINER),
                &docker_rmi_command(&ctx.identity.deployed_ref()),
                self.config.timeouts.exec(),
                &CancellationToken::new(),
                None,
            )
            .await?;

        // `docker rmi` on a missing image is not a failure worth surfacing.
        if !output.success() && !output.output.contains("No such image") {
            return Err(BuildError::Infrastructure(format!(
                "failed to remove {} from daemon pod {}: {}",
                ctx.identity.deployed_ref(),
                pod,
                output.output.trim()
            )));
        }
        Ok(())
    }
}

fn docker_images_command(reference: &str) -> Vec<String> {
    vec![
        "docker".to_string(),
        "images".to_string(),
        "-q".to_string(),
        reference.to_string(),
    ]
}

fn docker_build_command(
    reference: &str,
    dockerfile: Option<&str>,
    context_dir: &str,
) -> Vec<String> {
    let mut command = vec![
        "docker".to_string(),
        "build".to_string(),
        "-t".to_string(),
        reference.to_string(),
    ];
    if let Some(dockerfile) = dockerfile {
        command.push("-f".to_string());
        command.push(format!("{}/{}", context_dir, dockerfile));
    }
    command.push(context_dir.to_string());
    command
}

fn docker_push_command(reference: &str) -> Vec<String> {
    vec![
        "docker".to_string(),
        "push".to_string(),
        reference.to_string(),
    ]
}

fn docker_rmi_command(reference: &str) -> Vec<String> {
    vec![
        "docker".to_string(),
        "rmi".to_string(),
        reference.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_command() {
        let command = docker_build_command(
            "registry.local:5000/demo/api:v-5a6db2d124",
            None,
            "/build-staging/api",
        );
        assert_eq!(
            command,
            vec![
                "docker",
                "build",
                "-t",
                "registry.local:5000/demo/api:v-5a6db2d124",
                "/build-staging/api",
            ]
        );
    }

    #[test]
    fn test_build_command_with_custom_dockerfile() {
        let command = docker_build_command("api:v-1", Some("prod.dockerfile"), "/build-staging/api");
        assert_eq!(
            command,
            vec![
                "docker",
                "build",
                "-t",
                "api:v-1",
                "-f",
                "/build-staging/api/prod.dockerfile",
                "/build-staging/api",
            ]
        );
    }

    #[test]
    fn test_images_and_push_commands() {
        assert_eq!(
            docker_images_command("api:v-1"),
            vec!["docker", "images", "-q", "api:v-1"]
        );
        assert_eq!(
            docker_push_command("registry.local/api:v-1"),
            vec!["docker", "push", "registry.local/api:v-1"]
        );
        assert_eq!(
            docker_rmi_command("api:v-1"),
            vec!["docker", "rmi", "api:v-1"]
        );
    }
}
