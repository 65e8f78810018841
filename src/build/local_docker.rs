// local-docker strategy: build with the developer's Docker engine and, when
// a deployment registry is configured, tag and push the result there.

use crate::build::docker_config::DockerConfigAuth;
use crate::build::{BuildDriver, BuildResult, BuildStatus};
use crate::config::ProviderConfig;
use crate::context::BuildContext;
use crate::error::{classify_build_failure, BuildError, Result};
use async_trait::async_trait;
use bollard::image::{BuildImageOptions, PushImageOptions, TagImageOptions};
use bollard::Docker;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub(crate) struct LocalDockerDriver<'a> {
    config: &'a ProviderConfig,
    docker: Docker,
}

impl<'a> LocalDockerDriver<'a> {
    pub(crate) fn new(config: &'a ProviderConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { config, docker })
    }

    async fn run_build(&self, ctx: &BuildContext, cancel: &CancellationToken) -> Result<BuildResult> {
        let module = &ctx.module;
        info!("Building module {} with the local Docker engine", module.name);

        let archive =
            build_context_archive(&module.build_path, module.dockerfile.as_deref())?;
        let local_ref = ctx.identity.local_ref();

        let options = BuildImageOptions {
            dockerfile: "Dockerfile",
            t: local_ref.as_str(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let body = Bytes::from(archive);
        let mut stream = self.docker.build_image(options, None, Some(body));

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(BuildError::Cancelled {
                        operation: format!("build of module '{}'", module.name),
                    });
                }
                message = stream.next() => match message {
                    Some(message) => message?,
                    None => break,
                },
            };

            if let Some(output) = &message.stream {
                for line in output.lines() {
                    ctx.log.append(line);
                }
            }
            if let Some(status) = &message.status {
                ctx.log.append(status);
            }
            if let Some(error) = message.error {
                let detail = message
                    .error_detail
                    .and_then(|d| d.message)
                    .unwrap_or_else(|| error.clone());
                return Err(classify_build_failure(
                    &module.name,
                    self.config.build_mode,
                    &detail,
                    &ctx.log.contents(),
                ));
            }
        }

        info!("Built {}", local_ref);

        if let Some(authority) = ctx.identity.registry_authority() {
            self.tag_and_push(ctx, &authority, cancel).await?;
        }

        Ok(BuildResult {
            fresh: true,
            build_log: Some(ctx.log.contents()),
        })
    }

    /// Tag the locally built image for the deployment registry and push it.
    async fn tag_and_push(
        &self,
        ctx: &BuildContext,
        authority: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let repository = ctx.identity.deployed_repository();
        let tag = ctx.identity.tag.as_str();

        self.docker
            .tag_image(
                &ctx.identity.local_ref(),
                Some(TagImageOptions {
                    repo: repository.as_str(),
                    tag,
                }),
            )
            .await?;

        let credentials = DockerConfigAuth::new().credentials_for(authority)?;
        let mut stream =
            self.docker
                .push_image(&repository, Some(PushImageOptions { tag }), credentials);

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(BuildError::Cancelled {
                        operation: format!("push of module '{}'", ctx.module.name),
                    });
                }
                message = stream.next() => match message {
                    Some(message) => message?,
                    None => break,
                },
            };

            if let Some(status) = &message.status {
                ctx.log.append(status);
            }
            if let Some(error) = message.error {
                return Err(BuildError::BuildFailed {
                    module: ctx.module.name.clone(),
                    mode: self.config.build_mode,
                    message: format!("push of {} failed: {}", ctx.identity.deployed_ref(), error),
                    log: ctx.log.contents(),
                });
            }
        }

        info!("Pushed {}", ctx.identity.deployed_ref());
        Ok(())
    }
}

#[async_trait]
impl BuildDriver for LocalDockerDriver<'_> {
    async fn status(&self, ctx: &BuildContext) -> Result<BuildStatus> {
        let reference = ctx.identity.deployed_ref();
        match self.docker.inspect_image(&reference).await {
            Ok(_) => Ok(BuildStatus::ready()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(BuildStatus::not_ready(format!(
                "image {} not found in the local image store",
                reference
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn build(&self, ctx: &BuildContext, cancel: &CancellationToken) -> Result<BuildResult> {
        let deadline = self.config.timeouts.build();
        match tokio::time::timeout(deadline, self.run_build(ctx, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(BuildError::Timeout {
                operation: format!("local docker build of module '{}'", ctx.module.name),
                seconds: deadline.as_secs(),
            }),
        }
    }

    async fn remove_image(&self, ctx: &BuildContext) -> Result<()> {
        match self
            .docker
            .remove_image(&ctx.identity.deployed_ref(), None, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Package a module build directory as the gzipped tar the engine API
/// expects. A configured custom dockerfile is staged into the archive root
/// as `Dockerfile`, shadowing any file of that name in the context.
fn build_context_archive(context_dir: &Path, dockerfile: Option<&str>) -> Result<Vec<u8>> {
    if !context_dir.is_dir() {
        return Err(BuildError::Configuration(format!(
            "build context '{}' is not a directory",
            context_dir.display()
        )));
    }

    let mut archive = Vec::new();
    let encoder = GzEncoder::new(&mut archive, Compression::default());
    let mut tar = tar::Builder::new(encoder);

    tar.append_dir_all(".", context_dir)?;

    if let Some(dockerfile) = dockerfile {
        let contents = std::fs::read(context_dir.join(dockerfile))?;
        let mut header = tar::Header::new_gnu();
        header.set_path("Dockerfile")?;
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append(&header, contents.as_slice())?;
    }

    let encoder = tar.into_inner()?;
    encoder.finish()?;

    debug!(
        "Build context for {} is {} bytes",
        context_dir.display(),
        archive.len()
    );
    Ok(archive)
}
