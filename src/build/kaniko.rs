// kaniko strategy: dispatch a dedicated, short-lived build Job that runs
// the kaniko executor against the staged context and pushes the result to
// the deployment registry. The Job is this subsystem's own resource; it is
// deleted after completion, on timeout, and on cancellation.

use crate::build::{BuildDriver, BuildResult, BuildStatus};
use crate::config::{ProviderConfig, RegistryConfig};
use crate::context::BuildContext;
use crate::error::{classify_build_failure, BuildError, Result};
use crate::registry::RegistryClient;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, KeyToPath, PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::runtime::wait::await_condition;
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const KANIKO_CONTAINER: &str = "kaniko";

pub(crate) struct KanikoDriver<'a> {
    config: &'a ProviderConfig,
    registry: &'a RegistryConfig,
    client: Client,
}

impl<'a> KanikoDriver<'a> {
    pub(crate) fn new(
        config: &'a ProviderConfig,
        registry: &'a RegistryConfig,
        client: Client,
    ) -> Self {
        Self {
            config,
            registry,
            client,
        }
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn delete_job(&self, namespace: &str, name: &str) {
        let jobs = self.jobs(namespace);
        match jobs.delete(name, &DeleteParams::background()).await {
            Ok(_) => debug!("Deleted build job {}", name),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => warn!("Failed to delete build job {}: {}", name, e),
        }
    }

    /// Remove a leftover Job from an interrupted earlier attempt and wait
    /// for it to be gone, so the fresh create below doesn't collide.
    async fn ensure_job_absent(&self, namespace: &str, name: &str) -> Result<()> {
        let jobs = self.jobs(namespace);
        match jobs.delete(name, &DeleteParams::background()).await {
            Ok(_) => debug!("Removing stale build job {}", name),
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        for _ in 0..30 {
            match jobs.get(name).await {
                Ok(_) => tokio::time::sleep(Duration::from_secs(1)).await,
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        Err(BuildError::Infrastructure(format!(
            "stale build job {} was not cleaned up in time",
            name
        )))
    }

    /// Logs of the Job's pod. Log retrieval failure never masks the build
    /// outcome, it just leaves the log empty.
    async fn job_logs(&self, namespace: &str, job_name: &str) -> String {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("job-name={}", job_name));
        let pod = match pods.list(&params).await {
            Ok(list) => list.items.into_iter().next().and_then(|pod| pod.metadata.name),
            Err(e) => {
                warn!("Failed to list pods of build job {}: {}", job_name, e);
                None
            }
        };
        let Some(pod) = pod else {
            return String::new();
        };
        let params = LogParams {
            container: Some(KANIKO_CONTAINER.to_string()),
            ..Default::default()
        };
        match pods.logs(&pod, &params).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!("Failed to fetch logs of build job {}: {}", job_name, e);
                String::new()
            }
        }
    }
}

#[async_trait]
impl BuildDriver for KanikoDriver<'_> {
    async fn status(&self, ctx: &BuildContext) -> Result<BuildStatus> {
        let client = RegistryClient::new(self.config.timeouts.registry())?;
        if client.manifest_exists(self.registry, &ctx.identity).await? {
            Ok(BuildStatus::ready())
        } else {
            Ok(BuildStatus::not_ready(format!(
                "no manifest for {} in the deployment registry",
                ctx.identity.deployed_ref()
            )))
        }
    }

    async fn build(&self, ctx: &BuildContext, cancel: &CancellationToken) -> Result<BuildResult> {
        let module = &ctx.module;
        let job_name = kaniko_job_name(&module.name, &ctx.identity.tag);
        info!(
            "Building module {} with build job {} in namespace {}",
            module.name, job_name, ctx.namespace
        );

        self.ensure_job_absent(&ctx.namespace, &job_name).await?;

        let job = kaniko_job(
            &job_name,
            &ctx.namespace,
            self.config,
            &module.name,
            module.dockerfile.as_deref(),
            &ctx.identity.deployed_ref(),
            self.registry.insecure,
        );
        let jobs = self.jobs(&ctx.namespace);
        jobs.create(&PostParams::default(), &job).await?;

        let deadline = self.config.timeouts.job();
        let wait = tokio::time::timeout(deadline, await_condition(jobs.clone(), &job_name, job_finished));
        let finished = tokio::select! {
            result = wait => match result {
                Ok(Ok(job)) => job,
                Ok(Err(e)) => {
                    self.delete_job(&ctx.namespace, &job_name).await;
                    return Err(BuildError::Infrastructure(format!(
                        "watch on build job {} failed: {}",
                        job_name, e
                    )));
                }
                Err(_) => {
                    self.delete_job(&ctx.namespace, &job_name).await;
                    return Err(BuildError::Timeout {
                        operation: format!("build job {} for module '{}'", job_name, module.name),
                        seconds: deadline.as_secs(),
                    });
                }
            },
            _ = cancel.cancelled() => {
                self.delete_job(&ctx.namespace, &job_name).await;
                return Err(BuildError::Cancelled {
                    operation: format!("build job {} for module '{}'", job_name, module.name),
                });
            }
        };

        let logs = self.job_logs(&ctx.namespace, &job_name).await;
        for line in logs.lines() {
            ctx.log.append(line);
        }

        let succeeded = finished
            .as_ref()
            .and_then(|job| job.status.as_ref())
            .and_then(|status| status.succeeded)
            .unwrap_or(0)
            > 0;

        self.delete_job(&ctx.namespace, &job_name).await;

        if !succeeded {
            return Err(classify_build_failure(
                &module.name,
                self.config.build_mode,
                "build job failed",
                &logs,
            ));
        }

        info!("Built and pushed {}", ctx.identity.deployed_ref());
        Ok(BuildResult {
            fresh: true,
            build_log: Some(ctx.log.contents()),
        })
    }
}

fn job_finished(job: Option<&Job>) -> bool {
    job.and_then(|job| job.status.as_ref())
        .map(|status| status.succeeded.unwrap_or(0) > 0 || status.failed.unwrap_or(0) > 0)
        .unwrap_or(false)
}

/// Job name for a module build. Deterministic per version so a retried
/// dispatch of the same build maps onto the same resource.
fn kaniko_job_name(module: &str, tag: &str) -> String {
    let tag: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let mut name: String = format!("kaniko-{}-{}", module, tag).chars().take(63).collect();
    while name.ends_with('-') {
        name.pop();
    }
    name
}

/// Manifest for a kaniko build Job.
fn kaniko_job(
    name: &str,
    namespace: &str,
    config: &ProviderConfig,
    module_name: &str,
    dockerfile: Option<&str>,
    destination: &str,
    insecure_registry: bool,
) -> Job {
    let context_dir = config.staged_context_dir(module_name);

    let mut args = vec![
        format!("--dockerfile={}", dockerfile.unwrap_or("Dockerfile")),
        format!("--context=dir://{}", context_dir),
        format!("--destination={}", destination),
    ];
    if insecure_registry {
        args.push("--insecure".to_string());
    }

    let mut volumes = vec![Volume {
        name: "build-staging".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: config.staging_volume_claim.clone(),
            read_only: Some(true),
        }),
        ..Default::default()
    }];
    let mut volume_mounts = vec![VolumeMount {
        name: "build-staging".to_string(),
        mount_path: config.staging_dir.clone(),
        read_only: Some(true),
        ..Default::default()
    }];

    // kaniko reads registry credentials from /kaniko/.docker/config.json.
    // The secret was provisioned into this namespace before the build.
    if let Some(pull_secret) = config.image_pull_secrets.first() {
        volumes.push(Volume {
            name: "registry-auth".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(pull_secret.name.clone()),
                items: Some(vec![KeyToPath {
                    key: ".dockerconfigjson".to_string(),
                    path: "config.json".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "registry-auth".to_string(),
            mount_path: "/kaniko/.docker".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "bosun-kaniko".to_string());
    labels.insert("bosun.dev/module".to_string(), module_name.to_string());

    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: KANIKO_CONTAINER.to_string(),
                        image: Some(config.kaniko_image.clone()),
                        args: Some(args),
                        volume_mounts: Some(volume_mounts),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::JobStatus;

    fn config(pull_secret: bool) -> ProviderConfig {
        let mut value = serde_json::json!({
            "build_mode": "kaniko",
            "namespace": "demo",
            "deployment_registry": {"hostname": "registry.local", "port": 5000},
        });
        if pull_secret {
            value["image_pull_secrets"] =
                serde_json::json!([{"name": "registry-creds", "namespace": "default"}]);
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_job_name_is_sanitized_and_bounded() {
        let name = kaniko_job_name("api", "v-5A6DB2D124");
        assert_eq!(name, "kaniko-api-v-5a6db2d124");

        let long = kaniko_job_name("a-module-with-a-rather-long-name", &"v".repeat(80));
        assert!(long.len() <= 63);
        assert!(!long.ends_with('-'));
    }

    #[test]
    fn test_job_manifest_arguments() {
        let job = kaniko_job(
            "kaniko-api-v-1",
            "demo",
            &config(false),
            "api",
            None,
            "registry.local:5000/api:v-1",
            false,
        );

        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let args = pod.containers[0].args.as_ref().unwrap();
        assert!(args.contains(&"--dockerfile=Dockerfile".to_string()));
        assert!(args.contains(&"--context=dir:///build-staging/api".to_string()));
        assert!(args.contains(&"--destination=registry.local:5000/api:v-1".to_string()));
        assert!(!args.iter().any(|arg| arg == "--insecure"));

        // No pull secrets configured: only the staging volume is mounted.
        assert_eq!(pod.volumes.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_job_manifest_mounts_registry_auth() {
        let job = kaniko_job(
            "kaniko-api-v-1",
            "demo",
            &config(true),
            "api",
            Some("prod.dockerfile"),
            "127.0.0.1:5000/api:v-1",
            true,
        );

        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let args = pod.containers[0].args.as_ref().unwrap();
        assert!(args.contains(&"--dockerfile=prod.dockerfile".to_string()));
        assert!(args.contains(&"--insecure".to_string()));

        let volumes = pod.volumes.as_ref().unwrap();
        let auth = volumes.iter().find(|v| v.name == "registry-auth").unwrap();
        let secret = auth.secret.as_ref().unwrap();
        assert_eq!(secret.secret_name.as_deref(), Some("registry-creds"));
        assert_eq!(secret.items.as_ref().unwrap()[0].path, "config.json");

        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert!(mounts
            .iter()
            .any(|m| m.name == "registry-auth" && m.mount_path == "/kaniko/.docker"));
    }

    #[test]
    fn test_job_finished_condition() {
        assert!(!job_finished(None));
        assert!(!job_finished(Some(&Job::default())));

        let running = Job {
            status: Some(JobStatus {
                active: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!job_finished(Some(&running)));

        let failed = Job {
            status: Some(JobStatus {
                failed: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(job_finished(Some(&failed)));

        let succeeded = Job {
            status: Some(JobStatus {
                succeeded: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(job_finished(Some(&succeeded)));
    }
}
