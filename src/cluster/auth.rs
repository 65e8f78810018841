// Registry credential provisioning for in-cluster builders.
//
// Build daemons and build Jobs pull private base images with credentials
// from `kubernetes.io/dockerconfigjson` Secrets in the build namespace.
// Those secrets are configured by reference and may live elsewhere, so each
// one is copied into the target namespace before a build runs.

use crate::config::PullSecretRef;
use crate::error::{BuildError, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info};

pub struct RegistryAuthProvisioner {
    client: Client,
}

impl RegistryAuthProvisioner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Ensure every referenced pull secret exists in the target namespace.
    ///
    /// Create-if-absent: a secret already present in the target namespace is
    /// left untouched, and a 409 from a concurrent provisioner is success.
    /// Idempotent across repeated calls. A reference to a nonexistent source
    /// secret is a configuration error.
    pub async fn ensure_pull_secrets(
        &self,
        namespace: &str,
        refs: &[PullSecretRef],
    ) -> Result<()> {
        for secret_ref in refs {
            self.ensure_pull_secret(namespace, secret_ref).await?;
        }
        Ok(())
    }

    async fn ensure_pull_secret(&self, namespace: &str, secret_ref: &PullSecretRef) -> Result<()> {
        let target: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        match target.get(&secret_ref.name).await {
            Ok(_) => {
                debug!(
                    "Pull secret {} already present in namespace {}",
                    secret_ref.name, namespace
                );
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let source: Api<Secret> = Api::namespaced(self.client.clone(), &secret_ref.namespace);
        let secret = match source.get(&secret_ref.name).await {
            Ok(secret) => secret,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(BuildError::Configuration(format!(
                    "pull secret '{}' does not exist in namespace '{}'",
                    secret_ref.name, secret_ref.namespace
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let copy = copied_secret(&secret, &secret_ref.name, namespace);
        match target.create(&PostParams::default(), &copy).await {
            Ok(_) => {
                info!(
                    "Copied pull secret {} from namespace {} to {}",
                    secret_ref.name, secret_ref.namespace, namespace
                );
                Ok(())
            }
            // Concurrent build provisioned the same secret first. Content is
            // identical across callers, so losing the race is fine.
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(
                    "Pull secret {} concurrently created in namespace {}",
                    secret_ref.name, namespace
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// A clean copy of a secret for recreation in another namespace.
///
/// The dockerconfigjson payload is opaque and carried over byte for byte,
/// whether it holds `auths` entries or `credHelpers`. Only identifying
/// metadata is reset.
fn copied_secret(source: &Secret, name: &str, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: source.metadata.labels.clone(),
            ..Default::default()
        },
        type_: source.type_.clone(),
        data: source.data.clone(),
        immutable: source.immutable,
        ..Default::default()
    }
}
