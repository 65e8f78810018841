use crate::error::{BuildError, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;

/// Find the pod backing an in-cluster builder Deployment.
///
/// Builder Deployments label their pods `app=<deployment name>`. A Running
/// pod is preferred; with none Running the first listed pod is returned so
/// the subsequent exec surfaces the real failure.
pub(crate) async fn find_deployment_pod(
    client: Client,
    namespace: &str,
    deployment: &str,
) -> Result<String> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let params = ListParams::default().labels(&format!("app={}", deployment));
    let list = pods.list(&params).await?;

    let pod = list
        .items
        .iter()
        .find(|pod| pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running"))
        .or_else(|| list.items.first());

    match pod.and_then(|pod| pod.metadata.name.clone()) {
        Some(name) => {
            debug!("Using pod {} for deployment {}/{}", name, namespace, deployment);
            Ok(name)
        }
        None => Err(BuildError::Infrastructure(format!(
            "no pods found for deployment '{}' in namespace '{}'",
            deployment, namespace
        ))),
    }
}
