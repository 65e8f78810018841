use crate::config::ProviderConfig;
use crate::identity::{resolve_identity, ImageIdentity};
use crate::log::BuildLog;
use crate::module::Module;

/// Per-invocation build state.
///
/// Constructed fresh by the orchestrator for every status or build call and
/// owned exclusively by it. Nothing in here is shared across concurrent
/// builds, which is what keeps concurrent invocations for distinct modules
/// independent.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub module: Module,
    /// Namespace holding in-cluster build resources.
    pub namespace: String,
    pub identity: ImageIdentity,
    pub log: BuildLog,
}

impl BuildContext {
    pub(crate) fn new(module: &Module, config: &ProviderConfig) -> Self {
        Self {
            module: module.clone(),
            namespace: config.namespace.clone(),
            identity: resolve_identity(module, config.deployment_registry.as_ref()),
            log: BuildLog::new(),
        }
    }
}
