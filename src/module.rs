use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Content hash identifying a module's build inputs (source files plus
/// build-time dependency versions). Computed by the scheduler, opaque here.
///
/// Two builds with equal versions and equal registry configuration resolve
/// to identical image identities, which is what makes build skipping safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleVersion(String);

impl ModuleVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A buildable source module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    /// Local build context directory.
    pub build_path: PathBuf,
    /// Dockerfile path relative to `build_path`. Defaults to `Dockerfile`
    /// at the context root when unset.
    #[serde(default)]
    pub dockerfile: Option<String>,
    pub version: ModuleVersion,
}

impl Module {
    pub fn new(name: impl Into<String>, build_path: impl Into<PathBuf>, version: ModuleVersion) -> Self {
        Self {
            name: name.into(),
            build_path: build_path.into(),
            dockerfile: None,
            version,
        }
    }
}
