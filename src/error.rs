use crate::config::BuildMode;
use thiserror::Error;

/// Error taxonomy of the build engine.
///
/// "Artifact not found" is never an error. Status probes report it through
/// `BuildStatus::ready`, and only genuine infrastructure failures surface
/// here. Retry policy belongs to the caller; nothing in this crate retries.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The registry rejected a base image pull for lack of credentials.
    /// Distinct from `BuildFailed` because its remediation (registry auth)
    /// differs from a broken build.
    #[error("pull access denied while building module '{module}' ({mode}): {denial}\n{log}")]
    PullAccessDenied {
        module: String,
        mode: BuildMode,
        /// The backend-native denial string that was matched.
        denial: String,
        log: String,
    },

    /// The build command or Job exited non-zero for reasons other than pull
    /// authorization. Carries the captured build output.
    #[error("build of module '{module}' ({mode}) failed: {message}\n{log}")]
    BuildFailed {
        module: String,
        mode: BuildMode,
        message: String,
        log: String,
    },

    /// An exec, poll, or registry call exceeded its configured bound.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// The caller cancelled the operation.
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },

    /// Transport-level failure reaching the registry.
    #[error("registry {host} is unreachable: {message}")]
    RegistryUnreachable { host: String, message: String },

    /// The registry answered with an unexpected status.
    #[error("registry {host} returned status {status} for {reference}: {message}")]
    Registry {
        host: String,
        status: u16,
        reference: String,
        message: String,
    },

    /// Transport-level failure reaching the cluster API.
    #[error("cluster API request failed: {0}")]
    Cluster(#[from] kube::Error),

    /// Transport-level failure reaching the Docker engine.
    #[error("docker engine request failed: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Cluster state that should exist does not (missing daemon pod, exec
    /// channel closed without a status frame).
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BuildError>;

// Backend-native substrings that indicate a registry denied a base image
// pull. Classification is string matching by necessity; keeping the tables
// here, one per backend, is what keeps call sites from growing their own
// ad-hoc checks.

/// Docker engine and docker CLI (local-docker, cluster-docker).
const DOCKER_DENIAL_MARKERS: &[&str] = &[
    "pull access denied",
    "unauthorized: authentication required",
    "no basic auth credentials",
];

/// Kaniko executor Job logs.
const KANIKO_DENIAL_MARKERS: &[&str] = &[
    "UNAUTHORIZED",
    "unauthorized to access repository",
    "403 Forbidden",
];

/// buildctl / buildkitd step trace.
const BUILDKIT_DENIAL_MARKERS: &[&str] = &[
    "failed to authorize",
    "401 Unauthorized",
    "pull access denied",
];

fn denial_markers(mode: BuildMode) -> &'static [&'static str] {
    match mode {
        BuildMode::LocalDocker | BuildMode::ClusterDocker => DOCKER_DENIAL_MARKERS,
        BuildMode::Kaniko => KANIKO_DENIAL_MARKERS,
        BuildMode::ClusterBuildkit => BUILDKIT_DENIAL_MARKERS,
    }
}

/// Turn a failed build into the right error kind for its backend.
///
/// Scans the failure message and the captured output for the backend's
/// denial markers; anything that doesn't match is a plain `BuildFailed`.
pub(crate) fn classify_build_failure(
    module: &str,
    mode: BuildMode,
    message: &str,
    log: &str,
) -> BuildError {
    for marker in denial_markers(mode) {
        if message.contains(marker) || log.contains(marker) {
            return BuildError::PullAccessDenied {
                module: module.to_string(),
                mode,
                denial: marker.to_string(),
                log: log.to_string(),
            };
        }
    }
    BuildError::BuildFailed {
        module: module.to_string(),
        mode,
        message: message.to_string(),
        log: log.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_pull_denial_is_classified() {
        let err = classify_build_failure(
            "private-base",
            BuildMode::LocalDocker,
            "build failed with exit code 1",
            "Step 1/4 : FROM ghcr.io/acme/private:1.0\n\
             pull access denied for ghcr.io/acme/private, repository does not exist or may require 'docker login'",
        );
        match err {
            BuildError::PullAccessDenied { denial, .. } => {
                assert_eq!(denial, "pull access denied");
            }
            other => panic!("expected PullAccessDenied, got {:?}", other),
        }
    }

    #[test]
    fn test_kaniko_denial_uses_kaniko_markers() {
        let log = "error building image: GET https://registry/v2/acme/private/manifests/1.0: \
                   UNAUTHORIZED: authentication required";
        let err = classify_build_failure("private-base", BuildMode::Kaniko, "job failed", log);
        assert!(matches!(err, BuildError::PullAccessDenied { .. }));

        // The same log under docker markers would not match on UNAUTHORIZED
        // alone; each backend gets its own table.
        let err = classify_build_failure("private-base", BuildMode::LocalDocker, "job failed", log);
        assert!(matches!(err, BuildError::BuildFailed { .. }));
    }

    #[test]
    fn test_buildkit_denial() {
        let err = classify_build_failure(
            "private-base",
            BuildMode::ClusterBuildkit,
            "buildctl exited with code 1",
            "#2 [internal] load metadata for docker.io/acme/private:1.0\n\
             error: failed to authorize: failed to fetch anonymous token",
        );
        assert!(matches!(err, BuildError::PullAccessDenied { .. }));
    }

    #[test]
    fn test_unrelated_failure_is_build_failed() {
        let err = classify_build_failure(
            "api",
            BuildMode::ClusterDocker,
            "docker build exited with code 2",
            "Step 3/7 : RUN make\nmake: *** No rule to make target 'all'.  Stop.",
        );
        match &err {
            BuildError::BuildFailed { module, mode, log, .. } => {
                assert_eq!(module, "api");
                assert_eq!(*mode, BuildMode::ClusterDocker);
                assert!(log.contains("No rule to make target"));
            }
            other => panic!("expected BuildFailed, got {:?}", other),
        }
        // User-facing message names the module and the build mode.
        let message = err.to_string();
        assert!(message.contains("api"));
        assert!(message.contains("cluster-docker"));
    }
}
