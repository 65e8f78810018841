//! Container image build and status engine for the Bosun deployment
//! orchestrator.
//!
//! Given a source module and a provider configuration, this crate produces
//! a container image identified by a content-addressed version using one of
//! four interchangeable strategies (local Docker engine, in-cluster Docker
//! daemon via pod exec, in-cluster buildkit, or a dedicated kaniko build
//! Job), and answers "is this already built?" by probing each backend's own
//! notion of image existence: the local image store, the in-cluster
//! daemon's image list, or a remote registry manifest.
//!
//! The scheduler that decides *when* to build, the staging of build
//! contexts into the cluster, and deployment manifest generation are
//! external collaborators.

pub mod build;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod log;
pub mod module;
pub mod registry;

pub use build::{BuildOrchestrator, BuildResult, BuildStatus};
pub use cluster::{PodExecutor, RegistryAuthProvisioner};
pub use config::{BuildMode, BuildTimeouts, ProviderConfig, PullSecretRef, RegistryConfig};
pub use context::BuildContext;
pub use error::BuildError;
pub use identity::{resolve_identity, ImageIdentity};
pub use module::{Module, ModuleVersion};
