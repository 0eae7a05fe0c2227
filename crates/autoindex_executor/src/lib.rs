//! Sandboxed executor for index jobs.
//!
//! A [`Worker`] claims queued index records, provisions one isolated sandbox
//! per job (a docker container network or a firecracker micro-VM), fetches
//! the repository at the claimed commit, runs the job's steps, hands the
//! index file to an [`ArtifactSink`] and reports the outcome back to the
//! queue. Heartbeats keep claims alive and deliver cancellations.

pub mod artifacts;
pub mod cancel;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod job_source;
pub mod metrics;
pub mod sandbox;
pub mod worker;
pub mod workspace;

pub use artifacts::{ArtifactSink, DirectoryArtifactSink};
pub use cancel::RunningJobs;
pub use capabilities::{check_host, missing_capabilities, HostInspector, SystemHost};
pub use config::{BackendKind, ExecutorConfig, FirecrackerConfig, ResourceLimits};
pub use error::{ExecutorError, Result, SandboxError, SandboxResult};
pub use job_source::JobSource;
pub use metrics::METRICS;
pub use sandbox::{build_backend, SandboxBackend, SandboxHandle, SandboxSpec};
pub use worker::Worker;
pub use workspace::{fetch_with_retries, FetchPolicy, GitWorkspaceFetcher, WorkspaceFetcher};
