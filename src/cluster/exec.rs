// Command execution inside running cluster pods.
//
// The in-cluster build modes drive their daemons exclusively through the
// exec subresource: build and push commands, image listing, cleanup. Output
// is streamed line by line into the build log while also being captured for
// the caller.

use crate::error::{BuildError, Result};
use crate::log::BuildLog;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use kube::Client;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Captured result of a pod exec.
#[derive(Debug)]
pub struct ExecOutput {
    pub exit_code: i32,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct PodExecutor {
    pods: Api<Pod>,
}

impl PodExecutor {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
        }
    }

    /// Run a command in a pod container and capture its combined output.
    ///
    /// Enforces `timeout` on the whole exec (a stall past it is a distinct
    /// `Timeout` failure, not a build failure) and terminates the exec
    /// stream on cancellation or expiry by dropping the attached process.
    pub async fn exec(
        &self,
        pod: &str,
        container: Option<&str>,
        command: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
        log: Option<&BuildLog>,
    ) -> Result<ExecOutput> {
        debug!("Executing in pod {}: {:?}", pod, command);

        let mut params = AttachParams::default().stdout(true).stderr(true).stdin(false);
        if let Some(container) = container {
            params = params.container(container);
        }

        let mut attached = self
            .pods
            .exec(pod, command.iter().map(String::as_str), &params)
            .await?;
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();

        let operation = format!("exec in pod {}", pod);
        let work = async {
            let (stdout_buf, stderr_buf) = tokio::join!(drain(stdout, log), drain(stderr, log));
            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            (stdout_buf, stderr_buf, status)
        };

        let (stdout_buf, stderr_buf, status) = tokio::select! {
            result = work => result,
            _ = tokio::time::sleep(timeout) => {
                return Err(BuildError::Timeout {
                    operation,
                    seconds: timeout.as_secs(),
                });
            }
            _ = cancel.cancelled() => {
                return Err(BuildError::Cancelled { operation });
            }
        };

        let status = status.ok_or_else(|| {
            BuildError::Infrastructure(format!(
                "exec in pod {} ended without a status frame",
                pod
            ))
        })?;

        let exit_code = exit_code_from_status(&status);
        let mut output = stdout_buf;
        output.push_str(&stderr_buf);
        if exit_code != 0 {
            // Failures like a missing container carry no process output,
            // only the API server's status message.
            if let Some(message) = &status.message {
                if !output.contains(message.as_str()) {
                    output.push_str(message);
                    output.push('\n');
                }
            }
        }

        Ok(ExecOutput { exit_code, output })
    }
}

async fn drain<R>(reader: Option<R>, log: Option<&BuildLog>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut lines = BufReader::new(reader).lines();
    let mut buffer = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(log) = log {
            log.append(&line);
        }
        buffer.push_str(&line);
        buffer.push('\n');
    }
    buffer
}

/// Decode the process exit code from the exec channel's terminal status.
fn exit_code_from_status(status: &Status) -> i32 {
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_deref())
        .and_then(|code| code.parse().ok())
        .unwrap_or(1)
}
