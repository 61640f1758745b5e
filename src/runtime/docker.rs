//! Docker implementation of the sandbox runtime.
//!
//! Each sandbox is a network-disabled container pinned to the configured
//! CPU/memory limits, created idle (`sleep infinity`) so the prewarm pool
//! can build it ahead of demand. Scripts run via docker exec with the
//! payload written to stdin, so no filesystem staging is needed.

use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::{OutputRx, ResourceLimits, SandboxHandle, SandboxRuntime};
use crate::error::RuntimeError;

/// Command a freshly created sandbox idles on until a script arrives.
const IDLE_CMD: &[&str] = &["sleep", "infinity"];

/// Interpreter invocation for submitted scripts; `-u` keeps output unbuffered
/// so partial chunks reach pollers promptly, `-` reads the script from stdin.
const SCRIPT_CMD: &[&str] = &["python", "-u", "-"];

/// Seconds the engine waits before killing a container on stop.
const STOP_GRACE_SECS: i32 = 2;

/// Sandbox runtime backed by the local Docker engine.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    image: String,
}

impl DockerRuntime {
    /// Connect to the local Docker engine.
    pub fn connect(image: impl Into<String>) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::EngineUnavailable(e.to_string()))?;
        Ok(Self {
            docker,
            image: image.into(),
        })
    }
}

/// Map an engine error onto the daemon's taxonomy.
fn classify(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => {
            if status_code == 507 || message.contains("no space") || message.contains("allocate") {
                RuntimeError::ResourceExhausted(message)
            } else if status_code >= 500 {
                RuntimeError::EngineUnavailable(message)
            } else {
                RuntimeError::Engine(message)
            }
        }
        other => RuntimeError::EngineUnavailable(other.to_string()),
    }
}

fn is_gone(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404 | 304 | 409,
            ..
        }
    )
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, limits: &ResourceLimits) -> Result<SandboxHandle, RuntimeError> {
        let name = format!("sandbox-{}", uuid::Uuid::new_v4());
        let body = ContainerCreateBody {
            image: Some(self.image.clone()),
            cmd: Some(IDLE_CMD.iter().map(ToString::to_string).collect()),
            network_disabled: Some(true),
            tty: Some(true),
            host_config: Some(HostConfig {
                cpu_quota: Some(limits.cpu_quota),
                cpu_period: Some(limits.cpu_period),
                memory: Some(limits.memory_bytes),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&name).build()),
                body,
            )
            .await
            .map_err(classify)?;

        debug!(sandbox = %created.id, "Created sandbox container");
        Ok(SandboxHandle::new(created.id))
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), RuntimeError> {
        self.docker
            .start_container(&handle.id, None::<StartContainerOptions>)
            .await
            .map_err(classify)
    }

    #[instrument(skip(self, script), fields(sandbox = %handle.id, timeout_secs = timeout.as_secs()))]
    async fn exec(
        &self,
        handle: &SandboxHandle,
        script: &str,
        timeout: Duration,
    ) -> Result<OutputRx, RuntimeError> {
        debug!(script_len = script.len(), "Starting exec in sandbox");

        let exec = self
            .docker
            .create_exec(
                &handle.id,
                CreateExecOptions {
                    cmd: Some(SCRIPT_CMD.iter().map(ToString::to_string).collect()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify)?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(classify)?;

        let StartExecResults::Attached {
            mut output,
            mut input,
        } = started
        else {
            return Err(RuntimeError::Engine(
                "exec unexpectedly started detached".to_string(),
            ));
        };

        let (tx, rx) = mpsc::channel(32);
        let docker = self.docker.clone();
        let exec_id = exec.id;
        let container_id = handle.id.clone();
        let payload = script.as_bytes().to_vec();

        tokio::spawn(async move {
            if let Err(e) = input.write_all(&payload).await {
                warn!(error = %e, "Failed to write script to sandbox stdin");
            }
            drop(input); // EOF signals end of script

            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    chunk = output.next() => match chunk {
                        Some(Ok(LogOutput::StdOut { message } | LogOutput::StdErr { message })) => {
                            let text = String::from_utf8_lossy(&message).into_owned();
                            if tx.send(Ok(text)).await.is_err() {
                                return; // receiver dropped, execution abandoned
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = tx.send(Err(classify(e))).await;
                            return;
                        }
                        None => break,
                    },
                    () = &mut deadline => {
                        let _ = docker
                            .stop_container(
                                &container_id,
                                Some(StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
                            )
                            .await;
                        let _ = tx
                            .send(Err(RuntimeError::Timeout {
                                limit_secs: timeout.as_secs(),
                            }))
                            .await;
                        return;
                    }
                }
            }

            // Output stream closed; fetch the exit code.
            match docker.inspect_exec(&exec_id).await {
                Ok(inspect) => {
                    let exit_code = inspect.exit_code.unwrap_or(-1);
                    if exit_code != 0 {
                        let _ = tx.send(Err(RuntimeError::SandboxCrashed { exit_code })).await;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(classify(e))).await;
                }
            }
        });

        Ok(rx)
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(
                &handle.id,
                Some(StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }
}
