/// Isolation Runner - sandboxed execution of one untrusted program
///
/// **Core Responsibility:**
/// Run a complete program in a fresh sandbox and capture its stdout.
///
/// **Critical Architectural Boundary:**
/// - The runner knows HOW to execute, never whether the output is correct
/// - The isolation technology sits behind `SandboxBackend`; grading code
///   only ever sees `ExecutionResult`
///
/// **Safety Guarantees:**
/// - Every run gets its own temporary code directory and its own sandbox
/// - The sandbox is destroyed on every path: success, non-zero exit,
///   timeout and backend failure. A drop guard covers cancellation and panics.
/// - Waiting is hard-bounded by `timeout + WAIT_GRACE` even if the backend
///   itself misbehaves
/// - Captured output is capped at `SandboxLimits::output_bytes`
/// - Failures never escape as errors: they become `success = false` results
use crate::language::Runtime;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use tutor_common::config::SandboxLimits;
use tutor_common::types::{ExecutionResult, FailureKind};

/// Programs larger than this are rejected before a sandbox is started
pub const MAX_SOURCE_BYTES: usize = 1024 * 1024; // 1MB

/// Extra time granted to a backend past the program timeout before the
/// runner stops waiting on it
pub const WAIT_GRACE: Duration = Duration::from_secs(5);

const CONTAINER_CODE_DIR: &str = "/app";
const SANDBOX_USER: &str = "nobody";
const SANDBOX_LABEL: &str = "tutor.sandbox";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },
    /// The program outlived its timeout and was stopped
    TimedOut,
}

/// An isolation primitive able to host one program run
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Create and start a sandbox running `runtime` against the program in `code_dir`
    async fn start(&self, runtime: &Runtime, code_dir: &Path, limits: &SandboxLimits) -> Result<SandboxHandle>;

    /// Wait for the program to exit. Implementations stop the program and
    /// report `TimedOut` once `timeout` elapses. Captured output may stop
    /// just past `limits.output_bytes()`.
    async fn wait(&self, handle: &SandboxHandle, timeout: Duration, limits: &SandboxLimits) -> Result<WaitOutcome>;

    /// Forcibly remove the sandbox. Removing one that is already gone succeeds.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<()>;
}

/// Schedules forced teardown if a run is abandoned before it destroys its sandbox
struct TeardownGuard {
    backend: Arc<dyn SandboxBackend>,
    handle: Option<SandboxHandle>,
}

impl TeardownGuard {
    fn new(backend: Arc<dyn SandboxBackend>, handle: SandboxHandle) -> Self {
        Self {
            backend,
            handle: Some(handle),
        }
    }

    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        // Drop cannot be async; hand the removal to the runtime
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let backend = self.backend.clone();
                runtime.spawn(async move {
                    if let Err(e) = backend.destroy(&handle).await {
                        warn!(sandbox = %handle.id, error = %e, "Failed to tear down abandoned sandbox");
                    }
                });
            }
            Err(_) => {
                warn!(sandbox = %handle.id, "No async runtime available; sandbox left for the orphan reaper");
            }
        }
    }
}

/// Runs programs through a `SandboxBackend` under fixed resource limits
#[derive(Clone)]
pub struct IsolationRunner {
    backend: Arc<dyn SandboxBackend>,
    limits: SandboxLimits,
}

impl IsolationRunner {
    pub fn new(backend: Arc<dyn SandboxBackend>, limits: SandboxLimits) -> Self {
        Self { backend, limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Execute `source` once and report what it printed
    #[tracing::instrument(
        skip(self, runtime, source),
        fields(language = %runtime.name, timeout_ms = timeout.as_millis() as u64)
    )]
    pub async fn run(&self, runtime: &Runtime, source: &str, timeout: Duration) -> ExecutionResult {
        if source.len() > MAX_SOURCE_BYTES {
            return ExecutionResult::failed(
                FailureKind::Platform,
                format!("program exceeds the maximum size of {} bytes", MAX_SOURCE_BYTES),
            );
        }

        let workspace = match write_workspace(runtime, source) {
            Ok(workspace) => workspace,
            Err(e) => return ExecutionResult::failed(FailureKind::Unexpected, format!("{:#}", e)),
        };

        let handle = match self.backend.start(runtime, workspace.path(), &self.limits).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Sandbox failed to start");
                return ExecutionResult::failed(FailureKind::Platform, format!("{:#}", e));
            }
        };

        let mut guard = TeardownGuard::new(self.backend.clone(), handle.clone());
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            timeout + WAIT_GRACE,
            self.backend.wait(&handle, timeout, &self.limits),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(WaitOutcome::Exited { stdout, stderr, .. }))
                if stdout.len() + stderr.len() > self.limits.output_bytes() =>
            {
                warn!(sandbox = %handle.id, elapsed_ms, "Program exceeded the output limit");
                ExecutionResult::failed(
                    FailureKind::ExecutionError,
                    format!("output limit exceeded ({} bytes)", self.limits.output_bytes()),
                )
            }
            Ok(Ok(WaitOutcome::Exited { exit_code: 0, stdout, .. })) => {
                debug!(sandbox = %handle.id, elapsed_ms, "Program exited successfully");
                ExecutionResult::completed(stdout)
            }
            Ok(Ok(WaitOutcome::Exited { exit_code, stdout, stderr })) => {
                info!(sandbox = %handle.id, exit_code, elapsed_ms, "Program exited with an error");
                ExecutionResult::failed(FailureKind::ExecutionError, describe_exit(exit_code, &stdout, &stderr))
            }
            Ok(Ok(WaitOutcome::TimedOut)) | Err(_) => {
                warn!(sandbox = %handle.id, elapsed_ms, "Program timed out");
                ExecutionResult::failed(
                    FailureKind::Timeout,
                    format!("program did not finish within {:.1}s", timeout.as_secs_f64()),
                )
            }
            Ok(Err(e)) => {
                warn!(sandbox = %handle.id, error = %e, "Sandbox wait failed");
                ExecutionResult::failed(FailureKind::Platform, format!("{:#}", e))
            }
        };

        match self.backend.destroy(&handle).await {
            Ok(()) => guard.disarm(),
            Err(e) => warn!(sandbox = %handle.id, error = %e, "Sandbox teardown failed; retrying in background"),
        }

        result
    }
}

/// Write the program into a fresh directory readable by the sandbox user
fn write_workspace(runtime: &Runtime, source: &str) -> Result<TempDir> {
    let workspace = tempfile::Builder::new()
        .prefix("tutor-sandbox-")
        .tempdir()
        .context("Failed to create sandbox workspace")?;
    let program_path = workspace.path().join(&runtime.file_name);
    std::fs::write(&program_path, source).context("Failed to write program to sandbox workspace")?;

    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;

        std::fs::set_permissions(workspace.path(), Permissions::from_mode(0o755))
            .context("Failed to set sandbox workspace permissions")?;
        std::fs::set_permissions(&program_path, Permissions::from_mode(0o644))
            .context("Failed to set program file permissions")?;
    }

    Ok(workspace)
}

fn describe_exit(exit_code: i64, stdout: &str, stderr: &str) -> String {
    let mut detail = if !stderr.trim().is_empty() {
        stderr.trim_end().to_string()
    } else if !stdout.trim().is_empty() {
        stdout.trim_end().to_string()
    } else {
        format!("process exited with code {}", exit_code)
    };

    match exit_code {
        137 => detail.push_str("\n[Sandbox killed: likely exceeded the memory limit]"),
        139 => detail.push_str("\n[Sandbox killed: segmentation fault]"),
        _ => {}
    }
    detail
}

/// Container settings for one sandbox run
pub fn container_config(runtime: &Runtime, code_dir: &Path, limits: &SandboxLimits) -> Config<String> {
    let mut labels = HashMap::new();
    labels.insert(SANDBOX_LABEL.to_string(), "true".to_string());

    Config {
        image: Some(runtime.image.clone()),
        cmd: Some(runtime.command(CONTAINER_CODE_DIR)),
        working_dir: Some(CONTAINER_CODE_DIR.to_string()),
        user: Some(SANDBOX_USER.to_string()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(true),
        labels: Some(labels),
        host_config: Some(HostConfig {
            memory: Some(limits.memory_bytes()),
            memory_swap: Some(limits.memory_bytes()),
            nano_cpus: Some(limits.nano_cpus()),
            pids_limit: Some(limits.pids_limit()),
            readonly_rootfs: Some(true),
            network_mode: Some("none".to_string()),
            binds: Some(vec![format!("{}:{}:rw", code_dir.display(), CONTAINER_CODE_DIR)]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Force-remove a container by id or name. One that is already gone counts as removed.
async fn remove_container(docker: &Docker, container: &str) -> Result<()> {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };

    match docker.remove_container(container, Some(options)).await {
        Ok(()) => Ok(()),
        // Already gone, or removal already in progress
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove sandbox container {}", container)),
    }
}

/// Removes a container by name unless `start` hands it over to the runner.
/// Armed before the create call, so a cancelled `start` cannot leak a container.
struct ContainerGuard {
    docker: Docker,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, name: String) -> Self {
        Self {
            docker,
            name,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(sandbox = %self.name, "No async runtime available; sandbox left for the orphan reaper");
            return;
        };
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        runtime.spawn(async move {
            if let Err(e) = remove_container(&docker, &name).await {
                warn!(sandbox = %name, error = %e, "Failed to remove container abandoned during start");
            }
        });
    }
}

/// Docker-backed sandboxes: one short-lived container per run
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    /// Pull `image` unless it is already cached
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    /// IDs of every sandbox container this service created that still exists
    pub async fn live_sandboxes(&self) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![SANDBOX_LABEL.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list sandbox containers")?;

        Ok(containers.into_iter().filter_map(|summary| summary.id).collect())
    }

    /// Remove sandboxes left behind by a previous process, returning how many were removed
    pub async fn reap_orphans(&self) -> Result<usize> {
        let mut reaped = 0;
        for id in self.live_sandboxes().await? {
            let handle = SandboxHandle { id };
            match self.destroy(&handle).await {
                Ok(()) => reaped += 1,
                Err(e) => warn!(sandbox = %handle.id, error = %e, "Failed to reap orphaned sandbox"),
            }
        }
        Ok(reaped)
    }

    /// Read stdout and stderr, keeping at most `limit + 1` bytes in total.
    /// The runner treats anything past `limit` as an overflow.
    async fn collect_logs(&self, container_id: &str, limit: usize) -> Result<(String, String)> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        });

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut captured = 0usize;
        let mut logs = self.docker.logs(container_id, options);
        while captured <= limit {
            let Some(output) = logs.next().await else {
                break;
            };
            let (target, message) = match output.context("Failed to read container logs")? {
                LogOutput::StdOut { message } => (&mut stdout, message),
                LogOutput::StdErr { message } => (&mut stderr, message),
                _ => continue,
            };
            let take = message.len().min(limit + 1 - captured);
            target.extend_from_slice(&message[..take]);
            captured += take;
        }

        if captured > limit {
            debug!(sandbox = %container_id, limit, "Stopped reading logs at the output limit");
        }
        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    async fn start(&self, runtime: &Runtime, code_dir: &Path, limits: &SandboxLimits) -> Result<SandboxHandle> {
        self.ensure_image(&runtime.image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", runtime.image))?;

        let name = format!("tutor-sandbox-{}", uuid::Uuid::new_v4());
        let mut guard = ContainerGuard::new(self.docker.clone(), name.clone());
        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), container_config(runtime, code_dir, limits))
            .await
            .context("Failed to create sandbox container")?;
        let handle = SandboxHandle { id: container.id };

        if let Err(e) = self
            .docker
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
        {
            match self.destroy(&handle).await {
                Ok(()) => guard.disarm(),
                Err(cleanup) => {
                    warn!(sandbox = %handle.id, error = %cleanup, "Failed to remove container that never started")
                }
            }
            return Err(e).context("Failed to start sandbox container");
        }

        // From here on the runner's teardown guard owns the container
        guard.disarm();
        debug!(sandbox = %handle.id, name = %name, "Sandbox started");
        Ok(handle)
    }

    async fn wait(&self, handle: &SandboxHandle, timeout: Duration, limits: &SandboxLimits) -> Result<WaitOutcome> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = Box::pin(self.docker.wait_container(&handle.id, Some(options)));

        let exit_code = match tokio::time::timeout(timeout, wait_stream.next()).await {
            Err(_) => {
                if let Err(e) = self
                    .docker
                    .kill_container(&handle.id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(sandbox = %handle.id, error = %e, "Failed to kill timed-out container");
                }
                return Ok(WaitOutcome::TimedOut);
            }
            Ok(Some(Ok(response))) => response.status_code,
            // Non-zero exits arrive as errors from the wait endpoint
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => code,
            Ok(Some(Err(e))) => return Err(e).context("Failed to wait for sandbox container"),
            Ok(None) => bail!("Container wait stream ended without an exit status"),
        };

        let (stdout, stderr) = self.collect_logs(&handle.id, limits.output_bytes()).await?;
        Ok(WaitOutcome::Exited {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        remove_container(&self.docker, &handle.id).await
    }
}
