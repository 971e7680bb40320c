/// Container Platform - the sandbox runtime seen by the executor
///
/// **Core Responsibility:**
/// Thin lifecycle operations on one isolated container: create, start,
/// wait, stop, inspect, read logs, remove.
///
/// **Critical Architectural Boundary:**
/// - Platform knows HOW to talk to the container runtime (Docker today)
/// - Platform does NOT enforce deadlines or guarantee cleanup
/// - Platform does NOT know about tasks, scores, or the progress protocol
///
/// Timeout handling and the remove-exactly-once guarantee live in the
/// executor, which only sees this trait.
use crate::executor::ExecutionRequest;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::BTreeMap;

/// Grace period `docker stop` gives the container before SIGKILL
const STOP_GRACE_SECS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

/// Raw chunk from a container's log channel. Chunks are not line aligned.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub stream: StdStream,
    pub bytes: Vec<u8>,
}

pub type LogStream = BoxStream<'static, Result<LogChunk>>;

/// Lifecycle operations on a sandbox container
#[async_trait]
pub trait ContainerPlatform: Send + Sync {
    /// Create (not start) a container; returns its id
    async fn create(&self, request: &ExecutionRequest) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Block until the container is no longer running; returns the exit code
    async fn wait(&self, id: &str) -> Result<i64>;

    async fn stop(&self, id: &str) -> Result<()>;

    /// Whether the kernel OOM killer terminated the container
    async fn oom_killed(&self, id: &str) -> Result<bool>;

    /// Follow the demultiplexed log channel until the container exits
    fn follow_logs(&self, id: &str) -> LogStream;

    /// Complete (stdout, stderr) captured so far
    async fn logs(&self, id: &str) -> Result<(String, String)>;

    /// Forced removal, including anonymous volumes
    async fn remove(&self, id: &str) -> Result<()>;
}

/// Docker-backed platform
///
/// **Docker Execution Rules:**
/// 1. Pulls the image if it is not present locally
/// 2. Creates the container with bind mounts, env and working directory
/// 3. Memory limit in bytes with memory+swap pinned to the same value
///    (no swap), CPU limit as nano-CPUs when set
/// 4. Removal is forced and takes anonymous volumes with it
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(DockerEngine { docker })
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let (from_image, tag) = split_image_tag(image);
        tracing::info!(image, "Pulling sandbox image");

        let options = Some(CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.with_context(|| format!("Failed to pull Docker image {}", image))?;
        }

        Ok(())
    }
}

#[async_trait]
impl ContainerPlatform for DockerEngine {
    async fn create(&self, request: &ExecutionRequest) -> Result<String> {
        self.ensure_image(&request.image).await?;

        let config = Config {
            image: Some(request.image.clone()),
            cmd: (!request.command.is_empty()).then(|| request.command.clone()),
            working_dir: Some(request.working_dir.clone()),
            env: Some(env_list(&request.env)),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config(request)),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;

        for warning in &container.warnings {
            tracing::warn!(container_id = %container.id, warning = %warning, "Docker warning");
        }

        Ok(container.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => {
                if let Some(message) = response.error.and_then(|e| e.message) {
                    bail!("container error: {}", message);
                }
                Ok(response.status_code)
            }
            // bollard reports a non-zero exit as an error; it is a normal exit here
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => bail!("wait stream ended without a status"),
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await?;
        Ok(())
    }

    async fn oom_killed(&self, id: &str) -> Result<bool> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(inspect
            .state
            .and_then(|state| state.oom_killed)
            .unwrap_or(false))
    }

    fn follow_logs(&self, id: &str) -> LogStream {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        self.docker
            .logs(id, Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(output) => log_chunk(output).map(Ok),
                    Err(e) => Some(Err(e.into())),
                }
            })
            .boxed()
    }

    async fn logs(&self, id: &str) -> Result<(String, String)> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stream = self.docker.logs(id, Some(options));
        while let Some(output) = stream.next().await {
            match log_chunk(output?) {
                Some(LogChunk {
                    stream: StdStream::Stdout,
                    bytes,
                }) => stdout.push_str(&String::from_utf8_lossy(&bytes)),
                Some(LogChunk {
                    stream: StdStream::Stderr,
                    bytes,
                }) => stderr.push_str(&String::from_utf8_lossy(&bytes)),
                None => {}
            }
        }

        Ok((stdout, stderr))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }
}

fn log_chunk(output: LogOutput) -> Option<LogChunk> {
    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => Some(LogChunk {
            stream: StdStream::Stdout,
            bytes: message.to_vec(),
        }),
        LogOutput::StdErr { message } => Some(LogChunk {
            stream: StdStream::Stderr,
            bytes: message.to_vec(),
        }),
        LogOutput::StdIn { .. } => None,
    }
}

fn env_list(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

fn host_config(request: &ExecutionRequest) -> HostConfig {
    let memory = i64::try_from(request.memory_limit_mb)
        .unwrap_or(i64::MAX)
        .saturating_mul(1024 * 1024);
    let nano_cpus = (request.cpu_limit > 0.0).then(|| (request.cpu_limit * 1e9) as i64);

    let mounts = request
        .mounts
        .iter()
        .map(|m| Mount {
            typ: Some(MountTypeEnum::BIND),
            source: Some(m.source.clone()),
            target: Some(m.target.clone()),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect();

    HostConfig {
        memory: Some(memory),
        memory_swap: Some(memory),
        nano_cpus,
        mounts: Some(mounts),
        ..Default::default()
    }
}

/// Split `repo[:tag]` for the pull API, which pulls every tag when none is
/// given. Digest references are passed through whole.
fn split_image_tag(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}
