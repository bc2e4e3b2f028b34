use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config as ContainerConfig,
    CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::service::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    AttachedConnection, ExitOutcome, OutputFrame, ResourceSample, SandboxError, SandboxId,
    SandboxRuntime,
};
use crate::config::{ResourceLimits, SandboxConfig};
use crate::technology::{Technology, Workspace};

/// Working directory of the program; an anonymous volume holding the workspace.
const WORKDIR: &str = "/workspace";
/// Writable scratch area; the only other writable path.
const SCRATCH_DIR: &str = "/tmp";

const MANAGED_LABEL: &str = "codecell.managed";
const REQUEST_LABEL: &str = "codecell.request-id";

/// Samples buffered between the Docker stats stream and the relay.
const STATS_BUFFER: usize = 8;

/// Kernel interfaces hidden from the program.
const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/sys/firmware",
];

const READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Security posture and limits every sandbox is created with.
#[derive(Debug, Clone)]
struct SandboxPolicy {
    user: String,
    oci_runtime: Option<&'static str>,
    limits: ResourceLimits,
}

impl SandboxPolicy {
    fn from_config(config: &SandboxConfig) -> Result<Self> {
        Ok(Self {
            user: config.user.clone(),
            oci_runtime: config.runtime.oci_runtime(),
            limits: config.limits().context("Invalid sandbox limits")?,
        })
    }

    fn container_config(
        &self,
        technology: &dyn Technology,
        request_id: &str,
    ) -> ContainerConfig<String> {
        let limits = &self.limits;

        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (REQUEST_LABEL.to_string(), request_id.to_string()),
        ]);

        let tmpfs = HashMap::from([(
            SCRATCH_DIR.to_string(),
            format!("rw,noexec,nosuid,nodev,size={}", limits.scratch_bytes),
        )]);

        let ulimits = vec![
            ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(limits.nofile),
                hard: Some(limits.nofile),
            },
            ResourcesUlimits {
                name: Some("fsize".to_string()),
                soft: Some(limits.file_size_bytes),
                hard: Some(limits.file_size_bytes),
            },
        ];

        let storage_opt = limits
            .storage_quota
            .as_ref()
            .map(|quota| HashMap::from([("size".to_string(), quota.clone())]));

        ContainerConfig {
            image: Some(technology.image().to_string()),
            cmd: Some(technology.command()),
            user: Some(self.user.clone()),
            working_dir: Some(WORKDIR.to_string()),
            env: Some(vec![format!("HOME={SCRATCH_DIR}")]),
            labels: Some(labels),
            volumes: Some(HashMap::from([(WORKDIR.to_string(), HashMap::new())])),
            network_disabled: Some(true),
            tty: Some(false),
            // Stdin stays open until the orchestrator half-closes it
            open_stdin: Some(true),
            stdin_once: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                tmpfs: Some(tmpfs),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                masked_paths: Some(MASKED_PATHS.iter().map(ToString::to_string).collect()),
                readonly_paths: Some(READONLY_PATHS.iter().map(ToString::to_string).collect()),
                pids_limit: Some(limits.pids),
                ulimits: Some(ulimits),
                memory: Some(limits.memory_bytes),
                memory_swap: Some(limits.memory_bytes),
                nano_cpus: Some(limits.nano_cpus),
                runtime: self.oci_runtime.map(str::to_string),
                storage_opt,
                // Removal is explicit so the exit status can still be read
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Sandboxes backed by Docker containers.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    docker: Docker,
    policy: SandboxPolicy,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon and check it answers.
    pub async fn connect(config: &SandboxConfig) -> Result<Self> {
        let policy = SandboxPolicy::from_config(config)?;

        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker. Is Docker running?")?;

        docker
            .ping()
            .await
            .context("Cannot ping Docker daemon. Is Docker running?")?;

        info!(
            runtime = %config.runtime,
            memory = %config.memory,
            cpus = %config.cpus,
            "Connected to Docker"
        );

        Ok(Self { docker, policy })
    }

    /// Remove containers left behind by a previous run of the service.
    pub async fn cleanup_orphaned(&self) -> Result<u32> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        )]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list containers")?;

        let mut removed = 0;
        for id in containers.into_iter().filter_map(|c| c.id) {
            match self.remove(&SandboxId::new(id)).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove orphaned container: {}", e),
            }
        }

        Ok(removed)
    }

    async fn upload_workspace(
        &self,
        id: &SandboxId,
        workspace: Workspace,
    ) -> Result<(), SandboxError> {
        let files = workspace.len();
        let archive = workspace
            .into_archive()
            .map_err(|e| SandboxError::workspace(e.to_string()))?;

        self.docker
            .upload_to_container(
                id.as_str(),
                Some(UploadToContainerOptions {
                    path: WORKDIR.to_string(),
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(|e| map_docker_error("upload", id.as_str(), e))?;

        debug!(sandbox = %id, files, "Workspace uploaded");
        Ok(())
    }
}

#[async_trait]
impl SandboxRuntime for DockerSandbox {
    async fn create(
        &self,
        request_id: &str,
        technology: &dyn Technology,
        source_code: &str,
    ) -> Result<SandboxId, SandboxError> {
        let mut workspace = Workspace::new();
        technology.materialize(&mut workspace, source_code);

        let name = format!("codecell-{request_id}");
        let config = self.policy.container_config(technology, request_id);

        debug!(request_id, image = technology.image(), "Creating container");
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| match status_code(&e) {
                Some(404) => SandboxError::image_not_found(technology.image()),
                _ => map_docker_error("create", &name, e),
            })?;

        for warning in &response.warnings {
            warn!(request_id, "Docker warning on create: {}", warning);
        }

        let id = SandboxId::new(response.id);
        if let Err(e) = self.upload_workspace(&id, workspace).await {
            if let Err(remove_err) = self.remove(&id).await {
                warn!(sandbox = %id, "Failed to remove container after upload failure: {}", remove_err);
            }
            return Err(e);
        }

        Ok(id)
    }

    async fn attach(&self, id: &SandboxId) -> Result<AttachedConnection, SandboxError> {
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(
                id.as_str(),
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    detach_keys: None,
                }),
            )
            .await
            .map_err(|e| map_docker_error("attach", id.as_str(), e))?;

        let output = output
            .filter_map(|chunk| async move {
                match chunk {
                    Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                        Some(Ok(OutputFrame::Stdout(message)))
                    }
                    Ok(LogOutput::StdErr { message }) => Some(Ok(OutputFrame::Stderr(message))),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(SandboxError::unhealthy(format!(
                        "attached stream failed: {e}"
                    )))),
                }
            })
            .boxed();

        Ok(AttachedConnection { output, input })
    }

    async fn start(&self, id: &SandboxId) -> Result<(), SandboxError> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_docker_error("start", id.as_str(), e))
    }

    fn wait(&self, id: &SandboxId, cancel: CancellationToken) -> oneshot::Receiver<ExitOutcome> {
        let (tx, rx) = oneshot::channel();
        let docker = self.docker.clone();
        let id = id.clone();

        tokio::spawn(async move {
            let mut stream = docker.wait_container(
                id.as_str(),
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            );

            let next = tokio::select! {
                () = cancel.cancelled() => return,
                next = stream.next() => next,
            };

            let outcome = match next {
                Some(Ok(response)) => Ok(response.status_code),
                // bollard reports non-zero exits as errors
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => match status_code(&e) {
                    Some(404) => Err(SandboxError::unhealthy("container disappeared")),
                    _ => Err(SandboxError::unhealthy(format!("wait failed: {e}"))),
                },
                None => Err(SandboxError::unhealthy(
                    "wait stream ended without an exit status",
                )),
            };

            let _ = tx.send(outcome);
        });

        rx
    }

    async fn kill(&self, id: &SandboxId) -> Result<(), SandboxError> {
        let result = self
            .docker
            .kill_container(
                id.as_str(),
                Some(KillContainerOptions { signal: "SIGKILL" }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            // Already gone or already stopped
            Err(e) if matches!(status_code(&e), Some(404 | 409)) => {
                debug!(sandbox = %id, "Kill skipped: {}", e);
                Ok(())
            }
            Err(e) => Err(map_docker_error("kill", id.as_str(), e)),
        }
    }

    async fn remove(&self, id: &SandboxId) -> Result<(), SandboxError> {
        let result = self
            .docker
            .remove_container(
                id.as_str(),
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(map_docker_error("remove", id.as_str(), e)),
        }
    }

    fn stream_statistics(
        &self,
        id: &SandboxId,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ResourceSample> {
        let (tx, rx) = mpsc::channel(STATS_BUFFER);
        let docker = self.docker.clone();
        let id = id.clone();

        tokio::spawn(async move {
            let mut stream = docker.stats(
                id.as_str(),
                Some(StatsOptions {
                    stream: true,
                    one_shot: false,
                }),
            );

            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => break,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(stats)) => {
                        if tx.send(sample_from_stats(&stats)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(sandbox = %id, "Statistics stream ended: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        });

        rx
    }
}

fn sample_from_stats(stats: &Stats) -> ResourceSample {
    let cpu = &stats.cpu_stats;
    let online_cpus = cpu
        .online_cpus
        .or_else(|| {
            cpu.cpu_usage
                .percpu_usage
                .as_ref()
                .map(|per_cpu| per_cpu.len() as u64)
        })
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(1);

    ResourceSample {
        cpu_total_ns: cpu.cpu_usage.total_usage,
        system_total_ns: cpu.system_cpu_usage.unwrap_or(0),
        online_cpus,
        memory_bytes: stats.memory_stats.usage.unwrap_or(0),
    }
}

fn status_code(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn map_docker_error(operation: &'static str, id: &str, err: DockerError) -> SandboxError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => SandboxError::not_found(id),
        DockerError::HyperResponseError { .. } | DockerError::IOError { .. } => {
            SandboxError::docker_unavailable(err.to_string())
        }
        _ => SandboxError::container_failed(operation, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeKind;
    use crate::technology::DotNetTechnology;

    fn policy(config: &SandboxConfig) -> SandboxPolicy {
        SandboxPolicy::from_config(config).unwrap()
    }

    #[test]
    fn test_container_config_is_hardened() {
        let technology = DotNetTechnology::new("codecell/dotnet".to_string());
        let config = policy(&SandboxConfig::default()).container_config(&technology, "req-1");

        assert_eq!(config.image.as_deref(), Some("codecell/dotnet"));
        assert_eq!(
            config.cmd,
            Some(vec!["dotnet".to_string(), "run".to_string()])
        );
        assert_eq!(config.user.as_deref(), Some("runner"));
        assert_eq!(config.working_dir.as_deref(), Some(WORKDIR));
        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(config.open_stdin, Some(true));
        assert_eq!(config.stdin_once, Some(true));
        assert_eq!(config.labels.as_ref().unwrap()[REQUEST_LABEL], "req-1");
        assert!(config.volumes.as_ref().unwrap().contains_key(WORKDIR));

        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(
            host.security_opt,
            Some(vec!["no-new-privileges:true".to_string()])
        );
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(1_000_000_000));
        assert_eq!(host.runtime, None);
        assert_eq!(host.storage_opt, None);
        assert!(host.masked_paths.unwrap().contains(&"/proc/kcore".to_string()));

        let tmpfs = host.tmpfs.unwrap();
        let scratch = &tmpfs[SCRATCH_DIR];
        assert!(scratch.contains("noexec"));
        assert!(scratch.contains("nosuid"));
        assert!(scratch.contains(&format!("size={}", 64 * 1024 * 1024)));

        let ulimits = host.ulimits.unwrap();
        let names: Vec<_> = ulimits.iter().filter_map(|u| u.name.as_deref()).collect();
        assert_eq!(names, vec!["nofile", "fsize"]);
    }

    #[test]
    fn test_gvisor_and_storage_quota() {
        let sandbox = SandboxConfig {
            runtime: RuntimeKind::Gvisor,
            enable_storage_opt: true,
            storage_quota: "128m".to_string(),
            ..Default::default()
        };
        let technology = DotNetTechnology::new("codecell/dotnet".to_string());
        let host = policy(&sandbox)
            .container_config(&technology, "req-2")
            .host_config
            .unwrap();

        assert_eq!(host.runtime.as_deref(), Some("runsc"));
        assert_eq!(host.storage_opt.unwrap()["size"], "128m");
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let sandbox = SandboxConfig {
            memory: "a lot".to_string(),
            ..Default::default()
        };
        assert!(SandboxPolicy::from_config(&sandbox).is_err());
    }

    #[test]
    fn test_map_docker_error() {
        let missing = map_docker_error(
            "kill",
            "abc",
            DockerError::DockerResponseServerError {
                status_code: 404,
                message: "No such container".to_string(),
            },
        );
        assert!(missing.is_not_found());

        let conflict = map_docker_error(
            "start",
            "abc",
            DockerError::DockerResponseServerError {
                status_code: 500,
                message: "runtime failure".to_string(),
            },
        );
        assert!(conflict.to_string().starts_with("Container start failed"));
    }

    #[tokio::test]
    async fn test_connect_no_docker() {
        // Passes whether or not a daemon is reachable from the test environment
        match DockerSandbox::connect(&SandboxConfig::default()).await {
            Ok(sandbox) => assert_eq!(sandbox.policy.user, "runner"),
            Err(e) => {
                let error_msg = e.to_string();
                assert!(
                    error_msg.contains("Docker") || error_msg.contains("docker"),
                    "Unexpected error: {error_msg}"
                );
            }
        }
    }
}
