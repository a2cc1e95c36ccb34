//! Docker Adapter
//!
//! Implementation of RuntimeAdapter for Docker using the bollard library.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    ListContainersOptions, LogOutput, LogsOptions, RestartContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::Docker;
use bytes::BytesMut;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::info;

use crate::runtime::adapter::{
    ContainerSummary, InterfaceCounters, LogAttachment, RuntimeAdapter, StatsSnapshot,
};
use crate::runtime::mux::{self, StreamKind};

/// How many historical lines a fresh log attachment replays.
const LOG_TAIL: &str = "50";

/// Graceful stop window before the engine kills the container.
const STOP_TIMEOUT_SECS: i64 = 10;

/// Docker runtime adapter.
pub struct DockerAdapter {
    client: Docker,
}

impl DockerAdapter {
    /// Create a new Docker adapter connecting to the default socket.
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_socket_defaults()
            .context("Failed to connect to Docker socket")?;
        Ok(Self { client })
    }

    /// Create a new Docker adapter with a custom socket path.
    pub fn with_socket(socket_path: &str) -> Result<Self> {
        let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .context("Failed to connect to Docker socket")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RuntimeAdapter for DockerAdapter {
    fn runtime_type(&self) -> &str {
        "docker"
    }

    async fn version(&self) -> Result<String> {
        let version = self.client.version().await?;
        Ok(format!(
            "Docker {} (API {})",
            version.version.unwrap_or_default(),
            version.api_version.unwrap_or_default()
        ))
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;

        let mut result = Vec::new();
        for container in containers {
            let ports: HashMap<String, Option<u16>> = container
                .ports
                .unwrap_or_default()
                .iter()
                .map(|p| {
                    let protocol = p
                        .typ
                        .as_ref()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "tcp".to_string());
                    (format!("{}/{}", p.private_port, protocol), p.public_port)
                })
                .collect();

            let state = container.state.unwrap_or_default();
            // An exact start time would need a per-container inspect call,
            // which is too slow for a listing; the listing timestamp is a
            // close enough approximation for running containers.
            let started_at = if state == "running" {
                Some(chrono::Utc::now().to_rfc3339())
            } else {
                None
            };

            result.push(ContainerSummary {
                docker_id: container.id.unwrap_or_default(),
                name: container
                    .names
                    .and_then(|n| n.first().cloned())
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string(),
                image: container.image.unwrap_or_default(),
                image_id: container.image_id.unwrap_or_default(),
                command: container.command.unwrap_or_default(),
                state,
                status: container.status.unwrap_or_default(),
                ports,
                labels: container.labels.unwrap_or_default(),
                started_at,
            });
        }

        Ok(result)
    }

    async fn stats_snapshot(&self, id: &str) -> Result<StatsSnapshot> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stats_stream = self.client.stats(id, Some(options));
        let stats = stats_stream
            .next()
            .await
            .context("No stats available for container")??;

        let num_cpus = stats
            .cpu_stats
            .cpu_usage
            .percpu_usage
            .as_ref()
            .map(|per| per.len() as u32)
            .or_else(|| stats.cpu_stats.online_cpus.map(|n| n as u32))
            .unwrap_or(1);

        let memory_cache = match stats.memory_stats.stats {
            Some(bollard::container::MemoryStatsStats::V1(v1)) => v1.cache,
            _ => 0,
        };

        let networks = stats
            .networks
            .map(|nets| {
                nets.values()
                    .map(|net| InterfaceCounters {
                        rx_bytes: net.rx_bytes,
                        tx_bytes: net.tx_bytes,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(StatsSnapshot {
            cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
            cpu_system_usage: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            precpu_total_usage: stats.precpu_stats.cpu_usage.total_usage,
            precpu_system_usage: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            num_cpus,
            memory_usage: stats.memory_stats.usage.unwrap_or(0),
            memory_cache,
            networks,
        })
    }

    async fn attach_logs(&self, id: &str) -> Result<LogAttachment> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            tail: LOG_TAIL.to_string(),
            ..Default::default()
        };

        let stream = self.client.logs(id, Some(options));
        // bollard surfaces parsed frames; re-frame them so the attachment
        // seam keeps speaking the engine wire format.
        Ok(Box::new(MuxedLogReader {
            frames: Box::pin(stream),
            buf: BytesMut::new(),
        }))
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        info!(container_id = %id, "Container started");
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let options = StopContainerOptions { t: STOP_TIMEOUT_SECS };
        self.client.stop_container(id, Some(options)).await?;
        info!(container_id = %id, "Container stopped");
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> Result<()> {
        let options = RestartContainerOptions {
            t: STOP_TIMEOUT_SECS as isize,
        };
        self.client.restart_container(id, Some(options)).await?;
        info!(container_id = %id, "Container restarted");
        Ok(())
    }
}

/// Adapts bollard's parsed log frames back into the raw multiplexed byte
/// stream the demultiplexer consumes.
struct MuxedLogReader {
    frames: Pin<Box<dyn Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>,
    buf: BytesMut,
}

impl AsyncRead for MuxedLogReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.buf.is_empty() {
            match this.frames.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(output))) => {
                    let (kind, message) = match output {
                        LogOutput::StdErr { message } => (StreamKind::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::StdIn { message }
                        | LogOutput::Console { message } => (StreamKind::Stdout, message),
                    };
                    this.buf
                        .extend_from_slice(&mux::encode_frame(kind, &message));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = out.remaining().min(this.buf.len());
        out.put_slice(&this.buf.split_to(n));
        Poll::Ready(Ok(()))
    }
}
