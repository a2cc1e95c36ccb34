//! Log Stream Supervision
//!
//! One task per running container tails its log attachment, demultiplexes
//! frames, and batches them onto the session queue. The supervisor
//! reconciles the set of active tasks against the latest container listing
//! on every sync tick.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::protocol::{LogRecord, OutboundMessage};
use crate::connection::session::OutboundSender;
use crate::runtime::adapter::RuntimeAdapter;
use crate::runtime::mux::FrameReader;

/// A batch is flushed as soon as it holds this many records.
pub const MAX_BATCH_SIZE: usize = 50;

/// A non-empty batch is flushed after this long without a size flush.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Accumulates one container's log records between flushes.
#[derive(Default)]
pub struct LogBatcher {
    records: Vec<LogRecord>,
}

impl LogBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record; returns a full batch when the size threshold is hit.
    pub fn push(&mut self, record: LogRecord) -> Option<Vec<LogRecord>> {
        self.records.push(record);
        if self.records.len() >= MAX_BATCH_SIZE {
            Some(std::mem::take(&mut self.records))
        } else {
            None
        }
    }

    /// Take whatever is pending, if anything.
    pub fn drain(&mut self) -> Option<Vec<LogRecord>> {
        if self.records.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.records))
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Reconciles active log tasks against the running container set.
///
/// Holds the only map of stream handles; the map is touched exclusively
/// under its lock, and at most one live handle exists per container.
pub struct StreamSupervisor<R: RuntimeAdapter + 'static> {
    runtime: Arc<R>,
    outbound: OutboundSender,
    host_id: String,
    active: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl<R: RuntimeAdapter + 'static> StreamSupervisor<R> {
    pub fn new(runtime: Arc<R>, outbound: OutboundSender, host_id: String) -> Self {
        Self {
            runtime,
            outbound,
            host_id,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Apply the minimal diff between active log tasks and the running set
    /// observed in `containers`. Finished tasks are reaped first so a
    /// stream that died respawns while its container is still running.
    pub fn reconcile(&self, containers: &[crate::runtime::adapter::ContainerSummary]) {
        let running: HashSet<&str> = containers
            .iter()
            .filter(|c| c.is_running())
            .map(|c| c.docker_id.as_str())
            .collect();

        let mut active = self.active.lock();

        active.retain(|id, handle| {
            if handle.is_finished() {
                debug!(container_id = %id, "log stream task ended");
                return false;
            }
            if running.contains(id.as_str()) {
                true
            } else {
                info!(container_id = %id, "container no longer running, cancelling log stream");
                handle.abort();
                false
            }
        });

        for id in running {
            if !active.contains_key(id) {
                info!(container_id = %id, "starting log stream");
                let handle = tokio::spawn(run_log_stream(
                    Arc::clone(&self.runtime),
                    self.outbound.clone(),
                    self.host_id.clone(),
                    id.to_string(),
                ));
                active.insert(id.to_string(), handle);
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    #[cfg(test)]
    fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Tail one container's logs until the stream ends or the task is
/// cancelled. Whatever is still batched when the stream terminates is
/// flushed before the task exits.
async fn run_log_stream<R: RuntimeAdapter>(
    runtime: Arc<R>,
    outbound: OutboundSender,
    host_id: String,
    container_id: String,
) {
    let attachment = match runtime.attach_logs(&container_id).await {
        Ok(attachment) => attachment,
        Err(e) => {
            warn!(container_id = %container_id, error = %format!("{e:#}"), "failed to attach to log stream");
            return;
        }
    };

    let mut frames = FrameReader::new(attachment);
    let mut batcher = LogBatcher::new();
    // interval() completes its first tick immediately, which would flush a
    // partial batch the moment the stream opens; the first tick must wait a
    // full interval like every later one.
    let mut flush_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + FLUSH_INTERVAL,
        FLUSH_INTERVAL,
    );
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = frames.next_frame() => match frame {
                Ok(Some((stream, message))) => {
                    let record = LogRecord {
                        container_id: container_id.clone(),
                        stream,
                        message,
                    };
                    if let Some(batch) = batcher.push(record) {
                        send_batch(&outbound, &host_id, batch).await;
                        flush_timer.reset();
                    }
                }
                Ok(None) => {
                    debug!(container_id = %container_id, "log stream ended");
                    break;
                }
                Err(e) => {
                    warn!(container_id = %container_id, error = %e, "log stream read failed");
                    break;
                }
            },
            _ = flush_timer.tick() => {
                if let Some(batch) = batcher.drain() {
                    send_batch(&outbound, &host_id, batch).await;
                }
            }
        }
    }

    if let Some(batch) = batcher.drain() {
        send_batch(&outbound, &host_id, batch).await;
    }
}

async fn send_batch(outbound: &OutboundSender, host_id: &str, batch: Vec<LogRecord>) {
    debug!(count = batch.len(), "flushing log batch");
    outbound
        .send(OutboundMessage::Logs {
            host_id: host_id.to_string(),
            logs: batch,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::session::test_channel;
    use crate::runtime::adapter::mock::MockRuntime;
    use crate::runtime::mux::{encode_frame, StreamKind};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn frame_bytes(count: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        for i in 0..count {
            bytes.extend_from_slice(&encode_frame(
                StreamKind::Stdout,
                format!("line {i}\n").as_bytes(),
            ));
        }
        bytes
    }

    async fn recv_logs(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<LogRecord> {
        match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
            Some(OutboundMessage::Logs { logs, .. }) => logs,
            other => panic!("expected log batch, got {other:?}"),
        }
    }

    #[test]
    fn batcher_holds_until_size_threshold() {
        let mut batcher = LogBatcher::new();
        for i in 0..MAX_BATCH_SIZE - 1 {
            let flushed = batcher.push(LogRecord {
                container_id: "c".to_string(),
                stream: StreamKind::Stdout,
                message: format!("line {i}"),
            });
            assert!(flushed.is_none(), "no flush expected before the threshold");
        }
        assert_eq!(batcher.len(), MAX_BATCH_SIZE - 1);

        let batch = batcher
            .push(LogRecord {
                container_id: "c".to_string(),
                stream: StreamKind::Stdout,
                message: "last".to_string(),
            })
            .expect("50th record should flush");
        assert_eq!(batch.len(), MAX_BATCH_SIZE);
        assert_eq!(batch[0].message, "line 0");
        assert_eq!(batch[MAX_BATCH_SIZE - 1].message, "last");
        assert!(batcher.is_empty(), "flush resets the batch");
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_immediately_in_order() {
        let runtime = MockRuntime::new();
        runtime.preload_logs("c-1", frame_bytes(MAX_BATCH_SIZE), false);
        let (outbound, mut rx) = test_channel(16);

        tokio::spawn(run_log_stream(
            runtime,
            outbound,
            "host-1".to_string(),
            "c-1".to_string(),
        ));

        let logs = recv_logs(&mut rx).await;
        assert_eq!(logs.len(), MAX_BATCH_SIZE);
        for (i, record) in logs.iter().enumerate() {
            assert_eq!(record.message, format!("line {i}"));
            assert_eq!(record.container_id, "c-1");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_record_flushes_after_interval() {
        let runtime = MockRuntime::new();
        runtime.preload_logs("c-1", frame_bytes(1), false);
        let (outbound, mut rx) = test_channel(16);

        tokio::spawn(run_log_stream(
            runtime,
            outbound,
            "host-1".to_string(),
            "c-1".to_string(),
        ));

        // The paused clock only advances once the stream task is idle, so
        // receiving here proves the timed flush fired with a single record.
        let logs = recv_logs(&mut rx).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "line 0");
    }

    #[tokio::test(start_paused = true)]
    async fn early_tick_does_not_split_a_batch() {
        let runtime = MockRuntime::new();
        runtime.preload_logs("c-1", frame_bytes(3), false);
        let (outbound, mut rx) = test_channel(16);

        tokio::spawn(run_log_stream(
            runtime,
            outbound,
            "host-1".to_string(),
            "c-1".to_string(),
        ));

        // All buffered frames are read before any time passes, so the first
        // timed flush must carry all of them in one batch.
        let logs = recv_logs(&mut rx).await;
        assert_eq!(logs.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_batch_is_flushed_when_the_stream_ends() {
        let runtime = MockRuntime::new();
        runtime.preload_logs("c-1", frame_bytes(3), true);
        let (outbound, mut rx) = test_channel(16);

        tokio::spawn(run_log_stream(
            runtime,
            outbound,
            "host-1".to_string(),
            "c-1".to_string(),
        ));

        let logs = recv_logs(&mut rx).await;
        assert_eq!(logs.len(), 3);
    }

    #[tokio::test]
    async fn reconcile_applies_minimal_diff() {
        let runtime = MockRuntime::new();
        let (outbound, _rx) = test_channel(64);
        let supervisor = StreamSupervisor::new(runtime.clone(), outbound, "host-1".to_string());

        supervisor.reconcile(&[
            MockRuntime::summary("a", "running"),
            MockRuntime::summary("b", "running"),
            MockRuntime::summary("x", "exited"),
        ]);
        assert_eq!(supervisor.active_ids(), vec!["a", "b"]);

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        supervisor.reconcile(&[
            MockRuntime::summary("b", "running"),
            MockRuntime::summary("c", "running"),
        ]);
        assert_eq!(supervisor.active_ids(), vec!["b", "c"]);

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        // a and c were each attached once; b kept its original task.
        assert_eq!(runtime.recorded("attach:a").len(), 1);
        assert_eq!(runtime.recorded("attach:b").len(), 1);
        assert_eq!(runtime.recorded("attach:c").len(), 1);
    }

    #[tokio::test]
    async fn finished_streams_respawn_while_still_running() {
        let runtime = MockRuntime::new();
        // EOF right away: the task ends on its own.
        runtime.preload_logs("a", Vec::new(), true);
        let (outbound, _rx) = test_channel(64);
        let supervisor = StreamSupervisor::new(runtime.clone(), outbound, "host-1".to_string());

        let listing = vec![MockRuntime::summary("a", "running")];
        supervisor.reconcile(&listing);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        supervisor.reconcile(&listing);
        assert_eq!(supervisor.active_count(), 1);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(runtime.recorded("attach:a").len(), 2);
    }
}
