//! Control Plane Session
//!
//! Owns the single WebSocket connection to the control plane, the bounded
//! outbound queue, and the inbound read/dispatch path. Every other
//! component only ever sees an [`OutboundSender`] or receives work from the
//! action dispatcher.
//!
//! Concurrency layout per connection: one task owns the write path (strict
//! FIFO off the queue, per-message write deadline), the calling task owns
//! the read path (inactivity deadline, strict inbound decode). On any
//! failure the session reconnects after a fixed interval; queued messages
//! survive the reconnect.

use anyhow::{bail, Context, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::agent::actions::ActionDispatcher;
use crate::agent::state::{AgentState, AgentStateManager};
use crate::connection::protocol::{InboundMessage, OutboundMessage};
use crate::runtime::adapter::RuntimeAdapter;

/// Sized to absorb one telemetry interval's worth of traffic.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 100;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Enqueue capability handed to the telemetry producers and the action
/// dispatcher. Enqueueing blocks while the queue is full; nothing is
/// dropped on backpressure.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<OutboundMessage>,
}

impl OutboundSender {
    pub fn new(tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, msg: OutboundMessage) {
        if self.tx.send(msg).await.is_err() {
            warn!("outbound queue closed, message dropped");
        }
    }
}

/// Derive the session endpoint from the control plane's HTTP base URL.
pub fn session_url(api_url: &str, token: &str) -> String {
    let ws_base = if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    };
    format!("{}/ws/agent?token={token}", ws_base.trim_end_matches('/'))
}

/// The persistent bidirectional control channel.
pub struct Session<R: RuntimeAdapter + 'static> {
    url: String,
    reconnect_interval_ms: u64,
    dispatcher: Arc<ActionDispatcher<R>>,
    state: AgentStateManager,
    /// Parked here between connections; the write task borrows it while a
    /// connection is live so queued messages survive reconnects.
    outbound_rx: Option<mpsc::Receiver<OutboundMessage>>,
}

impl<R: RuntimeAdapter + 'static> Session<R> {
    pub fn new(
        url: String,
        reconnect_interval_ms: u64,
        dispatcher: Arc<ActionDispatcher<R>>,
        state: AgentStateManager,
        outbound_rx: mpsc::Receiver<OutboundMessage>,
    ) -> Self {
        Self {
            url,
            reconnect_interval_ms,
            dispatcher,
            state,
            outbound_rx: Some(outbound_rx),
        }
    }

    /// Run the session until shutdown, reconnecting after failures.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            match self.connect_and_run().await {
                Ok(()) => {
                    info!("control channel closed");
                    self.state.set_disconnected(Some("connection closed"));
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), "control channel error");
                    self.state.set_disconnected(Some("connection error"));
                }
            }

            if self.state.current_state() == AgentState::ShuttingDown {
                break;
            }

            self.state.set_reconnecting();
            debug!(
                interval_ms = self.reconnect_interval_ms,
                "waiting before reconnection attempt"
            );
            tokio::time::sleep(Duration::from_millis(self.reconnect_interval_ms)).await;
        }

        Ok(())
    }

    async fn connect_and_run(&mut self) -> Result<()> {
        self.state.set_connecting();
        info!(url = %self.url, "connecting to control plane");

        let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect_async(&self.url))
            .await
            .context("connection timeout")?
            .context("failed to connect to control plane")?;

        info!("control channel established");
        self.state.set_connected();

        let (write, read) = ws_stream.split();

        // Keepalive replies travel from the read path to the write task on
        // this side channel so the sink has a single owner.
        let (control_tx, control_rx) = mpsc::channel::<Message>(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let outbound_rx = self
            .outbound_rx
            .take()
            .context("outbound receiver missing")?;
        // The read path watches this so a dead write path tears the whole
        // connection down instead of leaving the queue undrained.
        let (done_tx, done_rx) = oneshot::channel();
        let writer = tokio::spawn(async move {
            let outbound_rx = write_loop(write, outbound_rx, control_rx, shutdown_rx).await;
            let _ = done_tx.send(());
            outbound_rx
        });

        let read_result = self.read_loop(read, control_tx, done_rx).await;

        let _ = shutdown_tx.send(true);
        self.outbound_rx = Some(writer.await.context("write task panicked")?);

        read_result
    }

    async fn read_loop<St, E>(
        &self,
        mut read: St,
        control_tx: mpsc::Sender<Message>,
        mut writer_done: oneshot::Receiver<()>,
    ) -> Result<()>
    where
        St: Stream<Item = std::result::Result<Message, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        loop {
            let next = tokio::select! {
                next = timeout(READ_IDLE_TIMEOUT, read.next()) => next,
                _ = &mut writer_done => {
                    bail!("write path ended, tearing down connection")
                }
            };
            let msg = match next {
                Err(_) => bail!(
                    "no traffic from control plane for {}s",
                    READ_IDLE_TIMEOUT.as_secs()
                ),
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(e).context("websocket read failed"),
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Text(text) => self.handle_text(&text),
                Message::Ping(data) => {
                    // Any inbound traffic, keepalives included, already
                    // reset the idle deadline above.
                    let _ = control_tx.send(Message::Pong(data)).await;
                }
                Message::Pong(_) => debug!("received pong"),
                Message::Close(frame) => {
                    info!(?frame, "received close frame");
                    return Ok(());
                }
                Message::Binary(_) => debug!("binary message ignored"),
                Message::Frame(_) => {}
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<InboundMessage>(text) {
            Ok(InboundMessage::Action(request)) => {
                info!(
                    action_id = %request.action_id,
                    container_id = %request.container_id,
                    verb = %request.action,
                    "received action"
                );
                // Runs on its own task; the read path never waits on the
                // engine.
                self.dispatcher.dispatch(request);
            }
            Err(e) => {
                warn!(error = %e, "dropping unrecognized control message");
            }
        }
    }
}

/// Owns the sink for one connection. Returns the outbound receiver so the
/// next connection picks up where this one left off.
async fn write_loop<S>(
    mut sink: S,
    mut outbound_rx: mpsc::Receiver<OutboundMessage>,
    mut control_rx: mpsc::Receiver<Message>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> mpsc::Receiver<OutboundMessage>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            msg = outbound_rx.recv() => {
                let Some(msg) = msg else { break };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(error = %e, "failed to encode outbound message");
                        continue;
                    }
                };
                match timeout(WRITE_TIMEOUT, sink.send(Message::Text(json))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(error = %e, "websocket write failed");
                        break;
                    }
                    Err(_) => {
                        error!(timeout_secs = WRITE_TIMEOUT.as_secs(), "websocket write timed out");
                        break;
                    }
                }
            }
            ctrl = control_rx.recv() => {
                // The read loop holds the control sender; None means it has
                // exited and shutdown is imminent.
                let Some(frame) = ctrl else { break };
                if !matches!(timeout(WRITE_TIMEOUT, sink.send(frame)).await, Ok(Ok(()))) {
                    break;
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    // A stuck connection can leave close pending forever; the session is
    // waiting on this task to reconnect, so the close gets a deadline too.
    let _ = timeout(WRITE_TIMEOUT, sink.close()).await;
    outbound_rx
}

#[cfg(test)]
pub(crate) fn test_channel(capacity: usize) -> (OutboundSender, mpsc::Receiver<OutboundMessage>) {
    let (tx, rx) = mpsc::channel(capacity);
    (OutboundSender::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::actions::ActionDispatcher;
    use crate::agent::state::AgentStateManager;
    use crate::connection::protocol::ActionStatus;
    use crate::runtime::adapter::mock::MockRuntime;
    use parking_lot::Mutex;
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};
    use tokio_tungstenite::tungstenite;

    #[derive(Clone, Default)]
    struct VecSink {
        sent: Arc<Mutex<Vec<Message>>>,
    }

    impl Sink<Message> for VecSink {
        type Error = std::convert::Infallible;

        fn poll_ready(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.sent.lock().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Rejects every write and never finishes closing, like a connection
    /// whose peer has silently gone away.
    struct StuckSink;

    impl Sink<Message> for StuckSink {
        type Error = std::io::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), Self::Error> {
            Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer gone",
            ))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    fn result_message(id: &str) -> OutboundMessage {
        OutboundMessage::ActionResult {
            action_id: id.to_string(),
            status: ActionStatus::Success,
            error: String::new(),
        }
    }

    #[test]
    fn session_url_swaps_scheme_and_appends_token() {
        assert_eq!(
            session_url("http://localhost:3000", "tok"),
            "ws://localhost:3000/ws/agent?token=tok"
        );
        assert_eq!(
            session_url("https://cloud.example.com/", "tok"),
            "wss://cloud.example.com/ws/agent?token=tok"
        );
    }

    #[tokio::test]
    async fn write_loop_preserves_enqueue_order() {
        let (outbound, outbound_rx) = test_channel(16);
        let (_control_tx, control_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sink = VecSink::default();
        let sent = sink.sent.clone();
        let writer = tokio::spawn(write_loop(sink, outbound_rx, control_rx, shutdown_rx));

        for id in ["m1", "m2", "m3"] {
            outbound.send(result_message(id)).await;
        }

        for _ in 0..100 {
            tokio::task::yield_now().await;
            if sent.lock().len() == 3 {
                break;
            }
        }
        shutdown_tx.send(true).unwrap();
        writer.await.unwrap();

        let order: Vec<String> = sent
            .lock()
            .iter()
            .map(|m| match m {
                Message::Text(text) => {
                    let v: serde_json::Value = serde_json::from_str(text).unwrap();
                    v["action_id"].as_str().unwrap().to_string()
                }
                other => panic!("unexpected frame: {other:?}"),
            })
            .collect();
        assert_eq!(order, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn write_loop_forwards_keepalive_replies() {
        let (_outbound, outbound_rx) = test_channel(1);
        let (control_tx, control_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sink = VecSink::default();
        let sent = sink.sent.clone();
        let writer = tokio::spawn(write_loop(sink, outbound_rx, control_rx, shutdown_rx));

        control_tx.send(Message::Pong(vec![1, 2, 3])).await.unwrap();
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if !sent.lock().is_empty() {
                break;
            }
        }
        shutdown_tx.send(true).unwrap();
        writer.await.unwrap();

        assert!(matches!(sent.lock()[0], Message::Pong(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn writer_returns_after_write_failure_even_if_close_hangs() {
        let (outbound, outbound_rx) = test_channel(4);
        let (_control_tx, control_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let writer = tokio::spawn(write_loop(StuckSink, outbound_rx, control_rx, shutdown_rx));
        outbound.send(result_message("m1")).await;

        // The session awaits this handle before reconnecting; a hanging
        // close would leave it wedged for good.
        timeout(Duration::from_secs(60), writer)
            .await
            .expect("write task must end when the sink is stuck")
            .unwrap();
    }

    #[tokio::test]
    async fn read_loop_tears_down_when_write_path_ends() {
        let runtime = MockRuntime::new();
        let (outbound, _result_rx) = test_channel(4);
        let dispatcher = Arc::new(ActionDispatcher::new(runtime, outbound));
        let (_outbound_tx, outbound_rx) = mpsc::channel(1);
        let session = Session::new(
            "ws://unused".to_string(),
            1000,
            dispatcher,
            AgentStateManager::new(),
            outbound_rx,
        );

        let (control_tx, _control_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = oneshot::channel();
        let read =
            futures_util::stream::pending::<std::result::Result<Message, tungstenite::Error>>();

        done_tx.send(()).unwrap();
        let err = timeout(
            Duration::from_secs(5),
            session.read_loop(read, control_tx, done_rx),
        )
        .await
        .expect("read loop must end promptly once the write path dies")
        .unwrap_err();
        assert!(err.to_string().contains("write path"), "got: {err:#}");
    }

    #[tokio::test]
    async fn queued_messages_survive_a_connection_cycle() {
        let (outbound, outbound_rx) = test_channel(16);
        let (control_tx, control_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // First connection ends before anything is enqueued.
        let writer = tokio::spawn(write_loop(
            VecSink::default(),
            outbound_rx,
            control_rx,
            shutdown_rx,
        ));
        shutdown_tx.send(true).unwrap();
        let outbound_rx = writer.await.unwrap();
        drop(control_tx);

        outbound.send(result_message("held")).await;

        // Second connection drains what was queued in between.
        let (_control_tx, control_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sink = VecSink::default();
        let sent = sink.sent.clone();
        let writer = tokio::spawn(write_loop(sink, outbound_rx, control_rx, shutdown_rx));

        for _ in 0..100 {
            tokio::task::yield_now().await;
            if !sent.lock().is_empty() {
                break;
            }
        }
        shutdown_tx.send(true).unwrap();
        writer.await.unwrap();

        assert_eq!(sent.lock().len(), 1);
    }
}
