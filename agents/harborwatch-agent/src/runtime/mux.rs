//! Multiplexed log stream codec
//!
//! Docker-compatible engines interleave stdout and stderr on one log
//! attachment. Each frame carries an 8-byte header: byte 0 selects the
//! stream, bytes 4..8 hold the payload length as a big-endian u32, and the
//! payload follows immediately.

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length of the per-frame header.
pub const HEADER_LEN: usize = 8;

const STDERR_SELECTOR: u8 = 2;

/// Which output stream a log frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Header { filled: usize },
    Payload { kind: StreamKind, filled: usize },
}

/// Incremental decoder for a multiplexed log attachment.
///
/// Decoding progress survives a cancelled `next_frame` call, so the reader
/// can sit inside a `tokio::select!` arm without losing partial frames.
pub struct FrameReader<R> {
    inner: R,
    header: [u8; HEADER_LEN],
    payload: Vec<u8>,
    state: DecodeState,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header: [0; HEADER_LEN],
            payload: Vec::new(),
            state: DecodeState::Header { filled: 0 },
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the stream ends exactly at a frame boundary.
    /// End-of-stream inside a header or payload is an `UnexpectedEof` error.
    /// A single trailing newline is stripped from the payload; nothing else
    /// is altered.
    pub async fn next_frame(&mut self) -> io::Result<Option<(StreamKind, String)>> {
        loop {
            match &mut self.state {
                DecodeState::Header { filled } => {
                    let n = self.inner.read(&mut self.header[*filled..]).await?;
                    if n == 0 {
                        if *filled == 0 {
                            return Ok(None);
                        }
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "log stream ended inside a frame header",
                        ));
                    }
                    *filled += n;
                    if *filled < HEADER_LEN {
                        continue;
                    }

                    let kind = if self.header[0] == STDERR_SELECTOR {
                        StreamKind::Stderr
                    } else {
                        StreamKind::Stdout
                    };
                    let len = u32::from_be_bytes([
                        self.header[4],
                        self.header[5],
                        self.header[6],
                        self.header[7],
                    ]) as usize;

                    if len == 0 {
                        self.state = DecodeState::Header { filled: 0 };
                        return Ok(Some((kind, String::new())));
                    }
                    self.payload = vec![0; len];
                    self.state = DecodeState::Payload { kind, filled: 0 };
                }
                DecodeState::Payload { kind, filled } => {
                    let kind = *kind;
                    let n = self.inner.read(&mut self.payload[*filled..]).await?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "log stream ended inside a frame payload",
                        ));
                    }
                    *filled += n;
                    if *filled < self.payload.len() {
                        continue;
                    }

                    let mut payload = std::mem::take(&mut self.payload);
                    if payload.last() == Some(&b'\n') {
                        payload.pop();
                    }
                    self.state = DecodeState::Header { filled: 0 };
                    return Ok(Some((kind, String::from_utf8_lossy(&payload).into_owned())));
                }
            }
        }
    }
}

/// Encode one frame in the engine wire format.
///
/// Used by the Docker adapter to keep the attachment seam speaking the
/// engine's framing, and by tests to build fixtures.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(match kind {
        StreamKind::Stdout => 1,
        StreamKind::Stderr => STDERR_SELECTOR,
    });
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
