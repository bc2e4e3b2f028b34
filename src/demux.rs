//! I/O demultiplexing for attached sandboxes.
//!
//! The attached connection carries stdout and stderr interleaved as tagged
//! frames. A splitter task routes each frame to its own byte stream; one
//! pump per stream cuts those bytes into lines. The two line sequences are
//! independent: each closes when its own byte stream ends.
//!
//! A line longer than [`MAX_LINE_BYTES`] is a fault. The pump reports
//! [`DemuxError::LineTooLong`] and closes that sequence; nothing is
//! truncated.

use bytes::Bytes;
use futures_util::StreamExt;
use std::io;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sandbox::{
    AttachedConnection, FrameStream, OutputFrame, SandboxError, SandboxId, SandboxRuntime,
    StdinWriter,
};

/// Longest accepted output line, excluding the newline.
pub(crate) const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Chunks or lines buffered per stream before the producer waits.
const CHANNEL_DEPTH: usize = 64;

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputChannel {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Faults that end an output line sequence early.
#[derive(Debug, thiserror::Error)]
pub(crate) enum DemuxError {
    /// A single line exceeded the line buffer.
    #[error("Output line on {channel} exceeded {limit} bytes")]
    LineTooLong { channel: OutputChannel, limit: usize },

    /// The attached connection broke.
    #[error("Lost connection to {channel}: {message}")]
    Connection {
        channel: OutputChannel,
        message: String,
    },
}

/// Ordered lines from one output stream; `None` once the stream is exhausted.
pub(crate) type LineReceiver = mpsc::Receiver<Result<String, DemuxError>>;

/// Write side of the sandbox's stdin.
pub(crate) struct StdinSink {
    writer: StdinWriter,
}

impl StdinSink {
    /// Write one line, terminated with a newline.
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await
    }

    /// Signal end-of-input without closing the read side of the connection.
    pub async fn close(&mut self) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await
    }
}

/// A sandbox's stdio split into a stdin sink and two line sequences.
pub(crate) struct DemuxedIo {
    pub stdin: StdinSink,
    pub stdout: LineReceiver,
    pub stderr: LineReceiver,
}

/// Attach to a sandbox that has not started yet and demultiplex its stdio.
pub(crate) async fn attach_io(
    runtime: &dyn SandboxRuntime,
    id: &SandboxId,
    cancel: CancellationToken,
) -> Result<DemuxedIo, SandboxError> {
    let AttachedConnection { output, input } = runtime.attach(id).await?;
    Ok(demultiplex(output, input, cancel))
}

/// Split a framed connection. Spawns the splitter and both line pumps.
pub(crate) fn demultiplex(
    output: FrameStream,
    input: StdinWriter,
    cancel: CancellationToken,
) -> DemuxedIo {
    let (stdout_bytes_tx, stdout_bytes_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (stderr_bytes_tx, stderr_bytes_rx) = mpsc::channel(CHANNEL_DEPTH);
    tokio::spawn(split_frames(
        output,
        stdout_bytes_tx,
        stderr_bytes_tx,
        cancel.clone(),
    ));

    let (stdout_tx, stdout) = mpsc::channel(CHANNEL_DEPTH);
    let (stderr_tx, stderr) = mpsc::channel(CHANNEL_DEPTH);
    tokio::spawn(pump_lines(
        OutputChannel::Stdout,
        stdout_bytes_rx,
        stdout_tx,
        cancel.clone(),
    ));
    tokio::spawn(pump_lines(
        OutputChannel::Stderr,
        stderr_bytes_rx,
        stderr_tx,
        cancel,
    ));

    DemuxedIo {
        stdin: StdinSink { writer: input },
        stdout,
        stderr,
    }
}

type ByteSender = mpsc::Sender<io::Result<Bytes>>;

/// Route frames to per-stream byte channels until the connection ends.
async fn split_frames(
    mut output: FrameStream,
    stdout: ByteSender,
    stderr: ByteSender,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = output.next() => frame,
        };

        // A closed receiver means that pump already gave up; keep routing the other
        match frame {
            Some(Ok(OutputFrame::Stdout(bytes))) => {
                let _ = stdout.send(Ok(bytes)).await;
            }
            Some(Ok(OutputFrame::Stderr(bytes))) => {
                let _ = stderr.send(Ok(bytes)).await;
            }
            Some(Err(e)) => {
                debug!("Attached stream failed: {}", e);
                let message = e.to_string();
                let _ = stdout.send(Err(io::Error::other(message.clone()))).await;
                let _ = stderr.send(Err(io::Error::other(message))).await;
                break;
            }
            None => break,
        }
    }
}

/// Cut one byte stream into lines, stopping at the first fault.
async fn pump_lines(
    channel: OutputChannel,
    bytes: mpsc::Receiver<io::Result<Bytes>>,
    lines: mpsc::Sender<Result<String, DemuxError>>,
    cancel: CancellationToken,
) {
    let reader = StreamReader::new(ReceiverStream::new(bytes));
    let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE_BYTES);
    let mut framed = FramedRead::new(reader, codec);

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = framed.next() => next,
        };

        let item = match next {
            Some(Ok(line)) => Ok(decode_line(&line)),
            Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                Err(DemuxError::LineTooLong {
                    channel,
                    limit: MAX_LINE_BYTES,
                })
            }
            Some(Err(AnyDelimiterCodecError::Io(e))) => Err(DemuxError::Connection {
                channel,
                message: e.to_string(),
            }),
            None => break,
        };

        let fault = item.is_err();
        if lines.send(item).await.is_err() || fault {
            break;
        }
    }
}

/// Lossy UTF-8 with a trailing carriage return removed.
fn decode_line(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
