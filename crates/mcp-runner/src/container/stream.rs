//! Line-oriented plumbing between a container process and the session.
//!
//! stdout and stderr are decoded into complete, non-empty text lines and
//! delivered in batches over a channel; stdin accepts newline-framed writes.

use bytes::BytesMut;
use futures::StreamExt;
use log::{debug, warn};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead};

use mcp_runner_protocol::LogStream;

/// Lines retained per stream for diagnostics.
pub const HISTORY_LIMIT: usize = 100;

/// Upper bound on lines delivered in one batch.
const MAX_BATCH_LINES: usize = 64;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Lines flushed together from one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBatch {
    pub stream: LogStream,
    pub lines: Vec<String>,
}

/// Longest line kept from container output; longer lines are dropped.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Splits a byte stream on `\n`.
///
/// Bytes are buffered until a newline arrives, so both partial lines and
/// multi-byte characters split across reads are reassembled. A trailing `\r`
/// is stripped and empty lines are skipped. Lines longer than the maximum
/// length are discarded up to their newline.
#[derive(Debug)]
pub struct LineCodec {
    /// Offset up to which the buffer is known not to contain a newline.
    next_index: usize,
    max_length: usize,
    /// Set while skipping the remainder of an overlong line.
    discarding: bool,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }
}

impl LineCodec {
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
            discarding: false,
        }
    }

    fn discard(&mut self, buf: &mut BytesMut) {
        if !self.discarding {
            warn!(
                "Discarding container output line longer than {} bytes",
                self.max_length
            );
        }
        self.discarding = true;
        self.next_index = 0;
        buf.clear();
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.strip_suffix('\r').unwrap_or(&text).to_string()
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let Some(offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') else {
                if buf.len() > self.max_length {
                    self.discard(buf);
                } else {
                    self.next_index = buf.len();
                }
                return Ok(None);
            };

            let newline = self.next_index + offset;
            self.next_index = 0;
            let raw = buf.split_to(newline + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if newline > self.max_length {
                warn!(
                    "Discarding container output line of {} bytes (limit {})",
                    newline, self.max_length
                );
                continue;
            }

            let line = decode_line(&raw[..newline]);
            if !line.is_empty() {
                return Ok(Some(line));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if self.discarding {
            self.discarding = false;
            self.next_index = 0;
            buf.clear();
            return Ok(None);
        }
        if buf.is_empty() {
            return Ok(None);
        }

        self.next_index = 0;
        let rest = buf.split();
        let line = decode_line(&rest);
        Ok((!line.is_empty()).then_some(line))
    }
}

#[derive(Debug, Default)]
struct History {
    stdout: VecDeque<String>,
    stderr: VecDeque<String>,
}

impl History {
    fn stream_mut(&mut self, stream: LogStream) -> &mut VecDeque<String> {
        match stream {
            LogStream::Stdout => &mut self.stdout,
            LogStream::Stderr => &mut self.stderr,
        }
    }

    fn push(&mut self, stream: LogStream, lines: &[String]) {
        let history = self.stream_mut(stream);
        history.extend(lines.iter().cloned());
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }
}

/// Owns the stdio of one container process.
pub struct StreamBridge {
    stdin: tokio::sync::Mutex<Option<BoxedWriter>>,
    history: Arc<Mutex<History>>,
    readers: Vec<JoinHandle<()>>,
}

impl StreamBridge {
    /// Start reading stdout and stderr; batches are sent on `batches` in the
    /// order the decoder produces them.
    pub fn spawn(
        stdin: BoxedWriter,
        stdout: BoxedReader,
        stderr: BoxedReader,
        batches: mpsc::UnboundedSender<OutputBatch>,
    ) -> Self {
        let history = Arc::new(Mutex::new(History::default()));

        let readers = vec![
            tokio::spawn(pump(
                LogStream::Stdout,
                stdout,
                Arc::clone(&history),
                batches.clone(),
            )),
            tokio::spawn(pump(LogStream::Stderr, stderr, Arc::clone(&history), batches)),
        ];

        Self {
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            history,
            readers,
        }
    }

    /// Write one line to stdin.
    ///
    /// Never fails: a broken pipe is logged, the writer is dropped and `false`
    /// is returned for this and every later call.
    pub async fn write_line(&self, line: &str) -> bool {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            debug!("stdin already closed, dropping {} bytes", line.len());
            return false;
        };

        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');

        let result = async {
            stdin.write_all(&data).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!("Failed to write to container stdin: {}", e);
            *guard = None;
            return false;
        }
        true
    }

    /// Most recent lines of a stream, oldest first.
    pub fn history(&self, stream: LogStream) -> Vec<String> {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.stream_mut(stream).iter().cloned().collect()
    }
}

impl Drop for StreamBridge {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

async fn pump(
    stream: LogStream,
    reader: BoxedReader,
    history: Arc<Mutex<History>>,
    batches: mpsc::UnboundedSender<OutputBatch>,
) {
    let mut lines = FramedRead::new(reader, LineCodec::default()).ready_chunks(MAX_BATCH_LINES);

    while let Some(chunk) = lines.next().await {
        let mut batch = Vec::with_capacity(chunk.len());
        let mut failed = false;
        for item in chunk {
            match item {
                Ok(line) => batch.push(line),
                Err(e) => {
                    warn!("Error reading container {:?}: {}", stream, e);
                    failed = true;
                    break;
                }
            }
        }

        if !batch.is_empty() {
            history
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(stream, &batch);
            if batches.send(OutputBatch { stream, lines: batch }).is_err() {
                break;
            }
        }

        if failed {
            break;
        }
    }

    debug!("Container {:?} reached end of stream", stream);
}
