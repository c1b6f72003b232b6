//! Newline-delimited JSON event stream for run progress
//!
//! Each line is one event:
//! - `{"type":"result","result":{..},"index":n}` per finished probe, in completion order
//! - `{"type":"complete","meta":{..}}` once, only for runs that were not cancelled
//! - `{"type":"error","error":".."}` when the run fails after streaming started

use crate::error::{EmitError, Result};
use crate::proxy::{CancelSignal, ProbeOutcome, Prober, RunReport, RunSummary, WorkerPool};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::info;

/// A single event on the wire
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent<'a> {
    Result {
        result: &'a ProbeOutcome,
        index: usize,
    },
    Complete {
        meta: &'a RunSummary,
    },
    Error {
        error: String,
    },
}

/// Serializes events to a writer, one flushed line per event
pub struct ResultStreamEmitter<W> {
    writer: Mutex<W>,
}

impl<W: Write> ResultStreamEmitter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn emit(&self, event: &StreamEvent<'_>) -> std::result::Result<(), EmitError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }

    pub fn emit_result(&self, index: usize, outcome: &ProbeOutcome) -> std::result::Result<(), EmitError> {
        self.emit(&StreamEvent::Result {
            result: outcome,
            index,
        })
    }

    pub fn emit_complete(&self, summary: &RunSummary) -> std::result::Result<(), EmitError> {
        self.emit(&StreamEvent::Complete { meta: summary })
    }

    pub fn emit_error(&self, error: impl Into<String>) -> std::result::Result<(), EmitError> {
        self.emit(&StreamEvent::Error {
            error: error.into(),
        })
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

/// Run `descriptors` through `pool`, streaming every event to `emitter`
///
/// The completion event is written only when the run was not cancelled. A write
/// failure while streaming cancels the run.
pub async fn stream_run<P, W>(
    pool: &WorkerPool<P>,
    descriptors: Vec<String>,
    emitter: Arc<ResultStreamEmitter<W>>,
    cancel: CancelSignal,
) -> Result<RunReport>
where
    P: Prober,
    W: Write + Send + 'static,
{
    let sink = Arc::clone(&emitter);
    let report = pool
        .run(
            descriptors,
            move |index, outcome| sink.emit_result(index, outcome),
            cancel,
        )
        .await?;

    match &report.summary {
        Some(summary) => emitter.emit_complete(summary)?,
        None => info!("Test was aborted, skipping final summary"),
    }

    Ok(report)
}

/// `io::Write` adapter feeding an unbounded channel, one message per write
///
/// Writes fail with `BrokenPipe` once the receiving side is dropped.
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Resolve once the receiving side has gone away
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream consumer disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Copy every line from `rx` into `out` until all writers are dropped
///
/// Pairs with [`ChannelWriter`] so lanes only enqueue lines and blocking output
/// such as stdout is written from one task. When `out` fails the receiver is
/// dropped, which turns further emits into delivery failures.
pub async fn drain_to<W>(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, mut out: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    while let Some(line) = rx.recv().await {
        out.write_all(&line).await?;
        out.flush().await?;
    }
    Ok(())
}
