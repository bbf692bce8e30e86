//! Purpose: Wire relay, decoder, and batcher into a two-thread decode-and-batch pipeline.
//! Exports: `Pipeline`, `PipelineConfig`, `BatchStream`.
//! Role: Public entrypoint for turning a byte stream into ordered batches.
//! Invariants: A malformed document start fails before any stream is returned.
//! Invariants: The stream yields at most one error; after it (or the end) it yields `None` forever.
//! Invariants: Dropping or cancelling the stream unblocks both workers; exhausting it joins them.
//! Invariants: Both handoffs are zero-capacity, so at most one chunk and one batch are in flight.
use std::io::Read;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::batch::{Batch, Batcher};
use super::conduit::{CancelToken, ChunkSource, conduit};
use super::decode::ObjectDecoder;
use super::error::{Error, ErrorKind};
use super::relay::{self, RelayOutcome};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_BATCH_SIZE: usize = 20;
/// Largest accepted read chunk; the relay allocates one buffer of this size.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;
pub const MAX_BATCH_SIZE: usize = 10_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PipelineConfig {
    pub chunk_size: usize,
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl PipelineConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "chunk size must be between 1 and {MAX_CHUNK_SIZE} bytes"
                ))
                .with_hint("Pass a --chunk-size within range; the default is 65536."));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("batch size must be between 1 and {MAX_BATCH_SIZE}"))
                .with_hint("Pass a --batch-size within range; the default is 20."));
        }
        Ok(())
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Starts the pipeline over `input`.
    ///
    /// The opening `{` is read on the calling thread, so an empty or non-object
    /// document is reported here rather than through the stream.
    pub fn start<R>(input: R, config: PipelineConfig) -> Result<BatchStream, Error>
    where
        R: Read + Send + 'static,
    {
        config.validate()?;
        let cancel = CancelToken::new();
        let (writer, reader) = conduit();

        let relay_cancel = cancel.clone();
        let chunk_size = config.chunk_size;
        let relay = thread::Builder::new()
            .name("portload-relay".to_string())
            .spawn(move || relay::run(input, chunk_size, writer, &relay_cancel))
            .map_err(|err| spawn_error("relay", err))?;

        let mut decoder = ObjectDecoder::new(reader);
        if let Err(err) = decoder.open() {
            // Dropping the decoder releases the conduit; the relay exits on its next send.
            cancel.cancel();
            drop(decoder);
            drop(relay);
            return Err(err);
        }

        let (tx, rx) = sync_channel(0);
        let decode_cancel = cancel.clone();
        let batch_size = config.batch_size;
        let decode = match thread::Builder::new()
            .name("portload-decode".to_string())
            .spawn(move || decode_loop(decoder, batch_size, tx, &decode_cancel))
        {
            Ok(handle) => handle,
            Err(err) => {
                cancel.cancel();
                return Err(spawn_error("decode", err));
            }
        };

        debug!(chunk_size, batch_size, "pipeline started");
        Ok(BatchStream {
            rx: Some(rx),
            cancel,
            relay: Some(relay),
            decode: Some(decode),
        })
    }
}

fn spawn_error(worker: &str, err: std::io::Error) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message(format!("failed to spawn {worker} thread"))
        .with_source(err)
}

fn decode_loop<S: ChunkSource>(
    mut decoder: ObjectDecoder<S>,
    batch_size: usize,
    tx: SyncSender<Result<Batch, Error>>,
    cancel: &CancelToken,
) {
    let mut batcher = Batcher::new(batch_size);
    let mut entries = 0u64;
    let mut batches = 0u64;
    loop {
        if cancel.is_cancelled() {
            debug!(entries, batches, "decode cancelled");
            return;
        }
        match decoder.next_entry() {
            Ok(Some((key, record))) => {
                entries += 1;
                if let Some(batch) = batcher.push(key, record) {
                    if tx.send(Ok(batch)).is_err() {
                        debug!(entries, batches, "batch receiver dropped");
                        return;
                    }
                    batches += 1;
                }
            }
            Ok(None) => {
                if let Some(batch) = batcher.finish() {
                    if tx.send(Ok(batch)).is_err() {
                        debug!(entries, batches, "batch receiver dropped");
                        return;
                    }
                    batches += 1;
                }
                debug!(entries, batches, bytes = decoder.offset(), "decode finished");
                return;
            }
            Err(err) => {
                warn!(
                    kind = ?err.kind(),
                    error = %err,
                    entries,
                    batches,
                    "decode pipeline failed"
                );
                let _ = tx.send(Err(err));
                return;
            }
        }
    }
}

/// Ordered, finite stream of batches from one pipeline run.
pub struct BatchStream {
    rx: Option<Receiver<Result<Batch, Error>>>,
    cancel: CancelToken,
    relay: Option<JoinHandle<RelayOutcome>>,
    decode: Option<JoinHandle<()>>,
}

impl BatchStream {
    /// Stops both workers; the stream yields nothing afterwards.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx = None;
    }

    fn join_decode(&mut self) -> Result<(), Error> {
        match self.decode.take() {
            Some(handle) => handle.join().map_err(|_| {
                Error::new(ErrorKind::Internal).with_message("decode worker panicked")
            }),
            None => Ok(()),
        }
    }

    fn join_relay(&mut self) -> Result<(), Error> {
        match self.relay.take() {
            Some(handle) => handle.join().map(|_| ()).map_err(|_| {
                Error::new(ErrorKind::Internal).with_message("relay worker panicked")
            }),
            None => Ok(()),
        }
    }
}

impl Iterator for BatchStream {
    type Item = Result<Batch, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let received = self.rx.as_ref()?.recv();
        match received {
            Ok(Ok(batch)) => Some(Ok(batch)),
            Ok(Err(err)) => {
                // The relay may still be parked on a slow read; it exits on its next send.
                self.cancel();
                self.relay = None;
                let _ = self.join_decode();
                Some(Err(err))
            }
            Err(_) => {
                self.rx = None;
                let joined = self.join_decode().and_then(|()| self.join_relay());
                joined.err().map(Err)
            }
        }
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        if self.decode.is_some() {
            self.cancel.cancel();
        }
    }
}
