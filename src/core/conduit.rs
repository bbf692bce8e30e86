//! Purpose: Zero-capacity byte pipe between the chunk relay and the decoder.
//! Exports: `conduit`, `ConduitWriter`, `ConduitReader`, `ChunkSource`, `CancelToken`.
//! Role: Backpressure point of the pipeline; at most one chunk is ever in flight.
//! Invariants: A chunk send blocks until the reader takes it (rendezvous channel).
//! Invariants: The write end closes exactly once, by ownership (close, fail, or drop).
//! Invariants: A failure close is observed by the reader as that exact `Error`.
//! Invariants: A write end dropped while its thread unwinds closes with `Internal`, never as end-of-input.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

use super::error::{Error, ErrorKind, Stage};

/// Shared cancellation flag observed by pipeline workers at every suspension point.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

enum Packet {
    Chunk(Vec<u8>),
    Failed(Error),
}

/// Reader side went away; the writer should stop relaying.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReaderGone;

pub fn conduit() -> (ConduitWriter, ConduitReader) {
    let (tx, rx) = sync_channel(0);
    (
        ConduitWriter { tx },
        ConduitReader {
            rx,
            state: ReaderState::Open,
        },
    )
}

pub struct ConduitWriter {
    tx: SyncSender<Packet>,
}

impl ConduitWriter {
    pub fn send(&self, chunk: Vec<u8>) -> Result<(), ReaderGone> {
        self.tx.send(Packet::Chunk(chunk)).map_err(|_| ReaderGone)
    }

    /// Closes the conduit normally.
    pub fn close(self) {}

    /// Closes the conduit with a failure the reader will surface instead of end-of-input.
    pub fn fail(self, err: Error) {
        let _ = self.tx.send(Packet::Failed(err));
    }
}

impl Drop for ConduitWriter {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let _ = self.tx.send(Packet::Failed(
                Error::new(ErrorKind::Internal)
                    .with_stage(Stage::Relay)
                    .with_message("input reader panicked"),
            ));
        }
    }
}

/// Pull-based supply of byte chunks for the decoder.
pub trait ChunkSource {
    /// Next chunk, `Ok(None)` at end of input.
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error>;
}

enum ReaderState {
    Open,
    Finished,
    Failed { kind: ErrorKind, message: String },
}

pub struct ConduitReader {
    rx: Receiver<Packet>,
    state: ReaderState,
}

impl ChunkSource for ConduitReader {
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error> {
        match &self.state {
            ReaderState::Finished => return Ok(None),
            ReaderState::Failed { kind, message } => {
                return Err(Error::new(*kind)
                    .with_stage(Stage::Relay)
                    .with_message(message.clone()));
            }
            ReaderState::Open => {}
        }
        match self.rx.recv() {
            Ok(Packet::Chunk(chunk)) => Ok(Some(chunk)),
            Ok(Packet::Failed(err)) => {
                self.state = ReaderState::Failed {
                    kind: err.kind(),
                    message: err.message().unwrap_or("input stream failed").to_string(),
                };
                Err(err)
            }
            Err(_) => {
                self.state = ReaderState::Finished;
                Ok(None)
            }
        }
    }
}
