//! Purpose: Chunk relay stage; copies the input stream into the byte conduit.
//! Exports: `run`, `RelayOutcome`.
//! Role: Producer half of the pipeline, runs on its own thread.
//! Invariants: Bytes are forwarded in order and unmodified, at most `chunk_size` per chunk.
//! Invariants: The conduit is closed exactly once on every exit path.
//! Invariants: Read failures (other than `Interrupted`) end the relay with `ReadFailure`.
use std::io::{self, Read};

use tracing::{debug, warn};

use super::conduit::{CancelToken, ConduitWriter};
use super::error::{Error, ErrorKind, Stage};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RelayStatus {
    Completed,
    Failed,
    Cancelled,
    ReaderGone,
}

#[derive(Copy, Clone, Debug)]
pub struct RelayOutcome {
    pub status: RelayStatus,
    pub chunks: u64,
    pub bytes: u64,
}

pub fn run<R: Read>(
    mut input: R,
    chunk_size: usize,
    writer: ConduitWriter,
    cancel: &CancelToken,
) -> RelayOutcome {
    let mut outcome = RelayOutcome {
        status: RelayStatus::Completed,
        chunks: 0,
        bytes: 0,
    };

    let mut buf = vec![0u8; chunk_size];
    loop {
        if cancel.is_cancelled() {
            outcome.status = RelayStatus::Cancelled;
            writer.close();
            break;
        }
        let read = match input.read(&mut buf) {
            Ok(0) => {
                writer.close();
                break;
            }
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(error = %err, bytes = outcome.bytes, "input stream read failed");
                outcome.status = RelayStatus::Failed;
                writer.fail(
                    Error::new(ErrorKind::ReadFailure)
                        .with_stage(Stage::Relay)
                        .with_message("failed to read input stream")
                        .with_offset(outcome.bytes)
                        .with_source(err),
                );
                break;
            }
        };
        if writer.send(buf[..read].to_vec()).is_err() {
            outcome.status = RelayStatus::ReaderGone;
            break;
        }
        outcome.chunks += 1;
        outcome.bytes += read as u64;
    }

    debug!(
        status = ?outcome.status,
        chunks = outcome.chunks,
        bytes = outcome.bytes,
        "chunk relay finished"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::{RelayStatus, run};
    use crate::core::conduit::{CancelToken, ChunkSource, conduit};
    use crate::core::error::{ErrorKind, Stage};
    use std::io::{self, Read};
    use std::thread;

    struct FailAfter {
        data: io::Cursor<Vec<u8>>,
        reads_left: usize,
    }

    impl Read for FailAfter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.reads_left == 0 {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"));
            }
            self.reads_left -= 1;
            self.data.read(buf)
        }
    }

    fn drain(reader: &mut impl ChunkSource) -> (Vec<Vec<u8>>, Option<ErrorKind>) {
        let mut chunks = Vec::new();
        loop {
            match reader.next_chunk() {
                Ok(Some(chunk)) => chunks.push(chunk),
                Ok(None) => return (chunks, None),
                Err(err) => return (chunks, Some(err.kind())),
            }
        }
    }

    #[test]
    fn relays_fixed_size_chunks_in_order() {
        let (writer, mut reader) = conduit();
        let cancel = CancelToken::new();
        let handle = thread::spawn(move || run(&b"abcdefg"[..], 3, writer, &cancel));

        let (chunks, err) = drain(&mut reader);
        assert_eq!(chunks, vec![b"abc".to_vec(), b"def".to_vec(), b"g".to_vec()]);
        assert!(err.is_none());
        let outcome = handle.join().expect("join");
        assert_eq!(outcome.status, RelayStatus::Completed);
        assert_eq!(outcome.bytes, 7);
    }

    #[test]
    fn read_failure_closes_conduit_with_error() {
        let (writer, mut reader) = conduit();
        let cancel = CancelToken::new();
        let input = FailAfter {
            data: io::Cursor::new(b"0123456789".to_vec()),
            reads_left: 2,
        };
        let handle = thread::spawn(move || run(input, 4, writer, &cancel));

        let mut chunks = Vec::new();
        let err = loop {
            match reader.next_chunk() {
                Ok(Some(chunk)) => chunks.push(chunk),
                Ok(None) => panic!("expected failure"),
                Err(err) => break err,
            }
        };
        assert_eq!(chunks.len(), 2);
        assert_eq!(err.kind(), ErrorKind::ReadFailure);
        assert_eq!(err.stage(), Some(Stage::Relay));
        assert_eq!(err.offset(), Some(8));
        assert_eq!(handle.join().expect("join").status, RelayStatus::Failed);
    }

    #[test]
    fn stops_when_reader_is_dropped() {
        let (writer, reader) = conduit();
        drop(reader);
        let cancel = CancelToken::new();
        let outcome = run(&b"abc"[..], 1, writer, &cancel);
        assert_eq!(outcome.status, RelayStatus::ReaderGone);
        assert_eq!(outcome.chunks, 0);
    }

    #[test]
    fn stops_when_cancelled() {
        let (writer, mut reader) = conduit();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = run(&b"abc"[..], 1, writer, &cancel);
        assert_eq!(outcome.status, RelayStatus::Cancelled);
        assert_eq!(reader.next_chunk().expect("closed"), None);
    }
}
