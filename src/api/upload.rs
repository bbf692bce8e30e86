//! Purpose: Bulk consumer that drains pipeline batches into a `PortStore`.
//! Exports: `upload_ports`, `drain_into`, `UploadOutcome`.
//! Role: Shared ingest path for the CLI `upload` command and the gateway upload route.
//! Invariants: One `bulk_upsert` per batch; the first failure stops draining.
//! Invariants: Batches committed before a failure stay committed.
use std::io::Read;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::batch::Batch;
use crate::core::error::Error;
use crate::core::pipeline::{Pipeline, PipelineConfig};
use crate::core::port::Port;
use crate::core::store::PortStore;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct UploadOutcome {
    pub batches: u64,
    pub ports: u64,
}

/// Runs the pipeline over `input` and upserts every batch into `store`.
pub fn upload_ports<R, S>(input: R, config: PipelineConfig, store: &S) -> Result<UploadOutcome, Error>
where
    R: Read + Send + 'static,
    S: PortStore + ?Sized,
{
    let stream = Pipeline::start(input, config)?;
    drain_into(stream, store)
}

/// Drains any batch source into `store`, stopping at the first error.
pub fn drain_into<I, S>(batches: I, store: &S) -> Result<UploadOutcome, Error>
where
    I: IntoIterator<Item = Result<Batch, Error>>,
    S: PortStore + ?Sized,
{
    let mut outcome = UploadOutcome::default();
    for batch in batches {
        let batch = batch.inspect_err(|err| {
            warn!(kind = ?err.kind(), error = %err, batches = outcome.batches, "upload aborted");
        })?;
        let ports = batch
            .into_iter()
            .map(|(slug, record)| Port::from_entity(&slug, record))
            .collect::<Result<Vec<_>, _>>()?;
        let written = store.bulk_upsert(ports)?;
        outcome.batches += 1;
        outcome.ports += written as u64;
        debug!(batch = outcome.batches, ports = written, "batch upserted");
    }
    info!(batches = outcome.batches, ports = outcome.ports, "upload finished");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::{drain_into, upload_ports};
    use crate::core::error::ErrorKind;
    use crate::core::pipeline::PipelineConfig;
    use crate::core::port::PortId;
    use crate::core::store::{MemoryStore, PortStore};
    use std::io::Cursor;

    const PORTS: &str = r#"{
        "AEAJM": {"name": "Ajman", "city": "Ajman", "country": "United Arab Emirates",
                  "coordinates": [55.5136433, 25.4052165], "unlocs": ["AEAJM"], "code": "52000"},
        "AEAUH": {"name": "Abu Dhabi", "city": "Abu Dhabi", "country": "United Arab Emirates",
                  "coordinates": [54.37, 24.47], "unlocs": ["AEAUH"], "code": "52001"},
        "AEDXB": {"name": "Dubai", "city": "Dubai", "country": "United Arab Emirates",
                  "coordinates": [55.27, 25.2], "unlocs": ["AEDXB"], "code": "52005"}
    }"#;

    #[test]
    fn uploads_every_batch() {
        let store = MemoryStore::new();
        let config = PipelineConfig::default().with_batch_size(2).with_chunk_size(17);
        let outcome = upload_ports(Cursor::new(PORTS.as_bytes().to_vec()), config, &store)
            .expect("upload");
        assert_eq!(outcome.batches, 2);
        assert_eq!(outcome.ports, 3);
        let dubai = store.fetch(&PortId::Slug("AEDXB".into())).expect("fetch");
        assert_eq!(dubai.name, "Dubai");
        assert_eq!(dubai.unlocks, ["AEDXB"]);
    }

    #[test]
    fn repeated_upload_is_idempotent() {
        let store = MemoryStore::new();
        for _ in 0..2 {
            upload_ports(
                Cursor::new(PORTS.as_bytes().to_vec()),
                PipelineConfig::default(),
                &store,
            )
            .expect("upload");
        }
        let ports = store.list().expect("list");
        assert_eq!(ports.len(), 3);
        assert_eq!(ports.iter().map(|p| p.id).collect::<Vec<_>>(), [1, 2, 3]);
    }

    #[test]
    fn conversion_failure_stops_after_committed_batches() {
        let store = MemoryStore::new();
        let input = r#"{"A":{"name":"a"},"B":{"name":"b"},"C":{"name":5}}"#;
        let config = PipelineConfig::default().with_batch_size(2);
        let err = upload_ports(Cursor::new(input.as_bytes().to_vec()), config, &store)
            .expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert_eq!(err.key(), Some("C"));
        assert_eq!(store.list().expect("list").len(), 2);
    }

    #[test]
    fn pipeline_error_is_returned() {
        let store = MemoryStore::new();
        let err = upload_ports(
            Cursor::new(br#"{"A":{},"B""#.to_vec()),
            PipelineConfig::default(),
            &store,
        )
        .expect_err("truncated");
        assert_eq!(err.kind(), ErrorKind::ValueDecodeFailure);
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn drain_into_accepts_any_batch_source() {
        let store = MemoryStore::new();
        let outcome = drain_into(Vec::new(), &store).expect("empty");
        assert_eq!(outcome.batches, 0);
        assert_eq!(outcome.ports, 0);
    }
}
