//! Purpose: Define the public Rust API boundary for portload.
//! Exports: Pipeline entry points, port types and stores, bulk upload, HTTP client.
//! Role: Additive-only surface used by the CLI, the gateway, and integration tests.
//! Invariants: Callers never see the byte conduit or the worker threads.

mod remote;
mod upload;

pub use crate::core::batch::{Batch, EntityRecord};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind, Stage};
pub use crate::core::file_store::FileStore;
pub use crate::core::pipeline::{
    BatchStream, DEFAULT_BATCH_SIZE, DEFAULT_CHUNK_SIZE, MAX_BATCH_SIZE, MAX_CHUNK_SIZE, Pipeline,
    PipelineConfig,
};
pub use crate::core::port::{Coordinates, Port, PortId, PortPatch};
pub use crate::core::store::{MemoryStore, PortStore};
pub use remote::RemoteClient;
pub use upload::{UploadOutcome, drain_into, upload_ports};
