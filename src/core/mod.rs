// Core modules implementing the decode-and-batch pipeline, port storage, and error modeling.
pub mod batch;
pub mod conduit;
pub mod decode;
pub mod error;
pub mod file_store;
pub mod pipeline;
pub mod port;
pub mod relay;
pub mod store;
