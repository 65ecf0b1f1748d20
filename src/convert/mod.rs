pub mod parser;
pub mod resizer;
pub mod serializer;
pub mod worker;

pub use parser::{ArrowJsonParser, JsonParser, ParseError, ParsedBatch};
pub use resizer::Resizer;
pub use serializer::{SerializedBatch, Serializer};
pub use worker::{run_worker, ConvertMetrics};

use thiserror::Error;

/// Fatal conversion failures. Parse errors are handled inside the worker
/// and never surface here.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("row {seq} serializes to {size} bytes, exceeding the IPC message ceiling")]
    OversizedRow { seq: u64, size: usize },

    #[error("serialized message is {size} bytes, exceeding the {max} byte ceiling")]
    MessageTooLarge { size: usize, max: usize },

    #[error("ipc serialization error: {0}")]
    Ipc(#[from] arrow::error::ArrowError),
}
