//! # Batch Source / Batch Client
//!
//! External collaborator contracts plus the in-process static datasource connector.

pub mod static_datasource;
pub mod traits;

pub use static_datasource::{StaticBatchHandler, StaticDatasource};
pub use traits::{
    BatchClient, BatchOutcome, BatchSource, GetNextBatchRangeRequest, GetNextBatchRangeResponse,
    RunBatchRequest, RunBatchResponse,
};
