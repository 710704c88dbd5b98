//! Optional BigQuery fan-out for ingested stream records.
//!
//! This crate has no knowledge of the firehose wire format; callers
//! translate decoded records into [`WarehouseRow`] values and hand them
//! to a [`WarehouseSink`].

mod error;
mod sink;

pub use error::WarehouseError;
pub use sink::{WarehouseConfig, WarehouseRow, WarehouseSink, MAX_BUFFER_ROWS};
