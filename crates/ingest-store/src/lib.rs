//! Embedded single-writer SQL store shared by the firehose consumer and the
//! PLC mirror.

mod error;
mod models;
mod store;

pub use error::StoreError;
pub use models::{
    DirectoryCursor, EventFilter, EventRow, IdentityFilter, IdentityRow, NewEvent, NewOperation,
    NewRecord, OperationRow, RecordFilter, RecordRow,
};
pub use store::Store;
