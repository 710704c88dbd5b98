//! Read-only HTTP query surface shared by the firehose consumer and the
//! PLC mirror.

mod error;
mod routes;

pub use error::ApiError;
pub use routes::{mirror_router, stream_router, MirrorState, StreamState};
