//! Firehose transport and content-addressed commit decoding.
//!
//! This crate knows how to talk to a relay's `subscribeRepos` WebSocket and
//! how to pull verified record bytes out of the CAR bundles commit frames
//! carry. It does not know about storage, scheduling, or identity
//! resolution — those live in sibling crates.

pub mod car;
mod error;
pub mod firehose;

pub use error::AtprotoError;
pub use firehose::{
    CommitFrame, DEFAULT_FIREHOSE_URL, Frame, FirehoseClient, IdentityFrame, Liveness, RepoOp,
};
