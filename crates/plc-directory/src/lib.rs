//! PLC directory ingestion, DID-document projection, and reverse lookups.

mod error;
mod paginator;
mod projector;
pub mod rate_limiter;
mod resolver;

pub use error::PlcError;
pub use paginator::{Paginator, PaginatorConfig};
pub use projector::{derive_handle, derive_pds_endpoint, project, DidDocument, ServiceEntry, VerificationMethod};
pub use rate_limiter::TokenBucket;
pub use resolver::Resolver;
