//! Store-backed point lookups: DID-document projection and reverse
//! handle/subject resolution. The paginator is authoritative for stored
//! state, so these never make an outbound HTTP call.

use std::sync::Arc;

use ingest_store::Store;

use crate::error::PlcError;
use crate::projector::{self, DidDocument};

pub struct Resolver {
    store: Arc<Store>,
}

impl Resolver {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn did_document(&self, subject: &str) -> Result<DidDocument, PlcError> {
        let op = self
            .store
            .latest_operation(subject)
            .await?
            .ok_or_else(|| PlcError::NotFound(subject.to_string()))?;
        projector::project(subject, &op.operation_json)
    }

    pub async fn subject_for_handle(&self, handle: &str) -> Result<String, PlcError> {
        self.store
            .subject_for_handle(handle)
            .await?
            .ok_or_else(|| PlcError::NotFound(handle.to_string()))
    }

    pub async fn handle_for_subject(&self, subject: &str) -> Result<String, PlcError> {
        self.store
            .handle_for_subject(subject)
            .await?
            .ok_or_else(|| PlcError::NotFound(subject.to_string()))
    }
}
