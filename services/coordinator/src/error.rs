use crate::fingerprint::FingerprintError;
use crate::ledger::LedgerError;
use crate::metadata_store::MetadataError;
use crate::queue::QueueError;
use crate::s3_store::ObjectStoreError;
use thiserror::Error;

/// Ingestion error taxonomy.
///
/// `DuplicateContent` covers both an existing ledger/metadata entry and a lost
/// reservation race — callers treat the two identically, so the coordinator
/// collapses them. Backing-store variants all mean "upstream unavailable";
/// batch paths report them per item, the synchronous selfie path maps them to
/// a 503.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("duplicate content")]
    DuplicateContent,

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<FingerprintError> for IngestError {
    fn from(e: FingerprintError) -> Self {
        IngestError::InvalidImage(e.to_string())
    }
}

impl IngestError {
    /// Whether this is a normal dedup outcome rather than a fault
    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestError::DuplicateContent)
    }
}
