//! Snapmatch Ingestion Coordinator
//!
//! Photo ingestion coordinator for the Snapmatch event photo matching
//! platform. The service takes client-computed content fingerprints, filters
//! out duplicates through an atomic dedup ledger, hands out time-limited
//! write credentials against S3-compatible storage, finalizes confirmed
//! uploads into the metadata store, and feeds the downstream matching worker
//! through a pair of priority work queues.
//!
//! ## Architecture
//!
//! ```text
//! Client                       Coordinator                    Backing stores
//! ┌──────────────┐            ┌──────────────┐               ┌──────────────┐
//! │ fingerprints │───────────▶│ Dedup Ledger │──────────────▶│ PostgreSQL   │
//! └──────────────┘  reserve   │ (DedupGate)  │               │ dedup_ledger │
//!        │                    └──────────────┘               │ event_photos │
//!        │ upload via                │                       │ selfies      │
//!        │ presigned URL             ▼                       └──────────────┘
//!        ▼                    ┌──────────────┐                      ▲
//! ┌──────────────┐  confirm   │ Metadata     │──────────────────────┘
//! │ S3 bucket    │◀───────────│ Store        │
//! └──────────────┘            └──────────────┘
//!                                    │
//!                                    ▼
//!                             ┌──────────────┐    selfie_queue (high)
//!                             │ Queue        │───▶
//!                             │ Publisher    │───▶ event_photo_queue (low)
//!                             └──────────────┘
//!                                    ▲
//!                             ┌──────────────┐
//!                             │ Reconciler   │  re-enqueues stuck pending
//!                             └──────────────┘  records, sweeps the ledger
//! ```
//!
//! Handlers are stateless; any number of coordinator instances can run
//! concurrently because the only strong guarantee — at most one successful
//! reservation per fingerprint — lives in the ledger's atomic check-and-set.

pub mod api;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod ingest;
pub mod ledger;
pub mod metadata_store;
pub mod queue;
pub mod reconciler;
pub mod s3_store;

#[cfg(test)]
pub(crate) mod fakes;

pub use config::Config;
pub use error::IngestError;
pub use fingerprint::Fingerprint;
pub use ingest::{BatchUploadResponse, ConfirmSummary, IngestCoordinator, MatchStatus};
pub use ledger::{DedupGate, PostgresLedger, ReserveOutcome};
pub use metadata_store::{MetadataStore, PostgresMetadataStore};
pub use queue::{KafkaQueuePublisher, Priority, QueuePublisher};
pub use reconciler::Reconciler;
pub use s3_store::{ObjectStore, S3PhotoStore};
