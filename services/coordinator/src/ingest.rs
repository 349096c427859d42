use crate::error::IngestError;
use crate::fingerprint::Fingerprint;
use crate::ledger::{DedupGate, ReserveOutcome};
use crate::metadata_store::{
    selfie_status, InsertOutcome, MetadataStore, NewPhotoRecord, NewSelfieRecord,
};
use crate::queue::{Priority, QueuePublisher};
use crate::s3_store::{ObjectStore, PresignedRequest};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Per-fingerprint write credential issued to an uploading client
#[derive(Debug, Clone, Serialize)]
pub struct UploadCredential {
    /// PUT-scoped presigned URL for exactly one object key
    pub url: String,
    /// When the credential stops working
    pub expires_at: DateTime<Utc>,
}

impl From<PresignedRequest> for UploadCredential {
    fn from(p: PresignedRequest) -> Self {
        Self {
            url: p.url,
            expires_at: p.expires_at,
        }
    }
}

/// Result of a batch credential request.
///
/// A fingerprint missing from both maps was already known — omission is the
/// caller's signal "do not upload". Failures are per item; one bad entry never
/// fails the batch.
#[derive(Debug, Default, Serialize)]
pub struct BatchUploadResponse {
    /// Newly reserved fingerprints and their write credentials
    pub upload_urls: HashMap<String, UploadCredential>,
    /// Per-fingerprint failures, reported in-band
    pub failures: HashMap<String, String>,
}

/// Result of a batch confirmation
#[derive(Debug, Default, Serialize)]
pub struct ConfirmSummary {
    /// Records newly created and enqueued
    pub confirmed: usize,
    /// Fingerprints that already had a metadata record
    pub already_ingested: usize,
    /// Per-fingerprint failures, reported in-band
    pub failures: HashMap<String, String>,
}

/// Successful selfie intake
#[derive(Debug, Clone, Serialize)]
pub struct SelfieAccepted {
    /// Fingerprint of the selfie, used for subsequent match polling
    pub selfie_id: String,
    /// Session token identifying the submitter
    pub owner_token: Uuid,
}

/// A matched event photo with a freshly minted read credential
#[derive(Debug, Clone, Serialize)]
pub struct MatchedPhoto {
    pub photo_id: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Current state of a selfie's matching run
#[derive(Debug)]
pub enum MatchStatus {
    NotFound,
    Pending,
    Failed,
    Completed(Vec<MatchedPhoto>),
}

/// The ingestion coordinator.
///
/// Stateless orchestration over the four backing stores; every instance of
/// this service can run the same operations concurrently because all
/// coordination state lives behind the `DedupGate`. The ledger's atomic
/// `reserve` is the one strong guarantee everything else leans on.
pub struct IngestCoordinator {
    ledger: Arc<dyn DedupGate>,
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    queue: Arc<dyn QueuePublisher>,
    content_type: String,
}

impl IngestCoordinator {
    pub fn new(
        ledger: Arc<dyn DedupGate>,
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        queue: Arc<dyn QueuePublisher>,
        content_type: String,
    ) -> Self {
        Self {
            ledger,
            metadata,
            objects,
            queue,
            content_type,
        }
    }

    /// Filter a batch of fingerprints down to the genuinely new ones, reserve
    /// them, and issue write credentials.
    ///
    /// Each fingerprint is handled independently: the ledger is consulted
    /// first, the metadata store is the backstop, and only a won reservation
    /// earns a credential. Duplicate fingerprints inside one batch collapse
    /// through the same path — the second occurrence finds the first one's
    /// reservation and is skipped.
    #[instrument(skip(self, fingerprints), fields(batch_size = fingerprints.len()))]
    pub async fn issue_upload_credentials(
        &self,
        fingerprints: Vec<Fingerprint>,
    ) -> Result<BatchUploadResponse, IngestError> {
        // One round trip for the metadata backstop; the ledger check below is
        // per item and live, which is what makes in-batch duplicates collapse.
        let known = self.metadata.known_photos(&fingerprints).await?;

        let mut response = BatchUploadResponse::default();

        for fingerprint in fingerprints {
            let id = fingerprint.encode();

            match self.ledger.exists(&fingerprint).await {
                Ok(true) => {
                    metrics::counter!("coordinator.batch.duplicates").increment(1);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    response.failures.insert(id, e.to_string());
                    continue;
                }
            }

            if known.contains(&fingerprint) {
                metrics::counter!("coordinator.batch.duplicates").increment(1);
                continue;
            }

            match self.ledger.reserve(&fingerprint).await {
                Ok(ReserveOutcome::AlreadyKnown) => {
                    // Lost the race; same outcome as a duplicate.
                    metrics::counter!("coordinator.batch.duplicates").increment(1);
                    continue;
                }
                Ok(ReserveOutcome::Reserved) => {}
                Err(e) => {
                    response.failures.insert(id, e.to_string());
                    continue;
                }
            }

            match self
                .objects
                .presign_upload(&id, &self.content_type)
                .await
            {
                Ok(presigned) => {
                    metrics::counter!("coordinator.batch.reserved").increment(1);
                    response.upload_urls.insert(id, presigned.into());
                }
                Err(e) => {
                    // The reservation stays; TTL expiry re-opens the
                    // fingerprint if the client never retries.
                    metrics::counter!("coordinator.batch.failures").increment(1);
                    response.failures.insert(id, e.to_string());
                }
            }
        }

        debug!(
            issued = response.upload_urls.len(),
            failed = response.failures.len(),
            "Batch credential request processed"
        );

        Ok(response)
    }

    /// Finalize client-reported uploads: confirm the ledger entry, persist the
    /// photo record, and hand the fingerprint to the matching worker.
    ///
    /// The three steps are not atomic across each other. A record that makes
    /// it to the metadata store but misses its queue push stays `pending` and
    /// is re-enqueued by the reconciliation sweep.
    #[instrument(skip(self, fingerprints), fields(batch_size = fingerprints.len()))]
    pub async fn confirm_event_uploads(
        &self,
        fingerprints: Vec<Fingerprint>,
    ) -> Result<ConfirmSummary, IngestError> {
        let mut summary = ConfirmSummary::default();

        for fingerprint in fingerprints {
            let id = fingerprint.encode();

            if let Err(e) = self.ledger.confirm(&fingerprint).await {
                summary.failures.insert(id, e.to_string());
                continue;
            }

            let record = NewPhotoRecord {
                photo_id: fingerprint,
                storage_url: self.objects.locator(&id),
            };

            let outcome = match self.metadata.insert_photo(record).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    summary.failures.insert(id, e.to_string());
                    continue;
                }
            };

            if outcome == InsertOutcome::AlreadyIngested {
                summary.already_ingested += 1;
                metrics::counter!("coordinator.confirm.already_ingested").increment(1);
                continue;
            }

            match self.queue.publish(Priority::Low, &fingerprint).await {
                Ok(()) => {
                    summary.confirmed += 1;
                    metrics::counter!("coordinator.confirm.created").increment(1);
                }
                Err(e) => {
                    // Record exists and is pending; the reconciler re-enqueues.
                    warn!(fingerprint = %id, error = %e, "Queue push failed after metadata insert");
                    summary.failures.insert(id, e.to_string());
                }
            }
        }

        info!(
            confirmed = summary.confirmed,
            already_ingested = summary.already_ingested,
            failed = summary.failures.len(),
            "Upload confirmation processed"
        );

        Ok(summary)
    }

    /// Synchronous selfie intake: fingerprint, reserve, upload server-side,
    /// persist, enqueue high-priority, confirm.
    ///
    /// Unlike the batch path a duplicate is rejected with an error, because a
    /// selfie submission expects exactly one direct answer. The atomic reserve
    /// is the only duplicate gate; losing it means someone else's identical
    /// bytes are already in flight.
    #[instrument(skip(self, image), fields(size_bytes = image.len()))]
    pub async fn ingest_selfie(&self, image: Bytes) -> Result<SelfieAccepted, IngestError> {
        let fingerprint = Fingerprint::digest(&image)?;
        let id = fingerprint.encode();

        if self.ledger.reserve(&fingerprint).await? == ReserveOutcome::AlreadyKnown {
            metrics::counter!("coordinator.selfie.duplicates").increment(1);
            return Err(IngestError::DuplicateContent);
        }

        if let Err(e) = self.objects.put(&id, image, &self.content_type).await {
            // The bytes never landed; re-open the fingerprint instead of
            // wedging it until the reservation expires.
            if let Err(release_err) = self.ledger.release(&fingerprint).await {
                warn!(fingerprint = %id, error = %release_err, "Failed to release reservation");
            }
            return Err(e.into());
        }

        let record = NewSelfieRecord {
            selfie_id: fingerprint,
            owner_token: Uuid::new_v4(),
            storage_url: self.objects.locator(&id),
        };
        let owner_token = record.owner_token;

        if self.metadata.insert_selfie(record).await? == InsertOutcome::AlreadyIngested {
            // Reservation won but a durable record exists: the ledger entry
            // must have expired ahead of the metadata backstop. Already
            // ingested, so reject as a duplicate rather than surface a fault.
            self.ledger.confirm(&fingerprint).await?;
            metrics::counter!("coordinator.selfie.duplicates").increment(1);
            return Err(IngestError::DuplicateContent);
        }

        if let Err(e) = self.queue.publish(Priority::High, &fingerprint).await {
            // The record is durable and pending; the reconciler re-enqueues.
            warn!(fingerprint = %id, error = %e, "Queue push failed after selfie insert");
        }

        self.ledger.confirm(&fingerprint).await?;

        metrics::counter!("coordinator.selfie.accepted").increment(1);
        info!(selfie_id = %id, "Selfie accepted");

        Ok(SelfieAccepted {
            selfie_id: id,
            owner_token,
        })
    }

    /// Read the current match status of a previously submitted selfie.
    ///
    /// Completed results mint a fresh read credential per matched photo on
    /// every call; nothing is cached. A matched photo that no longer resolves
    /// in object storage is omitted from the response, never a hard failure.
    /// Pending and failed statuses touch only the metadata store.
    #[instrument(skip(self), fields(selfie_id = %selfie_id))]
    pub async fn poll_matches(&self, selfie_id: &Fingerprint) -> Result<MatchStatus, IngestError> {
        let record = match self.metadata.find_selfie(selfie_id).await? {
            Some(record) => record,
            None => return Ok(MatchStatus::NotFound),
        };

        match record.status.as_str() {
            selfie_status::FAILED => Ok(MatchStatus::Failed),
            selfie_status::COMPLETED => {
                let mut matches = Vec::with_capacity(record.matched_photo_ids.len());

                for photo_id in &record.matched_photo_ids {
                    match self.resolve_match(photo_id).await {
                        Some(matched) => matches.push(matched),
                        None => {
                            metrics::counter!("coordinator.matches.unresolved").increment(1);
                        }
                    }
                }

                metrics::counter!("coordinator.matches.served")
                    .increment(matches.len() as u64);
                Ok(MatchStatus::Completed(matches))
            }
            _ => Ok(MatchStatus::Pending),
        }
    }

    async fn resolve_match(&self, photo_id: &str) -> Option<MatchedPhoto> {
        match self.objects.exists(photo_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(photo_id = %photo_id, "Matched photo no longer resolves in object storage");
                return None;
            }
            Err(e) => {
                warn!(photo_id = %photo_id, error = %e, "Failed to check matched photo");
                return None;
            }
        }

        match self.objects.presign_download(photo_id).await {
            Ok(presigned) => Some(MatchedPhoto {
                photo_id: photo_id.to_string(),
                url: presigned.url,
                expires_at: presigned.expires_at,
            }),
            Err(e) => {
                warn!(photo_id = %photo_id, error = %e, "Failed to presign matched photo");
                None
            }
        }
    }
}
