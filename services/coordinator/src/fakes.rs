//! In-memory implementations of the backing-store traits, used by unit tests.
//!
//! `MemoryLedger` keeps time with `tokio::time::Instant` so TTL behavior can
//! be exercised under paused test time.

use crate::fingerprint::Fingerprint;
use crate::ledger::{DedupGate, LedgerError, ReserveOutcome};
use crate::metadata_store::{
    InsertOutcome, MetadataError, MetadataStore, NewPhotoRecord, NewSelfieRecord, RecordKind,
    SelfieRecord,
};
use crate::queue::{Priority, QueueError, QueuePublisher};
use crate::s3_store::{ObjectStore, ObjectStoreError, PresignedRequest};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Reserved,
    Confirmed,
}

#[derive(Debug, Clone, Copy)]
struct LedgerEntry {
    state: EntryState,
    expires_at: Option<Instant>,
}

impl LedgerEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| t > now)
    }
}

/// In-memory dedup ledger with real TTL semantics
pub struct MemoryLedger {
    entries: Mutex<HashMap<String, LedgerEntry>>,
    reserved_ttl: Duration,
    confirmed_ttl: Option<Duration>,
}

impl MemoryLedger {
    pub fn with_ttls(reserved_ttl: Duration, confirmed_ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            reserved_ttl,
            confirmed_ttl,
        }
    }
}

#[async_trait]
impl DedupGate for MemoryLedger {
    async fn reserve(&self, fingerprint: &Fingerprint) -> Result<ReserveOutcome, LedgerError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        if let Some(entry) = entries.get(&fingerprint.encode()) {
            if entry.is_live(now) {
                return Ok(ReserveOutcome::AlreadyKnown);
            }
        }

        entries.insert(
            fingerprint.encode(),
            LedgerEntry {
                state: EntryState::Reserved,
                expires_at: Some(now + self.reserved_ttl),
            },
        );
        Ok(ReserveOutcome::Reserved)
    }

    async fn confirm(&self, fingerprint: &Fingerprint) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        entries.insert(
            fingerprint.encode(),
            LedgerEntry {
                state: EntryState::Confirmed,
                expires_at: self.confirmed_ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, LedgerError> {
        let entries = self.entries.lock().unwrap();
        let now = Instant::now();

        Ok(entries
            .get(&fingerprint.encode())
            .map_or(false, |e| e.is_live(now)))
    }

    async fn release(&self, fingerprint: &Fingerprint) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().unwrap();
        let key = fingerprint.encode();

        if let Some(entry) = entries.get(&key) {
            if entry.state == EntryState::Reserved {
                entries.remove(&key);
            }
        }
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64, LedgerError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok((before - entries.len()) as u64)
    }
}

#[derive(Debug, Clone)]
struct PhotoRow {
    status: String,
    created_at: DateTime<Utc>,
    requeued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct SelfieRow {
    record: SelfieRecord,
    requeued_at: Option<DateTime<Utc>>,
}

/// In-memory metadata store with unique-key semantics
#[derive(Default)]
pub struct MemoryMetadataStore {
    photos: Mutex<HashMap<String, PhotoRow>>,
    selfies: Mutex<HashMap<String, SelfieRow>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn photo_count(&self) -> usize {
        self.photos.lock().unwrap().len()
    }

    pub fn photo_status(&self, fingerprint: &Fingerprint) -> Option<String> {
        self.photos
            .lock()
            .unwrap()
            .get(&fingerprint.encode())
            .map(|row| row.status.clone())
    }

    pub fn selfie_status(&self, fingerprint: &Fingerprint) -> Option<String> {
        self.selfies
            .lock()
            .unwrap()
            .get(&fingerprint.encode())
            .map(|row| row.record.status.clone())
    }

    /// Install a fully formed record, as the downstream worker would leave it
    pub fn push_selfie_record(&self, record: SelfieRecord) {
        self.selfies.lock().unwrap().insert(
            record.selfie_id.clone(),
            SelfieRow {
                record,
                requeued_at: None,
            },
        );
    }

    pub fn backdate_photo(&self, fingerprint: &Fingerprint, age: Duration) {
        if let Some(row) = self.photos.lock().unwrap().get_mut(&fingerprint.encode()) {
            row.created_at = Utc::now() - chrono::Duration::seconds(age.as_secs() as i64);
        }
    }

    pub fn backdate_selfie(&self, fingerprint: &Fingerprint, age: Duration) {
        if let Some(row) = self.selfies.lock().unwrap().get_mut(&fingerprint.encode()) {
            row.record.created_at =
                Utc::now() - chrono::Duration::seconds(age.as_secs() as i64);
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert_photo(&self, photo: NewPhotoRecord) -> Result<InsertOutcome, MetadataError> {
        let mut photos = self.photos.lock().unwrap();
        let key = photo.photo_id.encode();

        if photos.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyIngested);
        }

        photos.insert(
            key,
            PhotoRow {
                status: "pending".to_string(),
                created_at: Utc::now(),
                requeued_at: None,
            },
        );
        Ok(InsertOutcome::Created)
    }

    async fn insert_selfie(
        &self,
        selfie: NewSelfieRecord,
    ) -> Result<InsertOutcome, MetadataError> {
        let mut selfies = self.selfies.lock().unwrap();
        let key = selfie.selfie_id.encode();

        if selfies.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyIngested);
        }

        selfies.insert(
            key.clone(),
            SelfieRow {
                record: SelfieRecord {
                    selfie_id: key,
                    owner_token: selfie.owner_token,
                    storage_url: selfie.storage_url,
                    status: "pending".to_string(),
                    matched_photo_ids: vec![],
                    created_at: Utc::now(),
                },
                requeued_at: None,
            },
        );
        Ok(InsertOutcome::Created)
    }

    async fn known_photos(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<HashSet<Fingerprint>, MetadataError> {
        let photos = self.photos.lock().unwrap();
        Ok(fingerprints
            .iter()
            .filter(|fp| photos.contains_key(&fp.encode()))
            .copied()
            .collect())
    }

    async fn find_selfie(
        &self,
        selfie_id: &Fingerprint,
    ) -> Result<Option<SelfieRecord>, MetadataError> {
        Ok(self
            .selfies
            .lock()
            .unwrap()
            .get(&selfie_id.encode())
            .map(|row| row.record.clone()))
    }

    async fn claim_stale_pending(
        &self,
        kind: RecordKind,
        older_than: Duration,
    ) -> Result<Vec<Fingerprint>, MetadataError> {
        let now = Utc::now();
        let threshold = now - chrono::Duration::seconds(older_than.as_secs() as i64);
        let mut claimed = Vec::new();

        match kind {
            RecordKind::EventPhoto => {
                let mut photos = self.photos.lock().unwrap();
                for (id, row) in photos.iter_mut() {
                    if row.status == "pending"
                        && row.created_at < threshold
                        && row.requeued_at.map_or(true, |t| t < threshold)
                    {
                        row.requeued_at = Some(now);
                        if let Ok(fp) = id.parse() {
                            claimed.push(fp);
                        }
                    }
                }
            }
            RecordKind::Selfie => {
                let mut selfies = self.selfies.lock().unwrap();
                for (id, row) in selfies.iter_mut() {
                    if row.record.status == "pending"
                        && row.record.created_at < threshold
                        && row.requeued_at.map_or(true, |t| t < threshold)
                    {
                        row.requeued_at = Some(now);
                        if let Ok(fp) = id.parse() {
                            claimed.push(fp);
                        }
                    }
                }
            }
        }

        Ok(claimed)
    }
}

/// In-memory object store that counts its calls, so tests can assert which
/// paths touch storage
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    heads: AtomicUsize,
    download_presigns: AtomicUsize,
    fail_next_put: AtomicBool,
    failing_presigns: Mutex<HashSet<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn put_direct(&self, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn head_count(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }

    pub fn download_presign_count(&self) -> usize {
        self.download_presigns.load(Ordering::SeqCst)
    }

    pub fn fail_next_put(&self) {
        self.fail_next_put.store(true, Ordering::SeqCst);
    }

    pub fn fail_presign_for(&self, key: &str) {
        self.failing_presigns
            .lock()
            .unwrap()
            .insert(key.to_string());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn presign_upload(
        &self,
        key: &str,
        _content_type: &str,
    ) -> Result<PresignedRequest, ObjectStoreError> {
        if self.failing_presigns.lock().unwrap().contains(key) {
            return Err(ObjectStoreError::Presign {
                method: "PUT",
                key: key.to_string(),
                message: "injected presign failure".to_string(),
            });
        }

        Ok(PresignedRequest {
            url: format!("memory://upload/{key}"),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn presign_download(&self, key: &str) -> Result<PresignedRequest, ObjectStoreError> {
        let nonce = self.download_presigns.fetch_add(1, Ordering::SeqCst);
        Ok(PresignedRequest {
            url: format!("memory://download/{key}?sig={nonce}"),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        _content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        if self.fail_next_put.swap(false, Ordering::SeqCst) {
            return Err(ObjectStoreError::Request {
                key: key.to_string(),
                message: "injected put failure".to_string(),
            });
        }

        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    fn locator(&self, key: &str) -> String {
        format!("mem://photos/{key}")
    }
}

/// In-memory queue pair that records what was published where
#[derive(Default)]
pub struct MemoryQueue {
    high: Mutex<Vec<String>>,
    low: Mutex<Vec<String>>,
    fail_next: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self, priority: Priority) -> Vec<String> {
        match priority {
            Priority::High => self.high.lock().unwrap().clone(),
            Priority::Low => self.low.lock().unwrap().clone(),
        }
    }

    pub fn fail_next_publish(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueuePublisher for MemoryQueue {
    async fn publish(
        &self,
        priority: Priority,
        fingerprint: &Fingerprint,
    ) -> Result<(), QueueError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(QueueError::Publish {
                topic: format!("{priority:?}"),
                fingerprint: fingerprint.encode(),
                message: "injected publish failure".to_string(),
            });
        }

        match priority {
            Priority::High => self.high.lock().unwrap().push(fingerprint.encode()),
            Priority::Low => self.low.lock().unwrap().push(fingerprint.encode()),
        }
        Ok(())
    }
}
