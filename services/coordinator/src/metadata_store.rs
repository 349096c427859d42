use crate::config::DatabaseConfig;
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors from the metadata store
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("metadata store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Outcome of an insert against a unique-constrained collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new record was created
    Created,
    /// A record with this fingerprint already exists; not an error
    AlreadyIngested,
}

/// Which of the two collections an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    EventPhoto,
    Selfie,
}

/// Selfie statuses as stored in the `status` column. Event photo statuses
/// (`pending`/`processing`/`completed`/`failed`) are advanced only by the
/// downstream worker and never read here.
pub mod selfie_status {
    pub const PENDING: &str = "pending";
    pub const FAILED: &str = "failed";
    pub const COMPLETED: &str = "completed";
}

/// A new event photo record, created at confirmation time
#[derive(Debug, Clone)]
pub struct NewPhotoRecord {
    pub photo_id: Fingerprint,
    pub storage_url: String,
}

/// A new selfie record, created at intake time
#[derive(Debug, Clone)]
pub struct NewSelfieRecord {
    pub selfie_id: Fingerprint,
    pub owner_token: Uuid,
    pub storage_url: String,
}

/// Stored selfie record
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SelfieRecord {
    /// Fingerprint of the selfie bytes, canonical encoding
    pub selfie_id: String,
    /// Session token handed back to the submitting client
    pub owner_token: Uuid,
    /// Durable storage locator (never a time-limited URL)
    pub storage_url: String,
    /// pending, failed, or completed
    pub status: String,
    /// Fingerprints of matched event photos, worker-ordered
    pub matched_photo_ids: Vec<String>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

/// Durable per-fingerprint record of what was ingested.
///
/// Unlike the ledger this store has no lifetime bound: expiry of a ledger
/// entry never means "this photo was never ingested", only that the fast
/// duplicate check has to fall back to the unique constraints here.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Insert an event photo record with status `pending`.
    /// A unique-constraint conflict yields `AlreadyIngested`, never an error.
    async fn insert_photo(&self, photo: NewPhotoRecord) -> Result<InsertOutcome, MetadataError>;

    /// Insert a selfie record with status `pending`, same conflict contract.
    async fn insert_selfie(&self, selfie: NewSelfieRecord)
        -> Result<InsertOutcome, MetadataError>;

    /// Which of these fingerprints already have an event photo record.
    async fn known_photos(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<HashSet<Fingerprint>, MetadataError>;

    /// Fetch a selfie record for the poll path.
    async fn find_selfie(
        &self,
        selfie_id: &Fingerprint,
    ) -> Result<Option<SelfieRecord>, MetadataError>;

    /// Atomically claim `pending` records older than the threshold for
    /// re-enqueueing: stamps `requeued_at` and returns the claimed
    /// fingerprints, so repeated sweeps do not hammer the queue with the
    /// same rows every interval.
    async fn claim_stale_pending(
        &self,
        kind: RecordKind,
        older_than: Duration,
    ) -> Result<Vec<Fingerprint>, MetadataError>;
}

/// PostgreSQL-backed metadata store
pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self, MetadataError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), MetadataError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (shared with the ledger, used by health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    #[instrument(skip(self, photo), fields(photo_id = %photo.photo_id))]
    async fn insert_photo(&self, photo: NewPhotoRecord) -> Result<InsertOutcome, MetadataError> {
        let result = sqlx::query(
            r#"
            INSERT INTO event_photos (photo_id, storage_url, status, created_at)
            VALUES ($1, $2, 'pending', NOW())
            ON CONFLICT (photo_id) DO NOTHING
            "#,
        )
        .bind(photo.photo_id.encode())
        .bind(&photo.storage_url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!("event photo record created");
            Ok(InsertOutcome::Created)
        } else {
            Ok(InsertOutcome::AlreadyIngested)
        }
    }

    #[instrument(skip(self, selfie), fields(selfie_id = %selfie.selfie_id))]
    async fn insert_selfie(
        &self,
        selfie: NewSelfieRecord,
    ) -> Result<InsertOutcome, MetadataError> {
        let result = sqlx::query(
            r#"
            INSERT INTO selfies (selfie_id, owner_token, storage_url, status, created_at)
            VALUES ($1, $2, $3, 'pending', NOW())
            ON CONFLICT (selfie_id) DO NOTHING
            "#,
        )
        .bind(selfie.selfie_id.encode())
        .bind(selfie.owner_token)
        .bind(&selfie.storage_url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!("selfie record created");
            Ok(InsertOutcome::Created)
        } else {
            Ok(InsertOutcome::AlreadyIngested)
        }
    }

    async fn known_photos(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<HashSet<Fingerprint>, MetadataError> {
        if fingerprints.is_empty() {
            return Ok(HashSet::new());
        }

        let encoded: Vec<String> = fingerprints.iter().map(Fingerprint::encode).collect();

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT photo_id FROM event_photos WHERE photo_id = ANY($1)
            "#,
        )
        .bind(&encoded)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id,)| parse_stored_fingerprint(&id))
            .collect())
    }

    async fn find_selfie(
        &self,
        selfie_id: &Fingerprint,
    ) -> Result<Option<SelfieRecord>, MetadataError> {
        let selfie = sqlx::query_as::<_, SelfieRecord>(
            r#"
            SELECT selfie_id, owner_token, storage_url, status, matched_photo_ids, created_at
            FROM selfies
            WHERE selfie_id = $1
            "#,
        )
        .bind(selfie_id.encode())
        .fetch_optional(&self.pool)
        .await?;

        Ok(selfie)
    }

    #[instrument(skip(self))]
    async fn claim_stale_pending(
        &self,
        kind: RecordKind,
        older_than: Duration,
    ) -> Result<Vec<Fingerprint>, MetadataError> {
        let sql = match kind {
            RecordKind::EventPhoto => {
                r#"
                UPDATE event_photos SET requeued_at = NOW()
                WHERE status = 'pending'
                  AND created_at < NOW() - make_interval(secs => $1)
                  AND (requeued_at IS NULL
                       OR requeued_at < NOW() - make_interval(secs => $1))
                RETURNING photo_id
                "#
            }
            RecordKind::Selfie => {
                r#"
                UPDATE selfies SET requeued_at = NOW()
                WHERE status = 'pending'
                  AND created_at < NOW() - make_interval(secs => $1)
                  AND (requeued_at IS NULL
                       OR requeued_at < NOW() - make_interval(secs => $1))
                RETURNING selfie_id
                "#
            }
        };

        let rows: Vec<(String,)> = sqlx::query_as(sql)
            .bind(older_than.as_secs_f64())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id,)| parse_stored_fingerprint(&id))
            .collect())
    }
}

/// Rows are keyed by fingerprints we wrote ourselves, so a parse failure means
/// the table was edited out-of-band. Skip the row rather than poisoning the
/// whole batch.
fn parse_stored_fingerprint(id: &str) -> Option<Fingerprint> {
    match id.parse() {
        Ok(fp) => Some(fp),
        Err(e) => {
            warn!(id = %id, error = %e, "Skipping malformed fingerprint in metadata row");
            None
        }
    }
}
