use crate::config::LedgerConfig;
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors from the ledger store
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

/// Outcome of a reservation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The fingerprint was unknown and is now reserved for this caller
    Reserved,
    /// A live entry already exists (reserved or confirmed)
    AlreadyKnown,
}

/// The single arbiter of "have we seen this fingerprint before".
///
/// `reserve` is the only duplicate gate with an atomicity guarantee: callers
/// racing on the same fingerprint see exactly one `Reserved` and everyone else
/// `AlreadyKnown`. The metadata store's unique constraint is a backstop, never
/// the primary decision.
///
/// Entries are time-bounded. An expired entry is logically absent: `exists`
/// does not report it and `reserve` reclaims it in the same atomic step, which
/// is how abandoned uploads un-wedge themselves without any cancel signal.
#[async_trait]
pub trait DedupGate: Send + Sync + 'static {
    /// Atomically insert a `reserved` marker if and only if no live entry exists.
    async fn reserve(&self, fingerprint: &Fingerprint) -> Result<ReserveOutcome, LedgerError>;

    /// Transition an entry (reserved or absent) to `confirmed` with a refreshed
    /// lifetime. Idempotent: confirming a confirmed entry is a no-op success.
    async fn confirm(&self, fingerprint: &Fingerprint) -> Result<(), LedgerError>;

    /// Whether a live entry exists. Does not distinguish reserved from confirmed.
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, LedgerError>;

    /// Drop an entry that is still `reserved`, re-opening the fingerprint.
    ///
    /// Compensation for the server-side upload path: when the coordinator
    /// itself fails to write the bytes, the reservation must not stay wedged
    /// for a full TTL. Confirmed entries are never released.
    async fn release(&self, fingerprint: &Fingerprint) -> Result<(), LedgerError>;

    /// Delete expired rows. Purely hygienic — expired rows are already
    /// invisible to `exists` and reclaimable by `reserve`.
    async fn sweep_expired(&self) -> Result<u64, LedgerError>;
}

/// Postgres-backed dedup ledger.
///
/// Shares the metadata store's connection pool; every operation is a single
/// statement so the atomicity guarantees hold without explicit transactions.
pub struct PostgresLedger {
    pool: PgPool,
    reserved_ttl: Duration,
    confirmed_ttl: Option<Duration>,
}

impl PostgresLedger {
    /// Create a ledger over an existing connection pool
    pub fn new(pool: PgPool, config: &LedgerConfig) -> Self {
        Self {
            pool,
            reserved_ttl: config.reserved_ttl(),
            confirmed_ttl: config.confirmed_ttl(),
        }
    }
}

#[async_trait]
impl DedupGate for PostgresLedger {
    #[instrument(skip(self), fields(fingerprint = %fingerprint))]
    async fn reserve(&self, fingerprint: &Fingerprint) -> Result<ReserveOutcome, LedgerError> {
        // One statement: insert, or overwrite an expired row. A live row makes
        // the conditional update a no-op, so RETURNING yields nothing and the
        // caller lost the race.
        let row = sqlx::query(
            r#"
            INSERT INTO dedup_ledger (fingerprint, state, expires_at)
            VALUES ($1, 'reserved', NOW() + make_interval(secs => $2))
            ON CONFLICT (fingerprint) DO UPDATE
                SET state = 'reserved',
                    expires_at = NOW() + make_interval(secs => $2)
                WHERE dedup_ledger.expires_at IS NOT NULL
                  AND dedup_ledger.expires_at <= NOW()
            RETURNING fingerprint
            "#,
        )
        .bind(fingerprint.encode())
        .bind(self.reserved_ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if row.is_some() {
            debug!("fingerprint reserved");
            Ok(ReserveOutcome::Reserved)
        } else {
            Ok(ReserveOutcome::AlreadyKnown)
        }
    }

    #[instrument(skip(self), fields(fingerprint = %fingerprint))]
    async fn confirm(&self, fingerprint: &Fingerprint) -> Result<(), LedgerError> {
        match self.confirmed_ttl {
            Some(ttl) => {
                sqlx::query(
                    r#"
                    INSERT INTO dedup_ledger (fingerprint, state, expires_at)
                    VALUES ($1, 'confirmed', NOW() + make_interval(secs => $2))
                    ON CONFLICT (fingerprint) DO UPDATE
                        SET state = 'confirmed',
                            expires_at = EXCLUDED.expires_at
                    "#,
                )
                .bind(fingerprint.encode())
                .bind(ttl.as_secs_f64())
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO dedup_ledger (fingerprint, state, expires_at)
                    VALUES ($1, 'confirmed', NULL)
                    ON CONFLICT (fingerprint) DO UPDATE
                        SET state = 'confirmed',
                            expires_at = NULL
                    "#,
                )
                .bind(fingerprint.encode())
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS live FROM dedup_ledger
            WHERE fingerprint = $1
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(fingerprint.encode())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    #[instrument(skip(self), fields(fingerprint = %fingerprint))]
    async fn release(&self, fingerprint: &Fingerprint) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            DELETE FROM dedup_ledger
            WHERE fingerprint = $1 AND state = 'reserved'
            "#,
        )
        .bind(fingerprint.encode())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            r#"
            DELETE FROM dedup_ledger
            WHERE expires_at IS NOT NULL AND expires_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryLedger;
    use std::sync::Arc;
    use std::time::Duration;

    fn fp(data: &[u8]) -> Fingerprint {
        Fingerprint::digest(data).unwrap()
    }

    #[tokio::test]
    async fn test_reserve_then_already_known() {
        let ledger = MemoryLedger::with_ttls(Duration::from_secs(60), Some(Duration::from_secs(60)));
        let f = fp(b"one");

        assert_eq!(ledger.reserve(&f).await.unwrap(), ReserveOutcome::Reserved);
        assert_eq!(
            ledger.reserve(&f).await.unwrap(),
            ReserveOutcome::AlreadyKnown
        );
        assert!(ledger.exists(&f).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_reserves_yield_exactly_one_winner() {
        let ledger = Arc::new(MemoryLedger::with_ttls(
            Duration::from_secs(60),
            Some(Duration::from_secs(60)),
        ));
        let f = fp(b"contended");

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.reserve(&f).await.unwrap() })
            })
            .collect();

        let outcomes = futures::future::join_all(tasks).await;
        let reserved = outcomes
            .iter()
            .filter(|r| matches!(r.as_ref().unwrap(), ReserveOutcome::Reserved))
            .count();

        assert_eq!(reserved, 1);
        assert_eq!(outcomes.len(), 32);
    }

    #[tokio::test]
    async fn test_confirm_is_idempotent() {
        let ledger = MemoryLedger::with_ttls(Duration::from_secs(60), Some(Duration::from_secs(60)));
        let f = fp(b"confirmed twice");

        ledger.reserve(&f).await.unwrap();
        ledger.confirm(&f).await.unwrap();
        ledger.confirm(&f).await.unwrap();
        assert!(ledger.exists(&f).await.unwrap());
    }

    #[tokio::test]
    async fn test_confirm_without_prior_reservation() {
        let ledger = MemoryLedger::with_ttls(Duration::from_secs(60), Some(Duration::from_secs(60)));
        let f = fp(b"never reserved");

        ledger.confirm(&f).await.unwrap();
        assert!(ledger.exists(&f).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_reopens_fingerprint() {
        let ledger = MemoryLedger::with_ttls(
            Duration::from_secs(30),
            Some(Duration::from_secs(30)),
        );
        let f = fp(b"short lived");

        ledger.reserve(&f).await.unwrap();
        ledger.confirm(&f).await.unwrap();
        assert!(ledger.exists(&f).await.unwrap());

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(!ledger.exists(&f).await.unwrap());
        assert_eq!(ledger.reserve(&f).await.unwrap(), ReserveOutcome::Reserved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_without_expiry_never_reopens() {
        let ledger = MemoryLedger::with_ttls(Duration::from_secs(30), None);
        let f = fp(b"permanent");

        ledger.reserve(&f).await.unwrap();
        ledger.confirm(&f).await.unwrap();

        tokio::time::advance(Duration::from_secs(86_400 * 7)).await;

        assert!(ledger.exists(&f).await.unwrap());
        assert_eq!(
            ledger.reserve(&f).await.unwrap(),
            ReserveOutcome::AlreadyKnown
        );
    }

    #[tokio::test]
    async fn test_release_only_drops_reservations() {
        let ledger = MemoryLedger::with_ttls(Duration::from_secs(60), Some(Duration::from_secs(60)));
        let reserved = fp(b"released");
        let confirmed = fp(b"kept");

        ledger.reserve(&reserved).await.unwrap();
        ledger.release(&reserved).await.unwrap();
        assert!(!ledger.exists(&reserved).await.unwrap());
        assert_eq!(
            ledger.reserve(&reserved).await.unwrap(),
            ReserveOutcome::Reserved
        );

        ledger.confirm(&confirmed).await.unwrap();
        ledger.release(&confirmed).await.unwrap();
        assert!(ledger.exists(&confirmed).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired_rows() {
        let ledger = MemoryLedger::with_ttls(Duration::from_secs(30), None);
        let stale = fp(b"stale");
        let live = fp(b"live");

        ledger.reserve(&stale).await.unwrap();
        ledger.confirm(&live).await.unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(ledger.sweep_expired().await.unwrap(), 1);
        assert!(ledger.exists(&live).await.unwrap());
    }
}
