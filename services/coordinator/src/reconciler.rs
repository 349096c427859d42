use crate::ledger::DedupGate;
use crate::metadata_store::{MetadataStore, RecordKind};
use crate::queue::{Priority, QueuePublisher};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Background reconciliation sweep.
///
/// Confirmation is not atomic across ledger, metadata, and queue: a crash
/// between the metadata insert and the queue push strands a `pending` record
/// that the matching worker will never see. This task periodically re-enqueues
/// such records (the worker dedups by fingerprint, so an occasional double
/// push is harmless) and clears expired ledger rows.
pub struct Reconciler {
    ledger: Arc<dyn DedupGate>,
    metadata: Arc<dyn MetadataStore>,
    queue: Arc<dyn QueuePublisher>,
    sweep_interval: Duration,
    pending_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        ledger: Arc<dyn DedupGate>,
        metadata: Arc<dyn MetadataStore>,
        queue: Arc<dyn QueuePublisher>,
        sweep_interval: Duration,
        pending_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            metadata,
            queue,
            sweep_interval,
            pending_timeout,
        }
    }

    /// Run sweeps until cancelled. Individual sweep failures are logged and
    /// never terminate the task.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.sweep_interval.as_secs(),
            pending_timeout_secs = self.pending_timeout.as_secs(),
            "Reconciler started"
        );

        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a restart loop does not
        // sweep on every boot.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reconciler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }
    }

    /// One full sweep: re-enqueue stale pending records in both collections,
    /// then clear expired ledger rows.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) {
        let requeued_selfies = self
            .requeue_stale(RecordKind::Selfie, Priority::High)
            .await;
        let requeued_photos = self
            .requeue_stale(RecordKind::EventPhoto, Priority::Low)
            .await;

        match self.ledger.sweep_expired().await {
            Ok(swept) => {
                if swept > 0 {
                    debug!(swept = swept, "Expired ledger rows removed");
                    metrics::counter!("coordinator.reconciler.ledger_swept").increment(swept);
                }
            }
            Err(e) => warn!(error = %e, "Ledger sweep failed"),
        }

        if requeued_selfies + requeued_photos > 0 {
            info!(
                selfies = requeued_selfies,
                event_photos = requeued_photos,
                "Stale pending records re-enqueued"
            );
        }
    }

    async fn requeue_stale(&self, kind: RecordKind, priority: Priority) -> usize {
        let stale = match self
            .metadata
            .claim_stale_pending(kind, self.pending_timeout)
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, ?kind, "Failed to query stale pending records");
                return 0;
            }
        };

        let mut requeued = 0;
        for fingerprint in stale {
            match self.queue.publish(priority, &fingerprint).await {
                Ok(()) => {
                    requeued += 1;
                    metrics::counter!("coordinator.reconciler.requeued").increment(1);
                }
                Err(e) => {
                    // Claimed but not delivered; the next sweep past the
                    // timeout picks it up again via requeued_at.
                    warn!(fingerprint = %fingerprint, error = %e, "Re-enqueue failed");
                }
            }
        }

        requeued
    }
}
