// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write-behind replication from the ephemeral tier to the durable tier.
//!
//! Every persisted cart snapshot is offered to a bounded queue drained by a
//! single background worker. The request path never waits on the durable
//! store:
//!
//! ```text
//! persist() ──try_send──► [ bounded mpsc ] ──► worker ──► DurableCartStore::save
//!                │ full                              │
//!                ▼                                   ├─ converted record → skip
//!             dropped++                              └─ error → failed++ (no retry)
//! ```
//!
//! A dropped or failed snapshot is not lost state: the ephemeral tier still
//! holds the cart and the next mutation replicates it again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cart::{now_millis, Cart, PersistedCart};
use crate::storage::traits::DurableCartStore;

enum Job {
    Persist(Cart),
    /// Barrier: acknowledged once every earlier job is done
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Live counters for the write-behind worker.
#[derive(Debug, Default)]
pub struct WriteBehindStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped_converted: AtomicU64,
}

/// Point-in-time copy of [`WriteBehindStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteBehindSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped_converted: u64,
}

impl WriteBehindStats {
    #[must_use]
    pub fn snapshot(&self) -> WriteBehindSnapshot {
        WriteBehindSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped_converted: self.skipped_converted.load(Ordering::Relaxed),
        }
    }
}

pub struct WriteBehindQueue {
    tx: mpsc::Sender<Job>,
    stats: Arc<WriteBehindStats>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteBehindQueue {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn spawn(durable: Arc<dyn DurableCartStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(WriteBehindStats::default());
        let worker = tokio::spawn(run_worker(durable, rx, stats.clone()));

        Self {
            tx,
            stats,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Offer a snapshot for replication. Never blocks; returns whether it was queued.
    pub fn enqueue(&self, cart: Cart) -> bool {
        let tenant_id = cart.tenant_id.clone();
        let cart_id = cart.id.clone();

        match self.tx.try_send(Job::Persist(cart)) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_write_behind("enqueued");
                crate::metrics::set_write_behind_depth(self.depth());
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_write_behind("dropped");
                warn!(tenant_id = %tenant_id, cart_id = %cart_id, "Write-behind queue full, snapshot dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_write_behind("dropped");
                warn!(tenant_id = %tenant_id, cart_id = %cart_id, "Write-behind worker stopped, snapshot dropped");
                false
            }
        }
    }

    /// Wait until every snapshot queued before this call has been handled.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Job::Flush(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    /// Drain the queue and stop the worker. Later snapshots are dropped.
    pub async fn shutdown(&self) {
        let handle = self.worker.lock().take();
        let Some(handle) = handle else { return };

        if self.tx.send(Job::Shutdown).await.is_ok() {
            debug!("Write-behind shutdown requested");
        }
        if let Err(e) = handle.await {
            warn!(error = %e, "Write-behind worker did not exit cleanly");
        }
        crate::metrics::set_write_behind_depth(0);
        info!(stats = ?self.stats.snapshot(), "Write-behind worker stopped");
    }

    /// Snapshots currently waiting.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.tx.max_capacity().saturating_sub(self.tx.capacity())
    }

    #[must_use]
    pub fn stats(&self) -> WriteBehindSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some() && !self.tx.is_closed()
    }
}

async fn run_worker(
    durable: Arc<dyn DurableCartStore>,
    mut rx: mpsc::Receiver<Job>,
    stats: Arc<WriteBehindStats>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Persist(cart) => replicate(durable.as_ref(), cart, &stats).await,
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
            Job::Shutdown => break,
        }
        crate::metrics::set_write_behind_depth(rx.len());
    }
}

/// Fold one snapshot into the durable record, creating it if needed.
async fn replicate(durable: &dyn DurableCartStore, cart: Cart, stats: &WriteBehindStats) {
    let start = std::time::Instant::now();
    let now = now_millis();
    let tenant_id = cart.tenant_id.clone();
    let cart_id = cart.id.clone();

    let record = match durable.find_by_id(&tenant_id, &cart_id).await {
        Ok(Some(existing)) if existing.converted => {
            stats.skipped_converted.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_write_behind("skipped");
            debug!(tenant_id = %tenant_id, cart_id = %cart_id, "Cart already converted, snapshot skipped");
            return;
        }
        Ok(Some(mut existing)) => {
            existing.sync_from(cart, now);
            existing
        }
        Ok(None) => PersistedCart::from_cart(cart, now),
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_write_behind("failed");
            crate::metrics::record_error("durable", "write_behind", "lookup");
            warn!(tenant_id = %tenant_id, cart_id = %cart_id, error = %e, "Write-behind lookup failed");
            return;
        }
    };

    match durable.save(&record).await {
        Ok(()) => {
            stats.succeeded.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_write_behind("succeeded");
            crate::metrics::record_latency("durable", "write_behind", start.elapsed());
            debug!(tenant_id = %tenant_id, cart_id = %cart_id, "Cart replicated to durable tier");
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_write_behind("failed");
            crate::metrics::record_error("durable", "write_behind", "save");
            warn!(tenant_id = %tenant_id, cart_id = %cart_id, error = %e, "Write-behind save failed");
        }
    }
}
