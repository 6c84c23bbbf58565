//! Expiration Sweeper.
//!
//! Step 1 expires stale, never-claimed available blocks; step 2 cascades
//! expiry to claims on expired blocks. Each step commits on its own and both
//! are no-ops when re-run, so a failed tick is simply retried by the next one.

use std::sync::Arc;
use std::time::Duration;

use blk_schemas::{BlockId, Event, EventSink, ReservationPolicy, Topic};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::ReservationError;
use crate::store::ReservationStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub ran_at: DateTime<Utc>,
    pub expired_blocks: Vec<BlockId>,
    pub expired_claims: u64,
}

impl SweepReport {
    pub fn changed_anything(&self) -> bool {
        !self.expired_blocks.is_empty() || self.expired_claims > 0
    }
}

pub struct Sweeper {
    store: Arc<dyn ReservationStore>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    policy: ReservationPolicy,
    last: RwLock<Option<SweepReport>>,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        policy: ReservationPolicy,
    ) -> Self {
        Self {
            store,
            sink,
            clock,
            policy,
            last: RwLock::new(None),
        }
    }

    /// One full sweep. `BlockExpired` goes out for each block step 1
    /// changed, after step 1 has committed.
    pub async fn run_once(&self) -> Result<SweepReport, ReservationError> {
        let now = self.clock.now();

        let expired_blocks = self.store.expire_stale_blocks(&self.policy, now).await?;
        for &block_id in &expired_blocks {
            self.sink
                .publish(Topic::AvailableBlocks, Event::BlockExpired { block_id });
        }

        let expired_claims = self.store.cascade_expired_claims().await?;

        let report = SweepReport {
            ran_at: now,
            expired_blocks,
            expired_claims,
        };
        *self.last.write().await = Some(report.clone());
        Ok(report)
    }

    pub async fn last_report(&self) -> Option<SweepReport> {
        self.last.read().await.clone()
    }

    /// Runs [`Sweeper::run_once`] every `interval` until the task is aborted.
    /// Failures are logged and the loop carries on.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(r) if r.changed_anything() => tracing::info!(
                        expired_blocks = r.expired_blocks.len(),
                        expired_claims = r.expired_claims,
                        "sweep complete"
                    ),
                    Ok(_) => tracing::debug!("sweep complete; nothing to expire"),
                    Err(e) => tracing::error!(error = %e, "sweep failed; will retry next tick"),
                }
            }
        })
    }
}
