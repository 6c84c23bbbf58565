//! Postgres-backed store. Thin adapter over `blk_db`: it maps attempt
//! outcomes onto [`ReservationError`] and re-runs transactions that lost a
//! serialization conflict.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use blk_db::{ClaimAttempt, UnclaimAttempt};
use blk_schemas::{
    BlockDetail, BlockId, Claim, ClaimedBlock, DriverId, EligibilityFacts, ReservationPolicy,
    UnclaimOutcome,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;

use crate::error::{ReservationError, Resource};
use crate::gate::EligibilitySource;
use crate::store::ReservationStore;

const MAX_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(15);

/// Run `op` until it succeeds, fails for a non-retryable reason, or runs out
/// of attempts.
async fn with_retry<T, F, Fut>(op: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Err(e) if attempt < MAX_ATTEMPTS && blk_db::is_retryable(&e) => {
                tracing::debug!(op, attempt, error = %e, "serialization conflict; retrying");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[derive(Clone)]
pub struct PgReservationStore {
    pool: PgPool,
}

impl PgReservationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl ReservationStore for PgReservationStore {
    async fn block_date(&self, block_id: BlockId) -> Result<Option<NaiveDate>, ReservationError> {
        Ok(blk_db::fetch_block(&self.pool, block_id)
            .await?
            .map(|b| b.date))
    }

    async fn claim_block(
        &self,
        block_id: BlockId,
        driver_id: DriverId,
        policy: &ReservationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Claim, ReservationError> {
        let attempt = with_retry("claim_block", || {
            blk_db::claim_block(&self.pool, block_id, driver_id, policy, now)
        })
        .await?;
        match attempt {
            ClaimAttempt::Claimed(claim) => Ok(claim),
            ClaimAttempt::BlockNotFound => Err(ReservationError::NotFound(Resource::Block)),
            ClaimAttempt::OverlapLimitExceeded => Err(ReservationError::OverlapLimitExceeded),
            ClaimAttempt::AlreadyClaimed => Err(ReservationError::AlreadyClaimed),
            ClaimAttempt::NotAvailable(status) => Err(ReservationError::NotAvailable(status)),
        }
    }

    async fn unclaim_block(
        &self,
        block_id: BlockId,
        driver_id: DriverId,
        override_penalty: bool,
        policy: &ReservationPolicy,
        now: DateTime<Utc>,
    ) -> Result<UnclaimOutcome, ReservationError> {
        let attempt = with_retry("unclaim_block", || {
            blk_db::unclaim_block(&self.pool, block_id, driver_id, override_penalty, policy, now)
        })
        .await?;
        match attempt {
            UnclaimAttempt::Done(outcome) => Ok(outcome),
            UnclaimAttempt::BlockNotFound => Err(ReservationError::NotFound(Resource::Block)),
            UnclaimAttempt::ClaimNotFound => Err(ReservationError::NotFound(Resource::Claim)),
        }
    }

    async fn expire_stale_blocks(
        &self,
        policy: &ReservationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<BlockId>, ReservationError> {
        Ok(blk_db::sweep_expire_stale_blocks(&self.pool, policy, now).await?)
    }

    async fn cascade_expired_claims(&self) -> Result<u64, ReservationError> {
        Ok(blk_db::sweep_cascade_expired_claims(&self.pool).await?)
    }

    async fn available_blocks(
        &self,
        policy: &ReservationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<BlockDetail>, ReservationError> {
        Ok(blk_db::list_available_blocks(&self.pool, policy, now).await?)
    }

    async fn driver_claims(
        &self,
        driver_id: DriverId,
        policy: &ReservationPolicy,
    ) -> Result<Vec<ClaimedBlock>, ReservationError> {
        Ok(blk_db::list_driver_claims(&self.pool, driver_id, policy).await?)
    }
}

/// Compliance facts read from the `driver_compliance` table.
#[derive(Clone)]
pub struct PgEligibilitySource {
    pool: PgPool,
}

impl PgEligibilitySource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl EligibilitySource for PgEligibilitySource {
    async fn facts(&self, driver_id: DriverId) -> Result<Option<EligibilityFacts>> {
        blk_db::fetch_driver_compliance(&self.pool, driver_id).await
    }
}
