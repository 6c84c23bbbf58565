//! Transactional seam for block/claim state.
//!
//! Implementations must make `claim_block` and `unclaim_block` atomic and
//! serializable with respect to each other: two racing claims on one block
//! must end with exactly one committed claim. Any error leaves state as it
//! was.

use blk_schemas::{
    BlockDetail, BlockId, Claim, ClaimedBlock, DriverId, ReservationPolicy, UnclaimOutcome,
};
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::ReservationError;

#[async_trait::async_trait]
pub trait ReservationStore: Send + Sync {
    /// Civil date of the block, read outside any claim transaction.
    async fn block_date(&self, block_id: BlockId) -> Result<Option<NaiveDate>, ReservationError>;

    /// Check order: block exists, overlap budget, no active claim, block
    /// status available, block not yet started. Then insert the claim and
    /// accept the block together.
    async fn claim_block(
        &self,
        block_id: BlockId,
        driver_id: DriverId,
        policy: &ReservationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Claim, ReservationError>;

    async fn unclaim_block(
        &self,
        block_id: BlockId,
        driver_id: DriverId,
        override_penalty: bool,
        policy: &ReservationPolicy,
        now: DateTime<Utc>,
    ) -> Result<UnclaimOutcome, ReservationError>;

    /// Sweep step 1. Returns newly expired block ids, ascending.
    async fn expire_stale_blocks(
        &self,
        policy: &ReservationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<BlockId>, ReservationError>;

    /// Sweep step 2. Returns how many claims changed.
    async fn cascade_expired_claims(&self) -> Result<u64, ReservationError>;

    /// Available, unclaimed, not yet started. Ordered by date, start, id.
    async fn available_blocks(
        &self,
        policy: &ReservationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<BlockDetail>, ReservationError>;

    /// Latest claim per block for the driver, any status.
    async fn driver_claims(
        &self,
        driver_id: DriverId,
        policy: &ReservationPolicy,
    ) -> Result<Vec<ClaimedBlock>, ReservationError>;
}
