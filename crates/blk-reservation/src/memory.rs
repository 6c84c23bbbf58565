//! In-process reservation store.
//!
//! Used in dev mode (no database URL) and by the scenario tests. One async
//! mutex serializes every compound operation. Each operation works on a
//! [`StoreTxn`], a scoped copy of the state: `commit` swaps the copy in,
//! dropping it without committing discards every change.

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Result};
use blk_schemas::schedule::overlap_limit_exceeded;
use blk_schemas::{
    Block, BlockDetail, BlockId, BlockStatus, BlockWindow, Claim, ClaimId, ClaimStatus,
    ClaimedBlock, DriverId, EligibilityFacts, Location, LocationId, NewBlock, PenaltyRecord,
    ReservationPolicy, UnclaimOutcome, LATE_UNCLAIM_REASON,
};
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{ReservationError, Resource};
use crate::gate::EligibilitySource;
use crate::store::ReservationStore;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    locations: BTreeMap<LocationId, Location>,
    blocks: BTreeMap<BlockId, Block>,
    claims: BTreeMap<ClaimId, Claim>,
    compliance: HashMap<DriverId, EligibilityFacts>,
    penalties: Vec<PenaltyRecord>,
    next_location_id: i64,
    next_block_id: i64,
    next_claim_id: i64,
    next_penalty_id: i64,
}

fn next(seq: &mut i64) -> i64 {
    *seq += 1;
    *seq
}

impl MemoryState {
    fn has_active_claim(&self, block_id: BlockId) -> bool {
        self.claims
            .values()
            .any(|c| c.block_id == block_id && c.status.is_active())
    }

    fn detail(&self, block: &Block, policy: &ReservationPolicy) -> Result<BlockDetail> {
        let location = self
            .locations
            .get(&block.location_id)
            .cloned()
            .ok_or_else(|| anyhow!("block {} references missing location", block.block_id))?;
        let window = block.window(policy);
        Ok(BlockDetail {
            block: block.clone(),
            location,
            starts_at: window.starts_at,
            ends_at: window.ends_at,
        })
    }
}

struct StoreTxn<'a> {
    guard: MutexGuard<'a, MemoryState>,
    work: MemoryState,
}

impl StoreTxn<'_> {
    fn commit(self) {
        let StoreTxn { mut guard, work } = self;
        *guard = work;
    }
}

#[derive(Debug, Default)]
pub struct MemoryReservationStore {
    state: Mutex<MemoryState>,
}

impl MemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn begin(&self) -> StoreTxn<'_> {
        let guard = self.state.lock().await;
        let work = guard.clone();
        StoreTxn { guard, work }
    }

    // -----------------------------------------------------------------------
    // Seeding (inventory and compliance are owned elsewhere in production)
    // -----------------------------------------------------------------------

    pub async fn insert_location(&self, name: &str, address: &str) -> LocationId {
        let mut st = self.state.lock().await;
        let id = LocationId(next(&mut st.next_location_id));
        st.locations.insert(
            id,
            Location {
                location_id: id,
                name: name.to_string(),
                address: address.to_string(),
            },
        );
        id
    }

    pub async fn insert_block(&self, nb: &NewBlock) -> Result<Block> {
        let mut st = self.state.lock().await;
        if !st.locations.contains_key(&nb.location_id) {
            return Err(anyhow!("unknown location {}", nb.location_id));
        }
        if nb.amount_cents < 0 {
            return Err(anyhow!("amount_cents must be >= 0"));
        }
        let block = Block {
            block_id: BlockId(next(&mut st.next_block_id)),
            location_id: nb.location_id,
            date: nb.date,
            start_time: nb.start_time,
            end_time: nb.end_time,
            amount_cents: nb.amount_cents,
            status: BlockStatus::Available,
        };
        st.blocks.insert(block.block_id, block.clone());
        Ok(block)
    }

    /// Operator override of a block's status. Returns false for an unknown
    /// block.
    pub async fn set_block_status(&self, block_id: BlockId, status: BlockStatus) -> bool {
        match self.state.lock().await.blocks.get_mut(&block_id) {
            Some(b) => {
                b.status = status;
                true
            }
            None => false,
        }
    }

    pub async fn upsert_driver_compliance(&self, driver_id: DriverId, facts: EligibilityFacts) {
        self.state.lock().await.compliance.insert(driver_id, facts);
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub async fn block(&self, block_id: BlockId) -> Option<Block> {
        self.state.lock().await.blocks.get(&block_id).cloned()
    }

    pub async fn claims_for_block(&self, block_id: BlockId) -> Vec<Claim> {
        self.state
            .lock()
            .await
            .claims
            .values()
            .filter(|c| c.block_id == block_id)
            .cloned()
            .collect()
    }

    pub async fn penalties(&self, driver_id: DriverId) -> Vec<PenaltyRecord> {
        self.state
            .lock()
            .await
            .penalties
            .iter()
            .filter(|p| p.driver_id == driver_id)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl ReservationStore for MemoryReservationStore {
    async fn block_date(&self, block_id: BlockId) -> Result<Option<NaiveDate>, ReservationError> {
        Ok(self.state.lock().await.blocks.get(&block_id).map(|b| b.date))
    }

    async fn claim_block(
        &self,
        block_id: BlockId,
        driver_id: DriverId,
        policy: &ReservationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Claim, ReservationError> {
        let mut txn = self.begin().await;
        let st = &mut txn.work;

        let block = st
            .blocks
            .get(&block_id)
            .cloned()
            .ok_or(ReservationError::NotFound(Resource::Block))?;

        let same_day: Vec<BlockWindow> = st
            .claims
            .values()
            .filter(|c| {
                c.driver_id == driver_id
                    && c.status == ClaimStatus::Accepted
                    && c.block_id != block_id
            })
            .filter_map(|c| st.blocks.get(&c.block_id))
            .filter(|b| b.date == block.date)
            .map(|b| b.window(policy))
            .collect();
        if overlap_limit_exceeded(&block.window(policy), &same_day) {
            return Err(ReservationError::OverlapLimitExceeded);
        }

        if st.has_active_claim(block_id) {
            return Err(ReservationError::AlreadyClaimed);
        }

        if block.status != BlockStatus::Available {
            return Err(ReservationError::NotAvailable(block.status));
        }
        // Started but not yet swept.
        if block.window(policy).starts_at <= now {
            return Err(ReservationError::NotAvailable(BlockStatus::Expired));
        }

        let claim = Claim {
            claim_id: ClaimId(next(&mut st.next_claim_id)),
            block_id,
            driver_id,
            claim_time: now,
            status: ClaimStatus::Accepted,
        };
        st.claims.insert(claim.claim_id, claim.clone());
        if let Some(b) = st.blocks.get_mut(&block_id) {
            b.status = BlockStatus::Accepted;
        }

        txn.commit();
        Ok(claim)
    }

    async fn unclaim_block(
        &self,
        block_id: BlockId,
        driver_id: DriverId,
        override_penalty: bool,
        policy: &ReservationPolicy,
        now: DateTime<Utc>,
    ) -> Result<UnclaimOutcome, ReservationError> {
        let mut txn = self.begin().await;
        let st = &mut txn.work;

        let block = st
            .blocks
            .get(&block_id)
            .cloned()
            .ok_or(ReservationError::NotFound(Resource::Block))?;

        let claim = st
            .claims
            .values()
            .find(|c| {
                c.block_id == block_id
                    && c.driver_id == driver_id
                    && c.status == ClaimStatus::Accepted
            })
            .cloned()
            .ok_or(ReservationError::NotFound(Resource::Claim))?;

        let starts_at = block.window(policy).starts_at;
        let minutes_until_start = policy.minutes_until(starts_at, now);
        let late = policy.within_penalty_window(starts_at, now);
        if late && !override_penalty {
            return Ok(UnclaimOutcome::ConfirmationRequired {
                minutes_until_start,
                points: policy.late_unclaim_points,
            });
        }

        st.claims.remove(&claim.claim_id);
        if let Some(b) = st.blocks.get_mut(&block_id) {
            b.status = BlockStatus::Available;
        }

        let penalty = if late {
            let record = PenaltyRecord {
                penalty_id: next(&mut st.next_penalty_id),
                driver_id,
                block_id,
                claim_id: claim.claim_id,
                points: policy.late_unclaim_points,
                reason: LATE_UNCLAIM_REASON.to_string(),
                created_at: now,
            };
            st.penalties.push(record.clone());
            Some(record)
        } else {
            None
        };

        txn.commit();
        Ok(UnclaimOutcome::Released { claim, penalty })
    }

    async fn expire_stale_blocks(
        &self,
        policy: &ReservationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<BlockId>, ReservationError> {
        let mut txn = self.begin().await;
        let st = &mut txn.work;

        let stale: Vec<BlockId> = st
            .blocks
            .values()
            .filter(|b| b.status == BlockStatus::Available)
            .filter(|b| b.window(policy).starts_at < now)
            .filter(|b| !st.claims.values().any(|c| c.block_id == b.block_id))
            .map(|b| b.block_id)
            .collect();
        for id in &stale {
            if let Some(b) = st.blocks.get_mut(id) {
                b.status = BlockStatus::Expired;
            }
        }

        txn.commit();
        tracing::debug!(expired = stale.len(), "sweep: stale blocks expired");
        Ok(stale)
    }

    async fn cascade_expired_claims(&self) -> Result<u64, ReservationError> {
        let mut txn = self.begin().await;
        let st = &mut txn.work;

        let mut n = 0u64;
        for claim in st.claims.values_mut() {
            let block_expired = st
                .blocks
                .get(&claim.block_id)
                .is_some_and(|b| b.status == BlockStatus::Expired);
            if block_expired && claim.status != ClaimStatus::Expired {
                claim.status = ClaimStatus::Expired;
                n += 1;
            }
        }

        txn.commit();
        tracing::debug!(expired = n, "sweep: claims cascaded");
        Ok(n)
    }

    async fn available_blocks(
        &self,
        policy: &ReservationPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<BlockDetail>, ReservationError> {
        let st = self.state.lock().await;
        let mut out = Vec::new();
        for block in st.blocks.values() {
            if block.status != BlockStatus::Available || st.has_active_claim(block.block_id) {
                continue;
            }
            let detail = st.detail(block, policy)?;
            if detail.starts_at > now {
                out.push(detail);
            }
        }
        out.sort_by_key(|d| (d.block.date, d.block.start_time, d.block.block_id));
        Ok(out)
    }

    async fn driver_claims(
        &self,
        driver_id: DriverId,
        policy: &ReservationPolicy,
    ) -> Result<Vec<ClaimedBlock>, ReservationError> {
        let st = self.state.lock().await;

        let mut latest: BTreeMap<BlockId, &Claim> = BTreeMap::new();
        for c in st.claims.values().filter(|c| c.driver_id == driver_id) {
            let newer = latest
                .get(&c.block_id)
                .map_or(true, |cur| (c.claim_time, c.claim_id) > (cur.claim_time, cur.claim_id));
            if newer {
                latest.insert(c.block_id, c);
            }
        }

        let mut out = Vec::with_capacity(latest.len());
        for claim in latest.into_values() {
            let block = st
                .blocks
                .get(&claim.block_id)
                .ok_or_else(|| anyhow!("claim {} references missing block", claim.claim_id))?;
            out.push(ClaimedBlock {
                claim: claim.clone(),
                detail: st.detail(block, policy)?,
            });
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl EligibilitySource for MemoryReservationStore {
    async fn facts(&self, driver_id: DriverId) -> Result<Option<EligibilityFacts>> {
        Ok(self.state.lock().await.compliance.get(&driver_id).copied())
    }
}
