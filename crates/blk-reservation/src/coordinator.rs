//! Claim Coordinator.
//!
//! Entry point for every driver-initiated reservation action. The
//! eligibility check runs before the store transaction, and the event sink
//! sees nothing until the store has committed: a rejected or failed
//! operation publishes no events.

use std::sync::Arc;

use blk_schemas::{
    BlockDetail, BlockId, Claim, ClaimedBlock, DriverId, Event, EventSink, ReservationPolicy,
    Topic, UnclaimOutcome,
};
use chrono::NaiveDate;
use serde::Serialize;

use crate::clock::Clock;
use crate::error::{ReservationError, Resource};
use crate::gate::EligibilityGate;
use crate::store::ReservationStore;

/// One calendar day of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayGroup<T> {
    pub date: NaiveDate,
    pub blocks: Vec<T>,
}

/// Listing grouped by block date, days ascending, each day by start.
pub type BlocksByDate<T> = Vec<DayGroup<T>>;

/// Groups `items` by `date_of`. Input order within a day is preserved, so
/// callers sort by start first.
pub fn group_by_date<T>(items: Vec<T>, date_of: impl Fn(&T) -> NaiveDate) -> BlocksByDate<T> {
    let mut days: std::collections::BTreeMap<NaiveDate, Vec<T>> = Default::default();
    for item in items {
        days.entry(date_of(&item)).or_default().push(item);
    }
    days.into_iter()
        .map(|(date, blocks)| DayGroup { date, blocks })
        .collect()
}

#[derive(Clone)]
pub struct ClaimCoordinator {
    store: Arc<dyn ReservationStore>,
    gate: EligibilityGate,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    policy: ReservationPolicy,
}

impl ClaimCoordinator {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        gate: EligibilityGate,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        policy: ReservationPolicy,
    ) -> Self {
        Self {
            store,
            gate,
            sink,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &ReservationPolicy {
        &self.policy
    }

    pub async fn claim_block(
        &self,
        block_id: BlockId,
        driver_id: DriverId,
    ) -> Result<Claim, ReservationError> {
        let now = self.clock.now();
        let block_date = self
            .store
            .block_date(block_id)
            .await
            .and_then(|d| d.ok_or(ReservationError::NotFound(Resource::Block)))
            .inspect_err(|e| log_rejection("claim", block_id, driver_id, e))?;
        self.gate
            .check(driver_id, self.policy.eligibility_date(block_date, now))
            .await
            .inspect_err(|e| log_rejection("claim", block_id, driver_id, e))?;

        let claim = self
            .store
            .claim_block(block_id, driver_id, &self.policy, now)
            .await
            .inspect_err(|e| log_rejection("claim", block_id, driver_id, e))?;

        tracing::info!(
            block_id = %block_id,
            driver_id = %driver_id,
            claim_id = %claim.claim_id,
            "block claimed"
        );
        self.sink.publish(
            Topic::AvailableBlocks,
            Event::BlockClaimed {
                block_id,
                claimed_by: driver_id,
            },
        );
        self.sink
            .publish(Topic::Schedule(driver_id), Event::ScheduleUpdated { driver_id });
        Ok(claim)
    }

    pub async fn unclaim_block(
        &self,
        block_id: BlockId,
        driver_id: DriverId,
        override_penalty: bool,
    ) -> Result<UnclaimOutcome, ReservationError> {
        let now = self.clock.now();
        let outcome = self
            .store
            .unclaim_block(block_id, driver_id, override_penalty, &self.policy, now)
            .await
            .inspect_err(|e| log_rejection("unclaim", block_id, driver_id, e))?;

        match &outcome {
            UnclaimOutcome::ConfirmationRequired {
                minutes_until_start,
                points,
            } => {
                tracing::info!(
                    block_id = %block_id,
                    driver_id = %driver_id,
                    minutes_until_start,
                    points,
                    "late unclaim needs confirmation"
                );
            }
            UnclaimOutcome::Released { claim, penalty } => {
                tracing::info!(
                    block_id = %block_id,
                    driver_id = %driver_id,
                    claim_id = %claim.claim_id,
                    penalized = penalty.is_some(),
                    "block released"
                );
                self.sink
                    .publish(Topic::AvailableBlocks, Event::BlockReleased { block_id });
                self.sink
                    .publish(Topic::Schedule(driver_id), Event::ScheduleUpdated { driver_id });
                if let Some(p) = penalty {
                    self.sink.publish(
                        Topic::Personal(driver_id),
                        Event::PenaltyApplied {
                            driver_id,
                            block_id,
                            points: p.points,
                        },
                    );
                }
            }
        }
        Ok(outcome)
    }

    /// Claimable blocks the driver is eligible for, by date.
    ///
    /// Eligibility is judged on the same date `claim_block` uses, so a
    /// license expiring next week hides blocks from next week onwards only.
    pub async fn list_available_blocks(
        &self,
        driver_id: DriverId,
    ) -> Result<BlocksByDate<BlockDetail>, ReservationError> {
        let facts = self.gate.facts(driver_id).await?;
        let now = self.clock.now();
        let blocks = self.store.available_blocks(&self.policy, now).await?;
        let eligible: Vec<BlockDetail> = blocks
            .into_iter()
            .filter(|d| {
                facts
                    .evaluate(self.policy.eligibility_date(d.block.date, now))
                    .is_ok()
            })
            .collect();
        Ok(group_by_date(eligible, |d| d.block.date))
    }

    /// The driver's claims by date, each day ordered by start.
    pub async fn list_claimed_blocks(
        &self,
        driver_id: DriverId,
    ) -> Result<BlocksByDate<ClaimedBlock>, ReservationError> {
        let mut claims = self.store.driver_claims(driver_id, &self.policy).await?;
        claims.sort_by_key(|c| (c.detail.starts_at, c.detail.block.block_id));
        Ok(group_by_date(claims, |c| c.detail.block.date))
    }
}

fn log_rejection(op: &str, block_id: BlockId, driver_id: DriverId, err: &ReservationError) {
    match err {
        ReservationError::Store(e) => {
            tracing::error!(op, block_id = %block_id, driver_id = %driver_id, error = %e, "reservation store failure");
        }
        other => {
            tracing::info!(op, block_id = %block_id, driver_id = %driver_id, code = other.code(), "rejected");
        }
    }
}
