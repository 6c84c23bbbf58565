//! Shared domain types for BlockDesk.
//!
//! Everything here is plain data plus pure helpers. Persistence lives in
//! `blk-db`, protocol logic in `blk-reservation`, delivery in `blk-fanout`.

use std::fmt;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub mod events;
pub mod schedule;

pub use events::{Envelope, Event, EventSink, GeoLocation, NullSink, Topic};
pub use schedule::{BlockWindow, ReservationPolicy};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(BlockId);
id_type!(ClaimId);
id_type!(DriverId);
id_type!(LocationId);

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Available,
    Accepted,
    Expired,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Available => "available",
            BlockStatus::Accepted => "accepted",
            BlockStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(BlockStatus::Available),
            "accepted" => Ok(BlockStatus::Accepted),
            "expired" => Ok(BlockStatus::Expired),
            other => Err(anyhow!("invalid block status: {}", other)),
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Accepted,
    Expired,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Accepted => "accepted",
            ClaimStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "accepted" => Ok(ClaimStatus::Accepted),
            "expired" => Ok(ClaimStatus::Expired),
            other => Err(anyhow!("invalid claim status: {}", other)),
        }
    }

    /// Active claims are the ones that count against the one-per-block rule.
    pub fn is_active(&self) -> bool {
        !matches!(self, ClaimStatus::Expired)
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub block_id: BlockId,
    pub location_id: LocationId,
    /// Civil date in the reference timezone.
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    /// At or before `start_time` means the block runs past midnight.
    pub end_time: NaiveTime,
    pub amount_cents: i64,
    pub status: BlockStatus,
}

impl Block {
    pub fn window(&self, policy: &ReservationPolicy) -> BlockWindow {
        BlockWindow::resolve(self.date, self.start_time, self.end_time, policy.timezone)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: ClaimId,
    pub block_id: BlockId,
    pub driver_id: DriverId,
    pub claim_time: DateTime<Utc>,
    pub status: ClaimStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub location_id: LocationId,
    pub name: String,
    pub address: String,
}

/// Input for seeding a block (the scheduling process that creates blocks is
/// external; this is what it hands us).
#[derive(Debug, Clone)]
pub struct NewBlock {
    pub location_id: LocationId,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub amount_cents: i64,
}

/// Append-only standing-impact record written on a late unclaim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyRecord {
    pub penalty_id: i64,
    pub driver_id: DriverId,
    pub block_id: BlockId,
    pub claim_id: ClaimId,
    pub points: i32,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

pub const LATE_UNCLAIM_REASON: &str = "late_unclaim";

/// Result of an unclaim that did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnclaimOutcome {
    /// Claim deleted and block back to available.
    Released {
        claim: Claim,
        penalty: Option<PenaltyRecord>,
    },
    /// Late unclaim without override. Nothing was written; the caller must
    /// re-issue with `override_penalty = true` to accept the penalty.
    ConfirmationRequired {
        minutes_until_start: i64,
        points: i32,
    },
}

// ---------------------------------------------------------------------------
// Eligibility facts
// ---------------------------------------------------------------------------

/// Compliance dates owned by the external driver records source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityFacts {
    pub license_expiry: NaiveDate,
    pub registration_expiry: NaiveDate,
    pub insurance_end: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityFact {
    License,
    Registration,
    Insurance,
}

impl EligibilityFact {
    pub fn as_str(&self) -> &'static str {
        match self {
            EligibilityFact::License => "license",
            EligibilityFact::Registration => "registration",
            EligibilityFact::Insurance => "insurance",
        }
    }
}

impl fmt::Display for EligibilityFact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EligibilityFacts {
    /// Pure predicate: every expiry must be strictly after `on`.
    ///
    /// Returns the first failing fact in license, registration, insurance
    /// order.
    pub fn evaluate(&self, on: NaiveDate) -> Result<(), EligibilityFact> {
        if self.license_expiry <= on {
            return Err(EligibilityFact::License);
        }
        if self.registration_expiry <= on {
            return Err(EligibilityFact::Registration);
        }
        if self.insurance_end <= on {
            return Err(EligibilityFact::Insurance);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Denormalized views
// ---------------------------------------------------------------------------

/// A block joined with its location, as surfaced to drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDetail {
    pub block: Block,
    pub location: Location,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// One row of a driver's schedule: the latest claim on a block plus details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedBlock {
    pub claim: Claim,
    pub detail: BlockDetail,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> EligibilityFacts {
        EligibilityFacts {
            license_expiry: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            registration_expiry: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            insurance_end: NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(),
        }
    }

    #[test]
    fn all_future_dates_pass() {
        let on = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(facts().evaluate(on), Ok(()));
    }

    #[test]
    fn expiry_on_evaluation_day_fails() {
        let on = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        assert_eq!(facts().evaluate(on), Err(EligibilityFact::License));
    }

    #[test]
    fn reports_first_failing_fact_in_order() {
        let mut f = facts();
        f.license_expiry = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let on = NaiveDate::from_ymd_opt(2024, 7, 15).unwrap();
        assert_eq!(f.evaluate(on), Err(EligibilityFact::Registration));

        f.registration_expiry = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert_eq!(f.evaluate(on), Ok(()));
        let later = NaiveDate::from_ymd_opt(2024, 8, 2).unwrap();
        assert_eq!(f.evaluate(later), Err(EligibilityFact::Insurance));
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [BlockStatus::Available, BlockStatus::Accepted, BlockStatus::Expired] {
            assert_eq!(BlockStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(BlockStatus::parse("ACCEPTED").is_err());
        assert!(ClaimStatus::Accepted.is_active());
        assert!(!ClaimStatus::Expired.is_active());
    }
}
