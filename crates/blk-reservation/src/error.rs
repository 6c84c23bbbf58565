use std::fmt;

use blk_schemas::{BlockStatus, EligibilityFact};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Block,
    Claim,
    Driver,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resource::Block => "block",
            Resource::Claim => "claim",
            Resource::Driver => "driver",
        })
    }
}

/// Every way a reservation operation can fail.
///
/// Business rejections are safe to show the client verbatim. `Store` wraps
/// infrastructure failures; the transaction was rolled back, so the whole
/// operation may be retried.
#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("{0} not found")]
    NotFound(Resource),

    #[error("driver is not eligible: {0} has expired")]
    NotEligible(EligibilityFact),

    #[error("overlap limit exceeded: a driver may hold overlapping blocks only once per day")]
    OverlapLimitExceeded,

    #[error("block is already claimed")]
    AlreadyClaimed,

    #[error("block is not available (status: {0})")]
    NotAvailable(BlockStatus),

    #[error("reservation store failure: {0:#}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for ReservationError {
    fn from(e: anyhow::Error) -> Self {
        ReservationError::Store(e)
    }
}

impl ReservationError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ReservationError::NotFound(_) => "NOT_FOUND",
            ReservationError::NotEligible(_) => "NOT_ELIGIBLE",
            ReservationError::OverlapLimitExceeded => "OVERLAP_LIMIT_EXCEEDED",
            ReservationError::AlreadyClaimed => "ALREADY_CLAIMED",
            ReservationError::NotAvailable(_) => "NOT_AVAILABLE",
            ReservationError::Store(_) => "STORE_FAILURE",
        }
    }
}
