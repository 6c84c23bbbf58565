//! Eligibility Gate.
//!
//! Facts are re-read on every check. Expiry dates roll over daily, so a
//! cached answer would go stale.

use std::sync::Arc;

use anyhow::Result;
use blk_schemas::{DriverId, EligibilityFacts};
use chrono::NaiveDate;

use crate::error::{ReservationError, Resource};

/// Read-only access to driver compliance records.
#[async_trait::async_trait]
pub trait EligibilitySource: Send + Sync {
    async fn facts(&self, driver_id: DriverId) -> Result<Option<EligibilityFacts>>;
}

#[derive(Clone)]
pub struct EligibilityGate {
    source: Arc<dyn EligibilitySource>,
}

impl EligibilityGate {
    pub fn new(source: Arc<dyn EligibilitySource>) -> Self {
        Self { source }
    }

    /// Facts for `driver_id`, or `NotFound(Driver)`.
    pub async fn facts(&self, driver_id: DriverId) -> Result<EligibilityFacts, ReservationError> {
        self.source
            .facts(driver_id)
            .await?
            .ok_or(ReservationError::NotFound(Resource::Driver))
    }

    /// Pass, or `NotEligible` naming the first expired fact.
    pub async fn check(&self, driver_id: DriverId, on: NaiveDate) -> Result<(), ReservationError> {
        let facts = self.facts(driver_id).await?;
        facts.evaluate(on).map_err(ReservationError::NotEligible)
    }
}
