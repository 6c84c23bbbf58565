//! Reservation-state events and the topics they are published on.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{BlockDetail, BlockId, ClaimId, DriverId};

/// Fan-out channel a connection can be subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Topic {
    /// Global channel every connection joins on connect.
    AvailableBlocks,
    Personal(DriverId),
    Schedule(DriverId),
    /// Opt-in channel for observers following one block.
    Tracking(BlockId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::AvailableBlocks => write!(f, "available_blocks"),
            Topic::Personal(d) => write!(f, "personal:{d}"),
            Topic::Schedule(d) => write!(f, "schedule:{d}"),
            Topic::Tracking(b) => write!(f, "tracking:{b}"),
        }
    }
}

/// Driver position as reported by a device. Only `latitude`/`longitude` are
/// required; any other keys ride along untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    BlockClaimed {
        block_id: BlockId,
        claimed_by: DriverId,
    },
    BlockReleased {
        block_id: BlockId,
    },
    /// Implies released.
    BlockExpired {
        block_id: BlockId,
    },
    NewBlockAvailable {
        block: BlockDetail,
    },
    ScheduleUpdated {
        driver_id: DriverId,
    },
    BlockCancelled {
        driver_id: DriverId,
        block_id: BlockId,
    },
    BlockModified {
        driver_id: DriverId,
        block_id: BlockId,
    },
    CheckInStatusChanged {
        driver_id: DriverId,
        block_id: BlockId,
        checked_in: bool,
    },
    PenaltyApplied {
        driver_id: DriverId,
        block_id: BlockId,
        points: i32,
    },
    DriverLocation {
        driver_id: DriverId,
        claim_id: ClaimId,
        block_id: BlockId,
        location: GeoLocation,
    },
}

impl Event {
    /// Short name used as the SSE event name and in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::BlockClaimed { .. } => "block_claimed",
            Event::BlockReleased { .. } => "block_released",
            Event::BlockExpired { .. } => "block_expired",
            Event::NewBlockAvailable { .. } => "new_block_available",
            Event::ScheduleUpdated { .. } => "schedule_updated",
            Event::BlockCancelled { .. } => "block_cancelled",
            Event::BlockModified { .. } => "block_modified",
            Event::CheckInStatusChanged { .. } => "check_in_status_changed",
            Event::PenaltyApplied { .. } => "penalty_applied",
            Event::DriverLocation { .. } => "driver_location",
        }
    }

    /// Channel an event belongs on when the publisher has no reason to pick
    /// another.
    pub fn default_topic(&self) -> Topic {
        match self {
            Event::BlockClaimed { .. }
            | Event::BlockReleased { .. }
            | Event::BlockExpired { .. }
            | Event::NewBlockAvailable { .. } => Topic::AvailableBlocks,
            Event::ScheduleUpdated { driver_id }
            | Event::BlockCancelled { driver_id, .. }
            | Event::BlockModified { driver_id, .. }
            | Event::CheckInStatusChanged { driver_id, .. } => Topic::Schedule(*driver_id),
            Event::PenaltyApplied { driver_id, .. } => Topic::Personal(*driver_id),
            Event::DriverLocation { block_id, .. } => Topic::Tracking(*block_id),
        }
    }
}

/// What a subscriber actually receives: the event plus the topic it came in on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    pub event: Event,
}

/// Observer seam between the reservation protocol and delivery.
///
/// `publish` must not block; it returns how many connections the event was
/// handed to.
pub trait EventSink: Send + Sync {
    fn publish(&self, topic: Topic, event: Event) -> usize;
}

/// Sink that drops everything. Used by one-shot tooling with no subscribers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _topic: Topic, _event: Event) -> usize {
        0
    }
}
