//! Request and response types for all blk-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests. No business logic lives here.

use blk_reservation::{BlocksByDate, SweepReport};
use blk_schemas::{
    BlockDetail, BlockId, Claim, ClaimId, ClaimedBlock, DriverId, Event, GeoLocation,
    PenaltyRecord,
};
use serde::{Deserialize, Serialize};

use crate::state::Backend;

// ---------------------------------------------------------------------------
// /v1/health  /v1/status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub daemon_uptime_secs: u64,
    pub backend: Backend,
    pub live_connections: usize,
    /// Events lost to full subscriber queues since start.
    pub dropped_events: u64,
    pub last_sweep: Option<SweepReport>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    /// Which compliance fact failed, on NOT_ELIGIBLE only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact: Option<String>,
}

// ---------------------------------------------------------------------------
// /v1/blocks/:block_id/claim
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub driver_id: DriverId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub success: bool,
    pub claim: Claim,
}

// ---------------------------------------------------------------------------
// /v1/blocks/:block_id/unclaim
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnclaimRequest {
    pub driver_id: DriverId,
    #[serde(default)]
    pub override_penalty: bool,
}

/// Either a completed release (`success: true`) or a late-unclaim warning
/// that must be confirmed with `override_penalty: true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnclaimResponse {
    Warning {
        success: bool,
        warning: String,
        confirmation_required: bool,
        minutes_until_start: i64,
        points: i32,
    },
    Released {
        success: bool,
        penalty: Option<PenaltyRecord>,
    },
}

// ---------------------------------------------------------------------------
// /v1/drivers/:driver_id/blocks/*
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AvailableBlocksResponse {
    pub driver_id: DriverId,
    pub blocks_by_date: BlocksByDate<BlockDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimedBlocksResponse {
    pub driver_id: DriverId,
    pub blocks_by_date: BlocksByDate<ClaimedBlock>,
}

// ---------------------------------------------------------------------------
// /v1/notify
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub event: Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub topic: String,
    pub delivered: usize,
}

// ---------------------------------------------------------------------------
// /v1/ws  /v1/stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionQuery {
    pub driver_id: DriverId,
}

/// Messages a driver client may send over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Track {
        block_id: BlockId,
    },
    Untrack {
        block_id: BlockId,
    },
    LocationUpdate {
        claim_id: ClaimId,
        block_id: BlockId,
        location: GeoLocation,
    },
}

/// Direct replies to a client message; fan-out traffic is sent as
/// `Envelope`s instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    Tracking { block_id: BlockId },
    Untracked { block_id: BlockId },
    LocationRelayed { block_id: BlockId, delivered: usize },
    Error { error: String },
}
