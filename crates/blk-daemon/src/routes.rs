//! Axum router and all HTTP handlers for blk-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Tests compose the bare router directly.

use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use blk_fanout::ConnectionGuard;
use blk_reservation::ReservationError;
use blk_schemas::{BlockId, DriverId, Envelope, Event, UnclaimOutcome};
use futures_util::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use crate::{
    api_types::{
        AvailableBlocksResponse, ClaimRequest, ClaimResponse, ClaimedBlocksResponse,
        ErrorResponse, HealthResponse, NotifyRequest, NotifyResponse, SessionQuery,
        StatusResponse, UnclaimRequest, UnclaimResponse,
    },
    state::{uptime_secs, AppState},
    ws,
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/blocks/:block_id/claim", post(claim_block))
        .route("/v1/blocks/:block_id/unclaim", post(unclaim_block))
        .route("/v1/drivers/:driver_id/blocks/available", get(available_blocks))
        .route("/v1/drivers/:driver_id/blocks/claimed", get(claimed_blocks))
        .route("/v1/notify", post(notify))
        .route("/v1/ws", get(ws::upgrade))
        .route("/v1/stream", get(stream))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// A [`ReservationError`] on its way out as `{error, code}` JSON.
pub struct ApiError(ReservationError);

impl From<ReservationError> for ApiError {
    fn from(e: ReservationError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            ReservationError::NotFound(_) => StatusCode::NOT_FOUND,
            ReservationError::NotEligible(_) => StatusCode::FORBIDDEN,
            ReservationError::OverlapLimitExceeded
            | ReservationError::AlreadyClaimed
            | ReservationError::NotAvailable(_) => StatusCode::CONFLICT,
            ReservationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let fact = match &err {
            ReservationError::NotEligible(f) => Some(f.as_str().to_string()),
            _ => None,
        };
        // Store details stay in the log.
        let message = match &err {
            ReservationError::Store(e) => {
                error!(error = %e, "request failed on store");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (
            status,
            Json(ErrorResponse {
                error: message,
                code: err.code().to_string(),
                fact,
            }),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(StatusResponse {
            daemon_uptime_secs: uptime_secs(),
            backend: st.backend,
            live_connections: st.fanout.connection_count(),
            dropped_events: st.fanout.dropped_count(),
            last_sweep: st.sweeper.last_report().await,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/blocks/:block_id/claim
// ---------------------------------------------------------------------------

pub(crate) async fn claim_block(
    State(st): State<Arc<AppState>>,
    Path(block_id): Path<BlockId>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let claim = st.coordinator.claim_block(block_id, req.driver_id).await?;
    Ok(Json(ClaimResponse {
        success: true,
        claim,
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/blocks/:block_id/unclaim
// ---------------------------------------------------------------------------

/// Late unclaims without `override_penalty` come back as a 200 warning, not
/// an error: the client is expected to confirm and resend.
pub(crate) async fn unclaim_block(
    State(st): State<Arc<AppState>>,
    Path(block_id): Path<BlockId>,
    Json(req): Json<UnclaimRequest>,
) -> Result<Json<UnclaimResponse>, ApiError> {
    let outcome = st
        .coordinator
        .unclaim_block(block_id, req.driver_id, req.override_penalty)
        .await?;
    let body = match outcome {
        UnclaimOutcome::Released { penalty, .. } => UnclaimResponse::Released {
            success: true,
            penalty,
        },
        UnclaimOutcome::ConfirmationRequired {
            minutes_until_start,
            points,
        } => UnclaimResponse::Warning {
            success: false,
            warning: format!(
                "block starts in {minutes_until_start} minutes; unclaiming within {} minutes \
                 of start applies {points} points. Resend with override_penalty=true to confirm.",
                st.coordinator.policy().penalty_window_minutes
            ),
            confirmation_required: true,
            minutes_until_start,
            points,
        },
    };
    Ok(Json(body))
}

// ---------------------------------------------------------------------------
// GET /v1/drivers/:driver_id/blocks/{available,claimed}
// ---------------------------------------------------------------------------

pub(crate) async fn available_blocks(
    State(st): State<Arc<AppState>>,
    Path(driver_id): Path<DriverId>,
) -> Result<Json<AvailableBlocksResponse>, ApiError> {
    let blocks_by_date = st.coordinator.list_available_blocks(driver_id).await?;
    Ok(Json(AvailableBlocksResponse {
        driver_id,
        blocks_by_date,
    }))
}

pub(crate) async fn claimed_blocks(
    State(st): State<Arc<AppState>>,
    Path(driver_id): Path<DriverId>,
) -> Result<Json<ClaimedBlocksResponse>, ApiError> {
    let blocks_by_date = st.coordinator.list_claimed_blocks(driver_id).await?;
    Ok(Json(ClaimedBlocksResponse {
        driver_id,
        blocks_by_date,
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/notify
// ---------------------------------------------------------------------------

/// Entry point for the external scheduler. Only inventory and schedule
/// changes are accepted; reservation events are published by the
/// coordinator itself.
pub(crate) async fn notify(
    State(st): State<Arc<AppState>>,
    Json(req): Json<NotifyRequest>,
) -> Response {
    let accepted = matches!(
        req.event,
        Event::NewBlockAvailable { .. }
            | Event::BlockCancelled { .. }
            | Event::BlockModified { .. }
            | Event::ScheduleUpdated { .. }
            | Event::CheckInStatusChanged { .. }
    );
    if !accepted {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("event type {} is not accepted on /v1/notify", req.event.name()),
                code: "EVENT_NOT_ACCEPTED".to_string(),
                fact: None,
            }),
        )
            .into_response();
    }

    let topic = req.event.default_topic();
    let name = req.event.name();
    let delivered = st.fanout.publish(topic, req.event);
    info!(topic = %topic, event = name, delivered, "notify");
    (
        StatusCode::OK,
        Json(NotifyResponse {
            topic: topic.to_string(),
            delivered,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

/// Read-only view of a driver session: the same envelopes the WebSocket
/// would push, without tracking or location relay.
pub(crate) async fn stream(
    State(st): State<Arc<AppState>>,
    Query(q): Query<SessionQuery>,
) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let sub = st.fanout.connect(q.driver_id);
    info!(conn_id = %sub.conn_id, driver_id = %q.driver_id, "sse session opened");
    let session = SseSession {
        envelopes: ReceiverStream::new(sub.rx),
        _registration: ConnectionGuard::new(st.fanout.clone(), sub.conn_id),
    };

    (
        headers,
        Sse::new(envelopes_to_sse(session)).keep_alive(KeepAlive::new()),
    )
        .into_response()
}

/// Envelope stream of one SSE client. The connection leaves the fan-out
/// when axum drops the response body.
struct SseSession {
    envelopes: ReceiverStream<Envelope>,
    _registration: ConnectionGuard,
}

impl Stream for SseSession {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Envelope>> {
        Pin::new(&mut self.envelopes).poll_next(cx)
    }
}

fn envelopes_to_sse(
    rx: impl Stream<Item = Envelope>,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    rx.filter_map(|env| async move {
        let name = env.event.name();
        let data = serde_json::to_string(&env).ok()?;
        Some(Ok(SseEvent::default().event(name).data(data)))
    })
}
