//! Shared runtime state for blk-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The coordinator, the
//! fan-out and the sweeper are built once here and shared; nothing is global.

use std::sync::Arc;

use anyhow::Result;
use blk_config::BlockDeskConfig;
use blk_fanout::Fanout;
use blk_reservation::{
    ClaimCoordinator, Clock, EligibilityGate, EligibilitySource, MemoryReservationStore,
    PgEligibilitySource, PgReservationStore, ReservationStore, Sweeper, SystemClock,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Which reservation store is behind the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Postgres,
    Memory,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub struct AppState {
    pub build: BuildInfo,
    pub backend: Backend,
    pub coordinator: ClaimCoordinator,
    pub fanout: Arc<Fanout>,
    pub sweeper: Arc<Sweeper>,
}

impl AppState {
    /// Wire coordinator and sweeper to a shared fan-out.
    pub fn from_parts(
        backend: Backend,
        store: Arc<dyn ReservationStore>,
        eligibility: Arc<dyn EligibilitySource>,
        clock: Arc<dyn Clock>,
        cfg: &BlockDeskConfig,
    ) -> Result<Self> {
        let policy = cfg.policy()?;
        let fanout = Arc::new(Fanout::new(cfg.fanout.subscriber_buffer));
        let coordinator = ClaimCoordinator::new(
            store.clone(),
            EligibilityGate::new(eligibility),
            fanout.clone(),
            clock.clone(),
            policy,
        );
        let sweeper = Arc::new(Sweeper::new(store, fanout.clone(), clock, policy));
        Ok(Self {
            build: BuildInfo {
                service: "blk-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            backend,
            coordinator,
            fanout,
            sweeper,
        })
    }

    pub fn postgres(pool: PgPool, cfg: &BlockDeskConfig) -> Result<Self> {
        Self::from_parts(
            Backend::Postgres,
            Arc::new(PgReservationStore::new(pool.clone())),
            Arc::new(PgEligibilitySource::new(pool)),
            Arc::new(SystemClock),
            cfg,
        )
    }

    /// Dev mode and tests. The caller keeps its handle on `store` for
    /// seeding.
    pub fn in_memory(
        store: Arc<MemoryReservationStore>,
        clock: Arc<dyn Clock>,
        cfg: &BlockDeskConfig,
    ) -> Result<Self> {
        Self::from_parts(Backend::Memory, store.clone(), store, clock, cfg)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}
