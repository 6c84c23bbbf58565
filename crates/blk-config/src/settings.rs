//! Typed view over the merged config JSON.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use blk_schemas::ReservationPolicy;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BlockDeskConfig {
    pub reservation: ReservationSettings,
    pub sweeper: SweeperSettings,
    pub fanout: FanoutSettings,
    pub daemon: DaemonSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationSettings {
    /// IANA zone name block dates/times are expressed in.
    pub timezone: String,
    pub penalty_window_minutes: i64,
    pub late_unclaim_points: i32,
}

impl Default for ReservationSettings {
    fn default() -> Self {
        Self {
            timezone: "America/New_York".to_string(),
            penalty_window_minutes: 60,
            late_unclaim_points: -20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperSettings {
    pub interval_secs: u64,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutSettings {
    /// Per-connection queue depth. A full queue drops events for that
    /// connection only.
    pub subscriber_buffer: usize,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub addr: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8899".to_string(),
        }
    }
}

impl BlockDeskConfig {
    pub fn from_json(v: &Value) -> Result<Self> {
        let cfg: BlockDeskConfig =
            serde_json::from_value(v.clone()).context("config does not match BlockDesk schema")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        self.timezone()?;
        if self.reservation.penalty_window_minutes < 0 {
            bail!("reservation.penalty_window_minutes must be >= 0");
        }
        if self.reservation.late_unclaim_points > 0 {
            bail!("reservation.late_unclaim_points must be <= 0");
        }
        if self.sweeper.interval_secs == 0 {
            bail!("sweeper.interval_secs must be > 0");
        }
        if self.fanout.subscriber_buffer == 0 {
            bail!("fanout.subscriber_buffer must be > 0");
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz> {
        Tz::from_str(&self.reservation.timezone)
            .map_err(|e| anyhow!("invalid reservation.timezone {:?}: {e}", self.reservation.timezone))
    }

    pub fn policy(&self) -> Result<ReservationPolicy> {
        Ok(ReservationPolicy {
            timezone: self.timezone()?,
            penalty_window_minutes: self.reservation.penalty_window_minutes,
            late_unclaim_points: self.reservation.late_unclaim_points,
        })
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper.interval_secs)
    }

    /// `daemon.addr`, unless `BLK_DAEMON_ADDR` is set.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let raw = std::env::var(crate::ENV_DAEMON_ADDR).unwrap_or_else(|_| self.daemon.addr.clone());
        raw.parse()
            .with_context(|| format!("invalid daemon bind address: {raw}"))
    }
}
