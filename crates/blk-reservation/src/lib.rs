//! Block reservation protocol.
//!
//! # Layout
//! - [`gate`]: eligibility check, run before any store transaction.
//! - [`store`]: the transactional seam. [`memory`] and [`postgres`] implement it.
//! - [`coordinator`]: claim/unclaim/list entry points; publishes events only
//!   after the store has committed.
//! - [`sweeper`]: periodic expiry of stale blocks and their claims.

pub mod clock;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{group_by_date, BlocksByDate, ClaimCoordinator, DayGroup};
pub use error::{ReservationError, Resource};
pub use gate::{EligibilityGate, EligibilitySource};
pub use memory::MemoryReservationStore;
pub use postgres::{PgEligibilitySource, PgReservationStore};
pub use store::ReservationStore;
pub use sweeper::{SweepReport, Sweeper};
