//! Engine policies: peer ranking, reputation, self health and limits.
//!
//! Everything here is pure state or arithmetic; the supervisor owns the
//! instances and feeds them the clock.

pub mod health;
pub mod limits;
pub mod reputation;
pub mod scoring;

pub use health::{upload_ceiling, HealthMonitor, HealthVerdict};
pub use limits::download_concurrency_limit;
pub use reputation::{CircuitBreaker, Reputation, StrikeOutcome};
pub use scoring::score;
