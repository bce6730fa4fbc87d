//! Position exits and reconciliation.
//!
//! - Exit manager: per-position profit-target state machine, bracket
//!   tracking and the client-side price monitor
//! - Sweeper: scheduled cleanup of stale open trades
//!
//! Both close through [`PositionCloser`], which holds a lease on the trade
//! and finishes with a compare-and-set on the open status.

mod closer;
mod exit;
mod sweeper;

pub use closer::{estimate_pnl, exit_quantity, held_on_venue, ExitOutcome, PnlEstimate, PositionCloser};
pub use exit::{
    ExitManager, ExitReport, ExitThresholds, MonitorResult, MonitorTrigger, PriceMonitor,
};
pub use sweeper::{ReconciliationSweeper, SweepReport};
