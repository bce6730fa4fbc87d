//! Entry side of the engine.
//!
//! Contains the logic for:
//! - Position sizing and profit targets
//! - Instrument and direction selection
//! - Capital allocation across exchanges
//! - The per-cycle execution pipeline

mod allocator;
mod executor;
mod selector;
mod sizer;

pub use allocator::{CapitalAllocator, ExchangeCapacity, ExchangeSnapshot};
pub use executor::{
    idempotency_key, CycleOutcome, CycleRequest, ExecutionPipeline, PositionSummary, SkipReason,
};
pub use selector::{
    direction_allowed, loss_streak, momentum_returns, score_direction, Candidate,
    DirectionDecision, InstrumentSelector, Selection, SignalInputs,
};
pub use sizer::{
    calculate_minimum_profit, calculate_optimal_profit, clamp_win_rate, kelly_fraction,
    volatility, PositionSizer, SizeDecision, SizingInputs,
};
