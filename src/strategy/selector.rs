//! Instrument and direction selection.
//!
//! Direction scoring is a pure function over [`SignalInputs`]; the selector
//! gathers those inputs (candles, inventory, trade history) and applies the
//! cooldown and loss-streak rules around it.

use crate::config::SelectionConfig;
use crate::exchange::{Direction, ExchangeGateway, Pair, TradingMode};
use crate::persistence::{DirectionStats, TradeStore};
use anyhow::Result;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Inputs to direction scoring.
#[derive(Debug, Clone)]
pub struct SignalInputs {
    /// `(weight, fractional return)` per momentum window
    pub momentum: Vec<(Decimal, Decimal)>,
    pub stats: DirectionStats,
    pub mode: TradingMode,
    /// Base asset currently held
    pub inventory: Decimal,
    pub override_gap: Decimal,
    pub min_samples: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectionDecision {
    pub direction: Direction,
    /// 0..=1
    pub confidence: Decimal,
    /// Every momentum window agrees on the sign
    pub aligned: bool,
    pub reasons: Vec<String>,
}

/// Whether `direction` can be traded given mode and inventory.
pub fn direction_allowed(direction: Direction, mode: TradingMode, inventory: Decimal) -> bool {
    match (mode, direction) {
        (TradingMode::Spot, Direction::Short) => inventory > Decimal::ZERO,
        _ => true,
    }
}

pub fn score_direction(inputs: &SignalInputs) -> DirectionDecision {
    let mut reasons = Vec::new();

    let total_weight: Decimal = inputs.momentum.iter().map(|(w, _)| *w).sum();
    let score: Decimal = inputs
        .momentum
        .iter()
        .map(|(w, r)| {
            if r.is_sign_positive() && !r.is_zero() {
                *w
            } else if r.is_sign_negative() && !r.is_zero() {
                -*w
            } else {
                Decimal::ZERO
            }
        })
        .sum();

    let aligned = !inputs.momentum.is_empty()
        && (inputs.momentum.iter().all(|(_, r)| *r > Decimal::ZERO)
            || inputs.momentum.iter().all(|(_, r)| *r < Decimal::ZERO));

    let mut direction = if score < Decimal::ZERO {
        Direction::Short
    } else {
        Direction::Long
    };
    let mut confidence = if total_weight > Decimal::ZERO {
        (score.abs() / total_weight).min(Decimal::ONE)
    } else {
        Decimal::ZERO
    };
    reasons.push(format!("momentum score {score}"));
    if aligned {
        reasons.push("all windows aligned".to_string());
    }

    let enough_samples = inputs.stats.samples(Direction::Long) >= inputs.min_samples
        && inputs.stats.samples(Direction::Short) >= inputs.min_samples;
    if enough_samples {
        if let (Some(current), Some(other)) = (
            inputs.stats.win_rate(direction),
            inputs.stats.win_rate(direction.opposite()),
        ) {
            let gap = other - current;
            if gap > inputs.override_gap {
                reasons.push(format!(
                    "win rate {} {} beats {} {} by {gap}",
                    direction.opposite(),
                    other.round_dp(2),
                    direction,
                    current.round_dp(2)
                ));
                direction = direction.opposite();
                confidence = gap.min(Decimal::ONE);
            }
        }
    }

    if !direction_allowed(direction, inputs.mode, inputs.inventory) {
        reasons.push("no inventory to sell in spot mode".to_string());
        direction = Direction::Long;
        confidence = Decimal::ZERO;
    }

    DirectionDecision {
        direction,
        confidence,
        aligned,
        reasons,
    }
}

/// Fractional return over each window, using one-minute closes (oldest first).
/// Windows longer than the series contribute a zero return.
pub fn momentum_returns(closes: &[Decimal], windows: &[u32]) -> Vec<Decimal> {
    let Some(last) = closes.last() else {
        return vec![Decimal::ZERO; windows.len()];
    };
    windows
        .iter()
        .map(|w| {
            let w = *w as usize;
            if closes.len() <= w {
                return Decimal::ZERO;
            }
            let base = closes[closes.len() - 1 - w];
            if base.is_zero() {
                Decimal::ZERO
            } else {
                (*last - base) / base
            }
        })
        .collect()
}

/// Consecutive losses below `threshold`, counting from the newest trade.
pub fn loss_streak(pnls_newest_first: &[Decimal], threshold: Decimal) -> u32 {
    pnls_newest_first
        .iter()
        .take_while(|pnl| **pnl < threshold)
        .count() as u32
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub pair: Pair,
    pub direction: Direction,
    pub confidence: Decimal,
    pub aligned: bool,
    pub reasons: Vec<String>,
    pub loss_streak: u32,
    /// Trailing win rate for the chosen direction, when enough samples exist
    pub win_rate: Option<Decimal>,
    /// Average win over average loss, under the same sample rule
    pub win_loss_ratio: Option<Decimal>,
    pub closes: Vec<Decimal>,
}

#[derive(Debug, Clone)]
pub enum Selection {
    Chosen(Candidate),
    /// Normal, retryable skip
    NoCandidate { reason: String },
}

pub struct InstrumentSelector {
    config: SelectionConfig,
    store: Arc<TradeStore>,
}

impl InstrumentSelector {
    pub fn new(config: SelectionConfig, store: Arc<TradeStore>) -> Self {
        Self { config, store }
    }

    /// Pick one unblocked (pair, direction) from `candidates` in priority
    /// order, skipping anything in `taken`.
    pub async fn select(
        &self,
        gateway: &ExchangeGateway,
        candidates: &[Pair],
        mode: TradingMode,
        sandbox: bool,
        taken: &HashSet<(Pair, Direction)>,
    ) -> Result<Selection> {
        let now = Utc::now();
        let cooldown = Duration::minutes(i64::from(self.config.cooldown_minutes));
        let since = now - Duration::days(i64::from(self.config.win_rate_lookback_days));
        let longest = self.config.momentum_windows.iter().copied().max().unwrap_or(0) as usize;

        let mut blocked: Vec<Candidate> = Vec::new();
        let mut skipped = 0usize;

        for pair in candidates {
            let closes = match gateway.get_recent_closes(pair, longest + 1).await {
                Ok(closes) => closes,
                Err(e) => {
                    warn!(%pair, "Momentum data unavailable, scoring neutral: {}", e);
                    Vec::new()
                }
            };
            let inventory = match mode {
                TradingMode::Spot => gateway.get_free_balance(&pair.base).await.unwrap_or_else(|e| {
                    warn!(%pair, "Inventory lookup failed: {}", e);
                    Decimal::ZERO
                }),
                TradingMode::Leverage => Decimal::ZERO,
            };
            let stats = self.store.direction_stats(pair, sandbox, since)?;

            let returns = momentum_returns(&closes, &self.config.momentum_windows);
            let decision = score_direction(&SignalInputs {
                momentum: self
                    .config
                    .momentum_weights
                    .iter()
                    .copied()
                    .zip(returns)
                    .collect(),
                stats,
                mode,
                inventory,
                override_gap: self.config.win_rate_override_gap,
                min_samples: self.config.win_rate_min_samples,
            });

            let primary = decision.direction;
            let opposite = primary.opposite();
            let opposite_allowed = direction_allowed(opposite, mode, inventory);

            let mut order = vec![primary];
            let mut primary_blocked = false;

            let mut idx = 0;
            while idx < order.len() {
                let direction = order[idx];
                idx += 1;

                if taken.contains(&(pair.clone(), direction)) {
                    skipped += 1;
                    if direction == primary
                        && mode == TradingMode::Leverage
                        && !decision.aligned
                    {
                        order.push(opposite);
                    }
                    continue;
                }

                if let Some(last) = self.store.last_opened_at(pair, Some(direction), sandbox)? {
                    if now - last < cooldown {
                        debug!(%pair, %direction, "In cooldown, skipping");
                        skipped += 1;
                        continue;
                    }
                }

                let pnls = self.store.recent_closed_pnls(
                    pair,
                    direction,
                    sandbox,
                    self.config.streak_lookback,
                )?;
                let streak = loss_streak(&pnls, self.config.loss_threshold);

                let samples_ok = stats.samples(direction) >= self.config.win_rate_min_samples;
                let candidate = Candidate {
                    pair: pair.clone(),
                    direction,
                    confidence: if direction == primary {
                        decision.confidence
                    } else {
                        Decimal::ONE - decision.confidence
                    },
                    aligned: decision.aligned && direction == primary,
                    reasons: decision.reasons.clone(),
                    loss_streak: streak,
                    win_rate: if samples_ok { stats.win_rate(direction) } else { None },
                    win_loss_ratio: if samples_ok {
                        stats.win_loss_ratio(direction)
                    } else {
                        None
                    },
                    closes: closes.clone(),
                };

                if streak >= self.config.loss_streak_ceiling {
                    info!(%pair, %direction, streak, "Blocked by loss streak");
                    if direction == primary {
                        primary_blocked = true;
                    }
                    blocked.push(candidate);
                    if primary_blocked && opposite_allowed && order.len() == 1 {
                        order.push(opposite);
                    }
                    continue;
                }

                info!(
                    %pair,
                    %direction,
                    confidence = %candidate.confidence,
                    aligned = candidate.aligned,
                    "Selected candidate"
                );
                return Ok(Selection::Chosen(candidate));
            }
        }

        if self.config.reset_least_blocked {
            if let Some(least) = blocked
                .iter()
                .filter(|c| !taken.contains(&(c.pair.clone(), c.direction)))
                .min_by_key(|c| c.loss_streak)
                .cloned()
            {
                warn!(
                    pair = %least.pair,
                    direction = %least.direction,
                    streak = least.loss_streak,
                    "All candidates blocked, retrying least blocked"
                );
                let mut least = least;
                least.reasons.push("least blocked after all candidates blocked".to_string());
                return Ok(Selection::Chosen(least));
            }
        }

        Ok(Selection::NoCandidate {
            reason: format!(
                "no unblocked candidate ({} blocked, {} skipped)",
                blocked.len(),
                skipped
            ),
        })
    }
}
