//! Capital allocation across exchanges.

use crate::config::AllocationConfig;
use crate::exchange::Exchange;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

/// Balance picture for one exchange, gathered before allocation.
#[derive(Debug, Clone)]
pub struct ExchangeSnapshot {
    pub exchange: Exchange,
    /// Free quote balance
    pub free_balance: Decimal,
    /// Smallest venue minimum notional across the candidate pairs
    pub min_notional: Decimal,
    pub open_positions: u32,
}

/// Concurrent-position capacity granted to one exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeCapacity {
    pub exchange: Exchange,
    pub free_balance: Decimal,
    pub slots: u32,
}

/// Decides which exchanges get new positions and how many.
pub struct CapitalAllocator {
    config: AllocationConfig,
    fixed_position_size: Decimal,
}

impl CapitalAllocator {
    pub fn new(config: AllocationConfig, fixed_position_size: Decimal) -> Self {
        Self {
            config,
            fixed_position_size,
        }
    }

    /// Free balance must exceed the venue minimum times the safety factor.
    pub fn is_eligible(&self, free_balance: Decimal, min_notional: Decimal) -> bool {
        free_balance > min_notional * self.config.balance_safety_factor
    }

    /// `floor(balance * margin_fraction / fixed_size) - open`, never negative.
    pub fn slots(&self, free_balance: Decimal, open_positions: u32) -> u32 {
        if self.fixed_position_size <= Decimal::ZERO || free_balance <= Decimal::ZERO {
            return 0;
        }
        let total = (free_balance * self.config.margin_fraction / self.fixed_position_size)
            .floor()
            .to_u32()
            .unwrap_or(u32::MAX);
        total.saturating_sub(open_positions)
    }

    /// Eligible exchanges with at least one free slot.
    pub fn plan(&self, snapshots: &[ExchangeSnapshot]) -> Vec<ExchangeCapacity> {
        snapshots
            .iter()
            .filter_map(|snap| {
                if !self.is_eligible(snap.free_balance, snap.min_notional) {
                    debug!(
                        exchange = %snap.exchange,
                        balance = %snap.free_balance,
                        "Balance below minimum, skipping exchange"
                    );
                    return None;
                }
                let slots = self.slots(snap.free_balance, snap.open_positions);
                debug!(
                    exchange = %snap.exchange,
                    balance = %snap.free_balance,
                    open = snap.open_positions,
                    slots,
                    "Exchange capacity"
                );
                (slots > 0).then(|| ExchangeCapacity {
                    exchange: snap.exchange,
                    free_balance: snap.free_balance,
                    slots,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn allocator() -> CapitalAllocator {
        CapitalAllocator::new(AllocationConfig::default(), dec!(20))
    }

    fn snapshot(exchange: Exchange, balance: Decimal, open: u32) -> ExchangeSnapshot {
        ExchangeSnapshot {
            exchange,
            free_balance: balance,
            min_notional: dec!(10),
            open_positions: open,
        }
    }

    #[test]
    fn test_slots() {
        let alloc = allocator();
        // 100 * 0.9 / 20 = 4.5
        assert_eq!(alloc.slots(dec!(100), 0), 4);
        assert_eq!(alloc.slots(dec!(100), 3), 1);
        assert_eq!(alloc.slots(dec!(100), 9), 0);
        assert_eq!(alloc.slots(dec!(0), 0), 0);
    }

    #[test]
    fn test_eligibility_uses_safety_factor() {
        let alloc = allocator();
        assert!(!alloc.is_eligible(dec!(11), dec!(10)));
        assert!(alloc.is_eligible(dec!(11.01), dec!(10)));
    }

    #[test]
    fn test_plan_filters_exchanges() {
        let alloc = allocator();
        let plan = alloc.plan(&[
            snapshot(Exchange::Binance, dec!(50), 0),
            snapshot(Exchange::GateIo, dec!(5), 0),
        ]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].exchange, Exchange::Binance);
        assert_eq!(plan[0].slots, 2);

        let full = alloc.plan(&[snapshot(Exchange::Binance, dec!(50), 2)]);
        assert!(full.is_empty());
    }
}
