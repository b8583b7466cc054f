//! Position sizing
//!
//! Turns a ranked opportunity list into concrete share allocations. Every
//! candidate is scaled by the product of the regime, rotation, volatility
//! and stock-health multipliers, then clipped by the minimum tradeable size,
//! the per-ticker concentration cap and the remaining cash and slots.
//! Quantities are floor-rounded so the book can never overspend.

use ordered_float::OrderedFloat;
use std::collections::HashMap;
use tracing::debug;

use crate::config::SizingConfig;
use crate::{Allocation, ScoredOpportunity, Symbol};

/// Portfolio context the sizer works against
#[derive(Debug, Clone)]
pub struct PortfolioContext {
    pub deployable_cash: f64,
    pub portfolio_value: f64,
    pub available_slots: usize,
    /// Current market value of existing exposure per ticker
    pub existing_exposure: HashMap<Symbol, f64>,
}

pub struct PositionSizer {
    config: SizingConfig,
    min_composite_score: f64,
}

impl PositionSizer {
    pub fn new(config: SizingConfig, min_composite_score: f64) -> Self {
        Self {
            config,
            min_composite_score,
        }
    }

    /// Size the given opportunities, best score first.
    ///
    /// `rotation_multiplier` is looked up per symbol by the caller-provided
    /// closure so the sizer stays decoupled from the rotation bookkeeping.
    pub fn allocate<F>(
        &self,
        opportunities: &[ScoredOpportunity],
        ctx: &PortfolioContext,
        regime_multiplier: f64,
        rotation_multiplier: F,
    ) -> Vec<Allocation>
    where
        F: Fn(&Symbol) -> f64,
    {
        let mut ranked: Vec<&ScoredOpportunity> = opportunities
            .iter()
            .filter(|o| o.score >= self.min_composite_score)
            .filter(|o| o.price > 0.0)
            .collect();
        ranked.sort_by_key(|o| std::cmp::Reverse(OrderedFloat(o.score)));

        let mut allocations = Vec::new();
        let mut remaining_cash = ctx.deployable_cash;
        let mut remaining_slots = ctx.available_slots;

        for opportunity in ranked {
            if remaining_slots == 0 || remaining_cash < self.config.min_position_value {
                break;
            }

            let rotation = rotation_multiplier(&opportunity.symbol);
            if rotation <= 0.0 {
                debug!(symbol = %opportunity.symbol, "skipping untradeable ticker");
                continue;
            }

            let volatility = self.config.volatility_multiplier(opportunity.volatility_class);
            let health = opportunity.stock_health;
            let effective = regime_multiplier * rotation * volatility * health;
            if effective <= 0.0 {
                continue;
            }

            let mut dollars = ctx.deployable_cash * self.config.base_position_pct * effective;

            // Per-ticker concentration: existing plus new stays under the cap
            let existing = ctx
                .existing_exposure
                .get(&opportunity.symbol)
                .copied()
                .unwrap_or(0.0);
            let cap = ctx.portfolio_value * self.config.max_ticker_pct;
            let headroom = cap - existing;
            if headroom < self.config.min_position_value {
                debug!(symbol = %opportunity.symbol, "no concentration headroom");
                continue;
            }
            dollars = dollars.min(headroom).min(remaining_cash);

            if dollars < self.config.min_position_value {
                continue;
            }

            let mut quantity = (dollars / opportunity.price).floor();
            // Rounding can still overshoot by a fraction of a share
            while quantity > 0.0 && quantity * opportunity.price > remaining_cash {
                quantity -= 1.0;
            }
            if quantity <= 0.0 {
                continue;
            }

            let cost = quantity * opportunity.price;
            if cost < self.config.min_position_value {
                continue;
            }

            remaining_cash -= cost;
            remaining_slots -= 1;
            allocations.push(Allocation {
                symbol: opportunity.symbol.clone(),
                quantity,
                cost,
                price: opportunity.price,
                regime_multiplier,
                rotation_multiplier: rotation,
                volatility_multiplier: volatility,
                health_multiplier: health,
            });
        }

        allocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VolatilityClass;

    fn opportunity(symbol: &str, score: f64, price: f64) -> ScoredOpportunity {
        ScoredOpportunity {
            symbol: Symbol::new(symbol),
            score,
            price,
            atr: price * 0.02,
            volatility_class: VolatilityClass::Medium,
            stock_health: 1.0,
            signal: "trend_breakout".to_string(),
        }
    }

    fn context(cash: f64, value: f64, slots: usize) -> PortfolioContext {
        PortfolioContext {
            deployable_cash: cash,
            portfolio_value: value,
            available_slots: slots,
            existing_exposure: HashMap::new(),
        }
    }

    fn sizer() -> PositionSizer {
        PositionSizer::new(SizingConfig::default(), 55.0)
    }

    #[test]
    fn test_basic_allocation() {
        let s = sizer();
        let ctx = context(50_000.0, 100_000.0, 5);
        let opportunities = vec![opportunity("AAPL", 80.0, 100.0)];

        let allocations = s.allocate(&opportunities, &ctx, 1.0, |_| 1.0);
        assert_eq!(allocations.len(), 1);
        // 50,000 * 0.10 = 5,000 -> 50 shares
        assert_eq!(allocations[0].quantity, 50.0);
        assert_eq!(allocations[0].cost, 5_000.0);
    }

    #[test]
    fn test_low_scores_rejected_before_sizing() {
        let s = sizer();
        let ctx = context(50_000.0, 100_000.0, 5);
        let opportunities = vec![opportunity("AAPL", 40.0, 100.0)];

        assert!(s.allocate(&opportunities, &ctx, 1.0, |_| 1.0).is_empty());
    }

    #[test]
    fn test_best_scores_sized_first() {
        let s = sizer();
        // Cash for roughly one position only
        let ctx = context(6_000.0, 100_000.0, 5);
        let opportunities = vec![
            opportunity("AAPL", 60.0, 100.0),
            opportunity("NVDA", 90.0, 100.0),
        ];

        let allocations = s.allocate(&opportunities, &ctx, 1.0, |_| 1.0);
        assert_eq!(allocations[0].symbol, Symbol::new("NVDA"));
    }

    #[test]
    fn test_total_cost_never_exceeds_cash() {
        let s = sizer();
        let ctx = context(10_000.0, 100_000.0, 10);
        let opportunities: Vec<ScoredOpportunity> = (0..10)
            .map(|i| opportunity(&format!("T{}", i), 80.0, 333.0))
            .collect();

        let allocations = s.allocate(&opportunities, &ctx, 2.0, |_| 1.5);
        let total: f64 = allocations.iter().map(|a| a.cost).sum();
        assert!(total <= 10_000.0);
        for allocation in &allocations {
            assert!(allocation.cost <= 10_000.0);
        }
    }

    #[test]
    fn test_concentration_cap_respected() {
        let s = sizer();
        let mut ctx = context(80_000.0, 100_000.0, 5);
        // Existing exposure is already near the 15% cap
        ctx.existing_exposure
            .insert(Symbol::new("AAPL"), 14_800.0);
        let opportunities = vec![opportunity("AAPL", 90.0, 100.0)];

        // Headroom of 200 is below the minimum tradeable size
        assert!(s.allocate(&opportunities, &ctx, 1.0, |_| 1.0).is_empty());

        ctx.existing_exposure.insert(Symbol::new("AAPL"), 10_000.0);
        let allocations = s.allocate(&opportunities, &ctx, 1.0, |_| 1.0);
        assert_eq!(allocations.len(), 1);
        assert!(allocations[0].cost + 10_000.0 <= 15_000.0 + 1e-9);
    }

    #[test]
    fn test_slot_limit() {
        let s = sizer();
        let ctx = context(50_000.0, 100_000.0, 2);
        let opportunities: Vec<ScoredOpportunity> = (0..5)
            .map(|i| opportunity(&format!("T{}", i), 80.0 - i as f64, 50.0))
            .collect();

        assert_eq!(s.allocate(&opportunities, &ctx, 1.0, |_| 1.0).len(), 2);
    }

    #[test]
    fn test_frozen_ticker_skipped_entirely() {
        let s = sizer();
        let ctx = context(50_000.0, 100_000.0, 5);
        let opportunities = vec![
            opportunity("FROZEN", 95.0, 100.0),
            opportunity("AAPL", 70.0, 100.0),
        ];

        let allocations = s.allocate(&opportunities, &ctx, 1.0, |s| {
            if s.as_str() == "FROZEN" {
                0.0
            } else {
                1.0
            }
        });
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].symbol, Symbol::new("AAPL"));
    }

    #[test]
    fn test_multipliers_stack() {
        let s = sizer();
        let ctx = context(100_000.0, 200_000.0, 5);
        let mut premium = opportunity("NVDA", 90.0, 100.0);
        premium.stock_health = 0.8;

        // 100,000 * 0.10 * (0.5 regime * 1.5 rotation * 1.0 vol * 0.8 health)
        // = 6,000
        let allocations = s.allocate(&[premium], &ctx, 0.5, |_| 1.5);
        assert_eq!(allocations[0].quantity, 60.0);
        assert!((allocations[0].rotation_multiplier - 1.5).abs() < 1e-9);
        assert!((allocations[0].regime_multiplier - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_tiny_budget_yields_nothing() {
        let s = sizer();
        let ctx = context(400.0, 100_000.0, 5);
        let opportunities = vec![opportunity("AAPL", 90.0, 100.0)];
        assert!(s.allocate(&opportunities, &ctx, 1.0, |_| 1.0).is_empty());
    }

    #[test]
    fn test_affordability_recheck_drops_a_share() {
        let config = SizingConfig {
            base_position_pct: 1.0,
            min_position_value: 100.0,
            max_ticker_pct: 1.0,
            ..Default::default()
        };
        let s = PositionSizer::new(config, 0.0);
        // 1,000 cash at price 333: floor(1000/333) = 3 shares = 999 <= 1000
        let ctx = context(1_000.0, 100_000.0, 1);
        let allocations = s.allocate(&[opportunity("AAPL", 90.0, 333.0)], &ctx, 1.0, |_| 1.0);
        assert_eq!(allocations[0].quantity, 3.0);

        // At 333.5 three shares would cost 1000.5; only two fit the budget
        let allocations = s.allocate(&[opportunity("AAPL", 90.0, 333.5)], &ctx, 1.0, |_| 1.0);
        assert_eq!(allocations[0].quantity, 2.0);
        assert!(allocations[0].cost <= 1_000.0);
    }
}
