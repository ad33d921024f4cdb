//! DCA grid calculator
//!
//! Pure price/quantity math: given a base price, a per-pyramid grid
//! configuration and the venue's precision rules, emit the ordered ladder of
//! entry legs with their TP targets. Deterministic and side-effect free so
//! it can be tested in isolation.

use rust_decimal::Decimal;

use crate::config::DcaGridConfig;
use crate::error::{EngineError, EngineResult};
use crate::exchange::PrecisionRules;
use crate::types::Side;

/// One computed ladder leg, ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct GridLevel {
    pub leg_index: i64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub gap_percent: Decimal,
    pub weight_percent: Decimal,
    pub tp_percent: Decimal,
    pub tp_price: Decimal,
}

/// Round a price down to the nearest tick.
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return value;
    }
    (value / tick_size).floor() * tick_size
}

/// Round a quantity down to the nearest step.
pub fn round_to_step(value: Decimal, step_size: Decimal) -> Decimal {
    if step_size <= Decimal::ZERO {
        return value;
    }
    (value / step_size).floor() * step_size
}

const HUNDRED: Decimal = Decimal::from_parts(100, 0, 0, false, 0);

/// Compute the ladder price levels for one pyramid. Quantities are filled
/// in by [`allocate_quantities`] once the capital for the wave is known.
///
/// Gap percentages follow the averaging-down convention: a negative gap
/// places the leg below the base price for a long. The sign is mirrored for
/// the sell side.
pub fn calculate_dca_levels(
    base_price: Decimal,
    config: &DcaGridConfig,
    side: Side,
    precision: &PrecisionRules,
    pyramid_index: i64,
) -> Vec<GridLevel> {
    let layers = config.levels_for_pyramid(pyramid_index);

    layers
        .iter()
        .enumerate()
        .map(|(idx, layer)| {
            let gap_factor = layer.gap_percent / HUNDRED;
            let tp_factor = layer.tp_percent / HUNDRED;

            let raw_price = match side {
                Side::Buy => base_price * (Decimal::ONE + gap_factor),
                Side::Sell => base_price * (Decimal::ONE - gap_factor),
            };
            let price = round_to_tick(raw_price, precision.tick_size);

            let raw_tp = match side {
                Side::Buy => price * (Decimal::ONE + tp_factor),
                Side::Sell => price * (Decimal::ONE - tp_factor),
            };
            let tp_price = round_to_tick(raw_tp, precision.tick_size);

            GridLevel {
                leg_index: idx as i64,
                price,
                quantity: Decimal::ZERO,
                gap_percent: layer.gap_percent,
                weight_percent: layer.weight_percent,
                tp_percent: layer.tp_percent,
                tp_price,
            }
        })
        .collect()
}

/// Allocate capital across the ladder: each leg gets
/// `total_capital × weight / 100` worth at its price, rounded down to the
/// step size. Fails when any leg lands under the venue minimums.
pub fn allocate_quantities(
    mut levels: Vec<GridLevel>,
    total_capital_usd: Decimal,
    precision: &PrecisionRules,
) -> EngineResult<Vec<GridLevel>> {
    for level in &mut levels {
        if level.price <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "leg {} has non-positive price {}",
                level.leg_index, level.price
            )));
        }

        let leg_capital = total_capital_usd * level.weight_percent / HUNDRED;
        let quantity = round_to_step(leg_capital / level.price, precision.step_size);

        if quantity < precision.min_qty {
            return Err(EngineError::Validation(format!(
                "leg {} quantity {} below venue minimum {}",
                level.leg_index, quantity, precision.min_qty
            )));
        }

        let notional = quantity * level.price;
        if notional < precision.min_notional {
            return Err(EngineError::Validation(format!(
                "leg {} notional {} below venue minimum {}",
                level.leg_index, notional, precision.min_notional
            )));
        }

        level.quantity = quantity;
    }

    Ok(levels)
}

/// Convenience wrapper producing a fully sized ladder in one call.
pub fn build_ladder(
    base_price: Decimal,
    config: &DcaGridConfig,
    side: Side,
    precision: &PrecisionRules,
    pyramid_index: i64,
    total_capital_usd: Decimal,
) -> EngineResult<Vec<GridLevel>> {
    let levels = calculate_dca_levels(base_price, config, side, precision, pyramid_index);
    allocate_quantities(levels, total_capital_usd, precision)
}
