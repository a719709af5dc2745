/// Gas price escalation
use crate::config::GasConfig;
use crate::errors::{TxmError, TxmResult};
use crate::types::Wei;

/// Price ceiling for a transaction: the configured maximum, lowered to the
/// transaction's own limit when it has one
pub fn gas_ceiling(config: &GasConfig, tx_max: Option<Wei>) -> Wei {
    match tx_max {
        Some(max) => max.min(config.max_gas_price),
        None => config.max_gas_price,
    }
}

/// Next gas price after `original` was rejected or stuck
///
/// The baseline is the higher of `original` and the configured default; the
/// bump is the larger of the percentage and the fixed increment. Exceeding
/// `ceiling` or failing to move the price are configuration errors.
pub fn bump_gas(config: &GasConfig, original: Wei, ceiling: Wei) -> TxmResult<Wei> {
    let baseline = original.max(config.default_gas_price).as_u128();

    let by_percent = baseline.saturating_mul(100 + config.bump_percent as u128) / 100;
    let by_increment = baseline.saturating_add(config.bump_wei.as_u128());
    let bumped = Wei(by_percent.max(by_increment));

    if bumped > ceiling {
        return Err(TxmError::GasBumpExceedsLimit {
            bumped,
            max: ceiling,
            original,
        });
    }
    if bumped == original {
        return Err(TxmError::GasBumpNoEffect(original));
    }
    Ok(bumped)
}
