//! Block subsidy schedule.

use crate::params::INITIAL_SUBSIDY;
use crate::{Amount, ChainParams};

/// New coins created by the block at `height`.
///
/// Starts at 5000 coins and halves every `subsidy_halving_interval` blocks.
pub fn get_block_subsidy(height: u32, params: &ChainParams) -> Amount {
    let halvings = height / params.subsidy_halving_interval;
    // Shifting by 64 or more is undefined for i64.
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{COIN, MAX_MONEY};

    #[test]
    fn test_halving_schedule() {
        let params = ChainParams::main();
        let interval = params.subsidy_halving_interval;
        assert_eq!(get_block_subsidy(0, &params), 5000 * COIN);
        assert_eq!(get_block_subsidy(interval - 1, &params), 5000 * COIN);
        assert_eq!(get_block_subsidy(interval, &params), 2500 * COIN);
        assert_eq!(get_block_subsidy(interval * 2, &params), 1250 * COIN);
    }

    #[test]
    fn test_subsidy_reaches_zero() {
        let params = ChainParams::regtest();
        let interval = params.subsidy_halving_interval;
        assert_eq!(get_block_subsidy(interval * 64, &params), 0);
        assert!(get_block_subsidy(interval * 40, &params) == 0);
        assert!(get_block_subsidy(interval * 30, &params) > 0);
    }

    #[test]
    fn test_total_supply_below_max_money() {
        let params = ChainParams::main();
        let mut total: Amount = 0;
        let mut subsidy = get_block_subsidy(0, &params);
        let mut era = 0u32;
        while subsidy > 0 {
            total += subsidy * Amount::from(params.subsidy_halving_interval);
            era += 1;
            subsidy = get_block_subsidy(era * params.subsidy_halving_interval, &params);
        }
        assert!(total <= MAX_MONEY);
    }
}
