//! Fee rates and the ancestor-score ordering.

use betg_consensus::Amount;
use betg_pow::Hash256;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Fee per 1000 virtual bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FeeRate(pub Amount);

impl FeeRate {
    pub const fn per_kvb(amount: Amount) -> Self {
        Self(amount)
    }

    /// Rate paid by `fee` over `vsize`.
    pub fn from_fee(fee: Amount, vsize: u64) -> Self {
        if vsize == 0 {
            return Self(0);
        }
        Self((i128::from(fee) * 1000 / i128::from(vsize)) as Amount)
    }

    /// Fee for `vsize` virtual bytes. Never rounds a non-zero rate to zero.
    pub fn fee(&self, vsize: u64) -> Amount {
        let fee = (i128::from(self.0) * i128::from(vsize) / 1000) as Amount;
        if fee == 0 && vsize != 0 {
            return self.0.signum();
        }
        fee
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/kvB", self.0)
    }
}

/// Compare `fee_a / size_a` with `fee_b / size_b` without division.
pub fn compare_feerate(fee_a: Amount, size_a: u64, fee_b: Amount, size_b: u64) -> Ordering {
    let lhs = i128::from(fee_a) * i128::from(size_b);
    let rhs = i128::from(fee_b) * i128::from(size_a);
    lhs.cmp(&rhs)
}

/// Mining order key: highest ancestor feerate first, then earliest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncestorScoreKey {
    /// Modified fees of the entry and its in-pool ancestors.
    pub fees: Amount,
    /// Virtual size of the entry and its in-pool ancestors.
    pub size: u64,
    pub sequence: u64,
    pub txid: Hash256,
}

impl Ord for AncestorScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so that iteration yields the best score first.
        compare_feerate(other.fees, other.size, self.fees, self.size)
            .then_with(|| self.sequence.cmp(&other.sequence))
            .then_with(|| self.txid.cmp(&other.txid))
    }
}

impl PartialOrd for AncestorScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn key(fees: Amount, size: u64, sequence: u64) -> AncestorScoreKey {
        AncestorScoreKey {
            fees,
            size,
            sequence,
            txid: Hash256::new([sequence as u8; 32]),
        }
    }

    #[test]
    fn test_ancestor_score_ordering() {
        let mut set = BTreeSet::new();
        set.insert(key(1000, 100, 1)); // 10 per byte
        set.insert(key(2000, 100, 2)); // 20 per byte
        set.insert(key(1000, 100, 0)); // 10 per byte, earlier
        set.insert(key(-500, 100, 3)); // negative after deprioritisation

        let order: Vec<u64> = set.iter().map(|k| k.sequence).collect();
        assert_eq!(order, vec![2, 0, 1, 3]);
    }

    #[test]
    fn test_feerate_cross_multiplication() {
        assert_eq!(compare_feerate(1, 3, 2, 6), Ordering::Equal);
        assert_eq!(compare_feerate(i64::MAX, 1, i64::MAX, 2), Ordering::Greater);
    }

    #[test]
    fn test_fee_rate_fee() {
        let rate = FeeRate::per_kvb(1000);
        assert_eq!(rate.fee(250), 250);
        assert_eq!(FeeRate::per_kvb(1).fee(10), 1);
        assert_eq!(FeeRate::per_kvb(0).fee(10), 0);
        assert_eq!(FeeRate::from_fee(500, 250), FeeRate(2000));
        assert_eq!(rate.to_string(), "1000 sat/kvB");
    }
}
