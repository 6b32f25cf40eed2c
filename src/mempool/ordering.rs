//! Transaction ordering by fee.

use std::cmp::Ordering;

use crate::crypto::Hash;

/// Priority key of a pooled transaction.
///
/// Higher fee per byte sorts first, then earlier arrival, then lower hash.
/// Fee rates are compared by cross-multiplication so no precision is lost.
#[derive(Debug, Clone, Copy)]
pub struct FeeOrdering {
    pub hash: Hash,
    pub fee: u64,
    pub size: u64,
    pub arrival: u64,
}

impl FeeOrdering {
    pub fn new(hash: Hash, fee: u64, size: u64, arrival: u64) -> Self {
        Self {
            hash,
            fee,
            size,
            arrival,
        }
    }

    fn cmp_fee_rate(&self, other: &Self) -> Ordering {
        let ours = self.fee as u128 * other.size.max(1) as u128;
        let theirs = other.fee as u128 * self.size.max(1) as u128;
        theirs.cmp(&ours)
    }
}

impl PartialEq for FeeOrdering {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FeeOrdering {}

impl PartialOrd for FeeOrdering {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FeeOrdering {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_fee_rate(other)
            .then_with(|| self.arrival.cmp(&other.arrival))
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_fee_ordering() {
        let tx1 = FeeOrdering::new(Hash([1; 32]), 1000, 100, 1000); // 10 per byte
        let tx2 = FeeOrdering::new(Hash([2; 32]), 2000, 100, 1001); // 20 per byte
        let tx3 = FeeOrdering::new(Hash([3; 32]), 1000, 100, 999); // 10 per byte, earlier

        let ordered: Vec<_> = [tx1, tx2, tx3].into_iter().collect::<BTreeSet<_>>().into_iter().collect();

        assert_eq!(ordered[0].hash, tx2.hash);
        assert_eq!(ordered[1].hash, tx3.hash);
        assert_eq!(ordered[2].hash, tx1.hash);
    }

    #[test]
    fn test_equal_rate_different_sizes() {
        // 1000/100 == 3000/300
        let small = FeeOrdering::new(Hash([9; 32]), 1000, 100, 5);
        let large = FeeOrdering::new(Hash([1; 32]), 3000, 300, 5);
        assert!(large < small, "hash breaks the tie");

        let huge_fee = FeeOrdering::new(Hash([0; 32]), u64::MAX, u64::MAX, 0);
        assert_eq!(huge_fee.cmp_fee_rate(&huge_fee), Ordering::Equal);
    }
}
