//! Merkle root of the transaction hashes in a block

use super::{hash_pair, Hash};

/// Compute the merkle root of a list of hashes
///
/// An empty list yields the zero hash. Odd levels duplicate their last node.
pub fn compute_merkle_root(hashes: &[Hash]) -> Hash {
    let mut level: Vec<Hash> = match hashes {
        [] => return Hash::zero(),
        [single] => return *single,
        _ => hashes.to_vec(),
    };

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }

    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;

    fn make_hashes(n: u32) -> Vec<Hash> {
        (0..n).map(|i| hash_bytes(&i.to_le_bytes())).collect()
    }

    #[test]
    fn test_small_trees() {
        assert_eq!(compute_merkle_root(&[]), Hash::zero());

        let one = make_hashes(1);
        assert_eq!(compute_merkle_root(&one), one[0]);

        let two = make_hashes(2);
        assert_eq!(compute_merkle_root(&two), hash_pair(&two[0], &two[1]));
    }

    #[test]
    fn test_odd_count_duplicates_last() {
        let three = make_hashes(3);
        let left = hash_pair(&three[0], &three[1]);
        let right = hash_pair(&three[2], &three[2]);
        assert_eq!(compute_merkle_root(&three), hash_pair(&left, &right));
    }

    #[test]
    fn test_order_changes_root() {
        let mut hashes = make_hashes(4);
        let root = compute_merkle_root(&hashes);
        hashes.swap(0, 3);
        assert_ne!(compute_merkle_root(&hashes), root);
    }
}
