/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Computation of the digest-tree root over ordered digest lists.
//!
//! Block finalization computes two of these roots: one over the action receipts produced
//! by the block's transactions, and one over the transaction receipts included in the
//! block. Both are deterministic functions of execution order, so any two nodes that
//! execute the same block arrive at the same header.

use super::basic::CryptoHash;

/// Computes the root of a binary digest tree over `digests` in order.
///
/// An empty list hashes to the zero digest. A layer with an odd number of nodes promotes
/// a duplicate of its last node.
pub fn merkle(mut digests: Vec<CryptoHash>) -> CryptoHash {
    if digests.is_empty() {
        return CryptoHash::zero();
    }

    while digests.len() > 1 {
        if digests.len() % 2 != 0 {
            let last = *digests.last().expect("layer is non-empty");
            digests.push(last);
        }
        digests = digests
            .chunks(2)
            .map(|pair| CryptoHash::combine(&pair[0], &pair[1]))
            .collect();
    }

    digests[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_hashes_to_zero() {
        assert_eq!(merkle(vec![]), CryptoHash::zero());
    }

    #[test]
    fn singleton_root_is_the_digest_itself() {
        let digest = CryptoHash::digest(b"only");
        assert_eq!(merkle(vec![digest]), digest);
    }

    #[test]
    fn root_depends_on_order() {
        let a = CryptoHash::digest(b"a");
        let b = CryptoHash::digest(b"b");
        assert_ne!(merkle(vec![a, b]), merkle(vec![b, a]));
    }

    #[test]
    fn odd_layers_duplicate_the_last_node() {
        let a = CryptoHash::digest(b"a");
        let b = CryptoHash::digest(b"b");
        let c = CryptoHash::digest(b"c");
        let ab = CryptoHash::combine(&a, &b);
        let cc = CryptoHash::combine(&c, &c);
        assert_eq!(merkle(vec![a, b, c]), CryptoHash::combine(&ab, &cc));
    }
}
