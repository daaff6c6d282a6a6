use std::collections::HashSet;

use crate::storage::models::Utxo;

/// Difference between two UTXO sets of one address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoDiff {
    /// In the current set but not the previous one
    pub new: Vec<Utxo>,
    /// In the previous set but not the current one
    pub spent: Vec<Utxo>,
}

impl UtxoDiff {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.spent.is_empty()
    }

    /// A non-empty spent list means coins moved
    pub fn has_spend(&self) -> bool {
        !self.spent.is_empty()
    }

    /// Apply to a stored set: drop spent, append new
    pub fn apply(&self, utxos: &mut Vec<Utxo>) {
        let spent: HashSet<&Utxo> = self.spent.iter().collect();
        utxos.retain(|u| !spent.contains(u));
        for utxo in &self.new {
            if !utxos.contains(utxo) {
                utxos.push(utxo.clone());
            }
        }
    }
}

/// Diff `previous` against `current` using full record equality
pub fn reconcile(previous: &[Utxo], current: &[Utxo]) -> UtxoDiff {
    let prev: HashSet<&Utxo> = previous.iter().collect();
    let curr: HashSet<&Utxo> = current.iter().collect();

    let mut new: Vec<Utxo> = Vec::new();
    for utxo in current {
        if !prev.contains(utxo) && !new.contains(utxo) {
            new.push(utxo.clone());
        }
    }
    let mut spent: Vec<Utxo> = Vec::new();
    for utxo in previous {
        if !curr.contains(utxo) && !spent.contains(utxo) {
            spent.push(utxo.clone());
        }
    }

    UtxoDiff { new, spent }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(tx: &str, vout: u32, value: u64, height: i64) -> Utxo {
        Utxo {
            tx_hash: tx.to_string(),
            output_index: vout,
            value,
            block_height: height,
            script_pubkey: "0014aa".to_string(),
            raw_tx_hex: format!("raw-{}", tx),
        }
    }

    #[test]
    fn test_same_set_yields_nothing() {
        let sets = vec![
            vec![],
            vec![utxo("a", 0, 10, 1)],
            vec![utxo("a", 0, 10, 1), utxo("b", 3, 99, 0), utxo("c", 1, 5, 7)],
        ];
        for set in sets {
            let diff = reconcile(&set, &set);
            assert!(diff.is_empty());
        }
    }

    #[test]
    fn test_new_and_spent() {
        let u = utxo("a", 0, 10, 1);

        let diff = reconcile(&[], &[u.clone()]);
        assert_eq!(diff.new, vec![u.clone()]);
        assert!(diff.spent.is_empty());
        assert!(!diff.has_spend());

        let diff = reconcile(&[u.clone()], &[]);
        assert!(diff.new.is_empty());
        assert_eq!(diff.spent, vec![u]);
        assert!(diff.has_spend());
    }

    #[test]
    fn test_confirmation_is_remove_plus_add() {
        let unconfirmed = utxo("a", 0, 10, 0);
        let confirmed = utxo("a", 0, 10, 812_000);

        let diff = reconcile(&[unconfirmed.clone()], &[confirmed.clone()]);
        assert_eq!(diff.new, vec![confirmed]);
        assert_eq!(diff.spent, vec![unconfirmed]);
    }

    #[test]
    fn test_apply_reaches_current_set() {
        let keep = utxo("a", 0, 10, 1);
        let gone = utxo("b", 1, 20, 1);
        let fresh = utxo("c", 0, 30, 0);

        let previous = vec![keep.clone(), gone];
        let current = vec![keep.clone(), fresh.clone()];
        let diff = reconcile(&previous, &current);

        let mut stored = previous.clone();
        diff.apply(&mut stored);
        assert_eq!(stored, vec![keep, fresh]);
    }
}
