//! Weighted random selection
//!
//! Selects `target` distinct entries, each draw proportional to the entry
//! weights, without replacement. The stuck loop uses it with uniform
//! weights to sample a stuck segment; weighted use lets callers bias the
//! draw (e.g. toward larger directories).

use rand::Rng;

/// Select up to `target` distinct entries from `entries` by weight.
/// Zero-weight entries are only drawn once every positive weight is
/// exhausted. Returns all entries when `target >= entries.len()`.
pub fn random_select_weighted<T, R: Rng>(
    mut entries: Vec<(T, u128)>,
    target: usize,
    rng: &mut R,
) -> Vec<T> {
    if target >= entries.len() {
        return entries.into_iter().map(|(item, _)| item).collect();
    }

    let mut selected = Vec::with_capacity(target);
    while selected.len() < target && !entries.is_empty() {
        let total: u128 = entries.iter().map(|(_, w)| w).sum();
        let index = if total == 0 {
            rng.gen_range(0..entries.len())
        } else {
            let mut ticket = rng.gen_range(0..total);
            let mut chosen = entries.len() - 1;
            for (i, (_, weight)) in entries.iter().enumerate() {
                if ticket < *weight {
                    chosen = i;
                    break;
                }
                ticket -= *weight;
            }
            chosen
        };
        selected.push(entries.swap_remove(index).0);
    }
    selected
}

/// Select one entry uniformly at random.
pub fn random_select_one<T, R: Rng>(entries: Vec<T>, rng: &mut R) -> Option<T> {
    random_select_weighted(
        entries.into_iter().map(|item| (item, 1u128)).collect(),
        1,
        rng,
    )
    .into_iter()
    .next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn uniform_entries(n: usize) -> Vec<(usize, u128)> {
        (0..n).map(|i| (i, 1u128)).collect()
    }

    #[test]
    fn test_selection_sizes() {
        let cases = [(4, 4, 4), (100, 100, 100), (100, 4, 4), (4, 100, 4), (10_000, 21, 21)];
        let mut rng = rand::thread_rng();
        for (entry_size, target, expected) in cases {
            let selected = random_select_weighted(uniform_entries(entry_size), target, &mut rng);
            assert_eq!(selected.len(), expected);

            // no entry selected twice
            let distinct: HashSet<_> = selected.iter().collect();
            assert_eq!(distinct.len(), expected);
        }
    }

    #[test]
    fn test_heavy_weight_dominates() {
        // one entry weighted 1e18 against four weighted 1: the heavy entry
        // wins essentially always; over 200 rounds a miss is ~impossible
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut entries: Vec<(usize, u128)> = (0..5).map(|i| (i, 1u128)).collect();
            entries[3].1 = 1_000_000_000_000_000_000u128;
            let selected = random_select_weighted(entries, 1, &mut rng);
            assert_eq!(selected, vec![3]);
        }
    }

    #[test]
    fn test_zero_weight_entries_still_selectable() {
        let mut rng = rand::thread_rng();
        let entries: Vec<(usize, u128)> = (0..5).map(|i| (i, 0u128)).collect();
        let selected = random_select_weighted(entries, 3, &mut rng);
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_select_one() {
        let mut rng = rand::thread_rng();
        assert!(random_select_one(Vec::<u8>::new(), &mut rng).is_none());
        assert_eq!(random_select_one(vec![7u8], &mut rng), Some(7));
    }
}
