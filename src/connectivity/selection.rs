use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// Randomized order in which connections are tried. Seeded for reproducible runs.
pub struct SelectionPolicy {
    rng: StdRng,
}

impl SelectionPolicy {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self { rng }
    }

    pub fn shuffled<T>(&mut self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        let mut items: Vec<_> = items.into_iter().collect();
        items.shuffle(&mut self.rng);
        items
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn same_seed_same_order() {
        let mut a = SelectionPolicy::new(Some(7));
        let mut b = SelectionPolicy::new(Some(7));

        for _ in 0..5 {
            assert_eq!(a.shuffled(0..16), b.shuffled(0..16));
        }
    }

    #[test]
    fn every_item_is_offered_and_first_pick_varies() {
        let mut policy = SelectionPolicy::new(Some(1));
        let mut first_picks = HashSet::new();

        for _ in 0..200 {
            let order = policy.shuffled(0..4);
            assert_eq!(order.iter().collect::<HashSet<_>>().len(), 4);
            first_picks.insert(order[0]);
        }

        assert_eq!(first_picks.len(), 4);
    }
}
