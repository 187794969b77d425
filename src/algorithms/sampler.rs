use crate::models::InteractionMatrix;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegativeDraw {
    pub item: usize,
    /// The attempt budget ran out and `item` may be one of the user's
    /// positives. It is still used as a negative.
    pub exhausted: bool,
}

/// Uniform negative sampler over the full item catalog.
#[derive(Debug, Clone, Copy)]
pub struct NegativeSampler<'a> {
    interactions: &'a InteractionMatrix,
    max_attempts: usize,
}

impl<'a> NegativeSampler<'a> {
    pub fn new(interactions: &'a InteractionMatrix, max_attempts: usize) -> Self {
        Self {
            interactions,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn n_items(&self) -> usize {
        self.interactions.n_items()
    }

    /// Draws an item the user has no positive interaction with, resampling
    /// on collision up to the attempt budget.
    pub fn draw<R: Rng>(&self, user: usize, rng: &mut R) -> NegativeDraw {
        let n_items = self.interactions.n_items();
        let mut item = rng.gen_range(0..n_items);
        for _ in 1..self.max_attempts {
            if !self.interactions.has_positive(user, item) {
                return NegativeDraw {
                    item,
                    exhausted: false,
                };
            }
            item = rng.gen_range(0..n_items);
        }

        NegativeDraw {
            item,
            exhausted: self.interactions.has_positive(user, item),
        }
    }

    /// Fills `out` with `k` independent draws; returns whether any of them
    /// exhausted its budget.
    pub fn draw_many<R: Rng>(&self, user: usize, k: usize, rng: &mut R, out: &mut Vec<usize>) -> bool {
        out.clear();
        let mut exhausted = false;
        for _ in 0..k {
            let draw = self.draw(user, rng);
            exhausted |= draw.exhausted;
            out.push(draw.item);
        }
        exhausted
    }
}

/// Picks the `k`-th highest scoring entry (1-based) of `scored`, reordering
/// it in place. Ties keep the lower item index first.
pub fn kth_order_statistic(scored: &mut [(f32, usize)], k: usize) -> Option<(f32, usize)> {
    if scored.is_empty() {
        return None;
    }
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    let position = k.clamp(1, scored.len()) - 1;
    Some(scored[position])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_draw_avoids_positives() {
        let interactions = InteractionMatrix::from_triplets(
            1,
            10,
            (0..9).map(|item| (0, item, 1.0)),
        )
        .unwrap();
        let sampler = NegativeSampler::new(&interactions, 1000);
        let mut rng = StdRng::seed_from_u64(5);

        for _ in 0..50 {
            let draw = sampler.draw(0, &mut rng);
            assert_eq!(draw.item, 9);
            assert!(!draw.exhausted);
        }
    }

    #[test]
    fn test_fully_dense_user_exhausts_without_failing() {
        let interactions =
            InteractionMatrix::from_triplets(1, 3, (0..3).map(|item| (0, item, 1.0))).unwrap();
        let sampler = NegativeSampler::new(&interactions, 4);
        let mut rng = StdRng::seed_from_u64(1);

        let draw = sampler.draw(0, &mut rng);
        assert!(draw.exhausted);
        assert!(draw.item < 3);
    }

    #[test]
    fn test_non_positive_entries_are_valid_negatives() {
        let interactions =
            InteractionMatrix::from_triplets(1, 2, vec![(0, 0, 1.0), (0, 1, -1.0)]).unwrap();
        let sampler = NegativeSampler::new(&interactions, 100);
        let mut rng = StdRng::seed_from_u64(9);
        assert_eq!(sampler.draw(0, &mut rng).item, 1);
    }

    #[test]
    fn test_draw_many_fills_k() {
        let interactions = InteractionMatrix::from_triplets(2, 20, vec![(0, 0, 1.0)]).unwrap();
        let sampler = NegativeSampler::new(&interactions, 10);
        let mut rng = StdRng::seed_from_u64(2);
        let mut out = vec![99];

        let exhausted = sampler.draw_many(0, 4, &mut rng, &mut out);
        assert_eq!(out.len(), 4);
        assert!(!out.contains(&0));
        assert!(!exhausted);
    }

    #[test]
    fn test_kth_order_statistic() {
        let mut scored = vec![(0.1, 3), (0.9, 1), (0.5, 2), (0.7, 0)];
        assert_eq!(kth_order_statistic(&mut scored, 1), Some((0.9, 1)));
        assert_eq!(kth_order_statistic(&mut scored, 3), Some((0.5, 2)));
        assert_eq!(kth_order_statistic(&mut scored, 10), Some((0.1, 3)));
        assert_eq!(kth_order_statistic(&mut [], 1), None);
    }
}
