//! Seeded synthetic data: planted low-rank interaction matrices and
//! train/test splits for evaluation and benchmarks.

use crate::error::{RecError, Result};
use crate::models::InteractionMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlantedDataset {
    pub interactions: InteractionMatrix,
    pub user_groups: Vec<usize>,
    pub item_groups: Vec<usize>,
}

/// Block-structured binary interactions of rank `rank`: user `u` belongs to
/// group `u % rank`, item `i` to group `i % rank`, and a pair interacts with
/// probability `p_in` inside a group and `p_out` across groups. Every user
/// gets at least one in-group positive.
pub fn planted_block_interactions(
    n_users: usize,
    n_items: usize,
    rank: usize,
    p_in: f64,
    p_out: f64,
    seed: u64,
) -> Result<PlantedDataset> {
    if rank == 0 || rank > n_items {
        return Err(RecError::InvalidInput(format!(
            "rank {} must lie in 1..={}",
            rank, n_items
        )));
    }
    for p in [p_in, p_out] {
        if !(0.0..=1.0).contains(&p) {
            return Err(RecError::InvalidInput(format!(
                "interaction probability {} outside [0, 1]",
                p
            )));
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let user_groups: Vec<usize> = (0..n_users).map(|u| u % rank).collect();
    let item_groups: Vec<usize> = (0..n_items).map(|i| i % rank).collect();
    let mut triplets = Vec::new();

    for (user, &group) in user_groups.iter().enumerate() {
        let mut in_group = 0usize;
        for (item, &item_group) in item_groups.iter().enumerate() {
            let p = if item_group == group { p_in } else { p_out };
            if rng.gen_bool(p) {
                triplets.push((user, item, 1.0));
                if item_group == group {
                    in_group += 1;
                }
            }
        }
        if in_group == 0 {
            let members = (n_items - group).div_ceil(rank);
            let item = group + rank * rng.gen_range(0..members);
            triplets.push((user, item, 1.0));
        }
    }

    Ok(PlantedDataset {
        interactions: InteractionMatrix::from_triplets(n_users, n_items, triplets)?,
        user_groups,
        item_groups,
    })
}

/// Moves each stored entry to the test matrix with probability
/// `test_fraction`. Sample weights follow their entries.
pub fn train_test_split(
    interactions: &InteractionMatrix,
    test_fraction: f64,
    seed: u64,
) -> Result<(InteractionMatrix, InteractionMatrix)> {
    if !(0.0..=1.0).contains(&test_fraction) {
        return Err(RecError::InvalidInput(format!(
            "test fraction {} outside [0, 1]",
            test_fraction
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();
    let mut train_weights = Vec::new();
    let mut test_weights = Vec::new();

    for entry in interactions.iter() {
        let triplet = (entry.user, entry.item, entry.value);
        if rng.gen_bool(test_fraction) {
            test.push(triplet);
            test_weights.push(entry.weight);
        } else {
            train.push(triplet);
            train_weights.push(entry.weight);
        }
    }

    let (n_users, n_items) = (interactions.n_users(), interactions.n_items());
    let mut train = InteractionMatrix::from_triplets(n_users, n_items, train)?;
    let mut test = InteractionMatrix::from_triplets(n_users, n_items, test)?;
    if interactions.sample_weights().is_some() {
        train = train.with_sample_weights(train_weights)?;
        test = test.with_sample_weights(test_weights)?;
    }
    Ok((train, test))
}
