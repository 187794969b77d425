use crate::algorithms::loss::{GradientContext, InstanceOutcome, LossFunction, Workspace};
use crate::algorithms::sampler::NegativeSampler;
use crate::algorithms::store::{FactorTable, ParameterStore};
use crate::algorithms::Recommender;
use crate::config::ModelConfig;
use crate::error::{RecError, Result};
use crate::models::{FeatureMatrix, InteractionMatrix};
use crate::utils::{dot, sort_by_score_desc};
use nalgebra::DVector;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::HashSet;

/// Read-only scoring view over fitted parameters and the feature matrices
/// that encode users and items.
#[derive(Clone, Copy)]
pub struct Scorer<'a> {
    store: &'a ParameterStore,
    user_features: &'a FeatureMatrix,
    item_features: &'a FeatureMatrix,
}

impl<'a> Scorer<'a> {
    pub fn new(
        store: &'a ParameterStore,
        user_features: &'a FeatureMatrix,
        item_features: &'a FeatureMatrix,
    ) -> Result<Self> {
        if user_features.n_features() != store.user().n_features() {
            return Err(RecError::dimension(format!(
                "user features declare {} columns, model has {}",
                user_features.n_features(),
                store.user().n_features()
            )));
        }
        if item_features.n_features() != store.item().n_features() {
            return Err(RecError::dimension(format!(
                "item features declare {} columns, model has {}",
                item_features.n_features(),
                store.item().n_features()
            )));
        }
        user_features.validate()?;
        item_features.validate()?;

        Ok(Self {
            store,
            user_features,
            item_features,
        })
    }

    pub fn n_users(&self) -> usize {
        self.user_features.n_rows()
    }

    pub fn n_items(&self) -> usize {
        self.item_features.n_rows()
    }

    fn check_user(&self, user: usize) -> Result<()> {
        if user >= self.n_users() {
            return Err(RecError::UnknownEntity {
                kind: "user",
                index: user,
                size: self.n_users(),
            });
        }
        Ok(())
    }

    fn check_item(&self, item: usize) -> Result<()> {
        if item >= self.n_items() {
            return Err(RecError::UnknownEntity {
                kind: "item",
                index: item,
                size: self.n_items(),
            });
        }
        Ok(())
    }

    fn representation(
        table: &FactorTable,
        features: &FeatureMatrix,
        entity: usize,
    ) -> (DVector<f32>, f32) {
        let mut vector = DVector::zeros(table.dim());
        let bias = table.representation(features.row(entity), vector.as_mut_slice());
        (vector, bias)
    }

    pub fn user_representation(&self, user: usize) -> Result<(DVector<f32>, f32)> {
        self.check_user(user)?;
        Ok(Self::representation(self.store.user(), self.user_features, user))
    }

    pub fn item_representation(&self, item: usize) -> Result<(DVector<f32>, f32)> {
        self.check_item(item)?;
        Ok(Self::representation(self.store.item(), self.item_features, item))
    }

    /// Scores `(users[n], items[n])` pairs in parallel.
    pub fn predict(&self, users: &[usize], items: &[usize]) -> Result<Vec<f32>> {
        if users.len() != items.len() {
            return Err(RecError::dimension(format!(
                "{} users but {} items to predict",
                users.len(),
                items.len()
            )));
        }
        users
            .par_iter()
            .zip(items.par_iter())
            .map(|(&user, &item)| self.score(user, item))
            .collect()
    }

    /// Best `k` catalog items for `user`, skipping `exclude`.
    pub fn top_k(&self, user: usize, k: usize, exclude: &[usize]) -> Result<Vec<(usize, f32)>> {
        let (user_vector, user_bias) = self.user_representation(user)?;
        let table = self.store.item();
        let mut buffer = vec![0.0; table.dim()];
        let excluded: HashSet<usize> = exclude.iter().copied().collect();

        let mut scored: Vec<(usize, f32)> = (0..self.n_items())
            .filter(|item| !excluded.contains(item))
            .map(|item| {
                let item_bias = table.representation(self.item_features.row(item), &mut buffer);
                (item, dot(user_vector.as_slice(), &buffer) + user_bias + item_bias)
            })
            .collect();

        sort_by_score_desc(&mut scored);
        scored.truncate(k);
        Ok(scored)
    }

    /// Biases and embeddings of every user, expressed through their features.
    pub fn user_representations(&self) -> (Array1<f32>, Array2<f32>) {
        Self::all_representations(self.store.user(), self.user_features)
    }

    pub fn item_representations(&self) -> (Array1<f32>, Array2<f32>) {
        Self::all_representations(self.store.item(), self.item_features)
    }

    fn all_representations(table: &FactorTable, features: &FeatureMatrix) -> (Array1<f32>, Array2<f32>) {
        let n = features.n_rows();
        let dim = table.dim();
        let mut biases = Array1::zeros(n);
        let mut embeddings = Array2::zeros((n, dim));
        let mut buffer = vec![0.0; dim];

        for entity in 0..n {
            biases[entity] = table.representation(features.row(entity), &mut buffer);
            for (d, &value) in buffer.iter().enumerate() {
                embeddings[[entity, d]] = value;
            }
        }
        (biases, embeddings)
    }

    /// Mean loss of `sample` under the configured loss, with negatives
    /// drawn against `known` positives from a fixed seed. Parameters are
    /// not modified.
    pub fn mean_loss(
        &self,
        config: &ModelConfig,
        known: &InteractionMatrix,
        sample: &InteractionMatrix,
        seed: u64,
    ) -> Result<f64> {
        if known.n_items() != self.n_items() || sample.n_items() != self.n_items() {
            return Err(RecError::dimension("loss sample item count differs from the model"));
        }
        if known.n_users() != self.n_users() || sample.n_users() != self.n_users() {
            return Err(RecError::dimension("loss sample user count differs from the model"));
        }

        let loss = LossFunction::from_config(config);
        let ctx = GradientContext {
            store: self.store,
            user_features: self.user_features,
            item_features: self.item_features,
            sampler: NegativeSampler::new(known, config.max_sampling_attempts),
            epoch: 0,
        };
        let mut workspace = Workspace::new(self.store.dim());
        let mut rng = StdRng::seed_from_u64(seed);

        let mut total = 0.0f64;
        let mut count = 0usize;
        for interaction in sample.iter() {
            if let InstanceOutcome::Gradient(gradient) =
                loss.compute_gradient(&ctx, &interaction, &mut workspace, &mut rng)?
            {
                total += gradient.loss as f64;
                count += 1;
            }
        }

        Ok(if count > 0 { total / count as f64 } else { 0.0 })
    }
}

impl<'a> Recommender for Scorer<'a> {
    fn score(&self, user: usize, item: usize) -> Result<f32> {
        let (user_vector, user_bias) = self.user_representation(user)?;
        let (item_vector, item_bias) = self.item_representation(item)?;
        Ok(user_vector.dot(&item_vector) + user_bias + item_bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::initializer::InitializationMethod;
    use crate::config::OptimizerKind;

    fn fixture() -> (ParameterStore, FeatureMatrix, FeatureMatrix) {
        let store = ParameterStore::initialize(
            2,
            3,
            2,
            &InitializationMethod::ScaledUniform,
            OptimizerKind::Adagrad,
            0,
        );
        store.user().set_embedding(0, &[1.0, 0.0]);
        store.user().set_bias(0, 0.5);
        store.item().set_embedding(0, &[0.0, 1.0]);
        store.item().set_embedding(1, &[2.0, 0.0]);
        store.item().set_embedding(2, &[1.0, 0.0]);
        store.item().set_bias(2, 0.25);
        (store, FeatureMatrix::identity(2), FeatureMatrix::identity(3))
    }

    #[test]
    fn test_score_is_dot_plus_biases() {
        let (store, users, items) = fixture();
        let scorer = Scorer::new(&store, &users, &items).unwrap();

        assert!((scorer.score(0, 1).unwrap() - 2.5).abs() < 1e-6);
        assert!((scorer.score(0, 2).unwrap() - 1.75).abs() < 1e-6);
        assert!((scorer.score(0, 0).unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_rank_and_top_k_agree() {
        let (store, users, items) = fixture();
        let scorer = Scorer::new(&store, &users, &items).unwrap();

        let ranked: Vec<usize> = scorer
            .rank(0, &[0, 1, 2])
            .unwrap()
            .into_iter()
            .map(|(item, _)| item)
            .collect();
        assert_eq!(ranked, vec![1, 2, 0]);

        let top: Vec<usize> = scorer
            .top_k(0, 2, &[1])
            .unwrap()
            .into_iter()
            .map(|(item, _)| item)
            .collect();
        assert_eq!(top, vec![2, 0]);
    }

    #[test]
    fn test_predict_matches_score() {
        let (store, users, items) = fixture();
        let scorer = Scorer::new(&store, &users, &items).unwrap();

        let predictions = scorer.predict(&[0, 1, 0], &[2, 1, 0]).unwrap();
        assert_eq!(predictions[0], scorer.score(0, 2).unwrap());
        assert_eq!(predictions[1], scorer.score(1, 1).unwrap());
        assert!(scorer.predict(&[0], &[0, 1]).is_err());
    }

    #[test]
    fn test_unknown_entities_rejected() {
        let (store, users, items) = fixture();
        let scorer = Scorer::new(&store, &users, &items).unwrap();
        assert!(matches!(
            scorer.score(5, 0),
            Err(RecError::UnknownEntity { kind: "user", .. })
        ));
        assert!(matches!(
            scorer.score(0, 3),
            Err(RecError::UnknownEntity { kind: "item", .. })
        ));
    }

    #[test]
    fn test_feature_width_must_match_store() {
        let (store, users, _) = fixture();
        let wide = FeatureMatrix::identity(4);
        assert!(matches!(
            Scorer::new(&store, &users, &wide),
            Err(RecError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_representations_shapes() {
        let (store, users, items) = fixture();
        let scorer = Scorer::new(&store, &users, &items).unwrap();
        let (biases, embeddings) = scorer.item_representations();
        assert_eq!(embeddings.shape(), &[3, 2]);
        assert_eq!(biases[2], 0.25);
        assert_eq!(embeddings[[1, 0]], 2.0);
    }

    #[test]
    fn test_user_representations_match_single_lookup() {
        let (store, users, items) = fixture();
        let scorer = Scorer::new(&store, &users, &items).unwrap();
        let (biases, embeddings) = scorer.user_representations();
        assert_eq!(embeddings.shape(), &[2, 2]);
        assert_eq!(biases[0], 0.5);

        for user in 0..2 {
            let (vector, bias) = scorer.user_representation(user).unwrap();
            assert_eq!(biases[user], bias);
            for d in 0..2 {
                assert_eq!(embeddings[[user, d]], vector[d]);
            }
        }
    }

    #[test]
    fn test_mean_loss_rejects_mismatched_known_users() {
        let (store, users, items) = fixture();
        let scorer = Scorer::new(&store, &users, &items).unwrap();
        let config = ModelConfig {
            loss: crate::config::LossKind::Bpr,
            ..ModelConfig::default()
        };
        let sample = InteractionMatrix::from_triplets(2, 3, vec![(1, 0, 1.0)]).unwrap();
        let known = InteractionMatrix::from_triplets(1, 3, vec![(0, 0, 1.0)]).unwrap();

        assert!(matches!(
            scorer.mean_loss(&config, &known, &sample, 0),
            Err(RecError::DimensionMismatch(_))
        ));
        assert!(scorer.mean_loss(&config, &sample, &sample, 0).unwrap().is_finite());
    }
}
