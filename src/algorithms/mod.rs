pub mod encoder;
pub mod initializer;
pub mod loss;
pub mod optimizer;
pub mod sampler;
pub mod scorer;
pub mod store;

pub use encoder::FeatureEncoder;
pub use loss::{InstanceGradient, LossFunction};
pub use scorer::Scorer;
pub use store::ParameterStore;

use crate::config::Config;
use crate::error::{RecError, Result};
use crate::models::{InteractionMatrix, ModelParameters, TrainingData};
use crate::services::training::{FitReport, TrainingService};
use crate::utils::sort_by_score_desc;

pub trait Recommender {
    fn score(&self, user: usize, item: usize) -> Result<f32>;

    /// Orders `candidates` by descending score; equal scores keep their
    /// candidate order.
    fn rank(&self, user: usize, candidates: &[usize]) -> Result<Vec<(usize, f32)>> {
        let mut scored = candidates
            .iter()
            .map(|&item| Ok((item, self.score(user, item)?)))
            .collect::<Result<Vec<_>>>()?;
        sort_by_score_desc(&mut scored);
        Ok(scored)
    }
}

/// Hybrid matrix factorization model: users and items are represented by
/// the sum of the embeddings of their features.
#[derive(Debug, Clone)]
pub struct HybridModel {
    config: Config,
    store: Option<ParameterStore>,
}

impl HybridModel {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Trains from scratch, discarding any previous parameters.
    pub fn fit(&mut self, data: &TrainingData) -> Result<FitReport> {
        TrainingService::new(self.config.clone())?.fit(self, data)
    }

    pub fn is_fitted(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Result<&ParameterStore> {
        self.store.as_ref().ok_or(RecError::NotFitted)
    }

    pub(crate) fn install(&mut self, store: ParameterStore) {
        self.store = Some(store);
    }

    pub fn scorer<'a>(&'a self, data: &'a TrainingData) -> Result<Scorer<'a>> {
        Scorer::new(self.store()?, &data.user_features, &data.item_features)
    }

    pub fn parameters(&self) -> Result<ModelParameters> {
        Ok(self.store()?.snapshot())
    }

    /// Mean loss over `sample` with the configured loss kind; negatives avoid
    /// the training positives in `data`.
    pub fn evaluate_loss(
        &self,
        data: &TrainingData,
        sample: &InteractionMatrix,
        seed: u64,
    ) -> Result<f64> {
        self.scorer(data)?
            .mean_loss(&self.config.model, &data.interactions, sample, seed)
    }
}
