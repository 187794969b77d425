use crate::error::{RecError, Result};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

pub mod sparse;

pub use sparse::{FeatureMatrix, FeatureRow, Interaction, InteractionMatrix};

/// Everything a fit consumes: interactions plus the user and item feature
/// matrices. Without side features each entity is encoded by its identity
/// feature alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingData {
    pub interactions: InteractionMatrix,
    pub user_features: FeatureMatrix,
    pub item_features: FeatureMatrix,
}

impl TrainingData {
    pub fn new(interactions: InteractionMatrix) -> Self {
        let user_features = FeatureMatrix::identity(interactions.n_users());
        let item_features = FeatureMatrix::identity(interactions.n_items());
        Self {
            interactions,
            user_features,
            item_features,
        }
    }

    pub fn with_user_features(mut self, features: FeatureMatrix) -> Self {
        self.user_features = features;
        self
    }

    pub fn with_item_features(mut self, features: FeatureMatrix) -> Self {
        self.item_features = features;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.interactions.validate()?;
        self.user_features.validate()?;
        self.item_features.validate()?;

        if self.user_features.n_rows() != self.interactions.n_users() {
            return Err(RecError::dimension(format!(
                "interactions have {} users but user features have {} rows",
                self.interactions.n_users(),
                self.user_features.n_rows()
            )));
        }
        if self.item_features.n_rows() != self.interactions.n_items() {
            return Err(RecError::dimension(format!(
                "interactions have {} items but item features have {} rows",
                self.interactions.n_items(),
                self.item_features.n_rows()
            )));
        }
        Ok(())
    }
}

/// Point-in-time copy of the fitted parameters, ready for an external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParameters {
    pub embedding_dim: usize,
    pub user_embeddings: Array2<f32>,
    pub user_biases: Array1<f32>,
    pub item_embeddings: Array2<f32>,
    pub item_biases: Array1<f32>,
    pub created_at: DateTime<Utc>,
}
