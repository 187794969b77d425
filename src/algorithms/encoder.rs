use crate::error::{RecError, Result};
use crate::models::{FeatureMatrix, InteractionMatrix};
use std::collections::HashMap;

/// Maps raw entity identifiers and named side features to feature indices.
///
/// With identity features enabled (the default) entity `n` owns column `n`
/// and side features are numbered after the last entity, so a model
/// without side features degenerates to plain matrix factorization.
#[derive(Debug, Clone)]
pub struct FeatureEncoder {
    entities: HashMap<String, usize>,
    features: HashMap<String, usize>,
    assignments: Vec<Vec<(usize, f32)>>,
    identity: bool,
    normalize: bool,
}

impl Default for FeatureEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureEncoder {
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
            features: HashMap::new(),
            assignments: Vec::new(),
            identity: true,
            normalize: false,
        }
    }

    /// Every entity must then carry at least one side feature.
    pub fn without_identity(mut self) -> Self {
        self.identity = false;
        self
    }

    /// Scale each entity's weights to sum to one.
    pub fn normalized(mut self) -> Self {
        self.normalize = true;
        self
    }

    pub fn add_entity(&mut self, id: &str) -> usize {
        if let Some(&index) = self.entities.get(id) {
            return index;
        }
        let index = self.assignments.len();
        self.entities.insert(id.to_string(), index);
        self.assignments.push(Vec::new());
        index
    }

    pub fn add_feature(&mut self, entity: &str, feature: &str, weight: f32) -> Result<()> {
        let entity_index = *self.entities.get(entity).ok_or_else(|| {
            RecError::InvalidInput(format!("feature '{}' for unknown entity '{}'", feature, entity))
        })?;
        if !weight.is_finite() {
            return Err(RecError::InvalidInput(format!(
                "feature '{}' of '{}' has a non-finite weight",
                feature, entity
            )));
        }

        let next = self.features.len();
        let feature_id = *self.features.entry(feature.to_string()).or_insert(next);
        let row = &mut self.assignments[entity_index];
        match row.iter_mut().find(|(f, _)| *f == feature_id) {
            Some(slot) => slot.1 = weight,
            None => row.push((feature_id, weight)),
        }
        Ok(())
    }

    pub fn entity_index(&self, id: &str) -> Option<usize> {
        self.entities.get(id).copied()
    }

    /// Column of a named side feature in the built matrix.
    pub fn feature_index(&self, feature: &str) -> Option<usize> {
        self.features.get(feature).map(|&f| self.offset() + f)
    }

    pub fn n_entities(&self) -> usize {
        self.assignments.len()
    }

    pub fn n_features(&self) -> usize {
        self.offset() + self.features.len()
    }

    fn offset(&self) -> usize {
        if self.identity {
            self.assignments.len()
        } else {
            0
        }
    }

    pub fn build(&self) -> Result<FeatureMatrix> {
        let offset = self.offset();
        let rows = self
            .assignments
            .iter()
            .enumerate()
            .map(|(entity, side)| {
                let mut row: Vec<(usize, f32)> = Vec::with_capacity(side.len() + 1);
                if self.identity {
                    row.push((entity, 1.0));
                }
                row.extend(side.iter().map(|&(f, w)| (offset + f, w)));

                if self.normalize {
                    let total: f32 = row.iter().map(|(_, w)| w.abs()).sum();
                    if total > 0.0 {
                        row.iter_mut().for_each(|(_, w)| *w /= total);
                    }
                }
                row
            })
            .collect();

        FeatureMatrix::from_rows(self.n_features(), rows)
    }

    /// Builds an interaction matrix from identifier triplets.
    pub fn encode_interactions<'a, I>(
        users: &FeatureEncoder,
        items: &FeatureEncoder,
        triplets: I,
    ) -> Result<InteractionMatrix>
    where
        I: IntoIterator<Item = (&'a str, &'a str, f32)>,
    {
        let mut encoded = Vec::new();
        for (user, item, value) in triplets {
            let u = users
                .entity_index(user)
                .ok_or_else(|| RecError::InvalidInput(format!("unknown user '{}'", user)))?;
            let i = items
                .entity_index(item)
                .ok_or_else(|| RecError::InvalidInput(format!("unknown item '{}'", item)))?;
            encoded.push((u, i, value));
        }
        InteractionMatrix::from_triplets(users.n_entities(), items.n_entities(), encoded)
    }
}
