use crate::algorithms::initializer::InitializationMethod;
use crate::config::OptimizerKind;
use crate::models::{FeatureRow, ModelParameters};
use chrono::Utc;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Relaxed-consistency `f32` array shared by every training worker.
///
/// Races are acceptable, not incidental. Workers read and update the same
/// cells concurrently (Hogwild) with independent relaxed loads and stores,
/// so an update racing with another one on the same cell may be lost.
pub struct RelaxedArray {
    cells: Box<[AtomicU32]>,
}

impl RelaxedArray {
    pub fn from_vec(values: Vec<f32>) -> Self {
        Self {
            cells: values.into_iter().map(|v| AtomicU32::new(v.to_bits())).collect(),
        }
    }

    pub fn zeros(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| AtomicU32::new(0.0f32.to_bits())).collect(),
        }
    }

    #[inline]
    pub fn load(&self, index: usize) -> f32 {
        f32::from_bits(self.cells[index].load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, index: usize, value: f32) {
        self.cells[index].store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        (0..self.len()).map(|i| self.load(i)).collect()
    }
}

impl Clone for RelaxedArray {
    fn clone(&self) -> Self {
        Self::from_vec(self.to_vec())
    }
}

impl fmt::Debug for RelaxedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaxedArray").field("len", &self.len()).finish()
    }
}

/// A parameter array together with its optimizer state, index-aligned.
/// `delta` is empty unless the optimizer is Adadelta.
#[derive(Clone, Copy)]
pub struct ParameterCells<'a> {
    pub values: &'a RelaxedArray,
    pub accum: &'a RelaxedArray,
    pub delta: &'a RelaxedArray,
}

/// Embeddings, biases and accumulators for one side (users or items).
#[derive(Debug, Clone)]
pub struct FactorTable {
    n_features: usize,
    dim: usize,
    embeddings: RelaxedArray,
    biases: RelaxedArray,
    embedding_accum: RelaxedArray,
    bias_accum: RelaxedArray,
    embedding_delta: RelaxedArray,
    bias_delta: RelaxedArray,
}

impl FactorTable {
    fn new(
        n_features: usize,
        dim: usize,
        init: &InitializationMethod,
        optimizer: OptimizerKind,
        rng: &mut StdRng,
    ) -> Self {
        let size = n_features * dim;
        let delta_len = |len: usize| match optimizer {
            OptimizerKind::Adagrad => 0,
            OptimizerKind::Adadelta => len,
        };

        Self {
            n_features,
            dim,
            embeddings: RelaxedArray::from_vec(init.initialize(rng, n_features, dim)),
            biases: RelaxedArray::zeros(n_features),
            embedding_accum: RelaxedArray::zeros(size),
            bias_accum: RelaxedArray::zeros(n_features),
            embedding_delta: RelaxedArray::zeros(delta_len(size)),
            bias_delta: RelaxedArray::zeros(delta_len(n_features)),
        }
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Writes the weighted sum of the active embedding rows into `out` and
    /// returns the weighted bias sum.
    pub fn representation(&self, features: FeatureRow<'_>, out: &mut [f32]) -> f32 {
        debug_assert_eq!(out.len(), self.dim);
        out.iter_mut().for_each(|v| *v = 0.0);

        let mut bias = 0.0;
        for (feature, weight) in features.iter() {
            let offset = feature * self.dim;
            for (d, slot) in out.iter_mut().enumerate() {
                *slot += weight * self.embeddings.load(offset + d);
            }
            bias += weight * self.biases.load(feature);
        }
        bias
    }

    pub fn embedding(&self, feature: usize) -> Vec<f32> {
        let offset = feature * self.dim;
        (0..self.dim).map(|d| self.embeddings.load(offset + d)).collect()
    }

    pub fn set_embedding(&self, feature: usize, values: &[f32]) {
        let offset = feature * self.dim;
        for (d, &v) in values.iter().enumerate().take(self.dim) {
            self.embeddings.store(offset + d, v);
        }
    }

    pub fn bias(&self, feature: usize) -> f32 {
        self.biases.load(feature)
    }

    pub fn set_bias(&self, feature: usize, value: f32) {
        self.biases.store(feature, value);
    }

    pub fn embedding_cells(&self) -> ParameterCells<'_> {
        ParameterCells {
            values: &self.embeddings,
            accum: &self.embedding_accum,
            delta: &self.embedding_delta,
        }
    }

    pub fn bias_cells(&self) -> ParameterCells<'_> {
        ParameterCells {
            values: &self.biases,
            accum: &self.bias_accum,
            delta: &self.bias_delta,
        }
    }

    pub fn embeddings_array(&self) -> Array2<f32> {
        Array2::from_shape_vec((self.n_features, self.dim), self.embeddings.to_vec())
            .unwrap_or_else(|_| Array2::zeros((self.n_features, self.dim)))
    }

    pub fn biases_array(&self) -> Array1<f32> {
        Array1::from_vec(self.biases.to_vec())
    }

    pub fn all_finite(&self) -> bool {
        (0..self.embeddings.len()).all(|i| self.embeddings.load(i).is_finite())
            && (0..self.biases.len()).all(|i| self.biases.load(i).is_finite())
    }
}

/// Owns every trainable array of the model. Allocated once per fit and
/// mutated in place by the training workers.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    dim: usize,
    user: FactorTable,
    item: FactorTable,
}

impl ParameterStore {
    pub fn initialize(
        n_user_features: usize,
        n_item_features: usize,
        dim: usize,
        init: &InitializationMethod,
        optimizer: OptimizerKind,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let user = FactorTable::new(n_user_features, dim, init, optimizer, &mut rng);
        let item = FactorTable::new(n_item_features, dim, init, optimizer, &mut rng);
        Self { dim, user, item }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn user(&self) -> &FactorTable {
        &self.user
    }

    pub fn item(&self) -> &FactorTable {
        &self.item
    }

    pub fn snapshot(&self) -> ModelParameters {
        ModelParameters {
            embedding_dim: self.dim,
            user_embeddings: self.user.embeddings_array(),
            user_biases: self.user.biases_array(),
            item_embeddings: self.item.embeddings_array(),
            item_biases: self.item.biases_array(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeatureMatrix;

    fn make_store(optimizer: OptimizerKind) -> ParameterStore {
        ParameterStore::initialize(3, 4, 2, &InitializationMethod::ScaledUniform, optimizer, 11)
    }

    #[test]
    fn test_initialize_shapes_and_zero_state() {
        let store = make_store(OptimizerKind::Adagrad);
        let params = store.snapshot();

        assert_eq!(params.user_embeddings.shape(), &[3, 2]);
        assert_eq!(params.item_embeddings.shape(), &[4, 2]);
        assert!(params.user_biases.iter().all(|&b| b == 0.0));
        assert!(params.item_embeddings.iter().any(|&w| w != 0.0));
        assert!(store.user().embedding_cells().delta.is_empty());
        assert!((0..6).all(|i| store.user().embedding_cells().accum.load(i) == 0.0));

        let adadelta = make_store(OptimizerKind::Adadelta);
        assert_eq!(adadelta.item().embedding_cells().delta.len(), 8);
        assert_eq!(adadelta.item().bias_cells().delta.len(), 4);
    }

    #[test]
    fn test_representation_sums_weighted_rows() {
        let store = make_store(OptimizerKind::Adagrad);
        let users = store.user();
        users.set_embedding(0, &[1.0, 2.0]);
        users.set_embedding(2, &[0.5, -1.0]);
        users.set_bias(0, 0.25);
        users.set_bias(2, 1.0);

        let features = FeatureMatrix::from_rows(3, vec![vec![(0, 1.0), (2, 2.0)]]).unwrap();
        let mut out = vec![9.0; 2];
        let bias = users.representation(features.row(0), &mut out);

        assert_eq!(out, vec![2.0, 0.0]);
        assert_eq!(bias, 2.25);
    }

    #[test]
    fn test_same_seed_same_initialization() {
        let a = make_store(OptimizerKind::Adagrad).snapshot();
        let b = make_store(OptimizerKind::Adagrad).snapshot();
        assert_eq!(a.user_embeddings, b.user_embeddings);
        assert_eq!(a.item_embeddings, b.item_embeddings);
    }

    #[test]
    fn test_relaxed_array_round_trip() {
        let array = RelaxedArray::zeros(3);
        array.store(1, -2.5);
        assert_eq!(array.to_vec(), vec![0.0, -2.5, 0.0]);
        assert_eq!(array.clone().load(1), -2.5);
    }
}
