use crate::error::{RecError, Result};
use serde::{Deserialize, Serialize};

/// One stored entry of the interaction matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub user: usize,
    pub item: usize,
    pub value: f32,
    pub weight: f32,
}

impl Interaction {
    pub fn is_positive(&self) -> bool {
        self.value > 0.0
    }
}

/// Users × items interaction matrix in CSR layout.
///
/// Row entries are sorted by item index and unique. Values carry the
/// interaction signal (presence, count or rating); anything `> 0` is a
/// positive. Optional sample weights are aligned with the stored entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionMatrix {
    n_users: usize,
    n_items: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<f32>,
    weights: Option<Vec<f32>>,
}

impl InteractionMatrix {
    /// Builds the matrix from `(user, item, value)` triplets. When the same
    /// pair appears more than once the last occurrence wins.
    pub fn from_triplets<I>(n_users: usize, n_items: usize, triplets: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, usize, f32)>,
    {
        let mut entries: Vec<(usize, usize, f32)> = Vec::new();
        for (user, item, value) in triplets {
            if user >= n_users || item >= n_items {
                return Err(RecError::dimension(format!(
                    "interaction ({}, {}) outside a {} x {} matrix",
                    user, item, n_users, n_items
                )));
            }
            if !value.is_finite() {
                return Err(RecError::InvalidInput(format!(
                    "interaction ({}, {}) has a non-finite value",
                    user, item
                )));
            }
            entries.push((user, item, value));
        }

        // Stable sort keeps insertion order among duplicates, so the last one
        // survives the dedup below.
        entries.sort_by_key(|&(user, item, _)| (user, item));
        let mut deduped: Vec<(usize, usize, f32)> = Vec::with_capacity(entries.len());
        for entry in entries {
            match deduped.last_mut() {
                Some(last) if last.0 == entry.0 && last.1 == entry.1 => *last = entry,
                _ => deduped.push(entry),
            }
        }

        let mut indptr = vec![0usize; n_users + 1];
        for &(user, _, _) in &deduped {
            indptr[user + 1] += 1;
        }
        for u in 0..n_users {
            indptr[u + 1] += indptr[u];
        }

        Ok(Self {
            n_users,
            n_items,
            indptr,
            indices: deduped.iter().map(|e| e.1).collect(),
            values: deduped.iter().map(|e| e.2).collect(),
            weights: None,
        })
    }

    /// Wraps raw CSR arrays, checking the structure without repairing it.
    pub fn from_csr(
        n_users: usize,
        n_items: usize,
        indptr: Vec<usize>,
        indices: Vec<usize>,
        values: Vec<f32>,
    ) -> Result<Self> {
        let matrix = Self {
            n_users,
            n_items,
            indptr,
            indices,
            values,
            weights: None,
        };
        matrix.validate()?;
        Ok(matrix)
    }

    pub fn with_sample_weights(mut self, weights: Vec<f32>) -> Result<Self> {
        if weights.len() != self.nnz() {
            return Err(RecError::dimension(format!(
                "{} sample weights for {} interactions",
                weights.len(),
                self.nnz()
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(RecError::InvalidInput(
                "sample weights must be finite and non-negative".to_string(),
            ));
        }
        self.weights = Some(weights);
        Ok(self)
    }

    pub fn sample_weights(&self) -> Option<&[f32]> {
        self.weights.as_deref()
    }

    pub fn validate(&self) -> Result<()> {
        check_indptr(&self.indptr, self.n_users, self.indices.len())?;
        if self.values.len() != self.indices.len() {
            return Err(RecError::InvalidInput(
                "values and indices differ in length".to_string(),
            ));
        }
        if let Some(weights) = &self.weights {
            if weights.len() != self.indices.len() {
                return Err(RecError::InvalidInput(format!(
                    "{} sample weights for {} interactions",
                    weights.len(),
                    self.indices.len()
                )));
            }
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(RecError::InvalidInput(
                    "sample weights must be finite and non-negative".to_string(),
                ));
            }
        }
        for user in 0..self.n_users {
            let (start, end) = (self.indptr[user], self.indptr[user + 1]);
            let row = &self.indices[start..end];
            if let Some(&item) = row.iter().find(|&&item| item >= self.n_items) {
                return Err(RecError::dimension(format!(
                    "item index {} for user {} exceeds item count {}",
                    item, user, self.n_items
                )));
            }
            if row.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(RecError::InvalidInput(format!(
                    "row {} has duplicate or unsorted item indices",
                    user
                )));
            }
        }
        if self.values.iter().any(|v| !v.is_finite()) {
            return Err(RecError::InvalidInput("non-finite interaction value".to_string()));
        }
        Ok(())
    }

    pub fn n_users(&self) -> usize {
        self.n_users
    }

    pub fn n_items(&self) -> usize {
        self.n_items
    }

    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn row(&self, user: usize) -> (&[usize], &[f32]) {
        let (start, end) = (self.indptr[user], self.indptr[user + 1]);
        (&self.indices[start..end], &self.values[start..end])
    }

    pub fn has_positive(&self, user: usize, item: usize) -> bool {
        let (items, values) = self.row(user);
        match items.binary_search(&item) {
            Ok(pos) => values[pos] > 0.0,
            Err(_) => false,
        }
    }

    pub fn positive_items(&self, user: usize) -> Vec<usize> {
        let (items, values) = self.row(user);
        items
            .iter()
            .zip(values)
            .filter(|(_, &value)| value > 0.0)
            .map(|(&item, _)| item)
            .collect()
    }

    pub fn get(&self, index: usize) -> Interaction {
        // indptr is sorted, so the owning row is the last start <= index
        let user = self.indptr.partition_point(|&start| start <= index) - 1;
        Interaction {
            user,
            item: self.indices[index],
            value: self.values[index],
            weight: self.weights.as_ref().map_or(1.0, |w| w[index]),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Interaction> + '_ {
        (0..self.n_users).flat_map(move |user| {
            (self.indptr[user]..self.indptr[user + 1]).map(move |idx| Interaction {
                user,
                item: self.indices[idx],
                value: self.values[idx],
                weight: self.weights.as_ref().map_or(1.0, |w| w[idx]),
            })
        })
    }
}

/// Active features of one entity: indices with their weights.
#[derive(Debug, Clone, Copy)]
pub struct FeatureRow<'a> {
    pub indices: &'a [usize],
    pub weights: &'a [f32],
}

impl<'a> FeatureRow<'a> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f32)> + 'a {
        self.indices.iter().copied().zip(self.weights.iter().copied())
    }
}

/// Entities × features matrix in CSR layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    n_rows: usize,
    n_features: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    weights: Vec<f32>,
}

impl FeatureMatrix {
    /// One reserved identity feature per entity, weight 1.
    pub fn identity(n: usize) -> Self {
        Self {
            n_rows: n,
            n_features: n,
            indptr: (0..=n).collect(),
            indices: (0..n).collect(),
            weights: vec![1.0; n],
        }
    }

    /// Builds a matrix from per-entity `(feature, weight)` lists. Indices
    /// are sorted and duplicate features keep their last weight.
    pub fn from_rows(n_features: usize, rows: Vec<Vec<(usize, f32)>>) -> Result<Self> {
        let mut indptr = Vec::with_capacity(rows.len() + 1);
        let mut indices = Vec::new();
        let mut weights = Vec::new();
        indptr.push(0);

        for (entity, mut row) in rows.into_iter().enumerate() {
            if let Some(&(feature, _)) = row.iter().find(|(f, _)| *f >= n_features) {
                return Err(RecError::dimension(format!(
                    "feature index {} of entity {} exceeds feature count {}",
                    feature, entity, n_features
                )));
            }
            if row.iter().any(|(_, w)| !w.is_finite()) {
                return Err(RecError::InvalidInput(format!(
                    "entity {} has a non-finite feature weight",
                    entity
                )));
            }

            row.sort_by_key(|&(feature, _)| feature);
            let mut deduped: Vec<(usize, f32)> = Vec::with_capacity(row.len());
            for entry in row {
                match deduped.last_mut() {
                    Some(last) if last.0 == entry.0 => *last = entry,
                    _ => deduped.push(entry),
                }
            }
            if deduped.is_empty() {
                return Err(RecError::InvalidInput(format!(
                    "entity {} has no active features",
                    entity
                )));
            }

            for (feature, weight) in deduped {
                indices.push(feature);
                weights.push(weight);
            }
            indptr.push(indices.len());
        }

        Ok(Self {
            n_rows: indptr.len() - 1,
            n_features,
            indptr,
            indices,
            weights,
        })
    }

    /// Prepends one identity feature per entity to `side`. Identity features
    /// occupy `0..n_rows`, side features are shifted past them.
    pub fn with_identity(side: &FeatureMatrix) -> Self {
        let n = side.n_rows;
        let mut indptr = Vec::with_capacity(n + 1);
        let mut indices = Vec::with_capacity(side.indices.len() + n);
        let mut weights = Vec::with_capacity(side.weights.len() + n);
        indptr.push(0);

        for entity in 0..n {
            indices.push(entity);
            weights.push(1.0);
            let row = side.row(entity);
            for (feature, weight) in row.iter() {
                indices.push(n + feature);
                weights.push(weight);
            }
            indptr.push(indices.len());
        }

        Self {
            n_rows: n,
            n_features: n + side.n_features,
            indptr,
            indices,
            weights,
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_indptr(&self.indptr, self.n_rows, self.indices.len())?;
        if self.weights.len() != self.indices.len() {
            return Err(RecError::InvalidInput(
                "feature weights and indices differ in length".to_string(),
            ));
        }
        for entity in 0..self.n_rows {
            let row = self.row(entity);
            if row.is_empty() {
                return Err(RecError::InvalidInput(format!(
                    "entity {} has no active features",
                    entity
                )));
            }
            if let Some(&feature) = row.indices.iter().find(|&&f| f >= self.n_features) {
                return Err(RecError::dimension(format!(
                    "feature index {} of entity {} exceeds feature count {}",
                    feature, entity, self.n_features
                )));
            }
            if row.indices.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(RecError::InvalidInput(format!(
                    "entity {} has duplicate or unsorted feature indices",
                    entity
                )));
            }
        }
        Ok(())
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn row(&self, entity: usize) -> FeatureRow<'_> {
        let (start, end) = (self.indptr[entity], self.indptr[entity + 1]);
        FeatureRow {
            indices: &self.indices[start..end],
            weights: &self.weights[start..end],
        }
    }
}

/// Row pointers must have `n_rows + 1` entries, start at zero, never
/// decrease and end at `nnz`. Checked before any row is sliced.
fn check_indptr(indptr: &[usize], n_rows: usize, nnz: usize) -> Result<()> {
    if indptr.len() != n_rows + 1 {
        return Err(RecError::InvalidInput(format!(
            "indptr has {} entries, expected {}",
            indptr.len(),
            n_rows + 1
        )));
    }
    if indptr.windows(2).any(|pair| pair[0] > pair[1]) {
        return Err(RecError::InvalidInput("indptr is not monotone".to_string()));
    }
    if indptr[0] != 0 || indptr[n_rows] != nnz {
        return Err(RecError::InvalidInput("indptr does not span indices".to_string()));
    }
    Ok(())
}
