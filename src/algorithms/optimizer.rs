use crate::algorithms::loss::{InstanceGradient, Workspace};
use crate::algorithms::store::{FactorTable, ParameterCells};
use crate::config::{ModelConfig, OptimizerKind, TrainingConfig};
use crate::error::{RecError, Result};
use crate::models::FeatureRow;

pub trait Optimizer: Send + Sync {
    /// Applies `gradient` to the scalar at `index` in place and returns the
    /// new parameter value.
    fn step(&self, cells: &ParameterCells<'_>, index: usize, gradient: f32) -> f32;
}

#[derive(Debug, Clone)]
pub struct AdaGrad {
    learning_rate: f32,
    epsilon: f32,
}

impl AdaGrad {
    pub fn new(learning_rate: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            epsilon,
        }
    }
}

impl Optimizer for AdaGrad {
    #[inline]
    fn step(&self, cells: &ParameterCells<'_>, index: usize, gradient: f32) -> f32 {
        let accum = cells.accum.load(index) + gradient * gradient;
        cells.accum.store(index, accum);

        let value =
            cells.values.load(index) - self.learning_rate * gradient / (accum + self.epsilon).sqrt();
        cells.values.store(index, value);
        value
    }
}

#[derive(Debug, Clone)]
pub struct Adadelta {
    rho: f32,
    epsilon: f32,
}

impl Adadelta {
    pub fn new(rho: f32, epsilon: f32) -> Self {
        Self { rho, epsilon }
    }
}

impl Optimizer for Adadelta {
    #[inline]
    fn step(&self, cells: &ParameterCells<'_>, index: usize, gradient: f32) -> f32 {
        let accum = self.rho * cells.accum.load(index) + (1.0 - self.rho) * gradient * gradient;
        cells.accum.store(index, accum);

        let prior = cells.delta.load(index);
        let update = gradient * (prior + self.epsilon).sqrt() / (accum + self.epsilon).sqrt();
        cells
            .delta
            .store(index, self.rho * prior + (1.0 - self.rho) * update * update);

        let value = cells.values.load(index) - update;
        cells.values.store(index, value);
        value
    }
}

/// Update rule chosen once per fit.
#[derive(Debug, Clone)]
pub enum AdaptiveOptimizer {
    AdaGrad(AdaGrad),
    Adadelta(Adadelta),
}

impl AdaptiveOptimizer {
    pub fn from_config(config: &TrainingConfig) -> Self {
        match config.optimizer {
            OptimizerKind::Adagrad => {
                AdaptiveOptimizer::AdaGrad(AdaGrad::new(config.learning_rate, config.epsilon))
            }
            OptimizerKind::Adadelta => {
                AdaptiveOptimizer::Adadelta(Adadelta::new(config.rho, config.epsilon))
            }
        }
    }
}

impl Optimizer for AdaptiveOptimizer {
    #[inline]
    fn step(&self, cells: &ParameterCells<'_>, index: usize, gradient: f32) -> f32 {
        match self {
            AdaptiveOptimizer::AdaGrad(rule) => rule.step(cells, index, gradient),
            AdaptiveOptimizer::Adadelta(rule) => rule.step(cells, index, gradient),
        }
    }
}

/// Clipping and regularization applied to every raw gradient component.
#[derive(Debug, Clone, Copy)]
pub struct UpdateRule {
    pub gradient_clip: f32,
    pub user_alpha: f32,
    pub item_alpha: f32,
}

impl UpdateRule {
    pub fn from_config(model: &ModelConfig, training: &TrainingConfig) -> Self {
        Self {
            gradient_clip: training.gradient_clip,
            user_alpha: model.user_alpha,
            item_alpha: model.item_alpha,
        }
    }
}

/// Parameters touched by one instance, in the order they are updated.
pub struct TouchedEntities<'a> {
    pub user: FeatureRow<'a>,
    pub positive: FeatureRow<'a>,
    pub negative: Option<FeatureRow<'a>>,
}

struct SideUpdate<'a, O: Optimizer + ?Sized> {
    optimizer: &'a O,
    table: &'a FactorTable,
    alpha: f32,
    clip: f32,
    epoch: usize,
}

impl<'a, O: Optimizer + ?Sized> SideUpdate<'a, O> {
    #[inline]
    fn apply(&self, cells: &ParameterCells<'_>, index: usize, raw: f32) -> Result<()> {
        let regularized = raw + self.alpha * cells.values.load(index);
        let gradient = regularized.clamp(-self.clip, self.clip);
        let value = self.optimizer.step(cells, index, gradient);
        if value.is_finite() {
            Ok(())
        } else {
            Err(RecError::NumericalDivergence {
                epoch: self.epoch,
                detail: format!("parameter became {} after gradient {}", value, raw),
            })
        }
    }

    /// Updates every active feature of one entity given
    /// `dL/d(representation) = coefficient * direction` and
    /// `dL/d(bias) = coefficient`.
    fn entity(&self, features: FeatureRow<'_>, direction: impl Fn(usize) -> f32, coefficient: f32) -> Result<()> {
        let dim = self.table.dim();
        let embeddings = self.table.embedding_cells();
        let biases = self.table.bias_cells();

        for (feature, weight) in features.iter() {
            let offset = feature * dim;
            for d in 0..dim {
                self.apply(&embeddings, offset + d, weight * direction(d))?;
            }
            self.apply(&biases, feature, weight * coefficient)?;
        }
        Ok(())
    }
}

/// Applies one instance gradient to the store. Representations in
/// `workspace` are the pre-update values the gradient was computed from.
pub fn apply_gradient<O: Optimizer + ?Sized>(
    optimizer: &O,
    users: &FactorTable,
    items: &FactorTable,
    touched: &TouchedEntities<'_>,
    gradient: &InstanceGradient,
    workspace: &Workspace,
    rule: &UpdateRule,
    epoch: usize,
) -> Result<()> {
    let user_side = SideUpdate {
        optimizer,
        table: users,
        alpha: rule.user_alpha,
        clip: rule.gradient_clip,
        epoch,
    };
    let item_side = SideUpdate {
        optimizer,
        table: items,
        alpha: rule.item_alpha,
        clip: rule.gradient_clip,
        epoch,
    };

    let d_pos = gradient.d_positive;
    let d_neg = gradient.d_negative;
    let has_negative = touched.negative.is_some();

    user_side.entity(
        touched.user,
        |d| {
            let mut g = d_pos * workspace.positive[d];
            if has_negative {
                g += d_neg * workspace.negative[d];
            }
            g
        },
        d_pos + if has_negative { d_neg } else { 0.0 },
    )?;

    item_side.entity(touched.positive, |d| d_pos * workspace.user[d], d_pos)?;

    if let Some(negative) = touched.negative {
        item_side.entity(negative, |d| d_neg * workspace.user[d], d_neg)?;
    }

    Ok(())
}
