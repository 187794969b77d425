//! Per-instance loss and analytic gradients for every supported loss.
//!
//! For a score `s = dot(u, i) + b_u + b_i` the engine only reports the
//! scalar derivatives `dL/ds` for the positive and (when present) the
//! negative item. The optimizer expands them into per-parameter gradients
//! through the chain rule, using the representations cached in the
//! [`Workspace`].

use crate::algorithms::sampler::{kth_order_statistic, NegativeSampler};
use crate::algorithms::store::ParameterStore;
use crate::config::{LossKind, ModelConfig};
use crate::error::{RecError, Result};
use crate::models::{FeatureMatrix, Interaction};
use crate::utils::{dot, sigmoid, softplus};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Required gap between the positive and a negative score before WARP
/// stops treating the negative as a violation.
pub const WARP_MARGIN: f32 = 1.0;

/// Rank weight for a WARP violation found after `attempts` draws.
///
/// `attempts` approximates `n_items / rank`, so the estimated rank is
/// `(n_items - 1) / attempts`; the weight grows logarithmically with it and
/// stays strictly positive for any violation.
pub fn warp_rank_weight(n_items: usize, attempts: usize) -> f32 {
    let estimated_rank = (n_items.saturating_sub(1) / attempts.max(1)) as f32;
    (1.0 + estimated_rank).ln()
}

/// Scratch buffers owned by one worker; reused across instances.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub user: Vec<f32>,
    pub positive: Vec<f32>,
    pub negative: Vec<f32>,
    pub candidate: Vec<f32>,
    candidates: Vec<usize>,
    scored: Vec<(f32, usize)>,
}

impl Workspace {
    pub fn new(dim: usize) -> Self {
        Self {
            user: vec![0.0; dim],
            positive: vec![0.0; dim],
            negative: vec![0.0; dim],
            candidate: vec![0.0; dim],
            candidates: Vec::new(),
            scored: Vec::new(),
        }
    }
}

/// Read-only view the engine needs for one instance.
#[derive(Clone, Copy)]
pub struct GradientContext<'a> {
    pub store: &'a ParameterStore,
    pub user_features: &'a FeatureMatrix,
    pub item_features: &'a FeatureMatrix,
    pub sampler: NegativeSampler<'a>,
    pub epoch: usize,
}

impl<'a> GradientContext<'a> {
    fn diverged(&self, what: &str, value: f32) -> RecError {
        RecError::NumericalDivergence {
            epoch: self.epoch,
            detail: format!("{} score is {}", what, value),
        }
    }

    fn item_score(&self, item: usize, user: &[f32], user_bias: f32, out: &mut [f32]) -> f32 {
        let bias = self
            .store
            .item()
            .representation(self.item_features.row(item), out);
        dot(user, out) + user_bias + bias
    }
}

/// Result of the engine for one training instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceGradient {
    pub loss: f32,
    pub user: usize,
    pub positive: usize,
    pub negative: Option<usize>,
    /// `dL/ds` for the positive item.
    pub d_positive: f32,
    /// `dL/ds` for the negative item; zero without a negative.
    pub d_negative: f32,
    pub sampling_exhausted: bool,
}

impl InstanceGradient {
    fn zero(interaction: &Interaction, sampling_exhausted: bool) -> Self {
        Self {
            loss: 0.0,
            user: interaction.user,
            positive: interaction.item,
            negative: None,
            d_positive: 0.0,
            d_negative: 0.0,
            sampling_exhausted,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.d_positive == 0.0 && self.d_negative == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Non-positive entry under a ranking loss.
    NotPositive,
    ZeroWeight,
    /// Single-item catalog: nothing to rank against.
    NoNegativeCandidates,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceOutcome {
    Gradient(InstanceGradient),
    Skipped(SkipReason),
}

/// Loss selected once per fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossFunction {
    Logistic,
    Bpr,
    Warp { max_attempts: usize },
    KosWarp { k: usize, max_attempts: usize },
}

impl LossFunction {
    pub fn from_config(config: &ModelConfig) -> Self {
        match config.loss {
            LossKind::Logistic => LossFunction::Logistic,
            LossKind::Bpr => LossFunction::Bpr,
            LossKind::Warp => LossFunction::Warp {
                max_attempts: config.max_sampling_attempts,
            },
            LossKind::KosWarp => LossFunction::KosWarp {
                k: config.k,
                max_attempts: config.max_sampling_attempts,
            },
        }
    }

    pub fn kind(&self) -> LossKind {
        match self {
            LossFunction::Logistic => LossKind::Logistic,
            LossFunction::Bpr => LossKind::Bpr,
            LossFunction::Warp { .. } => LossKind::Warp,
            LossFunction::KosWarp { .. } => LossKind::KosWarp,
        }
    }

    /// Computes loss and score derivatives for one interaction. Leaves the
    /// user, positive and (if any) negative representations in `workspace`.
    pub fn compute_gradient<R: Rng>(
        &self,
        ctx: &GradientContext<'_>,
        interaction: &Interaction,
        workspace: &mut Workspace,
        rng: &mut R,
    ) -> Result<InstanceOutcome> {
        if interaction.weight == 0.0 {
            return Ok(InstanceOutcome::Skipped(SkipReason::ZeroWeight));
        }
        if self.kind().is_pairwise() {
            if !interaction.is_positive() {
                return Ok(InstanceOutcome::Skipped(SkipReason::NotPositive));
            }
            if ctx.sampler.n_items() < 2 {
                return Ok(InstanceOutcome::Skipped(SkipReason::NoNegativeCandidates));
            }
        }

        let user_bias = ctx
            .store
            .user()
            .representation(ctx.user_features.row(interaction.user), &mut workspace.user);
        let positive_score = ctx.item_score(
            interaction.item,
            &workspace.user,
            user_bias,
            &mut workspace.positive,
        );
        if !positive_score.is_finite() {
            return Err(ctx.diverged("positive", positive_score));
        }

        let gradient = match *self {
            LossFunction::Logistic => logistic(interaction, positive_score),
            LossFunction::Bpr => {
                let draw = ctx.sampler.draw(interaction.user, rng);
                let negative_score = ctx.item_score(
                    draw.item,
                    &workspace.user,
                    user_bias,
                    &mut workspace.negative,
                );
                if !negative_score.is_finite() {
                    return Err(ctx.diverged("negative", negative_score));
                }
                pairwise(interaction, draw.item, positive_score, negative_score, 1.0, draw.exhausted)
            }
            LossFunction::Warp { max_attempts } => {
                let mut exhausted = false;
                let mut violation = None;
                for attempt in 1..=max_attempts {
                    let draw = ctx.sampler.draw(interaction.user, rng);
                    exhausted |= draw.exhausted;
                    let negative_score = ctx.item_score(
                        draw.item,
                        &workspace.user,
                        user_bias,
                        &mut workspace.negative,
                    );
                    if !negative_score.is_finite() {
                        return Err(ctx.diverged("negative", negative_score));
                    }
                    if negative_score > positive_score - WARP_MARGIN {
                        violation = Some((draw.item, negative_score, attempt));
                        break;
                    }
                }
                warp_gradient(ctx, interaction, positive_score, violation, exhausted)
            }
            LossFunction::KosWarp { k, max_attempts } => {
                let mut exhausted = false;
                let mut violation = None;
                for attempt in 1..=max_attempts {
                    exhausted |= ctx.sampler.draw_many(
                        interaction.user,
                        k,
                        rng,
                        &mut workspace.candidates,
                    );
                    workspace.scored.clear();
                    for &item in &workspace.candidates {
                        let score =
                            ctx.item_score(item, &workspace.user, user_bias, &mut workspace.candidate);
                        if !score.is_finite() {
                            return Err(ctx.diverged("negative", score));
                        }
                        workspace.scored.push((score, item));
                    }
                    let Some((negative_score, item)) = kth_order_statistic(&mut workspace.scored, k)
                    else {
                        break;
                    };
                    if negative_score > positive_score - WARP_MARGIN {
                        ctx.item_score(item, &workspace.user, user_bias, &mut workspace.negative);
                        violation = Some((item, negative_score, attempt));
                        break;
                    }
                }
                warp_gradient(ctx, interaction, positive_score, violation, exhausted)
            }
        };

        Ok(InstanceOutcome::Gradient(gradient))
    }
}

fn logistic(interaction: &Interaction, score: f32) -> InstanceGradient {
    let label = if interaction.is_positive() { 1.0 } else { 0.0 };
    let weight = interaction.weight;
    // -[y ln σ(s) + (1 - y) ln(1 - σ(s))] = softplus(s) - y s
    let loss = softplus(score) - label * score;

    InstanceGradient {
        loss: weight * loss,
        user: interaction.user,
        positive: interaction.item,
        negative: None,
        d_positive: weight * (sigmoid(score) - label),
        d_negative: 0.0,
        sampling_exhausted: false,
    }
}

fn pairwise(
    interaction: &Interaction,
    negative: usize,
    positive_score: f32,
    negative_score: f32,
    rank_weight: f32,
    sampling_exhausted: bool,
) -> InstanceGradient {
    let weight = interaction.weight * rank_weight;
    let margin = positive_score - negative_score;
    // L = -ln σ(margin), dL/dmargin = -σ(-margin)
    let slope = sigmoid(-margin);

    InstanceGradient {
        loss: weight * softplus(-margin),
        user: interaction.user,
        positive: interaction.item,
        negative: Some(negative),
        d_positive: -weight * slope,
        d_negative: weight * slope,
        sampling_exhausted,
    }
}

fn warp_gradient(
    ctx: &GradientContext<'_>,
    interaction: &Interaction,
    positive_score: f32,
    violation: Option<(usize, f32, usize)>,
    exhausted: bool,
) -> InstanceGradient {
    match violation {
        Some((item, negative_score, attempts)) => {
            let rank_weight = warp_rank_weight(ctx.sampler.n_items(), attempts);
            pairwise(interaction, item, positive_score, negative_score, rank_weight, exhausted)
        }
        None => InstanceGradient::zero(interaction, exhausted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::initializer::InitializationMethod;
    use crate::config::OptimizerKind;
    use crate::models::InteractionMatrix;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixture {
        store: ParameterStore,
        users: FeatureMatrix,
        items: FeatureMatrix,
        interactions: InteractionMatrix,
    }

    impl Fixture {
        fn new(n_users: usize, n_items: usize, dim: usize) -> Self {
            let interactions = InteractionMatrix::from_triplets(
                n_users,
                n_items,
                (0..n_users).map(|u| (u, u % n_items, 1.0)),
            )
            .unwrap();
            Self {
                store: ParameterStore::initialize(
                    n_users,
                    n_items,
                    dim,
                    &InitializationMethod::ScaledUniform,
                    OptimizerKind::Adagrad,
                    1,
                ),
                users: FeatureMatrix::identity(n_users),
                items: FeatureMatrix::identity(n_items),
                interactions,
            }
        }

        fn ctx(&self, max_attempts: usize) -> GradientContext<'_> {
            GradientContext {
                store: &self.store,
                user_features: &self.users,
                item_features: &self.items,
                sampler: NegativeSampler::new(&self.interactions, max_attempts),
                epoch: 0,
            }
        }
    }

    fn positive(user: usize, item: usize) -> Interaction {
        Interaction {
            user,
            item,
            value: 1.0,
            weight: 1.0,
        }
    }

    fn gradient(outcome: InstanceOutcome) -> InstanceGradient {
        match outcome {
            InstanceOutcome::Gradient(g) => g,
            InstanceOutcome::Skipped(reason) => panic!("unexpected skip: {:?}", reason),
        }
    }

    #[test]
    fn test_warp_rank_weight_is_monotonic() {
        assert!(warp_rank_weight(1000, 1) > warp_rank_weight(1000, 10));
        assert!(warp_rank_weight(1000, 10) > warp_rank_weight(100, 10));
        assert!(warp_rank_weight(50, 49) > 0.0);
        assert!((warp_rank_weight(11, 1) - 11f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_logistic_gradient() {
        let fixture = Fixture::new(2, 3, 2);
        fixture.store.user().set_embedding(0, &[1.0, 0.0]);
        fixture.store.item().set_embedding(0, &[2.0, 5.0]);
        let ctx = fixture.ctx(10);
        let mut ws = Workspace::new(2);
        let mut rng = StdRng::seed_from_u64(0);

        let g = gradient(
            LossFunction::Logistic
                .compute_gradient(&ctx, &positive(0, 0), &mut ws, &mut rng)
                .unwrap(),
        );
        assert!((g.d_positive - (sigmoid(2.0) - 1.0)).abs() < 1e-6);
        assert!((g.loss - softplus(-2.0)).abs() < 1e-6);
        assert!(g.negative.is_none());

        let negative = Interaction {
            value: -1.0,
            ..positive(0, 0)
        };
        let g = gradient(
            LossFunction::Logistic
                .compute_gradient(&ctx, &negative, &mut ws, &mut rng)
                .unwrap(),
        );
        assert!((g.d_positive - sigmoid(2.0)).abs() < 1e-6);
    }

    #[test]
    fn test_bpr_gradient_signs() {
        let fixture = Fixture::new(1, 2, 2);
        fixture.store.user().set_embedding(0, &[1.0, 1.0]);
        fixture.store.item().set_embedding(0, &[0.1, 0.0]);
        fixture.store.item().set_embedding(1, &[0.3, 0.2]);
        let ctx = fixture.ctx(64);
        let mut ws = Workspace::new(2);
        let mut rng = StdRng::seed_from_u64(0);

        let g = gradient(
            LossFunction::Bpr
                .compute_gradient(&ctx, &positive(0, 0), &mut ws, &mut rng)
                .unwrap(),
        );
        assert_eq!(g.negative, Some(1));
        assert!(g.d_positive < 0.0);
        assert_eq!(g.d_negative, -g.d_positive);
        // margin = 0.1 - 0.5
        assert!((g.d_negative - sigmoid(0.4)).abs() < 1e-6);
        assert!((g.loss - softplus(0.4)).abs() < 1e-6);
    }

    #[test]
    fn test_warp_without_violation_is_zero() {
        let fixture = Fixture::new(1, 20, 2);
        fixture.store.user().set_embedding(0, &[1.0, 0.0]);
        fixture.store.item().set_embedding(0, &[10.0, 0.0]);
        for item in 1..20 {
            fixture.store.item().set_embedding(item, &[-1.0, 0.0]);
        }
        let ctx = fixture.ctx(10);
        let mut ws = Workspace::new(2);
        let mut rng = StdRng::seed_from_u64(4);

        for loss in [
            LossFunction::Warp { max_attempts: 10 },
            LossFunction::KosWarp {
                k: 3,
                max_attempts: 10,
            },
        ] {
            let g = gradient(
                loss.compute_gradient(&ctx, &positive(0, 0), &mut ws, &mut rng)
                    .unwrap(),
            );
            assert!(g.is_zero());
            assert_eq!(g.loss, 0.0);
            assert_eq!(g.negative, None);
        }
    }

    #[test]
    fn test_warp_violation_is_rank_weighted_bpr() {
        let fixture = Fixture::new(1, 11, 1);
        fixture.store.user().set_embedding(0, &[1.0]);
        fixture.store.item().set_embedding(0, &[0.0]);
        for item in 1..11 {
            fixture.store.item().set_embedding(item, &[0.5]);
        }
        let ctx = fixture.ctx(10);
        let mut ws = Workspace::new(1);
        let mut rng = StdRng::seed_from_u64(8);

        let g = gradient(
            LossFunction::Warp { max_attempts: 10 }
                .compute_gradient(&ctx, &positive(0, 0), &mut ws, &mut rng)
                .unwrap(),
        );
        // every negative violates on the first draw
        let weight = warp_rank_weight(11, 1);
        assert!(g.negative.is_some());
        assert!((g.d_negative - weight * sigmoid(0.5)).abs() < 1e-5);
        assert!((g.d_positive + weight * sigmoid(0.5)).abs() < 1e-5);
        assert_eq!(ws.negative, vec![0.5]);
    }

    #[test]
    fn test_kos_warp_selects_kth_candidate() {
        let fixture = Fixture::new(1, 4, 1);
        fixture.store.user().set_embedding(0, &[1.0]);
        fixture.store.item().set_embedding(0, &[0.0]);
        fixture.store.item().set_embedding(1, &[5.0]);
        fixture.store.item().set_embedding(2, &[5.0]);
        fixture.store.item().set_embedding(3, &[5.0]);
        let ctx = fixture.ctx(10);
        let mut ws = Workspace::new(1);
        let mut rng = StdRng::seed_from_u64(3);

        let g = gradient(
            LossFunction::KosWarp {
                k: 2,
                max_attempts: 5,
            }
            .compute_gradient(&ctx, &positive(0, 0), &mut ws, &mut rng)
            .unwrap(),
        );
        assert!(g.negative.is_some());
        assert_ne!(g.negative, Some(0));
        assert_eq!(ws.negative, vec![5.0]);
    }

    #[test]
    fn test_skips_are_reported() {
        let fixture = Fixture::new(2, 1, 2);
        let ctx = fixture.ctx(10);
        let mut ws = Workspace::new(2);
        let mut rng = StdRng::seed_from_u64(0);

        let outcome = LossFunction::Bpr
            .compute_gradient(&ctx, &positive(0, 0), &mut ws, &mut rng)
            .unwrap();
        assert_eq!(
            outcome,
            InstanceOutcome::Skipped(SkipReason::NoNegativeCandidates)
        );

        let not_positive = Interaction {
            value: 0.0,
            ..positive(0, 0)
        };
        let outcome = LossFunction::Warp { max_attempts: 3 }
            .compute_gradient(&ctx, &not_positive, &mut ws, &mut rng)
            .unwrap();
        assert_eq!(outcome, InstanceOutcome::Skipped(SkipReason::NotPositive));

        let zero_weight = Interaction {
            weight: 0.0,
            ..positive(0, 0)
        };
        let outcome = LossFunction::Logistic
            .compute_gradient(&ctx, &zero_weight, &mut ws, &mut rng)
            .unwrap();
        assert_eq!(outcome, InstanceOutcome::Skipped(SkipReason::ZeroWeight));
    }

    #[test]
    fn test_non_finite_score_is_divergence() {
        let fixture = Fixture::new(1, 2, 1);
        fixture.store.user().set_embedding(0, &[f32::MAX]);
        fixture.store.item().set_embedding(0, &[f32::MAX]);
        let ctx = fixture.ctx(10);
        let mut ws = Workspace::new(1);
        let mut rng = StdRng::seed_from_u64(0);

        let result =
            LossFunction::Logistic.compute_gradient(&ctx, &positive(0, 0), &mut ws, &mut rng);
        assert!(matches!(result, Err(RecError::NumericalDivergence { .. })));
    }
}
