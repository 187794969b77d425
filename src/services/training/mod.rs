use crate::algorithms::loss::{
    GradientContext, InstanceOutcome, LossFunction, SkipReason, Workspace,
};
use crate::algorithms::optimizer::{apply_gradient, AdaptiveOptimizer, TouchedEntities, UpdateRule};
use crate::algorithms::sampler::NegativeSampler;
use crate::algorithms::{HybridModel, ParameterStore, Scorer};
use crate::config::Config;
use crate::error::{RecError, Result};
use crate::models::{Interaction, TrainingData};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

const SHUFFLE_STREAM: u64 = 0x5348_5546_464c_4531;
const EPOCH_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FitState {
    NotStarted,
    Running { epoch: usize },
    Converged,
    Aborted,
}

/// Returned by an epoch observer to continue or stop training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochControl {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounts {
    pub not_positive: usize,
    pub zero_weight: usize,
    pub no_negative_candidates: usize,
}

impl SkipCounts {
    fn record(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::NotPositive => self.not_positive += 1,
            SkipReason::ZeroWeight => self.zero_weight += 1,
            SkipReason::NoNegativeCandidates => self.no_negative_candidates += 1,
        }
    }

    fn merge(&mut self, other: &SkipCounts) {
        self.not_positive += other.not_positive;
        self.zero_weight += other.zero_weight;
        self.no_negative_candidates += other.no_negative_candidates;
    }

    pub fn total(&self) -> usize {
        self.not_positive + self.zero_weight + self.no_negative_candidates
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    /// Mean instance loss over the instances that produced a gradient.
    pub mean_loss: f64,
    pub instances: usize,
    pub updates: usize,
    pub zero_gradients: usize,
    pub sampling_exhausted: usize,
    pub skipped: SkipCounts,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default)]
struct WorkerStats {
    loss_sum: f64,
    instances: usize,
    updates: usize,
    zero_gradients: usize,
    sampling_exhausted: usize,
    skipped: SkipCounts,
}

impl WorkerStats {
    fn merge(&mut self, other: &WorkerStats) {
        self.loss_sum += other.loss_sum;
        self.instances += other.instances;
        self.updates += other.updates;
        self.zero_gradients += other.zero_gradients;
        self.sampling_exhausted += other.sampling_exhausted;
        self.skipped.merge(&other.skipped);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    pub run_id: Uuid,
    pub state: FitState,
    pub epochs_completed: usize,
    pub epochs: Vec<EpochStats>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FitReport {
    pub fn final_loss(&self) -> Option<f64> {
        self.epochs.last().map(|stats| stats.mean_loss)
    }

    pub fn total_skipped(&self) -> usize {
        self.epochs.iter().map(|stats| stats.skipped.total()).sum()
    }
}

/// Cancels a running fit at the next epoch boundary. Every fit starts with
/// the flag cleared, so a request made while no fit runs is dropped.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Drives epochs over the interaction set with a fixed pool of workers
/// that update the shared parameter store without locks.
pub struct TrainingService {
    config: Config,
    pool: rayon::ThreadPool,
    abort: AbortHandle,
}

impl TrainingService {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.training.num_threads)
            .thread_name(|index| format!("hybridrec-worker-{}", index))
            .build()
            .map_err(|e| RecError::hyperparameter(format!("cannot build worker pool: {}", e)))?;

        Ok(Self {
            config,
            pool,
            abort: AbortHandle::default(),
        })
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn fit(&self, model: &mut HybridModel, data: &TrainingData) -> Result<FitReport> {
        self.fit_with_observer(model, data, |_, _| EpochControl::Continue)
    }

    /// Trains `model` from freshly initialized parameters. `observer` runs
    /// after every epoch with the epoch statistics and a scorer over the
    /// current parameters; returning [`EpochControl::Stop`] ends training.
    pub fn fit_with_observer<F>(
        &self,
        model: &mut HybridModel,
        data: &TrainingData,
        mut observer: F,
    ) -> Result<FitReport>
    where
        F: FnMut(&EpochStats, &Scorer<'_>) -> EpochControl,
    {
        data.validate()?;
        self.abort.reset();

        let run_id = Uuid::new_v4();
        let model_config = &self.config.model;
        let training_config = &self.config.training;
        let span = info_span!("fit", run_id = %run_id, loss = %model_config.loss);
        let _guard = span.enter();

        let started_at = Utc::now();
        let mut state = FitState::NotStarted;
        info!(
            "Starting fit: {} users, {} items, {} interactions, dim={}, optimizer={}, threads={}",
            data.interactions.n_users(),
            data.interactions.n_items(),
            data.interactions.nnz(),
            model_config.embedding_dim,
            training_config.optimizer,
            training_config.num_threads
        );

        let store = ParameterStore::initialize(
            data.user_features.n_features(),
            data.item_features.n_features(),
            model_config.embedding_dim,
            &model_config.initialization,
            training_config.optimizer,
            training_config.seed,
        );
        let loss = LossFunction::from_config(model_config);
        let optimizer = AdaptiveOptimizer::from_config(training_config);
        let rule = UpdateRule::from_config(model_config, training_config);
        let sampler = NegativeSampler::new(&data.interactions, model_config.max_sampling_attempts);

        let instances: Vec<Interaction> = data.interactions.iter().collect();
        let mut order: Vec<usize> = (0..instances.len()).collect();
        let slice_len = instances.len().div_ceil(training_config.num_threads).max(1);
        let mut epochs = Vec::with_capacity(training_config.epochs);

        for epoch in 0..training_config.epochs {
            if self.abort.is_aborted() {
                warn!("Fit aborted before epoch {}", epoch);
                state = FitState::Aborted;
                break;
            }
            state = FitState::Running { epoch };
            let epoch_start = Instant::now();

            if training_config.shuffle {
                let mut rng = StdRng::seed_from_u64(
                    training_config.seed ^ SHUFFLE_STREAM ^ (epoch as u64).wrapping_mul(EPOCH_MIX),
                );
                order.shuffle(&mut rng);
            }

            let ctx = GradientContext {
                store: &store,
                user_features: &data.user_features,
                item_features: &data.item_features,
                sampler,
                epoch,
            };

            let partials = self.pool.install(|| {
                order
                    .par_chunks(slice_len)
                    .enumerate()
                    .map(|(worker, slice)| {
                        let seed = training_config
                            .seed
                            .wrapping_add(worker as u64)
                            .wrapping_add((epoch as u64).wrapping_mul(EPOCH_MIX));
                        run_slice(&ctx, &loss, &optimizer, &rule, &instances, slice, seed)
                    })
                    .collect::<Result<Vec<WorkerStats>>>()
            });

            let partials = match partials {
                Ok(partials) => partials,
                Err(e) => {
                    error!("Fit failed during epoch {}: {}", epoch, e);
                    return Err(e);
                }
            };

            let mut totals = WorkerStats::default();
            for partial in &partials {
                totals.merge(partial);
            }

            let stats = EpochStats {
                epoch,
                mean_loss: if totals.instances > 0 {
                    totals.loss_sum / totals.instances as f64
                } else {
                    0.0
                },
                instances: totals.instances,
                updates: totals.updates,
                zero_gradients: totals.zero_gradients,
                sampling_exhausted: totals.sampling_exhausted,
                skipped: totals.skipped,
                duration_ms: epoch_start.elapsed().as_millis() as u64,
            };
            debug!(
                "Epoch {} done: loss={:.5}, updates={}, zero={}, skipped={}, exhausted={} ({} ms)",
                epoch,
                stats.mean_loss,
                stats.updates,
                stats.zero_gradients,
                stats.skipped.total(),
                stats.sampling_exhausted,
                stats.duration_ms
            );

            let control = {
                let scorer = Scorer::new(&store, &data.user_features, &data.item_features)?;
                observer(&stats, &scorer)
            };
            epochs.push(stats);

            if control == EpochControl::Stop {
                info!("Observer requested stop after epoch {}", epoch);
                state = FitState::Converged;
                break;
            }
        }

        if let FitState::Running { .. } = state {
            state = FitState::Converged;
        }

        let report = FitReport {
            run_id,
            state,
            epochs_completed: epochs.len(),
            epochs,
            started_at,
            finished_at: Utc::now(),
        };
        if report.total_skipped() > 0 {
            warn!("Skipped {} training instances", report.total_skipped());
        }
        info!(
            "Fit finished: state={:?}, epochs={}, final_loss={:?}",
            report.state,
            report.epochs_completed,
            report.final_loss()
        );

        // a fit that never completed an epoch leaves the model untouched
        if report.epochs_completed > 0 {
            model.install(store);
        }
        Ok(report)
    }
}

/// Processes one worker's slice in order.
fn run_slice(
    ctx: &GradientContext<'_>,
    loss: &LossFunction,
    optimizer: &AdaptiveOptimizer,
    rule: &UpdateRule,
    instances: &[Interaction],
    slice: &[usize],
    seed: u64,
) -> Result<WorkerStats> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut workspace = Workspace::new(ctx.store.dim());
    let mut stats = WorkerStats::default();

    for &index in slice {
        let interaction = &instances[index];
        let gradient = match loss.compute_gradient(ctx, interaction, &mut workspace, &mut rng)? {
            InstanceOutcome::Skipped(reason) => {
                stats.skipped.record(reason);
                continue;
            }
            InstanceOutcome::Gradient(gradient) => gradient,
        };

        stats.instances += 1;
        stats.loss_sum += gradient.loss as f64;
        if gradient.sampling_exhausted {
            stats.sampling_exhausted += 1;
        }
        if gradient.is_zero() {
            stats.zero_gradients += 1;
            continue;
        }

        let touched = TouchedEntities {
            user: ctx.user_features.row(gradient.user),
            positive: ctx.item_features.row(gradient.positive),
            negative: gradient.negative.map(|item| ctx.item_features.row(item)),
        };
        apply_gradient(
            optimizer,
            ctx.store.user(),
            ctx.store.item(),
            &touched,
            &gradient,
            &workspace,
            rule,
            ctx.epoch,
        )?;
        stats.updates += 1;
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LossKind;
    use crate::models::InteractionMatrix;

    fn small_data() -> TrainingData {
        let triplets: Vec<(usize, usize, f32)> = (0..6)
            .flat_map(|u| (0..3).map(move |k| (u, (u + k) % 8, 1.0)))
            .collect();
        TrainingData::new(InteractionMatrix::from_triplets(6, 8, triplets).unwrap())
    }

    fn config(loss: LossKind) -> Config {
        Config::default()
            .with_loss(loss)
            .with_embedding_dim(4)
            .with_epochs(3)
            .with_threads(1)
    }

    #[test]
    fn test_fit_runs_every_epoch_and_converges() {
        let data = small_data();
        for loss in [LossKind::Logistic, LossKind::Bpr, LossKind::Warp, LossKind::KosWarp] {
            let mut model = HybridModel::new(config(loss)).unwrap();
            let report = model.fit(&data).unwrap();

            assert_eq!(report.state, FitState::Converged);
            assert_eq!(report.epochs_completed, 3);
            assert!(model.is_fitted());
            assert!(model.store().unwrap().user().all_finite());
            assert_eq!(report.epochs[0].instances + report.epochs[0].skipped.total(), 18);
        }
    }

    #[test]
    fn test_observer_stop_ends_training() {
        let data = small_data();
        let service = TrainingService::new(config(LossKind::Bpr).with_epochs(10)).unwrap();
        let mut model = HybridModel::new(config(LossKind::Bpr)).unwrap();

        let report = service
            .fit_with_observer(&mut model, &data, |stats, _| {
                if stats.epoch == 1 {
                    EpochControl::Stop
                } else {
                    EpochControl::Continue
                }
            })
            .unwrap();

        assert_eq!(report.state, FitState::Converged);
        assert_eq!(report.epochs_completed, 2);
    }

    #[test]
    fn test_abort_between_epochs() {
        let data = small_data();
        let service = TrainingService::new(config(LossKind::Warp).with_epochs(10)).unwrap();
        let handle = service.abort_handle();
        let mut model = HybridModel::new(config(LossKind::Warp)).unwrap();

        let report = service
            .fit_with_observer(&mut model, &data, |stats, _| {
                if stats.epoch == 2 {
                    handle.abort();
                }
                EpochControl::Continue
            })
            .unwrap();

        assert_eq!(report.state, FitState::Aborted);
        assert_eq!(report.epochs_completed, 3);
        assert!(model.is_fitted());
    }

    #[test]
    fn test_service_is_reusable_after_abort() {
        let data = small_data();
        let service = TrainingService::new(config(LossKind::Bpr).with_epochs(4)).unwrap();
        let handle = service.abort_handle();

        let mut aborted = HybridModel::new(config(LossKind::Bpr)).unwrap();
        let report = service
            .fit_with_observer(&mut aborted, &data, |_, _| {
                handle.abort();
                EpochControl::Continue
            })
            .unwrap();
        assert_eq!(report.state, FitState::Aborted);
        assert_eq!(report.epochs_completed, 1);

        // a stale request between fits does not leak into the next one
        handle.abort();
        let mut model = HybridModel::new(config(LossKind::Bpr)).unwrap();
        let report = service.fit(&mut model, &data).unwrap();
        assert_eq!(report.state, FitState::Converged);
        assert_eq!(report.epochs_completed, 4);
        assert!(model.is_fitted());
        assert!(!handle.is_aborted());
    }

    #[test]
    fn test_ranking_losses_skip_non_positive_entries() {
        let interactions = InteractionMatrix::from_triplets(
            2,
            4,
            vec![(0, 0, 1.0), (0, 1, -1.0), (1, 2, 1.0), (1, 3, 0.0)],
        )
        .unwrap();
        let data = TrainingData::new(interactions);
        let mut model = HybridModel::new(config(LossKind::Bpr).with_epochs(1)).unwrap();

        let report = model.fit(&data).unwrap();
        assert_eq!(report.epochs[0].skipped.not_positive, 2);
        assert_eq!(report.epochs[0].instances, 2);
    }

    #[test]
    fn test_dimension_mismatch_rejected_before_training() {
        let data = small_data().with_user_features(crate::models::FeatureMatrix::identity(5));
        let mut model = HybridModel::new(config(LossKind::Bpr)).unwrap();
        assert!(matches!(
            model.fit(&data),
            Err(RecError::DimensionMismatch(_))
        ));
        assert!(!model.is_fitted());
    }
}
