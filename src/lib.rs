pub mod algorithms;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use algorithms::{FeatureEncoder, HybridModel, Recommender, Scorer};
pub use config::{Config, LossKind, OptimizerKind};
pub use error::{RecError, Result};
pub use models::*;
pub use services::training::{
    AbortHandle, EpochControl, EpochStats, FitReport, FitState, TrainingService,
};

/// Installs a global fmt subscriber filtered by `RUST_LOG`. Later calls are
/// no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
