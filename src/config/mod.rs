use crate::algorithms::initializer::InitializationMethod;
use crate::error::{RecError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub embedding_dim: usize,
    pub loss: LossKind,
    /// Order statistic used by k-OS WARP.
    pub k: usize,
    /// Budget for WARP sampling rounds and for positive-collision resampling.
    pub max_sampling_attempts: usize,
    pub user_alpha: f32,
    pub item_alpha: f32,
    pub initialization: InitializationMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f32,
    pub optimizer: OptimizerKind,
    pub rho: f32,
    pub epsilon: f32,
    pub epochs: usize,
    pub num_threads: usize,
    pub gradient_clip: f32,
    pub seed: u64,
    pub shuffle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossKind {
    Logistic,
    Bpr,
    Warp,
    #[serde(rename = "k-os-warp", alias = "warp-kos")]
    KosWarp,
}

impl LossKind {
    pub fn is_pairwise(&self) -> bool {
        !matches!(self, LossKind::Logistic)
    }
}

impl FromStr for LossKind {
    type Err = RecError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "logistic" => Ok(LossKind::Logistic),
            "bpr" => Ok(LossKind::Bpr),
            "warp" => Ok(LossKind::Warp),
            "k-os-warp" | "warp-kos" | "kos-warp" => Ok(LossKind::KosWarp),
            other => Err(RecError::hyperparameter(format!(
                "unrecognized loss '{}' (expected logistic, bpr, warp or k-os-warp)",
                other
            ))),
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LossKind::Logistic => "logistic",
            LossKind::Bpr => "bpr",
            LossKind::Warp => "warp",
            LossKind::KosWarp => "k-os-warp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adagrad,
    Adadelta,
}

impl FromStr for OptimizerKind {
    type Err = RecError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adagrad" => Ok(OptimizerKind::Adagrad),
            "adadelta" => Ok(OptimizerKind::Adadelta),
            other => Err(RecError::hyperparameter(format!(
                "unrecognized optimizer '{}' (expected adagrad or adadelta)",
                other
            ))),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Adagrad => f.write_str("adagrad"),
            OptimizerKind::Adadelta => f.write_str("adadelta"),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 10,
            loss: LossKind::Logistic,
            k: 5,
            max_sampling_attempts: 10,
            user_alpha: 0.0,
            item_alpha: 0.0,
            initialization: InitializationMethod::ScaledUniform,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            optimizer: OptimizerKind::Adagrad,
            rho: 0.95,
            epsilon: 1e-6,
            epochs: 10,
            num_threads: num_cpus::get(),
            gradient_clip: 10.0,
            seed: 42,
            shuffle: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("HYBRIDREC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let model = &self.model;
        let training = &self.training;

        if model.embedding_dim == 0 {
            return Err(RecError::hyperparameter("embedding_dim must be > 0"));
        }
        if model.k == 0 {
            return Err(RecError::hyperparameter("k must be >= 1"));
        }
        if model.max_sampling_attempts == 0 {
            return Err(RecError::hyperparameter("max_sampling_attempts must be >= 1"));
        }
        if !(model.user_alpha >= 0.0 && model.user_alpha.is_finite())
            || !(model.item_alpha >= 0.0 && model.item_alpha.is_finite())
        {
            return Err(RecError::hyperparameter(
                "user_alpha and item_alpha must be finite and >= 0",
            ));
        }
        model.initialization.validate()?;

        if training.epochs == 0 {
            return Err(RecError::hyperparameter("epochs must be >= 1"));
        }
        if !(training.learning_rate > 0.0 && training.learning_rate.is_finite()) {
            return Err(RecError::hyperparameter("learning_rate must be finite and > 0"));
        }
        if training.num_threads == 0 {
            return Err(RecError::hyperparameter("num_threads must be >= 1"));
        }
        if !(training.gradient_clip > 0.0) {
            return Err(RecError::hyperparameter("gradient_clip must be > 0"));
        }
        if !(training.rho > 0.0 && training.rho < 1.0) {
            return Err(RecError::hyperparameter("rho must lie in (0, 1)"));
        }
        if !(training.epsilon > 0.0 && training.epsilon.is_finite()) {
            return Err(RecError::hyperparameter("epsilon must be finite and > 0"));
        }

        Ok(())
    }

    pub fn with_loss(mut self, loss: LossKind) -> Self {
        self.model.loss = loss;
        self
    }

    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.model.embedding_dim = dim;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.training.optimizer = optimizer;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.training.learning_rate = learning_rate;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.training.epochs = epochs;
        self
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.training.num_threads = num_threads;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.training.seed = seed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_hyperparameters_rejected() {
        let cases = vec![
            Config::default().with_embedding_dim(0),
            Config::default().with_epochs(0),
            Config::default().with_threads(0),
            Config::default().with_learning_rate(0.0),
            Config::default().with_learning_rate(f32::NAN),
        ];

        for config in cases {
            assert!(matches!(
                config.validate(),
                Err(RecError::InvalidHyperparameter(_))
            ));
        }

        let mut config = Config::default();
        config.training.gradient_clip = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.model.k = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_loss_and_optimizer() {
        assert_eq!("bpr".parse::<LossKind>().unwrap(), LossKind::Bpr);
        assert_eq!("WARP".parse::<LossKind>().unwrap(), LossKind::Warp);
        assert_eq!("warp-kos".parse::<LossKind>().unwrap(), LossKind::KosWarp);
        assert_eq!("k-os-warp".parse::<LossKind>().unwrap(), LossKind::KosWarp);
        assert!(matches!(
            "hinge".parse::<LossKind>(),
            Err(RecError::InvalidHyperparameter(_))
        ));

        assert_eq!(
            "adadelta".parse::<OptimizerKind>().unwrap(),
            OptimizerKind::Adadelta
        );
        assert!(matches!(
            "adam".parse::<OptimizerKind>(),
            Err(RecError::InvalidHyperparameter(_))
        ));
    }

    #[test]
    fn test_loss_display_round_trips_through_parse() {
        for loss in [LossKind::Logistic, LossKind::Bpr, LossKind::Warp, LossKind::KosWarp] {
            assert_eq!(loss.to_string().parse::<LossKind>().unwrap(), loss);
        }
    }

    #[test]
    fn test_deserialize_from_json() {
        let json = r#"{
            "model": { "embedding_dim": 8, "loss": "k-os-warp", "k": 3 },
            "training": { "optimizer": "adadelta", "epochs": 4, "num_threads": 2 }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.model.embedding_dim, 8);
        assert_eq!(config.model.loss, LossKind::KosWarp);
        assert_eq!(config.model.k, 3);
        assert_eq!(config.model.max_sampling_attempts, 10);
        assert_eq!(config.training.optimizer, OptimizerKind::Adadelta);
        assert_eq!(config.training.epochs, 4);
        assert!(config.validate().is_ok());
    }
}
