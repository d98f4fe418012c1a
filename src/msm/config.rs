use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::optimization::optimization_tracker::TerminationCriterium;

use super::connectivity::ConnectivityMode;
use super::count_matrix::CountMode;
use super::estimation::{default_fixed_point_termination, DETAILED_BALANCE_TOLERANCE};

/// Parameters of a full estimation run, one section per pipeline stage.
///
/// Every section has a default, so a JSON file only needs the fields it changes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MsmConfig {
    pub counting: CountingConfig,
    pub connectivity: ConnectivityConfig,
    pub estimation: EstimationConfig,
    pub bayesian: BayesianConfig,
    pub spectral: SpectralConfig,
    pub pcca: PccaConfig,
    pub tpt: TptConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountingConfig {
    pub lag: usize,
    pub count_mode: CountMode,
    pub n_states: Option<usize>,
}

impl Default for CountingConfig {
    fn default() -> Self {
        Self { lag: 1, count_mode: CountMode::default(), n_states: None }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub mode: ConnectivityMode,
    pub accept_partial: bool, // Estimate on the largest component instead of failing
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationConfig {
    pub reversible: bool,
    pub detailed_balance_tolerance: f64,
    pub termination: TerminationCriterium,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            reversible: true,
            detailed_balance_tolerance: DETAILED_BALANCE_TOLERANCE,
            termination: default_fixed_point_termination(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BayesianConfig {
    pub n_samples: usize,
    pub n_steps: usize, // Sweeps between retained samples
    pub burn_in: usize,
    pub prior: f64,     // Pseudo-count added to every observed entry
    pub seed: Option<u64>,
    pub workers: Option<usize>,
    pub confidence: f64,
}

impl Default for BayesianConfig {
    fn default() -> Self {
        Self { n_samples: 100, n_steps: 10, burn_in: 50, prior: 0.0, seed: None, workers: None, confidence: 0.95 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectralConfig {
    pub n_eigenpairs: Option<usize>,
    pub constant_tolerance: f64,
    pub stationarity_tolerance: f64,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self { n_eigenpairs: None, constant_tolerance: 1e-12, stationarity_tolerance: 1e-8 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PccaConfig {
    pub n_sets: usize,
    pub min_spectral_gap: f64,
}

impl Default for PccaConfig {
    fn default() -> Self {
        Self { n_sets: 2, min_spectral_gap: 0.05 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TptConfig {
    pub fraction: f64,
}

impl Default for TptConfig {
    fn default() -> Self {
        Self { fraction: 0.99 }
    }
}

impl MsmConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: MsmConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.counting.lag < 1 {
            return Err(ConfigError::InvalidValue { field: "counting.lag", reason: "must be at least 1".into() });
        }
        if !(self.estimation.detailed_balance_tolerance > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "estimation.detailed_balance_tolerance",
                reason: "must be positive".into(),
            });
        }
        if self.bayesian.n_samples == 0 {
            return Err(ConfigError::InvalidValue { field: "bayesian.n_samples", reason: "must be at least 1".into() });
        }
        if self.bayesian.n_steps == 0 {
            return Err(ConfigError::InvalidValue { field: "bayesian.n_steps", reason: "must be at least 1".into() });
        }
        if !(self.bayesian.prior >= 0.0) {
            return Err(ConfigError::InvalidValue { field: "bayesian.prior", reason: "must be non-negative".into() });
        }
        if !(self.bayesian.confidence > 0.0 && self.bayesian.confidence < 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "bayesian.confidence",
                reason: format!("must lie in (0, 1), got {}", self.bayesian.confidence),
            });
        }
        if self.bayesian.workers == Some(0) {
            return Err(ConfigError::InvalidValue { field: "bayesian.workers", reason: "must be at least 1".into() });
        }
        if self.pcca.n_sets < 2 {
            return Err(ConfigError::InvalidValue { field: "pcca.n_sets", reason: "must be at least 2".into() });
        }
        if !(0.0..1.0).contains(&self.pcca.min_spectral_gap) {
            return Err(ConfigError::InvalidValue { field: "pcca.min_spectral_gap", reason: "must lie in [0, 1)".into() });
        }
        if !(self.tpt.fraction > 0.0 && self.tpt.fraction <= 1.0) {
            return Err(ConfigError::InvalidValue { field: "tpt.fraction", reason: "must lie in (0, 1]".into() });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("could not read or write configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}
