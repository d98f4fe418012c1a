use rayon::ThreadPoolBuildError;
use thiserror::Error;

use super::bayesian::SamplingError;
use super::config::ConfigError;
use super::connectivity::ConnectivityError;
use super::count_matrix::CountError;
use super::estimation::EstimationError;
use super::pcca::PccaError;
use super::persistence::StoreError;
use super::spectral::SpectralError;
use super::tpt::TptError;
use super::transition_matrix::MatrixValidationError;
use super::SimulationError;

pub type Result<T> = std::result::Result<T, MsmError>;

#[derive(Debug, Error)]
pub enum MsmError {
    #[error(transparent)]
    Count(#[from] CountError),
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
    #[error(transparent)]
    InvalidMatrix(#[from] MatrixValidationError),
    #[error(transparent)]
    Estimation(#[from] EstimationError),
    #[error(transparent)]
    Sampling(#[from] SamplingError),
    #[error(transparent)]
    Spectral(#[from] SpectralError),
    #[error(transparent)]
    Pcca(#[from] PccaError),
    #[error(transparent)]
    Tpt(#[from] TptError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error("could not build worker pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
    #[error("state {state} is not part of the active set")]
    StateNotActive { state: usize },
    #[error("invalid `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },
    #[error("stored model is inconsistent: {reason}")]
    InconsistentRecord { reason: String },
}

impl MsmError {
    // Failures that still carry a usable result the caller may accept explicitly
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MsmError::Pcca(PccaError::InsufficientSpectralGap { .. })
                | MsmError::Connectivity(ConnectivityError::PartialConnectivity { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        let partial = MsmError::from(ConnectivityError::PartialConnectivity {
            active_states: 2,
            total_states: 3,
            state_fraction: 2.0 / 3.0,
            count_fraction: 0.9,
        });
        assert!(partial.is_recoverable());

        let lag = MsmError::from(CountError::InvalidLag { lag: 0, longest_trajectory: None });
        assert!(!lag.is_recoverable());

        let singular = MsmError::from(TptError::SingularSystem { system: "forward committor" });
        assert!(!singular.is_recoverable());
    }

    #[test]
    fn test_messages_pass_through() {
        let error = MsmError::from(EstimationError::NoCounts);
        assert_eq!(error.to_string(), "count matrix has no counts");
    }
}
