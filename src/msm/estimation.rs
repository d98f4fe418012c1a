use nalgebra::DMatrix;
use thiserror::Error;

use crate::optimization::optimization_tracker::{OptimizationTracker, TerminationCriterium};

use super::config::EstimationConfig;
use super::connectivity::{is_irreducible, ConnectivityMode};
use super::count_matrix::CountMatrix;
use super::transition_matrix::{MatrixValidationError, StationaryDistribution, TransitionMatrix};

pub const DETAILED_BALANCE_TOLERANCE: f64 = 1e-10;

/// Maximum likelihood estimate of a transition matrix.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub transition_matrix: TransitionMatrix,
    pub stationary: Option<StationaryDistribution>, // Known in closed form for reversible estimates
    pub iterations: u32,
    pub log_likelihood: f64,
}

/// Maximum likelihood transition matrix estimator.
///
/// The non-reversible estimate is plain row normalization of the counts. The
/// reversible estimate runs the symmetric fixed-point iteration
///
/// ```text
/// x_ij <- (c_ij + c_ji) / (c_i / x_i + c_j / x_j),    T_ij = x_ij / x_i
/// ```
///
/// where c_i and x_i are row sums. The iterate `x` stays symmetric, so every
/// intermediate `T` satisfies detailed balance with `pi_i = x_i / sum(x)`.
/// (Bowman, Beauchamp, Boxer, Pande, J. Chem. Phys. 131, 124101 (2009);
/// Prinz et al., J. Chem. Phys. 134, 174105 (2011).)
#[derive(Debug, Clone)]
pub struct TransitionMatrixEstimator {
    reversible: bool,
    detailed_balance_tolerance: f64,
    termination_criterium: TerminationCriterium,
}

impl TransitionMatrixEstimator {
    pub fn new(reversible: bool) -> Self {
        Self {
            reversible,
            detailed_balance_tolerance: DETAILED_BALANCE_TOLERANCE,
            termination_criterium: default_fixed_point_termination(),
        }
    }

    pub fn from_config(config: &EstimationConfig) -> Self {
        Self {
            reversible: config.reversible,
            detailed_balance_tolerance: config.detailed_balance_tolerance,
            termination_criterium: config.termination.clone(),
        }
    }

    pub fn reversible(&self) -> bool {
        self.reversible
    }

    pub fn set_termination_criterium(&mut self, termination_criterium: TerminationCriterium) {
        self.termination_criterium = termination_criterium;
    }

    // Counts must already be restricted to the active set
    pub fn estimate(&self, counts: &CountMatrix) -> Result<Estimate, EstimationError> {
        let c = counts.to_f64();
        Self::check_irreducible(&c, self.reversible)?;

        let estimate = if self.reversible {
            self.estimate_reversible(&c)?
        } else {
            let transition_matrix = TransitionMatrix::from_weights(c.clone())?;
            let log_likelihood = log_likelihood(&c, &transition_matrix);
            Estimate { transition_matrix, stationary: None, iterations: 0, log_likelihood }
        };

        log::debug!(
            "Estimated {} transition matrix over {} states (log-likelihood {:.6e}, {} iterations)",
            if self.reversible { "reversible" } else { "non-reversible" },
            counts.n_states(),
            estimate.log_likelihood,
            estimate.iterations
        );

        Ok(estimate)
    }

    pub fn check_irreducible(counts: &DMatrix<f64>, reversible: bool) -> Result<(), EstimationError> {
        if counts.iter().all(|&count| count == 0.0) {
            return Err(EstimationError::NoCounts);
        }
        let mode = if reversible { ConnectivityMode::Weak } else { ConnectivityMode::Strong };
        if !is_irreducible(counts, mode) {
            return Err(EstimationError::Disconnected { reversible });
        }
        Ok(())
    }

    fn estimate_reversible(&self, c: &DMatrix<f64>) -> Result<Estimate, EstimationError> {
        let n = c.nrows();
        let c_sym = c + c.transpose();
        let c_rows: Vec<f64> = c.row_iter().map(|row| row.sum()).collect();

        let mut x = &c_sym / c_sym.sum();
        let mut x_rows: Vec<f64> = x.row_iter().map(|row| row.sum()).collect();
        let mut tracker = OptimizationTracker::new(self.termination_criterium.clone());

        loop {
            let mut next = DMatrix::<f64>::zeros(n, n);
            for i in 0..n {
                for j in 0..=i {
                    let numerator = c_sym[(i, j)];
                    if numerator == 0.0 {
                        continue;
                    }
                    let denominator = c_rows[i] / x_rows[i] + c_rows[j] / x_rows[j];
                    // On the diagonal this reduces to c_ii x_i / c_i
                    let value = numerator / denominator;
                    next[(i, j)] = value;
                    next[(j, i)] = value;
                }
            }
            next /= next.sum();

            let next_rows: Vec<f64> = next.row_iter().map(|row| row.sum()).collect();
            let change = next_rows.iter().zip(&x_rows).map(|(a, b)| (a - b).abs()).fold(0.0, f64::max);

            x = next;
            x_rows = next_rows;

            if !change.is_finite() {
                return Err(EstimationError::NotConverged { iterations: tracker.iterations(), change });
            }
            if tracker.step(change) {
                break;
            }
        }

        if !tracker.has_converged() {
            return Err(EstimationError::NotConverged {
                iterations: tracker.iterations(),
                change: tracker.last_eval().unwrap_or(f64::INFINITY),
            });
        }

        let total: f64 = x_rows.iter().sum();
        let stationary = StationaryDistribution::new(x_rows.iter().map(|x_i| x_i / total).collect())?;
        let transition_matrix = TransitionMatrix::from_weights(x)?;

        let max_violation = transition_matrix.detailed_balance_violation(stationary.as_slice());
        if max_violation >= self.detailed_balance_tolerance {
            return Err(EstimationError::DetailedBalanceViolated {
                max_violation,
                tolerance: self.detailed_balance_tolerance,
            });
        }

        let log_likelihood = log_likelihood(c, &transition_matrix);

        Ok(Estimate {
            transition_matrix,
            stationary: Some(stationary),
            iterations: tracker.iterations(),
            log_likelihood,
        })
    }
}

// The fixed point converges linearly, so the budget is generous
pub fn default_fixed_point_termination() -> TerminationCriterium {
    TerminationCriterium::ThresholdReached { threshold: 1e-14, max_iterations: Some(100_000) }
}

// sum_ij c_ij ln T_ij over observed transitions
pub fn log_likelihood(counts: &DMatrix<f64>, transition_matrix: &TransitionMatrix) -> f64 {
    counts
        .iter()
        .zip(transition_matrix.as_matrix().iter())
        .filter(|(&count, _)| count > 0.0)
        .map(|(&count, &probability)| count * probability.ln())
        .sum()
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimationError {
    #[error("count matrix is not irreducible (reversible: {reversible}); restrict it to the active set first")]
    Disconnected { reversible: bool },
    #[error("count matrix has no counts")]
    NoCounts,
    #[error("reversible estimate did not converge after {iterations} iterations (last change {change:e})")]
    NotConverged { iterations: u32, change: f64 },
    #[error("detailed balance violated by {max_violation:e} (tolerance {tolerance:e})")]
    DetailedBalanceViolated { max_violation: f64, tolerance: f64 },
    #[error("estimated matrix is invalid: {0}")]
    InvalidMatrix(#[from] MatrixValidationError),
}
