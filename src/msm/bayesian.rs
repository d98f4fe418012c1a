use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, Normal};
use rayon::prelude::*;
use rayon::ThreadPoolBuildError;
use thiserror::Error;

use super::cancellation::CancellationToken;
use super::config::BayesianConfig;
use super::count_matrix::CountMatrix;
use super::estimation::{EstimationError, TransitionMatrixEstimator};
use super::parallel::run_in_pool;
use super::transition_matrix::{MatrixValidationError, TransitionMatrix};

const PROPOSAL_SCALE: f64 = 0.5; // Standard deviation of the log-space random walk

/// Posterior draws of transition matrices for one count matrix.
#[derive(Debug, Clone)]
pub struct BayesianEnsemble {
    samples: Vec<TransitionMatrix>,
    lag: usize,
}

impl BayesianEnsemble {
    pub fn new(samples: Vec<TransitionMatrix>, lag: usize) -> Self {
        Self { samples, lag }
    }

    pub fn samples(&self) -> &[TransitionMatrix] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn lag(&self) -> usize {
        self.lag
    }
}

/// Draws transition matrices from the posterior given a count matrix.
///
/// Non-reversible posteriors factor into one Dirichlet per row. Reversible
/// posteriors are sampled with Metropolis-Hastings on a symmetric weight matrix
/// `X`, from which `T_ij = x_ij / x_i`. Symmetry of `X` makes every sample
/// reversible with respect to the row sums of `X`.
///
/// Sample `k` uses its own generator seeded from `(seed, k)` and, in the
/// reversible case, its own chain started at the maximum likelihood estimate.
/// The ensemble therefore does not depend on the worker count.
#[derive(Debug, Clone)]
pub struct TransitionMatrixSampler {
    reversible: bool,
    n_samples: usize,
    n_steps: usize,
    burn_in: usize,
    prior: f64,
    seed: Option<u64>,
    workers: Option<usize>,
}

impl TransitionMatrixSampler {
    pub fn new(reversible: bool, n_samples: usize) -> Self {
        let defaults = BayesianConfig::default();
        Self {
            reversible,
            n_samples,
            n_steps: defaults.n_steps,
            burn_in: defaults.burn_in,
            prior: defaults.prior,
            seed: None,
            workers: None,
        }
    }

    pub fn from_config(config: &BayesianConfig, reversible: bool) -> Self {
        Self {
            reversible,
            n_samples: config.n_samples,
            n_steps: config.n_steps,
            burn_in: config.burn_in,
            prior: config.prior,
            seed: config.seed,
            workers: config.workers,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_chain_length(mut self, burn_in: usize, n_steps: usize) -> Self {
        self.burn_in = burn_in;
        self.n_steps = n_steps;
        self
    }

    pub fn sample(&self, counts: &CountMatrix, cancel: &CancellationToken) -> Result<BayesianEnsemble, SamplingError> {
        if self.n_samples == 0 {
            return Err(SamplingError::InvalidParameter { name: "n_samples", value: 0.0 });
        }
        if self.n_steps == 0 {
            return Err(SamplingError::InvalidParameter { name: "n_steps", value: 0.0 });
        }
        if !(self.prior >= 0.0) {
            return Err(SamplingError::InvalidParameter { name: "prior", value: self.prior });
        }

        let observed = counts.to_f64();
        TransitionMatrixEstimator::check_irreducible(&observed, self.reversible)?;
        let effective = observed.map(|count| if count > 0.0 { count + self.prior } else { 0.0 });

        // The reversible chains all start at the maximum likelihood weights
        let start = if self.reversible {
            let estimate = TransitionMatrixEstimator::new(true).estimate(counts)?;
            let pi = estimate.stationary.ok_or(SamplingError::MissingStationary)?;
            let t = estimate.transition_matrix.as_matrix();
            Some(DMatrix::from_fn(t.nrows(), t.ncols(), |i, j| pi[i] * t[(i, j)]))
        } else {
            None
        };

        let seed = self.seed.unwrap_or_else(rand::random);
        log::info!(
            "Sampling {} {} transition matrices (seed {}, burn-in {}, {} sweeps per sample)",
            self.n_samples,
            if self.reversible { "reversible" } else { "non-reversible" },
            seed,
            self.burn_in,
            self.n_steps
        );

        let samples = run_in_pool(self.workers, || {
            (0..self.n_samples)
                .into_par_iter()
                .map(|index| {
                    if cancel.is_cancelled() {
                        return Err(SamplingError::Cancelled);
                    }
                    let mut rng = StdRng::seed_from_u64(sample_seed(seed, index));
                    match &start {
                        Some(start) => self.draw_reversible(&effective, start.clone(), &mut rng),
                        None => draw_non_reversible(&effective, &mut rng),
                    }
                })
                .collect::<Result<Vec<TransitionMatrix>, SamplingError>>()
        })??;

        Ok(BayesianEnsemble::new(samples, counts.lag()))
    }

    fn draw_reversible(
        &self,
        counts: &DMatrix<f64>,
        mut x: DMatrix<f64>,
        rng: &mut StdRng,
    ) -> Result<TransitionMatrix, SamplingError> {
        let n = counts.nrows();
        let count_rows: Vec<f64> = counts.row_iter().map(|row| row.sum()).collect();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| (0..=i).map(move |j| (i, j)))
            .filter(|&(i, j)| counts[(i, j)] + counts[(j, i)] > 0.0)
            .collect();
        let step = Normal::new(0.0, PROPOSAL_SCALE)
            .map_err(|_| SamplingError::InvalidParameter { name: "proposal_scale", value: PROPOSAL_SCALE })?;

        let mut x_rows: Vec<f64> = x.row_iter().map(|row| row.sum()).collect();

        for _ in 0..self.burn_in + self.n_steps {
            for &(i, j) in &pairs {
                let current = x[(i, j)];
                let proposed = current * step.sample(rng).exp();
                let delta = proposed - current;

                let log_ratio = if i == j {
                    counts[(i, i)] * (proposed / current).ln()
                        - count_rows[i] * ((x_rows[i] + delta) / x_rows[i]).ln()
                } else {
                    (counts[(i, j)] + counts[(j, i)]) * (proposed / current).ln()
                        - count_rows[i] * ((x_rows[i] + delta) / x_rows[i]).ln()
                        - count_rows[j] * ((x_rows[j] + delta) / x_rows[j]).ln()
                };
                // Hastings factor of the multiplicative proposal
                let log_acceptance = log_ratio + (proposed / current).ln();

                if log_acceptance >= 0.0 || rng.gen::<f64>().ln() < log_acceptance {
                    x[(i, j)] = proposed;
                    x[(j, i)] = proposed;
                    x_rows[i] += delta;
                    if i != j {
                        x_rows[j] += delta;
                    }
                }
            }

            // The likelihood only sees ratios, so the scale is free
            let total = x.sum();
            x /= total;
            x_rows.iter_mut().for_each(|x_i| *x_i /= total);
        }

        Ok(TransitionMatrix::from_weights(x)?)
    }
}

fn draw_non_reversible(counts: &DMatrix<f64>, rng: &mut StdRng) -> Result<TransitionMatrix, SamplingError> {
    let n = counts.nrows();
    let mut weights = DMatrix::<f64>::zeros(n, n);

    for i in 0..n {
        for j in 0..n {
            let alpha = counts[(i, j)];
            if alpha > 0.0 {
                let gamma = Gamma::new(alpha, 1.0)
                    .map_err(|_| SamplingError::InvalidParameter { name: "dirichlet_alpha", value: alpha })?;
                weights[(i, j)] = gamma.sample(rng);
            }
        }
        if weights.row(i).sum() <= 0.0 {
            return Err(SamplingError::DegenerateRow { row: i });
        }
    }

    Ok(TransitionMatrix::from_weights(weights)?)
}

fn sample_seed(seed: u64, index: usize) -> u64 {
    seed ^ (index as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[derive(Debug, Error)]
pub enum SamplingError {
    #[error(transparent)]
    Estimation(#[from] EstimationError),
    #[error("sampled matrix is invalid: {0}")]
    InvalidMatrix(#[from] MatrixValidationError),
    #[error("invalid sampler parameter `{name}` = {value}")]
    InvalidParameter { name: &'static str, value: f64 },
    #[error("reversible estimate is missing its stationary distribution")]
    MissingStationary,
    #[error("all Dirichlet draws of row {row} underflowed to zero")]
    DegenerateRow { row: usize },
    #[error("sampling was cancelled")]
    Cancelled,
    #[error("could not build worker pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
    #[error("ensemble has no samples")]
    EmptyEnsemble,
    #[error("observable of sample {sample} has {found} values, expected {expected}")]
    ShapeMismatch { sample: usize, expected: usize, found: usize },
    #[error("confidence must lie in (0, 1), got {confidence}")]
    InvalidConfidence { confidence: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(rows: Vec<Vec<u64>>) -> CountMatrix {
        CountMatrix::from_rows(rows, 1).unwrap()
    }

    fn mean_matrix(ensemble: &BayesianEnsemble) -> DMatrix<f64> {
        let n = ensemble.samples()[0].n_states();
        let sum = ensemble.samples().iter().fold(DMatrix::zeros(n, n), |acc, t| acc + t.as_matrix());
        sum / ensemble.len() as f64
    }

    #[test]
    fn test_non_reversible_samples_are_stochastic() {
        let matrix = counts(vec![vec![80, 20], vec![30, 70]]);
        let ensemble = TransitionMatrixSampler::new(false, 200)
            .with_seed(7)
            .sample(&matrix, &CancellationToken::new())
            .unwrap();

        assert_eq!(ensemble.len(), 200);
        assert_eq!(ensemble.lag(), 1);
        for sample in ensemble.samples() {
            assert!(sample.max_row_sum_error() < 1e-10);
        }

        // Dirichlet means are c_ij / c_i
        let mean = mean_matrix(&ensemble);
        assert!((mean[(0, 1)] - 0.2).abs() < 0.02, "Mean {}", mean[(0, 1)]);
        assert!((mean[(1, 0)] - 0.3).abs() < 0.02, "Mean {}", mean[(1, 0)]);
    }

    #[test]
    fn test_unobserved_transitions_stay_zero() {
        let matrix = counts(vec![vec![5, 5, 0], vec![3, 4, 3], vec![0, 6, 4]]);
        let ensemble = TransitionMatrixSampler::new(false, 20)
            .with_seed(1)
            .sample(&matrix, &CancellationToken::new())
            .unwrap();
        for sample in ensemble.samples() {
            assert_eq!(sample[(0, 2)], 0.0);
            assert_eq!(sample[(2, 0)], 0.0);
        }
    }

    #[test]
    fn test_reversible_samples_satisfy_detailed_balance() {
        let matrix = counts(vec![vec![50, 10, 2], vec![8, 60, 12], vec![1, 14, 40]]);
        let ensemble = TransitionMatrixSampler::new(true, 20)
            .with_seed(11)
            .sample(&matrix, &CancellationToken::new())
            .unwrap();

        for sample in ensemble.samples() {
            let spectral = crate::msm::spectral::stationary_distribution(sample).unwrap();
            assert!(sample.detailed_balance_violation(spectral.as_slice()) < 1e-10);
        }
    }

    #[test]
    fn test_same_seed_same_ensemble_regardless_of_workers() {
        let matrix = counts(vec![vec![50, 10, 2], vec![8, 60, 12], vec![1, 14, 40]]);
        let cancel = CancellationToken::new();
        let one = TransitionMatrixSampler::new(true, 8).with_seed(3).with_workers(1).sample(&matrix, &cancel).unwrap();
        let four = TransitionMatrixSampler::new(true, 8).with_seed(3).with_workers(4).sample(&matrix, &cancel).unwrap();

        for (a, b) in one.samples().iter().zip(four.samples()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        match TransitionMatrixSampler::new(false, 10).sample(&counts(vec![vec![1, 1], vec![1, 1]]), &cancel) {
            Err(SamplingError::Cancelled) => (),
            other => panic!("Expected Cancelled error, got {:?}", other),
        }
    }

    #[test]
    fn test_disconnected_counts_are_rejected() {
        match TransitionMatrixSampler::new(false, 10).sample(&counts(vec![vec![3, 0], vec![0, 3]]), &CancellationToken::new()) {
            Err(SamplingError::Estimation(EstimationError::Disconnected { .. })) => (),
            other => panic!("Expected Disconnected error, got {:?}", other),
        }
    }
}
