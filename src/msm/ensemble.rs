use nalgebra::DVector;
use rayon::prelude::*;

use super::bayesian::{BayesianEnsemble, SamplingError};
use super::parallel::run_in_pool;
use super::transition_matrix::TransitionMatrix;

/// Values that can be averaged elementwise over an ensemble.
pub trait EnsembleObservable: Sized + Send {
    fn flatten(&self) -> Vec<f64>;

    // Rebuild a value shaped like `template` from flat values
    fn unflatten(template: &Self, values: Vec<f64>) -> Self;
}

impl EnsembleObservable for f64 {
    fn flatten(&self) -> Vec<f64> {
        vec![*self]
    }

    fn unflatten(_template: &Self, values: Vec<f64>) -> Self {
        values.first().copied().unwrap_or(f64::NAN)
    }
}

impl EnsembleObservable for Vec<f64> {
    fn flatten(&self) -> Vec<f64> {
        self.clone()
    }

    fn unflatten(_template: &Self, values: Vec<f64>) -> Self {
        values
    }
}

impl EnsembleObservable for DVector<f64> {
    fn flatten(&self) -> Vec<f64> {
        self.as_slice().to_vec()
    }

    fn unflatten(_template: &Self, values: Vec<f64>) -> Self {
        DVector::from_vec(values)
    }
}

/// Elementwise summary of an observable over an ensemble.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleStatistics<T> {
    pub mean: T,
    pub std: T,   // Sample standard deviation (n - 1 denominator)
    pub lower: T, // Lower end of the percentile interval
    pub upper: T,
    pub n_samples: usize,
    pub confidence: f64,
}

impl BayesianEnsemble {
    /// Evaluates `f` on every sample and summarizes the results elementwise.
    ///
    /// The interval holds the central `confidence` mass of the samples, with
    /// linear interpolation between order statistics.
    pub fn aggregate<T, E, F>(
        &self,
        f: F,
        confidence: f64,
        workers: Option<usize>,
    ) -> Result<EnsembleStatistics<T>, E>
    where
        T: EnsembleObservable,
        E: From<SamplingError> + Send,
        F: Fn(&TransitionMatrix) -> Result<T, E> + Sync,
    {
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(SamplingError::InvalidConfidence { confidence }.into());
        }
        if self.is_empty() {
            return Err(SamplingError::EmptyEnsemble.into());
        }

        let values = run_in_pool(workers, || self.samples().par_iter().map(&f).collect::<Result<Vec<T>, E>>())
            .map_err(|err| E::from(SamplingError::ThreadPool(err)))??;

        let flat: Vec<Vec<f64>> = values.iter().map(EnsembleObservable::flatten).collect();
        let width = flat[0].len();
        if let Some((sample, found)) = flat.iter().map(Vec::len).enumerate().find(|&(_, len)| len != width) {
            return Err(SamplingError::ShapeMismatch { sample, expected: width, found }.into());
        }

        let summary = summarize(&flat, width, confidence);
        let template = &values[0];

        Ok(EnsembleStatistics {
            mean: T::unflatten(template, summary.mean),
            std: T::unflatten(template, summary.std),
            lower: T::unflatten(template, summary.lower),
            upper: T::unflatten(template, summary.upper),
            n_samples: values.len(),
            confidence,
        })
    }
}

struct Summary {
    mean: Vec<f64>,
    std: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

fn summarize(flat: &[Vec<f64>], width: usize, confidence: f64) -> Summary {
    let n = flat.len();
    let mut summary = Summary {
        mean: Vec::with_capacity(width),
        std: Vec::with_capacity(width),
        lower: Vec::with_capacity(width),
        upper: Vec::with_capacity(width),
    };

    for k in 0..width {
        let mut column: Vec<f64> = flat.iter().map(|values| values[k]).collect();
        let mean = column.iter().sum::<f64>() / n as f64;
        let variance = if n > 1 {
            column.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        } else {
            0.0
        };

        column.sort_by(|a, b| a.total_cmp(b));
        summary.mean.push(mean);
        summary.std.push(variance.sqrt());
        summary.lower.push(percentile(&column, (1.0 - confidence) / 2.0));
        summary.upper.push(percentile(&column, (1.0 + confidence) / 2.0));
    }

    summary
}

// `sorted` must be non-empty and ascending
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let below = position.floor() as usize;
    let above = position.ceil() as usize;
    let weight = position - below as f64;
    sorted[below] * (1.0 - weight) + sorted[above] * weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn two_state(p: f64) -> TransitionMatrix {
        TransitionMatrix::from_rows(vec![vec![1.0 - p, p], vec![p, 1.0 - p]]).unwrap()
    }

    fn ensemble(ps: &[f64]) -> BayesianEnsemble {
        BayesianEnsemble::new(ps.iter().map(|&p| two_state(p)).collect(), 1)
    }

    #[test]
    fn test_scalar_statistics() {
        let ensemble = ensemble(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        let stats = ensemble
            .aggregate(|t| Ok::<f64, SamplingError>(t[(0, 1)]), 0.5, None)
            .unwrap();

        assert_eq!(stats.n_samples, 5);
        assert_abs_diff_eq!(stats.mean, 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.std, 0.025_f64.sqrt(), epsilon = 1e-12);
        // Quartiles of five evenly spaced values
        assert_abs_diff_eq!(stats.lower, 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.upper, 0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_vector_statistics_keep_shape() {
        let ensemble = ensemble(&[0.1, 0.3]);
        let stats = ensemble
            .aggregate(|t| Ok::<DVector<f64>, SamplingError>(t.as_matrix().row(0).transpose()), 0.95, Some(2))
            .unwrap();

        assert_eq!(stats.mean.len(), 2);
        assert_abs_diff_eq!(stats.mean[0], 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.mean[1], 0.2, epsilon = 1e-12);
        assert!(stats.lower[1] <= stats.mean[1] && stats.mean[1] <= stats.upper[1]);
    }

    #[test]
    fn test_single_sample_has_zero_spread() {
        let stats = ensemble(&[0.25]).aggregate(|t| Ok::<f64, SamplingError>(t[(1, 0)]), 0.9, None).unwrap();
        assert_eq!(stats.std, 0.0);
        assert_eq!(stats.lower, 0.25);
        assert_eq!(stats.upper, 0.25);
    }

    #[test]
    fn test_empty_ensemble() {
        match BayesianEnsemble::new(Vec::new(), 1).aggregate(|t| Ok::<f64, SamplingError>(t[(0, 0)]), 0.95, None) {
            Err(SamplingError::EmptyEnsemble) => (),
            other => panic!("Expected EmptyEnsemble error, got {:?}", other),
        }
    }

    #[test]
    fn test_shape_mismatch() {
        let ensemble = ensemble(&[0.1, 0.3]);
        let result = ensemble.aggregate(
            |t| Ok::<Vec<f64>, SamplingError>(if t[(0, 1)] < 0.2 { vec![1.0] } else { vec![1.0, 2.0] }),
            0.95,
            None,
        );
        match result {
            Err(SamplingError::ShapeMismatch { sample: 1, expected: 1, found: 2 }) => (),
            other => panic!("Expected ShapeMismatch error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_confidence() {
        match ensemble(&[0.1]).aggregate(|t| Ok::<f64, SamplingError>(t[(0, 0)]), 1.5, None) {
            Err(SamplingError::InvalidConfidence { .. }) => (),
            other => panic!("Expected InvalidConfidence error, got {:?}", other),
        }
    }

    #[test]
    fn test_observable_errors_propagate() {
        let result = ensemble(&[0.1, 0.2]).aggregate(|_| Err::<f64, SamplingError>(SamplingError::Cancelled), 0.95, None);
        assert!(matches!(result, Err(SamplingError::Cancelled)));
    }
}
