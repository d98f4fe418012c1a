use super::cancellation::CancellationToken;
use super::config::MsmConfig;
use super::dtraj::DiscreteTrajectory;
use super::ensemble::EnsembleStatistics;
use super::errors::{MsmError, Result};
use super::model::{BayesianMarkovStateModel, MarkovStateModel};

/// Implied timescales of models estimated at a series of lag times.
///
/// Timescales that level off with increasing lag indicate the discretization
/// is Markovian at that lag.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpliedTimescales {
    pub lags: Vec<usize>,
    pub timescales: Vec<Vec<f64>>, // One row per lag, slowest first
}

impl ImpliedTimescales {
    // The `index`-th slowest timescale at every lag, NaN where a model has fewer
    pub fn series(&self, index: usize) -> Vec<f64> {
        self.timescales.iter().map(|row| row.get(index).copied().unwrap_or(f64::NAN)).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BayesianImpliedTimescales {
    pub lags: Vec<usize>,
    pub mle: Vec<Vec<f64>>,
    pub statistics: Vec<EnsembleStatistics<Vec<f64>>>,
}

pub fn implied_timescale_scan(
    dtrajs: &[DiscreteTrajectory],
    lags: &[usize],
    n_timescales: usize,
    config: &MsmConfig,
) -> Result<ImpliedTimescales> {
    check_lags(lags)?;

    let timescales = lags
        .iter()
        .map(|&lag| {
            let model = MarkovStateModel::estimate(dtrajs, &at_lag(config, lag))?;
            let timescales = model.timescales(n_timescales);
            log::debug!("Lag {}: timescales {:?}", lag, timescales);
            Ok(timescales)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ImpliedTimescales { lags: lags.to_vec(), timescales })
}

pub fn bayesian_implied_timescale_scan(
    dtrajs: &[DiscreteTrajectory],
    lags: &[usize],
    n_timescales: usize,
    config: &MsmConfig,
    cancel: &CancellationToken,
) -> Result<BayesianImpliedTimescales> {
    check_lags(lags)?;

    let mut mle = Vec::with_capacity(lags.len());
    let mut statistics = Vec::with_capacity(lags.len());
    for &lag in lags {
        let model = BayesianMarkovStateModel::sample(dtrajs, &at_lag(config, lag), cancel)?;
        mle.push(model.mle().timescales(n_timescales));
        statistics.push(model.timescales_statistics(n_timescales)?);
    }

    Ok(BayesianImpliedTimescales { lags: lags.to_vec(), mle, statistics })
}

fn at_lag(config: &MsmConfig, lag: usize) -> MsmConfig {
    let mut config = config.clone();
    config.counting.lag = lag;
    config
}

fn check_lags(lags: &[usize]) -> Result<()> {
    if lags.is_empty() {
        return Err(MsmError::InvalidArgument { name: "lags", reason: "no lag times given".into() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msm::count_matrix::CountError;
    use crate::msm::transition_matrix::TransitionMatrix;
    use crate::msm::MarkovChain;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn simulated_two_state(n_steps: usize) -> Vec<DiscreteTrajectory> {
        let t = TransitionMatrix::from_rows(vec![vec![0.95, 0.05], vec![0.1, 0.9]]).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        vec![MarkovChain::simulate(&t, 0, n_steps, &mut rng).unwrap()]
    }

    #[test]
    fn test_timescales_are_lag_independent_for_markov_data() {
        let dtrajs = simulated_two_state(100_000);
        let its = implied_timescale_scan(&dtrajs, &[1, 2, 5, 10], 1, &MsmConfig::default()).unwrap();

        // lambda_2 = 0.85, t_2 = -1 / ln 0.85
        let exact = -1.0 / 0.85f64.ln();
        assert_eq!(its.lags, vec![1, 2, 5, 10]);
        for value in its.series(0) {
            assert!((value - exact).abs() / exact < 0.1, "Timescale {} vs {}", value, exact);
        }
        assert!(its.series(3).iter().all(|value| value.is_nan()));
    }

    #[test]
    fn test_scan_errors() {
        let dtrajs = simulated_two_state(1_000);
        match implied_timescale_scan(&dtrajs, &[], 1, &MsmConfig::default()) {
            Err(MsmError::InvalidArgument { name, .. }) => assert_eq!(name, "lags"),
            other => panic!("Expected InvalidArgument, got {:?}", other),
        }
        match implied_timescale_scan(&dtrajs, &[1, 2_000], 1, &MsmConfig::default()) {
            Err(MsmError::Count(CountError::InvalidLag { lag, .. })) => assert_eq!(lag, 2_000),
            other => panic!("Expected InvalidLag, got {:?}", other),
        }
    }

    #[test]
    fn test_bayesian_scan() {
        let dtrajs = simulated_two_state(20_000);
        let mut config = MsmConfig::default();
        config.bayesian.n_samples = 10;
        config.bayesian.seed = Some(2);

        let its = bayesian_implied_timescale_scan(&dtrajs, &[1, 3], 1, &config, &CancellationToken::new()).unwrap();
        assert_eq!(its.statistics.len(), 2);
        for (mle, stats) in its.mle.iter().zip(&its.statistics) {
            assert_eq!(stats.n_samples, 10);
            assert!(stats.lower[0] <= stats.upper[0]);
            assert!((stats.mean[0] - mle[0]).abs() / mle[0] < 0.3);
        }
    }
}
