use nalgebra::DMatrix;

use super::dtraj::DiscreteTrajectory;
use super::errors::{MsmError, Result};
use super::model::MarkovStateModel;
use super::transition_matrix::StationaryDistribution;

/// Chapman-Kolmogorov test of a model against models estimated at longer lags.
///
/// Entry (s, s') of each matrix is the probability of being in set s' after
/// the given lag when starting from the stationary distribution restricted to
/// set s. `predictions[k]` propagates the base model k + 1 times, `estimates[k]`
/// comes from a model estimated directly at `lags[k]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CkTest {
    pub lags: Vec<usize>,
    pub predictions: Vec<DMatrix<f64>>,
    pub estimates: Vec<DMatrix<f64>>, // NaN rows where a set left the active set
}

impl CkTest {
    // Largest |prediction - estimate| over all lags, ignoring NaN entries
    pub fn max_deviation(&self) -> f64 {
        self.predictions
            .iter()
            .zip(&self.estimates)
            .flat_map(|(prediction, estimate)| prediction.iter().zip(estimate.iter()).map(|(p, e)| (p - e).abs()))
            .filter(|deviation| !deviation.is_nan())
            .fold(0.0, f64::max)
    }
}

/// Runs the test for lag multiples 1..=n_multiples on sets of original state ids.
pub fn chapman_kolmogorov_test(
    model: &MarkovStateModel,
    dtrajs: &[DiscreteTrajectory],
    sets: &[Vec<usize>],
    n_multiples: usize,
) -> Result<CkTest> {
    if n_multiples == 0 {
        return Err(MsmError::InvalidArgument { name: "n_multiples", reason: "must be at least 1".into() });
    }
    let base_sets: Vec<Vec<usize>> = sets.iter().map(|set| model.to_local(set)).collect::<Result<_>>()?;
    if let Some(set) = base_sets.iter().position(Vec::is_empty) {
        return Err(MsmError::InvalidArgument { name: "sets", reason: format!("set {} is empty", set) });
    }

    let lag = model.lag();
    let mut lags = Vec::with_capacity(n_multiples);
    let mut predictions = Vec::with_capacity(n_multiples);
    let mut estimates = Vec::with_capacity(n_multiples);

    let mut propagated = model.transition_matrix().as_matrix().clone();
    for k in 1..=n_multiples {
        if k > 1 {
            propagated = &propagated * model.transition_matrix().as_matrix();
        }
        predictions.push(set_probabilities(&propagated, model.stationary_distribution(), &base_sets));

        // Longer lags may lose states; the test then runs on what remains
        let mut config = model.config().clone();
        config.counting.lag = k * lag;
        config.connectivity.accept_partial = true;
        let longer = MarkovStateModel::estimate(dtrajs, &config)?;

        let longer_sets: Vec<Vec<usize>> = sets
            .iter()
            .map(|set| set.iter().filter_map(|&state| longer.active_set().local_index(state)).collect())
            .collect();
        estimates.push(set_probabilities(
            longer.transition_matrix().as_matrix(),
            longer.stationary_distribution(),
            &longer_sets,
        ));

        lags.push(k * lag);
    }

    let test = CkTest { lags, predictions, estimates };
    log::info!("Chapman-Kolmogorov test over lags {:?}: max deviation {:.4}", test.lags, test.max_deviation());
    Ok(test)
}

fn set_probabilities(propagator: &DMatrix<f64>, stationary: &StationaryDistribution, sets: &[Vec<usize>]) -> DMatrix<f64> {
    let k = sets.len();
    let mut probabilities = DMatrix::from_element(k, k, f64::NAN);
    for (s, source) in sets.iter().enumerate() {
        let mass = stationary.mass(source);
        if source.is_empty() || mass <= 0.0 {
            continue;
        }
        for (t, target) in sets.iter().enumerate() {
            probabilities[(s, t)] = source
                .iter()
                .map(|&i| stationary[i] * target.iter().map(|&j| propagator[(i, j)]).sum::<f64>())
                .sum::<f64>()
                / mass;
        }
    }
    probabilities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msm::config::MsmConfig;
    use crate::msm::transition_matrix::TransitionMatrix;
    use crate::msm::MarkovChain;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn simulated_two_basin(n_steps: usize) -> Vec<DiscreteTrajectory> {
        let t = TransitionMatrix::from_rows(vec![
            vec![0.9, 0.1, 0.0, 0.0],
            vec![0.1, 0.89, 0.01, 0.0],
            vec![0.0, 0.01, 0.89, 0.1],
            vec![0.0, 0.0, 0.1, 0.9],
        ])
        .unwrap();
        let mut rng = StdRng::seed_from_u64(21);
        vec![MarkovChain::simulate(&t, 0, n_steps, &mut rng).unwrap()]
    }

    #[test]
    fn test_markovian_data_passes() {
        let dtrajs = simulated_two_basin(200_000);
        let model = MarkovStateModel::estimate(&dtrajs, &MsmConfig::default()).unwrap();
        let test = model.ck_test(&dtrajs, &[vec![0, 1], vec![2, 3]], 4).unwrap();

        assert_eq!(test.lags, vec![1, 2, 3, 4]);
        assert_eq!(test.predictions.len(), 4);
        // Same lag, same model
        for (p, e) in test.predictions[0].iter().zip(test.estimates[0].iter()) {
            assert!((p - e).abs() < 1e-10);
        }
        for prediction in &test.predictions {
            for row in prediction.row_iter() {
                assert!((row.sum() - 1.0).abs() < 1e-10);
            }
        }
        assert!(test.max_deviation() < 0.02, "Deviation {}", test.max_deviation());
    }

    #[test]
    fn test_invalid_arguments() {
        let dtrajs = simulated_two_basin(20_000);
        let model = MarkovStateModel::estimate(&dtrajs, &MsmConfig::default()).unwrap();

        match model.ck_test(&dtrajs, &[vec![0, 1], vec![2, 3]], 0) {
            Err(MsmError::InvalidArgument { name, .. }) => assert_eq!(name, "n_multiples"),
            other => panic!("Expected InvalidArgument, got {:?}", other),
        }
        match model.ck_test(&dtrajs, &[vec![0, 1], vec![]], 2) {
            Err(MsmError::InvalidArgument { name, .. }) => assert_eq!(name, "sets"),
            other => panic!("Expected InvalidArgument, got {:?}", other),
        }
        match model.ck_test(&dtrajs, &[vec![0, 9]], 2) {
            Err(MsmError::StateNotActive { state }) => assert_eq!(state, 9),
            other => panic!("Expected StateNotActive, got {:?}", other),
        }
    }

    #[test]
    fn test_max_deviation_skips_missing_sets() {
        let test = CkTest {
            lags: vec![1],
            predictions: vec![DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.2, 0.8])],
            estimates: vec![DMatrix::from_row_slice(2, 2, &[0.85, 0.15, f64::NAN, f64::NAN])],
        };
        assert!((test.max_deviation() - 0.05).abs() < 1e-12);
    }
}
