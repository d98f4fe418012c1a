use nalgebra::DMatrix;
use rand::Rng;

use super::bayesian::{BayesianEnsemble, TransitionMatrixSampler};
use super::cancellation::CancellationToken;
use super::cktest::{chapman_kolmogorov_test, CkTest};
use super::config::MsmConfig;
use super::connectivity::{ActiveSet, ConnectivityAnalyzer};
use super::count_matrix::{CountMatrix, CountMatrixBuilder};
use super::dtraj::DiscreteTrajectory;
use super::ensemble::{EnsembleObservable, EnsembleStatistics};
use super::errors::{MsmError, Result};
use super::estimation::TransitionMatrixEstimator;
use super::mfpt::{mfpt_between, mfpt_matrix};
use super::pcca::{PccaDecomposer, PccaDecomposition};
use super::persistence::{ModelRecord, PccaRecord};
use super::spectral::{stationary_distribution, EigenPair, SpectralAnalyzer, SpectralDecomposition};
use super::tpt::{FluxNetwork, TptEngine};
use super::transition_matrix::{StationaryDistribution, TransitionMatrix};
use super::MarkovChain;

/// A Markov state model estimated at a single lag time.
///
/// All matrices and vectors are indexed by position in the active set. Methods
/// taking state ids (`tpt`, `mfpt`, `simulate`) expect original ids and map
/// them onto the active set.
#[derive(Debug, Clone)]
pub struct MarkovStateModel {
    config: MsmConfig,
    full_counts: CountMatrix,
    active_set: ActiveSet,
    counts: CountMatrix, // Restricted to the active set
    transition_matrix: TransitionMatrix,
    stationary: StationaryDistribution,
    spectral: SpectralDecomposition,
    active_count_fraction: f64,
    stored_pcca: Option<PccaDecomposition>, // Only set on models loaded from a record
}

impl MarkovStateModel {
    pub fn estimate(dtrajs: &[DiscreteTrajectory], config: &MsmConfig) -> Result<Self> {
        // Counting runs first so a bad lag surfaces as CountError::InvalidLag
        let mut builder = CountMatrixBuilder::new(config.counting.lag).with_mode(config.counting.count_mode);
        if let Some(n_states) = config.counting.n_states {
            builder = builder.with_n_states(n_states);
        }
        let full_counts = builder.build(dtrajs)?;
        config.validate()?;

        let report = ConnectivityAnalyzer::new(config.connectivity.mode).analyze(&full_counts)?;
        let active_set = if config.connectivity.accept_partial {
            report.accept_restricted().clone()
        } else {
            report.active_set()?.clone()
        };

        let counts = full_counts.submatrix(active_set.states())?;
        let estimate = TransitionMatrixEstimator::from_config(&config.estimation).estimate(&counts)?;
        let spectral = SpectralAnalyzer::from_config(&config.spectral).analyze(&estimate.transition_matrix)?;

        // The reversible estimator yields pi in closed form
        let stationary = estimate.stationary.unwrap_or_else(|| spectral.stationary().clone());

        let model = Self::assemble(config.clone(), full_counts, active_set, counts, estimate.transition_matrix, stationary, spectral);
        log::info!(
            "Estimated MSM at lag {}: {} of {} states active, timescales {:?}",
            model.lag(),
            model.active_set.len(),
            model.active_set.n_total_states(),
            model.timescales(3)
        );
        Ok(model)
    }

    // Rebuilds a stored model; the spectral decomposition is recomputed
    pub fn from_record(record: &ModelRecord, config: &MsmConfig) -> Result<Self> {
        let inconsistent = |reason: String| MsmError::InconsistentRecord { reason };

        let full_counts = CountMatrix::from_rows(record.count_matrix.clone(), record.lag)?;
        if full_counts.n_states() != record.n_states {
            return Err(inconsistent(format!(
                "count matrix covers {} states, record says {}",
                full_counts.n_states(),
                record.n_states
            )));
        }

        let active_set = ActiveSet::new(record.active_set.clone(), record.n_states)?;
        if active_set.len() != record.active_set.len() {
            return Err(inconsistent("active set has duplicate states".into()));
        }

        let transition_matrix = TransitionMatrix::from_rows(record.transition_matrix.clone())?;
        if transition_matrix.n_states() != active_set.len() {
            return Err(inconsistent(format!(
                "transition matrix has {} states, active set {}",
                transition_matrix.n_states(),
                active_set.len()
            )));
        }

        let stationary = StationaryDistribution::new(record.stationary.clone())?;
        if stationary.len() != active_set.len() {
            return Err(inconsistent(format!(
                "stationary distribution has {} entries, active set {}",
                stationary.len(),
                active_set.len()
            )));
        }

        if let Some(pcca) = &record.pcca {
            if pcca.memberships.len() != active_set.len() || pcca.memberships.iter().any(|row| row.len() != pcca.n_sets) {
                return Err(inconsistent("PCCA memberships do not match the active set".into()));
            }
        }

        let mut config = config.clone();
        config.counting.lag = record.lag;
        config.estimation.reversible = record.reversible;

        let counts = full_counts.submatrix(active_set.states())?;
        let spectral = SpectralAnalyzer::from_config(&config.spectral).analyze(&transition_matrix)?;

        let stored_pcca = match &record.pcca {
            Some(pcca) => {
                let memberships = DMatrix::from_fn(active_set.len(), pcca.n_sets, |i, s| pcca.memberships[i][s]);
                Some(PccaDecomposition::from_memberships(&transition_matrix, &spectral, memberships)?)
            }
            None => None,
        };

        let mut model = Self::assemble(config, full_counts, active_set, counts, transition_matrix, stationary, spectral);
        model.stored_pcca = stored_pcca;
        Ok(model)
    }

    fn assemble(
        config: MsmConfig,
        full_counts: CountMatrix,
        active_set: ActiveSet,
        counts: CountMatrix,
        transition_matrix: TransitionMatrix,
        stationary: StationaryDistribution,
        spectral: SpectralDecomposition,
    ) -> Self {
        let total = full_counts.total();
        let active_count_fraction = if total == 0 { 0.0 } else { counts.total() as f64 / total as f64 };
        Self {
            config,
            full_counts,
            active_set,
            counts,
            transition_matrix,
            stationary,
            spectral,
            active_count_fraction,
            stored_pcca: None,
        }
    }

    pub fn to_record(&self, pcca: Option<&PccaDecomposition>) -> ModelRecord {
        let full = self.full_counts.as_matrix();
        ModelRecord {
            lag: self.lag(),
            reversible: self.is_reversible(),
            n_states: self.full_counts.n_states(),
            active_set: self.active_set.states().to_vec(),
            count_matrix: full.row_iter().map(|row| row.iter().copied().collect()).collect(),
            transition_matrix: self.transition_matrix.to_rows(),
            stationary: self.stationary.as_slice().to_vec(),
            pcca: pcca.map(|decomposition| PccaRecord {
                n_sets: decomposition.n_sets(),
                memberships: decomposition
                    .memberships()
                    .row_iter()
                    .map(|row| row.iter().copied().collect())
                    .collect(),
            }),
        }
    }

    pub fn config(&self) -> &MsmConfig {
        &self.config
    }

    pub fn lag(&self) -> usize {
        self.config.counting.lag
    }

    pub fn is_reversible(&self) -> bool {
        self.config.estimation.reversible
    }

    pub fn active_set(&self) -> &ActiveSet {
        &self.active_set
    }

    pub fn count_matrix(&self) -> &CountMatrix {
        &self.counts
    }

    pub fn full_count_matrix(&self) -> &CountMatrix {
        &self.full_counts
    }

    pub fn transition_matrix(&self) -> &TransitionMatrix {
        &self.transition_matrix
    }

    pub fn stationary_distribution(&self) -> &StationaryDistribution {
        &self.stationary
    }

    pub fn spectral(&self) -> &SpectralDecomposition {
        &self.spectral
    }

    pub fn eigenpairs(&self) -> &[EigenPair] {
        self.spectral.eigenpairs()
    }

    pub fn eigenvalues(&self) -> Vec<f64> {
        self.spectral.eigenvalues()
    }

    pub fn active_state_fraction(&self) -> f64 {
        self.active_set.state_fraction()
    }

    pub fn active_count_fraction(&self) -> f64 {
        self.active_count_fraction
    }

    // The n slowest implied timescales, in units of the trajectory time step
    pub fn timescales(&self, n: usize) -> Vec<f64> {
        self.spectral.timescales(self.lag()).into_iter().take(n).collect()
    }

    // The decomposition saved with the record this model was loaded from
    pub fn stored_pcca(&self) -> Option<&PccaDecomposition> {
        self.stored_pcca.as_ref()
    }

    pub fn pcca(&self, n_sets: usize) -> Result<PccaDecomposition> {
        let decomposer = PccaDecomposer::new(n_sets).with_min_spectral_gap(self.config.pcca.min_spectral_gap);
        Ok(decomposer.decompose(&self.transition_matrix, &self.spectral)?)
    }

    // Reactive flux between two sets of original state ids.
    // States inside the returned network are active-set positions, see `to_original`.
    pub fn tpt(&self, source: &[usize], sink: &[usize]) -> Result<FluxNetwork> {
        let source = self.to_local(source)?;
        let sink = self.to_local(sink)?;
        Ok(TptEngine::new().compute(&self.transition_matrix, &self.stationary, &source, &sink, self.lag())?)
    }

    pub fn mfpt(&self, source: &[usize], sink: &[usize]) -> Result<f64> {
        let source = self.to_local(source)?;
        let sink = self.to_local(sink)?;
        Ok(mfpt_between(&self.transition_matrix, &self.stationary, &source, &sink, self.lag())?)
    }

    pub fn metastable_mfpt_matrix(&self, decomposition: &PccaDecomposition) -> Result<DMatrix<f64>> {
        Ok(mfpt_matrix(&self.transition_matrix, &self.stationary, decomposition.metastable_sets(), self.lag())?)
    }

    // Metastable sets of a decomposition in original state ids
    pub fn metastable_sets(&self, decomposition: &PccaDecomposition) -> Vec<Vec<usize>> {
        decomposition.metastable_sets().iter().map(|set| self.to_original(set)).collect()
    }

    // Trajectory of the model in original state ids, one frame per lag
    pub fn simulate(&self, start: usize, n_steps: usize, rng: &mut impl Rng) -> Result<DiscreteTrajectory> {
        let local_start = self.active_set.local_index(start).ok_or(MsmError::StateNotActive { state: start })?;
        let local = MarkovChain::simulate(&self.transition_matrix, local_start, n_steps, rng)?;
        Ok(DiscreteTrajectory::new(self.to_original(local.labels())))
    }

    pub fn ck_test(&self, dtrajs: &[DiscreteTrajectory], sets: &[Vec<usize>], n_multiples: usize) -> Result<CkTest> {
        chapman_kolmogorov_test(self, dtrajs, sets, n_multiples)
    }

    pub fn to_local(&self, states: &[usize]) -> Result<Vec<usize>> {
        states
            .iter()
            .map(|&state| self.active_set.local_index(state).ok_or(MsmError::StateNotActive { state }))
            .collect()
    }

    pub fn to_original(&self, local: &[usize]) -> Vec<usize> {
        local.iter().filter_map(|&index| self.active_set.global_index(index)).collect()
    }
}

/// Maximum likelihood model together with a posterior ensemble over its
/// transition matrix.
#[derive(Debug, Clone)]
pub struct BayesianMarkovStateModel {
    mle: MarkovStateModel,
    ensemble: BayesianEnsemble,
}

impl BayesianMarkovStateModel {
    pub fn sample(dtrajs: &[DiscreteTrajectory], config: &MsmConfig, cancel: &CancellationToken) -> Result<Self> {
        let mle = MarkovStateModel::estimate(dtrajs, config)?;
        let sampler = TransitionMatrixSampler::from_config(&config.bayesian, config.estimation.reversible);
        let ensemble = sampler.sample(mle.count_matrix(), cancel)?;
        log::info!("Drew {} transition matrix samples at lag {}", ensemble.len(), mle.lag());
        Ok(Self { mle, ensemble })
    }

    pub fn mle(&self) -> &MarkovStateModel {
        &self.mle
    }

    pub fn ensemble(&self) -> &BayesianEnsemble {
        &self.ensemble
    }

    pub fn aggregate<T, F>(&self, f: F) -> Result<EnsembleStatistics<T>>
    where
        T: EnsembleObservable,
        F: Fn(&TransitionMatrix) -> Result<T> + Sync,
    {
        let bayesian = &self.mle.config().bayesian;
        self.ensemble.aggregate(f, bayesian.confidence, bayesian.workers)
    }

    pub fn timescales_statistics(&self, n: usize) -> Result<EnsembleStatistics<Vec<f64>>> {
        let analyzer = SpectralAnalyzer::from_config(&self.mle.config().spectral);
        let lag = self.mle.lag();
        self.aggregate(|sample| {
            let spectral = analyzer.analyze(sample)?;
            Ok(spectral.timescales(lag).into_iter().take(n).collect::<Vec<f64>>())
        })
    }

    pub fn stationary_statistics(&self) -> Result<EnsembleStatistics<Vec<f64>>> {
        self.aggregate(|sample| Ok(stationary_distribution(sample)?.as_slice().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msm::connectivity::ConnectivityError;
    use crate::msm::count_matrix::CountError;
    use crate::msm::pcca::PccaError;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_basin_chain() -> TransitionMatrix {
        TransitionMatrix::from_rows(vec![
            vec![0.9, 0.1, 0.0, 0.0],
            vec![0.1, 0.89, 0.01, 0.0],
            vec![0.0, 0.01, 0.89, 0.1],
            vec![0.0, 0.0, 0.1, 0.9],
        ])
        .unwrap()
    }

    fn simulated(seed: u64, n_steps: usize) -> Vec<DiscreteTrajectory> {
        let mut rng = StdRng::seed_from_u64(seed);
        vec![MarkovChain::simulate(&two_basin_chain(), 0, n_steps, &mut rng).unwrap()]
    }

    fn disconnected_trajectories() -> Vec<DiscreteTrajectory> {
        // State 2 is entered once and never left
        vec![
            DiscreteTrajectory::new(vec![0, 1, 0, 0, 1, 1, 0, 1, 2]),
            DiscreteTrajectory::new(vec![1, 0, 1, 1, 0, 0, 1, 0]),
        ]
    }

    #[test]
    fn test_estimate_recovers_chain() {
        let model = MarkovStateModel::estimate(&simulated(3, 200_000), &MsmConfig::default()).unwrap();
        let t = model.transition_matrix();

        assert_eq!(model.active_set().states(), &[0, 1, 2, 3]);
        assert_eq!(model.active_state_fraction(), 1.0);
        assert_abs_diff_eq!(model.active_count_fraction(), 1.0);
        assert_abs_diff_eq!(t[(0, 1)], 0.1, epsilon = 0.01);
        assert_abs_diff_eq!(t[(1, 2)], 0.01, epsilon = 0.005);
        assert!(model.stationary_distribution().stationarity_residual(t) < 1e-8);
        assert_abs_diff_eq!(model.eigenvalues()[0], 1.0, epsilon = 1e-10);

        let timescales = model.timescales(2);
        assert_eq!(timescales.len(), 2);
        assert!(timescales[0] > timescales[1]);
    }

    #[test]
    fn test_partial_connectivity_policy() {
        let mut config = MsmConfig::default();
        match MarkovStateModel::estimate(&disconnected_trajectories(), &config) {
            Err(MsmError::Connectivity(ConnectivityError::PartialConnectivity { active_states, total_states, .. })) => {
                assert_eq!((active_states, total_states), (2, 3));
            }
            other => panic!("Expected PartialConnectivity, got {:?}", other),
        }

        config.connectivity.accept_partial = true;
        let model = MarkovStateModel::estimate(&disconnected_trajectories(), &config).unwrap();
        assert_eq!(model.active_set().states(), &[0, 1]);
        assert_abs_diff_eq!(model.active_state_fraction(), 2.0 / 3.0);
        assert!(model.active_count_fraction() < 1.0);
        assert_eq!(model.full_count_matrix().n_states(), 3);
        assert_eq!(model.count_matrix().n_states(), 2);
    }

    #[test]
    fn test_original_ids_are_mapped() {
        let mut config = MsmConfig::default();
        config.connectivity.accept_partial = true;
        config.estimation.reversible = false;
        let model = MarkovStateModel::estimate(&disconnected_trajectories(), &config).unwrap();

        match model.mfpt(&[0], &[2]) {
            Err(MsmError::StateNotActive { state }) => assert_eq!(state, 2),
            other => panic!("Expected StateNotActive, got {:?}", other),
        }
        assert!(model.mfpt(&[0], &[1]).unwrap() > 0.0);

        let mut rng = StdRng::seed_from_u64(1);
        let dtraj = model.simulate(1, 50, &mut rng).unwrap();
        assert!(dtraj.labels().iter().all(|&state| state < 2));
        assert!(model.simulate(2, 50, &mut rng).is_err());
    }

    #[test]
    fn test_record_round_trip() {
        let model = MarkovStateModel::estimate(&simulated(8, 50_000), &MsmConfig::default()).unwrap();
        let pcca = model.pcca(2).unwrap();
        let record = model.to_record(Some(&pcca));
        assert_eq!(record.pcca.as_ref().map(|p| p.n_sets), Some(2));

        let restored = MarkovStateModel::from_record(&record, &MsmConfig::default()).unwrap();
        assert_eq!(restored.lag(), model.lag());
        assert_eq!(restored.transition_matrix(), model.transition_matrix());
        assert_eq!(restored.active_set(), model.active_set());
        assert_abs_diff_eq!(restored.timescales(1)[0], model.timescales(1)[0], epsilon = 1e-8);

        let stored = restored.stored_pcca().unwrap();
        assert_eq!(stored.memberships(), pcca.memberships());
        assert_eq!(stored.metastable_sets(), pcca.metastable_sets());
        assert!(model.stored_pcca().is_none());
    }

    #[test]
    fn test_stored_memberships_are_used_as_saved() {
        let model = MarkovStateModel::estimate(&simulated(8, 20_000), &MsmConfig::default()).unwrap();
        let mut record = model.to_record(None);
        // Crisp split different from what PCCA+ would find
        record.pcca = Some(PccaRecord {
            n_sets: 2,
            memberships: vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 1.0], vec![0.0, 1.0]],
        });

        let restored = MarkovStateModel::from_record(&record, &MsmConfig::default()).unwrap();
        assert_eq!(restored.stored_pcca().unwrap().metastable_sets(), &[vec![0], vec![1, 2, 3]]);

        record.pcca = Some(PccaRecord { n_sets: 2, memberships: vec![vec![0.7, 0.7]; 4] });
        match MarkovStateModel::from_record(&record, &MsmConfig::default()) {
            Err(MsmError::Pcca(PccaError::InvalidMemberships { state: 0 })) => (),
            other => panic!("Expected InvalidMemberships, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_lag_is_an_invalid_lag() {
        let mut config = MsmConfig::default();
        config.counting.lag = 0;
        match MarkovStateModel::estimate(&simulated(8, 1_000), &config) {
            Err(MsmError::Count(CountError::InvalidLag { lag: 0, .. })) => (),
            other => panic!("Expected InvalidLag, got {:?}", other),
        }
    }

    #[test]
    fn test_inconsistent_record() {
        let model = MarkovStateModel::estimate(&simulated(8, 20_000), &MsmConfig::default()).unwrap();
        let mut record = model.to_record(None);
        record.stationary.pop();
        match MarkovStateModel::from_record(&record, &MsmConfig::default()) {
            Err(MsmError::InvalidMatrix(_)) | Err(MsmError::InconsistentRecord { .. }) => (),
            other => panic!("Expected an inconsistent record error, got {:?}", other),
        }

        let mut record = model.to_record(None);
        record.n_states = 7;
        match MarkovStateModel::from_record(&record, &MsmConfig::default()) {
            Err(MsmError::InconsistentRecord { .. }) => (),
            other => panic!("Expected InconsistentRecord, got {:?}", other),
        }
    }

    #[test]
    fn test_bayesian_statistics() {
        let mut config = MsmConfig::default();
        config.bayesian.n_samples = 20;
        config.bayesian.seed = Some(11);
        let model = BayesianMarkovStateModel::sample(&simulated(5, 50_000), &config, &CancellationToken::new()).unwrap();
        assert_eq!(model.ensemble().len(), 20);

        let pi = model.stationary_statistics().unwrap();
        assert_eq!(pi.mean.len(), 4);
        assert_abs_diff_eq!(pi.mean.iter().sum::<f64>(), 1.0, epsilon = 1e-8);
        for state in 0..4 {
            assert!(pi.lower[state] <= pi.mean[state] && pi.mean[state] <= pi.upper[state]);
        }

        let timescales = model.timescales_statistics(1).unwrap();
        assert_eq!(timescales.n_samples, 20);
        assert!(timescales.std[0] > 0.0);
    }
}
