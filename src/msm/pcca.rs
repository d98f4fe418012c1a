use nalgebra::DMatrix;
use thiserror::Error;

use crate::optimization::nelder_mead::{NelderMead, NelderMeadError};
use crate::optimization::optimizer::Optimizer;

use super::config::PccaConfig;
use super::spectral::{SpectralDecomposition, SpectralError};
use super::transition_matrix::TransitionMatrix;

/// Fuzzy metastable decomposition from PCCA+.
///
/// Set indices follow the smallest state hard-assigned to each set, so the set
/// containing state 0 is always set 0.
#[derive(Debug, Clone, PartialEq)]
pub struct PccaDecomposition {
    memberships: DMatrix<f64>, // n x k, rows sum to one
    rotation: DMatrix<f64>,
    assignments: Vec<usize>,
    metastable_sets: Vec<Vec<usize>>,
    set_probabilities: Vec<f64>,
    centers: Vec<usize>,
    distributions: DMatrix<f64>, // k x n, rows are the metastable distributions
    coarse_grained: DMatrix<f64>,
    crispness: f64,
    spectral_gap: f64,
}

impl PccaDecomposition {
    pub fn n_sets(&self) -> usize {
        self.memberships.ncols()
    }

    pub fn memberships(&self) -> &DMatrix<f64> {
        &self.memberships
    }

    pub fn membership(&self, state: usize, set: usize) -> f64 {
        self.memberships[(state, set)]
    }

    pub fn rotation(&self) -> &DMatrix<f64> {
        &self.rotation
    }

    pub fn assignments(&self) -> &[usize] {
        &self.assignments
    }

    pub fn metastable_sets(&self) -> &[Vec<usize>] {
        &self.metastable_sets
    }

    pub fn set_probabilities(&self) -> &[f64] {
        &self.set_probabilities
    }

    pub fn centers(&self) -> &[usize] {
        &self.centers
    }

    pub fn metastable_distributions(&self) -> &DMatrix<f64> {
        &self.distributions
    }

    pub fn coarse_grained_transition_matrix(&self) -> &DMatrix<f64> {
        &self.coarse_grained
    }

    // Objective value divided by the number of sets; 1 means fully crisp
    pub fn crispness(&self) -> f64 {
        self.crispness
    }

    pub fn spectral_gap(&self) -> f64 {
        self.spectral_gap
    }

    /// Rebuilds a decomposition from stored memberships without optimizing.
    ///
    /// The rotation is recovered as the least-squares solution of `X A = chi`.
    pub fn from_memberships(
        transition_matrix: &TransitionMatrix,
        spectral: &SpectralDecomposition,
        memberships: DMatrix<f64>,
    ) -> Result<Self, PccaError> {
        let (n, k) = memberships.shape();
        if n != transition_matrix.n_states() || k < 2 || k > n {
            return Err(PccaError::InvalidStateCount { requested: k, n_states: transition_matrix.n_states() });
        }
        if let Some(state) = memberships.row_iter().position(|row| {
            row.iter().any(|value| !(0.0..=1.0).contains(value)) || (row.sum() - 1.0).abs() > MEMBERSHIP_TOLERANCE
        }) {
            return Err(PccaError::InvalidMemberships { state });
        }

        let spectral_gap = spectral_gap(spectral, k, n)?;
        let eigenvectors = spectral.right_eigenvectors(k)?;
        let rotation = eigenvectors.pseudo_inverse(f64::EPSILON).map_err(|_| PccaError::SingularRotation)? * &memberships;

        finish(transition_matrix, spectral, memberships, rotation, spectral_gap)
    }
}

const MEMBERSHIP_TOLERANCE: f64 = 1e-8;

// |lambda_k| - |lambda_k+1|, with lambda_n+1 = 0
fn spectral_gap(spectral: &SpectralDecomposition, k: usize, n: usize) -> Result<f64, PccaError> {
    let moduli = spectral.moduli();
    let next = match moduli.get(k) {
        Some(&modulus) => modulus,
        None if k == n => 0.0,
        None => return Err(SpectralError::InsufficientEigenpairs { requested: k + 1, available: moduli.len() }.into()),
    };
    Ok(moduli[k - 1] - next)
}

/// PCCA+ (Roeblitz and Weber, Adv. Data Anal. Classif. 7, 147 (2013)).
///
/// The first k right eigenvectors `X` are rotated into memberships `X A`.
/// `A` starts from the inner simplex algorithm and is then refined by
/// Nelder-Mead, maximizing `sum_ij A_ji^2 / A_0i` over the feasible set.
#[derive(Debug, Clone)]
pub struct PccaDecomposer {
    n_sets: usize,
    min_spectral_gap: f64,
}

impl PccaDecomposer {
    pub fn new(n_sets: usize) -> Self {
        Self { n_sets, min_spectral_gap: PccaConfig::default().min_spectral_gap }
    }

    pub fn from_config(config: &PccaConfig) -> Self {
        Self { n_sets: config.n_sets, min_spectral_gap: config.min_spectral_gap }
    }

    pub fn with_min_spectral_gap(mut self, min_spectral_gap: f64) -> Self {
        self.min_spectral_gap = min_spectral_gap;
        self
    }

    pub fn decompose(
        &self,
        transition_matrix: &TransitionMatrix,
        spectral: &SpectralDecomposition,
    ) -> Result<PccaDecomposition, PccaError> {
        let n = transition_matrix.n_states();
        let k = self.n_sets;
        if k < 2 || k > n {
            return Err(PccaError::InvalidStateCount { requested: k, n_states: n });
        }

        let pairs = spectral.eigenpairs();
        if let Some(index) = pairs.iter().take(k).position(|pair| !pair.is_real()) {
            return Err(PccaError::ComplexEigenvalues { index });
        }

        let spectral_gap = spectral_gap(spectral, k, n)?;

        let eigenvectors = spectral.right_eigenvectors(k)?;
        let decomposition = self.rotate(transition_matrix, spectral, &eigenvectors, spectral_gap)?;

        log::info!(
            "PCCA+ with {} sets: crispness {:.4}, set probabilities {:?}",
            k,
            decomposition.crispness,
            decomposition.set_probabilities
        );

        if spectral_gap < self.min_spectral_gap {
            log::warn!(
                "Spectral gap |lambda_{}| - |lambda_{}| = {:.4} is below {}; the {} sets are not well separated",
                k,
                k + 1,
                spectral_gap,
                self.min_spectral_gap,
                k
            );
            return Err(PccaError::InsufficientSpectralGap {
                requested: k,
                gap: spectral_gap,
                decomposition: Box::new(decomposition),
            });
        }

        Ok(decomposition)
    }

    fn rotate(
        &self,
        transition_matrix: &TransitionMatrix,
        spectral: &SpectralDecomposition,
        eigenvectors: &DMatrix<f64>,
        spectral_gap: f64,
    ) -> Result<PccaDecomposition, PccaError> {
        let k = eigenvectors.ncols();

        let initial = inner_simplex_rotation(eigenvectors)?;
        let rotation = optimize_rotation(eigenvectors, &initial)?;

        let mut memberships = eigenvectors * &rotation;
        memberships.apply(|value| *value = value.clamp(0.0, 1.0));
        for mut row in memberships.row_iter_mut() {
            let sum = row.sum();
            if sum > 0.0 {
                row /= sum;
            } else {
                row.fill(1.0 / k as f64);
            }
        }

        finish(transition_matrix, spectral, memberships, rotation, spectral_gap)
    }
}

// Orders the sets and derives everything that follows from the memberships
fn finish(
    transition_matrix: &TransitionMatrix,
    spectral: &SpectralDecomposition,
    memberships: DMatrix<f64>,
    rotation: DMatrix<f64>,
    spectral_gap: f64,
) -> Result<PccaDecomposition, PccaError> {
    let (n, k) = memberships.shape();

    // Reorder the sets by their smallest hard-assigned state
    let raw_assignments = hard_assignments(&memberships);
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by_key(|&set| raw_assignments.iter().position(|&assigned| assigned == set).unwrap_or(n));
    let memberships = DMatrix::from_fn(n, k, |i, s| memberships[(i, order[s])]);
    let rotation = DMatrix::from_fn(k, k, |i, s| rotation[(i, order[s])]);

    let assignments = hard_assignments(&memberships);
    let mut metastable_sets = vec![Vec::new(); k];
    for (state, &set) in assignments.iter().enumerate() {
        metastable_sets[set].push(state);
    }

    let pi = spectral.stationary();
    let set_probabilities: Vec<f64> = metastable_sets.iter().map(|set| pi.mass(set)).collect();

    let centers: Vec<usize> = (0..k)
        .map(|s| {
            memberships
                .column(s)
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map_or(0, |(state, _)| state)
        })
        .collect();

    // mu_s(i) = pi_i chi_is / sum_j pi_j chi_js
    let mut distributions = DMatrix::from_fn(k, n, |s, i| pi[i] * memberships[(i, s)]);
    for mut row in distributions.row_iter_mut() {
        let mass = row.sum();
        if mass > 0.0 {
            row /= mass;
        }
    }

    let coarse_grained = coarse_grain(transition_matrix, pi.as_slice(), &memberships)?;
    let crispness = crispness_objective(&rotation) / k as f64;

    Ok(PccaDecomposition {
        memberships,
        rotation,
        assignments,
        metastable_sets,
        set_probabilities,
        centers,
        distributions,
        coarse_grained,
        crispness,
        spectral_gap,
    })
}

// Inner simplex algorithm: pick k states spanning the simplex of eigenvector rows
fn inner_simplex_rotation(eigenvectors: &DMatrix<f64>) -> Result<DMatrix<f64>, PccaError> {
    let n = eigenvectors.nrows();
    let k = eigenvectors.ncols();

    let mut vertices = Vec::with_capacity(k);
    let first = (0..n)
        .max_by(|&a, &b| eigenvectors.row(a).norm().total_cmp(&eigenvectors.row(b).norm()).then(b.cmp(&a)))
        .ok_or(PccaError::SingularRotation)?;
    vertices.push(first);

    let mut orthogonal = eigenvectors.clone();
    let anchor = eigenvectors.row(first).clone_owned();
    for mut row in orthogonal.row_iter_mut() {
        row -= &anchor;
    }

    for _ in 1..k {
        let previous = orthogonal.row(*vertices.last().ok_or(PccaError::SingularRotation)?).clone_owned();
        let mut best: Option<(usize, f64)> = None;
        for i in 0..n {
            let projection = previous.dot(&orthogonal.row(i));
            let updated = orthogonal.row(i) - &previous * projection;
            orthogonal.set_row(i, &updated);

            let distance = updated.norm();
            if !vertices.contains(&i) && best.map_or(true, |(_, max)| distance > max) {
                best = Some((i, distance));
            }
        }

        let (vertex, distance) = best.ok_or(PccaError::SingularRotation)?;
        if distance <= f64::EPSILON {
            return Err(PccaError::SingularRotation);
        }
        orthogonal /= distance;
        vertices.push(vertex);
    }

    let simplex = DMatrix::from_fn(k, k, |i, j| eigenvectors[(vertices[i], j)]);
    simplex.try_inverse().ok_or(PccaError::SingularRotation)
}

// Feasible rotation from its lower right (k-1) x (k-1) block
fn fill_rotation(crop: &DMatrix<f64>, eigenvectors: &DMatrix<f64>) -> DMatrix<f64> {
    let k = crop.nrows() + 1;
    let n = eigenvectors.nrows();

    // First column makes every row of A (below the first) sum to zero
    let mut rotation = DMatrix::<f64>::zeros(k, k);
    for i in 1..k {
        let row_sum: f64 = crop.row(i - 1).sum();
        rotation[(i, 0)] = -row_sum;
        for j in 1..k {
            rotation[(i, j)] = crop[(i - 1, j - 1)];
        }
    }

    // First row keeps every membership non-negative
    for j in 0..k {
        rotation[(0, j)] = (0..n)
            .map(|state| -(1..k).map(|l| eigenvectors[(state, l)] * rotation[(l, j)]).sum::<f64>())
            .fold(f64::NEG_INFINITY, f64::max);
    }

    let total: f64 = rotation.row(0).sum();
    rotation / total
}

fn crispness_objective(rotation: &DMatrix<f64>) -> f64 {
    let k = rotation.ncols();
    (0..k)
        .map(|i| (0..k).map(|j| rotation[(j, i)].powi(2)).sum::<f64>() / rotation[(0, i)])
        .sum()
}

fn optimize_rotation(eigenvectors: &DMatrix<f64>, initial: &DMatrix<f64>) -> Result<DMatrix<f64>, PccaError> {
    let k = eigenvectors.ncols();
    let size = (k - 1) * (k - 1);
    let unpack = |values: &[f64]| DMatrix::from_row_slice(k - 1, k - 1, values);

    let objective = |values: &[f64]| {
        let value = -crispness_objective(&fill_rotation(&unpack(values), eigenvectors));
        if value.is_finite() {
            value
        } else {
            f64::INFINITY
        }
    };

    let start: Vec<f64> = initial.view((1, 1), (k - 1, k - 1)).transpose().iter().copied().collect();
    let mut optimizer = NelderMead::with_default_termination(size, objective);
    optimizer.set_initial_point(start)?;
    optimizer.run()?;

    let (best, fitness) = optimizer.get_best_solution().ok_or(PccaError::SingularRotation)?;
    log::debug!("PCCA+ rotation optimized in {} iterations (objective {:.6})", optimizer.iterations(), -fitness);

    Ok(fill_rotation(&unpack(best), eigenvectors))
}

fn hard_assignments(memberships: &DMatrix<f64>) -> Vec<usize> {
    memberships
        .row_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (set, &value)| if value > best.1 { (set, value) } else { best })
                .0
        })
        .collect()
}

// (chi^T D chi)^-1 chi^T D P chi
fn coarse_grain(
    transition_matrix: &TransitionMatrix,
    stationary: &[f64],
    memberships: &DMatrix<f64>,
) -> Result<DMatrix<f64>, PccaError> {
    let n = memberships.nrows();
    let weighted = DMatrix::from_fn(n, memberships.ncols(), |i, s| stationary[i] * memberships[(i, s)]);
    let overlap = weighted.tr_mul(memberships);
    let propagated = weighted.tr_mul(&(transition_matrix.as_matrix() * memberships));

    overlap.lu().solve(&propagated).ok_or(PccaError::SingularCoarseGraining)
}

#[derive(Debug, Error)]
pub enum PccaError {
    #[error("cannot split {n_states} states into {requested} metastable sets (need 2 <= k <= n)")]
    InvalidStateCount { requested: usize, n_states: usize },
    #[error("eigenvalue {index} is complex; PCCA+ needs real leading eigenvectors")]
    ComplexEigenvalues { index: usize },
    #[error("spectral gap {gap:.4} after {requested} eigenvalues is too small for a reliable decomposition")]
    InsufficientSpectralGap { requested: usize, gap: f64, decomposition: Box<PccaDecomposition> },
    #[error("eigenvector simplex is degenerate")]
    SingularRotation,
    #[error("membership overlap matrix is singular")]
    SingularCoarseGraining,
    #[error("memberships of state {state} are not a probability vector")]
    InvalidMemberships { state: usize },
    #[error(transparent)]
    Spectral(#[from] SpectralError),
    #[error("rotation optimization failed: {0}")]
    Optimization(#[from] NelderMeadError),
}

impl PccaError {
    // The decomposition computed despite a small gap, if that was the failure
    pub fn into_decomposition(self) -> Option<PccaDecomposition> {
        match self {
            PccaError::InsufficientSpectralGap { decomposition, .. } => Some(*decomposition),
            _ => None,
        }
    }
}
