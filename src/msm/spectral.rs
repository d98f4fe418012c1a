use nalgebra::{Complex, DMatrix, DVector, SymmetricEigen};
use thiserror::Error;

use super::config::SpectralConfig;
use super::transition_matrix::{MatrixValidationError, StationaryDistribution, TransitionMatrix};

const REVERSIBILITY_TOLERANCE: f64 = 1e-8; // Below this violation the symmetrized problem is solved
const LEADING_EIGENVALUE_TOLERANCE: f64 = 1e-10;
const REAL_EIGENVALUE_TOLERANCE: f64 = 1e-12;
const INVERSE_ITERATION_SHIFT: f64 = 1e-10;
const INVERSE_ITERATION_STEPS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct EigenPair {
    pub value: f64,     // Real part of the eigenvalue
    pub imaginary: f64, // Zero for reversible matrices
    pub left: DVector<f64>,
    pub right: DVector<f64>,
}

impl EigenPair {
    pub fn modulus(&self) -> f64 {
        self.value.hypot(self.imaginary)
    }

    pub fn is_real(&self) -> bool {
        self.imaginary.abs() < REAL_EIGENVALUE_TOLERANCE
    }
}

/// Stationary distribution and eigenpairs of a transition matrix, sorted by
/// descending eigenvalue modulus.
///
/// The first pair is normalized so that `left` is the stationary distribution
/// and `right` is the constant one vector. Every pair satisfies `<l_k, r_k> = 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralDecomposition {
    stationary: StationaryDistribution,
    eigenpairs: Vec<EigenPair>,
    reversible: bool,
}

impl SpectralDecomposition {
    pub fn stationary(&self) -> &StationaryDistribution {
        &self.stationary
    }

    pub fn eigenpairs(&self) -> &[EigenPair] {
        &self.eigenpairs
    }

    pub fn eigenvalues(&self) -> Vec<f64> {
        self.eigenpairs.iter().map(|pair| pair.value).collect()
    }

    pub fn moduli(&self) -> Vec<f64> {
        self.eigenpairs.iter().map(EigenPair::modulus).collect()
    }

    pub fn is_reversible(&self) -> bool {
        self.reversible
    }

    pub fn n_states(&self) -> usize {
        self.stationary.len()
    }

    // Implied timescales of every pair after the stationary one
    pub fn timescales(&self, lag: usize) -> Vec<f64> {
        self.eigenpairs
            .iter()
            .skip(1)
            .map(|pair| implied_timescale(pair.modulus(), lag))
            .collect()
    }

    // n x k matrix whose columns are the first k right eigenvectors
    pub fn right_eigenvectors(&self, k: usize) -> Result<DMatrix<f64>, SpectralError> {
        self.check_available(k)?;
        let columns: Vec<DVector<f64>> = self.eigenpairs[..k].iter().map(|pair| pair.right.clone()).collect();
        Ok(DMatrix::from_columns(&columns))
    }

    pub fn left_eigenvectors(&self, k: usize) -> Result<DMatrix<f64>, SpectralError> {
        self.check_available(k)?;
        let columns: Vec<DVector<f64>> = self.eigenpairs[..k].iter().map(|pair| pair.left.clone()).collect();
        Ok(DMatrix::from_columns(&columns))
    }

    fn check_available(&self, k: usize) -> Result<(), SpectralError> {
        if k == 0 || k > self.eigenpairs.len() {
            return Err(SpectralError::InsufficientEigenpairs { requested: k, available: self.eigenpairs.len() });
        }
        Ok(())
    }
}

/// `t = -lag / ln|lambda|`, infinite for eigenvalues of modulus one.
pub fn implied_timescale(modulus: f64, lag: usize) -> f64 {
    let modulus = modulus.abs();
    if modulus >= 1.0 - f64::EPSILON {
        return f64::INFINITY;
    }
    -(lag as f64) / modulus.ln()
}

#[derive(Debug, Clone)]
pub struct SpectralAnalyzer {
    n_eigenpairs: Option<usize>,
    constant_tolerance: f64,
    stationarity_tolerance: f64,
}

impl Default for SpectralAnalyzer {
    fn default() -> Self {
        Self::from_config(&SpectralConfig::default())
    }
}

impl SpectralAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SpectralConfig) -> Self {
        Self {
            n_eigenpairs: config.n_eigenpairs,
            constant_tolerance: config.constant_tolerance,
            stationarity_tolerance: config.stationarity_tolerance,
        }
    }

    pub fn with_n_eigenpairs(mut self, n_eigenpairs: usize) -> Self {
        self.n_eigenpairs = Some(n_eigenpairs);
        self
    }

    pub fn analyze(&self, transition_matrix: &TransitionMatrix) -> Result<SpectralDecomposition, SpectralError> {
        let stationary = solve_stationary(transition_matrix, self.stationarity_tolerance)?;
        let violation = transition_matrix.detailed_balance_violation(stationary.as_slice());
        let reversible = violation < REVERSIBILITY_TOLERANCE && stationary.as_slice().iter().all(|&p| p > 0.0);

        let mut eigenpairs = if reversible {
            self.reversible_eigenpairs(transition_matrix, &stationary)?
        } else {
            self.general_eigenpairs(transition_matrix, &stationary)?
        };

        if let Some(n) = self.n_eigenpairs {
            eigenpairs.truncate(n.max(1));
        }

        log::debug!(
            "Spectral analysis of {} states ({}): leading eigenvalues {:?}",
            transition_matrix.n_states(),
            if reversible { "reversible" } else { "non-reversible" },
            eigenpairs.iter().take(6).map(|pair| pair.value).collect::<Vec<f64>>()
        );

        Ok(SpectralDecomposition { stationary, eigenpairs, reversible })
    }

    // Symmetrize S = D^1/2 P D^-1/2 with D = diag(pi); S has the eigenvalues of P
    fn reversible_eigenpairs(
        &self,
        transition_matrix: &TransitionMatrix,
        stationary: &StationaryDistribution,
    ) -> Result<Vec<EigenPair>, SpectralError> {
        let p = transition_matrix.as_matrix();
        let n = p.nrows();
        let sqrt_pi: Vec<f64> = stationary.as_slice().iter().map(|pi| pi.sqrt()).collect();

        let s = DMatrix::from_fn(n, n, |i, j| sqrt_pi[i] * p[(i, j)] / sqrt_pi[j]);
        let s = (&s + s.transpose()) * 0.5;
        let eigen = SymmetricEigen::new(s);

        let order = sorted_by_modulus(&eigen.eigenvalues.iter().map(|&value| Complex::new(value, 0.0)).collect::<Vec<_>>());

        let mut eigenpairs = Vec::with_capacity(n);
        for (rank, &index) in order.iter().enumerate() {
            if rank == 0 {
                eigenpairs.push(stationary_pair(eigen.eigenvalues[index], 0.0, stationary));
                continue;
            }

            let u = eigen.eigenvectors.column(index);
            let mut left = DVector::from_fn(n, |i, _| u[i] * sqrt_pi[i]);
            let mut right = DVector::from_fn(n, |i, _| u[i] / sqrt_pi[i]);
            orient(&mut left, &mut right);

            eigenpairs.push(EigenPair { value: eigen.eigenvalues[index], imaginary: 0.0, left, right });
        }

        self.check_leading_pair(transition_matrix, &eigenpairs)?;
        Ok(eigenpairs)
    }

    // Schur eigenvalues, then inverse iteration for each left and right vector
    fn general_eigenpairs(
        &self,
        transition_matrix: &TransitionMatrix,
        stationary: &StationaryDistribution,
    ) -> Result<Vec<EigenPair>, SpectralError> {
        let p = transition_matrix.as_matrix();
        let n = p.nrows();
        let eigenvalues: Vec<Complex<f64>> = p.complex_eigenvalues().iter().copied().collect();
        let order = sorted_by_modulus(&eigenvalues);

        let p_complex = p.map(|value| Complex::new(value, 0.0));
        let p_complex_t = p_complex.transpose();

        let mut eigenpairs = Vec::with_capacity(n);
        for (rank, &index) in order.iter().enumerate() {
            let eigenvalue = eigenvalues[index];
            if rank == 0 {
                eigenpairs.push(stationary_pair(eigenvalue.re, eigenvalue.im, stationary));
                continue;
            }

            let right = inverse_iteration(&p_complex, eigenvalue).ok_or(SpectralError::EigenvectorFailure { index: rank })?;
            let left = inverse_iteration(&p_complex_t, eigenvalue).ok_or(SpectralError::EigenvectorFailure { index: rank })?;

            // Biorthonormal scaling <l, r> = 1 without conjugation
            let overlap = left.dot(&right);
            if overlap.norm() < f64::EPSILON {
                return Err(SpectralError::EigenvectorFailure { index: rank });
            }
            let right = right.map(|value| value / overlap);

            // Exact for real eigenvalues; complex pairs keep the real part only
            let mut left = left.map(|value| value.re);
            let mut right = right.map(|value| value.re);
            orient(&mut left, &mut right);

            eigenpairs.push(EigenPair { value: eigenvalue.re, imaginary: eigenvalue.im, left, right });
        }

        self.check_leading_pair(transition_matrix, &eigenpairs)?;
        Ok(eigenpairs)
    }

    // The leading right vector is set to one, so check |P 1 - 1| instead of solver output
    fn check_leading_pair(&self, transition_matrix: &TransitionMatrix, eigenpairs: &[EigenPair]) -> Result<(), SpectralError> {
        let leading = eigenpairs.first().ok_or(SpectralError::EigenvectorFailure { index: 0 })?;
        if (leading.value - 1.0).abs() >= LEADING_EIGENVALUE_TOLERANCE || !leading.is_real() {
            return Err(SpectralError::LeadingEigenvalueNotOne { value: leading.value, imaginary: leading.imaginary });
        }

        let propagated = transition_matrix.as_matrix() * &leading.right;
        let deviation = propagated
            .iter()
            .zip(leading.right.iter())
            .map(|(value, one)| (value - one).abs())
            .fold(0.0, f64::max);
        if deviation >= self.constant_tolerance {
            return Err(SpectralError::RightEigenvectorNotConstant { deviation, tolerance: self.constant_tolerance });
        }
        Ok(())
    }
}

// (lambda_1, pi, 1); the solved eigenvector would carry round-off of order 1/sqrt(pi_i)
fn stationary_pair(value: f64, imaginary: f64, stationary: &StationaryDistribution) -> EigenPair {
    let n = stationary.len();
    EigenPair { value, imaginary, left: stationary.to_dvector(), right: DVector::from_element(n, 1.0) }
}

/// Stationary distribution with the default stationarity tolerance.
pub fn stationary_distribution(transition_matrix: &TransitionMatrix) -> Result<StationaryDistribution, SpectralError> {
    solve_stationary(transition_matrix, SpectralConfig::default().stationarity_tolerance)
}

// Solves pi^T (P - I) = 0 with the last equation replaced by sum(pi) = 1
fn solve_stationary(transition_matrix: &TransitionMatrix, tolerance: f64) -> Result<StationaryDistribution, SpectralError> {
    let p = transition_matrix.as_matrix();
    let n = p.nrows();

    let mut system = p.transpose() - DMatrix::<f64>::identity(n, n);
    system.row_mut(n - 1).fill(1.0);
    let mut rhs = DVector::<f64>::zeros(n);
    rhs[n - 1] = 1.0;

    let solution = system.lu().solve(&rhs).ok_or(SpectralError::SingularStationarySystem)?;

    // Round-off can leave entries like -1e-17
    let clipped: Vec<f64> = solution.iter().map(|&value| value.max(0.0)).collect();
    let total: f64 = clipped.iter().sum();
    if !(total > 0.0) || !total.is_finite() {
        return Err(SpectralError::SingularStationarySystem);
    }
    let stationary = StationaryDistribution::new(clipped.iter().map(|value| value / total).collect())?;

    let residual = stationary.stationarity_residual(transition_matrix);
    if residual >= tolerance {
        return Err(SpectralError::NotStationary { residual, tolerance });
    }

    Ok(stationary)
}

// Indices by descending modulus, larger real part first among ties
fn sorted_by_modulus(eigenvalues: &[Complex<f64>]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        let (ea, eb) = (eigenvalues[a], eigenvalues[b]);
        eb.norm()
            .total_cmp(&ea.norm())
            .then(eb.re.total_cmp(&ea.re))
            .then(eb.im.total_cmp(&ea.im))
    });
    order
}

// Largest component of the right vector made positive
fn orient(left: &mut DVector<f64>, right: &mut DVector<f64>) {
    if let Some(&value) = right.iter().max_by(|a, b| a.abs().total_cmp(&b.abs())) {
        if value < 0.0 {
            *left *= -1.0;
            *right *= -1.0;
        }
    }
}

fn inverse_iteration(matrix: &DMatrix<Complex<f64>>, eigenvalue: Complex<f64>) -> Option<DVector<Complex<f64>>> {
    let n = matrix.nrows();
    let scale = 1.0 + eigenvalue.norm();
    let identity = DMatrix::<Complex<f64>>::identity(n, n);

    // Grow the shift if the shifted matrix happens to be exactly singular
    for attempt in 0..4 {
        let shift = eigenvalue + Complex::new(INVERSE_ITERATION_SHIFT * scale * 10f64.powi(attempt), 0.0);
        let lu = (matrix - &identity * shift).lu();

        let mut vector = DVector::from_fn(n, |i, _| Complex::new(1.0 + 0.1 * i as f64 / n as f64, 0.0));
        let mut converged = true;
        for _ in 0..INVERSE_ITERATION_STEPS {
            match lu.solve(&vector) {
                Some(next) => {
                    let norm = next.norm();
                    if !norm.is_finite() || norm == 0.0 {
                        converged = false;
                        break;
                    }
                    vector = next.unscale(norm);
                }
                None => {
                    converged = false;
                    break;
                }
            }
        }

        if converged {
            return Some(real_phase(vector));
        }
    }
    None
}

// Rotate so the largest component is real and positive
fn real_phase(vector: DVector<Complex<f64>>) -> DVector<Complex<f64>> {
    match vector.iter().max_by(|a, b| a.norm().total_cmp(&b.norm())) {
        Some(&pivot) if pivot.norm() > 0.0 => {
            let rotation = pivot.conj() / pivot.norm();
            vector.map(|value| value * rotation)
        }
        _ => vector,
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpectralError {
    #[error("stationary distribution system is singular")]
    SingularStationarySystem,
    #[error("stationary distribution residual {residual:e} exceeds tolerance {tolerance:e}")]
    NotStationary { residual: f64, tolerance: f64 },
    #[error("leading eigenvalue is {value} + {imaginary}i instead of 1")]
    LeadingEigenvalueNotOne { value: f64, imaginary: f64 },
    #[error("first right eigenvector deviates from the constant vector by {deviation:e} (tolerance {tolerance:e})")]
    RightEigenvectorNotConstant { deviation: f64, tolerance: f64 },
    #[error("could not compute eigenvectors of pair {index}")]
    EigenvectorFailure { index: usize },
    #[error("requested {requested} eigenpairs, {available} available")]
    InsufficientEigenpairs { requested: usize, available: usize },
    #[error(transparent)]
    InvalidMatrix(#[from] MatrixValidationError),
}
