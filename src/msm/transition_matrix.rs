use std::ops::Index;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Rows of a transition matrix must sum to one within this margin
pub const ROW_SUM_TOLERANCE: f64 = 1e-10;

pub trait ProbabilityMatrix {
    // Check if the matrix is valid
    fn validate(&self) -> Result<(), MatrixValidationError>;
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatrixValidationError {
    #[error("matrix must be square, got {rows}x{cols}")]
    IncorrectShape { rows: usize, cols: usize },
    #[error("probability vector sums to {sum} instead of 1")]
    VectorIncorrectSum { sum: f64 },
    #[error("rows {rows:?} do not sum to 1 (sums {sums:?})")]
    RowsIncorrectValues { rows: Vec<usize>, sums: Vec<f64> },
    #[error("matrix is empty")]
    MatrixEmpty,
    #[error("rows {rows:?} are all zero")]
    RowsEmpty { rows: Vec<usize> },
    #[error("entry ({row}, {col}) = {value} is outside [0, 1]")]
    InvalidValue { row: usize, col: usize, value: f64 },
}

/// Row-stochastic matrix over the active set.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionMatrix {
    matrix: DMatrix<f64>,
}

impl TransitionMatrix {
    pub fn new(matrix: DMatrix<f64>) -> Result<Self, MatrixValidationError> {
        let transition_matrix = Self { matrix };
        transition_matrix.validate()?;
        Ok(transition_matrix)
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, MatrixValidationError> {
        let n = rows.len();
        if let Some(row) = rows.iter().find(|row| row.len() != n) {
            return Err(MatrixValidationError::IncorrectShape { rows: n, cols: row.len() });
        }
        Self::new(DMatrix::from_fn(n, n, |i, j| rows[i][j]))
    }

    // Normalize the rows of a nonnegative weight matrix, then validate
    pub fn from_weights(mut weights: DMatrix<f64>) -> Result<Self, MatrixValidationError> {
        for mut row in weights.row_iter_mut() {
            let sum: f64 = row.iter().sum();
            if sum > 0.0 {
                row /= sum;
            }
        }
        Self::new(weights)
    }

    pub fn n_states(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn get(&self, from: usize, to: usize) -> f64 {
        self.matrix[(from, to)]
    }

    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn into_matrix(self) -> DMatrix<f64> {
        self.matrix
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.matrix.row_iter().map(|row| row.iter().copied().collect()).collect()
    }

    // P^k
    pub fn power(&self, k: u32) -> DMatrix<f64> {
        let mut result = DMatrix::<f64>::identity(self.n_states(), self.n_states());
        let mut base = self.matrix.clone();
        let mut exponent = k;
        while exponent > 0 {
            if exponent & 1 == 1 {
                result = &result * &base;
            }
            base = &base * &base;
            exponent >>= 1;
        }
        result
    }

    // max |pi_i P_ij - pi_j P_ji|
    pub fn detailed_balance_violation(&self, stationary: &[f64]) -> f64 {
        let n = self.n_states();
        let mut violation: f64 = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                let forward = stationary[i] * self.matrix[(i, j)];
                let backward = stationary[j] * self.matrix[(j, i)];
                violation = violation.max((forward - backward).abs());
            }
        }
        violation
    }

    pub fn is_reversible(&self, stationary: &[f64], tolerance: f64) -> bool {
        stationary.len() == self.n_states() && self.detailed_balance_violation(stationary) < tolerance
    }

    // Largest deviation of a row sum from one
    pub fn max_row_sum_error(&self) -> f64 {
        self.matrix
            .row_iter()
            .map(|row| (row.sum() - 1.0).abs())
            .fold(0.0, f64::max)
    }
}

impl ProbabilityMatrix for TransitionMatrix {
    // Check if the matrix is valid
    fn validate(&self) -> Result<(), MatrixValidationError> {
        let (rows, cols) = self.matrix.shape();
        if rows != cols {
            return Err(MatrixValidationError::IncorrectShape { rows, cols });
        }
        if rows == 0 {
            return Err(MatrixValidationError::MatrixEmpty);
        }

        let mut empty_rows = Vec::<usize>::new();
        let mut incorrect_rows = Vec::<usize>::new();
        let mut incorrect_sums = Vec::<f64>::new();

        for (i, row) in self.matrix.row_iter().enumerate() {
            // Check if values are valid
            if let Some((j, &value)) = row
                .iter()
                .enumerate()
                .find(|(_, &value)| !(0.0..=1.0 + ROW_SUM_TOLERANCE).contains(&value))
            {
                return Err(MatrixValidationError::InvalidValue { row: i, col: j, value });
            }

            // Check if the row is empty
            if row.iter().all(|&value| value == 0.0) {
                empty_rows.push(i);
                continue;
            }

            // Check if the row doesn't sum to 1.0
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
                incorrect_rows.push(i);
                incorrect_sums.push(sum);
            }
        }

        // Entire matrix is empty
        if empty_rows.len() == rows {
            return Err(MatrixValidationError::MatrixEmpty);
        }
        // Some rows are empty
        if !empty_rows.is_empty() {
            return Err(MatrixValidationError::RowsEmpty { rows: empty_rows });
        }
        // Some rows have incorrect values
        if !incorrect_rows.is_empty() {
            return Err(MatrixValidationError::RowsIncorrectValues { rows: incorrect_rows, sums: incorrect_sums });
        }

        Ok(())
    }
}

impl Index<(usize, usize)> for TransitionMatrix {
    type Output = f64;

    fn index(&self, index: (usize, usize)) -> &Self::Output {
        &self.matrix[index]
    }
}

/// Equilibrium probability of each active state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationaryDistribution {
    values: Vec<f64>,
}

impl StationaryDistribution {
    pub fn new(values: Vec<f64>) -> Result<Self, MatrixValidationError> {
        let distribution = Self { values };
        distribution.validate()?;
        Ok(distribution)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn to_dvector(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.values)
    }

    // Total probability of a set of states (local indices)
    pub fn mass(&self, states: &[usize]) -> f64 {
        states.iter().map(|&state| self.values[state]).sum()
    }

    // || pi^T P - pi^T ||_inf
    pub fn stationarity_residual(&self, transition_matrix: &TransitionMatrix) -> f64 {
        let pi = self.to_dvector();
        let propagated = transition_matrix.as_matrix().tr_mul(&pi);
        (propagated - pi).amax()
    }
}

impl ProbabilityMatrix for StationaryDistribution {
    fn validate(&self) -> Result<(), MatrixValidationError> {
        if self.values.is_empty() {
            return Err(MatrixValidationError::MatrixEmpty);
        }

        // Check if all values are valid
        if let Some((i, &value)) = self
            .values
            .iter()
            .enumerate()
            .find(|(_, &value)| !(0.0..=1.0 + ROW_SUM_TOLERANCE).contains(&value))
        {
            return Err(MatrixValidationError::InvalidValue { row: 0, col: i, value });
        }

        let sum: f64 = self.values.iter().sum();
        if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
            return Err(MatrixValidationError::VectorIncorrectSum { sum });
        }

        Ok(())
    }
}

impl Index<usize> for StationaryDistribution {
    type Output = f64;

    fn index(&self, index: usize) -> &Self::Output {
        &self.values[index]
    }
}

#[cfg(test)]
mod tests_transition_matrix {
    use super::*;

    #[test]
    fn test_transition_matrix_from_rows() {
        let rows = vec![vec![0.5, 0.5], vec![0.3, 0.7]];
        let transition_matrix = TransitionMatrix::from_rows(rows.clone()).unwrap();
        assert_eq!(transition_matrix.to_rows(), rows);
        assert_eq!(transition_matrix[(1, 0)], 0.3);
        assert_eq!(transition_matrix.get(0, 1), 0.5);
    }

    #[test]
    fn test_from_weights_normalizes_rows() {
        let weights = DMatrix::from_row_slice(2, 2, &[8.0, 2.0, 3.0, 7.0]);
        let transition_matrix = TransitionMatrix::from_weights(weights).unwrap();
        assert!((transition_matrix[(0, 0)] - 0.8).abs() < 1e-15);
        assert!((transition_matrix[(1, 1)] - 0.7).abs() < 1e-15);
        assert!(transition_matrix.max_row_sum_error() < ROW_SUM_TOLERANCE);
    }

    #[test]
    fn test_validation_incorrect_shape() {
        let rows = vec![vec![0.5, 0.5], vec![0.3, 0.7], vec![0.1, 0.9]];
        match TransitionMatrix::from_rows(rows) {
            Err(MatrixValidationError::IncorrectShape { rows: 3, cols: 2 }) => (),
            other => panic!("Expected IncorrectShape error, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_matrix_empty() {
        match TransitionMatrix::new(DMatrix::zeros(3, 3)) {
            Err(MatrixValidationError::MatrixEmpty) => (),
            other => panic!("Expected MatrixEmpty error, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_rows_empty() {
        let mut matrix = DMatrix::zeros(3, 3);
        matrix[(0, 0)] = 1.0;
        match TransitionMatrix::new(matrix) {
            Err(MatrixValidationError::RowsEmpty { rows }) => assert_eq!(rows, vec![1, 2]),
            other => panic!("Expected RowsEmpty error, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_incorrect_rows() {
        let rows = vec![vec![0.7, 0.7], vec![0.5, 0.5]];
        match TransitionMatrix::from_rows(rows) {
            Err(MatrixValidationError::RowsIncorrectValues { rows, sums }) => {
                assert_eq!(rows, vec![0]);
                assert!((sums[0] - 1.4).abs() < 1e-12);
            }
            other => panic!("Expected RowsIncorrectValues error, got {:?}", other),
        }
    }

    #[test]
    fn test_validation_tolerance_is_tight() {
        let rows = vec![vec![0.5, 0.5 + 1e-9], vec![0.5, 0.5]];
        assert!(TransitionMatrix::from_rows(rows).is_err());
        let rows = vec![vec![0.5, 0.5 + 1e-12], vec![0.5, 0.5]];
        assert!(TransitionMatrix::from_rows(rows).is_ok());
    }

    #[test]
    fn test_validation_invalid_value() {
        let rows = vec![vec![1.5, -0.5], vec![0.5, 0.5]];
        match TransitionMatrix::from_rows(rows) {
            Err(MatrixValidationError::InvalidValue { row: 0, col: 0, value }) => assert_eq!(value, 1.5),
            other => panic!("Expected InvalidValue error, got {:?}", other),
        }
    }

    #[test]
    fn test_power() {
        let transition_matrix = TransitionMatrix::from_rows(vec![vec![0.8, 0.2], vec![0.3, 0.7]]).unwrap();
        let squared = transition_matrix.power(2);
        let expected = transition_matrix.as_matrix() * transition_matrix.as_matrix();
        assert!((squared - expected).amax() < 1e-15);
        assert_eq!(transition_matrix.power(0), DMatrix::identity(2, 2));
    }

    #[test]
    fn test_detailed_balance() {
        let transition_matrix = TransitionMatrix::from_rows(vec![vec![0.8, 0.2], vec![0.3, 0.7]]).unwrap();
        // Every two-state chain is reversible
        assert!(transition_matrix.is_reversible(&[0.6, 0.4], 1e-12));

        let cyclic = TransitionMatrix::from_rows(vec![
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
            vec![1.0, 0.0, 0.0],
        ])
        .unwrap();
        let uniform = [1.0 / 3.0; 3];
        assert!((cyclic.detailed_balance_violation(&uniform) - 1.0 / 3.0).abs() < 1e-12);
    }
}

#[cfg(test)]
mod tests_stationary_distribution {
    use super::*;

    #[test]
    fn test_stationary_distribution_valid() {
        let pi = StationaryDistribution::new(vec![0.6, 0.4]).unwrap();
        assert_eq!(pi.len(), 2);
        assert_eq!(pi[0], 0.6);
        assert!((pi.mass(&[0, 1]) - 1.0).abs() < 1e-15);
    }

    #[test]
    fn test_stationary_distribution_incorrect_sum() {
        match StationaryDistribution::new(vec![0.5, 0.4, 0.4]) {
            Err(MatrixValidationError::VectorIncorrectSum { sum }) => assert!((sum - 1.3).abs() < 1e-12),
            other => panic!("Expected VectorIncorrectSum error, got {:?}", other),
        }
    }

    #[test]
    fn test_stationarity_residual() {
        let transition_matrix = TransitionMatrix::from_rows(vec![vec![0.8, 0.2], vec![0.3, 0.7]]).unwrap();
        let pi = StationaryDistribution::new(vec![0.6, 0.4]).unwrap();
        assert!(pi.stationarity_residual(&transition_matrix) < 1e-15);
    }
}
