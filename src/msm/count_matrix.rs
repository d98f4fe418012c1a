use std::collections::HashMap;

use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::dtraj::DiscreteTrajectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountMode {
    #[default]
    Sliding, // Every frame t starts a transition t -> t + lag
    Sample,  // Only frames 0, lag, 2 lag, ... (statistically independent counts)
}

/// Transition counts between discrete states observed at a fixed lag.
#[derive(Debug, Clone, PartialEq)]
pub struct CountMatrix {
    counts: DMatrix<u64>,
    lag: usize,
}

impl CountMatrix {
    pub fn from_matrix(counts: DMatrix<u64>, lag: usize) -> Result<Self, CountError> {
        if counts.nrows() != counts.ncols() {
            return Err(CountError::NotSquare { rows: counts.nrows(), cols: counts.ncols() });
        }
        if lag < 1 {
            return Err(CountError::InvalidLag { lag, longest_trajectory: None });
        }
        Ok(Self { counts, lag })
    }

    pub fn from_rows(rows: Vec<Vec<u64>>, lag: usize) -> Result<Self, CountError> {
        let n = rows.len();
        if let Some(row) = rows.iter().find(|row| row.len() != n) {
            return Err(CountError::NotSquare { rows: n, cols: row.len() });
        }
        Self::from_matrix(DMatrix::from_fn(n, n, |i, j| rows[i][j]), lag)
    }

    pub fn n_states(&self) -> usize {
        self.counts.nrows()
    }

    pub fn lag(&self) -> usize {
        self.lag
    }

    pub fn get(&self, from: usize, to: usize) -> u64 {
        self.counts[(from, to)]
    }

    pub fn as_matrix(&self) -> &DMatrix<u64> {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn row_sums(&self) -> Vec<u64> {
        self.counts.row_iter().map(|row| row.iter().sum()).collect()
    }

    pub fn to_f64(&self) -> DMatrix<f64> {
        self.counts.map(|count| count as f64)
    }

    // Sum of the counts between states of the given subset
    pub fn count_within(&self, states: &[usize]) -> Result<u64, CountError> {
        self.check_states(states)?;
        Ok(states
            .iter()
            .map(|&i| states.iter().map(|&j| self.counts[(i, j)]).sum::<u64>())
            .sum())
    }

    // Counts restricted to a subset of states, re-indexed in the subset order
    pub fn submatrix(&self, states: &[usize]) -> Result<CountMatrix, CountError> {
        self.check_states(states)?;
        let k = states.len();
        let counts = DMatrix::from_fn(k, k, |i, j| self.counts[(states[i], states[j])]);
        Ok(CountMatrix { counts, lag: self.lag })
    }

    fn check_states(&self, states: &[usize]) -> Result<(), CountError> {
        let n = self.n_states();
        match states.iter().find(|&&state| state >= n) {
            Some(&state) => Err(CountError::StateOutOfRange { state, n_states: n }),
            None => Ok(()),
        }
    }
}

/// Builds a [`CountMatrix`] from discrete trajectories at a fixed lag.
///
/// Each trajectory is counted on its own, so no transition ever crosses the end
/// of one trajectory into the start of the next.
#[derive(Debug, Clone)]
pub struct CountMatrixBuilder {
    lag: usize,
    mode: CountMode,
    n_states: Option<usize>,
}

impl CountMatrixBuilder {
    pub fn new(lag: usize) -> Self {
        Self { lag, mode: CountMode::default(), n_states: None }
    }

    pub fn with_mode(mut self, mode: CountMode) -> Self {
        self.mode = mode;
        self
    }

    // Force the matrix size, e.g. to keep states that were never visited
    pub fn with_n_states(mut self, n_states: usize) -> Self {
        self.n_states = Some(n_states);
        self
    }

    pub fn build(&self, dtrajs: &[DiscreteTrajectory]) -> Result<CountMatrix, CountError> {
        if dtrajs.is_empty() {
            return Err(CountError::NoTrajectories);
        }

        let longest = dtrajs.iter().map(|dtraj| dtraj.len()).max().unwrap_or(0);
        if self.lag < 1 || self.lag >= longest {
            return Err(CountError::InvalidLag { lag: self.lag, longest_trajectory: Some(longest) });
        }

        let observed_states = dtrajs.iter().filter_map(|dtraj| dtraj.max_state()).max().map_or(0, |max| max + 1);
        let n_states = match self.n_states {
            Some(n) if n < observed_states => {
                return Err(CountError::StateOutOfRange { state: observed_states - 1, n_states: n });
            }
            Some(n) => n,
            None => observed_states,
        };

        // One sparse count table per trajectory, summed afterwards
        let sparse = dtrajs
            .par_iter()
            .map(|dtraj| self.count_trajectory(dtraj.labels()))
            .reduce(HashMap::new, merge_counts);

        let mut counts = DMatrix::<u64>::zeros(n_states, n_states);
        for ((from, to), count) in sparse {
            counts[(from, to)] += count;
        }

        let matrix = CountMatrix { counts, lag: self.lag };
        log::debug!(
            "Counted {} transitions over {} trajectories at lag {} ({} states, {:?} mode)",
            matrix.total(),
            dtrajs.len(),
            self.lag,
            n_states,
            self.mode
        );

        Ok(matrix)
    }

    fn count_trajectory(&self, labels: &[usize]) -> HashMap<(usize, usize), u64> {
        let mut counts = HashMap::new();
        if labels.len() <= self.lag {
            return counts;
        }

        let step = match self.mode {
            CountMode::Sliding => 1,
            CountMode::Sample => self.lag,
        };

        for t in (0..labels.len() - self.lag).step_by(step) {
            *counts.entry((labels[t], labels[t + self.lag])).or_insert(0) += 1;
        }

        counts
    }
}

fn merge_counts(
    mut left: HashMap<(usize, usize), u64>,
    right: HashMap<(usize, usize), u64>,
) -> HashMap<(usize, usize), u64> {
    for (key, count) in right {
        *left.entry(key).or_insert(0) += count;
    }
    left
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CountError {
    #[error("invalid lag {lag}: must be >= 1 and shorter than the longest trajectory ({longest_trajectory:?} frames)")]
    InvalidLag { lag: usize, longest_trajectory: Option<usize> },
    #[error("no trajectories were given")]
    NoTrajectories,
    #[error("state {state} is out of range for {n_states} states")]
    StateOutOfRange { state: usize, n_states: usize },
    #[error("count matrix must be square, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dtraj(labels: &[usize]) -> DiscreteTrajectory {
        DiscreteTrajectory::new(labels.to_vec())
    }

    #[test]
    fn test_sliding_counts_lag_one() {
        let counts = CountMatrixBuilder::new(1).build(&[dtraj(&[0, 0, 1, 1, 0])]).unwrap();
        assert_eq!(counts.n_states(), 2);
        assert_eq!(counts.get(0, 0), 1);
        assert_eq!(counts.get(0, 1), 1);
        assert_eq!(counts.get(1, 1), 1);
        assert_eq!(counts.get(1, 0), 1);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_no_transitions_across_trajectory_boundaries() {
        let counts = CountMatrixBuilder::new(1).build(&[dtraj(&[0, 0, 0]), dtraj(&[1, 1, 1])]).unwrap();
        assert_eq!(counts.get(0, 0), 2);
        assert_eq!(counts.get(1, 1), 2);
        assert_eq!(counts.get(0, 1), 0);
        assert_eq!(counts.get(1, 0), 0);
    }

    #[test]
    fn test_sliding_counts_longer_lag() {
        // Pairs at lag 2: (0,2), (1,0), (2,1)
        let counts = CountMatrixBuilder::new(2).build(&[dtraj(&[0, 1, 2, 0, 1])]).unwrap();
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.get(0, 2), 1);
        assert_eq!(counts.get(1, 0), 1);
        assert_eq!(counts.get(2, 1), 1);
    }

    #[test]
    fn test_sample_mode_skips_frames() {
        // Pairs at lag 2 starting at t = 0, 2: (0,2), (2,1)
        let counts = CountMatrixBuilder::new(2)
            .with_mode(CountMode::Sample)
            .build(&[dtraj(&[0, 1, 2, 0, 1])])
            .unwrap();
        assert_eq!(counts.total(), 2);
        assert_eq!(counts.get(0, 2), 1);
        assert_eq!(counts.get(2, 1), 1);
    }

    #[test]
    fn test_short_trajectories_are_skipped() {
        let counts = CountMatrixBuilder::new(3).build(&[dtraj(&[0, 1]), dtraj(&[1, 1, 0, 0, 1])]).unwrap();
        assert_eq!(counts.total(), 2);
        assert_eq!(counts.get(1, 0), 1);
        assert_eq!(counts.get(1, 1), 1);
    }

    #[test]
    fn test_invalid_lag_zero() {
        match CountMatrixBuilder::new(0).build(&[dtraj(&[0, 1, 0])]) {
            Err(CountError::InvalidLag { lag: 0, .. }) => (),
            other => panic!("Expected InvalidLag error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_lag_longer_than_every_trajectory() {
        match CountMatrixBuilder::new(5).build(&[dtraj(&[0, 1, 0]), dtraj(&[1, 0, 1, 1, 0])]) {
            Err(CountError::InvalidLag { lag: 5, longest_trajectory: Some(5) }) => (),
            other => panic!("Expected InvalidLag error, got {:?}", other),
        }
    }

    #[test]
    fn test_no_trajectories() {
        assert_eq!(CountMatrixBuilder::new(1).build(&[]), Err(CountError::NoTrajectories));
    }

    #[test]
    fn test_n_states_override() {
        let counts = CountMatrixBuilder::new(1).with_n_states(4).build(&[dtraj(&[0, 1, 0])]).unwrap();
        assert_eq!(counts.n_states(), 4);
        assert_eq!(counts.row_sums(), vec![1, 1, 0, 0]);

        match CountMatrixBuilder::new(1).with_n_states(1).build(&[dtraj(&[0, 1, 0])]) {
            Err(CountError::StateOutOfRange { state: 1, n_states: 1 }) => (),
            other => panic!("Expected StateOutOfRange error, got {:?}", other),
        }
    }

    #[test]
    fn test_many_trajectories_sum_up() {
        let dtrajs: Vec<DiscreteTrajectory> = (0..50).map(|_| dtraj(&[0, 1, 0, 1])).collect();
        let counts = CountMatrixBuilder::new(1).build(&dtrajs).unwrap();
        assert_eq!(counts.get(0, 1), 100);
        assert_eq!(counts.get(1, 0), 50);
    }

    #[test]
    fn test_submatrix_reindexes() {
        let counts = CountMatrix::from_rows(vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]], 1).unwrap();
        let sub = counts.submatrix(&[0, 2]).unwrap();
        assert_eq!(sub.get(0, 0), 1);
        assert_eq!(sub.get(0, 1), 3);
        assert_eq!(sub.get(1, 0), 7);
        assert_eq!(sub.get(1, 1), 9);
        assert_eq!(counts.count_within(&[0, 2]), Ok(20));
        assert!(counts.submatrix(&[3]).is_err());
    }

    #[test]
    fn test_count_within_checks_bounds() {
        let counts = CountMatrix::from_rows(vec![vec![1, 2], vec![3, 4]], 1).unwrap();
        assert_eq!(counts.count_within(&[]), Ok(0));
        assert_eq!(counts.count_within(&[1, 5]), Err(CountError::StateOutOfRange { state: 5, n_states: 2 }));
    }
}
