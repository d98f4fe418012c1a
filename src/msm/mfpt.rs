use nalgebra::{DMatrix, DVector};

use super::tpt::TptError;
use super::transition_matrix::{StationaryDistribution, TransitionMatrix};

// Expected time to first reach `target` from every state, zero on the target.
// Solves (I - P_rest) m = lag 1 over the remaining states.
pub fn mfpt_to_set(transition_matrix: &TransitionMatrix, target: &[usize], lag: usize) -> Result<DVector<f64>, TptError> {
    let p = transition_matrix.as_matrix();
    let n = p.nrows();
    check_states(target, n, "target")?;

    let rest: Vec<usize> = (0..n).filter(|state| !target.contains(state)).collect();
    let mut times = DVector::<f64>::zeros(n);
    if rest.is_empty() {
        return Ok(times);
    }

    let m = rest.len();
    let system = DMatrix::from_fn(m, m, |a, b| {
        let identity = if a == b { 1.0 } else { 0.0 };
        identity - p[(rest[a], rest[b])]
    });
    let rhs = DVector::from_element(m, lag as f64);

    let solution = system.lu().solve(&rhs).ok_or(TptError::SingularSystem { system: "mean first passage time" })?;
    for (a, &state) in rest.iter().enumerate() {
        times[state] = solution[a];
    }
    Ok(times)
}

// Stationary-weighted mean first passage time from set A into set B
pub fn mfpt_between(
    transition_matrix: &TransitionMatrix,
    stationary: &StationaryDistribution,
    source: &[usize],
    sink: &[usize],
    lag: usize,
) -> Result<f64, TptError> {
    let n = transition_matrix.n_states();
    check_states(source, n, "A")?;
    if let Some(&state) = source.iter().find(|state| sink.contains(state)) {
        return Err(TptError::OverlappingSets { state });
    }

    let times = mfpt_to_set(transition_matrix, sink, lag)?;
    let mass = stationary.mass(source);
    if mass <= 0.0 {
        return Err(TptError::ZeroStationaryProbability { state: source[0] });
    }
    Ok(source.iter().map(|&i| stationary[i] * times[i]).sum::<f64>() / mass)
}

/// Mean first passage times between every ordered pair of sets, zero on the diagonal.
pub fn mfpt_matrix(
    transition_matrix: &TransitionMatrix,
    stationary: &StationaryDistribution,
    sets: &[Vec<usize>],
    lag: usize,
) -> Result<DMatrix<f64>, TptError> {
    let k = sets.len();
    let mut matrix = DMatrix::<f64>::zeros(k, k);
    for (s, source) in sets.iter().enumerate() {
        for (t, sink) in sets.iter().enumerate() {
            if s != t {
                matrix[(s, t)] = mfpt_between(transition_matrix, stationary, source, sink, lag)?;
            }
        }
    }
    Ok(matrix)
}

fn check_states(states: &[usize], n_states: usize, name: &'static str) -> Result<(), TptError> {
    if states.is_empty() {
        return Err(TptError::EmptySet { set: name });
    }
    if let Some(&state) = states.iter().find(|&&state| state >= n_states) {
        return Err(TptError::StateOutOfRange { state, n_states });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn two_state() -> (TransitionMatrix, StationaryDistribution) {
        (
            TransitionMatrix::from_rows(vec![vec![0.8, 0.2], vec![0.3, 0.7]]).unwrap(),
            StationaryDistribution::new(vec![0.6, 0.4]).unwrap(),
        )
    }

    fn two_basin_chain() -> TransitionMatrix {
        TransitionMatrix::from_rows(vec![
            vec![0.9, 0.1, 0.0, 0.0],
            vec![0.1, 0.89, 0.01, 0.0],
            vec![0.0, 0.01, 0.89, 0.1],
            vec![0.0, 0.0, 0.1, 0.9],
        ])
        .unwrap()
    }

    #[test]
    fn test_two_state_passage_times() {
        let (t, pi) = two_state();
        assert_abs_diff_eq!(mfpt_between(&t, &pi, &[0], &[1], 1).unwrap(), 5.0, epsilon = 1e-10);
        assert_abs_diff_eq!(mfpt_between(&t, &pi, &[1], &[0], 1).unwrap(), 1.0 / 0.3, epsilon = 1e-10);
        // Passage times scale with the lag
        assert_abs_diff_eq!(mfpt_between(&t, &pi, &[0], &[1], 10).unwrap(), 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_passage_times_along_chain() {
        let times = mfpt_to_set(&two_basin_chain(), &[3], 1).unwrap();
        assert_abs_diff_eq!(times[0], 240.0, epsilon = 1e-8);
        assert_abs_diff_eq!(times[1], 230.0, epsilon = 1e-8);
        assert_abs_diff_eq!(times[2], 30.0, epsilon = 1e-8);
        assert_eq!(times[3], 0.0);
    }

    #[test]
    fn test_matrix_between_sets() {
        let t = two_basin_chain();
        let pi = StationaryDistribution::new(vec![0.25; 4]).unwrap();
        let matrix = mfpt_matrix(&t, &pi, &[vec![0, 1], vec![2, 3]], 1).unwrap();

        assert_eq!(matrix[(0, 0)], 0.0);
        assert_eq!(matrix[(1, 1)], 0.0);
        // The chain is symmetric under 0 <-> 3, 1 <-> 2
        assert_abs_diff_eq!(matrix[(0, 1)], matrix[(1, 0)], epsilon = 1e-8);
        assert!(matrix[(0, 1)] > 100.0);
    }

    #[test]
    fn test_invalid_sets() {
        let (t, pi) = two_state();
        assert_eq!(mfpt_between(&t, &pi, &[0], &[0], 1).unwrap_err(), TptError::OverlappingSets { state: 0 });
        assert_eq!(mfpt_to_set(&t, &[], 1).unwrap_err(), TptError::EmptySet { set: "target" });
        assert_eq!(mfpt_to_set(&t, &[2], 1).unwrap_err(), TptError::StateOutOfRange { state: 2, n_states: 2 });
    }
}
