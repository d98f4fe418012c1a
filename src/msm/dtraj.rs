use serde::{Deserialize, Serialize};

/// Sequence of discrete state labels, one per saved frame.
///
/// Produced by an external discretizer (e.g. k-means on featurized coordinates).
/// Immutable once handed to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscreteTrajectory {
    labels: Vec<usize>,
}

impl DiscreteTrajectory {
    pub fn new(labels: Vec<usize>) -> Self {
        Self { labels }
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn max_state(&self) -> Option<usize> {
        self.labels.iter().copied().max()
    }

    // Number of frames spent in each state. Labels >= n_states are ignored
    pub fn histogram(&self, n_states: usize) -> Vec<usize> {
        let mut counts = vec![0_usize; n_states];
        self.labels
            .iter()
            .filter(|&&label| label < n_states)
            .for_each(|&label| counts[label] += 1);
        counts
    }
}

impl From<Vec<usize>> for DiscreteTrajectory {
    fn from(labels: Vec<usize>) -> Self {
        Self::new(labels)
    }
}

impl AsRef<[usize]> for DiscreteTrajectory {
    fn as_ref(&self) -> &[usize] {
        &self.labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let dtraj = DiscreteTrajectory::new(vec![0, 1, 1, 2, 1, 0]);
        assert_eq!(dtraj.histogram(3), vec![2, 3, 1]);
        assert_eq!(dtraj.histogram(2), vec![2, 3]);
    }

    #[test]
    fn test_max_state() {
        assert_eq!(DiscreteTrajectory::new(vec![3, 1, 4]).max_state(), Some(4));
        assert_eq!(DiscreteTrajectory::new(Vec::new()).max_state(), None);
    }

    #[test]
    fn test_json_is_a_plain_array() {
        let dtraj = DiscreteTrajectory::from(vec![0, 2, 1]);
        let json = serde_json::to_string(&dtraj).unwrap();
        assert_eq!(json, "[0,2,1]");
        let back: DiscreteTrajectory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dtraj);
    }
}
