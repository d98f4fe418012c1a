/********** Markov State Model (MSM) Module **********
* Estimation and analysis of Markov state models from discrete trajectories,
* following the methodology reviewed in:
*
* "Markov models of molecular kinetics: Generation and validation"
*
* Authors: Jan-Hendrik Prinz, Hao Wu, Marco Sarich, Bettina Keller, Martin Senne,
* Martin Held, John D. Chodera, Christof Schuette and Frank Noe
* Published in: *The Journal of Chemical Physics*, Volume 134, 2011, 174105
* DOI: [10.1063/1.3565032](https://doi.org/10.1063/1.3565032)
*
* Pipeline: trajectories -> counts -> active set -> transition matrix
*           -> spectral analysis -> PCCA+ / TPT / MFPT
**********/

use rand::Rng;
use thiserror::Error;

pub mod errors;
pub mod dtraj;
pub mod count_matrix;
pub mod connectivity;
pub mod transition_matrix;
pub mod estimation;
pub mod bayesian;
pub mod ensemble;
pub mod spectral;
pub mod its;
pub mod pcca;
pub mod tpt;
pub mod mfpt;
pub mod cktest;
pub mod model;
pub mod persistence;
pub mod config;
pub mod cancellation;
pub mod parallel;

use dtraj::DiscreteTrajectory;
use transition_matrix::TransitionMatrix;

pub struct MarkovChain {}

impl MarkovChain {
    // Draws a trajectory of `n_steps` frames starting in `start`
    pub fn simulate(
        transition_matrix: &TransitionMatrix,
        start: usize,
        n_steps: usize,
        rng: &mut impl Rng,
    ) -> Result<DiscreteTrajectory, SimulationError> {
        let n = transition_matrix.n_states();
        if start >= n {
            return Err(SimulationError::StartOutOfRange { start, n_states: n });
        }
        if n_steps == 0 {
            return Err(SimulationError::NoSteps);
        }

        let mut sequence = Vec::with_capacity(n_steps);
        let mut current_state = start;
        sequence.push(current_state);

        for _ in 1..n_steps {
            let random_value: f64 = rng.gen_range(0.0..1.0);
            let transition_probs = transition_matrix.as_matrix().row(current_state);

            let mut cumulative_prob = 0.0;
            let mut next = None;
            for (next_state, &trans_prob) in transition_probs.iter().enumerate() {
                cumulative_prob += trans_prob;
                if random_value < cumulative_prob {
                    next = Some(next_state);
                    break;
                }
            }

            // Rows sum to one only up to round-off
            current_state = match next {
                Some(state) => state,
                None => transition_probs
                    .iter()
                    .enumerate()
                    .filter(|(_, &p)| p > 0.0)
                    .map(|(state, _)| state)
                    .last()
                    .unwrap_or(current_state),
            };
            sequence.push(current_state);
        }

        Ok(DiscreteTrajectory::new(sequence))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("start state {start} is out of range for {n_states} states")]
    StartOutOfRange { start: usize, n_states: usize },
    #[error("a trajectory needs at least one frame")]
    NoSteps,
}
