use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct OptimizationTracker {
    evals: Vec<f64>,
    iters: u32,

    termination_criterium: TerminationCriterium,

    plateau_count: Option<u16>, // Used only for plateau convergence termination criteria
}

impl OptimizationTracker {
    pub fn new(termination_criterium: TerminationCriterium) -> Self {
        let plateau_count = match termination_criterium {
            TerminationCriterium::PlateauConvergence { .. }
            | TerminationCriterium::PlateauConvergenceAbsolute { .. } => Some(0),
            _ => None,
        };

        Self {
            evals: Vec::new(),
            iters: 0,
            termination_criterium,
            plateau_count,
        }
    }

    pub fn reset(&mut self) {
        self.evals = Vec::new();
        self.iters = 0;
        if self.plateau_count.is_some() {
            self.plateau_count = Some(0)
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iters
    }

    pub fn last_eval(&self) -> Option<f64> {
        self.evals.last().copied()
    }

    pub fn termination_criterium(&self) -> &TerminationCriterium {
        &self.termination_criterium
    }

    pub fn max_iterations(&self) -> bool {
        match self.termination_criterium.max_iterations() {
            Some(max_iter) => self.iters >= max_iter,
            None => false,
        }
    }

    // Relative or absolute delta between the last two evals
    fn last_delta(&self, relative: bool) -> Option<f64> {
        if self.iters < 2 {
            return None; // Need at least two evaluations to calculate delta
        }

        let curr = self.evals[self.iters as usize - 1];
        let prev = self.evals[self.iters as usize - 2];

        if !relative {
            return Some((curr - prev).abs());
        }

        if prev.abs() < f64::EPSILON {
            return Some(0.0); // Terminate if prev is zero to avoid instability
        }

        Some((curr - prev).abs() / prev.abs())
    }

    pub fn one_step_convergence(&self) -> bool {
        match self.termination_criterium {
            TerminationCriterium::OneStepConvergence { epsilon, .. } => {
                self.last_delta(true).map_or(false, |delta| delta < epsilon)
            }
            TerminationCriterium::OneStepConvergenceAbsolute { epsilon, .. } => {
                self.last_delta(false).map_or(false, |delta| delta < epsilon)
            }
            _ => false,
        }
    }

    pub fn plateau_convergence(&mut self) -> bool {
        let (epsilon, plateau_len, relative) = match self.termination_criterium {
            TerminationCriterium::PlateauConvergence { epsilon, plateau_len, .. } => (epsilon, plateau_len, true),
            TerminationCriterium::PlateauConvergenceAbsolute { epsilon, plateau_len, .. } => (epsilon, plateau_len, false),
            _ => return false,
        };

        let delta = match self.last_delta(relative) {
            Some(delta) => delta,
            None => return false,
        };

        if delta < epsilon {
            self.plateau_count = Some(self.plateau_count.unwrap_or(0) + 1);
        } else {
            self.plateau_count = Some(0);
        }

        self.plateau_count.unwrap_or(0) >= plateau_len
    }

    // The tracked value itself (a residual, an increment) dropped below the threshold
    pub fn threshold_reached(&self) -> bool {
        match self.termination_criterium {
            TerminationCriterium::ThresholdReached { threshold, .. } => {
                self.evals.last().map_or(false, |curr| curr.abs() < threshold)
            }
            _ => false,
        }
    }

    // Register a new evaluation. Returns true if the optimization should stop
    pub fn step(&mut self, new_eval: f64) -> bool {
        self.evals.push(new_eval);
        self.iters += 1;

        self.converged() || self.max_iterations()
    }

    fn converged(&mut self) -> bool {
        self.one_step_convergence() || self.plateau_convergence() || self.threshold_reached()
    }

    // True if the last step stopped because of convergence rather than the iteration budget
    pub fn has_converged(&self) -> bool {
        match self.termination_criterium {
            TerminationCriterium::MaxIterations { .. } => true,
            TerminationCriterium::PlateauConvergence { plateau_len, .. }
            | TerminationCriterium::PlateauConvergenceAbsolute { plateau_len, .. } => {
                self.plateau_count.unwrap_or(0) >= plateau_len
            }
            _ => self.one_step_convergence() || self.threshold_reached(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationCriterium {
    MaxIterations { max_iterations: u32 }, // Stop once max iterations reached
    OneStepConvergence { epsilon: f64, max_iterations: Option<u32> }, // If previous relative improvement is below thresh, stop optimization
    OneStepConvergenceAbsolute { epsilon: f64, max_iterations: Option<u32> }, // If previous absolute improvement is below thresh, stop optimization
    PlateauConvergence { epsilon: f64, plateau_len: u16, max_iterations: Option<u32> }, // If there is a large enough fitness plateau, stop optimization
    PlateauConvergenceAbsolute { epsilon: f64, plateau_len: u16, max_iterations: Option<u32> }, // Same but differences are computed in absolute terms
    ThresholdReached { threshold: f64, max_iterations: Option<u32> }, // Stop once the tracked value is below thresh
}

impl TerminationCriterium {
    pub fn max_iterations(&self) -> Option<u32> {
        match *self {
            TerminationCriterium::MaxIterations { max_iterations } => Some(max_iterations),
            TerminationCriterium::OneStepConvergence { max_iterations, .. }
            | TerminationCriterium::OneStepConvergenceAbsolute { max_iterations, .. }
            | TerminationCriterium::PlateauConvergence { max_iterations, .. }
            | TerminationCriterium::PlateauConvergenceAbsolute { max_iterations, .. }
            | TerminationCriterium::ThresholdReached { max_iterations, .. } => max_iterations,
        }
    }
}

impl Default for TerminationCriterium {
    fn default() -> Self {
        TerminationCriterium::PlateauConvergence { epsilon: 1e-5, plateau_len: 20, max_iterations: Some(500) }
    }
}
