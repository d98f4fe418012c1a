use thiserror::Error;

use super::optimization_tracker::{OptimizationTracker, TerminationCriterium};
use super::optimizer::{FitnessFunction, OptimizationError, Optimizer};

#[derive(Debug, Clone)]
pub struct NelderMeadParameters {
    pub reflection: f64,  // alpha
    pub expansion: f64,   // gamma
    pub contraction: f64, // rho
    pub shrink: f64,      // sigma

    pub initial_relative_step: f64, // Initial simplex edge, relative to the coordinate
    pub initial_zero_step: f64,     // Initial simplex edge for coordinates that are zero

    pub x_tolerance: f64, // Stop when the simplex is this small...
    pub f_tolerance: f64, // ... and the fitness spread is this small
}

impl Default for NelderMeadParameters {
    fn default() -> Self {
        Self {
            reflection: 1.0,
            expansion: 2.0,
            contraction: 0.5,
            shrink: 0.5,
            initial_relative_step: 0.05,
            initial_zero_step: 0.00025,
            x_tolerance: 1e-10,
            f_tolerance: 1e-12,
        }
    }
}

/// Derivative-free downhill simplex minimizer.
pub struct NelderMead<F>
where
    F: FitnessFunction<f64, f64>,
{
    problem_size: usize,
    fitness_function: F,
    parameters: NelderMeadParameters,

    initial_point: Option<Vec<f64>>,
    simplex: Vec<(Vec<f64>, f64)>, // Kept sorted, best vertex first

    best_solution: Option<(Vec<f64>, f64)>,
    tracker: OptimizationTracker,
}

impl<F> NelderMead<F>
where
    F: FitnessFunction<f64, f64>,
{
    pub fn new(problem_size: usize, fitness_function: F, termination_criterium: TerminationCriterium) -> Self {
        Self {
            problem_size,
            fitness_function,
            parameters: NelderMeadParameters::default(),
            initial_point: None,
            simplex: Vec::new(),
            best_solution: None,
            tracker: OptimizationTracker::new(termination_criterium),
        }
    }

    // Default iteration budget follows the usual 200 evaluations per dimension
    pub fn with_default_termination(problem_size: usize, fitness_function: F) -> Self {
        let max_iterations = (200 * problem_size.max(1)) as u32;
        Self::new(problem_size, fitness_function, TerminationCriterium::MaxIterations { max_iterations })
    }

    pub fn set_parameters(&mut self, parameters: NelderMeadParameters) {
        self.parameters = parameters;
    }

    pub fn set_initial_point(&mut self, point: Vec<f64>) -> Result<(), NelderMeadError> {
        if point.len() != self.problem_size {
            return Err(NelderMeadError::DimensionMismatch { expected: self.problem_size, given: point.len() });
        }
        self.initial_point = Some(point);
        Ok(())
    }

    pub fn iterations(&self) -> u32 {
        self.tracker.iterations()
    }

    fn evaluate_point(&self, point: &[f64]) -> Result<f64, NelderMeadError> {
        let value = self.fitness_function.evaluate(point);
        if value.is_nan() {
            return Err(NelderMeadError::NonFiniteFitness);
        }
        Ok(value)
    }

    fn sort_simplex(&mut self) {
        self.simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
    }

    fn centroid(&self) -> Vec<f64> {
        let n = self.problem_size;
        let mut centroid = vec![0.0; n];
        // All vertices but the worst one
        for (vertex, _) in &self.simplex[..n] {
            for (c, v) in centroid.iter_mut().zip(vertex) {
                *c += v;
            }
        }
        centroid.iter_mut().for_each(|c| *c /= n as f64);
        centroid
    }

    // centroid + coefficient * (point - centroid)
    fn along(centroid: &[f64], point: &[f64], coefficient: f64) -> Vec<f64> {
        centroid.iter().zip(point).map(|(c, p)| c + coefficient * (p - c)).collect()
    }

    fn simplex_converged(&self) -> bool {
        let (best, best_fitness) = &self.simplex[0];
        let f_spread = self.simplex.iter().map(|(_, f)| (f - best_fitness).abs()).fold(0.0, f64::max);
        let x_spread = self
            .simplex
            .iter()
            .flat_map(|(vertex, _)| vertex.iter().zip(best).map(|(v, b)| (v - b).abs()))
            .fold(0.0, f64::max);

        f_spread <= self.parameters.f_tolerance && x_spread <= self.parameters.x_tolerance
    }

    fn shrink_towards_best(&mut self) -> Result<(), NelderMeadError> {
        let best = self.simplex[0].0.clone();
        for i in 1..self.simplex.len() {
            let shrunk = Self::along(&best, &self.simplex[i].0, self.parameters.shrink);
            let fitness = self.evaluate_point(&shrunk)?;
            self.simplex[i] = (shrunk, fitness);
        }
        Ok(())
    }
}

impl<F> Optimizer<f64, f64> for NelderMead<F>
where
    F: FitnessFunction<f64, f64>,
{
    type Error = NelderMeadError;

    fn evaluate(&self, individual: &[f64]) -> Result<f64, Self::Error> {
        if individual.len() != self.problem_size {
            return Err(NelderMeadError::DimensionMismatch { expected: self.problem_size, given: individual.len() });
        }
        self.evaluate_point(individual)
    }

    fn initialize(&mut self) -> Result<(), Self::Error> {
        let initial_point = self.initial_point.clone().ok_or(NelderMeadError::InitialPointNotSet)?;

        let mut simplex = Vec::with_capacity(self.problem_size + 1);
        simplex.push((initial_point.clone(), self.evaluate_point(&initial_point)?));

        for i in 0..self.problem_size {
            let mut vertex = initial_point.clone();
            vertex[i] = if vertex[i] != 0.0 {
                vertex[i] * (1.0 + self.parameters.initial_relative_step)
            } else {
                self.parameters.initial_zero_step
            };
            let fitness = self.evaluate_point(&vertex)?;
            simplex.push((vertex, fitness));
        }

        self.simplex = simplex;
        self.sort_simplex();
        self.best_solution = Some(self.simplex[0].clone());
        self.tracker.reset();

        Ok(())
    }

    fn step(&mut self) -> Result<(), Self::Error> {
        if self.simplex.is_empty() {
            return Err(NelderMeadError::NotInitialized);
        }
        if self.problem_size == 0 {
            return Ok(());
        }

        let n = self.problem_size;
        let params = self.parameters.clone();
        let centroid = self.centroid();
        let (worst, worst_fitness) = self.simplex[n].clone();
        let best_fitness = self.simplex[0].1;
        let second_worst_fitness = self.simplex[n - 1].1;

        let reflected = Self::along(&centroid, &worst, -params.reflection);
        let reflected_fitness = self.evaluate_point(&reflected)?;

        if reflected_fitness < best_fitness {
            // Try to go further in the same direction
            let expanded = Self::along(&centroid, &reflected, params.expansion);
            let expanded_fitness = self.evaluate_point(&expanded)?;
            self.simplex[n] = if expanded_fitness < reflected_fitness {
                (expanded, expanded_fitness)
            } else {
                (reflected, reflected_fitness)
            };
        } else if reflected_fitness < second_worst_fitness {
            self.simplex[n] = (reflected, reflected_fitness);
        } else if reflected_fitness < worst_fitness {
            // Outside contraction
            let contracted = Self::along(&centroid, &reflected, params.contraction);
            let contracted_fitness = self.evaluate_point(&contracted)?;
            if contracted_fitness <= reflected_fitness {
                self.simplex[n] = (contracted, contracted_fitness);
            } else {
                self.shrink_towards_best()?;
            }
        } else {
            // Inside contraction
            let contracted = Self::along(&centroid, &worst, params.contraction);
            let contracted_fitness = self.evaluate_point(&contracted)?;
            if contracted_fitness < worst_fitness {
                self.simplex[n] = (contracted, contracted_fitness);
            } else {
                self.shrink_towards_best()?;
            }
        }

        self.sort_simplex();
        self.best_solution = Some(self.simplex[0].clone());

        Ok(())
    }

    fn run(&mut self) -> Result<(), Self::Error> {
        if self.simplex.is_empty() {
            self.initialize()?;
        }

        // A zero dimensional problem has nothing to optimize
        if self.problem_size == 0 {
            return Ok(());
        }

        loop {
            self.step()?;
            let best_fitness = self.simplex[0].1;
            let stop = self.tracker.step(best_fitness);
            if stop || self.simplex_converged() {
                break;
            }
        }

        log::debug!(
            "Nelder-Mead finished after {} iterations with fitness {:.6e}",
            self.tracker.iterations(),
            self.simplex[0].1
        );

        Ok(())
    }

    fn get_best_solution(&self) -> Option<&(Vec<f64>, f64)> {
        self.best_solution.as_ref()
    }
}

#[derive(Debug, Clone, Error)]
pub enum NelderMeadError {
    #[error("initial point was not set")]
    InitialPointNotSet,
    #[error("optimizer was not initialized")]
    NotInitialized,
    #[error("point has dimension {given}, expected {expected}")]
    DimensionMismatch { expected: usize, given: usize },
    #[error("fitness function returned NaN")]
    NonFiniteFitness,
}

impl OptimizationError for NelderMeadError {}
