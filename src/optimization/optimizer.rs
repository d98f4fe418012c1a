pub trait Optimizer<T, Fitness>
where
    Fitness: OptimizationFitness,
{
    type Error: OptimizationError;

    // Evaluate the fitness of a given solution
    fn evaluate(&self, individual: &[T]) -> Result<Fitness, Self::Error>;

    // Initialize the population/solution for the optimizer
    fn initialize(&mut self) -> Result<(), Self::Error>;

    // Execute a single optimization step
    fn step(&mut self) -> Result<(), Self::Error>;

    // Run optimization steps until the termination criterium says stop
    fn run(&mut self) -> Result<(), Self::Error>;

    // Retrieves the best solution found by the optimizer
    fn get_best_solution(&self) -> Option<&(Vec<T>, Fitness)>;
}

pub trait OptimizationError: std::error::Error {}

pub trait OptimizationFitness: std::fmt::Debug + Clone {
    fn get_fitness(&self) -> f64;
}

impl OptimizationFitness for f64 {
    fn get_fitness(&self) -> f64 {
        *self
    }
}

pub trait FitnessFunction<T, Fitness>
where
    Fitness: OptimizationFitness,
{
    fn evaluate(&self, individual: &[T]) -> Fitness;
}

// Plain closures work as fitness functions
impl<T, Fitness, F> FitnessFunction<T, Fitness> for F
where
    Fitness: OptimizationFitness,
    F: Fn(&[T]) -> Fitness,
{
    fn evaluate(&self, individual: &[T]) -> Fitness {
        self(individual)
    }
}
