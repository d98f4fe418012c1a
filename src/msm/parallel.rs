use rayon::ThreadPoolBuildError;

// Runs `op` inside a dedicated rayon pool of `workers` threads, or on the
// global pool when no size is given
pub fn run_in_pool<R, OP>(workers: Option<usize>, op: OP) -> Result<R, ThreadPoolBuildError>
where
    R: Send,
    OP: FnOnce() -> R + Send,
{
    match workers {
        Some(num_threads) => {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(num_threads).build()?;
            Ok(pool.install(op))
        }
        None => Ok(op()),
    }
}
