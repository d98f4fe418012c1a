pub mod optimizer;
pub mod optimization_tracker;
pub mod nelder_mead;
