pub mod msm;
pub mod optimization;
