//! EcoCompute: a volunteer-compute marketplace core.
//!
//! Requesters submit jobs that are split into microtasks; a sharing device
//! pulls microtasks, runs them in an isolated unit pool and folds the
//! results back through a redundancy quorum.

pub mod config;
pub mod device;
pub mod error;
pub mod jobs;
pub mod provider;
pub mod sandbox;
pub mod store;
