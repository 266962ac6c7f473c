pub mod config;
pub mod executor;
pub mod experiment;

// Re-export commonly used types
pub use config::{ConcurrencyMode, ExperimentConfig};
pub use executor::RunExecutor;
pub use experiment::{execute_experiments, generate_scenarios, plan_runs, ExperimentBatch, SweepAxis};
