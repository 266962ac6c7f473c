pub mod core;

// Re-export commonly used types
pub use crate::core::artifact::{ArtifactHandle, ArtifactStore, FileArtifactStore, InMemoryArtifactStore};
pub use crate::core::dispatch::DispatchRule;
pub use crate::core::error::{SimError, SimResult};
pub use crate::core::execution::{execute_experiments, ExperimentConfig, RunExecutor};
pub use crate::core::import::{import_project, read_csv_dir, CsvDocument};
pub use crate::core::kpi::{compute_kpis, KpiReport};
pub use crate::core::project::{validate_project, ProjectConfig};
pub use crate::core::release::ReleasePolicy;
pub use crate::core::run::{run_simulation, RunManifest, RunResultHandle, RunStatus};
pub use crate::core::scenario::ScenarioConfig;
pub use crate::core::simulation_engine::{simulate, Simulation};
pub use crate::core::timeline::Timeline;
pub use crate::core::types::SimTime;
