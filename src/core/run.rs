//! Run lifecycle: manifests, execution, artifact export and replay checks.

use super::artifact::{ArtifactHandle, ArtifactStore};
use super::error::{SimError, SimResult};
use super::kpi::{compute_kpis, KpiReport};
use super::project::ProjectConfig;
use super::rng::{derive_stream_ids, StreamId};
use super::scenario::ScenarioConfig;
use super::simulation_engine::Simulation;
use super::timeline::Timeline;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use uuid::Uuid;

pub const TIMELINE_CSV: &str = "timeline.csv";
pub const TIMELINE_JSON: &str = "timeline.json";
pub const KPIS_JSON: &str = "kpis.json";
pub const KPIS_CSV: &str = "kpis.csv";

/// Immutable description of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub project_id: String,
    pub scenario: ScenarioConfig,
    pub scenario_index: usize,
    /// `seed_base + scenario_index`
    pub seed: u64,
    pub streams: Vec<StreamId>,
}

impl RunManifest {
    pub fn new(project_id: impl Into<String>, scenario: ScenarioConfig, scenario_index: usize, seed_base: u64) -> Self {
        let seed = seed_base.wrapping_add(scenario_index as u64);
        Self {
            run_id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            scenario,
            scenario_index,
            seed,
            streams: derive_stream_ids(seed),
        }
    }

    /// Single run seeded from the scenario's own seed
    pub fn for_scenario(project_id: impl Into<String>, scenario: ScenarioConfig) -> Self {
        let seed_base = scenario.seed;
        Self::new(project_id, scenario, 0, seed_base)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed(String),
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed(_) | RunStatus::Cancelled)
    }
}

/// What a caller gets back for a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResultHandle {
    pub run_id: String,
    pub scenario_index: usize,
    pub status: RunStatus,
    pub timeline: Option<ArtifactHandle>,
    pub kpi_artifacts: Vec<ArtifactHandle>,
    pub report: Option<KpiReport>,
}

impl RunResultHandle {
    pub(crate) fn without_output(manifest: &RunManifest, status: RunStatus) -> Self {
        Self {
            run_id: manifest.run_id.clone(),
            scenario_index: manifest.scenario_index,
            status,
            timeline: None,
            kpi_artifacts: Vec::new(),
            report: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub timeline: Timeline,
    pub report: KpiReport,
}

/// Simulate one manifest and aggregate its KPIs. No I/O.
pub fn execute_run(project: &ProjectConfig, manifest: &RunManifest, cancel: Option<Arc<AtomicBool>>) -> SimResult<RunOutput> {
    let mut simulation = Simulation::new(project, &manifest.scenario, manifest.seed)?;
    if let Some(flag) = cancel {
        simulation = simulation.with_cancel_flag(flag);
    }
    simulation.run().map_err(|e| match e {
        SimError::Cancelled { .. } => SimError::Cancelled {
            run_id: manifest.run_id.clone(),
        },
        other => other,
    })?;
    let timeline = simulation.finish();
    let report = compute_kpis(&timeline);
    Ok(RunOutput { timeline, report })
}

/// Export the timeline (CSV and JSON) and the KPI report (JSON and flat CSV).
///
/// Every payload is serialized before the first write. If a write fails the
/// artifacts already stored for the run are removed again.
pub fn store_outputs(
    store: &dyn ArtifactStore,
    run_id: &str,
    output: &RunOutput,
) -> SimResult<(ArtifactHandle, Vec<ArtifactHandle>)> {
    let payloads = [
        (TIMELINE_CSV, output.timeline.to_csv()?, "text/csv"),
        (TIMELINE_JSON, output.timeline.to_json()?.into_bytes(), "application/json"),
        (KPIS_JSON, output.report.to_json()?.into_bytes(), "application/json"),
        (KPIS_CSV, output.report.to_csv()?, "text/csv"),
    ];

    let mut stored = Vec::with_capacity(payloads.len());
    for (kind, payload, media_type) in payloads {
        match store.store_artifact(run_id, kind, payload, media_type) {
            Ok(handle) => stored.push(handle),
            Err(e) => {
                for handle in &stored {
                    if let Err(cleanup) = store.remove_artifact(handle) {
                        warn!("run {}: cannot remove {}: {}", run_id, handle.uri, cleanup);
                    }
                }
                return Err(e);
            }
        }
    }
    let mut handles = stored.into_iter();
    let timeline = handles
        .next()
        .ok_or_else(|| SimError::Artifact(format!("run {}: timeline was not stored", run_id)))?;
    Ok((timeline, handles.collect()))
}

/// Execute a run end to end. Failed and cancelled runs store nothing.
pub fn run_simulation(
    project: &ProjectConfig,
    manifest: &RunManifest,
    store: &dyn ArtifactStore,
    cancel: Option<Arc<AtomicBool>>,
) -> RunResultHandle {
    info!(
        "run {} (scenario #{} {}, seed {})",
        manifest.run_id,
        manifest.scenario_index,
        manifest.scenario.label(),
        manifest.seed
    );
    let output = match execute_run(project, manifest, cancel) {
        Ok(output) => output,
        Err(SimError::Cancelled { .. }) => {
            return RunResultHandle::without_output(manifest, RunStatus::Cancelled);
        }
        Err(e) => {
            warn!("run {} failed: {}", manifest.run_id, e);
            return RunResultHandle::without_output(manifest, RunStatus::Failed(e.to_string()));
        }
    };

    match store_outputs(store, &manifest.run_id, &output) {
        Ok((timeline, kpi_artifacts)) => RunResultHandle {
            run_id: manifest.run_id.clone(),
            scenario_index: manifest.scenario_index,
            status: RunStatus::Completed,
            timeline: Some(timeline),
            kpi_artifacts,
            report: Some(output.report),
        },
        Err(e) => {
            warn!("run {} could not store artifacts: {}", manifest.run_id, e);
            RunResultHandle::without_output(manifest, RunStatus::Failed(e.to_string()))
        }
    }
}

/// Replay a manifest and fail if the second run differs from the first
pub fn verify_determinism(project: &ProjectConfig, manifest: &RunManifest) -> SimResult<RunOutput> {
    let first = execute_run(project, manifest, None)?;
    let replay = execute_run(project, manifest, None)?;

    if first.timeline.to_json()? != replay.timeline.to_json()? {
        let position = first
            .timeline
            .events
            .iter()
            .zip(&replay.timeline.events)
            .position(|(a, b)| a != b)
            .unwrap_or_else(|| first.timeline.events.len().min(replay.timeline.events.len()));
        return Err(SimError::DeterminismViolation {
            run_id: manifest.run_id.clone(),
            detail: format!("timelines diverge at event {}", position),
        });
    }
    if first.report.to_json()? != replay.report.to_json()? {
        return Err(SimError::DeterminismViolation {
            run_id: manifest.run_id.clone(),
            detail: "kpi reports differ".to_string(),
        });
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::artifact::InMemoryArtifactStore;
    use crate::core::dispatch::DispatchRule;
    use crate::core::project::{JobSpec, MachineSpec, Product, Route, RouteStep};
    use crate::core::release::ReleasePolicy;

    fn project() -> ProjectConfig {
        ProjectConfig::new("demo")
            .with_machine(MachineSpec::new("M1", "C1").with_failures(20.0, 1.0))
            .with_route(Route::new("R1", vec![RouteStep::new(1, "M1", 2.0).with_sd(0.5)]))
            .with_product(Product::new("P1", "F1", "R1"))
            .with_job(JobSpec::new("J1", "P1", 0.0, 5.0))
            .with_job(JobSpec::new("J2", "P1", 1.0, 6.0))
    }

    fn scenario() -> ScenarioConfig {
        ScenarioConfig::new(DispatchRule::Edd, ReleasePolicy::Push, 11)
    }

    #[test]
    fn test_manifest_seed_and_streams() {
        let manifest = RunManifest::new("demo", scenario(), 3, 100);
        assert_eq!(manifest.seed, 103);
        assert_eq!(manifest.streams, derive_stream_ids(103));
        let other = RunManifest::new("demo", scenario(), 3, 100);
        assert_ne!(manifest.run_id, other.run_id);
    }

    #[test]
    fn test_completed_run_stores_artifacts() {
        let store = InMemoryArtifactStore::new();
        let manifest = RunManifest::for_scenario("demo", scenario());
        let handle = run_simulation(&project(), &manifest, &store, None);
        assert_eq!(handle.status, RunStatus::Completed);
        assert_eq!(store.len(), 4);
        let timeline = handle.timeline.unwrap();
        assert!(timeline.uri.ends_with("/timeline.csv"));
        assert!(!store.load_artifact(&timeline).unwrap().is_empty());
        assert_eq!(handle.report.unwrap().jobs_completed, 2);
    }

    #[test]
    fn test_failed_run_stores_nothing() {
        let store = InMemoryArtifactStore::new();
        let bad = ScenarioConfig::new(DispatchRule::Edd, ReleasePolicy::Conwip, 1);
        let manifest = RunManifest::for_scenario("demo", bad);
        let handle = run_simulation(&project(), &manifest, &store, None);
        assert!(matches!(handle.status, RunStatus::Failed(ref msg) if msg.contains("wip cap")));
        assert!(store.is_empty());
        assert!(handle.timeline.is_none());
    }

    /// Memory store that rejects one artifact kind
    struct RejectingStore {
        inner: InMemoryArtifactStore,
        reject: &'static str,
    }

    impl ArtifactStore for RejectingStore {
        fn store_artifact(&self, run_id: &str, kind: &str, payload: Vec<u8>, media_type: &str) -> SimResult<ArtifactHandle> {
            if kind == self.reject {
                return Err(SimError::Artifact(format!("{} rejected", kind)));
            }
            self.inner.store_artifact(run_id, kind, payload, media_type)
        }

        fn load_artifact(&self, handle: &ArtifactHandle) -> SimResult<Vec<u8>> {
            self.inner.load_artifact(handle)
        }

        fn remove_artifact(&self, handle: &ArtifactHandle) -> SimResult<()> {
            self.inner.remove_artifact(handle)
        }
    }

    #[test]
    fn test_partial_export_is_rolled_back() {
        let store = RejectingStore {
            inner: InMemoryArtifactStore::new(),
            reject: KPIS_CSV,
        };
        let manifest = RunManifest::for_scenario("demo", scenario());
        let handle = run_simulation(&project(), &manifest, &store, None);
        assert!(matches!(handle.status, RunStatus::Failed(ref msg) if msg.contains("kpis.csv rejected")));
        assert!(handle.timeline.is_none());
        // timeline.csv, timeline.json and kpis.json were written, then removed.
        assert!(store.inner.is_empty());
    }

    #[test]
    fn test_cancelled_run() {
        let store = InMemoryArtifactStore::new();
        let manifest = RunManifest::for_scenario("demo", scenario());
        let flag = Arc::new(AtomicBool::new(true));
        let handle = run_simulation(&project(), &manifest, &store, Some(flag));
        assert_eq!(handle.status, RunStatus::Cancelled);
        assert!(store.is_empty());
    }

    #[test]
    fn test_replay_is_identical() {
        let manifest = RunManifest::new("demo", scenario(), 0, 2024);
        let output = verify_determinism(&project(), &manifest).unwrap();
        assert_eq!(output.report.jobs_total, 2);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&RunStatus::Failed("boom".into())).unwrap();
        assert_eq!(json, r#"{"status":"failed","message":"boom"}"#);
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
    }
}
