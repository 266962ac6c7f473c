//! Scenario sweeps and batch execution.

use super::config::{ConcurrencyMode, ExperimentConfig};
use crate::core::artifact::ArtifactStore;
use crate::core::dispatch::DispatchRule;
use crate::core::error::{SimError, SimResult};
use crate::core::project::ProjectConfig;
use crate::core::release::ReleasePolicy;
use crate::core::run::{run_simulation, RunManifest, RunResultHandle, RunStatus};
use crate::core::scenario::ScenarioConfig;
use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// One dimension of a scenario sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "axis", content = "values", rename_all = "snake_case")]
pub enum SweepAxis {
    DispatchRule(Vec<DispatchRule>),
    ReleasePolicy(Vec<ReleasePolicy>),
    /// Applied to every route
    WipCap(Vec<u32>),
    FailuresEnabled(Vec<bool>),
}

impl SweepAxis {
    fn len(&self) -> usize {
        match self {
            SweepAxis::DispatchRule(values) => values.len(),
            SweepAxis::ReleasePolicy(values) => values.len(),
            SweepAxis::WipCap(values) => values.len(),
            SweepAxis::FailuresEnabled(values) => values.len(),
        }
    }

    /// Copy of `scenario` with the `index`-th value applied, plus its tag
    fn apply(&self, scenario: &ScenarioConfig, index: usize) -> (ScenarioConfig, String) {
        let mut next = scenario.clone();
        let tag = match self {
            SweepAxis::DispatchRule(values) => {
                next.dispatch_rule = values[index];
                format!("rule={}", values[index])
            }
            SweepAxis::ReleasePolicy(values) => {
                next.release_policy = values[index];
                format!("policy={}", values[index])
            }
            SweepAxis::WipCap(values) => {
                next.default_wip_cap = Some(values[index]);
                for cap in next.wip_caps.values_mut() {
                    *cap = values[index];
                }
                format!("wip={}", values[index])
            }
            SweepAxis::FailuresEnabled(values) => {
                next.toggles.failures_enabled = values[index];
                format!("failures={}", values[index])
            }
        };
        (next, tag)
    }
}

/// Cartesian product of the sweep axes over `base`, in axis order.
/// Axes without values are ignored.
pub fn generate_scenarios(base: &ScenarioConfig, sweeps: &[SweepAxis]) -> Vec<ScenarioConfig> {
    let mut scenarios: Vec<(ScenarioConfig, Vec<String>)> = vec![(base.clone(), Vec::new())];
    for axis in sweeps.iter().filter(|axis| axis.len() > 0) {
        scenarios = scenarios
            .iter()
            .flat_map(|(scenario, tags)| {
                (0..axis.len()).map(move |index| {
                    let (next, tag) = axis.apply(scenario, index);
                    let mut tags = tags.clone();
                    tags.push(tag);
                    (next, tags)
                })
            })
            .collect();
    }
    scenarios
        .into_iter()
        .map(|(mut scenario, tags)| {
            if !tags.is_empty() {
                let prefix = base.scenario_id.clone().unwrap_or_else(|| "sweep".to_string());
                scenario.scenario_id = Some(format!("{}[{}]", prefix, tags.join(",")));
            }
            scenario
        })
        .collect()
}

/// Manifests for a batch; scenario `i` runs with seed `seed_base + i`
pub fn plan_runs(project_id: &str, scenarios: &[ScenarioConfig], seed_base: u64) -> Vec<RunManifest> {
    scenarios
        .iter()
        .enumerate()
        .map(|(index, scenario)| RunManifest::new(project_id, scenario.clone(), index, seed_base))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentBatch {
    pub project_id: String,
    pub seed_base: u64,
    /// One result per scenario, ordered by scenario index
    pub results: Vec<RunResultHandle>,
}

impl ExperimentBatch {
    pub fn completed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == RunStatus::Completed)
            .count()
    }

    pub fn failures(&self) -> Vec<&RunResultHandle> {
        self.results
            .iter()
            .filter(|r| matches!(r.status, RunStatus::Failed(_)))
            .collect()
    }
}

pub(crate) fn build_pool(config: &ExperimentConfig) -> SimResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(config.thread_pool_size.unwrap_or(0))
        .build()
        .map_err(|e| SimError::Executor(format!("cannot build thread pool: {}", e)))
}

/// Run every scenario of a batch and collect the results in scenario order
pub fn execute_experiments(
    project: &ProjectConfig,
    scenarios: &[ScenarioConfig],
    seed_base: u64,
    config: &ExperimentConfig,
    store: &dyn ArtifactStore,
) -> SimResult<ExperimentBatch> {
    let manifests = plan_runs(&project.project_id, scenarios, seed_base);
    info!(
        "executing {} run(s) of {} ({:?})",
        manifests.len(),
        project.project_id,
        config.concurrency_mode
    );

    let results: Vec<RunResultHandle> = match config.concurrency_mode {
        ConcurrencyMode::Sequential => manifests
            .iter()
            .map(|manifest| run_simulation(project, manifest, store, None))
            .collect(),
        ConcurrencyMode::Rayon => {
            let pool = build_pool(config)?;
            pool.install(|| {
                manifests
                    .par_iter()
                    .map(|manifest| run_simulation(project, manifest, store, None))
                    .collect()
            })
        }
    };

    Ok(ExperimentBatch {
        project_id: project.project_id.clone(),
        seed_base,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ScenarioConfig {
        ScenarioConfig::new(DispatchRule::Edd, ReleasePolicy::Conwip, 0)
            .with_id("base")
            .with_wip_cap("R1", 5)
    }

    #[test]
    fn test_cartesian_product_order() {
        let scenarios = generate_scenarios(
            &base(),
            &[
                SweepAxis::DispatchRule(vec![DispatchRule::Edd, DispatchRule::Atcs]),
                SweepAxis::WipCap(vec![2, 4, 8]),
            ],
        );
        assert_eq!(scenarios.len(), 6);
        assert_eq!(scenarios[0].dispatch_rule, DispatchRule::Edd);
        assert_eq!(scenarios[0].wip_caps["R1"], 2);
        assert_eq!(scenarios[5].dispatch_rule, DispatchRule::Atcs);
        assert_eq!(scenarios[5].default_wip_cap, Some(8));
        assert_eq!(scenarios[1].scenario_id.as_deref(), Some("base[rule=EDD,wip=4]"));
    }

    #[test]
    fn test_no_axes_yields_base() {
        let scenarios = generate_scenarios(&base(), &[SweepAxis::FailuresEnabled(Vec::new())]);
        assert_eq!(scenarios, vec![base()]);
    }

    #[test]
    fn test_plan_assigns_consecutive_seeds() {
        let scenarios = generate_scenarios(&base(), &[SweepAxis::FailuresEnabled(vec![true, false])]);
        let manifests = plan_runs("p", &scenarios, 500);
        let seeds: Vec<u64> = manifests.iter().map(|m| m.seed).collect();
        assert_eq!(seeds, vec![500, 501]);
        assert_eq!(manifests[1].scenario_index, 1);
    }
}
