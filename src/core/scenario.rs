//! Scenario configuration: the knobs varied between runs of one project.

use super::dispatch::{AtcParams, DispatchRule};
use super::error::{SimError, SimResult};
use super::project::ProjectConfig;
use super::release::{route_cells, route_loops, ReleaseController, ReleasePolicy};
use super::types::{CellId, CellPair, RouteId, SimTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_rework_cap() -> u32 {
    1
}

fn enabled() -> bool {
    true
}

/// Card count of one POLCA loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolcaLoop {
    pub upstream: CellId,
    pub downstream: CellId,
    pub cards: u32,
}

/// Feature switches of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toggles {
    #[serde(default = "enabled")]
    pub failures_enabled: bool,
    #[serde(default = "enabled")]
    pub rework_enabled: bool,
    #[serde(default)]
    pub yield_loss_enabled: bool,
    /// When off, every step takes exactly its mean process time
    #[serde(default = "enabled")]
    pub process_noise_enabled: bool,
    #[serde(default)]
    pub labor_constrained: bool,
}

impl Default for Toggles {
    fn default() -> Self {
        Self {
            failures_enabled: true,
            rework_enabled: true,
            yield_loss_enabled: false,
            process_noise_enabled: true,
            labor_constrained: false,
        }
    }
}

/// One scenario. `dispatch_rule`, `release_policy` and `seed` are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub scenario_id: Option<String>,
    pub dispatch_rule: DispatchRule,
    pub release_policy: ReleasePolicy,
    pub seed: u64,
    /// CONWIP cap per route
    #[serde(default)]
    pub wip_caps: BTreeMap<RouteId, u32>,
    /// Cap for routes without an explicit entry
    #[serde(default)]
    pub default_wip_cap: Option<u32>,
    /// Initial CONWIP tokens per route; defaults to the cap
    #[serde(default)]
    pub token_counts: BTreeMap<RouteId, u32>,
    #[serde(default)]
    pub polca_cards: Vec<PolcaLoop>,
    #[serde(default)]
    pub default_polca_cards: Option<u32>,
    #[serde(default)]
    pub atc: AtcParams,
    #[serde(default = "default_rework_cap")]
    pub rework_cap: u32,
    #[serde(default)]
    pub toggles: Toggles,
    /// Stop the clock here even if jobs remain
    #[serde(default)]
    pub horizon: Option<SimTime>,
    /// Safety bound on processed events
    #[serde(default)]
    pub max_events: Option<u64>,
}

impl ScenarioConfig {
    pub fn new(dispatch_rule: DispatchRule, release_policy: ReleasePolicy, seed: u64) -> Self {
        Self {
            scenario_id: None,
            dispatch_rule,
            release_policy,
            seed,
            wip_caps: BTreeMap::new(),
            default_wip_cap: None,
            token_counts: BTreeMap::new(),
            polca_cards: Vec::new(),
            default_polca_cards: None,
            atc: AtcParams::default(),
            rework_cap: default_rework_cap(),
            toggles: Toggles::default(),
            horizon: None,
            max_events: None,
        }
    }

    pub fn from_json(json: &str) -> SimResult<Self> {
        serde_json::from_str(json).map_err(|e| SimError::config(format!("scenario: {}", e)))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.scenario_id = Some(id.into());
        self
    }

    pub fn with_wip_cap(mut self, route: impl Into<RouteId>, cap: u32) -> Self {
        self.wip_caps.insert(route.into(), cap);
        self
    }

    pub fn with_default_wip_cap(mut self, cap: u32) -> Self {
        self.default_wip_cap = Some(cap);
        self
    }

    pub fn with_token_count(mut self, route: impl Into<RouteId>, tokens: u32) -> Self {
        self.token_counts.insert(route.into(), tokens);
        self
    }

    pub fn with_polca_cards(mut self, upstream: &str, downstream: &str, cards: u32) -> Self {
        self.polca_cards.push(PolcaLoop {
            upstream: upstream.to_string(),
            downstream: downstream.to_string(),
            cards,
        });
        self
    }

    pub fn with_default_polca_cards(mut self, cards: u32) -> Self {
        self.default_polca_cards = Some(cards);
        self
    }

    pub fn with_atc(mut self, params: AtcParams) -> Self {
        self.atc = params;
        self
    }

    pub fn with_rework_cap(mut self, cap: u32) -> Self {
        self.rework_cap = cap;
        self
    }

    pub fn with_toggles(mut self, toggles: Toggles) -> Self {
        self.toggles = toggles;
        self
    }

    pub fn with_failures(mut self, enabled: bool) -> Self {
        self.toggles.failures_enabled = enabled;
        self
    }

    pub fn with_labor_constraint(mut self, enabled: bool) -> Self {
        self.toggles.labor_constrained = enabled;
        self
    }

    pub fn with_process_noise(mut self, enabled: bool) -> Self {
        self.toggles.process_noise_enabled = enabled;
        self
    }

    pub fn with_yield_loss(mut self, enabled: bool) -> Self {
        self.toggles.yield_loss_enabled = enabled;
        self
    }

    pub fn with_horizon(mut self, horizon: SimTime) -> Self {
        self.horizon = Some(horizon);
        self
    }

    pub fn with_max_events(mut self, max_events: u64) -> Self {
        self.max_events = Some(max_events);
        self
    }

    /// Label used in logs and manifests
    pub fn label(&self) -> String {
        match &self.scenario_id {
            Some(id) => id.clone(),
            None => format!("{}/{}", self.dispatch_rule, self.release_policy),
        }
    }

    /// Routes that some product follows, in declaration order
    fn used_routes<'p>(&self, project: &'p ProjectConfig) -> Vec<&'p RouteId> {
        project
            .routes
            .iter()
            .filter(|route| project.products.iter().any(|p| p.route_id == route.route_id))
            .map(|route| &route.route_id)
            .collect()
    }

    /// CONWIP cap of every used route
    pub fn route_caps(&self, project: &ProjectConfig) -> SimResult<BTreeMap<RouteId, u32>> {
        let mut caps = BTreeMap::new();
        for route in self.used_routes(project) {
            let cap = self
                .wip_caps
                .get(route)
                .copied()
                .or(self.default_wip_cap)
                .ok_or_else(|| SimError::config(format!("CONWIP requires a wip cap for route '{}'", route)))?;
            caps.insert(route.clone(), cap);
        }
        Ok(caps)
    }

    /// Card count of every POLCA loop some used route passes through
    pub fn loop_cards(&self, project: &ProjectConfig) -> SimResult<BTreeMap<CellPair, u32>> {
        let mut cards = BTreeMap::new();
        for route_id in self.used_routes(project) {
            let Some(route) = project.route(route_id) else {
                continue;
            };
            for pair in route_loops(&route_cells(project, route)) {
                let count = self
                    .polca_cards
                    .iter()
                    .find(|l| l.upstream == pair.upstream && l.downstream == pair.downstream)
                    .map(|l| l.cards)
                    .or(self.default_polca_cards)
                    .ok_or_else(|| SimError::config(format!("POLCA requires a card count for loop {}", pair)))?;
                cards.insert(pair, count);
            }
        }
        Ok(cards)
    }

    /// Reject parameters the engine cannot run with
    pub fn validate(&self, project: &ProjectConfig) -> SimResult<()> {
        for route in self.wip_caps.keys().chain(self.token_counts.keys()) {
            if project.route(route).is_none() {
                return Err(SimError::config(format!("unknown route '{}' in wip settings", route)));
            }
        }
        if let Some(k1) = self.atc.k1 {
            if !(k1.is_finite() && k1 > 0.0) {
                return Err(SimError::config("atc.k1 must be > 0"));
            }
        }
        if !(self.atc.k1_scale.is_finite() && self.atc.k1_scale > 0.0) {
            return Err(SimError::config("atc.k1_scale must be > 0"));
        }
        if !(self.atc.k2.is_finite() && self.atc.k2 > 0.0) {
            return Err(SimError::config("atc.k2 must be > 0"));
        }
        if !(self.atc.setup_penalty.is_finite() && self.atc.setup_penalty > 1.0) {
            return Err(SimError::config("atc.setup_penalty must be > 1"));
        }
        if let Some(horizon) = self.horizon {
            if !(horizon.is_finite() && horizon > 0.0) {
                return Err(SimError::config("horizon must be > 0"));
            }
        }
        if self.max_events == Some(0) {
            return Err(SimError::config("max_events must be >= 1"));
        }
        if self.toggles.labor_constrained {
            let groups = project.machine_groups();
            for route_id in self.used_routes(project) {
                let Some(route) = project.route(route_id) else {
                    continue;
                };
                for step in &route.steps {
                    let staffed = groups.contains_key(&step.machine_group_id)
                        && project
                            .operators
                            .iter()
                            .any(|op| op.skills.contains(&step.machine_group_id));
                    if !staffed {
                        return Err(SimError::config(format!(
                            "labor constraint: no operator can run machine group '{}'",
                            step.machine_group_id
                        )));
                    }
                }
            }
        }
        self.release_controller(project).map(|_| ())
    }

    /// Build the release controller for this scenario
    pub fn release_controller(&self, project: &ProjectConfig) -> SimResult<ReleaseController> {
        match self.release_policy {
            ReleasePolicy::Push => {
                ReleaseController::new(ReleasePolicy::Push, BTreeMap::new(), &self.token_counts, BTreeMap::new())
            }
            ReleasePolicy::Conwip => ReleaseController::new(
                ReleasePolicy::Conwip,
                self.route_caps(project)?,
                &self.token_counts,
                BTreeMap::new(),
            ),
            ReleasePolicy::Polca => ReleaseController::new(
                ReleasePolicy::Polca,
                BTreeMap::new(),
                &self.token_counts,
                self.loop_cards(project)?,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::project::{MachineSpec, OperatorSpec, Product, Route, RouteStep};

    fn project() -> ProjectConfig {
        ProjectConfig::new("p")
            .with_machine(MachineSpec::new("M1", "C1"))
            .with_machine(MachineSpec::new("M2", "C2"))
            .with_route(Route::new(
                "R1",
                vec![RouteStep::new(1, "M1", 1.0), RouteStep::new(2, "M2", 1.0)],
            ))
            .with_product(Product::new("P1", "F1", "R1"))
    }

    #[test]
    fn test_required_fields() {
        let err = ScenarioConfig::from_json(r#"{"dispatch_rule": "EDD", "seed": 1}"#).unwrap_err();
        assert!(matches!(err, SimError::Configuration { .. }));
        assert!(err.to_string().contains("release_policy"));

        let ok = ScenarioConfig::from_json(r#"{"dispatch_rule": "EDD", "release_policy": "PUSH", "seed": 1}"#)
            .unwrap();
        assert_eq!(ok.rework_cap, 1);
        assert!(ok.toggles.failures_enabled);
        assert!(!ok.toggles.labor_constrained);
    }

    #[test]
    fn test_conwip_needs_caps() {
        let scenario = ScenarioConfig::new(DispatchRule::Edd, ReleasePolicy::Conwip, 1);
        assert!(scenario.validate(&project()).is_err());
        assert!(scenario.clone().with_wip_cap("R1", 3).validate(&project()).is_ok());
        assert!(scenario.clone().with_default_wip_cap(3).validate(&project()).is_ok());
        assert!(scenario.with_wip_cap("R1", 0).validate(&project()).is_err());
    }

    #[test]
    fn test_polca_needs_cards_for_each_loop() {
        let scenario = ScenarioConfig::new(DispatchRule::Edd, ReleasePolicy::Polca, 1);
        assert!(scenario.validate(&project()).is_err());
        let with_cards = scenario.with_polca_cards("C1", "C2", 2);
        let cards = with_cards.loop_cards(&project()).unwrap();
        assert_eq!(cards.get(&CellPair::new("C1", "C2")), Some(&2));
        assert!(with_cards.validate(&project()).is_ok());
    }

    #[test]
    fn test_invalid_atc_parameters() {
        let mut scenario = ScenarioConfig::new(DispatchRule::Atcs, ReleasePolicy::Push, 1);
        scenario.atc.setup_penalty = 1.0;
        assert!(scenario.validate(&project()).is_err());
        scenario.atc.setup_penalty = 2.0;
        scenario.atc.k1 = Some(0.0);
        assert!(scenario.validate(&project()).is_err());
    }

    #[test]
    fn test_labor_constraint_needs_skilled_operators() {
        let scenario = ScenarioConfig::new(DispatchRule::Edd, ReleasePolicy::Push, 1).with_labor_constraint(true);
        let staffed = project().with_operator(OperatorSpec::new("O1", &["M1", "M2"]));
        assert!(scenario.validate(&project()).is_err());
        assert!(scenario.validate(&staffed).is_ok());
    }
}
