//! Static project model: plant resources, products, routings, setups and demand.
//!
//! A `ProjectConfig` is normally produced upstream and already
//! integrity-checked; `validate_project` re-checks everything the engine
//! relies on so that a bad document is rejected before a run starts.

use super::error::{SimError, SimResult};
use super::rng::{RngContext, RngStream};
use super::types::{
    CellId, FamilyId, JobId, MachineGroupId, MachineId, OperatorId, ProductId, RouteId, SimTime,
};
use super::validation::ValidationReport;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

fn default_capacity() -> u32 {
    1
}

fn default_yield() -> f64 {
    1.0
}

/// Absolute time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: SimTime,
    pub end: SimTime,
}

impl TimeWindow {
    pub fn new(start: SimTime, end: SimTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: SimTime) -> bool {
        time >= self.start && time < self.end
    }

    pub fn duration(&self) -> SimTime {
        self.end - self.start
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub id: MachineId,
    pub cell_id: CellId,
    /// Pool of interchangeable machines a route step targets; defaults to the machine id
    #[serde(default)]
    pub machine_group_id: Option<MachineGroupId>,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default)]
    pub mtbf: Option<SimTime>,
    #[serde(default)]
    pub mttr: Option<SimTime>,
    /// Repairs last exactly `mttr` instead of an exponential draw
    #[serde(default)]
    pub deterministic_repair: bool,
    #[serde(default)]
    pub pm_windows: Vec<TimeWindow>,
}

impl MachineSpec {
    pub fn new(id: impl Into<MachineId>, cell_id: impl Into<CellId>) -> Self {
        Self {
            id: id.into(),
            cell_id: cell_id.into(),
            machine_group_id: None,
            capacity: 1,
            mtbf: None,
            mttr: None,
            deterministic_repair: false,
            pm_windows: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<MachineGroupId>) -> Self {
        self.machine_group_id = Some(group.into());
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_failures(mut self, mtbf: SimTime, mttr: SimTime) -> Self {
        self.mtbf = Some(mtbf);
        self.mttr = Some(mttr);
        self
    }

    pub fn with_deterministic_repair(mut self) -> Self {
        self.deterministic_repair = true;
        self
    }

    pub fn with_pm_window(mut self, start: SimTime, end: SimTime) -> Self {
        self.pm_windows.push(TimeWindow::new(start, end));
        self
    }

    pub fn group(&self) -> &str {
        self.machine_group_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorSpec {
    pub id: OperatorId,
    /// Machine groups this operator may run
    pub skills: Vec<MachineGroupId>,
    /// Shift calendar; empty means always available
    #[serde(default)]
    pub shifts: Vec<TimeWindow>,
}

impl OperatorSpec {
    pub fn new(id: impl Into<OperatorId>, skills: &[&str]) -> Self {
        Self {
            id: id.into(),
            skills: skills.iter().map(|s| s.to_string()).collect(),
            shifts: Vec::new(),
        }
    }

    pub fn with_shift(mut self, start: SimTime, end: SimTime) -> Self {
        self.shifts.push(TimeWindow::new(start, end));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStep {
    pub step_number: u32,
    pub machine_group_id: MachineGroupId,
    pub process_time_mean: SimTime,
    #[serde(default)]
    pub process_time_sd: SimTime,
    #[serde(default = "default_yield")]
    pub yield_rate: f64,
    #[serde(default)]
    pub rework_probability: f64,
    #[serde(default)]
    pub is_inspection: bool,
    /// Step number a failed inspection sends the job back to; defaults to the
    /// step immediately preceding this one
    #[serde(default)]
    pub rework_target_step: Option<u32>,
    /// Setup family at this step; defaults to the product family
    #[serde(default)]
    pub family: Option<FamilyId>,
}

impl RouteStep {
    pub fn new(step_number: u32, machine_group_id: impl Into<MachineGroupId>, mean: SimTime) -> Self {
        Self {
            step_number,
            machine_group_id: machine_group_id.into(),
            process_time_mean: mean,
            process_time_sd: 0.0,
            yield_rate: 1.0,
            rework_probability: 0.0,
            is_inspection: false,
            rework_target_step: None,
            family: None,
        }
    }

    pub fn with_sd(mut self, sd: SimTime) -> Self {
        self.process_time_sd = sd;
        self
    }

    pub fn with_yield(mut self, yield_rate: f64) -> Self {
        self.yield_rate = yield_rate;
        self
    }

    /// Mark as an inspection step that fails with `rework_probability`
    pub fn inspection(mut self, rework_probability: f64) -> Self {
        self.is_inspection = true;
        self.rework_probability = rework_probability;
        self
    }

    pub fn with_rework_target(mut self, step_number: u32) -> Self {
        self.rework_target_step = Some(step_number);
        self
    }

    pub fn with_family(mut self, family: impl Into<FamilyId>) -> Self {
        self.family = Some(family.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub route_id: RouteId,
    pub steps: Vec<RouteStep>,
}

impl Route {
    pub fn new(route_id: impl Into<RouteId>, steps: Vec<RouteStep>) -> Self {
        Self {
            route_id: route_id.into(),
            steps,
        }
    }

    /// Index of the step a failed inspection at `index` returns to
    pub fn rework_target_index(&self, index: usize) -> Option<usize> {
        let step = self.steps.get(index)?;
        match step.rework_target_step {
            Some(number) => self.steps[..index]
                .iter()
                .position(|s| s.step_number == number),
            None => index.checked_sub(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: ProductId,
    pub family_id: FamilyId,
    pub route_id: RouteId,
}

impl Product {
    pub fn new(
        product_id: impl Into<ProductId>,
        family_id: impl Into<FamilyId>,
        route_id: impl Into<RouteId>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            family_id: family_id.into(),
            route_id: route_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupEntry {
    /// `None` is the initial setup of a machine that has not run anything yet
    #[serde(default)]
    pub from_family: Option<FamilyId>,
    pub to_family: FamilyId,
    pub setup_time: SimTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: JobId,
    pub product_id: ProductId,
    #[serde(default)]
    pub release_time: SimTime,
    pub due_date: SimTime,
}

impl JobSpec {
    pub fn new(
        job_id: impl Into<JobId>,
        product_id: impl Into<ProductId>,
        release_time: SimTime,
        due_date: SimTime,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            product_id: product_id.into(),
            release_time,
            due_date,
        }
    }
}

/// Generated demand: `count` jobs with exponential inter-arrival gaps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandStream {
    pub product_id: ProductId,
    pub count: u32,
    pub interarrival_mean: SimTime,
    /// Due date relative to each job's arrival
    pub due_offset: SimTime,
    #[serde(default)]
    pub start: SimTime,
}

impl DemandStream {
    /// Ids `{product}-{n}` of the generated jobs, numbered from `first`
    pub fn job_ids(&self, first: u32) -> impl Iterator<Item = JobId> + '_ {
        (first..first.saturating_add(self.count)).map(move |n| format!("{}-{}", self.product_id, n))
    }

    /// Draw the jobs of this stream from the arrivals stream
    pub fn generate(&self, first: u32, rng: &mut RngContext) -> Vec<JobSpec> {
        let mut jobs = Vec::with_capacity(self.count as usize);
        let mut time = self.start;
        for job_id in self.job_ids(first) {
            time += rng.exponential(RngStream::Arrivals, self.interarrival_mean);
            jobs.push(JobSpec::new(job_id, self.product_id.clone(), time, time + self.due_offset));
        }
        jobs
    }
}

/// Sequence-dependent setup lookup
#[derive(Debug, Clone, Default)]
pub struct SetupMatrix {
    entries: HashMap<(Option<FamilyId>, FamilyId), SimTime>,
}

impl SetupMatrix {
    pub fn from_entries(entries: &[SetupEntry]) -> Self {
        let entries = entries
            .iter()
            .map(|e| ((e.from_family.clone(), e.to_family.clone()), e.setup_time))
            .collect();
        Self { entries }
    }

    /// True when switching from `from` to `to` requires a setup
    pub fn requires_setup(from: Option<&str>, to: &str) -> bool {
        from != Some(to)
    }

    /// Setup time for a switch; zero when families match or no entry exists
    pub fn lookup(&self, from: Option<&str>, to: &str) -> SimTime {
        if !Self::requires_setup(from, to) {
            return 0.0;
        }
        self.entries
            .get(&(from.map(str::to_string), to.to_string()))
            .copied()
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project_id: String,
    #[serde(default)]
    pub machines: Vec<MachineSpec>,
    #[serde(default)]
    pub operators: Vec<OperatorSpec>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub setup_matrix: Vec<SetupEntry>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub demand: Vec<DemandStream>,
}

impl ProjectConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> SimResult<Self> {
        serde_json::from_str(json).map_err(|e| SimError::config(format!("project: {}", e)))
    }

    pub fn with_machine(mut self, machine: MachineSpec) -> Self {
        self.machines.push(machine);
        self
    }

    pub fn with_operator(mut self, operator: OperatorSpec) -> Self {
        self.operators.push(operator);
        self
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    pub fn with_product(mut self, product: Product) -> Self {
        self.products.push(product);
        self
    }

    pub fn with_setup(mut self, from: Option<&str>, to: &str, setup_time: SimTime) -> Self {
        self.setup_matrix.push(SetupEntry {
            from_family: from.map(str::to_string),
            to_family: to.to_string(),
            setup_time,
        });
        self
    }

    pub fn with_job(mut self, job: JobSpec) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn with_demand(mut self, demand: DemandStream) -> Self {
        self.demand.push(demand);
        self
    }

    pub fn route(&self, route_id: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.route_id == route_id)
    }

    pub fn product(&self, product_id: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.product_id == product_id)
    }

    /// Machines keyed by group, in declaration order within each group
    pub fn machine_groups(&self) -> BTreeMap<MachineGroupId, Vec<&MachineSpec>> {
        let mut groups: BTreeMap<MachineGroupId, Vec<&MachineSpec>> = BTreeMap::new();
        for machine in &self.machines {
            groups.entry(machine.group().to_string()).or_default().push(machine);
        }
        groups
    }

    /// Cell hosting a machine group
    pub fn group_cell(&self, group: &str) -> Option<&CellId> {
        self.machines
            .iter()
            .find(|m| m.group() == group)
            .map(|m| &m.cell_id)
    }

    /// First job number of each demand stream. Streams of one product continue
    /// the numbering of the previous one.
    pub fn demand_ordinals(&self) -> Vec<u32> {
        let mut next: HashMap<&str, u32> = HashMap::new();
        self.demand
            .iter()
            .map(|stream| {
                let counter = next.entry(stream.product_id.as_str()).or_insert(1);
                let first = *counter;
                *counter = counter.saturating_add(stream.count);
                first
            })
            .collect()
    }

    /// Explicit jobs followed by generated demand, ordered by release time then id
    pub fn expand_jobs(&self, rng: &mut RngContext) -> Vec<JobSpec> {
        let mut jobs = self.jobs.clone();
        for (stream, first) in self.demand.iter().zip(self.demand_ordinals()) {
            jobs.extend(stream.generate(first, rng));
        }
        jobs.sort_by(|a, b| {
            a.release_time
                .total_cmp(&b.release_time)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs
    }
}

/// Check every integrity constraint the engine relies on
pub fn validate_project(project: &ProjectConfig) -> ValidationReport {
    let mut report = ValidationReport::new();

    if project.machines.is_empty() {
        report.error("machines", None, "<root>", "at least one machine is required");
    }

    let mut machine_ids = HashSet::new();
    let mut group_cells: HashMap<&str, &str> = HashMap::new();
    for (idx, machine) in project.machines.iter().enumerate() {
        let row = Some(idx + 1);
        if !machine_ids.insert(machine.id.as_str()) {
            report.error("machines", row, "id", format!("duplicate machine id '{}'", machine.id));
        }
        if machine.capacity < 1 {
            report.error("machines", row, "capacity", "must be >= 1");
        }
        match group_cells.get(machine.group()) {
            Some(cell) if *cell != machine.cell_id.as_str() => report.error(
                "machines",
                row,
                "cell_id",
                format!(
                    "machine group '{}' spans cells '{}' and '{}'",
                    machine.group(),
                    cell,
                    machine.cell_id
                ),
            ),
            Some(_) => {}
            None => {
                group_cells.insert(machine.group(), machine.cell_id.as_str());
            }
        }
        match (machine.mtbf, machine.mttr) {
            (Some(mtbf), Some(mttr)) => {
                if !(mtbf.is_finite() && mtbf > 0.0) {
                    report.error("machines", row, "mtbf", "must be > 0");
                }
                if !(mttr.is_finite() && mttr > 0.0) {
                    report.error("machines", row, "mttr", "must be > 0");
                }
            }
            (Some(_), None) => report.error("machines", row, "mttr", "required when mtbf is set"),
            (None, Some(_)) => report.warning("machines", row, "mttr", "ignored without mtbf"),
            (None, None) => {}
        }
        for window in &machine.pm_windows {
            if !(window.start.is_finite() && window.end.is_finite() && window.end > window.start) {
                report.error("machines", row, "pm_windows", "window end must be after start");
            }
        }
    }

    let mut operator_ids = HashSet::new();
    for (idx, operator) in project.operators.iter().enumerate() {
        let row = Some(idx + 1);
        if !operator_ids.insert(operator.id.as_str()) {
            report.error("operators", row, "id", format!("duplicate operator id '{}'", operator.id));
        }
        for skill in &operator.skills {
            if !group_cells.contains_key(skill.as_str()) {
                report.error(
                    "operators",
                    row,
                    "skills",
                    format!("unknown machine group '{}'", skill),
                );
            }
        }
        for window in &operator.shifts {
            if !(window.end > window.start) {
                report.error("operators", row, "shifts", "shift end must be after start");
            }
        }
    }

    let mut route_ids = HashSet::new();
    for (idx, route) in project.routes.iter().enumerate() {
        let row = Some(idx + 1);
        if !route_ids.insert(route.route_id.as_str()) {
            report.error("routes", row, "route_id", format!("duplicate route id '{}'", route.route_id));
        }
        if route.steps.is_empty() {
            report.error("routes", row, "steps", "route has no steps");
        }
        let mut previous: Option<u32> = None;
        for (sidx, step) in route.steps.iter().enumerate() {
            let column = |name: &str| format!("steps[{}].{}", sidx, name);
            if let Some(prev) = previous {
                if step.step_number <= prev {
                    report.error("routes", row, &column("step_number"), "step numbers must increase");
                }
            }
            previous = Some(step.step_number);
            if !group_cells.contains_key(step.machine_group_id.as_str()) {
                report.error(
                    "routes",
                    row,
                    &column("machine_group_id"),
                    format!("unknown machine group '{}'", step.machine_group_id),
                );
            }
            if !(step.process_time_mean.is_finite() && step.process_time_mean > 0.0) {
                report.error("routes", row, &column("process_time_mean"), "must be > 0");
            }
            if !(step.process_time_sd.is_finite() && step.process_time_sd >= 0.0) {
                report.error("routes", row, &column("process_time_sd"), "must be >= 0");
            }
            if !(step.yield_rate > 0.0 && step.yield_rate <= 1.0) {
                report.error("routes", row, &column("yield_rate"), "must be in (0,1]");
            }
            if !(0.0..=1.0).contains(&step.rework_probability) {
                report.error("routes", row, &column("rework_probability"), "must be in [0,1]");
            }
            if step.is_inspection && step.rework_probability > 0.0 {
                if route.rework_target_index(sidx).is_none() {
                    report.error(
                        "routes",
                        row,
                        &column("rework_target_step"),
                        "rework target must be an earlier step of the same route",
                    );
                }
            } else if step.rework_target_step.is_some() {
                report.warning(
                    "routes",
                    row,
                    &column("rework_target_step"),
                    "ignored on a step that never triggers rework",
                );
            }
        }
    }

    let mut product_ids = HashSet::new();
    for (idx, product) in project.products.iter().enumerate() {
        let row = Some(idx + 1);
        if !product_ids.insert(product.product_id.as_str()) {
            report.error(
                "products",
                row,
                "product_id",
                format!("duplicate product id '{}'", product.product_id),
            );
        }
        if !route_ids.contains(product.route_id.as_str()) {
            report.error(
                "products",
                row,
                "route_id",
                format!("unknown route '{}'", product.route_id),
            );
        }
    }

    for (idx, entry) in project.setup_matrix.iter().enumerate() {
        if !(entry.setup_time.is_finite() && entry.setup_time >= 0.0) {
            report.error("setup_matrix", Some(idx + 1), "setup_time", "must be >= 0");
        }
    }

    let mut job_ids = HashSet::new();
    for (idx, job) in project.jobs.iter().enumerate() {
        let row = Some(idx + 1);
        if !job_ids.insert(job.job_id.as_str()) {
            report.error("jobs", row, "job_id", format!("duplicate job id '{}'", job.job_id));
        }
        if !product_ids.contains(job.product_id.as_str()) {
            report.error("jobs", row, "product_id", format!("unknown product '{}'", job.product_id));
        }
        if !(job.release_time.is_finite() && job.release_time >= 0.0) {
            report.error("jobs", row, "release_time", "must be a finite time >= 0");
        }
        if !job.due_date.is_finite() {
            report.error("jobs", row, "due_date", "must be finite");
        } else if job.due_date < job.release_time {
            report.warning("jobs", row, "due_date", "due before release; job is late on arrival");
        }
    }

    let mut generated_ids: HashSet<JobId> = HashSet::new();
    for (idx, (stream, first)) in project.demand.iter().zip(project.demand_ordinals()).enumerate() {
        let row = Some(idx + 1);
        if !product_ids.contains(stream.product_id.as_str()) {
            report.error(
                "demand",
                row,
                "product_id",
                format!("unknown product '{}'", stream.product_id),
            );
        }
        if !(stream.interarrival_mean.is_finite() && stream.interarrival_mean > 0.0) {
            report.error("demand", row, "interarrival_mean", "must be > 0");
        }
        if !(stream.due_offset.is_finite() && stream.due_offset >= 0.0) {
            report.error("demand", row, "due_offset", "must be >= 0");
        }
        if !(stream.start.is_finite() && stream.start >= 0.0) {
            report.error("demand", row, "start", "must be >= 0");
        }
        // Generated ids must not shadow explicit jobs or another stream's jobs.
        for generated in stream.job_ids(first) {
            if !generated_ids.insert(generated.clone()) || job_ids.contains(generated.as_str()) {
                report.error(
                    "demand",
                    row,
                    "product_id",
                    format!("generated job id '{}' collides with another job", generated),
                );
                break;
            }
        }
    }

    report
}
