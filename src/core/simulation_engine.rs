//! The run loop: one deterministic discrete-event simulation of a project
//! under a scenario.
//!
//! Each `step` advances the clock to the next timestamp, handles every event
//! due at that instant, then settles the shop floor: jobs blocked at a cell
//! boundary retry for a card, the release controller admits backlog work and
//! idle machines pick from their group queues.

use super::dispatch::{Dispatcher, JobView, QueueState};
use super::downtime::{planned_windows, DowntimeKind, DowntimeWindow, FailureModel};
use super::error::{SimError, SimResult};
use super::event::SimEvent;
use super::event_scheduler::EventScheduler;
use super::job::{Job, JobStatus};
use super::project::{validate_project, ProjectConfig, Route, SetupMatrix};
use super::registry::{Operation, OperationPhase, ResourceRegistry};
use super::release::{loop_at, route_cells, ReleaseCandidate, ReleaseController, ReleasePolicy};
use super::rework::{InspectionResult, ReworkDecision, ReworkEngine, ScrapReason};
use super::rng::RngContext;
use super::scenario::ScenarioConfig;
use super::timeline::{EventDetail, ResourceInfo, Timeline, TimelineEventType, TimelineRecorder};
use super::types::{
    clamp_duration, CellId, CellPair, JobId, MachineGroupId, MachineId, MachineState, RouteId, SimTime,
};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Observer trait for simulation progress
pub trait SimulationObserver {
    /// Called when the simulation clock advances
    fn on_time_advance(&mut self, old_time: SimTime, new_time: SimTime);

    /// Called when all events of one timestamp are handled and work is dispatched
    fn on_step_complete(&mut self, time: SimTime, wip: &BTreeMap<RouteId, u32>);
}

pub struct Simulation {
    label: String,
    scheduler: EventScheduler,
    recorder: TimelineRecorder,
    rng: RngContext,
    registry: ResourceRegistry,
    group_order: Arc<Vec<(MachineGroupId, Vec<MachineId>)>>,
    dispatcher: Dispatcher,
    release: ReleaseController,
    rework: ReworkEngine,
    setups: SetupMatrix,
    failure_models: BTreeMap<MachineId, FailureModel>,
    cells_by_route: HashMap<RouteId, Vec<CellId>>,
    jobs: BTreeMap<JobId, Job>,
    backlog: Vec<ReleaseCandidate>,
    queues: BTreeMap<MachineGroupId, Vec<JobId>>,
    blocked: Vec<(JobId, CellPair)>,
    process_noise: bool,
    labor_constrained: bool,
    horizon: Option<SimTime>,
    max_events: Option<u64>,
    current_time: SimTime,
    events_processed: u64,
    pending_arrivals: usize,
    pending_shift_starts: usize,
    open_jobs: usize,
    next_epoch: u64,
    observers: Vec<Box<dyn SimulationObserver>>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Simulation {
    /// Build a run of `project` under `scenario`, seeding every stream from `seed`.
    ///
    /// The project is re-validated and the scenario checked against it; both
    /// failures are reported before any event is scheduled.
    pub fn new(project: &ProjectConfig, scenario: &ScenarioConfig, seed: u64) -> SimResult<Self> {
        let report = validate_project(project);
        if !report.is_valid() {
            return Err(SimError::InvalidProject { report });
        }
        for warning in &report.warnings {
            warn!("project {}: {}", project.project_id, warning);
        }
        scenario.validate(project)?;

        let mut rng = RngContext::new(seed);
        let mut scheduler = EventScheduler::new();

        let routes: HashMap<RouteId, Arc<Route>> = project
            .routes
            .iter()
            .map(|route| (route.route_id.clone(), Arc::new(route.clone())))
            .collect();
        let cells_by_route: HashMap<RouteId, Vec<CellId>> = project
            .routes
            .iter()
            .map(|route| (route.route_id.clone(), route_cells(project, route)))
            .collect();

        let mut jobs = BTreeMap::new();
        for spec in project.expand_jobs(&mut rng) {
            let product = project.product(&spec.product_id).ok_or_else(|| {
                SimError::config(format!("job '{}' references unknown product '{}'", spec.job_id, spec.product_id))
            })?;
            let route = routes.get(&product.route_id).cloned().ok_or_else(|| {
                SimError::config(format!("product '{}' references unknown route '{}'", product.product_id, product.route_id))
            })?;
            scheduler.schedule(
                SimEvent::JobArrival {
                    job_id: spec.job_id.clone(),
                },
                spec.release_time,
            );
            let family = product.family_id.clone();
            let job_id = spec.job_id.clone();
            let job = Job::new(spec.job_id, spec.product_id, family, route, spec.release_time, spec.due_date);
            if jobs.insert(job_id.clone(), job).is_some() {
                return Err(SimError::config(format!("duplicate job id '{}'", job_id)));
            }
        }

        for window in planned_windows(project) {
            let start = window.start;
            scheduler.schedule(SimEvent::DowntimeStart { window }, start);
        }

        let mut failure_models = BTreeMap::new();
        if scenario.toggles.failures_enabled {
            for machine in &project.machines {
                if let Some(model) = FailureModel::from_machine(machine) {
                    failure_models.insert(machine.id.clone(), model);
                }
            }
            for (machine_id, model) in &failure_models {
                let window = model.next_downtime(machine_id, 0.0, &mut rng);
                let start = window.start;
                scheduler.schedule(SimEvent::DowntimeStart { window }, start);
            }
        }

        let mut pending_shift_starts = 0;
        if scenario.toggles.labor_constrained {
            for operator in &project.operators {
                for shift in operator.shifts.iter().filter(|shift| shift.start > 0.0) {
                    scheduler.schedule(
                        SimEvent::ShiftStart {
                            operator_id: operator.id.clone(),
                        },
                        shift.start,
                    );
                    pending_shift_starts += 1;
                }
            }
        }

        let registry = ResourceRegistry::from_project(project);
        let group_order: Arc<Vec<(MachineGroupId, Vec<MachineId>)>> = Arc::new(
            registry
                .groups()
                .iter()
                .map(|(group, machines)| (group.clone(), machines.clone()))
                .collect(),
        );

        Ok(Self {
            label: format!("{}:{}", project.project_id, scenario.label()),
            scheduler,
            recorder: TimelineRecorder::new(),
            rng,
            registry,
            group_order,
            dispatcher: Dispatcher::new(scenario.dispatch_rule, scenario.atc.clone()),
            release: scenario.release_controller(project)?,
            rework: ReworkEngine::new(
                scenario.rework_cap,
                scenario.toggles.rework_enabled,
                scenario.toggles.yield_loss_enabled,
            ),
            setups: SetupMatrix::from_entries(&project.setup_matrix),
            failure_models,
            cells_by_route,
            pending_arrivals: jobs.len(),
            open_jobs: jobs.len(),
            jobs,
            backlog: Vec::new(),
            queues: BTreeMap::new(),
            blocked: Vec::new(),
            process_noise: scenario.toggles.process_noise_enabled,
            labor_constrained: scenario.toggles.labor_constrained,
            horizon: scenario.horizon,
            max_events: scenario.max_events,
            current_time: 0.0,
            events_processed: 0,
            pending_shift_starts,
            next_epoch: 0,
            observers: Vec::new(),
            cancel: None,
        })
    }

    /// Add an observer to the simulation
    pub fn add_observer(&mut self, observer: Box<dyn SimulationObserver>) {
        self.observers.push(observer);
    }

    /// Abort the run with `Cancelled` once `flag` is set
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn current_time(&self) -> SimTime {
        self.current_time
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn machine_state(&self, machine_id: &str) -> Option<MachineState> {
        self.registry.machine(machine_id).map(|m| m.state())
    }

    /// Merged downtime windows a machine has entered so far
    pub fn downtime_windows(&self, machine_id: &str) -> Option<&[DowntimeWindow]> {
        self.registry.machine(machine_id).map(|m| m.calendar.windows())
    }

    pub fn release_controller(&self) -> &ReleaseController {
        &self.release
    }

    /// All jobs are terminal and no arrival is pending
    pub fn is_finished(&self) -> bool {
        self.pending_arrivals == 0 && self.open_jobs == 0
    }

    /// Run until every job is terminal or the scenario horizon is reached
    pub fn run(&mut self) -> SimResult<SimTime> {
        self.run_until(self.horizon)
    }

    /// Run until every job is terminal or `end_time` is reached.
    /// Returns the final clock value.
    pub fn run_until(&mut self, end_time: Option<SimTime>) -> SimResult<SimTime> {
        info!(
            "run {} starting: {} job(s), rule {}, policy {}",
            self.label,
            self.jobs.len(),
            self.dispatcher.rule(),
            self.release.policy()
        );

        while !self.is_finished() {
            if self.cancel.as_ref().map_or(false, |flag| flag.load(Ordering::Relaxed)) {
                info!("run {} cancelled at t={:.4}", self.label, self.current_time);
                return Err(SimError::Cancelled {
                    run_id: self.label.clone(),
                });
            }

            match (self.scheduler.peek_time(), end_time) {
                (None, _) => return Err(self.deadlock("no events left")),
                (Some(next), Some(end)) if next > end => {
                    self.advance_clock(end);
                    break;
                }
                _ => {}
            }

            self.step()?;
        }

        info!(
            "run {} finished at t={:.4} after {} event(s), {} job(s) open",
            self.label, self.current_time, self.events_processed, self.open_jobs
        );
        Ok(self.current_time)
    }

    /// Process one timestamp, returns true if events remain
    pub fn step(&mut self) -> SimResult<bool> {
        let Some(time) = self.scheduler.peek_time() else {
            return Ok(false);
        };
        self.advance_clock(time);

        for scheduled in self.scheduler.get_next_time_events() {
            if let Some(max) = self.max_events {
                if self.events_processed >= max {
                    return Err(SimError::Deadlock {
                        time,
                        pending_jobs: self.open_jobs,
                        detail: format!("event budget of {} exhausted", max),
                    });
                }
            }
            self.events_processed += 1;
            debug!("t={:.4} #{} {}", time, scheduled.sequence_num, scheduled.event.kind());
            self.handle(scheduled.event);
        }

        self.settle();

        for observer in &mut self.observers {
            observer.on_step_complete(time, self.release.wip_by_route());
        }

        self.check_progress()?;
        Ok(self.scheduler.has_events())
    }

    /// Finalize the timeline artifact
    pub fn finish(self) -> Timeline {
        let machines = self
            .registry
            .machines()
            .map(|m| ResourceInfo {
                id: m.id.clone(),
                capacity: m.capacity,
            })
            .collect();
        let unfinished = self
            .jobs
            .values()
            .filter(|job| job.arrived && !job.status.is_terminal())
            .map(|job| job.id.clone())
            .collect();
        self.recorder.finalize(self.current_time, machines, unfinished)
    }

    fn advance_clock(&mut self, time: SimTime) {
        if time > self.current_time {
            let old_time = self.current_time;
            self.current_time = time;
            for observer in &mut self.observers {
                observer.on_time_advance(old_time, time);
            }
        }
    }

    fn record(&mut self, event_type: TimelineEventType, job_id: Option<&str>, machine_id: Option<&str>, detail: EventDetail) {
        self.recorder
            .record(self.current_time, event_type, job_id, machine_id, detail);
    }

    fn step_detail(&self, job_id: &str) -> EventDetail {
        self.jobs
            .get(job_id)
            .and_then(Job::current_step)
            .map_or_else(EventDetail::default, |step| EventDetail::step(step.step_number))
    }

    fn deadlock(&self, detail: &str) -> SimError {
        warn!("run {} deadlocked at t={:.4}: {}", self.label, self.current_time, detail);
        SimError::Deadlock {
            time: self.current_time,
            pending_jobs: self.open_jobs + self.pending_arrivals,
            detail: detail.to_string(),
        }
    }

    /// Fail when jobs remain but no future event can move any of them
    fn check_progress(&self) -> SimResult<()> {
        if self.open_jobs == 0 || self.pending_arrivals > 0 || self.pending_shift_starts > 0 {
            return Ok(());
        }
        if self.registry.has_active_operations() || self.registry.any_machine_down() {
            return Ok(());
        }
        let detail = if !self.blocked.is_empty() {
            format!("{} job(s) waiting for POLCA cards at a cell boundary", self.blocked.len())
        } else if !self.backlog.is_empty() {
            format!("{} job(s) can never be admitted", self.backlog.len())
        } else {
            "queued work has no machine or operator that can ever start it".to_string()
        };
        Err(self.deadlock(&detail))
    }

    fn handle(&mut self, event: SimEvent) {
        match event {
            SimEvent::JobArrival { job_id } => self.handle_arrival(&job_id),
            SimEvent::OperationComplete {
                machine_id,
                job_id,
                epoch,
            } => self.handle_operation_complete(&machine_id, &job_id, epoch),
            SimEvent::DowntimeStart { window } => self.handle_downtime_start(window),
            SimEvent::DowntimeEnd { machine_id } => self.handle_downtime_end(&machine_id),
            SimEvent::ShiftStart { operator_id } => {
                debug!("t={:.4}: operator {} starts shift", self.current_time, operator_id);
                self.pending_shift_starts = self.pending_shift_starts.saturating_sub(1);
            }
        }
    }

    fn handle_arrival(&mut self, job_id: &str) {
        self.pending_arrivals = self.pending_arrivals.saturating_sub(1);
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        job.arrived = true;
        let route_id = job.route.route_id.clone();
        let detail = EventDetail::default()
            .with_due_date(job.due_date)
            .with_route(route_id.clone());
        let entry_pair = match self.release.policy() {
            ReleasePolicy::Polca => self
                .cells_by_route
                .get(&route_id)
                .and_then(|cells| loop_at(cells, 0)),
            _ => None,
        };
        self.record(TimelineEventType::Arrival, Some(job_id), None, detail);
        self.backlog.push(ReleaseCandidate {
            job_id: job_id.to_string(),
            route_id,
            entry_pair,
        });
    }

    fn settle(&mut self) {
        self.retry_blocked();
        self.release_backlog();
        self.dispatch();
    }

    fn retry_blocked(&mut self) {
        if self.blocked.is_empty() {
            return;
        }
        for (job_id, pair) in std::mem::take(&mut self.blocked) {
            if self.release.acquire_card(&pair) {
                if let Some(job) = self.jobs.get_mut(&job_id) {
                    job.held_cards.insert(pair);
                }
                self.enqueue(&job_id);
            } else {
                self.blocked.push((job_id, pair));
            }
        }
    }

    fn release_backlog(&mut self) {
        if self.backlog.is_empty() {
            return;
        }
        let now = self.current_time;
        for job_id in self.release.release_jobs(now, &mut self.backlog) {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            job.released_at = Some(now);
            let route_id = job.route.route_id.clone();
            if self.release.policy() == ReleasePolicy::Polca {
                if let Some(pair) = self.cells_by_route.get(&route_id).and_then(|cells| loop_at(cells, 0)) {
                    job.held_cards.insert(pair);
                }
            }
            self.record(
                TimelineEventType::Release,
                Some(&job_id),
                None,
                EventDetail::default().with_route(route_id),
            );
            self.enqueue(&job_id);
        }
    }

    fn enqueue(&mut self, job_id: &str) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        let Some(group) = job.current_step().map(|step| step.machine_group_id.clone()) else {
            return;
        };
        job.status = JobStatus::Queued;
        job.current_queue = Some(group.clone());
        self.queues.entry(group).or_default().push(job_id.to_string());
    }

    fn dispatch(&mut self) {
        let now = self.current_time;
        let order = Arc::clone(&self.group_order);
        for (group, machine_ids) in order.iter() {
            for machine_id in machine_ids {
                while let Some(job_id) = self.pick_job(group, machine_id) {
                    let operator = if self.labor_constrained {
                        match self.registry.claim_operator(group, now) {
                            Some(operator) => Some(operator),
                            None => break,
                        }
                    } else {
                        None
                    };
                    if let Some(queue) = self.queues.get_mut(group) {
                        queue.retain(|id| id != &job_id);
                    }
                    self.start_operation(machine_id, &job_id, operator);
                }
            }
        }
    }

    /// Job the machine would take next, if it can start one now
    fn pick_job(&self, group: &str, machine_id: &str) -> Option<JobId> {
        let machine = self.registry.machine(machine_id)?;
        if machine.free_slots() == 0 {
            return None;
        }
        let queue = self.queues.get(group).filter(|queue| !queue.is_empty())?;
        if self.labor_constrained && !self.registry.operator_available(group, self.current_time) {
            return None;
        }
        let views: Vec<JobView<'_>> = queue
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .map(Job::view)
            .collect();
        let state = QueueState::new(views, machine.last_family.as_deref());
        self.dispatcher
            .select_next_job(&state, self.current_time)
            .map(|view| view.job_id.to_string())
    }

    fn start_operation(&mut self, machine_id: &str, job_id: &str, operator: Option<String>) {
        let now = self.current_time;
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        let Some(step) = job.current_step().cloned() else {
            return;
        };
        let family = job.family_at_current_step().to_string();
        job.status = JobStatus::InProcess;
        job.current_queue = None;

        let Some(machine) = self.registry.machine_mut(machine_id) else {
            return;
        };
        let previous = machine.last_family.clone();
        let needs_setup = SetupMatrix::requires_setup(previous.as_deref(), &family);
        let setup_time = if needs_setup {
            self.setups.lookup(previous.as_deref(), &family)
        } else {
            0.0
        };
        let process_time = if self.process_noise {
            self.rng.process_time(step.process_time_mean, step.process_time_sd)
        } else {
            clamp_duration(step.process_time_mean)
        };

        let (phase, duration) = if setup_time > 0.0 {
            (OperationPhase::Setup, setup_time)
        } else {
            (OperationPhase::Process, process_time)
        };
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        machine.last_family = Some(family.clone());
        machine.operations.push(Operation {
            job_id: job_id.to_string(),
            phase,
            ends_at: now + duration,
            remaining: 0.0,
            suspended: false,
            epoch,
            setup_time,
            process_time,
            operator,
        });
        self.scheduler.schedule(
            SimEvent::OperationComplete {
                machine_id: machine_id.to_string(),
                job_id: job_id.to_string(),
                epoch,
            },
            now + duration,
        );
        debug!(
            "t={:.4}: {} starts step {} on {} (setup {:.4}, process {:.4})",
            now, job_id, step.step_number, machine_id, setup_time, process_time
        );

        let detail = EventDetail::step(step.step_number);
        if needs_setup {
            self.record(
                TimelineEventType::SetupStart,
                Some(job_id),
                Some(machine_id),
                detail
                    .clone()
                    .with_family(family)
                    .with_from_family(previous)
                    .with_duration(setup_time),
            );
            if phase == OperationPhase::Process {
                self.record(TimelineEventType::SetupEnd, Some(job_id), Some(machine_id), detail.clone());
            }
        }
        if phase == OperationPhase::Process {
            self.record(
                TimelineEventType::ProcessStart,
                Some(job_id),
                Some(machine_id),
                detail.with_duration(process_time),
            );
        }
    }

    fn handle_operation_complete(&mut self, machine_id: &str, job_id: &str, epoch: u64) {
        let now = self.current_time;
        let Some(machine) = self.registry.machine_mut(machine_id) else {
            return;
        };
        let Some(op) = machine.operation_mut(job_id) else {
            return;
        };
        if op.epoch != epoch || op.suspended {
            debug!("t={:.4}: stale completion of {} on {}", now, job_id, machine_id);
            return;
        }

        let phase = op.phase;
        match phase {
            OperationPhase::Setup => {
                let new_epoch = self.next_epoch;
                self.next_epoch += 1;
                op.phase = OperationPhase::Process;
                op.epoch = new_epoch;
                op.ends_at = now + op.process_time;
                let (ends_at, process_time) = (op.ends_at, op.process_time);
                self.scheduler.schedule(
                    SimEvent::OperationComplete {
                        machine_id: machine_id.to_string(),
                        job_id: job_id.to_string(),
                        epoch: new_epoch,
                    },
                    ends_at,
                );
                let detail = self.step_detail(job_id);
                self.record(TimelineEventType::SetupEnd, Some(job_id), Some(machine_id), detail.clone());
                self.record(
                    TimelineEventType::ProcessStart,
                    Some(job_id),
                    Some(machine_id),
                    detail.with_duration(process_time),
                );
            }
            OperationPhase::Process => {
                let operator = machine.remove_operation(job_id).and_then(|op| op.operator);
                if let Some(operator) = operator {
                    self.registry.release_operator(&operator);
                }
                let detail = self.step_detail(job_id);
                self.record(TimelineEventType::ProcessEnd, Some(job_id), Some(machine_id), detail);
                self.finish_step(job_id, machine_id);
            }
        }
    }

    /// Yield, inspection and routing after a step's processing ends
    fn finish_step(&mut self, job_id: &str, machine_id: &str) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        let Some(step) = job.current_step().cloned() else {
            return;
        };
        let index = job.step_index;

        if !self.rework.apply_yield(&step, &mut self.rng) {
            self.scrap(job_id, machine_id, ScrapReason::YieldLoss);
            return;
        }

        if let Some(result) = self.rework.inspect(&step, &mut self.rng) {
            let outcome = match result {
                InspectionResult::Passed => "passed",
                InspectionResult::Failed => "failed",
            };
            self.record(
                TimelineEventType::Inspection,
                Some(job_id),
                Some(machine_id),
                EventDetail::step(step.step_number).with_reason(outcome),
            );

            let Some(job) = self.jobs.get_mut(job_id) else {
                return;
            };
            let route = Arc::clone(&job.route);
            let decision = self
                .rework
                .apply_rework_if_needed(&mut job.rework_count, &route, index, result);
            match decision {
                ReworkDecision::Continue => {}
                ReworkDecision::Rework { target_index } => {
                    let count = job.rework_count;
                    let target = route.steps.get(target_index).map_or(0, |s| s.step_number);
                    debug!("t={:.4}: {} rework #{} back to step {}", self.current_time, job_id, count, target);
                    self.record(
                        TimelineEventType::Rework,
                        Some(job_id),
                        Some(machine_id),
                        EventDetail::step(target).with_reason(format!("failed inspection at step {}", step.step_number)),
                    );
                    self.move_to_step(job_id, target_index);
                    return;
                }
                ReworkDecision::Scrapped { reason } => {
                    self.scrap(job_id, machine_id, reason);
                    return;
                }
            }
        }

        match self.jobs.get(job_id).map(Job::is_last_step) {
            Some(true) => self.complete(job_id),
            Some(false) => self.move_to_step(job_id, index + 1),
            None => {}
        }
    }

    /// Point the job at `new_index` and queue it, crossing a POLCA boundary if
    /// the step lies in another cell
    fn move_to_step(&mut self, job_id: &str, new_index: usize) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        let from = job.step_index;
        job.step_index = new_index;

        if self.release.policy() == ReleasePolicy::Polca {
            if let Some(cells) = self.cells_by_route.get(&job.route.route_id) {
                if let (Some(from_cell), Some(to_cell)) = (cells.get(from), cells.get(new_index)) {
                    if from_cell != to_cell {
                        let leaving: Vec<CellPair> = job
                            .held_cards
                            .iter()
                            .filter(|pair| &pair.downstream == from_cell)
                            .cloned()
                            .collect();
                        for pair in leaving {
                            job.held_cards.remove(&pair);
                            self.release.return_card(&pair);
                        }

                        if let Some(required) = loop_at(cells, new_index) {
                            if !job.held_cards.contains(&required) {
                                if self.release.acquire_card(&required) {
                                    job.held_cards.insert(required);
                                } else {
                                    job.status = JobStatus::Blocked;
                                    job.current_queue = None;
                                    let step = job.current_step().map_or(0, |s| s.step_number);
                                    self.recorder.record(
                                        self.current_time,
                                        TimelineEventType::Blocked,
                                        Some(job_id),
                                        None,
                                        EventDetail::step(step).with_reason(required.to_string()),
                                    );
                                    self.blocked.push((job_id.to_string(), required));
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }

        self.enqueue(job_id);
    }

    fn complete(&mut self, job_id: &str) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        debug_assert!(self.current_time >= job.release_time);
        job.status = JobStatus::Completed;
        let due = job.due_date;
        let route_id = job.route.route_id.clone();
        let cards = std::mem::take(&mut job.held_cards);
        debug!("t={:.4}: {} completed (due {:.4})", self.current_time, job_id, due);
        self.record(
            TimelineEventType::Completion,
            Some(job_id),
            None,
            EventDetail::default().with_due_date(due),
        );
        self.exit_system(&route_id, cards);
    }

    fn scrap(&mut self, job_id: &str, machine_id: &str, reason: ScrapReason) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        job.status = JobStatus::Scrapped;
        let route_id = job.route.route_id.clone();
        let cards = std::mem::take(&mut job.held_cards);
        let detail = self.step_detail(job_id).with_reason(reason.name());
        debug!("t={:.4}: {} scrapped ({})", self.current_time, job_id, reason.name());
        self.record(TimelineEventType::Scrap, Some(job_id), Some(machine_id), detail);
        self.exit_system(&route_id, cards);
    }

    fn exit_system(&mut self, route_id: &str, cards: impl IntoIterator<Item = CellPair>) {
        self.open_jobs = self.open_jobs.saturating_sub(1);
        self.release.on_job_exit(route_id);
        for pair in cards {
            self.release.return_card(&pair);
        }
    }

    fn handle_downtime_start(&mut self, window: DowntimeWindow) {
        let now = self.current_time;
        if window.kind == DowntimeKind::Failure {
            // The next failure is counted from the end of this repair.
            if let Some(model) = self.failure_models.get(&window.machine_id) {
                let next = model.next_downtime(&window.machine_id, window.end, &mut self.rng);
                let start = next.start;
                self.scheduler.schedule(SimEvent::DowntimeStart { window: next }, start);
            }
        }

        let machine_id = window.machine_id.clone();
        let Some(machine) = self.registry.machine_mut(&machine_id) else {
            return;
        };
        machine.calendar.insert(window.clone());
        let detail = EventDetail::default()
            .with_duration(window.duration())
            .with_reason(window.kind.name());

        if let Some(until) = machine.down_until {
            if window.end > until {
                machine.down_until = Some(window.end);
                self.scheduler.schedule(
                    SimEvent::DowntimeEnd {
                        machine_id: machine_id.clone(),
                    },
                    window.end,
                );
            }
            self.record(TimelineEventType::DowntimeExtended, None, Some(&machine_id), detail);
            return;
        }

        machine.down_until = Some(window.end);
        let mut interrupted = Vec::new();
        for op in machine.operations.iter_mut().filter(|op| !op.suspended) {
            let remaining = op.ends_at - now;
            if remaining > 0.0 {
                op.suspended = true;
                op.remaining = remaining;
                op.epoch = self.next_epoch;
                self.next_epoch += 1;
                interrupted.push((op.job_id.clone(), remaining));
            }
        }
        self.scheduler.schedule(
            SimEvent::DowntimeEnd {
                machine_id: machine_id.clone(),
            },
            window.end,
        );
        debug!(
            "t={:.4}: {} down until {:.4} ({}), {} operation(s) suspended",
            now,
            machine_id,
            window.end,
            window.kind.name(),
            interrupted.len()
        );
        self.record(TimelineEventType::DowntimeStart, None, Some(&machine_id), detail);
        for (job_id, remaining) in interrupted {
            let detail = self.step_detail(&job_id).with_duration(remaining);
            self.record(TimelineEventType::Interrupted, Some(&job_id), Some(&machine_id), detail);
        }
    }

    fn handle_downtime_end(&mut self, machine_id: &str) {
        let now = self.current_time;
        let Some(machine) = self.registry.machine_mut(machine_id) else {
            return;
        };
        match machine.down_until {
            Some(until) if now >= until => {}
            _ => {
                // Superseded by a coalesced window
                return;
            }
        }
        machine.down_until = None;

        let mut resumed = Vec::new();
        for op in machine.operations.iter_mut().filter(|op| op.suspended) {
            op.suspended = false;
            op.ends_at = now + op.remaining;
            op.epoch = self.next_epoch;
            self.next_epoch += 1;
            self.scheduler.schedule(
                SimEvent::OperationComplete {
                    machine_id: machine_id.to_string(),
                    job_id: op.job_id.clone(),
                    epoch: op.epoch,
                },
                op.ends_at,
            );
            resumed.push((op.job_id.clone(), op.remaining));
            op.remaining = 0.0;
        }

        self.record(TimelineEventType::DowntimeEnd, None, Some(machine_id), EventDetail::default());
        for (job_id, remaining) in resumed {
            let detail = self.step_detail(&job_id).with_duration(remaining);
            self.record(TimelineEventType::Resumed, Some(&job_id), Some(machine_id), detail);
        }
    }
}

/// Run a scenario to completion with its own seed
pub fn simulate(project: &ProjectConfig, scenario: &ScenarioConfig) -> SimResult<Timeline> {
    let mut simulation = Simulation::new(project, scenario, scenario.seed)?;
    simulation.run()?;
    Ok(simulation.finish())
}
