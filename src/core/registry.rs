//! Per-run resource state: machines with their running operations and the
//! operator pool.

use super::downtime::DowntimeCalendar;
use super::project::{ProjectConfig, TimeWindow};
use super::types::{
    CellId, FamilyId, JobId, MachineGroupId, MachineId, MachineState, OperatorId, SimTime,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    Setup,
    Process,
}

/// One job occupying one capacity slot of a machine
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub job_id: JobId,
    pub phase: OperationPhase,
    /// Scheduled end of the current phase; meaningless while suspended
    pub ends_at: SimTime,
    /// Work left in the current phase when suspended
    pub remaining: SimTime,
    pub suspended: bool,
    pub epoch: u64,
    pub setup_time: SimTime,
    pub process_time: SimTime,
    pub operator: Option<OperatorId>,
}

#[derive(Debug, Clone)]
pub struct MachineRuntime {
    pub id: MachineId,
    pub cell_id: CellId,
    pub group: MachineGroupId,
    pub capacity: u32,
    pub last_family: Option<FamilyId>,
    pub operations: Vec<Operation>,
    /// End of the current downtime, if the machine is down
    pub down_until: Option<SimTime>,
    pub calendar: DowntimeCalendar,
}

impl MachineRuntime {
    pub fn is_down(&self) -> bool {
        self.down_until.is_some()
    }

    pub fn free_slots(&self) -> u32 {
        if self.is_down() {
            return 0;
        }
        self.capacity.saturating_sub(self.operations.len() as u32)
    }

    pub fn state(&self) -> MachineState {
        if self.is_down() {
            MachineState::Down
        } else if self.operations.iter().any(|op| op.phase == OperationPhase::Setup) {
            MachineState::Setup
        } else if self.operations.is_empty() {
            MachineState::Idle
        } else {
            MachineState::Busy
        }
    }

    pub fn operation_mut(&mut self, job_id: &str) -> Option<&mut Operation> {
        self.operations.iter_mut().find(|op| op.job_id == job_id)
    }

    pub fn remove_operation(&mut self, job_id: &str) -> Option<Operation> {
        let index = self.operations.iter().position(|op| op.job_id == job_id)?;
        Some(self.operations.remove(index))
    }
}

#[derive(Debug, Clone)]
pub struct OperatorRuntime {
    pub id: OperatorId,
    pub skills: Vec<MachineGroupId>,
    pub shifts: Vec<TimeWindow>,
    pub busy: bool,
}

impl OperatorRuntime {
    pub fn on_shift(&self, now: SimTime) -> bool {
        self.shifts.is_empty() || self.shifts.iter().any(|w| w.contains(now))
    }

    pub fn can_run(&self, group: &str) -> bool {
        self.skills.iter().any(|s| s == group)
    }

    pub fn is_available(&self, group: &str, now: SimTime) -> bool {
        !self.busy && self.can_run(group) && self.on_shift(now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    machines: BTreeMap<MachineId, MachineRuntime>,
    /// Machine ids per group in declaration order
    groups: BTreeMap<MachineGroupId, Vec<MachineId>>,
    operators: Vec<OperatorRuntime>,
}

impl ResourceRegistry {
    pub fn from_project(project: &ProjectConfig) -> Self {
        let mut machines = BTreeMap::new();
        let mut groups: BTreeMap<MachineGroupId, Vec<MachineId>> = BTreeMap::new();
        for spec in &project.machines {
            groups
                .entry(spec.group().to_string())
                .or_default()
                .push(spec.id.clone());
            machines.insert(
                spec.id.clone(),
                MachineRuntime {
                    id: spec.id.clone(),
                    cell_id: spec.cell_id.clone(),
                    group: spec.group().to_string(),
                    capacity: spec.capacity,
                    last_family: None,
                    operations: Vec::new(),
                    down_until: None,
                    calendar: DowntimeCalendar::new(),
                },
            );
        }
        let operators = project
            .operators
            .iter()
            .map(|spec| OperatorRuntime {
                id: spec.id.clone(),
                skills: spec.skills.clone(),
                shifts: spec.shifts.clone(),
                busy: false,
            })
            .collect();
        Self {
            machines,
            groups,
            operators,
        }
    }

    pub fn machine(&self, id: &str) -> Option<&MachineRuntime> {
        self.machines.get(id)
    }

    pub fn machine_mut(&mut self, id: &str) -> Option<&mut MachineRuntime> {
        self.machines.get_mut(id)
    }

    pub fn machines(&self) -> impl Iterator<Item = &MachineRuntime> {
        self.machines.values()
    }

    pub fn groups(&self) -> &BTreeMap<MachineGroupId, Vec<MachineId>> {
        &self.groups
    }

    pub fn operators(&self) -> &[OperatorRuntime] {
        &self.operators
    }

    pub fn has_active_operations(&self) -> bool {
        self.machines.values().any(|m| !m.operations.is_empty())
    }

    pub fn any_machine_down(&self) -> bool {
        self.machines.values().any(MachineRuntime::is_down)
    }

    pub fn has_skilled_operator(&self, group: &str) -> bool {
        self.operators.iter().any(|op| op.can_run(group))
    }

    pub fn operator_available(&self, group: &str, now: SimTime) -> bool {
        self.operators.iter().any(|op| op.is_available(group, now))
    }

    /// Claim the first free, skilled, on-shift operator in declaration order
    pub fn claim_operator(&mut self, group: &str, now: SimTime) -> Option<OperatorId> {
        let operator = self
            .operators
            .iter_mut()
            .find(|op| op.is_available(group, now))?;
        operator.busy = true;
        Some(operator.id.clone())
    }

    pub fn release_operator(&mut self, id: &str) {
        if let Some(operator) = self.operators.iter_mut().find(|op| op.id == id) {
            operator.busy = false;
        }
    }
}
