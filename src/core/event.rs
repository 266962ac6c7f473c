use super::downtime::DowntimeWindow;
use super::types::{JobId, MachineId, OperatorId};

/// Internal transitions driven by the scheduler.
///
/// Timeline entries are derived from these but are not the same thing: one
/// event can record several timeline rows or none at all.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    /// A job enters the backlog
    JobArrival { job_id: JobId },
    /// The current phase of an operation ends. `epoch` guards against
    /// completions made stale by an interruption.
    OperationComplete {
        machine_id: MachineId,
        job_id: JobId,
        epoch: u64,
    },
    DowntimeStart { window: DowntimeWindow },
    DowntimeEnd { machine_id: MachineId },
    /// An operator shift begins; idle machines are re-dispatched
    ShiftStart { operator_id: OperatorId },
}

impl SimEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SimEvent::JobArrival { .. } => "job_arrival",
            SimEvent::OperationComplete { .. } => "operation_complete",
            SimEvent::DowntimeStart { .. } => "downtime_start",
            SimEvent::DowntimeEnd { .. } => "downtime_end",
            SimEvent::ShiftStart { .. } => "shift_start",
        }
    }
}
