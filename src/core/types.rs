use serde::{Deserialize, Serialize};

/// Simulated time in hours since the start of the run
pub type SimTime = f64;

pub type JobId = String;
pub type MachineId = String;
pub type MachineGroupId = String;
pub type CellId = String;
pub type RouteId = String;
pub type ProductId = String;
pub type FamilyId = String;
pub type OperatorId = String;

/// Smallest duration the engine will schedule. Sampled or computed durations
/// below this are clamped up to it.
pub const MIN_DURATION: SimTime = 1e-6;

/// Current state of a machine as seen by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Idle,
    Busy,
    Setup,
    Down,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MachineState::Idle => "idle",
            MachineState::Busy => "busy",
            MachineState::Setup => "setup",
            MachineState::Down => "down",
        };
        write!(f, "{}", name)
    }
}

/// Directed (upstream, downstream) cell pair keying a POLCA card pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPair {
    pub upstream: CellId,
    pub downstream: CellId,
}

impl CellPair {
    pub fn new(upstream: impl Into<CellId>, downstream: impl Into<CellId>) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
        }
    }
}

impl std::fmt::Display for CellPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.upstream, self.downstream)
    }
}

/// Clamp a duration to a finite, strictly positive value
pub fn clamp_duration(duration: SimTime) -> SimTime {
    if duration.is_finite() && duration >= MIN_DURATION {
        duration
    } else {
        MIN_DURATION
    }
}
