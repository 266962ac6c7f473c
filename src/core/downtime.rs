//! Machine downtime: stochastic failures, planned maintenance and the
//! merged per-machine calendar.

use super::project::{MachineSpec, ProjectConfig};
use super::rng::{RngContext, RngStream};
use super::types::{clamp_duration, MachineId, SimTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DowntimeKind {
    Failure,
    PlannedMaintenance,
    /// Result of coalescing windows of different kinds
    Combined,
}

impl DowntimeKind {
    fn merge(self, other: DowntimeKind) -> DowntimeKind {
        if self == other {
            self
        } else {
            DowntimeKind::Combined
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DowntimeKind::Failure => "failure",
            DowntimeKind::PlannedMaintenance => "planned_maintenance",
            DowntimeKind::Combined => "combined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DowntimeWindow {
    pub machine_id: MachineId,
    pub start: SimTime,
    pub end: SimTime,
    pub kind: DowntimeKind,
}

impl DowntimeWindow {
    pub fn new(machine_id: impl Into<MachineId>, start: SimTime, end: SimTime, kind: DowntimeKind) -> Self {
        Self {
            machine_id: machine_id.into(),
            start,
            end,
            kind,
        }
    }

    pub fn duration(&self) -> SimTime {
        self.end - self.start
    }

    fn overlaps(&self, other: &DowntimeWindow) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Sort and coalesce overlapping or touching windows
pub fn merge_windows(mut windows: Vec<DowntimeWindow>) -> Vec<DowntimeWindow> {
    windows.sort_by(|a, b| a.start.total_cmp(&b.start).then_with(|| a.end.total_cmp(&b.end)));
    let mut merged: Vec<DowntimeWindow> = Vec::with_capacity(windows.len());
    for window in windows {
        match merged.last_mut() {
            Some(last) if last.overlaps(&window) => {
                last.end = last.end.max(window.end);
                last.kind = last.kind.merge(window.kind);
            }
            _ => merged.push(window),
        }
    }
    merged
}

/// Non-overlapping downtime windows of one machine, kept sorted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DowntimeCalendar {
    windows: Vec<DowntimeWindow>,
}

impl DowntimeCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, window: DowntimeWindow) {
        let mut windows = std::mem::take(&mut self.windows);
        windows.push(window);
        self.windows = merge_windows(windows);
    }

    pub fn windows(&self) -> &[DowntimeWindow] {
        &self.windows
    }

    pub fn is_down_at(&self, time: SimTime) -> bool {
        self.windows.iter().any(|w| time >= w.start && time < w.end)
    }

    /// Total downtime falling inside `[from, to)`
    pub fn total_within(&self, from: SimTime, to: SimTime) -> SimTime {
        self.windows
            .iter()
            .map(|w| (w.end.min(to) - w.start.max(from)).max(0.0))
            .sum()
    }
}

/// Exponential time-between-failures with exponential or fixed repairs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureModel {
    pub mtbf: SimTime,
    pub mttr: SimTime,
    pub deterministic_repair: bool,
}

impl FailureModel {
    pub fn from_machine(machine: &MachineSpec) -> Option<Self> {
        match (machine.mtbf, machine.mttr) {
            (Some(mtbf), Some(mttr)) => Some(Self {
                mtbf,
                mttr,
                deterministic_repair: machine.deterministic_repair,
            }),
            _ => None,
        }
    }

    /// Next failure window strictly after `now`, drawn from the failures stream
    pub fn next_downtime(&self, machine_id: &str, now: SimTime, rng: &mut RngContext) -> DowntimeWindow {
        let start = now + rng.exponential(RngStream::Failures, self.mtbf);
        let repair = if self.deterministic_repair {
            clamp_duration(self.mttr)
        } else {
            rng.exponential(RngStream::Failures, self.mttr)
        };
        DowntimeWindow::new(machine_id, start, start + repair, DowntimeKind::Failure)
    }
}

/// Planned maintenance windows of every machine, in machine declaration order
pub fn planned_windows(project: &ProjectConfig) -> Vec<DowntimeWindow> {
    project
        .machines
        .iter()
        .flat_map(|machine| {
            merge_windows(
                machine
                    .pm_windows
                    .iter()
                    .map(|w| DowntimeWindow::new(machine.id.clone(), w.start, w.end, DowntimeKind::PlannedMaintenance))
                    .collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_windows_coalesce() {
        let merged = merge_windows(vec![
            DowntimeWindow::new("M1", 5.0, 8.0, DowntimeKind::PlannedMaintenance),
            DowntimeWindow::new("M1", 1.0, 3.0, DowntimeKind::Failure),
            DowntimeWindow::new("M1", 2.0, 6.0, DowntimeKind::Failure),
            DowntimeWindow::new("M1", 10.0, 11.0, DowntimeKind::Failure),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!((merged[0].start, merged[0].end), (1.0, 8.0));
        assert_eq!(merged[0].kind, DowntimeKind::Combined);
        assert_eq!(merged[1].kind, DowntimeKind::Failure);
    }

    #[test]
    fn test_calendar_totals() {
        let mut calendar = DowntimeCalendar::new();
        calendar.insert(DowntimeWindow::new("M1", 2.0, 4.0, DowntimeKind::Failure));
        calendar.insert(DowntimeWindow::new("M1", 3.0, 6.0, DowntimeKind::Failure));
        assert_eq!(calendar.windows().len(), 1);
        assert!(calendar.is_down_at(5.5));
        assert!(!calendar.is_down_at(6.0));
        assert_eq!(calendar.total_within(0.0, 10.0), 4.0);
        assert_eq!(calendar.total_within(0.0, 3.0), 1.0);
    }

    #[test]
    fn test_deterministic_repair_lasts_mttr() {
        let model = FailureModel {
            mtbf: 100.0,
            mttr: 2.5,
            deterministic_repair: true,
        };
        let mut rng = RngContext::new(1);
        let window = model.next_downtime("M1", 10.0, &mut rng);
        assert!(window.start > 10.0);
        assert!((window.duration() - 2.5).abs() < 1e-12);
        assert_eq!(window.kind, DowntimeKind::Failure);
    }

    #[test]
    fn test_failure_draws_are_reproducible() {
        let model = FailureModel {
            mtbf: 40.0,
            mttr: 3.0,
            deterministic_repair: false,
        };
        let a = model.next_downtime("M1", 0.0, &mut RngContext::new(5));
        let b = model.next_downtime("M1", 0.0, &mut RngContext::new(5));
        assert_eq!(a, b);
    }

    #[test]
    fn test_machine_without_mtbf_has_no_model() {
        assert!(FailureModel::from_machine(&MachineSpec::new("M1", "C1")).is_none());
        let failing = MachineSpec::new("M2", "C1").with_failures(10.0, 1.0);
        assert!(FailureModel::from_machine(&failing).is_some());
    }
}
