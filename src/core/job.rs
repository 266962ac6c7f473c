use super::dispatch::JobView;
use super::project::{Route, RouteStep};
use super::types::{CellPair, FamilyId, JobId, MachineGroupId, ProductId, SimTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Arrived, waiting for admission
    Backlog,
    /// Waiting in a machine-group queue
    Queued,
    InProcess,
    /// Finished a cell and waiting for a POLCA card
    Blocked,
    Completed,
    Scrapped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Scrapped)
    }
}

/// A job owned by one run
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub product_id: ProductId,
    pub family_id: FamilyId,
    pub route: Arc<Route>,
    pub step_index: usize,
    pub release_time: SimTime,
    pub due_date: SimTime,
    pub rework_count: u32,
    pub status: JobStatus,
    pub current_queue: Option<MachineGroupId>,
    /// Set once the arrival event has been processed
    pub arrived: bool,
    /// Time the release controller admitted the job
    pub released_at: Option<SimTime>,
    /// POLCA cards currently held
    pub held_cards: BTreeSet<CellPair>,
}

impl Job {
    pub fn new(
        id: JobId,
        product_id: ProductId,
        family_id: FamilyId,
        route: Arc<Route>,
        release_time: SimTime,
        due_date: SimTime,
    ) -> Self {
        Self {
            id,
            product_id,
            family_id,
            route,
            step_index: 0,
            release_time,
            due_date,
            rework_count: 0,
            status: JobStatus::Backlog,
            current_queue: None,
            arrived: false,
            released_at: None,
            held_cards: BTreeSet::new(),
        }
    }

    pub fn current_step(&self) -> Option<&RouteStep> {
        self.route.steps.get(self.step_index)
    }

    /// Setup family of the current step
    pub fn family_at_current_step(&self) -> &str {
        self.current_step()
            .and_then(|step| step.family.as_deref())
            .unwrap_or(&self.family_id)
    }

    /// Sum of mean process times from the current step to the end of the route
    pub fn remaining_process_time(&self) -> SimTime {
        self.route
            .steps
            .iter()
            .skip(self.step_index)
            .map(|step| step.process_time_mean)
            .sum()
    }

    pub fn is_last_step(&self) -> bool {
        self.step_index + 1 >= self.route.steps.len()
    }

    /// Dispatcher view at the current step
    pub fn view(&self) -> JobView<'_> {
        JobView {
            job_id: &self.id,
            release_time: self.release_time,
            due_date: self.due_date,
            remaining_process_time: self.remaining_process_time(),
            next_process_time: self.current_step().map_or(0.0, |step| step.process_time_mean),
            family: self.family_at_current_step(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        let route = Route::new(
            "R1",
            vec![
                RouteStep::new(10, "G1", 2.0),
                RouteStep::new(20, "G2", 3.0).with_family("F9"),
                RouteStep::new(30, "G1", 1.5),
            ],
        );
        Job::new("J1".into(), "P1".into(), "F1".into(), Arc::new(route), 0.0, 20.0)
    }

    #[test]
    fn test_remaining_process_time() {
        let mut job = job();
        assert_eq!(job.remaining_process_time(), 6.5);
        job.step_index = 2;
        assert_eq!(job.remaining_process_time(), 1.5);
        assert!(job.is_last_step());
    }

    #[test]
    fn test_family_override_per_step() {
        let mut job = job();
        assert_eq!(job.family_at_current_step(), "F1");
        job.step_index = 1;
        assert_eq!(job.family_at_current_step(), "F9");
        assert_eq!(job.view().next_process_time, 3.0);
    }

    #[test]
    fn test_terminal_status() {
        assert!(JobStatus::Scrapped.is_terminal());
        assert!(!JobStatus::Blocked.is_terminal());
    }
}
