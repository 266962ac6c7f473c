//! Dispatch rules: which queued job an idle machine takes next.

use super::error::SimError;
use super::types::{SimTime, MIN_DURATION};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

/// Floor applied to slack before it is used as an ATC divisor
pub const SLACK_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DispatchRule {
    /// Earliest due date
    Edd,
    /// Shortest remaining processing time
    Spt,
    /// Apparent tardiness cost
    Atc,
    /// Apparent tardiness cost with setup penalty
    Atcs,
    /// Least slack next
    Lsn,
}

impl DispatchRule {
    pub const ALL: [DispatchRule; 5] = [
        DispatchRule::Edd,
        DispatchRule::Spt,
        DispatchRule::Atc,
        DispatchRule::Atcs,
        DispatchRule::Lsn,
    ];

    /// ATC-family scores are maximized, the others minimized
    pub fn maximizes(&self) -> bool {
        matches!(self, DispatchRule::Atc | DispatchRule::Atcs)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DispatchRule::Edd => "EDD",
            DispatchRule::Spt => "SPT",
            DispatchRule::Atc => "ATC",
            DispatchRule::Atcs => "ATCS",
            DispatchRule::Lsn => "LSN",
        }
    }
}

impl std::fmt::Display for DispatchRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DispatchRule {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DispatchRule::ALL
            .iter()
            .copied()
            .find(|rule| rule.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SimError::config(format!("invalid dispatch rule '{}'", s)))
    }
}

fn default_k1_scale() -> f64 {
    2.0
}

fn default_k2() -> f64 {
    1.0
}

fn default_setup_penalty() -> f64 {
    1.5
}

/// Tuning of the ATC/ATCS score.
///
/// `k1` is the look-ahead of the urgency term in hours. When unset it is
/// calibrated per decision as `k1_scale` times the mean next-step process
/// time of the queue, which keeps the score scale-free across plants with
/// very different cycle times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtcParams {
    #[serde(default)]
    pub k1: Option<f64>,
    #[serde(default = "default_k1_scale")]
    pub k1_scale: f64,
    #[serde(default = "default_k2")]
    pub k2: f64,
    /// Divisor applied under ATCS when the job needs a family switch; must be > 1
    #[serde(default = "default_setup_penalty")]
    pub setup_penalty: f64,
}

impl Default for AtcParams {
    fn default() -> Self {
        Self {
            k1: None,
            k1_scale: default_k1_scale(),
            k2: default_k2(),
            setup_penalty: default_setup_penalty(),
        }
    }
}

/// Read-only view of a queued job at its current step
#[derive(Debug, Clone, PartialEq)]
pub struct JobView<'a> {
    pub job_id: &'a str,
    pub release_time: SimTime,
    pub due_date: SimTime,
    /// Sum of mean process times from the current step to the end of the route
    pub remaining_process_time: SimTime,
    /// Mean process time of the current step
    pub next_process_time: SimTime,
    /// Setup family of the current step
    pub family: &'a str,
}

impl JobView<'_> {
    /// Time to spare before the job becomes late, unfloored
    pub fn slack(&self, now: SimTime) -> f64 {
        self.due_date - now - self.remaining_process_time
    }
}

/// A machine's view of its group queue
#[derive(Debug, Clone)]
pub struct QueueState<'a> {
    pub jobs: Vec<JobView<'a>>,
    /// Family last processed by the deciding machine
    pub last_family: Option<&'a str>,
}

impl<'a> QueueState<'a> {
    pub fn new(jobs: Vec<JobView<'a>>, last_family: Option<&'a str>) -> Self {
        Self { jobs, last_family }
    }

    pub fn mean_next_process_time(&self) -> SimTime {
        if self.jobs.is_empty() {
            return 0.0;
        }
        self.jobs.iter().map(|j| j.next_process_time).sum::<f64>() / self.jobs.len() as f64
    }

    fn needs_switch(&self, job: &JobView<'_>) -> bool {
        self.last_family != Some(job.family)
    }
}

/// Priority computation and selection for one dispatch rule
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatcher {
    rule: DispatchRule,
    params: AtcParams,
}

impl Dispatcher {
    pub fn new(rule: DispatchRule, params: AtcParams) -> Self {
        Self { rule, params }
    }

    pub fn rule(&self) -> DispatchRule {
        self.rule
    }

    fn k1(&self, queue: &QueueState<'_>) -> f64 {
        let k1 = match self.params.k1 {
            Some(k1) => k1,
            None => self.params.k1_scale * queue.mean_next_process_time(),
        };
        k1.max(MIN_DURATION)
    }

    fn atc_score(&self, job: &JobView<'_>, queue: &QueueState<'_>, now: SimTime, penalize_setup: bool) -> f64 {
        let k1 = self.k1(queue);
        let urgency = (-(job.due_date - job.remaining_process_time - now).max(0.0) / k1).exp();
        let slack = job.slack(now).max(SLACK_EPSILON);
        let penalty = if penalize_setup && queue.needs_switch(job) {
            self.params.setup_penalty
        } else {
            1.0
        };
        urgency / (slack.powf(self.params.k2) * penalty)
    }

    /// Score of `job` under the configured rule
    pub fn compute_priority(&self, job: &JobView<'_>, queue: &QueueState<'_>, now: SimTime) -> f64 {
        match self.rule {
            DispatchRule::Edd => job.due_date,
            DispatchRule::Spt => job.remaining_process_time,
            DispatchRule::Atc => self.atc_score(job, queue, now, false),
            DispatchRule::Atcs => self.atc_score(job, queue, now, true),
            DispatchRule::Lsn => job.slack(now),
        }
    }

    fn compare(&self, queue: &QueueState<'_>, now: SimTime, a: &JobView<'_>, b: &JobView<'_>) -> Ordering {
        let score_a = self.compute_priority(a, queue, now);
        let score_b = self.compute_priority(b, queue, now);
        let by_score = if self.rule.maximizes() {
            score_b.total_cmp(&score_a)
        } else {
            score_a.total_cmp(&score_b)
        };
        by_score
            .then_with(|| a.release_time.total_cmp(&b.release_time))
            .then_with(|| a.job_id.cmp(b.job_id))
    }

    /// Best job of the queue; ties go to the earliest release, then the lowest id
    pub fn select_next_job<'q>(&self, queue: &'q QueueState<'q>, now: SimTime) -> Option<&'q JobView<'q>> {
        queue.jobs.iter().min_by(|a, b| self.compare(queue, now, a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view<'a>(id: &'a str, family: &'a str, release: f64, due: f64, remaining: f64) -> JobView<'a> {
        JobView {
            job_id: id,
            release_time: release,
            due_date: due,
            remaining_process_time: remaining,
            next_process_time: remaining,
            family,
        }
    }

    fn pick<'a>(rule: DispatchRule, queue: &'a QueueState<'a>, now: f64) -> &'a str {
        Dispatcher::new(rule, AtcParams::default())
            .select_next_job(queue, now)
            .map(|j| j.job_id)
            .unwrap()
    }

    #[test]
    fn test_edd_picks_earliest_due() {
        let queue = QueueState::new(
            vec![view("A", "F1", 0.0, 10.0, 4.0), view("B", "F2", 0.0, 8.0, 3.0)],
            None,
        );
        assert_eq!(pick(DispatchRule::Edd, &queue, 0.0), "B");
    }

    #[test]
    fn test_spt_picks_shortest_remaining() {
        let queue = QueueState::new(
            vec![view("A", "F1", 0.0, 10.0, 4.0), view("B", "F1", 0.0, 30.0, 1.0)],
            None,
        );
        assert_eq!(pick(DispatchRule::Spt, &queue, 0.0), "B");
    }

    #[test]
    fn test_lsn_picks_least_slack() {
        // slack A = 10 - 0 - 4 = 6, slack B = 12 - 0 - 9 = 3
        let queue = QueueState::new(
            vec![view("A", "F1", 0.0, 10.0, 4.0), view("B", "F1", 0.0, 12.0, 9.0)],
            None,
        );
        assert_eq!(pick(DispatchRule::Lsn, &queue, 0.0), "B");
    }

    #[test]
    fn test_ties_break_on_release_then_id() {
        let queue = QueueState::new(
            vec![
                view("C", "F1", 2.0, 10.0, 4.0),
                view("B", "F1", 1.0, 10.0, 4.0),
                view("A", "F1", 1.0, 10.0, 4.0),
            ],
            None,
        );
        for rule in DispatchRule::ALL {
            assert_eq!(pick(rule, &queue, 0.0), "A", "rule {}", rule);
        }
    }

    #[test]
    fn test_atc_prefers_urgent_job() {
        let queue = QueueState::new(
            vec![view("LATE", "F1", 0.0, 5.0, 4.0), view("EARLY", "F1", 0.0, 100.0, 4.0)],
            None,
        );
        assert_eq!(pick(DispatchRule::Atc, &queue, 0.0), "LATE");
    }

    #[test]
    fn test_atcs_penalizes_family_switch() {
        // Identical jobs except for family; the machine last ran F1.
        let queue = QueueState::new(
            vec![view("A", "F2", 0.0, 20.0, 4.0), view("B", "F1", 0.0, 20.0, 4.0)],
            Some("F1"),
        );
        assert_eq!(pick(DispatchRule::Atcs, &queue, 0.0), "B");
        // Plain ATC ignores setups, so the id tie-break decides.
        assert_eq!(pick(DispatchRule::Atc, &queue, 0.0), "A");
    }

    #[test]
    fn test_atc_score_formula() {
        let dispatcher = Dispatcher::new(
            DispatchRule::Atcs,
            AtcParams {
                k1: Some(10.0),
                k1_scale: 2.0,
                k2: 2.0,
                setup_penalty: 1.5,
            },
        );
        let job = view("A", "F2", 0.0, 20.0, 4.0);
        let queue = QueueState::new(vec![job.clone()], Some("F1"));
        let score = dispatcher.compute_priority(&job, &queue, 1.0);
        let expected = (-(20.0_f64 - 4.0 - 1.0) / 10.0).exp() / (15.0_f64.powf(2.0) * 1.5);
        assert!((score - expected).abs() < 1e-12);
    }

    #[test]
    fn test_negative_slack_is_floored_for_atc() {
        let dispatcher = Dispatcher::new(DispatchRule::Atc, AtcParams::default());
        let job = view("A", "F1", 0.0, 1.0, 5.0);
        let queue = QueueState::new(vec![job.clone()], None);
        let score = dispatcher.compute_priority(&job, &queue, 3.0);
        assert!(score.is_finite());
        assert!((score - 1.0 / SLACK_EPSILON).abs() < 1e-6);
    }

    #[test]
    fn test_selection_on_empty_queue() {
        let queue = QueueState::new(Vec::new(), None);
        let dispatcher = Dispatcher::new(DispatchRule::Edd, AtcParams::default());
        assert!(dispatcher.select_next_job(&queue, 0.0).is_none());
    }

    #[test]
    fn test_rule_parsing() {
        assert_eq!("atcs".parse::<DispatchRule>().unwrap(), DispatchRule::Atcs);
        assert!("FIFO".parse::<DispatchRule>().is_err());
        let parsed: DispatchRule = serde_json::from_str("\"LSN\"").unwrap();
        assert_eq!(parsed, DispatchRule::Lsn);
    }
}
