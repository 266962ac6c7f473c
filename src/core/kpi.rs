//! KPI aggregation over a finalized timeline.

use super::error::{SimError, SimResult};
use super::timeline::{Timeline, TimelineEventType};
use super::types::{JobId, MachineId, SimTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiReport {
    pub jobs_total: usize,
    pub jobs_completed: usize,
    pub jobs_scrapped: usize,
    pub jobs_unfinished: usize,
    /// Share of arrived jobs completed by their due date, in percent
    pub otd_pct: f64,
    pub avg_lead_time: SimTime,
    pub p90_lead_time: SimTime,
    pub avg_tardiness: SimTime,
    /// Time-average number of released, non-terminal jobs
    pub avg_wip: f64,
    /// Completed jobs per hour
    pub throughput: f64,
    /// Busy share of available capacity per machine, in percent
    pub utilization: BTreeMap<MachineId, f64>,
    pub setup_hours: SimTime,
    pub inspections: usize,
    pub reworks: usize,
    pub rework_rate: f64,
    pub scrap_rate: f64,
    pub horizon: SimTime,
}

/// One row of the flat KPI table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiRow {
    pub metric: String,
    pub value: f64,
}

impl KpiReport {
    /// Flat (metric, value) table; per-machine utilization rows are named
    /// `utilization.<machine>`
    pub fn to_table(&self) -> Vec<KpiRow> {
        let mut rows = vec![
            ("jobs_total", self.jobs_total as f64),
            ("jobs_completed", self.jobs_completed as f64),
            ("jobs_scrapped", self.jobs_scrapped as f64),
            ("jobs_unfinished", self.jobs_unfinished as f64),
            ("otd_pct", self.otd_pct),
            ("avg_lead_time", self.avg_lead_time),
            ("p90_lead_time", self.p90_lead_time),
            ("avg_tardiness", self.avg_tardiness),
            ("avg_wip", self.avg_wip),
            ("throughput", self.throughput),
            ("setup_hours", self.setup_hours),
            ("inspections", self.inspections as f64),
            ("reworks", self.reworks as f64),
            ("rework_rate", self.rework_rate),
            ("scrap_rate", self.scrap_rate),
            ("horizon", self.horizon),
        ]
        .into_iter()
        .map(|(metric, value)| KpiRow {
            metric: metric.to_string(),
            value,
        })
        .collect::<Vec<_>>();
        rows.extend(self.utilization.iter().map(|(machine, value)| KpiRow {
            metric: format!("utilization.{}", machine),
            value: *value,
        }));
        rows
    }

    pub fn to_json(&self) -> SimResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_csv(&self) -> SimResult<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in self.to_table() {
            writer.serialize(row)?;
        }
        writer
            .into_inner()
            .map_err(|e| SimError::Artifact(format!("kpi csv: {}", e)))
    }
}

/// Percentile by linear interpolation between closest ranks
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Default)]
struct JobTrace {
    arrival: Option<SimTime>,
    due_date: Option<SimTime>,
    completion: Option<SimTime>,
}

#[derive(Default)]
struct MachineTrace {
    busy: SimTime,
    down: SimTime,
    busy_since: BTreeMap<JobId, SimTime>,
    down_since: Option<SimTime>,
}

/// Aggregate the KPIs of a finalized timeline
pub fn compute_kpis(timeline: &Timeline) -> KpiReport {
    let horizon = timeline.end_time;
    let mut jobs: BTreeMap<JobId, JobTrace> = BTreeMap::new();
    let mut machines: HashMap<MachineId, MachineTrace> = HashMap::new();
    let mut scrapped = 0;
    let mut inspections = 0;
    let mut reworks = 0;
    let mut setup_hours = 0.0;

    let mut wip: i64 = 0;
    let mut wip_area = 0.0;
    let mut last_time = 0.0;

    for event in &timeline.events {
        wip_area += wip as f64 * (event.time - last_time);
        last_time = event.time;

        let job_id = event.job_id.as_deref().unwrap_or("");
        let machine = event
            .machine_id
            .as_ref()
            .map(|id| machines.entry(id.clone()).or_default());

        match event.event_type {
            TimelineEventType::Arrival => {
                let trace = jobs.entry(job_id.to_string()).or_default();
                trace.arrival = Some(event.time);
                trace.due_date = event.detail.due_date;
            }
            TimelineEventType::Release => wip += 1,
            TimelineEventType::Completion => {
                wip -= 1;
                jobs.entry(job_id.to_string()).or_default().completion = Some(event.time);
            }
            TimelineEventType::Scrap => {
                wip -= 1;
                scrapped += 1;
            }
            TimelineEventType::SetupStart => {
                setup_hours += event.detail.duration.unwrap_or(0.0);
                if let Some(trace) = machine {
                    trace.busy_since.insert(job_id.to_string(), event.time);
                }
            }
            TimelineEventType::ProcessStart | TimelineEventType::Resumed => {
                if let Some(trace) = machine {
                    trace.busy_since.entry(job_id.to_string()).or_insert(event.time);
                }
            }
            TimelineEventType::ProcessEnd | TimelineEventType::Interrupted => {
                if let Some(trace) = machine {
                    if let Some(since) = trace.busy_since.remove(job_id) {
                        trace.busy += event.time - since;
                    }
                }
            }
            TimelineEventType::DowntimeStart => {
                if let Some(trace) = machine {
                    trace.down_since.get_or_insert(event.time);
                }
            }
            TimelineEventType::DowntimeEnd => {
                if let Some(trace) = machine {
                    if let Some(since) = trace.down_since.take() {
                        trace.down += event.time - since;
                    }
                }
            }
            TimelineEventType::Inspection => inspections += 1,
            TimelineEventType::Rework => reworks += 1,
            TimelineEventType::SetupEnd
            | TimelineEventType::Blocked
            | TimelineEventType::DowntimeExtended => {}
        }
    }
    wip_area += wip.max(0) as f64 * (horizon - last_time).max(0.0);

    // Close intervals still open when the run stopped.
    for trace in machines.values_mut() {
        for since in trace.busy_since.values() {
            trace.busy += (horizon - since).max(0.0);
        }
        if let Some(since) = trace.down_since.take() {
            trace.down += (horizon - since).max(0.0);
        }
    }

    let jobs_total = jobs.values().filter(|t| t.arrival.is_some()).count();
    let mut lead_times = Vec::new();
    let mut tardiness = Vec::new();
    let mut on_time = 0;
    for trace in jobs.values() {
        if let (Some(arrival), Some(done)) = (trace.arrival, trace.completion) {
            lead_times.push(done - arrival);
            let due = trace.due_date.unwrap_or(f64::INFINITY);
            tardiness.push((done - due).max(0.0));
            if done <= due {
                on_time += 1;
            }
        }
    }
    let completed = lead_times.len();

    let utilization = timeline
        .machines
        .iter()
        .map(|info| {
            let (busy, down) = machines
                .get(&info.id)
                .map_or((0.0, 0.0), |t| (t.busy, t.down));
            let available = info.capacity.max(1) as f64 * (horizon - down);
            let pct = if available > 0.0 {
                (busy / available * 100.0).clamp(0.0, 100.0)
            } else {
                0.0
            };
            (info.id.clone(), pct)
        })
        .collect();

    KpiReport {
        jobs_total,
        jobs_completed: completed,
        jobs_scrapped: scrapped,
        jobs_unfinished: timeline.unfinished_jobs.len(),
        otd_pct: ratio(on_time, jobs_total) * 100.0,
        avg_lead_time: mean(&lead_times),
        p90_lead_time: percentile(&lead_times, 0.9),
        avg_tardiness: mean(&tardiness),
        avg_wip: if horizon > 0.0 { wip_area / horizon } else { 0.0 },
        throughput: if horizon > 0.0 { completed as f64 / horizon } else { 0.0 },
        utilization,
        setup_hours,
        inspections,
        reworks,
        rework_rate: ratio(reworks, inspections),
        scrap_rate: ratio(scrapped, jobs_total),
        horizon,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::timeline::{EventDetail, ResourceInfo, TimelineRecorder};

    fn machine(id: &str) -> Vec<ResourceInfo> {
        vec![ResourceInfo {
            id: id.to_string(),
            capacity: 1,
        }]
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert!((percentile(&values, 0.9) - 9.1).abs() < 1e-12);
        assert_eq!(percentile(&[4.0], 0.9), 4.0);
        assert_eq!(percentile(&[], 0.9), 0.0);
    }

    #[test]
    fn test_single_job_report() {
        let mut recorder = TimelineRecorder::new();
        let due = EventDetail::default().with_due_date(3.0);
        recorder.record(0.0, TimelineEventType::Arrival, Some("J1"), None, due);
        recorder.record(0.0, TimelineEventType::Release, Some("J1"), None, EventDetail::default());
        recorder.record(0.0, TimelineEventType::ProcessStart, Some("J1"), Some("M1"), EventDetail::step(1));
        recorder.record(2.0, TimelineEventType::ProcessEnd, Some("J1"), Some("M1"), EventDetail::step(1));
        recorder.record(2.0, TimelineEventType::Completion, Some("J1"), None, EventDetail::default());
        recorder.record(2.0, TimelineEventType::DowntimeStart, None, Some("M1"), EventDetail::default());
        recorder.record(4.0, TimelineEventType::DowntimeEnd, None, Some("M1"), EventDetail::default());
        let report = compute_kpis(&recorder.finalize(4.0, machine("M1"), Vec::new()));

        assert_eq!(report.jobs_total, 1);
        assert_eq!(report.otd_pct, 100.0);
        assert_eq!(report.avg_lead_time, 2.0);
        assert_eq!(report.avg_wip, 0.5);
        // 2h busy out of 4h horizon minus 2h down
        assert_eq!(report.utilization["M1"], 100.0);
        assert_eq!(report.throughput, 0.25);
    }

    #[test]
    fn test_late_and_scrapped_jobs() {
        let mut recorder = TimelineRecorder::new();
        for id in ["J1", "J2"] {
            recorder.record(0.0, TimelineEventType::Arrival, Some(id), None, EventDetail::default().with_due_date(1.0));
            recorder.record(0.0, TimelineEventType::Release, Some(id), None, EventDetail::default());
        }
        recorder.record(1.0, TimelineEventType::Inspection, Some("J2"), Some("M1"), EventDetail::default());
        recorder.record(1.0, TimelineEventType::Scrap, Some("J2"), None, EventDetail::default());
        recorder.record(3.0, TimelineEventType::Completion, Some("J1"), None, EventDetail::default());
        let report = compute_kpis(&recorder.finalize(3.0, machine("M1"), Vec::new()));

        assert_eq!(report.otd_pct, 0.0);
        assert_eq!(report.avg_tardiness, 2.0);
        assert_eq!(report.scrap_rate, 0.5);
        assert_eq!(report.inspections, 1);
        assert_eq!(report.rework_rate, 0.0);
        assert_eq!(report.utilization["M1"], 0.0);
    }

    #[test]
    fn test_empty_timeline() {
        let report = compute_kpis(&TimelineRecorder::new().finalize(0.0, machine("M1"), Vec::new()));
        assert_eq!(report.jobs_total, 0);
        assert_eq!(report.otd_pct, 0.0);
        assert_eq!(report.avg_wip, 0.0);
    }

    #[test]
    fn test_flat_table_contains_utilization() {
        let report = compute_kpis(&TimelineRecorder::new().finalize(1.0, machine("M7"), Vec::new()));
        let table = report.to_table();
        assert!(table.iter().any(|row| row.metric == "utilization.M7"));
        let csv = String::from_utf8(report.to_csv().unwrap()).unwrap();
        assert!(csv.starts_with("metric,value\n"));
    }
}
