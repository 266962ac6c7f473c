//! Append-only record of every transition of a run.

use super::error::{SimError, SimResult};
use super::types::{JobId, MachineId, SimTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    Arrival,
    Release,
    Blocked,
    SetupStart,
    SetupEnd,
    ProcessStart,
    ProcessEnd,
    Interrupted,
    Resumed,
    DowntimeStart,
    DowntimeExtended,
    DowntimeEnd,
    Inspection,
    Rework,
    Scrap,
    Completion,
}

impl TimelineEventType {
    pub fn name(&self) -> &'static str {
        match self {
            TimelineEventType::Arrival => "arrival",
            TimelineEventType::Release => "release",
            TimelineEventType::Blocked => "blocked",
            TimelineEventType::SetupStart => "setup_start",
            TimelineEventType::SetupEnd => "setup_end",
            TimelineEventType::ProcessStart => "process_start",
            TimelineEventType::ProcessEnd => "process_end",
            TimelineEventType::Interrupted => "interrupted",
            TimelineEventType::Resumed => "resumed",
            TimelineEventType::DowntimeStart => "downtime_start",
            TimelineEventType::DowntimeExtended => "downtime_extended",
            TimelineEventType::DowntimeEnd => "downtime_end",
            TimelineEventType::Inspection => "inspection",
            TimelineEventType::Rework => "rework",
            TimelineEventType::Scrap => "scrap",
            TimelineEventType::Completion => "completion",
        }
    }
}

impl std::fmt::Display for TimelineEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Optional payload of a timeline event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<SimTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<SimTime>,
    /// Inspection outcome, scrap reason or downtime kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

impl EventDetail {
    pub fn step(step: u32) -> Self {
        Self {
            step: Some(step),
            ..Self::default()
        }
    }

    pub fn with_duration(mut self, duration: SimTime) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn with_from_family(mut self, family: Option<String>) -> Self {
        self.from_family = family;
        self
    }

    pub fn with_due_date(mut self, due: SimTime) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub sequence: u64,
    pub time: SimTime,
    pub event_type: TimelineEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<MachineId>,
    #[serde(default)]
    pub detail: EventDetail,
}

/// Flat CSV row of a timeline event
#[derive(Debug, Serialize)]
struct TimelineRow<'a> {
    sequence: u64,
    time: SimTime,
    event_type: &'static str,
    job_id: &'a str,
    machine_id: &'a str,
    step: Option<u32>,
    family: &'a str,
    from_family: &'a str,
    duration: Option<SimTime>,
    due_date: Option<SimTime>,
    reason: &'a str,
    route: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: MachineId,
    pub capacity: u32,
}

/// Finalized run artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub end_time: SimTime,
    pub machines: Vec<ResourceInfo>,
    /// Jobs still in the system when the run stopped at its horizon
    pub unfinished_jobs: Vec<JobId>,
    pub events: Vec<TimelineEvent>,
}

impl Timeline {
    pub fn events_of(&self, event_type: TimelineEventType) -> impl Iterator<Item = &TimelineEvent> {
        self.events.iter().filter(move |e| e.event_type == event_type)
    }

    pub fn to_json(&self) -> SimResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> SimResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_csv(&self) -> SimResult<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for event in &self.events {
            writer.serialize(TimelineRow {
                sequence: event.sequence,
                time: event.time,
                event_type: event.event_type.name(),
                job_id: event.job_id.as_deref().unwrap_or(""),
                machine_id: event.machine_id.as_deref().unwrap_or(""),
                step: event.detail.step,
                family: event.detail.family.as_deref().unwrap_or(""),
                from_family: event.detail.from_family.as_deref().unwrap_or(""),
                duration: event.detail.duration,
                due_date: event.detail.due_date,
                reason: event.detail.reason.as_deref().unwrap_or(""),
                route: event.detail.route.as_deref().unwrap_or(""),
            })?;
        }
        writer
            .into_inner()
            .map_err(|e| SimError::Artifact(format!("timeline csv: {}", e)))
    }
}

/// Collects timeline events in order during a run
#[derive(Debug, Default)]
pub struct TimelineRecorder {
    events: Vec<TimelineEvent>,
    next_sequence: u64,
}

impl TimelineRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        time: SimTime,
        event_type: TimelineEventType,
        job_id: Option<&str>,
        machine_id: Option<&str>,
        detail: EventDetail,
    ) {
        debug_assert!(
            self.events.last().map_or(true, |last| last.time <= time),
            "timeline must be non-decreasing in time"
        );
        self.events.push(TimelineEvent {
            sequence: self.next_sequence,
            time,
            event_type,
            job_id: job_id.map(str::to_string),
            machine_id: machine_id.map(str::to_string),
            detail,
        });
        self.next_sequence += 1;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn finalize(self, end_time: SimTime, machines: Vec<ResourceInfo>, unfinished_jobs: Vec<JobId>) -> Timeline {
        Timeline {
            end_time,
            machines,
            unfinished_jobs,
            events: self.events,
        }
    }
}
