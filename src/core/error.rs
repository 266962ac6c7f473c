use super::types::SimTime;
use super::validation::ValidationReport;
use thiserror::Error;

pub type SimResult<T> = Result<T, SimError>;

/// Errors surfaced by the simulation core.
///
/// A job exceeding its rework cap is not an error: it is a terminal scrap
/// outcome recorded on the timeline.
#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid or missing scenario parameter, rejected before the run starts
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Project configuration failed integrity checks
    #[error("invalid project configuration: {}", .report.summary())]
    InvalidProject { report: ValidationReport },

    /// Jobs are pending but no transition can ever admit or progress them
    #[error("deadlock at t={time:.4}: {pending_jobs} job(s) cannot progress ({detail})")]
    Deadlock {
        time: SimTime,
        pending_jobs: usize,
        detail: String,
    },

    /// A replay with an identical seed produced a different result
    #[error("determinism violation in run {run_id}: {detail}")]
    DeterminismViolation { run_id: String, detail: String },

    #[error("run {run_id} was cancelled")]
    Cancelled { run_id: String },

    #[error("unknown run '{0}'")]
    UnknownRun(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("csv export error: {0}")]
    Csv(#[from] csv::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SimError {
    pub fn config(message: impl Into<String>) -> Self {
        SimError::Configuration {
            message: message.into(),
        }
    }
}
