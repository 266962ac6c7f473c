//! Submit/poll/fetch/cancel boundary over a worker pool.

use super::config::ExperimentConfig;
use super::experiment::build_pool;
use crate::core::artifact::ArtifactStore;
use crate::core::error::{SimError, SimResult};
use crate::core::project::ProjectConfig;
use crate::core::run::{run_simulation, RunManifest, RunResultHandle, RunStatus};
use log::{debug, error};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

struct RunEntry {
    status: RunStatus,
    result: Option<RunResultHandle>,
    cancel: Arc<AtomicBool>,
}

type RunTable = (Mutex<HashMap<String, RunEntry>>, Condvar);

fn lock_table(table: &RunTable) -> SimResult<MutexGuard<'_, HashMap<String, RunEntry>>> {
    table
        .0
        .lock()
        .map_err(|_| SimError::Executor("run table lock poisoned".to_string()))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

/// Runs submitted manifests on a rayon pool and tracks their status
pub struct RunExecutor {
    pool: rayon::ThreadPool,
    store: Arc<dyn ArtifactStore>,
    runs: Arc<RunTable>,
}

impl RunExecutor {
    pub fn new(config: &ExperimentConfig, store: Arc<dyn ArtifactStore>) -> SimResult<Self> {
        Ok(Self {
            pool: build_pool(config)?,
            store,
            runs: Arc::new((Mutex::new(HashMap::new()), Condvar::new())),
        })
    }

    /// Queue a run; returns its run id
    pub fn submit(&self, project: Arc<ProjectConfig>, manifest: RunManifest) -> SimResult<String> {
        let run_id = manifest.run_id.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        lock_table(&self.runs)?.insert(
            run_id.clone(),
            RunEntry {
                status: RunStatus::Queued,
                result: None,
                cancel: Arc::clone(&cancel),
            },
        );

        let runs = Arc::clone(&self.runs);
        let store = Arc::clone(&self.store);
        self.pool.spawn(move || {
            if cancel.load(Ordering::Relaxed) {
                return;
            }
            if let Ok(mut table) = lock_table(&runs) {
                if let Some(entry) = table.get_mut(&manifest.run_id) {
                    entry.status = RunStatus::Running;
                }
            }
            debug!("worker picked up run {}", manifest.run_id);

            let handle = panic::catch_unwind(AssertUnwindSafe(|| {
                run_simulation(&project, &manifest, store.as_ref(), Some(cancel))
            }))
            .unwrap_or_else(|payload| {
                let message = format!("run panicked: {}", panic_message(payload.as_ref()));
                error!("run {}: {}", manifest.run_id, message);
                RunResultHandle::without_output(&manifest, RunStatus::Failed(message))
            });

            if let Ok(mut table) = lock_table(&runs) {
                if let Some(entry) = table.get_mut(&manifest.run_id) {
                    entry.status = handle.status.clone();
                    entry.result = Some(handle);
                }
            }
            runs.1.notify_all();
        });

        Ok(run_id)
    }

    pub fn status(&self, run_id: &str) -> SimResult<RunStatus> {
        lock_table(&self.runs)?
            .get(run_id)
            .map(|entry| entry.status.clone())
            .ok_or_else(|| SimError::UnknownRun(run_id.to_string()))
    }

    /// Result of a finished run; `None` while it is queued or running
    pub fn fetch(&self, run_id: &str) -> SimResult<Option<RunResultHandle>> {
        lock_table(&self.runs)?
            .get(run_id)
            .map(|entry| entry.result.clone())
            .ok_or_else(|| SimError::UnknownRun(run_id.to_string()))
    }

    /// Request cancellation. Queued runs never start; running runs stop at
    /// their next step and store nothing. Finished runs are unaffected.
    pub fn cancel(&self, run_id: &str) -> SimResult<()> {
        let mut table = lock_table(&self.runs)?;
        let entry = table
            .get_mut(run_id)
            .ok_or_else(|| SimError::UnknownRun(run_id.to_string()))?;
        entry.cancel.store(true, Ordering::Relaxed);
        if entry.status == RunStatus::Queued {
            entry.status = RunStatus::Cancelled;
            self.runs.1.notify_all();
        }
        Ok(())
    }

    /// Block until the run reaches a terminal status
    pub fn wait(&self, run_id: &str) -> SimResult<RunStatus> {
        let mut table = lock_table(&self.runs)?;
        loop {
            let status = table
                .get(run_id)
                .map(|entry| entry.status.clone())
                .ok_or_else(|| SimError::UnknownRun(run_id.to_string()))?;
            if status.is_terminal() {
                return Ok(status);
            }
            table = self
                .runs
                .1
                .wait(table)
                .map_err(|_| SimError::Executor("run table lock poisoned".to_string()))?;
        }
    }
}
