//! Job registry: the single owner of job state
//!
//! Every mutation goes through one mutex so `get`/`list` never observe a torn
//! write. A subject, and a checkout directory, belong to at most one active
//! job at a time. Completion callbacks are handed back to the caller as [`Finished`]
//! and run after the lock is released.

use crate::error::{OrchestratorError, Result, SyncError};
use crate::job::{Job, JobStateMachine, JobStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

/// Invoked once with the terminal job snapshot
pub type JobCallback = Box<dyn FnOnce(&Job) + Send + 'static>;

struct JobRecord {
    machine: JobStateMachine,
    target: PathBuf,
    callbacks: Vec<JobCallback>,
    cancel: CancellationToken,
    updates: watch::Sender<Job>,
}

#[derive(Default)]
struct Table {
    jobs: HashMap<Uuid, JobRecord>,
    /// subject → its non-terminal job
    active: HashMap<String, Uuid>,
    /// checkout directory → the non-terminal job writing it
    targets: HashMap<PathBuf, Uuid>,
}

/// Outcome of [`JobRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// New job, the caller must schedule it
    Created(Uuid),
    /// The subject already had an active job
    Joined(Uuid),
}

impl Registration {
    pub fn id(&self) -> Uuid {
        match self {
            Registration::Created(id) | Registration::Joined(id) => *id,
        }
    }
}

/// A job that just reached a terminal state, with callbacks still to run.
#[must_use = "callbacks only run through Finished::notify"]
pub struct Finished {
    job: Job,
    callbacks: Vec<JobCallback>,
}

impl Finished {
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Run the callbacks (each exactly once); a panicking callback is logged.
    pub fn notify(self) -> Job {
        for callback in self.callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&self.job))).is_err() {
                error!("Completion callback for job {} panicked", self.job.id);
            }
        }
        self.job
    }
}

/// Outcome of [`JobRegistry::request_cancel`]
pub enum CancelRequest {
    /// Already terminal; nothing changed
    Rejected,
    /// Was PENDING and is now CANCELLED
    Cancelled(Finished),
    /// RUNNING; the worker was signalled and will finish the transition
    Signalled,
}

#[derive(Default)]
pub struct JobRegistry {
    table: Mutex<Table>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `job`, which will write `target`.
    ///
    /// If its subject already has a non-terminal job, `callback` is attached to
    /// that job instead. A different subject whose active job owns `target`
    /// is refused with `TargetBusy`.
    pub fn register(
        &self,
        job: Job,
        target: PathBuf,
        callback: Option<JobCallback>,
        cancel: CancellationToken,
    ) -> Result<Registration> {
        let mut guard = self.table.lock();
        let table = &mut *guard;

        if let Some(existing) = table.active.get(&job.subject).copied() {
            if let (Some(callback), Some(record)) = (callback, table.jobs.get_mut(&existing)) {
                record.callbacks.push(callback);
            }
            return Ok(Registration::Joined(existing));
        }
        if let Some(owner) = table.targets.get(&target).copied() {
            return Err(OrchestratorError::TargetBusy {
                target,
                job_id: owner,
            });
        }

        let id = job.id;
        let (updates, _) = watch::channel(job.clone());
        table.active.insert(job.subject.clone(), id);
        table.targets.insert(target.clone(), id);
        table.jobs.insert(
            id,
            JobRecord {
                machine: JobStateMachine::new(job),
                target,
                callbacks: callback.into_iter().collect(),
                cancel,
                updates,
            },
        );
        Ok(Registration::Created(id))
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.table
            .lock()
            .jobs
            .get(&id)
            .map(|record| record.machine.job().clone())
    }

    /// Point-in-time copy of every job, oldest first
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .table
            .lock()
            .jobs
            .values()
            .map(|record| record.machine.job().clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Non-terminal job for `subject`, if any
    pub fn active_job(&self, subject: &str) -> Option<Uuid> {
        self.table.lock().active.get(subject).copied()
    }

    /// Receiver that sees every snapshot published for `id`
    pub fn subscribe(&self, id: Uuid) -> Option<watch::Receiver<Job>> {
        self.table
            .lock()
            .jobs
            .get(&id)
            .map(|record| record.updates.subscribe())
    }

    pub fn len(&self) -> usize {
        self.table.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// PENDING → RUNNING
    pub fn start(&self, id: Uuid) -> Result<Job> {
        let mut table = self.table.lock();
        let record = Self::record(&mut table, id)?;
        record.machine.start()?;
        let job = record.machine.job().clone();
        record.updates.send_replace(job.clone());
        Ok(job)
    }

    pub fn set_progress(&self, id: Uuid, message: impl Into<String>) -> Result<()> {
        let mut table = self.table.lock();
        let record = Self::record(&mut table, id)?;
        record.machine.set_progress(message)?;
        record.updates.send_replace(record.machine.job().clone());
        Ok(())
    }

    /// RUNNING → COMPLETED
    pub fn complete(&self, id: Uuid, local_path: PathBuf) -> Result<Finished> {
        self.finish(id, |machine| machine.complete(local_path))
    }

    /// RUNNING → FAILED
    pub fn fail(&self, id: Uuid, error: &SyncError) -> Result<Finished> {
        self.finish(id, |machine| machine.fail(error))
    }

    /// PENDING | RUNNING → CANCELLED
    pub fn cancel(&self, id: Uuid, reason: &str) -> Result<Finished> {
        self.finish(id, |machine| machine.cancel(reason))
    }

    /// Cancel PENDING immediately, signal RUNNING, reject terminal.
    pub fn request_cancel(&self, id: Uuid, reason: &str) -> Result<CancelRequest> {
        let status = {
            let mut table = self.table.lock();
            let record = Self::record(&mut table, id)?;
            let status = record.machine.job().status;
            if status == JobStatus::Running {
                record.cancel.cancel();
            }
            status
        };

        match status {
            JobStatus::Pending => match self.cancel(id, reason) {
                Ok(finished) => Ok(CancelRequest::Cancelled(finished)),
                // A worker started it in between
                Err(OrchestratorError::InvalidStateTransition { .. }) => {
                    self.request_cancel(id, reason)
                }
                Err(e) => Err(e),
            },
            JobStatus::Running => Ok(CancelRequest::Signalled),
            _ => Ok(CancelRequest::Rejected),
        }
    }

    /// Drop every terminal job; returns how many were removed.
    pub fn purge_finished(&self) -> usize {
        let mut table = self.table.lock();
        let before = table.jobs.len();
        table.jobs.retain(|_, record| !record.machine.job().is_terminal());
        before - table.jobs.len()
    }

    /// Drop one terminal job. Active jobs are left alone (`Ok(false)`).
    pub fn remove(&self, id: Uuid) -> Result<bool> {
        let mut table = self.table.lock();
        let terminal = Self::record(&mut table, id)?.machine.job().is_terminal();
        if terminal {
            table.jobs.remove(&id);
        }
        Ok(terminal)
    }

    fn finish(
        &self,
        id: Uuid,
        transition: impl FnOnce(&mut JobStateMachine) -> Result<()>,
    ) -> Result<Finished> {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        let record = Self::record(table, id)?;
        transition(&mut record.machine)?;

        let job = record.machine.job().clone();
        let target = record.target.clone();
        let callbacks = std::mem::take(&mut record.callbacks);
        record.cancel.cancel();
        record.updates.send_replace(job.clone());

        if table.active.get(&job.subject) == Some(&id) {
            table.active.remove(&job.subject);
        }
        if table.targets.get(&target) == Some(&id) {
            table.targets.remove(&target);
        }
        Ok(Finished { job, callbacks })
    }

    fn record(table: &mut Table, id: Uuid) -> Result<&mut JobRecord> {
        table
            .jobs
            .get_mut(&id)
            .ok_or(OrchestratorError::JobNotFound(id))
    }
}
