//! Job Queue - asynchronous test runs with non-blocking polling
//!
//! **Semantics:**
//! - `enqueue` validates and normalizes the spec, records the job as
//!   `queued`, pushes its ID onto the worker channel and returns. It never
//!   runs anything inline.
//! - A bounded pool of workers pops IDs in FIFO order. A worker claims a job
//!   by moving it `queued -> running` under the table lock; a job that was
//!   cancelled meanwhile is skipped, so dispatch is at-most-once.
//! - `poll`, `get_status`, `cancel` and `list_active` only touch the job
//!   table, and the table lock is never held while a test runs.
//! - Terminal jobs keep their result until `result_ttl_secs` expires.

use crate::error::RunnerError;
use crate::executor::CancelFlag;
use crate::host::RemoteTestHost;
use crate::manager::Manager;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tessera_common::config::RunnerConfig;
use tessera_common::spec::{Qualifiers, TestSpec};
use tessera_common::types::{
    CancelResponse, EnqueueResponse, ExecutionResult, Job, JobId, JobState, JobSummary,
    PollResponse,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// What a terminal job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobOutcome {
    Report(ExecutionResult),
    Failure(String),
}

struct JobRecord {
    job: Job,
    seq: u64,
    cancel: CancelFlag,
    outcome: Option<Arc<JobOutcome>>,
    finished: Option<Instant>,
}

impl JobRecord {
    fn finish(&mut self, state: JobState, outcome: JobOutcome) {
        debug_assert!(self.job.state.can_transition_to(state));
        self.job.state = state;
        self.job.completed_at = Some(Utc::now());
        self.outcome = Some(Arc::new(outcome));
        self.finished = Some(Instant::now());
    }

    fn poll_response(&self) -> PollResponse {
        let mut response = PollResponse {
            job_id: self.job.id,
            status: self.job.state,
            result_status: None,
            summary: None,
            classes: None,
            cancelled: None,
            error: None,
        };

        match self.outcome.as_deref() {
            Some(JobOutcome::Report(report)) => {
                response.result_status = Some(report.status);
                response.summary = Some(report.summary.clone());
                response.classes = Some(report.classes.clone());
                response.cancelled = Some(report.cancelled);
            }
            Some(JobOutcome::Failure(message)) => {
                response.error = Some(message.clone());
            }
            None => {}
        }

        response
    }
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, JobRecord>,
    next_seq: u64,
}

impl JobTable {
    fn purge_expired(&mut self, ttl: Duration) {
        let before = self.jobs.len();
        self.jobs
            .retain(|_, record| record.finished.map_or(true, |at| at.elapsed() < ttl));
        let purged = before - self.jobs.len();
        if purged > 0 {
            debug!(purged, "Purged expired jobs");
        }
    }
}

struct Shared {
    table: Mutex<JobTable>,
    host: Arc<dyn RemoteTestHost>,
    config: RunnerConfig,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct JobQueue {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::UnboundedSender<JobId>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Start the queue and its worker pool. Must be called inside a tokio
    /// runtime.
    pub fn new(host: Arc<dyn RemoteTestHost>, config: RunnerConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shared = Arc::new(Shared {
            table: Mutex::new(JobTable::default()),
            host,
            config,
        });

        let workers = (0..shared.config.workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&shared),
                    Arc::clone(&receiver),
                ))
            })
            .collect();

        info!(workers = shared.config.workers, "Job queue started");

        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a test run. Invalid specs or qualifiers are rejected here and
    /// never become jobs.
    pub fn enqueue(
        &self,
        spec: &str,
        qualifiers: &str,
        root_path: &str,
    ) -> Result<EnqueueResponse, RunnerError> {
        let parsed = TestSpec::parse(spec)?;
        let qualifiers = if qualifiers.trim().is_empty() {
            self.shared.config.default_qualifiers.as_str()
        } else {
            qualifiers
        };
        let parsed_qualifiers = Qualifiers::parse(qualifiers)?;

        let id = Uuid::new_v4();
        let job = Job {
            id,
            spec: parsed.to_string(),
            qualifiers: parsed_qualifiers.to_string(),
            root_path: root_path.to_string(),
            state: JobState::Queued,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        {
            let mut table = self.shared.table();
            table.purge_expired(self.shared.config.result_ttl());
            let seq = table.next_seq;
            table.next_seq += 1;
            table.jobs.insert(
                id,
                JobRecord {
                    job,
                    seq,
                    cancel: CancelFlag::new(),
                    outcome: None,
                    finished: None,
                },
            );
        }

        let sent = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|sender| sender.send(id).is_ok())
            .unwrap_or(false);

        if !sent {
            self.shared.table().jobs.remove(&id);
            return Err(RunnerError::Closed);
        }

        info!(job_id = %id, spec = %parsed, qualifiers = %parsed_qualifiers, "Job queued");
        Ok(EnqueueResponse {
            status: JobState::Queued,
            job_id: id,
        })
    }

    /// Current snapshot, with the result once the job is terminal.
    pub fn poll(&self, job_id: &JobId) -> Result<PollResponse, RunnerError> {
        self.shared
            .table()
            .jobs
            .get(job_id)
            .map(JobRecord::poll_response)
            .ok_or(RunnerError::NotFound(*job_id))
    }

    pub fn get_status(&self, job_id: &JobId) -> Result<JobState, RunnerError> {
        self.shared
            .table()
            .jobs
            .get(job_id)
            .map(|record| record.job.state)
            .ok_or(RunnerError::NotFound(*job_id))
    }

    /// Full job record without the result.
    pub fn job(&self, job_id: &JobId) -> Result<Job, RunnerError> {
        self.shared
            .table()
            .jobs
            .get(job_id)
            .map(|record| record.job.clone())
            .ok_or(RunnerError::NotFound(*job_id))
    }

    /// Cancel a job. Queued jobs are cancelled at once; running jobs stop at
    /// the next method boundary. Terminal jobs are left alone.
    pub fn cancel(&self, job_id: &JobId) -> Result<CancelResponse, RunnerError> {
        let mut table = self.shared.table();
        let record = table
            .jobs
            .get_mut(job_id)
            .ok_or(RunnerError::NotFound(*job_id))?;

        let cancelled = match record.job.state {
            JobState::Queued => {
                record.cancel.cancel();
                record.finish(
                    JobState::Cancelled,
                    JobOutcome::Report(ExecutionResult::cancelled_before_start()),
                );
                info!(job_id = %job_id, "Queued job cancelled");
                true
            }
            JobState::Running => {
                record.cancel.cancel();
                info!(job_id = %job_id, "Cancellation requested for running job");
                true
            }
            state => {
                debug!(job_id = %job_id, state = %state, "Cancel ignored for terminal job");
                false
            }
        };

        Ok(CancelResponse { cancelled })
    }

    /// Queued and running jobs in enqueue order.
    pub fn list_active(&self) -> Vec<JobSummary> {
        let mut table = self.shared.table();
        table.purge_expired(self.shared.config.result_ttl());

        let mut active: Vec<(u64, JobSummary)> = table
            .jobs
            .values()
            .filter(|record| !record.job.state.is_terminal())
            .map(|record| {
                (
                    record.seq,
                    JobSummary {
                        job_id: record.job.id,
                        status: record.job.state,
                        spec: record.job.spec.clone(),
                        enqueued_at: record.job.enqueued_at,
                    },
                )
            })
            .collect();
        active.sort_by_key(|(seq, _)| *seq);
        active.into_iter().map(|(_, summary)| summary).collect()
    }

    /// Stop accepting jobs, cancel everything in flight and wait for the
    /// workers to drain.
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        {
            let mut table = self.shared.table();
            for record in table.jobs.values_mut() {
                match record.job.state {
                    JobState::Queued => {
                        record.cancel.cancel();
                        record.finish(
                            JobState::Cancelled,
                            JobOutcome::Report(ExecutionResult::cancelled_before_start()),
                        );
                    }
                    JobState::Running => record.cancel.cancel(),
                    _ => {}
                }
            }
        }

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Job queue shut down");
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<JobId>>>,
) {
    debug!(worker_id, "Worker started");
    loop {
        let next = receiver.lock().await.recv().await;
        match next {
            Some(job_id) => process_job(&shared, job_id).await,
            None => break,
        }
    }
    debug!(worker_id, "Worker stopped");
}

#[instrument(skip_all, fields(job_id = %job_id))]
async fn process_job(shared: &Arc<Shared>, job_id: JobId) {
    // Claim the job: queued -> running, or skip it.
    let claimed = {
        let mut table = shared.table();
        match table.jobs.get_mut(&job_id) {
            Some(record) if record.job.state == JobState::Queued => {
                record.job.state = JobState::Running;
                record.job.started_at = Some(Utc::now());
                Some((
                    record.job.spec.clone(),
                    record.job.qualifiers.clone(),
                    record.cancel.clone(),
                ))
            }
            Some(record) => {
                debug!(state = %record.job.state, "Job no longer queued; skipping");
                None
            }
            None => {
                warn!("Job vanished before it could run");
                None
            }
        }
    };
    let Some((spec, qualifiers, cancel)) = claimed else {
        return;
    };

    info!(spec = %spec, "Job started");
    let start = Instant::now();
    let result = run_job(shared, &spec, &qualifiers, cancel).await;

    let (state, outcome) = match result {
        Ok(report) if report.cancelled => (JobState::Cancelled, JobOutcome::Report(report)),
        Ok(report) => (JobState::Completed, JobOutcome::Report(report)),
        Err(e) => {
            error!(error = %e, "Job errored");
            (JobState::Errored, JobOutcome::Failure(e.to_string()))
        }
    };

    if let Some(record) = shared.table().jobs.get_mut(&job_id) {
        record.finish(state, outcome);
    }

    info!(
        state = %state,
        execution_ms = start.elapsed().as_millis() as u64,
        "Job finished"
    );
}

/// Run one job on its own task so that a panic, or the job deadline,
/// still ends in a terminal state.
async fn run_job(
    shared: &Arc<Shared>,
    spec: &str,
    qualifiers: &str,
    cancel: CancelFlag,
) -> Result<ExecutionResult, RunnerError> {
    let spec = TestSpec::parse(spec)?;
    let qualifiers = Qualifiers::parse(qualifiers)?;
    let manager = Manager::new(Arc::clone(&shared.host), &shared.config, cancel);

    let mut task = tokio::spawn(async move { manager.run(&spec, &qualifiers).await });

    let joined = match shared.config.job_timeout() {
        Some(deadline) => match tokio::time::timeout(deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return Err(RunnerError::Timeout {
                    call: "job deadline".to_string(),
                    deadline_ms: deadline.as_millis() as u64,
                });
            }
        },
        None => task.await,
    };

    joined.map_err(|e| RunnerError::ExecutionFault {
        location: "run".to_string(),
        message: e.to_string(),
    })?
}
