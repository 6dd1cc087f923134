//! One-directional replication jobs.

use crate::config::ReplicationConfig;
use crate::endpoint::Endpoint;
use crate::error::{SyncError, SyncResult};
use crate::remote::Remote;
use docsync_core::LocalStore;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

/// Identifier of a job, unique per coordinator.
pub type JobId = u64;

/// Terminal outcome of a job.
pub type JobOutcome = SyncResult<TransferSummary>;

/// Replication direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        })
    }
}

/// Lifecycle state of a job.
///
/// ```text
/// Created ──start()──▶ Running ──▶ Completed
///                             └──▶ Errored
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Constructed, not started.
    Created,
    /// Transfer in progress.
    Running,
    /// Transfer finished successfully.
    Completed,
    /// Transfer failed.
    Errored,
}

impl JobState {
    /// Returns true for `Completed` and `Errored`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Errored)
    }
}

/// Advisory progress of a running job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobProgress {
    /// Documents received from the source.
    pub documents_read: u64,
    /// Documents the target accepted.
    pub documents_written: u64,
    /// Checkpoint reached so far.
    pub checkpoint: u64,
}

/// What a completed job transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    /// Direction of the transfer.
    pub direction: Direction,
    /// Documents received from the source.
    pub documents_read: u64,
    /// Documents the target accepted.
    pub documents_written: u64,
    /// Checkpoint after the transfer.
    pub checkpoint: u64,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    /// Job id.
    pub id: JobId,
    /// Direction.
    pub direction: Direction,
    /// Current state.
    pub state: JobState,
    /// When `start` was called.
    pub started_at: Option<SystemTime>,
    /// When the terminal state was entered.
    pub finished_at: Option<SystemTime>,
}

#[derive(Debug)]
struct Lifecycle {
    state: JobState,
    started_at: Option<SystemTime>,
    finished_at: Option<SystemTime>,
}

impl Lifecycle {
    /// Applies a transition. Returns false, changing nothing, if the
    /// transition is not legal from the current state.
    fn transition(&mut self, to: JobState) -> bool {
        let legal = matches!(
            (self.state, to),
            (JobState::Created, JobState::Running)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Errored)
        );
        if !legal {
            debug!(from = ?self.state, to = ?to, "ignored job state change");
            return false;
        }

        self.state = to;
        match to {
            JobState::Running => self.started_at = Some(SystemTime::now()),
            JobState::Completed | JobState::Errored => self.finished_at = Some(SystemTime::now()),
            JobState::Created => {}
        }
        true
    }
}

/// A single pull or push between a [`LocalStore`] and a [`Remote`].
///
/// A job runs once. [`start`](Self::start) checks the endpoint, then runs
/// the transfer on the runtime's blocking pool and returns immediately.
/// The terminal outcome is delivered exactly once through the receiver
/// from [`take_completion`](Self::take_completion); progress updates on
/// [`progress`](Self::progress) are advisory.
///
/// The job never retries. Checkpoints are advanced after every batch, so
/// a later job resumes where a failed one stopped.
pub struct ReplicationJob {
    id: JobId,
    direction: Direction,
    endpoint: Endpoint,
    store: Arc<LocalStore>,
    remote: Arc<dyn Remote>,
    config: ReplicationConfig,
    lifecycle: Arc<Mutex<Lifecycle>>,
    progress: Arc<watch::Sender<JobProgress>>,
    completion_tx: Option<oneshot::Sender<JobOutcome>>,
    completion_rx: Option<oneshot::Receiver<JobOutcome>>,
}

impl fmt::Debug for ReplicationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationJob")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ReplicationJob {
    /// Creates a job in the `Created` state.
    pub fn new(
        id: JobId,
        direction: Direction,
        endpoint: Endpoint,
        store: Arc<LocalStore>,
        remote: Arc<dyn Remote>,
        config: ReplicationConfig,
    ) -> Self {
        let (completion_tx, completion_rx) = oneshot::channel();
        let (progress, _) = watch::channel(JobProgress::default());
        Self {
            id,
            direction,
            endpoint,
            store,
            remote,
            config,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: JobState::Created,
                started_at: None,
                finished_at: None,
            })),
            progress: Arc::new(progress),
            completion_tx: Some(completion_tx),
            completion_rx: Some(completion_rx),
        }
    }

    /// Returns the job id.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Returns the direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns the endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns the current state.
    pub fn state(&self) -> JobState {
        self.lifecycle.lock().state
    }

    /// Returns a snapshot of the job's lifecycle.
    pub fn info(&self) -> JobInfo {
        let lifecycle = self.lifecycle.lock();
        JobInfo {
            id: self.id,
            direction: self.direction,
            state: lifecycle.state,
            started_at: lifecycle.started_at,
            finished_at: lifecycle.finished_at,
        }
    }

    /// Subscribes to progress updates.
    pub fn progress(&self) -> watch::Receiver<JobProgress> {
        self.progress.subscribe()
    }

    /// Hands out the receiver of the terminal outcome. Returns `None` after
    /// the first call.
    pub fn take_completion(&mut self) -> Option<oneshot::Receiver<JobOutcome>> {
        self.completion_rx.take()
    }

    /// Starts the transfer on `runtime` and returns immediately.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Configuration`] if the endpoint is malformed; the job
    ///   stays `Created`
    /// - [`SyncError::InvalidStateTransition`] if the job was already started
    pub fn start(&mut self, runtime: &Handle) -> SyncResult<()> {
        self.endpoint.validate()?;

        let Some(completion_tx) = self.completion_tx.take() else {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", self.state()),
                to: format!("{:?}", JobState::Running),
            });
        };
        self.lifecycle.lock().transition(JobState::Running);

        let transfer = Transfer {
            id: self.id,
            direction: self.direction,
            endpoint: self.endpoint.clone(),
            store: Arc::clone(&self.store),
            remote: Arc::clone(&self.remote),
            config: self.config.clone(),
            progress: Arc::clone(&self.progress),
        };
        let lifecycle = Arc::clone(&self.lifecycle);

        info!(job = self.id, direction = %self.direction, endpoint = %self.endpoint, "replication started");
        runtime.spawn_blocking(move || {
            let outcome = transfer.run();
            // Release the store before anyone can observe the outcome.
            drop(transfer);
            let terminal = if outcome.is_ok() {
                JobState::Completed
            } else {
                JobState::Errored
            };
            if lifecycle.lock().transition(terminal) {
                // The receiver may be gone if nobody waits for the outcome.
                let _ = completion_tx.send(outcome);
            }
        });
        Ok(())
    }
}

/// The part of a job that runs on the blocking pool.
struct Transfer {
    id: JobId,
    direction: Direction,
    endpoint: Endpoint,
    store: Arc<LocalStore>,
    remote: Arc<dyn Remote>,
    config: ReplicationConfig,
    progress: Arc<watch::Sender<JobProgress>>,
}

impl Transfer {
    fn run(&self) -> JobOutcome {
        self.remote.authenticate(&self.endpoint)?;
        let summary = match self.direction {
            Direction::Pull => self.pull()?,
            Direction::Push => self.push()?,
        };
        info!(
            job = self.id,
            direction = %self.direction,
            read = summary.documents_read,
            written = summary.documents_written,
            checkpoint = summary.checkpoint,
            "replication finished"
        );
        Ok(summary)
    }

    fn pull(&self) -> SyncResult<TransferSummary> {
        let key = self.endpoint.checkpoint_key(Direction::Pull);
        let mut progress = JobProgress {
            checkpoint: self.store.checkpoint(&key),
            ..JobProgress::default()
        };

        loop {
            let response = self.remote.changes(
                self.endpoint.database(),
                progress.checkpoint,
                self.config.pull_batch_size,
            )?;

            for document in response.documents {
                progress.documents_read += 1;
                if self.store.apply_replicated(document)?.applies() {
                    progress.documents_written += 1;
                }
            }

            self.store.set_checkpoint(&key, response.last_sequence)?;
            progress.checkpoint = response.last_sequence;
            self.publish(progress);

            if !response.pending {
                break;
            }
        }

        Ok(self.summary(progress))
    }

    fn push(&self) -> SyncResult<TransferSummary> {
        let key = self.endpoint.checkpoint_key(Direction::Push);
        let mut progress = JobProgress {
            checkpoint: self.store.checkpoint(&key),
            ..JobProgress::default()
        };
        let mut conflicts = Vec::new();

        loop {
            let batch = self
                .store
                .changes_since(progress.checkpoint, self.config.push_batch_size);
            if batch.changes.is_empty() {
                break;
            }

            let documents: Vec<_> = batch.changes.into_iter().map(|c| c.document).collect();
            progress.documents_read += documents.len() as u64;
            let response = self
                .remote
                .bulk_docs(self.endpoint.database(), documents)?;
            progress.documents_written += response.written as u64;
            conflicts.extend(response.conflicts);

            self.store.set_checkpoint(&key, batch.last_sequence)?;
            progress.checkpoint = batch.last_sequence;
            self.publish(progress);

            if !batch.pending {
                break;
            }
        }

        if !conflicts.is_empty() {
            return Err(SyncError::Conflict { ids: conflicts });
        }
        Ok(self.summary(progress))
    }

    fn publish(&self, progress: JobProgress) {
        // No receivers is fine: progress is advisory.
        let _ = self.progress.send(progress);
    }

    fn summary(&self, progress: JobProgress) -> TransferSummary {
        TransferSummary {
            direction: self.direction,
            documents_read: progress.documents_read,
            documents_written: progress.documents_written,
            checkpoint: progress.checkpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{EmbeddedRemote, Fault};
    use docsync_core::{body_from_value, DocumentId, StoreConfig};
    use serde_json::json;

    fn setup() -> (Arc<LocalStore>, Arc<EmbeddedRemote>, Endpoint) {
        let store = Arc::new(LocalStore::in_memory(StoreConfig::default()).unwrap());
        let remote = Arc::new(EmbeddedRemote::in_memory());
        (store, remote, Endpoint::new("memory://remote", "people"))
    }

    fn job(
        direction: Direction,
        store: &Arc<LocalStore>,
        remote: &Arc<EmbeddedRemote>,
        endpoint: Endpoint,
    ) -> ReplicationJob {
        ReplicationJob::new(
            1,
            direction,
            endpoint,
            Arc::clone(store),
            Arc::clone(remote) as Arc<dyn Remote>,
            ReplicationConfig::default().with_pull_batch_size(2),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_applies_remote_documents_in_batches() {
        let (store, remote, endpoint) = setup();
        let people = remote.database("people").unwrap();
        for name in ["ada", "bob", "cy"] {
            people
                .put(
                    &DocumentId::new(name).unwrap(),
                    body_from_value(json!({"name": name})).unwrap(),
                )
                .unwrap();
        }

        let mut job = job(Direction::Pull, &store, &remote, endpoint);
        assert_eq!(job.state(), JobState::Created);
        let completion = job.take_completion().unwrap();
        job.start(&Handle::current()).unwrap();

        let summary = completion.await.unwrap().unwrap();
        assert_eq!(summary.documents_read, 3);
        assert_eq!(summary.documents_written, 3);
        assert_eq!(summary.checkpoint, 3);
        assert_eq!(store.len(), 3);
        assert_eq!(remote.stats().changes_requests, 2);
        assert_eq!(job.state(), JobState::Completed);
        assert!(job.info().finished_at.is_some());
        assert_eq!(store.checkpoint("pull:memory://remote/people"), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_sends_local_changes_once() {
        let (store, remote, endpoint) = setup();
        store
            .put(
                &DocumentId::new("ada").unwrap(),
                body_from_value(json!({"name": "Ada"})).unwrap(),
            )
            .unwrap();

        let mut first = job(Direction::Push, &store, &remote, endpoint.clone());
        let completion = first.take_completion().unwrap();
        first.start(&Handle::current()).unwrap();
        assert_eq!(completion.await.unwrap().unwrap().documents_written, 1);

        let mut second = job(Direction::Push, &store, &remote, endpoint);
        let completion = second.take_completion().unwrap();
        second.start(&Handle::current()).unwrap();
        let summary = completion.await.unwrap().unwrap();
        assert_eq!(summary.documents_read, 0);
        assert_eq!(remote.stats().bulk_requests, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_endpoint_fails_synchronously() {
        let (store, remote, _) = setup();
        let mut job = job(
            Direction::Pull,
            &store,
            &remote,
            Endpoint::new("no-scheme", "people"),
        );

        assert!(matches!(
            job.start(&Handle::current()),
            Err(SyncError::Configuration(_))
        ));
        assert_eq!(job.state(), JobState::Created);
        assert_eq!(remote.stats().authentications, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transfer_failure_is_reported_through_completion() {
        let (store, remote, endpoint) = setup();
        remote.inject_fault(Some(Fault::Unreachable));

        let mut job = job(Direction::Pull, &store, &remote, endpoint);
        let completion = job.take_completion().unwrap();
        job.start(&Handle::current()).unwrap();

        let outcome = completion.await.unwrap();
        assert!(matches!(outcome, Err(SyncError::Network { .. })));
        assert_eq!(job.state(), JobState::Errored);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn job_runs_only_once() {
        let (store, remote, endpoint) = setup();
        let mut job = job(Direction::Push, &store, &remote, endpoint);
        job.start(&Handle::current()).unwrap();

        assert!(matches!(
            job.start(&Handle::current()),
            Err(SyncError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn terminal_states_are_final() {
        let mut lifecycle = Lifecycle {
            state: JobState::Created,
            started_at: None,
            finished_at: None,
        };
        assert!(!lifecycle.transition(JobState::Completed));
        assert!(lifecycle.transition(JobState::Running));
        assert!(lifecycle.transition(JobState::Errored));
        assert!(!lifecycle.transition(JobState::Completed));
        assert!(!lifecycle.transition(JobState::Running));
        assert_eq!(lifecycle.state, JobState::Errored);
        assert!(lifecycle.state.is_terminal());
    }
}
