//! Replication coordinator: one job per direction, pull-then-push sync.

use crate::config::ReplicationConfig;
use crate::dispatch::Delivery;
use crate::endpoint::Endpoint;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent, SyncObserver, SyncSummary};
use crate::job::{Direction, JobId, JobInfo, JobOutcome, ReplicationJob, TransferSummary};
use crate::remote::Remote;
use docsync_core::LocalStore;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Counters kept by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    /// Pull jobs that completed.
    pub pulls_completed: u64,
    /// Push jobs that completed.
    pub pushes_completed: u64,
    /// Sync cycles that completed.
    pub syncs_completed: u64,
    /// Replications that failed.
    pub failures: u64,
    /// Documents written locally by pulls.
    pub documents_pulled: u64,
    /// Documents the remote accepted from pushes.
    pub documents_pushed: u64,
    /// When the last sync cycle completed.
    pub last_sync: Option<SystemTime>,
    /// Text of the last failure.
    pub last_error: Option<String>,
}

/// Continuation run on the delivery context once a job is finished and its
/// slot is free again.
type Finish = Box<dyn FnOnce(&Arc<Shared>, JobId, JobOutcome) + Send + 'static>;

/// Hook run on the delivery context after a pull, before it is reported.
type AfterPull = Box<dyn FnOnce() -> SyncResult<()> + Send + 'static>;

#[derive(Debug, Default)]
struct ActiveJobs {
    pull: Option<ReplicationJob>,
    push: Option<ReplicationJob>,
}

impl ActiveJobs {
    fn slot(&mut self, direction: Direction) -> &mut Option<ReplicationJob> {
        match direction {
            Direction::Pull => &mut self.pull,
            Direction::Push => &mut self.push,
        }
    }
}

struct Shared {
    store: Arc<LocalStore>,
    remote: Arc<dyn Remote>,
    endpoint: Endpoint,
    config: ReplicationConfig,
    runtime: Handle,
    active: Mutex<ActiveJobs>,
    delivery: Arc<dyn Delivery>,
    events: EventBus,
    next_job_id: AtomicU64,
    stats: RwLock<ReplicationStats>,
}

/// Runs pull and push jobs against one endpoint.
///
/// At most one job per direction exists at a time: asking for a second
/// one while the first is outstanding fails with [`SyncError::Busy`]. It
/// is never queued and never replaces the running job.
///
/// Calls return as soon as the job has started. Completion callbacks,
/// events and failure reports all run later on the delivery context, one
/// at a time. A failed job never invokes its callback; the failure is
/// logged, counted and emitted as [`SyncEvent::ReplicationFailed`], and the
/// direction is free again.
///
/// Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct ReplicationCoordinator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ReplicationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("endpoint", &self.shared.endpoint)
            .field("active", &*self.shared.active.lock())
            .finish_non_exhaustive()
    }
}

impl ReplicationCoordinator {
    /// Creates a coordinator.
    ///
    /// Jobs run on `runtime`; completions run on `delivery`.
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn Remote>,
        endpoint: Endpoint,
        config: ReplicationConfig,
        runtime: Handle,
        delivery: Arc<dyn Delivery>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            shared: Arc::new(Shared {
                store,
                remote,
                endpoint,
                config,
                runtime,
                active: Mutex::new(ActiveJobs::default()),
                delivery,
                events,
                next_job_id: AtomicU64::new(1),
                stats: RwLock::new(ReplicationStats::default()),
            }),
        }
    }

    /// Returns the endpoint jobs replicate with.
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Starts a pull. `on_complete` runs once if the pull succeeds.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Busy`] if a pull is outstanding
    /// - [`SyncError::Configuration`] if the endpoint is malformed
    pub fn pull<F>(&self, on_complete: F) -> SyncResult<JobId>
    where
        F: FnOnce(&TransferSummary) + Send + 'static,
    {
        self.pull_with(|| Ok(()), on_complete)
    }

    /// Starts a pull that runs `after_pull` before reporting success.
    ///
    /// If `after_pull` fails, the pull is reported as failed and
    /// `on_complete` is not invoked.
    ///
    /// # Errors
    ///
    /// Same as [`pull`](Self::pull).
    pub fn pull_with<H, F>(&self, after_pull: H, on_complete: F) -> SyncResult<JobId>
    where
        H: FnOnce() -> SyncResult<()> + Send + 'static,
        F: FnOnce(&TransferSummary) + Send + 'static,
    {
        let after_pull: AfterPull = Box::new(after_pull);
        self.shared.start(
            Direction::Pull,
            Box::new(move |shared: &Arc<Shared>, job: JobId, outcome: JobOutcome| {
                let Some(summary) = shared.settle_pull(outcome, after_pull, false) else {
                    return;
                };
                on_complete(&summary);
                shared.events.emit(SyncEvent::PullCompleted { job, summary });
            }),
        )
    }

    /// Starts a push. `on_complete` runs once if the push succeeds.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Busy`] if a push is outstanding
    /// - [`SyncError::Configuration`] if the endpoint is malformed
    pub fn push<F>(&self, on_complete: F) -> SyncResult<JobId>
    where
        F: FnOnce(&TransferSummary) + Send + 'static,
    {
        self.shared.start(
            Direction::Push,
            Box::new(move |shared: &Arc<Shared>, job: JobId, outcome: JobOutcome| match outcome {
                Ok(summary) => {
                    on_complete(&summary);
                    shared.events.emit(SyncEvent::PushCompleted { job, summary });
                }
                Err(err) => shared.report_failure(Direction::Push, false, &err),
            }),
        )
    }

    /// Pulls, then pushes. `on_complete` runs once, only if both succeed.
    ///
    /// The push job is created only after the pull has completed. A failed
    /// leg ends the cycle: it is reported once and nothing further runs.
    ///
    /// # Errors
    ///
    /// Errors starting the pull leg are returned directly. Later failures
    /// are reported through events only.
    pub fn sync<F>(&self, on_complete: F) -> SyncResult<JobId>
    where
        F: FnOnce(&SyncSummary) + Send + 'static,
    {
        self.sync_with(|| Ok(()), on_complete)
    }

    /// Like [`sync`](Self::sync), running `after_pull` between the legs.
    ///
    /// # Errors
    ///
    /// Same as [`sync`](Self::sync).
    pub fn sync_with<H, F>(&self, after_pull: H, on_complete: F) -> SyncResult<JobId>
    where
        H: FnOnce() -> SyncResult<()> + Send + 'static,
        F: FnOnce(&SyncSummary) + Send + 'static,
    {
        let after_pull: AfterPull = Box::new(after_pull);
        self.shared.start(
            Direction::Pull,
            Box::new(move |shared: &Arc<Shared>, job: JobId, outcome: JobOutcome| {
                let Some(pulled) = shared.settle_pull(outcome, after_pull, true) else {
                    return;
                };
                shared.events.emit(SyncEvent::PullCompleted {
                    job,
                    summary: pulled.clone(),
                });

                let push_finish: Finish = Box::new(move |shared: &Arc<Shared>, job: JobId, outcome: JobOutcome| {
                    let pushed = match outcome {
                        Ok(pushed) => pushed,
                        Err(err) => return shared.report_failure(Direction::Push, true, &err),
                    };
                    shared.events.emit(SyncEvent::PushCompleted {
                        job,
                        summary: pushed.clone(),
                    });

                    let summary = SyncSummary { pulled, pushed };
                    {
                        let mut stats = shared.stats.write();
                        stats.syncs_completed += 1;
                        stats.last_sync = Some(SystemTime::now());
                    }
                    info!("sync completed");
                    on_complete(&summary);
                    shared.events.emit(SyncEvent::SyncCompleted(summary));
                });

                if let Err(err) = shared.start(Direction::Push, push_finish) {
                    shared.report_failure(Direction::Push, true, &err);
                }
            }),
        )
    }

    /// Returns true if a job in `direction` is outstanding.
    pub fn is_busy(&self, direction: Direction) -> bool {
        self.shared.active.lock().slot(direction).is_some()
    }

    /// Returns the outstanding job in `direction`, if any.
    pub fn active_job(&self, direction: Direction) -> Option<JobInfo> {
        self.shared
            .active
            .lock()
            .slot(direction)
            .as_ref()
            .map(ReplicationJob::info)
    }

    /// Subscribes to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Registers an observer called on the delivery context.
    pub fn add_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.shared.events.add_observer(observer);
    }

    /// Returns a copy of the counters.
    pub fn stats(&self) -> ReplicationStats {
        self.shared.stats.read().clone()
    }
}

impl Shared {
    /// Creates and starts a job, then arranges for `finish` to run on the
    /// delivery context once it ends.
    fn start(self: &Arc<Self>, direction: Direction, finish: Finish) -> SyncResult<JobId> {
        let mut active = self.active.lock();
        let slot = active.slot(direction);
        if let Some(running) = slot.as_ref() {
            warn!(%direction, running = running.id(), "replication already running, rejecting request");
            return Err(SyncError::Busy { direction });
        }

        let id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let mut job = ReplicationJob::new(
            id,
            direction,
            self.endpoint.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            self.config.clone(),
        );
        let completion = job
            .take_completion()
            .ok_or_else(|| SyncError::Aborted(format!("job {id} has no completion channel")))?;
        job.start(&self.runtime)?;
        *slot = Some(job);
        drop(active);

        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            let outcome = completion
                .await
                .unwrap_or_else(|_| Err(SyncError::Aborted(format!("job {id} stopped early"))));
            let delivery = Arc::clone(&shared.delivery);
            delivery.deliver(Box::new(move || {
                shared.finish_job(direction, id, outcome, finish);
            }));
        });
        Ok(id)
    }

    fn finish_job(self: &Arc<Self>, direction: Direction, id: JobId, outcome: JobOutcome, finish: Finish) {
        {
            let mut active = self.active.lock();
            let slot = active.slot(direction);
            if slot.as_ref().map(ReplicationJob::id) == Some(id) {
                *slot = None;
            }
        }

        if let Ok(summary) = &outcome {
            let mut stats = self.stats.write();
            match direction {
                Direction::Pull => {
                    stats.pulls_completed += 1;
                    stats.documents_pulled += summary.documents_written;
                }
                Direction::Push => {
                    stats.pushes_completed += 1;
                    stats.documents_pushed += summary.documents_written;
                }
            }
        }
        finish(self, id, outcome);
    }

    /// Runs the post-pull hook. Returns the summary if the pull succeeded
    /// end to end; otherwise reports the failure and returns `None`.
    fn settle_pull(
        &self,
        outcome: JobOutcome,
        after_pull: AfterPull,
        composite: bool,
    ) -> Option<TransferSummary> {
        let result = outcome.and_then(|summary| after_pull().map(|()| summary));
        match result {
            Ok(summary) => Some(summary),
            Err(err) => {
                self.report_failure(Direction::Pull, composite, &err);
                None
            }
        }
    }

    fn report_failure(&self, direction: Direction, composite: bool, err: &SyncError) {
        let cause = err.cause();
        error!(%direction, composite, %cause, error = %err, "replication failed");
        {
            let mut stats = self.stats.write();
            stats.failures += 1;
            stats.last_error = Some(err.to_string());
        }
        self.events.emit(SyncEvent::ReplicationFailed {
            direction,
            composite,
            cause,
            message: err.to_string(),
        });
    }
}
