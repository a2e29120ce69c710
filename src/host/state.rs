use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::error::{HostError, Result};
use crate::host::job::{ActiveJob, Event, Job, JobStatus};

/// Wildcard listener ID matching every job.
pub const ALL_JOBS: &str = "all";

/// What a listener is subscribed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerKey {
    All,
    Job(String),
}

impl ListenerKey {
    pub fn parse(id: &str) -> Self {
        if id == ALL_JOBS {
            ListenerKey::All
        } else {
            ListenerKey::Job(id.to_string())
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            ListenerKey::All => None,
            ListenerKey::Job(id) => Some(id),
        }
    }
}

impl std::fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerKey::All => write!(f, "{}", ALL_JOBS),
            ListenerKey::Job(id) => write!(f, "{}", id),
        }
    }
}

/// Receiving half of a listener registration.
///
/// Must be handed back to [`JobStateStore::remove_listener`] when the owner
/// is done with it. Once removed the channel is closed and `recv` returns
/// `None` after any already-queued events.
#[derive(Debug)]
pub struct Listener {
    key: ListenerKey,
    id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Listener {
    pub fn key(&self) -> &ListenerKey {
        &self.key
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> std::result::Result<Event, TryRecvError> {
        self.rx.try_recv()
    }
}

/// What `StopJob` has to do after the store has evaluated the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// The job is still starting; the stop was recorded as a force stop.
    Deferred,
    /// The job is running; the execution backend must stop it.
    Backend,
}

/// A status report from the execution backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub exit_status: Option<i32>,
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn running() -> Self {
        Self {
            status: JobStatus::Running,
            exit_status: None,
            error: None,
        }
    }

    pub fn exited(code: i32) -> Self {
        Self {
            status: if code == 0 {
                JobStatus::Done
            } else {
                JobStatus::Crashed
            },
            exit_status: Some(code),
            error: None,
        }
    }

    pub fn stopped() -> Self {
        Self {
            status: JobStatus::Done,
            exit_status: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            exit_status: None,
            error: Some(error.into()),
        }
    }
}

/// Result of applying a [`StatusUpdate`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub event: Event,
    /// True when the job just left `Starting` with a force stop pending.
    pub force_stop: bool,
}

#[derive(Debug, Default)]
struct StoreInner {
    jobs: HashMap<String, ActiveJob>,
    listeners: HashMap<ListenerKey, HashMap<u64, mpsc::Sender<Event>>>,
    next_listener_id: u64,
}

impl StoreInner {
    /// Deliver `event` to listeners on its job and on the wildcard.
    ///
    /// Runs under the store lock so every listener observes status changes
    /// in the order the store applied them. Delivery never blocks: a full
    /// queue drops that listener, which closes its channel.
    fn notify(&mut self, event: &Event) {
        for key in [ListenerKey::Job(event.job_id.clone()), ListenerKey::All] {
            let Some(subscribers) = self.listeners.get_mut(&key) else {
                continue;
            };
            subscribers.retain(|listener_id, tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        listener = %key,
                        listener_id,
                        job_id = %event.job_id,
                        "Listener queue full, dropping listener"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
            if subscribers.is_empty() {
                self.listeners.remove(&key);
            }
        }
    }
}

/// Authoritative in-memory record of the jobs on this host.
///
/// Owns the listener registry used to fan status changes out to event
/// streams. All check-and-act sequences run under a single lock.
#[derive(Debug)]
pub struct JobStateStore {
    inner: Mutex<StoreInner>,
    listener_buffer: usize,
}

impl Default for JobStateStore {
    fn default() -> Self {
        Self::new(64)
    }
}

impl JobStateStore {
    pub fn new(listener_buffer: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            listener_buffer: listener_buffer.max(1),
        }
    }

    /// Point-in-time copy of every known job.
    pub fn get(&self) -> HashMap<String, ActiveJob> {
        self.inner.lock().jobs.clone()
    }

    pub fn get_job(&self, id: &str) -> Option<ActiveJob> {
        self.inner.lock().jobs.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().jobs.is_empty()
    }

    /// Insert a newly scheduled job in `Starting`.
    pub fn add_job(&self, job: Job) -> Result<ActiveJob> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.id) {
            return Err(HostError::JobExists(job.id));
        }
        let active = ActiveJob::new(job);
        inner.jobs.insert(active.id().to_string(), active.clone());
        inner.notify(&Event::from_job(&active));
        tracing::debug!(job_id = %active.id(), "Job added");
        Ok(active)
    }

    /// Mark a starting job to be stopped as soon as it is running.
    ///
    /// Returns false, and changes nothing, if the job is unknown or no
    /// longer starting.
    pub fn set_force_stop(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Starting => {
                job.force_stop = true;
                true
            }
            _ => false,
        }
    }

    /// Evaluate a stop request against the job's current status.
    ///
    /// A starting job gets its force-stop flag set here, under the same lock
    /// that [`set_status`](Self::set_status) takes, so a concurrent move to
    /// `Running` always sees the flag.
    pub fn begin_stop(&self, id: &str) -> Result<StopAction> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| HostError::UnknownJob(id.to_string()))?;
        match job.status {
            JobStatus::Starting => {
                job.force_stop = true;
                Ok(StopAction::Deferred)
            }
            JobStatus::Running => Ok(StopAction::Backend),
            _ => Err(HostError::AlreadyStopped(id.to_string())),
        }
    }

    /// Apply a status report from the execution backend and notify listeners.
    pub fn set_status(&self, id: &str, update: StatusUpdate) -> Result<StatusChange> {
        let mut inner = self.inner.lock();
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| HostError::UnknownJob(id.to_string()))?;

        if !job.status.can_transition_to(update.status) {
            return Err(HostError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to: update.status,
            });
        }

        let force_stop = job.status == JobStatus::Starting
            && update.status == JobStatus::Running
            && job.force_stop;

        let now = Utc::now();
        job.status = update.status;
        if update.status == JobStatus::Running {
            job.started_at = Some(now);
        }
        if update.status.is_terminal() {
            job.ended_at = Some(now);
            job.exit_status = update.exit_status;
            job.error = update.error;
        }

        let event = Event::from_job(job);
        inner.notify(&event);
        tracing::debug!(job_id = %id, status = %event.status, force_stop, "Job status changed");
        Ok(StatusChange { event, force_stop })
    }

    /// Register interest in events for `key`.
    pub fn add_listener(&self, key: ListenerKey) -> Listener {
        let (tx, rx) = mpsc::channel(self.listener_buffer);
        let mut inner = self.inner.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner
            .listeners
            .entry(key.clone())
            .or_default()
            .insert(id, tx);
        tracing::debug!(listener = %key, listener_id = id, "Listener added");
        Listener { key, id, rx }
    }

    /// Deregister a listener. Its channel closes once the sender is dropped
    /// here, so a consumer blocked on it wakes up.
    pub fn remove_listener(&self, listener: &Listener) -> bool {
        let mut inner = self.inner.lock();
        let Some(subscribers) = inner.listeners.get_mut(&listener.key) else {
            return false;
        };
        let removed = subscribers.remove(&listener.id).is_some();
        if subscribers.is_empty() {
            inner.listeners.remove(&listener.key);
        }
        if removed {
            tracing::debug!(listener = %listener.key, listener_id = listener.id, "Listener removed");
        }
        removed
    }

    /// Number of live listener registrations across all keys.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.values().map(HashMap::len).sum()
    }

    /// Remove terminal jobs that ended before `cutoff`. Returns the number removed.
    pub fn prune_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.ended_at.is_some_and(|ended| ended < cutoff))
        });
        before - inner.jobs.len()
    }
}
