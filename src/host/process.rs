use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::config::ProcessConfig;
use crate::error::{HostError, Result};
use crate::host::backend::ExecutionBackend;
use crate::host::job::{Job, JobStatus};
use crate::host::state::{JobStateStore, StatusUpdate};

type KillSwitches = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;

/// Runs jobs as local shell processes.
///
/// Each job's `command` is executed as `<shell> -c <command>`. The backend
/// reports `Running` as soon as the process is spawned, then `Done` on a
/// zero exit or an explicit stop, `Crashed` on any other exit, and `Failed`
/// when the process cannot be spawned at all.
#[derive(Clone)]
pub struct ProcessBackend {
    config: ProcessConfig,
    store: Arc<JobStateStore>,
    running: KillSwitches,
}

impl ProcessBackend {
    pub fn new(config: ProcessConfig, store: Arc<JobStateStore>) -> Self {
        Self {
            config,
            store,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn spawn(&self, command: &str) -> std::io::Result<Child> {
        Command::new(&self.config.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }

    async fn supervise(
        store: Arc<JobStateStore>,
        running: KillSwitches,
        job_id: String,
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
        force_stop: bool,
    ) {
        let update = if force_stop {
            tracing::info!(job_id = %job_id, "Force stopping job that finished starting");
            kill(&mut child).await;
            StatusUpdate::stopped()
        } else {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => exit_update(status),
                    Err(e) => StatusUpdate::failed(e.to_string()),
                },
                _ = kill_rx => {
                    kill(&mut child).await;
                    StatusUpdate::stopped()
                }
            }
        };

        // Record the exit before dropping the kill switch: a stop that finds
        // no switch must find a terminal status instead.
        let status = update.status;
        match store.set_status(&job_id, update) {
            Ok(_) => tracing::info!(job_id = %job_id, status = %status, "Job finished"),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to record job exit"),
        }

        running.lock().remove(&job_id);
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill job process");
    }
}

fn exit_update(status: ExitStatus) -> StatusUpdate {
    match status.code() {
        Some(code) => StatusUpdate::exited(code),
        // terminated by a signal we did not send
        None => StatusUpdate {
            status: JobStatus::Crashed,
            exit_status: None,
            error: Some(format!("terminated: {}", status)),
        },
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn run(&self, job: Job) -> Result<()> {
        let command = job
            .command
            .as_deref()
            .ok_or_else(|| HostError::Backend(format!("job {} has no command", job.id)))?;

        tracing::info!(job_id = %job.id, command, shell = %self.config.shell, "Starting job");

        let child = self
            .spawn(command)
            .map_err(|e| HostError::Backend(format!("failed to spawn job {}: {}", job.id, e)))?;

        // Register the kill switch before the job becomes visible as running,
        // so a stop issued right after the transition can reach it.
        let (kill_tx, kill_rx) = oneshot::channel();
        self.running.lock().insert(job.id.clone(), kill_tx);

        let change = match self.store.set_status(&job.id, StatusUpdate::running()) {
            Ok(change) => change,
            Err(e) => {
                self.running.lock().remove(&job.id);
                return Err(e);
            }
        };

        tokio::spawn(Self::supervise(
            self.store.clone(),
            self.running.clone(),
            job.id,
            child,
            kill_rx,
            change.force_stop,
        ));
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let Some(kill_tx) = self.running.lock().remove(id) else {
            // exited between the caller's status check and now
            if self.store.get_job(id).is_some_and(|job| job.status.is_terminal()) {
                return Err(HostError::AlreadyStopped(id.to_string()));
            }
            return Err(HostError::Backend(format!("no running process for job {}", id)));
        };
        tracing::info!(job_id = %id, "Stopping job");
        // the supervisor may have just observed the exit; that is still a stop
        let _ = kill_tx.send(());
        Ok(())
    }
}
