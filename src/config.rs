use std::net::SocketAddr;
use std::time::Duration;

/// Default port the host API listens on.
pub const DEFAULT_PORT: u16 = 1113;

/// Configuration for the zfs volume provider.
#[derive(Debug, Clone)]
pub struct ZfsConfig {
    /// Path or name of the `zfs` binary
    pub binary: String,
}

impl Default for ZfsConfig {
    fn default() -> Self {
        Self {
            binary: "zfs".to_string(),
        }
    }
}

/// Configuration for the local process execution backend.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Shell used to run job commands (`<shell> -c <command>`)
    pub shell: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    /// Quiet period after which an event stream re-checks that its job exists.
    pub stream_check_interval: Duration,
    /// Per-listener queue depth. A listener whose queue fills is dropped.
    pub listener_buffer: usize,
    /// Finished jobs older than this are pruned. `None` keeps them forever.
    pub job_retention: Option<Duration>,
    pub zfs: ZfsConfig,
    pub process: ProcessConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            stream_check_interval: Duration::from_secs(10),
            listener_buffer: 64,
            job_retention: None,
            zfs: ZfsConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_stream_check_interval(mut self, interval: Duration) -> Self {
        self.stream_check_interval = interval;
        self
    }

    pub fn with_listener_buffer(mut self, buffer: usize) -> Self {
        // mpsc channels reject a zero capacity
        self.listener_buffer = buffer.max(1);
        self
    }

    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = Some(retention);
        self
    }
}
