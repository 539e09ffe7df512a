use std::path::PathBuf;

/// Configuration for a Gungnir server or client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the server binds and listens on, as `host:port`.
    /// Required for servers, unused by clients.
    pub listen: Option<String>,

    /// Address a client connects to, as `host:port`.
    pub connect: Option<String>,

    /// Number of worker threads (default: half the cores, minimum 1).
    pub max_cores: usize,

    /// Path of the write-ahead log file. Required for servers.
    pub log_file_path: Option<PathBuf>,

    /// Replay the write-ahead log at startup instead of truncating it.
    pub recover: bool,

    /// How long an idle worker spins before parking, in microseconds.
    pub poll_micros: u64,

    /// In-memory WAL segment capacity in bytes (default: 1 MiB).
    pub segment_size: usize,

    /// Requests queued for a free worker beyond this limit are answered
    /// with a RETRY response instead of being buffered.
    pub waiting_rpc_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: None,
            connect: None,
            max_cores: default_worker_count(),
            log_file_path: None,
            recover: false,
            poll_micros: 10_000,
            segment_size: 1024 * 1024,
            waiting_rpc_limit: 1024,
        }
    }
}

impl Config {
    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.listen = Some(addr.into());
        self
    }

    pub fn connect(mut self, addr: impl Into<String>) -> Self {
        self.connect = Some(addr.into());
        self
    }

    pub fn max_cores(mut self, cores: usize) -> Self {
        self.max_cores = cores.max(1);
        self
    }

    pub fn log_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file_path = Some(path.into());
        self
    }

    pub fn recover(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }

    pub fn poll_micros(mut self, micros: u64) -> Self {
        self.poll_micros = micros;
        self
    }

    pub fn waiting_rpc_limit(mut self, limit: usize) -> Self {
        self.waiting_rpc_limit = limit;
        self
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}
