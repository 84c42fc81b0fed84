use std::path::PathBuf;

/// Default values for computation spawn parameters.
///
/// Values named `def_*` are per-computation defaults a definition can
/// override; the rest apply to every computation and may be set from agent
/// command-line options.
#[derive(Debug, Clone)]
pub struct ComputationDefaults {
    pub def_memory_mb: u64,
    pub def_cores: u64,

    pub cleanup_process_group: bool,
    /// Suspends computations at "go" with SIGSTOP; a debugging aid, resumed
    /// manually with SIGCONT.
    pub auto_suspend: bool,

    pub def_disable_chunking: bool,
    pub def_min_chunking_size: u64,
    pub def_chunk_size: u64,

    /// Program spawned for each computation; located on PATH unless the
    /// definition wraps it.
    pub executor_program: String,

    pub log_level: i64,

    /// Path of the router's IPC socket, passed to spawned computations.
    pub ipc_path: PathBuf,

    /// Directory for per-computation exec config documents.
    pub tmp_dir: PathBuf,

    /// Sessions on the entry node expire if no client connects within this
    /// many seconds.
    pub client_connection_timeout_secs: u64,

    /// Time to wait for computations to terminate before an operation gives
    /// up (and, on delete, resorts to a forceful stop).
    pub wait_for_shutdown_secs: u64,
}

impl Default for ComputationDefaults {
    fn default() -> Self {
        Self {
            def_memory_mb: 2048,
            def_cores: 0,
            cleanup_process_group: true,
            auto_suspend: false,
            def_disable_chunking: false,
            def_min_chunking_size: 0,
            def_chunk_size: 0,
            executor_program: "gridexec".to_string(),
            log_level: 3,
            ipc_path: PathBuf::new(),
            tmp_dir: std::env::temp_dir(),
            client_connection_timeout_secs: 30,
            wait_for_shutdown_secs: 30,
        }
    }
}
