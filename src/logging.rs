//! tracing-subscriber setup for both halves
//!
//! The controller logs to stderr. The agent has no console inside the game,
//! so it appends to a file instead. `RUST_LOG` overrides the default `info`.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

pub const AGENT_LOG_ENV: &str = "NETCAP_AGENT_LOG";
pub const AGENT_LOG_FILE: &str = "netcap-agent.log";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the stderr subscriber; a no-op if one is already set
pub fn init_controller() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(std::io::stderr)
        .try_init();
}

/// Where the agent writes its log
pub fn agent_log_path() -> PathBuf {
    std::env::var_os(AGENT_LOG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join(AGENT_LOG_FILE))
}

/// Install the file subscriber inside the host process
///
/// Returns the log path, or `None` when the file could not be opened or a
/// subscriber was already installed. The agent runs fine without logging.
pub fn init_agent() -> Option<PathBuf> {
    let path = agent_log_path();
    let file = OpenOptions::new().create(true).append(true).open(&path).ok()?;
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_ansi(false)
        .with_thread_names(true)
        .with_writer(Mutex::new(file))
        .try_init()
        .ok()?;
    Some(path)
}
