//! Fleet configuration.
//!
//! Built-in defaults, overridden by environment variables:
//!
//! | Variable | Purpose |
//! |----------|---------|
//! | `HCFLEET_CONDUCTOR_BIN` | Conductor binary (falls back to `EMULATION_HOLOCHAIN_BIN_PATH`) |
//! | `HCFLEET_CONDUCTORS` | Number of conductors in a new cluster |
//! | `HCFLEET_ADMIN_PORT_BASE` | First admin websocket port |
//! | `HCFLEET_INSTANCE_PORT_BASE` | First instance websocket port |
//! | `HCFLEET_DEBUG` | Verbose conductor logging |
//! | `HCFLEET_READY_TIMEOUT_MS` | Bound on the readiness wait (unbounded if unset) |
//! | `HCFLEET_RECONNECT_TIMEOUT_MS` | Bound on the attach reconnect wait (unbounded if unset) |
//! | `HCFLEET_WORK_DIR` | Root for conductor working directories |
//! | `HCFLEET_LOGS_DIR` | Capture relayed conductor output as JSONL |
//! | `HCFLEET_CONSISTENCY_RETRIES` | Consistency rounds |
//! | `HCFLEET_CONSISTENCY_DELAY_MS` | Delay between consistency rounds |

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Printed by the conductor once its interfaces are listening
pub const READY_MARKER: &str = "Starting interfaces...";

/// Interface id of the admin websocket
pub const ADMIN_INTERFACE_ID: &str = "admin-interface";

/// Interface id of the instance (data) websocket
pub const INSTANCE_INTERFACE_ID: &str = "dna-interface";

/// Read an env var, parse it, and apply it to `target`. Logs a warning on parse failure.
fn env_parse<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = std::env::var(var) {
        match val.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env = var,
                value = %val,
                expected_type = std::any::type_name::<T>(),
                "Invalid env var value, using default"
            ),
        }
    }
}

/// Read a millisecond env var into an optional duration.
fn env_millis_opt(var: &str, target: &mut Option<Duration>) {
    if let Ok(val) = std::env::var(var) {
        match val.trim().parse::<u64>() {
            Ok(ms) => *target = Some(Duration::from_millis(ms)),
            Err(_) => warn!(env = var, value = %val, "Invalid millisecond value, ignoring"),
        }
    }
}

/// Read an env var as a path, skipping empty values.
fn env_path_opt(var: &str) -> Option<PathBuf> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// First admin and instance ports; conductor `i` binds `admin + i` and `instance + i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBase {
    pub admin: u16,
    pub instance: u16,
}

impl Default for PortBase {
    fn default() -> Self {
        Self {
            admin: 3000,
            instance: 4000,
        }
    }
}

/// Bounded retry settings for the consistency check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistencyOptions {
    /// Total number of rounds before giving up
    pub retries: u32,
    /// Sleep between rounds
    pub retry_delay: Duration,
}

impl Default for ConsistencyOptions {
    fn default() -> Self {
        Self {
            retries: 5,
            retry_delay: Duration::from_millis(10_000),
        }
    }
}

/// Root configuration for a fleet
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Conductor binary to launch
    pub conductor_bin: PathBuf,
    /// Number of conductors `Cluster::initialize` spawns
    pub conductors: usize,
    pub ports: PortBase,
    /// Verbose conductor and network logging
    pub debug: bool,
    /// Substring on conductor stdout that signals readiness
    pub ready_marker: String,
    /// `None` waits forever for the readiness marker
    pub ready_timeout: Option<Duration>,
    /// `None` waits forever for the data channel to come back after attach
    pub reconnect_timeout: Option<Duration>,
    /// Root for per-conductor working directories; a temp dir when `None`
    pub work_dir: Option<PathBuf>,
    /// Where relayed conductor output is captured as JSONL
    pub logs_dir: Option<PathBuf>,
    pub consistency: ConsistencyOptions,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            conductor_bin: PathBuf::from("holochain"),
            conductors: 2,
            ports: PortBase::default(),
            debug: false,
            ready_marker: READY_MARKER.to_string(),
            ready_timeout: None,
            reconnect_timeout: None,
            work_dir: None,
            logs_dir: None,
            consistency: ConsistencyOptions::default(),
        }
    }
}

impl FleetConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `HCFLEET_*` environment overrides on top of the current values
    pub fn apply_env_overrides(&mut self) {
        if let Some(bin) = env_path_opt("HCFLEET_CONDUCTOR_BIN")
            .or_else(|| env_path_opt("EMULATION_HOLOCHAIN_BIN_PATH"))
        {
            self.conductor_bin = bin;
        }
        env_parse("HCFLEET_CONDUCTORS", &mut self.conductors);
        env_parse("HCFLEET_ADMIN_PORT_BASE", &mut self.ports.admin);
        env_parse("HCFLEET_INSTANCE_PORT_BASE", &mut self.ports.instance);
        env_parse("HCFLEET_DEBUG", &mut self.debug);
        env_millis_opt("HCFLEET_READY_TIMEOUT_MS", &mut self.ready_timeout);
        env_millis_opt("HCFLEET_RECONNECT_TIMEOUT_MS", &mut self.reconnect_timeout);
        if let Some(dir) = env_path_opt("HCFLEET_WORK_DIR") {
            self.work_dir = Some(dir);
        }
        if let Some(dir) = env_path_opt("HCFLEET_LOGS_DIR") {
            self.logs_dir = Some(dir);
        }
        env_parse("HCFLEET_CONSISTENCY_RETRIES", &mut self.consistency.retries);
        let mut delay_ms = self.consistency.retry_delay.as_millis() as u64;
        env_parse("HCFLEET_CONSISTENCY_DELAY_MS", &mut delay_ms);
        self.consistency.retry_delay = Duration::from_millis(delay_ms);
    }

    pub fn with_conductors(mut self, conductors: usize) -> Self {
        self.conductors = conductors;
        self
    }

    pub fn with_ports(mut self, ports: PortBase) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_conductor_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.conductor_bin = bin.into();
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }
}
