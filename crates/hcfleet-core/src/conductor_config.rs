//! Conductor configuration artifact.
//!
//! Every conductor starts with empty agent/DNA/instance lists and two
//! websocket interfaces; agents and instances are added later over the
//! admin interface.

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{ADMIN_INTERFACE_ID, INSTANCE_INTERFACE_ID};
use crate::error::FleetResult;

/// Rendered to TOML and passed to the conductor with `-c`
#[derive(Debug, Clone, Serialize)]
pub struct ConductorConfig {
    pub persistence_dir: PathBuf,
    pub expose_trace_signals: bool,
    pub agents: Vec<toml::Value>,
    pub dnas: Vec<toml::Value>,
    pub instances: Vec<toml::Value>,
    pub interfaces: Vec<InterfaceConfig>,
    pub signals: SignalConfig,
    pub logger: LoggerConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceConfig {
    pub id: String,
    /// Trace signals are only delivered to admin interfaces, so both are admin
    pub admin: bool,
    pub instances: Vec<toml::Value>,
    pub driver: InterfaceDriver,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceDriver {
    #[serde(rename = "type")]
    pub kind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalConfig {
    pub trace: bool,
    pub consistency: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub rules: LogRules,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRules {
    pub rules: Vec<LogRule>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRule {
    pub exclude: bool,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkConfig {
    pub n3h_log_level: String,
    pub bootstrap_nodes: Vec<String>,
    pub n3h_mode: String,
    pub n3h_persistence_path: PathBuf,
}

impl ConductorConfig {
    /// Config for a conductor rooted at `work_dir`.
    pub fn generate(work_dir: &Path, admin_port: u16, instance_port: u16, debug: bool) -> Self {
        let websocket = |id: &str, port: u16| InterfaceConfig {
            id: id.to_string(),
            admin: true,
            instances: Vec::new(),
            driver: InterfaceDriver {
                kind: "websocket".to_string(),
                port,
            },
        };

        // Quiet runs drop the conductor's own debug chatter
        let rules = if debug {
            Vec::new()
        } else {
            vec![LogRule {
                exclude: true,
                pattern: "^debug".to_string(),
            }]
        };

        Self {
            persistence_dir: work_dir.to_path_buf(),
            expose_trace_signals: true,
            agents: Vec::new(),
            dnas: Vec::new(),
            instances: Vec::new(),
            interfaces: vec![
                websocket(ADMIN_INTERFACE_ID, admin_port),
                websocket(INSTANCE_INTERFACE_ID, instance_port),
            ],
            signals: SignalConfig {
                trace: true,
                consistency: false,
            },
            logger: LoggerConfig {
                kind: "debug".to_string(),
                rules: LogRules { rules },
            },
            network: NetworkConfig {
                n3h_log_level: if debug { "i" } else { "e" }.to_string(),
                bootstrap_nodes: Vec::new(),
                n3h_mode: "REAL".to_string(),
                n3h_persistence_path: work_dir.join("n3h-storage"),
            },
        }
    }

    pub fn to_toml(&self) -> FleetResult<String> {
        Ok(toml::to_string(self)?)
    }
}
