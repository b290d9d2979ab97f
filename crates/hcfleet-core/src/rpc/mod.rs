//! Websocket JSON-RPC plumbing for conductor interfaces.

pub mod client;
pub mod connection;
pub mod message;

pub use client::RpcChannel;
pub use connection::{ConnectionEvent, ConnectionState, ConnectionStatus, ConnectionTracker};
pub use message::{decode_inbound, Inbound, RpcErrorObject, RpcRequest};

/// Register an agent (test-only conductor admin method)
pub const AGENT_ADD: &str = "test/agent/add";
pub const DNA_INSTALL: &str = "admin/dna/install_from_file";
pub const INSTANCE_ADD: &str = "admin/instance/add";
pub const INSTANCE_START: &str = "admin/instance/start";
/// Attach an instance to an interface; the conductor bounces that interface's sockets
pub const INTERFACE_ADD_INSTANCE: &str = "admin/interface/add_instance";
pub const ZOME_CALL: &str = "call";
pub const STATE_DUMP: &str = "debug/state_dump";
