//! Conductor Fleet Harness
//!
//! Spawns fleets of conductor processes, drives them over their websocket
//! JSON-RPC interfaces and checks that data replicates across the fleet.
//!
//! ## Overview
//!
//! Each conductor runs as a child process with its own ports and working
//! directory. A [`ChannelManager`] holds its admin and instance channels, a
//! [`Cluster`] drives the whole fleet, and replication is judged either by
//! polling state dumps ([`check_consistency`]) or by counting hold signals
//! ([`QuorumSignalBarrier`]).
//!
//! ## Quick Start
//!
//! ```ignore
//! use hcfleet_core::{Address, Cluster, FleetConfig, Iteration};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster = Cluster::new(FleetConfig::from_env().with_conductors(3))?;
//!     cluster.initialize().await?;
//!
//!     cluster
//!         .batch(|member| async move {
//!             member.create_dna_instance("instance-0", "passthrough-dna.dna.json".as_ref()).await
//!         })
//!         .await?;
//!
//!     let hashes = cluster
//!         .mapper()
//!         .iteration(Iteration::Parallel)
//!         .map_instances(|item| async move {
//!             item.owner
//!                 .call_zome(&item.unit, "main", "commit_entry", serde_json::json!({ "content": "hi" }))
//!                 .await
//!         })
//!         .await?;
//!
//!     let expected: Vec<Address> = hashes
//!         .iter()
//!         .filter_map(|h| h.as_str().map(Address::from))
//!         .collect();
//!     let report = cluster.check_consistency(&expected).await?;
//!     assert!(report.is_consistent());
//!
//!     cluster.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod barrier;
pub mod batch;
pub mod channel;
pub mod cluster;
pub mod conductor_config;
pub mod config;
pub mod consistency;
pub mod error;
pub mod logging;
pub mod poll;
pub mod rpc;
pub mod scenario;
pub mod signal;
pub mod spawn;

// Re-exports
pub use barrier::{QuorumBarrier, QuorumOutcome, QuorumSignalBarrier};
pub use batch::{BatchItem, BatchMapper, Iteration};
pub use channel::{AgentIdentity, ChannelManager, ZomeOutcome};
pub use cluster::Cluster;
pub use conductor_config::ConductorConfig;
pub use config::{ConsistencyOptions, FleetConfig, PortBase};
pub use consistency::{
    check_consistency, Address, ConsistencyReport, HoldingSnapshot, StateDump, StateSource,
};
pub use error::{FleetError, FleetResult};
pub use poll::{poll, race_deadline, Deadline, PollOptions, PollOutcome};
pub use rpc::{ConnectionState, RpcChannel};
pub use signal::{is_hold_action, Signal, SignalKind, SignalStream};
pub use spawn::{PeerLayout, PeerProcess, PeerStatus, ProcessSpawner};
