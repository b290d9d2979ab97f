//! Eventual-consistency checks across a fleet.
//!
//! A check runs in rounds. Each round takes a fresh holding snapshot from
//! every member and counts the expected addresses that no member holds.
//! Rounds repeat with a fixed delay until that count is zero or the
//! rounds run out.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConsistencyOptions;
use crate::error::{FleetError, FleetResult};
use crate::poll::{poll, PollOptions};

/// Content address of an entry or aspect
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for Address {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Response to `debug/state_dump` for one instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDump {
    /// Entry address to the aspect addresses held for it
    #[serde(default)]
    pub held_aspects: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub source_chain: Vec<Value>,
}

impl StateDump {
    /// Decode a dump that may arrive as an object or as a JSON string.
    pub fn from_value(value: Value) -> FleetResult<Self> {
        let malformed = |e: serde_json::Error| FleetError::MalformedResponse {
            method: crate::rpc::STATE_DUMP.to_string(),
            message: e.to_string(),
        };
        match value {
            Value::String(text) => serde_json::from_str(&text).map_err(malformed),
            other => serde_json::from_value(other).map_err(malformed),
        }
    }

    /// Entry and aspect addresses held by the instance
    pub fn held_addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.held_aspects
            .iter()
            .flat_map(|(entry, aspects)| std::iter::once(entry).chain(aspects.iter()))
            .map(|a| Address::new(a.as_str()))
    }
}

/// Everything one member holds, across all of its instances
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HoldingSnapshot {
    pub peer_id: String,
    pub held: BTreeSet<Address>,
}

impl HoldingSnapshot {
    pub fn new(peer_id: impl Into<String>, held: impl IntoIterator<Item = Address>) -> Self {
        Self {
            peer_id: peer_id.into(),
            held: held.into_iter().collect(),
        }
    }

    /// Union of several instance dumps
    pub fn from_dumps<'a>(
        peer_id: impl Into<String>,
        dumps: impl IntoIterator<Item = &'a StateDump>,
    ) -> Self {
        Self::new(peer_id, dumps.into_iter().flat_map(StateDump::held_addresses))
    }

    pub fn holds(&self, address: &Address) -> bool {
        self.held.contains(address)
    }
}

/// Result of a consistency check
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyReport {
    /// Expected addresses nobody held in the final round
    pub missing_count: usize,
    /// For each expected address, the members holding it
    pub held_by: BTreeMap<Address, Vec<String>>,
    /// Members snapshotted in the final round
    pub members: usize,
    /// Rounds taken
    pub rounds: u32,
}

impl ConsistencyReport {
    /// Evaluate one round from fresh snapshots.
    pub fn from_snapshots(expected: &[Address], snapshots: &[HoldingSnapshot], rounds: u32) -> Self {
        let held_by: BTreeMap<Address, Vec<String>> = expected
            .iter()
            .map(|address| {
                let holders = snapshots
                    .iter()
                    .filter(|s| s.holds(address))
                    .map(|s| s.peer_id.clone())
                    .collect();
                (address.clone(), holders)
            })
            .collect();
        let missing_count = held_by
            .values()
            .filter(|holders| holders.is_empty())
            .count();

        Self {
            missing_count,
            held_by,
            members: snapshots.len(),
            rounds,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.missing_count == 0
    }

    /// Expected addresses without a holder
    pub fn missing(&self) -> Vec<&Address> {
        self.held_by
            .iter()
            .filter(|(_, holders)| holders.is_empty())
            .map(|(address, _)| address)
            .collect()
    }
}

/// Something that can report what a member currently holds
pub trait StateSource: Send + Sync {
    fn peer_id(&self) -> String;

    fn holding_snapshot(&self) -> impl Future<Output = FleetResult<HoldingSnapshot>> + Send;
}

impl<T: StateSource> StateSource for Arc<T> {
    fn peer_id(&self) -> String {
        (**self).peer_id()
    }

    fn holding_snapshot(&self) -> impl Future<Output = FleetResult<HoldingSnapshot>> + Send {
        (**self).holding_snapshot()
    }
}

/// Poll `members` until every expected address has at least one holder.
///
/// Returns the report of the last round; `missing_count > 0` means the
/// rounds ran out. Snapshot failures abort the check.
pub async fn check_consistency<S: StateSource>(
    members: &[S],
    expected: &[Address],
    options: ConsistencyOptions,
) -> FleetResult<ConsistencyReport> {
    tracing::info!(
        members = members.len(),
        expected = expected.len(),
        retries = options.retries,
        "Checking consistency"
    );

    let outcome = poll(
        |round| async move {
            let snapshots = try_join_all(members.iter().map(|m| m.holding_snapshot())).await?;
            let report = ConsistencyReport::from_snapshots(expected, &snapshots, round);
            tracing::debug!(round, missing = report.missing_count, "Consistency round");
            Ok::<_, FleetError>(report)
        },
        ConsistencyReport::is_consistent,
        PollOptions {
            max_attempts: options.retries,
            interval: options.retry_delay,
        },
    )
    .await?;

    let converged = outcome.is_converged();
    let report = outcome.into_value();
    if converged {
        tracing::info!(rounds = report.rounds, "Fleet consistent");
    } else {
        tracing::warn!(
            rounds = report.rounds,
            missing = report.missing_count,
            "Fleet did not converge"
        );
    }
    Ok(report)
}
