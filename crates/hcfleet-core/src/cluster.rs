//! A fleet of conductors driven as one unit.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};

use crate::barrier::QuorumSignalBarrier;
use crate::batch::BatchMapper;
use crate::channel::ChannelManager;
use crate::config::FleetConfig;
use crate::consistency::{check_consistency, Address, ConsistencyReport};
use crate::error::{FleetError, FleetResult};
use crate::logging::{write_session_metadata, SessionMetadata};
use crate::signal::{is_hold_action, Signal, SignalStream};
use crate::spawn::ProcessSpawner;

/// Spawns, tracks and tears down a set of conductors
pub struct Cluster {
    config: FleetConfig,
    spawner: ProcessSpawner,
    members: RwLock<Vec<Arc<ChannelManager>>>,
    /// Index handed to the next spawned conductor; never reused
    next_index: Mutex<usize>,
    initialized: AtomicBool,
}

impl Cluster {
    pub fn new(config: FleetConfig) -> FleetResult<Self> {
        let spawner = ProcessSpawner::new(&config)?;
        Ok(Self {
            config,
            spawner,
            members: RwLock::new(Vec::new()),
            next_index: Mutex::new(0),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn spawner(&self) -> &ProcessSpawner {
        &self.spawner
    }

    /// Current members in index order
    pub fn members(&self) -> Vec<Arc<ChannelManager>> {
        self.members.read().clone()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Spawn the configured number of conductors and initialize every one.
    pub async fn initialize(&self) -> FleetResult<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(FleetError::InvalidOperation(
                "cluster already initialized".to_string(),
            ));
        }
        let count = self.config.conductors;
        {
            let mut next = self.next_index.lock();
            *next = (*next).max(count);
        }

        tracing::info!(conductors = count, root = %self.spawner.root().display(), "Starting cluster");
        if let Some(dir) = &self.config.logs_dir {
            let metadata = SessionMetadata::new(self.config.conductor_bin.display().to_string(), count);
            if let Err(e) = write_session_metadata(dir, &metadata) {
                tracing::warn!(error = %e, "Failed to write session metadata");
            }
        }

        let processes = self.spawner.spawn_fleet(count).await?;
        let managers: Vec<Arc<ChannelManager>> = processes
            .into_iter()
            .map(|process| Arc::new(ChannelManager::new(process, self.config.reconnect_timeout)))
            .collect();
        // Registered before initializing so a failed start can still be shut down
        self.members.write().extend(managers);

        self.batch(|member| async move { member.initialize().await })
            .await?;
        tracing::info!(conductors = count, "Cluster initialized");
        Ok(())
    }

    /// Run `f` on every member concurrently; results come back in member order.
    pub async fn batch<F, Fut, R>(&self, f: F) -> FleetResult<Vec<R>>
    where
        F: Fn(Arc<ChannelManager>) -> Fut,
        Fut: Future<Output = FleetResult<R>>,
    {
        try_join_all(self.members().into_iter().map(f)).await
    }

    /// Spawn and initialize one more conductor at the next unused index.
    pub async fn add_conductor(&self) -> FleetResult<Arc<ChannelManager>> {
        let index = {
            let mut next = self.next_index.lock();
            let index = *next;
            *next += 1;
            index
        };

        let process = self.spawner.spawn(index).await?;
        let member = Arc::new(ChannelManager::new(process, self.config.reconnect_timeout));
        if let Err(e) = member.initialize().await {
            tracing::warn!(peer = index, error = %e, "New conductor failed to initialize");
            if let Err(kill_err) = member.shutdown().await {
                tracing::warn!(peer = index, error = %kill_err, "Failed to tear down new conductor");
            }
            return Err(e);
        }
        self.members.write().push(member.clone());

        tracing::info!(peer = index, size = self.len(), "Conductor added");
        Ok(member)
    }

    /// Every member paired with its instances, for fan-out calls
    pub fn mapper(&self) -> BatchMapper<Arc<ChannelManager>, String> {
        BatchMapper::new(
            self.members()
                .into_iter()
                .map(|member| {
                    let instances = member.instance_ids();
                    (member, instances)
                })
                .collect(),
        )
    }

    /// Trace signal streams of every member, subscribed now
    pub fn trace_streams(&self) -> FleetResult<Vec<SignalStream>> {
        self.members()
            .iter()
            .map(|member| member.trace_signals())
            .collect()
    }

    /// Arm a barrier counting trace signals that satisfy `predicate`.
    pub fn quorum_barrier<P>(
        &self,
        required: usize,
        timeout: std::time::Duration,
        predicate: P,
    ) -> FleetResult<QuorumSignalBarrier>
    where
        P: Fn(&Signal) -> bool + Send + Sync + 'static,
    {
        Ok(QuorumSignalBarrier::arm(self.trace_streams()?, required, timeout, predicate))
    }

    /// Barrier on hold actions reported by any member
    pub fn hold_barrier(
        &self,
        required: usize,
        timeout: std::time::Duration,
    ) -> FleetResult<QuorumSignalBarrier> {
        self.quorum_barrier(required, timeout, |signal| is_hold_action(&signal.payload))
    }

    /// Poll every member until each expected address has a holder.
    pub async fn check_consistency(&self, expected: &[Address]) -> FleetResult<ConsistencyReport> {
        check_consistency(&self.members(), expected, self.config.consistency).await
    }

    /// Tree-kill every conductor and close every channel.
    ///
    /// All members are torn down even if some fail. Members that failed stay
    /// in the cluster so a later `shutdown` can retry them; the first
    /// failure is returned.
    pub async fn shutdown(&self) -> FleetResult<()> {
        let members = std::mem::take(&mut *self.members.write());
        tracing::info!(conductors = members.len(), "Shutting down cluster");

        let results = futures::future::join_all(members.iter().map(|member| member.shutdown())).await;
        let (survivors, first_error) = keep_failed(members, results);
        if let Some(e) = first_error {
            tracing::warn!(remaining = survivors.len(), error = %e, "Cluster shutdown incomplete");
            let mut current = self.members.write();
            // Members added while shutting down stay after the survivors
            let added = std::mem::take(&mut *current);
            *current = survivors;
            current.extend(added);
            return Err(e);
        }
        Ok(())
    }
}

/// Pair members with their shutdown results; keep those that failed along
/// with the first error.
fn keep_failed<T>(
    members: Vec<T>,
    results: Vec<FleetResult<()>>,
) -> (Vec<T>, Option<FleetError>) {
    let mut survivors = Vec::new();
    let mut first_error = None;
    for (member, result) in members.into_iter().zip(results) {
        if let Err(e) = result {
            survivors.push(member);
            first_error.get_or_insert(e);
        }
    }
    (survivors, first_error)
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let remaining = self.members.get_mut().len();
        if remaining > 0 {
            // Exit watchers still kill each process group, without waiting
            tracing::warn!(conductors = remaining, "Cluster dropped without shutdown");
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("root", &self.spawner.root())
            .field("members", &self.members.read().len())
            .finish()
    }
}
