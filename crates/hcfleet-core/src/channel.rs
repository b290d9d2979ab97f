//! Per-conductor channel management.
//!
//! A [`ChannelManager`] owns the two websocket channels of one conductor:
//! the admin channel for provisioning and the instance channel for zome
//! calls and trace signals.

use std::path::Path;
use std::time::Duration;

use futures::future::try_join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::consistency::{HoldingSnapshot, StateDump, StateSource};
use crate::error::{FleetError, FleetResult};
use crate::rpc::{self, ConnectionState, RpcChannel};
use crate::signal::SignalStream;
use crate::spawn::{PeerLayout, PeerProcess, PeerStatus};

/// Agent registered on a conductor during initialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
}

impl AgentIdentity {
    /// Identity derived from the conductor's instance port
    pub fn for_port(instance_port: u16) -> Self {
        Self {
            id: format!("agent-{}", instance_port),
            name: format!("Agent{}", instance_port),
        }
    }
}

/// Result of a zome function, unwrapped from its `{"Ok": ..}` / `{"Err": ..}` envelope
#[derive(Debug, Clone, PartialEq)]
pub enum ZomeOutcome {
    Ok(Value),
    Err(Value),
}

impl ZomeOutcome {
    /// Zome functions usually answer with a JSON string; decode it when possible.
    pub fn from_value(raw: Value) -> Self {
        let value = match raw {
            Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
            other => other,
        };
        match value {
            Value::Object(mut map) if map.len() == 1 => {
                if let Some(ok) = map.remove("Ok") {
                    ZomeOutcome::Ok(ok)
                } else if let Some(err) = map.remove("Err") {
                    ZomeOutcome::Err(err)
                } else {
                    ZomeOutcome::Ok(Value::Object(map))
                }
            }
            other => ZomeOutcome::Ok(other),
        }
    }

    pub fn into_result(self) -> Result<Value, Value> {
        match self {
            ZomeOutcome::Ok(value) => Ok(value),
            ZomeOutcome::Err(value) => Err(value),
        }
    }
}

/// Channels, agent and instances of one conductor
pub struct ChannelManager {
    layout: PeerLayout,
    /// `None` when attached to a conductor this harness did not launch
    process: Option<PeerProcess>,
    agent: AgentIdentity,
    admin: OnceCell<RpcChannel>,
    instance: OnceCell<RpcChannel>,
    instances: Mutex<Vec<String>>,
    reconnect_timeout: Option<Duration>,
}

impl ChannelManager {
    /// Manage a conductor launched by the spawner
    pub fn new(process: PeerProcess, reconnect_timeout: Option<Duration>) -> Self {
        let mut manager = Self::attach(process.layout().clone(), reconnect_timeout);
        manager.process = Some(process);
        manager
    }

    /// Manage an already running conductor listening on `layout`'s ports
    pub fn attach(layout: PeerLayout, reconnect_timeout: Option<Duration>) -> Self {
        Self {
            agent: AgentIdentity::for_port(layout.instance_port),
            layout,
            process: None,
            admin: OnceCell::new(),
            instance: OnceCell::new(),
            instances: Mutex::new(Vec::new()),
            reconnect_timeout,
        }
    }

    pub fn index(&self) -> usize {
        self.layout.index
    }

    pub fn peer_id(&self) -> String {
        format!("conductor-{}", self.layout.index)
    }

    pub fn layout(&self) -> &PeerLayout {
        &self.layout
    }

    pub fn agent(&self) -> &AgentIdentity {
        &self.agent
    }

    pub fn process(&self) -> Option<&PeerProcess> {
        self.process.as_ref()
    }

    /// Process status; attached conductors count as ready
    pub fn peer_status(&self) -> PeerStatus {
        self.process
            .as_ref()
            .map(PeerProcess::status)
            .unwrap_or(PeerStatus::Ready)
    }

    /// State of the instance channel
    pub fn connection_state(&self) -> ConnectionState {
        self.instance
            .get()
            .map(|channel| channel.status().state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Instances created on this conductor, in creation order
    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.lock().clone()
    }

    /// Open both channels and register the agent.
    pub async fn initialize(&self) -> FleetResult<()> {
        if self.admin.initialized() || self.instance.initialized() {
            return Err(FleetError::InvalidOperation(format!(
                "{} already initialized",
                self.peer_id()
            )));
        }

        let index = self.layout.index;
        let admin = async {
            let channel = RpcChannel::connect(
                format!("admin-{}", index),
                ws_url(self.layout.admin_port),
            )
            .await?;
            channel
                .call(
                    rpc::AGENT_ADD,
                    json!({ "id": self.agent.id, "name": self.agent.name }),
                )
                .await?;
            Ok::<_, FleetError>(channel)
        };
        let instance = RpcChannel::connect(
            format!("instance-{}", index),
            ws_url(self.layout.instance_port),
        );
        let (admin, instance) = tokio::try_join!(admin, instance)?;

        let already = || FleetError::InvalidOperation(format!("{} initialized twice", self.peer_id()));
        self.admin.set(admin).map_err(|_| already())?;
        self.instance.set(instance).map_err(|_| already())?;

        tracing::info!(peer = index, agent = %self.agent.id, "Channels open, agent registered");
        Ok(())
    }

    /// Install the DNA at `dna_path`, create and start an instance of it for
    /// this conductor's agent, and expose it on the instance interface.
    ///
    /// Attaching the instance makes the conductor drop every socket on the
    /// instance interface; this returns only after that channel reconnected.
    pub async fn create_dna_instance(&self, instance_id: &str, dna_path: &Path) -> FleetResult<()> {
        let admin = self.admin_channel()?;
        let data = self.instance_channel()?;
        if self.instances.lock().iter().any(|id| id == instance_id) {
            return Err(FleetError::InvalidOperation(format!(
                "instance {} already exists on {}",
                instance_id,
                self.peer_id()
            )));
        }

        let dna_id = format!("{}-dna", instance_id);
        admin
            .call(
                rpc::DNA_INSTALL,
                json!({ "id": dna_id, "path": dna_path.to_string_lossy(), "copy": true }),
            )
            .await?;
        admin
            .call(
                rpc::INSTANCE_ADD,
                json!({ "id": instance_id, "dna_id": dna_id, "agent_id": self.agent.id }),
            )
            .await?;
        admin
            .call(rpc::INSTANCE_START, json!({ "id": instance_id }))
            .await?;

        let epoch = data.status().epoch;
        admin
            .call(
                rpc::INTERFACE_ADD_INSTANCE,
                json!({
                    "interface_id": crate::config::INSTANCE_INTERFACE_ID,
                    "instance_id": instance_id,
                }),
            )
            .await?;
        data.wait_reconnected(epoch, self.reconnect_timeout).await?;

        self.instances.lock().push(instance_id.to_string());
        tracing::info!(peer = self.layout.index, instance = instance_id, "Instance ready");
        Ok(())
    }

    /// Call `function` in `zome` of `instance_id`; returns the raw result.
    pub async fn call_zome(
        &self,
        instance_id: &str,
        zome: &str,
        function: &str,
        params: Value,
    ) -> FleetResult<Value> {
        self.instance_channel()?
            .call(
                rpc::ZOME_CALL,
                json!({
                    "instance_id": instance_id,
                    "zome": zome,
                    "function": function,
                    "params": params,
                }),
            )
            .await
    }

    /// Raw admin call
    pub async fn admin_call(&self, method: &str, params: Value) -> FleetResult<Value> {
        self.admin_channel()?.call(method, params).await
    }

    /// Trace signals from the instance channel
    pub fn trace_signals(&self) -> FleetResult<SignalStream> {
        Ok(self.instance_channel()?.trace_signals())
    }

    /// Run `handler` on the action payload of every trace signal until the
    /// channel closes or the returned task is aborted.
    pub fn on_signal<F>(&self, mut handler: F) -> FleetResult<JoinHandle<()>>
    where
        F: FnMut(Value) + Send + 'static,
    {
        let mut stream = self.trace_signals()?;
        Ok(tokio::spawn(async move {
            while let Some(signal) = stream.next().await {
                handler(signal.payload);
            }
        }))
    }

    /// Internal state of one instance
    pub async fn state_dump(&self, instance_id: &str) -> FleetResult<StateDump> {
        let raw = self
            .admin_channel()?
            .call(
                rpc::STATE_DUMP,
                json!({
                    "instance_id": instance_id,
                    "source_chain": true,
                    "held_aspects": true,
                    "queued_holding_workflows": false,
                }),
            )
            .await?;
        StateDump::from_value(raw)
    }

    /// Kill the conductor tree, then close both channels.
    pub async fn shutdown(&self) -> FleetResult<()> {
        let killed = match &self.process {
            Some(process) => process.kill().await,
            None => Ok(()),
        };
        for channel in [self.admin.get(), self.instance.get()].into_iter().flatten() {
            channel.close().await;
        }
        killed
    }

    fn admin_channel(&self) -> FleetResult<&RpcChannel> {
        self.admin.get().ok_or_else(|| self.not_initialized())
    }

    fn instance_channel(&self) -> FleetResult<&RpcChannel> {
        self.instance.get().ok_or_else(|| self.not_initialized())
    }

    fn not_initialized(&self) -> FleetError {
        FleetError::InvalidOperation(format!("{} is not initialized", self.peer_id()))
    }
}

impl StateSource for ChannelManager {
    fn peer_id(&self) -> String {
        ChannelManager::peer_id(self)
    }

    /// Union of the state dumps of every instance on this conductor
    fn holding_snapshot(&self) -> impl std::future::Future<Output = FleetResult<HoldingSnapshot>> + Send {
        async move {
            let ids = self.instance_ids();
            let dumps = try_join_all(ids.iter().map(|id| self.state_dump(id))).await?;
            Ok(HoldingSnapshot::from_dumps(ChannelManager::peer_id(self), &dumps))
        }
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("layout", &self.layout)
            .field("agent", &self.agent)
            .field("connection", &self.connection_state())
            .field("instances", &self.instance_ids())
            .finish()
    }
}

fn ws_url(port: u16) -> String {
    format!("ws://127.0.0.1:{}", port)
}
