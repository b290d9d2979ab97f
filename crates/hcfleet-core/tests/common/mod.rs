//! In-process stand-ins for conductors.
//!
//! A `MockConductor` serves the admin and instance websocket interfaces of
//! one conductor. It drops every instance-interface socket shortly after an
//! instance is attached, like the real conductor does, and pushes trace
//! signals for commits and holds. Conductors of one `MockFleet` share a
//! `MockNetwork` that replicates published addresses.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use hcfleet_core::{ConsistencyOptions, FleetConfig, PeerLayout, PortBase};

static NEXT_PORT: AtomicU16 = AtomicU16::new(24_000);

/// Bind `count` consecutive localhost ports.
pub async fn reserve_ports(count: usize) -> (u16, Vec<TcpListener>) {
    loop {
        let base = NEXT_PORT.fetch_add(count as u16 + 1, Ordering::SeqCst);
        let mut listeners = Vec::with_capacity(count);
        for offset in 0..count as u16 {
            match TcpListener::bind(("127.0.0.1", base + offset)).await {
                Ok(listener) => listeners.push(listener),
                Err(_) => break,
            }
        }
        if listeners.len() == count {
            return (base, listeners);
        }
    }
}

#[derive(Default)]
struct NetworkState {
    entries: BTreeMap<String, String>,
    links: BTreeMap<String, BTreeSet<String>>,
    held: BTreeMap<usize, BTreeSet<String>>,
}

/// What every mock conductor in a fleet can see
pub struct MockNetwork {
    replicate: bool,
    link_holds: AtomicBool,
    state: Mutex<NetworkState>,
    signal_sinks: Mutex<BTreeMap<usize, broadcast::Sender<String>>>,
}

impl MockNetwork {
    /// With `replicate` off only the author holds what it publishes
    pub fn new(replicate: bool) -> Arc<Self> {
        Arc::new(Self {
            replicate,
            link_holds: AtomicBool::new(true),
            state: Mutex::new(NetworkState::default()),
            signal_sinks: Mutex::new(BTreeMap::new()),
        })
    }

    /// With `enabled` off, links are still stored and held but holders
    /// report no `HoldAspect` for them
    pub fn set_link_holds(&self, enabled: bool) {
        self.link_holds.store(enabled, Ordering::SeqCst);
    }

    fn join(&self, index: usize, signals: broadcast::Sender<String>) {
        self.signal_sinks.lock().insert(index, signals);
    }

    fn commit(&self, author: usize, address: &str, content: &str) {
        self.state
            .lock()
            .entries
            .insert(address.to_string(), content.to_string());
        self.emit(author, trace_signal(json!({ "action_type": "Commit", "data": address })));
        self.publish(author, address, true);
    }

    fn has_entry(&self, address: &str) -> bool {
        self.state.lock().entries.contains_key(address)
    }

    fn link(&self, author: usize, base: &str, target: &str) -> String {
        self.state
            .lock()
            .links
            .entry(base.to_string())
            .or_default()
            .insert(target.to_string());
        let link = link_address(base, target);
        self.publish(author, &link, self.link_holds.load(Ordering::SeqCst));
        link
    }

    /// Targets of `base` whose link `index` holds
    fn visible_links(&self, index: usize, base: &str) -> Vec<String> {
        let state = self.state.lock();
        let held = state.held.get(&index);
        state
            .links
            .get(base)
            .map(|targets| {
                targets
                    .iter()
                    .filter(|t| held.map_or(false, |h| h.contains(&link_address(base, t))))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn held_by(&self, index: usize) -> BTreeSet<String> {
        self.state.lock().held.get(&index).cloned().unwrap_or_default()
    }

    fn publish(&self, author: usize, address: &str, announce: bool) {
        let holders: Vec<usize> = if self.replicate {
            self.signal_sinks.lock().keys().copied().collect()
        } else {
            vec![author]
        };
        {
            let mut state = self.state.lock();
            for holder in &holders {
                state.held.entry(*holder).or_default().insert(address.to_string());
            }
        }
        if !announce {
            return;
        }
        for holder in holders {
            self.emit(
                holder,
                trace_signal(json!({ "action_type": "HoldAspect", "data": { "address": address } })),
            );
        }
    }

    fn emit(&self, index: usize, signal: String) {
        if let Some(sink) = self.signal_sinks.lock().get(&index) {
            let _ = sink.send(signal);
        }
    }
}

fn link_address(base: &str, target: &str) -> String {
    format!("{}->{}", base, target)
}

fn trace_signal(action: Value) -> String {
    json!({
        "signal": { "signal_type": "Trace", "action": action },
        "instance_id": Value::Null,
    })
    .to_string()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MockBehavior {
    /// Answer `test/agent/add` with an error
    pub reject_agent: bool,
}

#[derive(Debug, Clone, Default)]
struct MockInstance {
    dna_id: String,
    agent_id: String,
    started: bool,
    attached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interface {
    Admin,
    Instance,
}

type RpcOutcome = Result<Value, (i64, String)>;

struct ConductorState {
    index: usize,
    network: Arc<MockNetwork>,
    behavior: MockBehavior,
    agents: Mutex<Vec<Value>>,
    instances: Mutex<BTreeMap<String, MockInstance>>,
    methods: Mutex<Vec<String>>,
    bounce: watch::Sender<u64>,
    signals: broadcast::Sender<String>,
    instance_connections: AtomicUsize,
    shutdown: CancellationToken,
}

impl ConductorState {
    fn handle(self: &Arc<Self>, interface: Interface, text: &str) -> Option<String> {
        let request: Value = serde_json::from_str(text).ok()?;
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        self.methods.lock().push(method.clone());

        let outcome = match interface {
            Interface::Admin => self.admin(&method, &params),
            Interface::Instance => self.instance(&method, &params),
        };
        let reply = match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message },
            }),
        };
        Some(reply.to_string())
    }

    fn admin(self: &Arc<Self>, method: &str, params: &Value) -> RpcOutcome {
        let str_param = |key: &str| params.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

        match method {
            "test/agent/add" => {
                if self.behavior.reject_agent {
                    return Err((-32000, "agent rejected".to_string()));
                }
                self.agents.lock().push(params.clone());
                Ok(json!({ "success": true }))
            }
            "admin/dna/install_from_file" => Ok(json!({ "success": true })),
            "admin/instance/add" => {
                self.instances.lock().insert(
                    str_param("id"),
                    MockInstance {
                        dna_id: str_param("dna_id"),
                        agent_id: str_param("agent_id"),
                        ..Default::default()
                    },
                );
                Ok(json!({ "success": true }))
            }
            "admin/instance/start" => match self.instances.lock().get_mut(&str_param("id")) {
                Some(instance) => {
                    instance.started = true;
                    Ok(json!({ "success": true }))
                }
                None => Err((-32602, format!("unknown instance {}", str_param("id")))),
            },
            "admin/interface/add_instance" => {
                match self.instances.lock().get_mut(&str_param("instance_id")) {
                    Some(instance) => instance.attached = true,
                    None => return Err((-32602, "unknown instance".to_string())),
                }
                // Sockets on the instance interface drop right after the answer
                let state = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    state.bounce.send_modify(|generation| *generation += 1);
                });
                Ok(json!({ "success": true }))
            }
            "debug/state_dump" => {
                let held_aspects: BTreeMap<String, Vec<String>> = self
                    .network
                    .held_by(self.index)
                    .into_iter()
                    .map(|address| (address, Vec::new()))
                    .collect();
                Ok(json!({ "held_aspects": held_aspects, "source_chain": [] }))
            }
            other => Err((-32601, format!("method not found: {}", other))),
        }
    }

    fn instance(&self, method: &str, params: &Value) -> RpcOutcome {
        if method != "call" {
            return Err((-32601, format!("method not found: {}", method)));
        }

        let instance_id = params
            .get("instance_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let ready = self
            .instances
            .lock()
            .get(instance_id)
            .map_or(false, |i| i.started && i.attached);
        if !ready {
            return Err((-32602, format!("unknown instance {}", instance_id)));
        }

        let args = params.get("params").cloned().unwrap_or(Value::Null);
        let arg = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        let outcome = match params.get("function").and_then(Value::as_str).unwrap_or_default() {
            "commit_entry" => {
                let content = arg("content");
                let address = format!("Qm{}", content);
                self.network.commit(self.index, &address, &content);
                json!({ "Ok": address })
            }
            "link_entries" => {
                let (base, target) = (arg("base"), arg("target"));
                if self.network.has_entry(&base) && self.network.has_entry(&target) {
                    json!({ "Ok": self.network.link(self.index, &base, &target) })
                } else {
                    json!({ "Err": "entry not found" })
                }
            }
            "get_links" => {
                let links: Vec<Value> = self
                    .network
                    .visible_links(self.index, &arg("base"))
                    .into_iter()
                    .map(|address| json!({ "address": address }))
                    .collect();
                json!({ "Ok": { "links": links } })
            }
            other => json!({ "Err": format!("no function {}", other) }),
        };
        // Zome results travel as JSON strings
        Ok(Value::String(outcome.to_string()))
    }
}

/// One fake conductor serving both interfaces
pub struct MockConductor {
    pub layout: PeerLayout,
    state: Arc<ConductorState>,
}

impl MockConductor {
    fn start(
        layout: PeerLayout,
        admin: TcpListener,
        instance: TcpListener,
        network: Arc<MockNetwork>,
        behavior: MockBehavior,
    ) -> Self {
        let (signals, _) = broadcast::channel(256);
        network.join(layout.index, signals.clone());
        let (bounce, _) = watch::channel(0);
        let state = Arc::new(ConductorState {
            index: layout.index,
            network,
            behavior,
            agents: Mutex::new(Vec::new()),
            instances: Mutex::new(BTreeMap::new()),
            methods: Mutex::new(Vec::new()),
            bounce,
            signals,
            instance_connections: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(accept_loop(admin, state.clone(), Interface::Admin));
        tokio::spawn(accept_loop(instance, state.clone(), Interface::Instance));
        Self { layout, state }
    }

    /// Agents registered through `test/agent/add`
    pub fn agents(&self) -> Vec<Value> {
        self.state.agents.lock().clone()
    }

    /// Instances that are started and attached
    pub fn attached_instances(&self) -> Vec<String> {
        self.state
            .instances
            .lock()
            .iter()
            .filter(|(_, i)| i.started && i.attached)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn instance_agent(&self, instance_id: &str) -> Option<String> {
        self.state
            .instances
            .lock()
            .get(instance_id)
            .map(|i| i.agent_id.clone())
    }

    /// Every method received, in order
    pub fn methods(&self) -> Vec<String> {
        self.state.methods.lock().clone()
    }

    /// Sockets ever accepted on the instance interface
    pub fn instance_connections(&self) -> usize {
        self.state.instance_connections.load(Ordering::SeqCst)
    }

    /// Drop every instance-interface socket now
    pub fn bounce(&self) {
        self.state.bounce.send_modify(|generation| *generation += 1);
    }
}

impl Drop for MockConductor {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ConductorState>, interface: Interface) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_connection(stream, state.clone(), interface));
                }
                Err(_) => break,
            },
        }
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<ConductorState>, interface: Interface) {
    let is_instance = interface == Interface::Instance;
    // Counted before the handshake answer reaches the client
    if is_instance {
        state.instance_connections.fetch_add(1, Ordering::SeqCst);
    }
    let mut signals = state.signals.subscribe();
    let mut bounce = state.bounce.subscribe();
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = bounce.changed(), if is_instance => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            signal = signals.recv(), if is_instance => match signal {
                Ok(text) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = state.handle(interface, text.as_str()) {
                        if write.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Mock conductors on consecutive ports, sharing one network
pub struct MockFleet {
    pub ports: PortBase,
    pub network: Arc<MockNetwork>,
    pub conductors: Vec<MockConductor>,
}

impl MockFleet {
    pub async fn start(count: usize, replicate: bool) -> Self {
        Self::start_with(count, replicate, |_| MockBehavior::default()).await
    }

    pub async fn start_with(
        count: usize,
        replicate: bool,
        behavior: impl Fn(usize) -> MockBehavior,
    ) -> Self {
        let (admin_base, admin_listeners) = reserve_ports(count).await;
        let (instance_base, instance_listeners) = reserve_ports(count).await;
        let network = MockNetwork::new(replicate);

        let conductors = admin_listeners
            .into_iter()
            .zip(instance_listeners)
            .enumerate()
            .map(|(index, (admin, instance))| {
                let layout = PeerLayout {
                    index,
                    admin_port: admin_base + index as u16,
                    instance_port: instance_base + index as u16,
                    work_dir: PathBuf::from(format!("mock-conductor-{}", index)),
                };
                MockConductor::start(layout, admin, instance, network.clone(), behavior(index))
            })
            .collect();

        Self {
            ports: PortBase {
                admin: admin_base,
                instance: instance_base,
            },
            network,
            conductors,
        }
    }
}

/// Script that prints the readiness marker and idles like a conductor.
#[cfg(unix)]
pub fn fake_conductor(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-conductor.sh");
    std::fs::write(
        &path,
        "#!/bin/sh\necho \"booting with config $2\"\necho \"Starting interfaces...\"\nexec sleep 600\n",
    )
    .unwrap();
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();
    path
}

/// Fleet config pointing fake conductors at a mock fleet's ports, with
/// short timeouts and fast consistency rounds.
#[cfg(unix)]
pub fn fleet_config(root: &Path, ports: PortBase, conductors: usize) -> FleetConfig {
    let mut config = FleetConfig::default()
        .with_work_dir(root.join("work"))
        .with_ports(ports)
        .with_conductors(conductors)
        .with_conductor_bin(fake_conductor(root));
    config.ready_timeout = Some(Duration::from_secs(10));
    config.reconnect_timeout = Some(Duration::from_secs(10));
    config.consistency = ConsistencyOptions {
        retries: 3,
        retry_delay: Duration::from_millis(50),
    };
    config
}
