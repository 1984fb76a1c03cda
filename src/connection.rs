use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    net::SocketAddr,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use russh::server::Handle;
use serde::Serialize;
use serde_json::{Value, value::RawValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::GatewayError, gateway::Gateway, session::Session, tunnel::Tunnel, wire::TunnelData,
};

// Creation and last-activity accounting for a connection and its children.
pub(crate) struct UsageStats {
    created: Instant,
    created_at: DateTime<Utc>,
    used: Instant,
    used_at: DateTime<Utc>,
    bytes_read: u64,
    bytes_written: u64,
}

impl UsageStats {
    pub(crate) fn new() -> Self {
        UsageStats {
            created: Instant::now(),
            created_at: Utc::now(),
            used: Instant::now(),
            used_at: Utc::now(),
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.used = Instant::now();
        self.used_at = Utc::now();
    }
}

// Service advertisements of a single connection: host label to ports.
#[derive(Debug, Default)]
pub(crate) struct ServiceTable {
    services: HashMap<String, BTreeSet<u16>>,
}

impl ServiceTable {
    // Registering the same (host, port) twice is an error; the first
    // registration stays untouched.
    pub(crate) fn register(&mut self, host: &str, port: u16) -> Result<(), GatewayError> {
        if !self.services.entry(host.to_string()).or_default().insert(port) {
            return Err(GatewayError::ServiceAlreadyRegistered);
        }
        Ok(())
    }

    // Deregistering an unknown service is a silent success.
    pub(crate) fn deregister(&mut self, host: &str, port: u16) {
        if let Some(ports) = self.services.get_mut(host) {
            ports.remove(&port);
            if ports.is_empty() {
                self.services.remove(host);
            }
        }
    }

    pub(crate) fn contains(&self, host: &str, port: u16) -> bool {
        self.services
            .get(host)
            .is_some_and(|ports| ports.contains(&port))
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<String, Vec<u16>> {
        self.services
            .iter()
            .map(|(host, ports)| (host.clone(), ports.iter().copied().collect()))
            .collect()
    }
}

// Snapshot of one connection for the status surface. The status blob is a
// raw value so the client's record reappears byte for byte when the snapshot
// is serialized.
#[derive(Debug, Serialize)]
pub struct ConnectionStatus {
    pub id: usize,
    pub user: String,
    pub admin: bool,
    pub address: String,
    pub sessions: Vec<Value>,
    pub sessions_closed: u64,
    pub tunnels: Vec<Value>,
    pub tunnels_closed: u64,
    pub created: i64,
    pub used: i64,
    pub up_time: u64,
    pub idle_time: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub services: BTreeMap<String, Vec<u16>>,
    pub status: Option<Box<RawValue>>,
}

struct ConnectionState {
    services: ServiceTable,
    sessions: Vec<Arc<Session>>,
    sessions_closed: u64,
    tunnels: Vec<Arc<Tunnel>>,
    tunnels_closed: u64,
    usage: UsageStats,
    status: Option<Vec<u8>>,
}

// One authenticated SSH connection from a client to the gateway.
pub struct Connection {
    id: usize,
    gateway: Weak<Gateway>,
    handle: Handle,
    token: CancellationToken,
    user: String,
    admin: bool,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    closed: AtomicBool,
    state: Mutex<ConnectionState>,
}

impl Connection {
    #[expect(clippy::too_many_arguments)]
    pub(crate) fn new(
        gateway: &Arc<Gateway>,
        id: usize,
        handle: Handle,
        token: CancellationToken,
        user: String,
        admin: bool,
        peer: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Arc<Self> {
        Arc::new(Connection {
            id,
            gateway: Arc::downgrade(gateway),
            handle,
            token,
            user,
            admin,
            peer,
            local,
            closed: AtomicBool::new(false),
            state: Mutex::new(ConnectionState {
                services: ServiceTable::default(),
                sessions: Vec::new(),
                sessions_closed: 0,
                tunnels: Vec::new(),
                tunnels_closed: 0,
                usage: UsageStats::new(),
                status: None,
            }),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn touch(&self) {
        self.state.lock().expect("not poisoned").usage.touch();
    }

    // Byte counters are bumped under the connection lock as bytes move; the
    // tunnel adapters call these from their poll paths.
    pub(crate) fn record_read(&self, bytes: u64) {
        let mut state = self.state.lock().expect("not poisoned");
        state.usage.bytes_read += bytes;
        state.usage.touch();
    }

    pub(crate) fn record_written(&self, bytes: u64) {
        let mut state = self.state.lock().expect("not poisoned");
        state.usage.bytes_written += bytes;
        state.usage.touch();
    }

    pub fn used(&self) -> Instant {
        self.state.lock().expect("not poisoned").usage.used
    }

    pub fn idle_time(&self) -> Duration {
        self.used().elapsed()
    }

    pub(crate) fn register_service(&self, host: &str, port: u16) -> Result<(), GatewayError> {
        let mut state = self.state.lock().expect("not poisoned");
        // A denied registration is still activity.
        state.usage.touch();
        state.services.register(host, port)
    }

    pub(crate) fn deregister_service(&self, host: &str, port: u16) {
        let mut state = self.state.lock().expect("not poisoned");
        state.services.deregister(host, port);
        state.usage.touch();
    }

    pub(crate) fn has_service(&self, host: &str, port: u16) -> bool {
        self.state
            .lock()
            .expect("not poisoned")
            .services
            .contains(host, port)
    }

    pub fn services(&self) -> BTreeMap<String, Vec<u16>> {
        self.state.lock().expect("not poisoned").services.snapshot()
    }

    pub(crate) fn add_session(&self, session: &Arc<Session>) {
        let mut state = self.state.lock().expect("not poisoned");
        state.sessions.insert(0, Arc::clone(session));
        state.usage.touch();
    }

    pub(crate) fn remove_session(&self, id: usize) {
        let mut state = self.state.lock().expect("not poisoned");
        let before = state.sessions.len();
        state.sessions.retain(|session| session.id() != id);
        if state.sessions.len() < before {
            state.sessions_closed += 1;
        }
    }

    pub(crate) fn add_tunnel(&self, tunnel: &Arc<Tunnel>) {
        let mut state = self.state.lock().expect("not poisoned");
        state.tunnels.insert(0, Arc::clone(tunnel));
        state.usage.touch();
    }

    pub(crate) fn remove_tunnel(&self, id: usize) {
        let mut state = self.state.lock().expect("not poisoned");
        let before = state.tunnels.len();
        state.tunnels.retain(|tunnel| tunnel.id() != id);
        if state.tunnels.len() < before {
            state.tunnels_closed += 1;
        }
    }

    // Store the raw bytes of the latest whole status record, last writer wins.
    pub(crate) fn report_status(&self, record: Vec<u8>) {
        let mut state = self.state.lock().expect("not poisoned");
        state.status = Some(record);
        state.usage.touch();
    }

    // Open a server-initiated forwarded-tcpip channel toward this connection
    // and wrap it in a tunnel record. The caller wires the splice.
    pub(crate) async fn open_tunnel(
        self: Arc<Self>,
        id: usize,
        data: TunnelData,
        token: CancellationToken,
        peer_user: &str,
        peer_address: SocketAddr,
    ) -> Result<(Arc<Tunnel>, russh::ChannelStream<russh::server::Msg>), russh::Error> {
        debug!(user = %self.user, host = %data.host, port = data.port, "Opening forwarded-tcpip channel.");
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(
                data.host.clone(),
                data.port,
                data.origin_address.clone(),
                data.origin_port,
            )
            .await?;
        let tunnel = Tunnel::new(id, &self, token, data, peer_user, peer_address);
        self.add_tunnel(&tunnel);
        Ok((tunnel, channel.into_stream()))
    }

    pub fn status(&self) -> ConnectionStatus {
        let state = self.state.lock().expect("not poisoned");
        ConnectionStatus {
            id: self.id,
            user: self.user.clone(),
            admin: self.admin,
            address: self.peer.to_string(),
            sessions: state
                .sessions
                .iter()
                .map(|session| session.status())
                .collect(),
            sessions_closed: state.sessions_closed,
            tunnels: state.tunnels.iter().map(|tunnel| tunnel.status()).collect(),
            tunnels_closed: state.tunnels_closed,
            created: state.usage.created_at.timestamp(),
            used: state.usage.used_at.timestamp(),
            up_time: state.usage.created.elapsed().as_secs(),
            idle_time: state.usage.used.elapsed().as_secs(),
            bytes_read: state.usage.bytes_read,
            bytes_written: state.usage.bytes_written,
            services: state.services.snapshot(),
            status: state
                .status
                .as_deref()
                .and_then(|record| std::str::from_utf8(record).ok())
                .and_then(|record| RawValue::from_string(record.to_string()).ok()),
        }
    }

    // Tear the connection down: deregister from the gateway, close every
    // child, then cancel the transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(gateway) = self.gateway.upgrade() {
            gateway.remove_connection(self);
        }
        let (sessions, tunnels) = {
            let state = self.state.lock().expect("not poisoned");
            (state.sessions.clone(), state.tunnels.clone())
        };
        for tunnel in tunnels {
            tunnel.close();
        }
        for session in sessions {
            session.close().await;
        }
        self.token.cancel();
        info!(user = %self.user, peer = %self.peer, "Connection closed.");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("admin", &self.admin)
            .field("peer", &self.peer)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}
