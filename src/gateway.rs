use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use russh::{
    Disconnect, SshId,
    keys::{decode_secret_key, ssh_key::Certificate},
    server::Config,
};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    auth::CertificateAuthority,
    connection::{Connection, ConnectionStatus},
    error::GatewayError,
    ssh::ConnectionHandler,
};

// Everything the CLI collaborator must supply to stand up a gateway. The key
// fields hold file contents, not paths.
pub struct GatewaySettings {
    pub server_version: String,
    pub ca_public_key: String,
    pub host_certificate: String,
    pub host_private_key: String,
}

// Aggregate status snapshot across every live connection.
#[derive(Debug, Serialize)]
pub struct GatewayStatus {
    pub connections: Vec<ConnectionStatus>,
}

#[derive(Default)]
struct Registry {
    connections: Vec<Arc<Connection>>,
    by_user: HashMap<String, Vec<Arc<Connection>>>,
}

// Process-wide registry of connections and the service directory across them.
pub struct Gateway {
    config: Arc<Config>,
    authority: CertificateAuthority,
    registry: Mutex<Registry>,
    next_connection_id: AtomicUsize,
    next_child_id: AtomicUsize,
}

impl Gateway {
    // Fails fatally on an invalid CA key, host certificate, host key, or
    // server version banner.
    pub fn new(settings: GatewaySettings) -> Result<Arc<Self>, GatewayError> {
        if !settings.server_version.starts_with("SSH-2.0-") {
            return Err(GatewayError::InvalidServerVersion);
        }
        let authority = CertificateAuthority::new(&settings.ca_public_key)?;
        let host_certificate = Certificate::from_openssh(&settings.host_certificate)
            .map_err(GatewayError::InvalidHostCertificate)?;
        let host_key = decode_secret_key(&settings.host_private_key, None)
            .map_err(GatewayError::InvalidHostKey)?;
        authority.check_host_certificate(&host_certificate, &host_key)?;
        let config = Config {
            server_id: SshId::Standard(settings.server_version),
            keys: vec![host_key],
            inactivity_timeout: Some(Duration::from_secs(3600)),
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        };
        Ok(Arc::new(Gateway {
            config: Arc::new(config),
            authority,
            registry: Mutex::new(Registry::default()),
            next_connection_id: AtomicUsize::new(0),
            next_child_id: AtomicUsize::new(0),
        }))
    }

    pub(crate) fn authority(&self) -> &CertificateAuthority {
        &self.authority
    }

    pub(crate) fn next_connection_id(&self) -> usize {
        self.next_connection_id.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn next_child_id(&self) -> usize {
        self.next_child_id.fetch_add(1, Ordering::AcqRel)
    }

    // Run the SSH handshake on an accepted TCP connection and drive the
    // resulting session until it closes or the connection is torn down.
    pub fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        info!(%peer, "New TCP connection.");
        let local = stream.local_addr().ok();
        let token = CancellationToken::new();
        let config = Arc::clone(&self.config);
        let handler = ConnectionHandler::new(self, peer, local, token.clone());
        tokio::spawn(async move {
            let mut session = match russh::server::run_stream(config, stream, handler).await {
                Ok(session) => session,
                Err(error) => {
                    warn!(%peer, %error, "SSH handshake failed.");
                    return;
                }
            };
            tokio::select! {
                result = &mut session => {
                    if let Err(error) = result {
                        info!(%peer, %error, "Connection ended.");
                    }
                }
                _ = token.cancelled() => {
                    let _ = session
                        .handle()
                        .disconnect(Disconnect::ByApplication, "".into(), "English".into())
                        .await;
                }
            }
        });
    }

    // Most recent connection first, in both the flat list and the index.
    pub(crate) fn add_connection(&self, connection: &Arc<Connection>) {
        let mut registry = self.registry.lock().expect("not poisoned");
        registry
            .by_user
            .entry(connection.user().to_string())
            .or_default()
            .insert(0, Arc::clone(connection));
        registry.connections.insert(0, Arc::clone(connection));
    }

    pub(crate) fn remove_connection(&self, connection: &Connection) {
        let mut registry = self.registry.lock().expect("not poisoned");
        if let Some(list) = registry.by_user.get_mut(connection.user()) {
            list.retain(|entry| entry.id() != connection.id());
            if list.is_empty() {
                registry.by_user.remove(connection.user());
            }
        }
        registry
            .connections
            .retain(|entry| entry.id() != connection.id());
    }

    // Resolve (full host, port) to the advertising connection. The full host
    // splits into a service label prefix and an owning user suffix; every
    // boundary is tried, smallest prefix first, so the longest user suffix
    // wins. Both the empty host and the empty user are legal.
    pub fn lookup_connection_service(
        &self,
        host: &str,
        port: u16,
    ) -> Option<(Arc<Connection>, String, u16)> {
        // Candidate lists are cloned out so no connection lock is ever taken
        // while the registry lock is held.
        let candidates: Vec<(String, Vec<Arc<Connection>>)> = {
            let registry = self.registry.lock().expect("not poisoned");
            host_partitions(host)
                .into_iter()
                .filter_map(|(service_host, user)| {
                    registry
                        .by_user
                        .get(&user)
                        .map(|connections| (service_host, connections.clone()))
                })
                .collect()
        };
        for (service_host, connections) in candidates {
            for connection in connections {
                if connection.has_service(&service_host, port) {
                    info!(
                        user = %connection.user(), host = %service_host, port,
                        "Found service."
                    );
                    return Some((connection, service_host, port));
                }
            }
        }
        info!(%host, port, "Failed to find service.");
        None
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry
            .lock()
            .expect("not poisoned")
            .connections
            .clone()
    }

    // Close every connection that has been idle longer than the timeout.
    // Cadence is the caller's concern.
    pub async fn scavenge_connections(&self, idle_timeout: Duration) {
        for connection in self.connections() {
            let idle = connection.idle_time();
            if idle > idle_timeout {
                info!(
                    user = %connection.user(), idle_seconds = idle.as_secs(),
                    "Scavenging idle connection."
                );
                connection.close().await;
            }
        }
    }

    // Serialized as JSON text so the per-connection status blobs appear byte
    // for byte as the clients reported them.
    pub fn status(&self) -> String {
        let snapshot = GatewayStatus {
            connections: self
                .connections()
                .iter()
                .map(|connection| connection.status())
                .collect(),
        };
        serde_json::to_string(&snapshot).expect("status snapshot serializes")
    }

    pub async fn close(&self) {
        for connection in self.connections() {
            connection.close().await;
        }
    }
}

// Enumerate every (service host, user) partition of a full host name, in
// increasing prefix length.
fn host_partitions(host: &str) -> Vec<(String, String)> {
    let labels: Vec<&str> = host.split('.').collect();
    (0..=labels.len())
        .map(|split| (labels[..split].join("."), labels[split..].join(".")))
        .collect()
}
