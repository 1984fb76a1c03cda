use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use russh::{
    Channel, ChannelId, MethodKind, MethodSet,
    keys::{PublicKey, ssh_key::Certificate},
    server::{Auth, Handler, Msg, Session},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    auth::Permissions,
    connection::Connection,
    gateway::Gateway,
    session,
    tunnel::{self, Tunnel},
    wire::{ForwardRequest, TunnelData},
};

// Per-connection SSH event dispatcher. Global requests mutate the service
// table; channel opens become sessions and tunnels.
pub(crate) struct ConnectionHandler {
    gateway: Arc<Gateway>,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    token: CancellationToken,
    user: Option<String>,
    permissions: Option<Permissions>,
    connection: Option<Arc<Connection>>,
    sessions: HashMap<ChannelId, Arc<session::Session>>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        gateway: Arc<Gateway>,
        peer: SocketAddr,
        local: Option<SocketAddr>,
        token: CancellationToken,
    ) -> Self {
        ConnectionHandler {
            gateway,
            peer,
            local,
            token,
            user: None,
            permissions: None,
            connection: None,
            sessions: HashMap::new(),
        }
    }

    // The connection entity is created and registered on the first
    // authenticated activity, once a session handle exists to hang it on.
    fn connection(&mut self, session: &mut Session) -> Option<Arc<Connection>> {
        if let Some(connection) = &self.connection {
            return Some(Arc::clone(connection));
        }
        let user = self.user.clone()?;
        let permissions = self.permissions?;
        let connection = Connection::new(
            &self.gateway,
            self.gateway.next_connection_id(),
            session.handle(),
            self.token.clone(),
            user,
            permissions.admin,
            self.peer,
            self.local,
        );
        self.gateway.add_connection(&connection);
        info!(
            user = %connection.user(), peer = %self.peer, admin = connection.is_admin(),
            "Connection registered."
        );
        self.connection = Some(Arc::clone(&connection));
        Some(connection)
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
            partial_success: false,
        }
    }
}

impl Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Self::reject())
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        debug!(peer = %self.peer, %user, "Rejecting password authentication.");
        Ok(Self::reject())
    }

    // Plain public keys carry no authority signature; only CA-signed
    // certificates are accepted.
    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(peer = %self.peer, %user, "Rejecting plain public key authentication.");
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        match self.gateway.authority().authenticate(user, certificate) {
            Some(permissions) => {
                info!(
                    peer = %self.peer, %user, admin = permissions.admin,
                    key_id = %certificate.key_id(),
                    "SSH client authenticated."
                );
                self.user = Some(user.to_string());
                self.permissions = Some(permissions);
                Ok(Auth::Accept)
            }
            None => {
                warn!(peer = %self.peer, %user, "Rejecting certificate.");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    // A session channel is strictly a control channel for status records.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(connection) = self.connection(session) else {
            return Ok(false);
        };
        debug!(peer = %self.peer, channel = ?channel.id(), "Session channel opened.");
        let id = channel.id();
        let entry = session::Session::new(self.gateway.next_child_id(), channel, &connection);
        connection.add_session(&entry);
        self.sessions.insert(id, entry);
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(entry) = self.sessions.get(&channel) {
            if let Err(error) = entry.receive_data(data) {
                warn!(peer = %self.peer, %error, "Closing session channel.");
                entry.close().await;
            }
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(entry) = self.sessions.remove(&channel) {
            if let Some(connection) = &self.connection {
                connection.remove_session(entry.id());
            }
        }
        Ok(())
    }

    // Session channels take no requests: no PTY, no shell, no exec, no
    // subsystem. Every request is answered with a failure.
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel)
    }

    // Register an abstract service name for this connection.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(connection) = self.connection(session) else {
            return Ok(false);
        };
        // Any global request counts as activity, valid or not.
        connection.touch();
        let request = ForwardRequest {
            host: address.to_string(),
            port: *port,
        };
        let Some(service_port) = request.service_port() else {
            warn!(
                user = %connection.user(), host = %request.host, port = request.port,
                "Rejecting forward request for invalid port."
            );
            return Ok(false);
        };
        match connection.register_service(&request.host, service_port) {
            Ok(()) => {
                info!(
                    user = %connection.user(), host = %request.host, port = service_port,
                    "Service registered."
                );
                Ok(true)
            }
            Err(error) => {
                warn!(
                    user = %connection.user(), host = %request.host, port = service_port, %error,
                    "Failed to register service."
                );
                Ok(false)
            }
        }
    }

    // Deregistering is always a silent success, even for a port that could
    // never have been registered.
    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(connection) = self.connection(session) else {
            return Ok(false);
        };
        connection.touch();
        let request = ForwardRequest {
            host: address.to_string(),
            port,
        };
        if let Some(service_port) = request.service_port() {
            connection.deregister_service(&request.host, service_port);
            info!(
                user = %connection.user(), host = %request.host, port = service_port,
                "Service deregistered."
            );
        }
        Ok(true)
    }

    // Rendezvous: resolve the requested service and splice this channel onto
    // a forwarded-tcpip channel opened toward the advertising connection.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(connection) = self.connection(session) else {
            return Ok(false);
        };
        connection.touch();
        if !connection.is_admin() {
            warn!(
                user = %connection.user(), peer = %self.peer,
                "Refusing tunnel for connection without port forwarding permission."
            );
            return Ok(false);
        }
        let request = TunnelData {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            origin_address: originator_address.to_string(),
            origin_port: originator_port,
        };
        let Some(service_port) = request.service_port() else {
            return Ok(false);
        };
        let Some((target, service_host, service_port)) = self
            .gateway
            .lookup_connection_service(&request.host, service_port)
        else {
            info!(
                user = %connection.user(), host = %request.host, port = request.port,
                "Service not found or not online."
            );
            return Ok(false);
        };
        info!(
            user = %connection.user(), target = %target.user(), host = %service_host,
            port = service_port, "Opening tunnel."
        );
        // The destination is rewritten to the registered coordinates; the
        // caller's origin is propagated unchanged.
        let open = TunnelData {
            host: service_host,
            port: service_port.into(),
            origin_address: request.origin_address.clone(),
            origin_port: request.origin_port,
        };
        let caller_id = self.gateway.next_child_id();
        let target_id = self.gateway.next_child_id();
        let peer = self.peer;
        // The peer channel is opened from a separate task: opening a channel
        // on this connection's own handle from inside this callback would
        // deadlock the session loop when a client tunnels to itself.
        tokio::spawn(async move {
            let token = CancellationToken::new();
            match Arc::clone(&target)
                .open_tunnel(
                    target_id,
                    open,
                    token.clone(),
                    connection.user(),
                    connection.peer(),
                )
                .await
            {
                Ok((target_tunnel, target_stream)) => {
                    let caller_tunnel = Tunnel::new(
                        caller_id,
                        &connection,
                        token.clone(),
                        request,
                        target.user(),
                        target.peer(),
                    );
                    connection.add_tunnel(&caller_tunnel);
                    tunnel::start_splice(
                        (caller_tunnel, channel.into_stream()),
                        (target_tunnel, target_stream),
                        token,
                    );
                }
                Err(error) => {
                    // The caller's channel was already accepted; reject by
                    // closing it.
                    warn!(peer = %peer, %error, "Failed to open tunnel toward service.");
                    let _ = channel.close().await;
                }
            }
        });
        Ok(true)
    }
}

// The russh session ends when either inbound stream closes or the transport
// drops; tear down whatever this connection still owns.
impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        let user = self.user.as_deref().unwrap_or("unknown");
        debug!(peer = %self.peer, %user, "SSH client disconnected.");
        if let Some(connection) = self.connection.take() {
            tokio::spawn(async move {
                connection.close().await;
            });
        }
    }
}
