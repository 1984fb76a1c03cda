#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use gatehouse::gateway::{Gateway, GatewaySettings};
use rand::rngs::OsRng;
use russh::{
    ChannelMsg, client,
    keys::{
        Algorithm, PrivateKey,
        ssh_key::{
            Certificate, LineEnding,
            certificate::{Builder, CertType},
        },
    },
};
use tokio::{
    net::TcpListener,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::{sleep, timeout},
};

pub fn generate_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

// A throwaway certificate authority that signs host and client certificates
// for a single test.
pub struct TestAuthority {
    ca_key: PrivateKey,
}

impl TestAuthority {
    pub fn new() -> Self {
        TestAuthority {
            ca_key: generate_key(),
        }
    }

    pub fn ca_public_openssh(&self) -> String {
        self.ca_key.public_key().to_openssh().unwrap()
    }

    pub fn sign_user(
        &self,
        subject: &PrivateKey,
        principal: Option<&str>,
        admin: bool,
    ) -> Certificate {
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            subject.public_key().key_data().clone(),
            0,
            0xFFFF_FFFF_FFFE,
        )
        .unwrap();
        builder.cert_type(CertType::User).unwrap();
        builder.key_id("test-user-certificate").unwrap();
        match principal {
            Some(principal) => {
                builder.valid_principal(principal).unwrap();
            }
            None => {
                builder.all_principals_valid().unwrap();
            }
        }
        if admin {
            builder.extension("permit-port-forwarding", "").unwrap();
        }
        builder.sign(&self.ca_key).unwrap()
    }

    pub fn sign_host(&self, host_key: &PrivateKey) -> Certificate {
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            host_key.public_key().key_data().clone(),
            0,
            0xFFFF_FFFF_FFFE,
        )
        .unwrap();
        builder.cert_type(CertType::Host).unwrap();
        builder.key_id("test-host-certificate").unwrap();
        builder.all_principals_valid().unwrap();
        builder.sign(&self.ca_key).unwrap()
    }
}

pub fn gateway_settings(authority: &TestAuthority) -> GatewaySettings {
    let host_key = generate_key();
    let host_certificate = authority.sign_host(&host_key);
    GatewaySettings {
        server_version: "SSH-2.0-gatehouse-test".into(),
        ca_public_key: authority.ca_public_openssh(),
        host_certificate: host_certificate.to_openssh().unwrap(),
        host_private_key: host_key.to_openssh(LineEnding::LF).unwrap().to_string(),
    }
}

// Stand the gateway up on an ephemeral port with its own accept loop, the
// way the CLI collaborator would.
pub async fn start_gateway(authority: &TestAuthority) -> (Arc<Gateway>, SocketAddr) {
    let gateway = Gateway::new(gateway_settings(authority)).expect("Failed to create gateway");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let acceptor = Arc::clone(&gateway);
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            Arc::clone(&acceptor).handle_connection(stream, peer);
        }
    });
    (gateway, address)
}

// A forwarded-tcpip channel the gateway opened toward this client, along
// with its open parameters.
pub struct ForwardedChannel {
    pub channel: russh::Channel<client::Msg>,
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

pub struct ClientHandler {
    forwarded: UnboundedSender<ForwardedChannel>,
}

impl ClientHandler {
    pub fn new(forwarded: UnboundedSender<ForwardedChannel>) -> Self {
        ClientHandler { forwarded }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.forwarded.send(ForwardedChannel {
            channel,
            connected_address: connected_address.into(),
            connected_port,
            originator_address: originator_address.into(),
            originator_port,
        });
        Ok(())
    }
}

// Connect and authenticate with a fresh CA-signed certificate.
pub async fn connect(
    address: SocketAddr,
    authority: &TestAuthority,
    user: &str,
    admin: bool,
) -> (
    client::Handle<ClientHandler>,
    UnboundedReceiver<ForwardedChannel>,
) {
    let key = generate_key();
    let certificate = authority.sign_user(&key, Some(user), admin);
    let (tx, rx) = unbounded_channel();
    let mut session = client::connect(Default::default(), address, ClientHandler::new(tx))
        .await
        .expect("Failed to connect to gateway");
    let auth = session
        .authenticate_openssh_cert(user, Arc::new(key), certificate)
        .await
        .expect("Certificate authentication request failed");
    assert!(auth.success(), "certificate authentication should succeed");
    (session, rx)
}

// Frame a status record the way the session control protocol expects it.
pub fn status_frame(record: &[u8]) -> Vec<u8> {
    gatehouse::wire::encode_status_record(record).to_vec()
}

// Parse the gateway's status snapshot for structural assertions.
pub fn status_value(gateway: &Gateway) -> serde_json::Value {
    serde_json::from_str(&gateway.status()).unwrap()
}

// Wait for the next data message on a channel and assert its contents.
pub async fn expect_data(channel: &mut russh::Channel<client::Msg>, expected: &[u8]) {
    let data = timeout(Duration::from_secs(5), async {
        loop {
            match channel.wait().await.expect("channel closed early") {
                ChannelMsg::Data { data } => return data.to_vec(),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timeout waiting for channel data");
    assert_eq!(data, expected);
}

// Poll a condition until it holds, with a test-sized timeout.
pub async fn wait_for<F: FnMut() -> bool>(mut condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("Timeout waiting for condition");
}
