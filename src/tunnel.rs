use std::{
    io,
    net::SocketAddr,
    pin::{Pin, pin},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Instant,
};

use chrono::{DateTime, Utc};
use russh::{ChannelStream, server::Msg};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, copy_bidirectional};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{connection::Connection, wire::TunnelData};

// One half of a spliced pair of SSH channels. The two halves share a
// cancellation token, so closing either tears down both.
pub(crate) struct Tunnel {
    id: usize,
    connection: Weak<Connection>,
    token: CancellationToken,
    // Destination coordinates as seen by this side, plus the caller's origin.
    data: TunnelData,
    peer_user: String,
    peer_address: SocketAddr,
    created: Instant,
    created_at: DateTime<Utc>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl Tunnel {
    pub(crate) fn new(
        id: usize,
        connection: &Arc<Connection>,
        token: CancellationToken,
        data: TunnelData,
        peer_user: &str,
        peer_address: SocketAddr,
    ) -> Arc<Self> {
        Arc::new(Tunnel {
            id,
            connection: Arc::downgrade(connection),
            token,
            data,
            peer_user: peer_user.to_string(),
            peer_address,
            created: Instant::now(),
            created_at: Utc::now(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn close(&self) {
        self.token.cancel();
    }

    fn record_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        if let Some(connection) = self.connection.upgrade() {
            connection.record_read(bytes);
        }
    }

    fn record_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        if let Some(connection) = self.connection.upgrade() {
            connection.record_written(bytes);
        }
    }

    fn finish(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.remove_tunnel(self.id);
        }
    }

    pub(crate) fn status(&self) -> Value {
        json!({
            "id": self.id,
            "service": {
                "host": self.data.host,
                "port": self.data.port,
            },
            "origin": {
                "address": self.data.origin_address,
                "port": self.data.origin_port,
            },
            "peer": {
                "user": self.peer_user,
                "address": self.peer_address.to_string(),
            },
            "created": self.created_at.timestamp(),
            "up_time": self.created.elapsed().as_secs(),
            "bytes_read": self.bytes_read.load(Ordering::Relaxed),
            "bytes_written": self.bytes_written.load(Ordering::Relaxed),
        })
    }
}

// Byte-stream adapter that feeds the tunnel's counters, and through them the
// owning connection's cumulative counters, as bytes move.
struct MeteredStream {
    inner: ChannelStream<Msg>,
    tunnel: Arc<Tunnel>,
}

impl AsyncRead for MeteredStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = pin!(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let bytes = buf.filled().len() - before;
            if bytes > 0 {
                self.tunnel.record_read(bytes as u64);
            }
        }
        result
    }
}

impl AsyncWrite for MeteredStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = pin!(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(bytes)) = &result {
            if *bytes > 0 {
                self.tunnel.record_written(*bytes as u64);
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        pin!(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        pin!(&mut self.inner).poll_shutdown(cx)
    }
}

// Pump bytes between the two halves until either side closes or the shared
// token fires. Copy errors are normal termination: the peer went away.
pub(crate) fn start_splice(
    caller: (Arc<Tunnel>, ChannelStream<Msg>),
    target: (Arc<Tunnel>, ChannelStream<Msg>),
    token: CancellationToken,
) {
    let (caller_tunnel, caller_stream) = caller;
    let (target_tunnel, target_stream) = target;
    tokio::spawn(async move {
        let mut caller = MeteredStream {
            inner: caller_stream,
            tunnel: Arc::clone(&caller_tunnel),
        };
        let mut target = MeteredStream {
            inner: target_stream,
            tunnel: Arc::clone(&target_tunnel),
        };
        tokio::select! {
            result = copy_bidirectional(&mut caller, &mut target) => {
                match result {
                    Ok((to_target, to_caller)) => {
                        debug!(to_target, to_caller, "Tunnel finished.");
                    }
                    Err(error) => {
                        debug!(%error, "Tunnel closed.");
                    }
                }
            }
            _ = token.cancelled() => {
                debug!("Tunnel canceled.");
            }
        }
        // Dropping the streams closes both channels; make sure a half-open
        // partner observes the shutdown too.
        token.cancel();
        caller_tunnel.finish();
        target_tunnel.finish();
    });
}
