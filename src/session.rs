use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use chrono::{DateTime, Utc};
use russh::{Channel, server::Msg};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::{connection::Connection, error::GatewayError, wire::StatusRecordDecoder};

// A session-type SSH channel. It carries no shell: the only inbound traffic
// the gateway accepts is length-prefixed JSON status records, each of which
// replaces the owning connection's status blob.
pub(crate) struct Session {
    id: usize,
    connection: Weak<Connection>,
    channel: Channel<Msg>,
    created: Instant,
    created_at: DateTime<Utc>,
    used: Mutex<(Instant, DateTime<Utc>)>,
    decoder: Mutex<StatusRecordDecoder>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(id: usize, channel: Channel<Msg>, connection: &Arc<Connection>) -> Arc<Self> {
        Arc::new(Session {
            id,
            connection: Arc::downgrade(connection),
            channel,
            created: Instant::now(),
            created_at: Utc::now(),
            used: Mutex::new((Instant::now(), Utc::now())),
            decoder: Mutex::new(StatusRecordDecoder::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    // Feed inbound channel bytes through the record decoder. Errors mean the
    // stream is unrecoverable (oversized record) and the channel must go.
    pub(crate) fn receive_data(&self, data: &[u8]) -> Result<(), GatewayError> {
        // Inbound bytes are activity even when they never form a valid record.
        *self.used.lock().expect("not poisoned") = (Instant::now(), Utc::now());
        let connection = self.connection.upgrade();
        if let Some(connection) = &connection {
            connection.touch();
        }
        let records = self.decoder.lock().expect("not poisoned").feed(data)?;
        let Some(connection) = connection else {
            return Ok(());
        };
        for record in records {
            // Only whole, well-formed JSON records replace the status blob.
            if let Err(error) = serde_json::from_slice::<Value>(&record) {
                warn!(user = %connection.user(), %error, "Discarding malformed status record.");
                continue;
            }
            debug!(user = %connection.user(), bytes = record.len(), "Stored status record.");
            connection.report_status(record.to_vec());
        }
        Ok(())
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.channel.close().await;
    }

    pub(crate) fn status(&self) -> Value {
        let used = *self.used.lock().expect("not poisoned");
        json!({
            "id": self.id,
            "created": self.created_at.timestamp(),
            "used": used.1.timestamp(),
            "up_time": self.created.elapsed().as_secs(),
            "idle_time": used.0.elapsed().as_secs(),
        })
    }
}
