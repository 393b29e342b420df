//! A single remote peer, reachable over one or more connections. Units
//! are the thing roles and destinations actually send through; a peer
//! keeps at most one `Unit` per remote id, fanning multiple transports
//! into it when the same remote dials in more than once.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use protocol::{Correlation, ParsedFrame, Value};
use tokio::sync::Mutex as AsyncMutex;

use crate::conn::Connection;
use crate::correlation::{CorrelationTable, ResponseOutcome, DEFAULT_REQUEST_TIMEOUT};
use crate::error::SendError;
use crate::stream::{StreamController, StreamReader, StreamWriter};

pub type CloseHandler = Box<dyn Fn(Option<String>) + Send + Sync>;

/// Everything known about a remote peer reachable through this unit.
pub struct Unit {
    pub id: String,
    pub name: String,
    pub friendly: bool,
    pub meta: protocol::MetaInfo,
    roles: RwLock<HashSet<String>>,
    connections: RwLock<Vec<Arc<Connection>>>,
    correlation: CorrelationTable,
    streams: Arc<StreamController>,
    last_role_session: AtomicU64,
    close_handlers: AsyncMutex<Vec<CloseHandler>>,
    closed: std::sync::atomic::AtomicBool,
}

impl Unit {
    pub fn new(data: protocol::PeerData, conn: Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            id: data.id,
            name: data.name,
            friendly: data.friendly,
            meta: data.meta,
            roles: RwLock::new(data.roles.into_iter().collect()),
            connections: RwLock::new(vec![conn]),
            correlation: CorrelationTable::new(),
            streams: Arc::new(StreamController::new()),
            last_role_session: AtomicU64::new(0),
            close_handlers: AsyncMutex::new(Vec::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Builds a unit with no transport, for tests that only need unit
    /// identity (e.g. destination membership / round-robin ordering).
    #[cfg(test)]
    pub(crate) fn new_detached(id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: String::new(),
            friendly: false,
            meta: protocol::MetaInfo {
                os: String::new(),
                runtime: String::new(),
                uptime: 0,
                time: 0,
                protocol: protocol::PROTOCOL_VERSION.to_owned(),
            },
            roles: RwLock::new(HashSet::new()),
            connections: RwLock::new(Vec::new()),
            correlation: CorrelationTable::new(),
            streams: Arc::new(StreamController::new()),
            last_role_session: AtomicU64::new(0),
            close_handlers: AsyncMutex::new(Vec::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn roles(&self) -> Vec<String> {
        self.roles.read().unwrap().iter().cloned().collect()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.read().unwrap().contains(role)
    }

    pub fn set_roles(&self, roles: impl IntoIterator<Item = String>) {
        *self.roles.write().unwrap() = roles.into_iter().collect();
    }

    pub fn connected(&self) -> bool {
        !self.connections.read().unwrap().is_empty()
    }

    pub fn streams(&self) -> Arc<StreamController> {
        self.streams.clone()
    }

    /// Applies a `roles-update` if its session counter is newer than the
    /// last one this unit applied. Returns whether it was applied.
    pub fn apply_roles_update(&self, session: u64, roles: Vec<String>) -> bool {
        let prev = self.last_role_session.load(Ordering::Acquire);
        if session <= prev && prev != 0 {
            return false;
        }
        self.last_role_session.store(session, Ordering::Release);
        self.set_roles(roles);
        true
    }

    pub async fn on_close(&self, handler: CloseHandler) {
        self.close_handlers.lock().await.push(handler);
    }

    pub fn bind_conn(&self, conn: Arc<Connection>) {
        self.connections.write().unwrap().push(conn);
        self.closed.store(false, Ordering::Release);
    }

    /// Drops `conn` from this unit. Runs close handlers and fails
    /// outstanding correlation/stream state if that was the last one.
    pub async fn delete_connection(&self, conn_id: crate::conn::ConnId, reason: Option<String>) {
        let (existed, remaining) = {
            let mut conns = self.connections.write().unwrap();
            let before = conns.len();
            conns.retain(|c| c.id != conn_id);
            (conns.len() != before, conns.len())
        };
        if !existed {
            return;
        }
        self.streams.on_conn_closed(conn_id, reason.as_deref().unwrap_or("connection closed")).await;
        if remaining == 0 {
            self.closed.store(true, Ordering::Release);
            self.correlation.on_unit_close().await;
            for handler in self.close_handlers.lock().await.iter() {
                handler(reason.clone());
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends a one-way message; no response is expected.
    pub async fn send(&self, role: &str, event: &str, value: Value) -> Result<(), SendError> {
        let frame = ParsedFrame::Message { role: role.to_owned(), event: event.to_owned(), value };
        self.write_to_some_connection(&frame).await.map(|_| ())
    }

    /// Sends a request and awaits its resolve/reject.
    pub async fn request(
        &self,
        role: &str,
        event: &str,
        value: Value,
        timeout: Option<Duration>,
        ignore_unit_close: bool,
    ) -> Result<ResponseOutcome, SendError> {
        let timeout = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let (corr, rx) = self.correlation.prepare(timeout, ignore_unit_close).await;
        let frame = ParsedFrame::Request { role: role.to_owned(), event: event.to_owned(), corr, value };
        if let Err(e) = self.write_to_some_connection(&frame).await {
            self.correlation.respond(corr, Err(e)).await;
        }
        rx.await.map_err(|_| SendError::WaiterDropped)?
    }

    /// Sends a `reader-request`: we want to read what the remote writes.
    /// Matches the remote answering with its own writer-side context. The
    /// stream's channel id is the one the remote allocates and returns in
    /// its stream-resolve — the placeholder id sent in the request frame
    /// is only there to satisfy the wire format.
    pub async fn new_reader(
        &self,
        role: &str,
        event: &str,
        value: Value,
        timeout: Option<Duration>,
    ) -> Result<(ResponseOutcome, Option<StreamReader>), SendError> {
        let timeout = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let (corr, rx) = self.correlation.prepare(timeout, false).await;
        let placeholder_channel = self.streams.reserve_local_channel_id();
        let frame = ParsedFrame::ReaderRequest {
            role: role.to_owned(),
            event: event.to_owned(),
            corr,
            channel: placeholder_channel,
            value,
        };
        let sent_on = match self.write_to_some_connection(&frame).await {
            Ok(conn) => Some(conn),
            Err(e) => {
                self.correlation.respond(corr, Err(e)).await;
                None
            }
        };
        let outcome = rx.await.map_err(|_| SendError::WaiterDropped)??;
        let reader = match &outcome {
            ResponseOutcome::StreamResolved { channel, .. } => {
                let conn = sent_on.expect("stream-resolve only arrives if the request frame was sent");
                Some(self.streams.adopt_reader(*channel, conn).await)
            }
            ResponseOutcome::Resolved(_) | ResponseOutcome::Rejected(_) => None,
        };
        Ok((outcome, reader))
    }

    /// Sends a `writer-request`: we want to write what the remote reads.
    /// See [`Self::new_reader`] for why the channel id comes from the
    /// response, not the request.
    pub async fn new_writer(
        &self,
        role: &str,
        event: &str,
        value: Value,
        timeout: Option<Duration>,
    ) -> Result<(ResponseOutcome, Option<StreamWriter>), SendError> {
        let timeout = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let (corr, rx) = self.correlation.prepare(timeout, false).await;
        let placeholder_channel = self.streams.reserve_local_channel_id();
        let frame = ParsedFrame::WriterRequest {
            role: role.to_owned(),
            event: event.to_owned(),
            corr,
            channel: placeholder_channel,
            value,
        };
        let sent_on = match self.write_to_some_connection(&frame).await {
            Ok(conn) => Some(conn),
            Err(e) => {
                self.correlation.respond(corr, Err(e)).await;
                None
            }
        };
        let outcome = rx.await.map_err(|_| SendError::WaiterDropped)??;
        let writer = match &outcome {
            ResponseOutcome::StreamResolved { channel, .. } => {
                let conn = sent_on.expect("stream-resolve only arrives if the request frame was sent");
                Some(self.streams.adopt_writer(*channel, conn).await)
            }
            ResponseOutcome::Resolved(_) | ResponseOutcome::Rejected(_) => None,
        };
        Ok((outcome, writer))
    }

    pub async fn resolve_correlation(&self, corr: Correlation, value: Value) {
        self.correlation.respond(corr, Ok(ResponseOutcome::Resolved(value))).await;
    }

    pub async fn reject_correlation(&self, corr: Correlation, value: Value) {
        self.correlation.respond(corr, Ok(ResponseOutcome::Rejected(value))).await;
    }

    pub async fn resolve_stream_correlation(&self, corr: Correlation, channel: Correlation, value: Value) {
        self.correlation
            .respond(corr, Ok(ResponseOutcome::StreamResolved { channel, value }))
            .await;
    }

    pub fn stream_controller(&self) -> &StreamController {
        &self.streams
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().unwrap().clone()
    }

    /// Sends a raw frame via the same connection-selection policy as
    /// `send`/`request`. Used by the peer for acquaint/roles-update gossip,
    /// which are not role-scoped message frames.
    pub(crate) async fn send_frame(&self, frame: &ParsedFrame) -> Result<(), SendError> {
        self.write_to_some_connection(frame).await.map(|_| ())
    }

    /// Writes `frame` on an idle connection if one exists; otherwise picks
    /// one of the locked connections by a clock-derived offset and tries
    /// it anyway, dropping any connection the write fails on.
    async fn write_to_some_connection(&self, frame: &ParsedFrame) -> Result<Arc<Connection>, SendError> {
        let snapshot = self.connections.read().unwrap().clone();
        if snapshot.is_empty() {
            return Err(SendError::NoAvailableConnections);
        }

        let mut locked = Vec::new();
        for conn in &snapshot {
            if conn.is_locked() {
                locked.push(conn.clone());
                continue;
            }
            if conn.write_frame(frame).await.is_ok() {
                return Ok(conn.clone());
            }
            self.delete_connection(conn.id, Some("write failed".to_owned())).await;
        }

        if locked.is_empty() {
            return Err(SendError::NoAvailableConnections);
        }
        let offset = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| (d.subsec_nanos() / 1000) as usize)
            .unwrap_or(0);
        let n = locked.len();
        for i in 0..n {
            let conn = &locked[(i + offset) % n];
            let still_present = self.connections.read().unwrap().iter().any(|c| c.id == conn.id);
            if !still_present {
                continue;
            }
            if conn.write_frame(frame).await.is_ok() {
                return Ok(conn.clone());
            }
            self.delete_connection(conn.id, Some("write failed".to_owned())).await;
        }
        Err(SendError::NoAvailableConnections)
    }
}
