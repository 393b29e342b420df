//! The top-level handle: identity, roles, destinations, the unit table,
//! and the topology machinery (acquaint gossip, reconnect, role
//! broadcast) that keeps them in sync with the rest of the mesh.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use protocol::{Acquaint, MetaInfo, ParsedFrame, PeerData, RolesUpdate};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_tungstenite::tungstenite::Message;

use crate::auth;
use crate::conn::{BoxedStream, Connection, split_boxed};
use crate::config::PeerConfig;
use crate::destination::Destination;
use crate::dispatch::{self, close_with_code};
use crate::error::{HandshakeError, PeerError};
use crate::role::Role;
use crate::transport::{self, FrameTransport};
use crate::unit::Unit;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

pub type UnitHandler = Box<dyn Fn(&Arc<Unit>) + Send + Sync>;
pub type RoleHandler = Box<dyn Fn(&Arc<Role>) + Send + Sync>;

/// Options for an outbound [`Peer::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Don't schedule a reconnect loop if this dial fails or the resulting
    /// connection later drops.
    pub do_not_reconnect: bool,
    /// Don't gossip this unit's arrival to other friendly units, and don't
    /// teach it about addresses already known locally.
    pub do_not_acquaint: bool,
}

struct AddressEntry {
    do_not_reconnect: bool,
    unit_id: Option<String>,
    /// Set once the reconnect-on-close handler has been installed for this
    /// address, so repeated reconnects don't pile up duplicate handlers on
    /// the same (reused) unit.
    reconnect_handler_installed: bool,
}

/// One inbound frame waiting to be dispatched, plus the unit/connection it
/// arrived on.
type WorkItem = (Arc<Unit>, Arc<Connection>, ParsedFrame);

/// A node in the mesh: owns a set of roles it offers, a set of
/// destinations it consumes, and the table of units it is reachable
/// through.
pub struct Peer {
    pub id: String,
    pub name: String,
    pub friendly: bool,
    start_time: Instant,
    preshared_keys: Vec<crate::config::PresharedKeyConfig>,
    roles: RwLock<HashMap<String, Arc<Role>>>,
    destinations: RwLock<HashMap<String, Arc<Destination>>>,
    units: RwLock<HashMap<String, Arc<Unit>>>,
    addresses: StdMutex<HashMap<String, AddressEntry>>,
    last_role_session: AtomicU64,
    unit_handlers: StdMutex<Vec<UnitHandler>>,
    role_handlers: StdMutex<Vec<RoleHandler>>,
    work_tx: mpsc::UnboundedSender<WorkItem>,
}

impl Peer {
    pub fn new(config: &PeerConfig) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: config.name.clone(),
            friendly: config.friendly,
            start_time: Instant::now(),
            preshared_keys: config.preshared_keys.clone(),
            roles: RwLock::new(HashMap::new()),
            destinations: RwLock::new(HashMap::new()),
            units: RwLock::new(HashMap::new()),
            addresses: StdMutex::new(HashMap::new()),
            last_role_session: AtomicU64::new(0),
            unit_handlers: StdMutex::new(Vec::new()),
            role_handlers: StdMutex::new(Vec::new()),
            work_tx,
        });
        spawn_dispatch_workers(peer.clone(), work_rx);
        if let Some(addr) = config.listen_addr.clone() {
            let listener = peer.clone();
            tokio::spawn(async move {
                if let Err(e) = listener.listen(&addr).await {
                    tracing::warn!(%addr, error = %e, "failed to bind configured listen_addr");
                }
            });
        }
        peer
    }

    /// Hands an already-classified frame to the dispatch worker pool
    /// instead of running it inline, so one slow handler can't stall the
    /// connection's read loop for the frames behind it.
    fn enqueue_frame(&self, unit: Arc<Unit>, conn: Arc<Connection>, frame: ParsedFrame) {
        let _ = self.work_tx.send((unit, conn, frame));
    }

    fn local_peer_data(&self) -> PeerData {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        PeerData {
            id: self.id.clone(),
            name: self.name.clone(),
            roles: self.active_role_names(),
            friendly: self.friendly,
            meta: MetaInfo {
                os: std::env::consts::OS.to_owned(),
                runtime: "tokio".to_owned(),
                uptime: self.start_time.elapsed().as_secs() as i64,
                time: now,
                protocol: protocol::PROTOCOL_VERSION.to_owned(),
            },
        }
    }

    fn active_role_names(&self) -> Vec<String> {
        self.roles
            .read()
            .unwrap()
            .values()
            .filter(|r| r.is_active())
            .map(|r| r.name.clone())
            .collect()
    }

    // -- Roles / destinations / units -------------------------------------

    /// Returns the named role, creating and broadcasting it if this is the
    /// first time it's been asked for.
    pub fn role(self: &Arc<Self>, name: &str) -> Arc<Role> {
        {
            let guard = self.roles.read().unwrap();
            if let Some(role) = guard.get(name) {
                return role.clone();
            }
        }
        let role = Arc::new(Role::new(name));
        self.roles.write().unwrap().insert(name.to_owned(), role.clone());
        for handler in self.role_handlers.lock().unwrap().iter() {
            handler(&role);
        }
        self.spawn_broadcast_roles();
        role
    }

    /// Enables or disables a role and broadcasts the resulting active set.
    /// No-op if the role was never created.
    pub fn set_role_active(self: &Arc<Self>, name: &str, active: bool) {
        let found = {
            let guard = self.roles.read().unwrap();
            if let Some(role) = guard.get(name) {
                role.set_active(active);
                true
            } else {
                false
            }
        };
        if found {
            self.spawn_broadcast_roles();
        }
    }

    pub fn find_role(&self, name: &str) -> Option<Arc<Role>> {
        self.roles.read().unwrap().get(name).cloned()
    }

    /// Returns the named destination, creating it and backfilling it with
    /// any already-connected units serving that role.
    pub fn destination(&self, name: &str) -> Arc<Destination> {
        let mut guard = self.destinations.write().unwrap();
        if let Some(dest) = guard.get(name) {
            return dest.clone();
        }
        let dest = Arc::new(Destination::new(name));
        for unit in self.units.read().unwrap().values() {
            if unit.has_role(name) {
                dest.add_unit(unit.clone());
            }
        }
        guard.insert(name.to_owned(), dest.clone());
        dest
    }

    pub fn units(&self) -> Vec<Arc<Unit>> {
        self.units.read().unwrap().values().cloned().collect()
    }

    pub fn unit(&self, id: &str) -> Option<Arc<Unit>> {
        self.units.read().unwrap().get(id).cloned()
    }

    pub fn on_unit(&self, handler: UnitHandler) {
        self.unit_handlers.lock().unwrap().push(handler);
    }

    pub fn on_role(&self, handler: RoleHandler) {
        self.role_handlers.lock().unwrap().push(handler);
    }

    /// Evaluates every destination's membership for `unit` against its
    /// current connectivity and role set, firing arrival/departure
    /// handlers as needed. A disconnected unit is removed from every
    /// destination regardless of role, so readiness reflects reachable
    /// units only; it is re-added once a connection comes back.
    fn resync_destinations_for_unit(&self, unit: &Arc<Unit>) {
        for dest in self.destinations.read().unwrap().values() {
            if unit.connected() && unit.has_role(&dest.name) {
                dest.add_unit(unit.clone());
            } else {
                dest.remove_unit(&unit.id);
            }
        }
    }

    /// Called by the dispatcher on an inbound `roles-update` frame.
    pub async fn handle_roles_update(&self, unit: &Arc<Unit>, json: &[u8]) {
        let update: RolesUpdate = match serde_json::from_slice(json) {
            Ok(u) => u,
            Err(e) => {
                tracing::debug!(unit_id = %unit.id, error = %e, "malformed roles-update dropped");
                return;
            }
        };
        if !unit.apply_roles_update(update.i, update.roles) {
            return;
        }
        self.resync_destinations_for_unit(unit);
    }

    /// Called by the dispatcher on an inbound `acquaint` frame: dials the
    /// advertised address if it is unknown and serves a role we consume.
    pub async fn handle_acquaint(self: &Arc<Self>, unit: &Arc<Unit>, json: &[u8]) {
        if !unit.friendly {
            return;
        }
        let acquaint: Acquaint = match serde_json::from_slice(json) {
            Ok(a) => a,
            Err(e) => {
                tracing::debug!(unit_id = %unit.id, error = %e, "malformed acquaint dropped");
                return;
            }
        };
        if acquaint.id == self.id || self.units.read().unwrap().contains_key(&acquaint.id) {
            return;
        }
        let wanted = self
            .destinations
            .read()
            .unwrap()
            .keys()
            .any(|name| acquaint.roles.iter().any(|r| r == name));
        if !wanted {
            return;
        }
        let peer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = peer.connect(&acquaint.address, ConnectOptions::default()).await {
                tracing::debug!(address = %acquaint.address, error = %e, "acquaint dial failed");
            }
        });
    }

    fn spawn_broadcast_roles(self: &Arc<Self>) {
        let peer = self.clone();
        tokio::spawn(async move { peer.broadcast_roles().await });
    }

    async fn broadcast_roles(&self) {
        let session = self.last_role_session.fetch_add(1, Ordering::AcqRel) + 1;
        let payload = RolesUpdate { i: session, roles: self.active_role_names() };
        let json = serde_json::to_vec(&payload).expect("RolesUpdate always serializes");
        let frame = ParsedFrame::RolesUpdate { json };
        for unit in self.units() {
            let _ = unit.send_frame(&frame).await;
        }
    }

    // -- Listening / connecting --------------------------------------------

    /// Binds a TCP listener and spawns the accept loop. Returns the bound
    /// address (useful when `addr` used an ephemeral port).
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, PeerError> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let peer = self.clone();
        tokio::spawn(async move {
            loop {
                let (tcp, remote) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "listener accept failed, stopping");
                        break;
                    }
                };
                let peer = peer.clone();
                tokio::spawn(async move {
                    let ws = match transport::accept(tcp).await {
                        Ok(ws) => ws,
                        Err(e) => {
                            tracing::debug!(%remote, error = %e, "websocket upgrade failed");
                            return;
                        }
                    };
                    if let Err(e) = peer.handle_transport(ws, None, false).await {
                        tracing::debug!(%remote, error = %e, "inbound handshake failed");
                    }
                });
            }
        });
        Ok(bound)
    }

    /// Dials `url`, authenticates, and registers the resulting unit. On
    /// failure (or a later drop of the only connection), schedules a
    /// reconnect loop unless `opts.do_not_reconnect`.
    pub async fn connect(self: &Arc<Self>, url: &str, opts: ConnectOptions) -> Result<Arc<Unit>, PeerError> {
        {
            let mut book = self.addresses.lock().unwrap();
            book.entry(url.to_owned()).or_insert_with(|| AddressEntry {
                do_not_reconnect: opts.do_not_reconnect,
                unit_id: None,
                reconnect_handler_installed: false,
            });
        }

        let ws = match transport::dial(url).await {
            Ok(ws) => ws,
            Err(e) => {
                if !opts.do_not_reconnect {
                    self.spawn_reconnect(url.to_owned());
                }
                return Err(PeerError::Transport(e));
            }
        };

        let unit = self.handle_transport(ws, Some(url.to_owned()), opts.do_not_acquaint).await?;

        let needs_handler = {
            let mut book = self.addresses.lock().unwrap();
            let entry = book.get_mut(url).expect("inserted above");
            entry.unit_id = Some(unit.id.clone());
            let first = !entry.reconnect_handler_installed;
            entry.reconnect_handler_installed = true;
            first
        };

        if needs_handler {
            let peer = self.clone();
            let addr = url.to_owned();
            unit.on_close(Box::new(move |_reason| {
                if peer.should_reconnect(&addr) {
                    peer.spawn_reconnect(addr.clone());
                }
            }))
            .await;
        }

        Ok(unit)
    }

    fn should_reconnect(&self, addr: &str) -> bool {
        self.addresses.lock().unwrap().get(addr).is_some_and(|e| !e.do_not_reconnect)
    }

    fn spawn_reconnect(self: &Arc<Self>, addr: String) {
        let peer = self.clone();
        tokio::spawn(async move { peer.reconnect_loop(addr).await });
    }

    async fn reconnect_loop(self: Arc<Self>, addr: String) {
        loop {
            tokio::time::sleep(RECONNECT_INTERVAL).await;
            if !self.should_reconnect(&addr) {
                return;
            }
            let opts = ConnectOptions { do_not_reconnect: true, do_not_acquaint: false };
            match self.connect(&addr, opts).await {
                Ok(_) => return,
                Err(e) => {
                    tracing::debug!(address = %addr, error = %e, "reconnect attempt failed");
                }
            }
        }
    }

    /// Removes the address-book entries bound to `unit_id` (so it won't
    /// reconnect) and closes every connection the unit currently holds.
    pub async fn close_unit(&self, unit_id: &str) {
        let stale: Vec<String> = self
            .addresses
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.unit_id.as_deref() == Some(unit_id))
            .map(|(addr, _)| addr.clone())
            .collect();
        {
            let mut book = self.addresses.lock().unwrap();
            for addr in stale {
                book.remove(&addr);
            }
        }
        let unit = self.units.write().unwrap().remove(unit_id);
        if let Some(unit) = unit {
            for dest in self.destinations.read().unwrap().values() {
                dest.remove_unit(unit_id);
            }
            for conn in unit.connections() {
                close_with_code(&conn, dispatch::CLOSE_MANUAL, "closed locally").await;
                unit.delete_connection(conn.id, Some("closed locally".to_owned())).await;
            }
        }
    }

    /// Runs the handshake on a freshly opened transport, registers the
    /// resulting unit (reusing an existing one if the remote id is already
    /// known), and spawns its read/heartbeat loop.
    async fn handle_transport(
        self: &Arc<Self>,
        transport: impl FrameTransport + 'static,
        dialed_address: Option<String>,
        do_not_acquaint: bool,
    ) -> Result<Arc<Unit>, PeerError> {
        let (sink, mut stream) = split_boxed(transport);
        let conn = Connection::new(sink);
        let local_data = self.local_peer_data();

        let remote_data = match auth::perform_handshake(&conn, &mut stream, &self.preshared_keys, &local_data).await {
            Ok(data) => data,
            Err(e) => {
                conn.close().await;
                return Err(PeerError::Handshake(e));
            }
        };

        if !protocol::protocol_compatible(protocol::PROTOCOL_VERSION, &remote_data.meta.protocol) {
            let reason = format!("incompatible protocol version {}", remote_data.meta.protocol);
            close_with_code(&conn, dispatch::CLOSE_INCOMPATIBLE_PROTOCOL_VERSION, reason).await;
            return Err(PeerError::Handshake(HandshakeError::IncompatibleProtocol {
                local: protocol::PROTOCOL_VERSION.to_owned(),
                remote: remote_data.meta.protocol,
            }));
        }

        let (unit, is_new) = self.get_or_create_unit(remote_data, conn.clone());
        self.resync_destinations_for_unit(&unit);

        if is_new {
            for handler in self.unit_handlers.lock().unwrap().iter() {
                handler(&unit);
            }
            if unit.friendly && !do_not_acquaint {
                if let Some(addr) = &dialed_address {
                    self.gossip_new_unit(&unit, addr).await;
                    self.teach_new_unit_known_addresses(&conn, addr).await;
                }
            }
            let peer = self.clone();
            let unit_for_close = unit.clone();
            unit.on_close(Box::new(move |_reason| {
                peer.resync_destinations_for_unit(&unit_for_close);
            }))
            .await;
        }

        let peer = self.clone();
        let unit_for_task = unit.clone();
        let conn_for_task = conn.clone();
        tokio::spawn(async move {
            run_connection(peer, unit_for_task, conn_for_task, stream).await;
        });

        Ok(unit)
    }

    fn get_or_create_unit(&self, data: PeerData, conn: Arc<Connection>) -> (Arc<Unit>, bool) {
        let mut units = self.units.write().unwrap();
        if let Some(existing) = units.get(&data.id) {
            existing.bind_conn(conn);
            existing.set_roles(data.roles);
            (existing.clone(), false)
        } else {
            let unit = Unit::new(data, conn);
            units.insert(unit.id.clone(), unit.clone());
            (unit, true)
        }
    }

    /// Tells every other friendly unit about the unit we just dialed.
    async fn gossip_new_unit(&self, new_unit: &Arc<Unit>, address: &str) {
        let payload = Acquaint { address: address.to_owned(), id: new_unit.id.clone(), roles: new_unit.roles() };
        let json = serde_json::to_vec(&payload).expect("Acquaint always serializes");
        let frame = ParsedFrame::Acquaint { json };
        for unit in self.units() {
            if unit.id == new_unit.id || !unit.friendly {
                continue;
            }
            let _ = unit.send_frame(&frame).await;
        }
    }

    /// Tells the unit we just dialed about every other address already
    /// known locally, so it can learn about the mesh.
    async fn teach_new_unit_known_addresses(&self, conn: &Arc<Connection>, new_address: &str) {
        let known: Vec<(String, Option<String>)> = self
            .addresses
            .lock()
            .unwrap()
            .iter()
            .filter(|(addr, _)| addr.as_str() != new_address)
            .map(|(addr, entry)| (addr.clone(), entry.unit_id.clone()))
            .collect();
        for (address, unit_id) in known {
            let Some(unit_id) = unit_id else { continue };
            let Some(unit) = self.unit(&unit_id) else { continue };
            let payload = Acquaint { address, id: unit.id.clone(), roles: unit.roles() };
            let json = serde_json::to_vec(&payload).expect("Acquaint always serializes");
            let _ = conn.write_frame(&ParsedFrame::Acquaint { json }).await;
        }
    }
}

/// Owns one connection's reader task: dispatches inbound frames and runs
/// the ping/pong heartbeat until the transport closes or times out.
async fn run_connection(peer: Arc<Peer>, unit: Arc<Unit>, conn: Arc<Connection>, mut stream: BoxedStream) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut last_ping: Option<Instant> = None;
    let mut awaiting_pong = false;
    let mut close_reason: Option<String> = None;

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(bytes))) => match protocol::parse_frame(&bytes) {
                        Ok(ParsedFrame::StreamData { channel, control }) => {
                            unit.streams().on_stream_data(channel, control).await;
                        }
                        Ok(frame) => peer.enqueue_frame(unit.clone(), conn.clone(), frame),
                        Err(e) => {
                            close_with_code(&conn, dispatch::CLOSE_INCORRECT_MESSAGE_STRUCTURE, e.to_string()).await;
                            close_reason = Some(e.to_string());
                            break;
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = conn.write_raw(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        close_reason = Some(frame.map(|f| f.reason.to_string()).unwrap_or_default());
                        break;
                    }
                    Some(Ok(Message::Text(_) | Message::Frame(_))) => {
                        close_with_code(&conn, dispatch::CLOSE_WRONG_MESSAGE_TYPE, "text frames are not supported").await;
                        close_reason = Some("wrong message type".to_owned());
                        break;
                    }
                    Some(Err(e)) => {
                        close_reason = Some(e.to_string());
                        break;
                    }
                    None => {
                        close_reason = Some("connection closed".to_owned());
                        break;
                    }
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                match last_ping {
                    None => {
                        let _ = conn.write_raw(Message::Ping(Vec::new().into())).await;
                        last_ping = Some(now);
                        awaiting_pong = true;
                    }
                    Some(t) if awaiting_pong && now.duration_since(t) >= HEARTBEAT_TIMEOUT => {
                        close_with_code(&conn, dispatch::CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout").await;
                        close_reason = Some("heartbeat timeout".to_owned());
                        break;
                    }
                    Some(t) if !awaiting_pong && now.duration_since(t) >= HEARTBEAT_INTERVAL => {
                        let _ = conn.write_raw(Message::Ping(Vec::new().into())).await;
                        last_ping = Some(now);
                        awaiting_pong = true;
                    }
                    _ => {}
                }
            }
        }
    }

    unit.delete_connection(conn.id, close_reason).await;
}

/// Spawns a CPU-sized pool of workers draining `work_rx`, each running
/// [`dispatch::dispatch_frame`] for whatever frame it pulls off next. This
/// is what decouples one connection's read loop from how long a role's
/// handler chain takes to finish: the reader only classifies and queues.
fn spawn_dispatch_workers(peer: Arc<Peer>, work_rx: mpsc::UnboundedReceiver<WorkItem>) {
    let worker_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let rx = Arc::new(AsyncMutex::new(work_rx));
    for _ in 0..worker_count {
        let peer = peer.clone();
        let rx = rx.clone();
        tokio::spawn(async move {
            loop {
                let item = rx.lock().await.recv().await;
                match item {
                    Some((unit, conn, frame)) => {
                        dispatch::dispatch_frame(&peer, &unit, &conn, frame).await;
                    }
                    None => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    fn test_peer(name: &str) -> Arc<Peer> {
        let cfg = load_config_from_str(&format!(r#"name = "{name}""#)).unwrap();
        Peer::new(&cfg)
    }

    #[test]
    fn id_is_unique_per_peer() {
        let a = test_peer("a");
        let b = test_peer("b");
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.split('-').count(), 5);
    }

    #[test]
    fn role_is_created_lazily_and_reused() {
        let peer = test_peer("a");
        let first = peer.role("worker");
        let second = peer.role("worker");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(peer.find_role("worker").is_some());
        assert!(peer.find_role("nope").is_none());
    }

    #[test]
    fn destination_backfills_from_existing_units() {
        let peer = test_peer("a");
        let unit = Unit::new_detached("u1".to_owned());
        unit.set_roles(["worker".to_owned()]);
        peer.units.write().unwrap().insert(unit.id.clone(), unit.clone());
        let dest = peer.destination("worker");
        assert!(dest.is_ready());
        assert_eq!(dest.units().len(), 1);
    }

    #[test]
    fn set_role_active_is_a_no_op_for_unknown_role() {
        let peer = test_peer("a");
        peer.set_role_active("nope", false);
    }
}
