//! Flow-controlled binary streams. Each open stream has exactly one local
//! endpoint — either a reader (remote produces, we consume) or a writer
//! (we produce, remote consumes) — bound to the connection it was
//! established on.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use protocol::{Correlation, DEFAULT_QUOTA_SIZE, DEFAULT_QUOTA_THRESHOLD, StreamControl};
use tokio::sync::{Mutex, Notify};

use crate::conn::{ConnId, Connection};
use crate::error::StreamError;

struct ReaderState {
    buf: Mutex<VecDeque<u8>>,
    remaining_local_quota: AtomicI64,
    err: Mutex<Option<StreamError>>,
    signal: Notify,
    conn: Arc<Connection>,
}

struct WriterState {
    quota: AtomicI64,
    err: Mutex<Option<StreamError>>,
    signal: Notify,
    conn: Arc<Connection>,
}

enum ChannelState {
    Reader(Arc<ReaderState>),
    Writer(Arc<WriterState>),
}

/// Per-unit registry of open stream channels, keyed by channel id.
pub struct StreamController {
    channels: Mutex<HashMap<Correlation, ChannelState>>,
    by_conn: Mutex<HashMap<ConnId, HashSet<Correlation>>>,
    next_channel: std::sync::Mutex<Correlation>,
}

impl StreamController {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            by_conn: Mutex::new(HashMap::new()),
            next_channel: std::sync::Mutex::new(0),
        }
    }

    /// Allocates a fresh channel id without registering any state for it
    /// yet. Used by the caller side, which must put the id in the
    /// outgoing request frame before it knows which connection carried it.
    pub fn reserve_local_channel_id(&self) -> Correlation {
        let mut guard = self.next_channel.lock().unwrap();
        let id = *guard;
        *guard = if id >= protocol::MAX_CORRELATION { 0 } else { id + 1 };
        id
    }

    async fn bind(&self, channel: Correlation, conn: &Arc<Connection>) {
        self.by_conn.lock().await.entry(conn.id).or_default().insert(channel);
    }

    /// Creates the reader side of a new stream on `conn` and registers it.
    pub async fn create_reader(&self, conn: Arc<Connection>) -> (Correlation, StreamReader) {
        let channel = self.reserve_local_channel_id();
        let reader = self.adopt_reader(channel, conn).await;
        (channel, reader)
    }

    /// Creates the writer side of a new stream on `conn` and registers it.
    pub async fn create_writer(&self, conn: Arc<Connection>) -> (Correlation, StreamWriter) {
        let channel = self.reserve_local_channel_id();
        let writer = self.adopt_writer(channel, conn).await;
        (channel, writer)
    }

    /// Registers the reader side of a stream whose channel id was already
    /// reserved (the caller-side request path picks the id before it knows
    /// which connection the request frame will go out on).
    pub async fn adopt_reader(&self, channel: Correlation, conn: Arc<Connection>) -> StreamReader {
        let state = Arc::new(ReaderState {
            buf: Mutex::new(VecDeque::new()),
            remaining_local_quota: AtomicI64::new(DEFAULT_QUOTA_SIZE as i64),
            err: Mutex::new(None),
            signal: Notify::new(),
            conn: conn.clone(),
        });
        self.channels.lock().await.insert(channel, ChannelState::Reader(state.clone()));
        self.bind(channel, &conn).await;
        StreamReader { channel, state }
    }

    /// Registers the writer side of a stream whose channel id was already
    /// reserved. See [`Self::adopt_reader`].
    pub async fn adopt_writer(&self, channel: Correlation, conn: Arc<Connection>) -> StreamWriter {
        let state = Arc::new(WriterState {
            quota: AtomicI64::new(DEFAULT_QUOTA_SIZE as i64),
            err: Mutex::new(None),
            signal: Notify::new(),
            conn: conn.clone(),
        });
        self.channels.lock().await.insert(channel, ChannelState::Writer(state.clone()));
        self.bind(channel, &conn).await;
        StreamWriter { channel, state }
    }

    /// Routes an inbound `stream-data` sub-frame to its channel.
    pub async fn on_stream_data(&self, channel: Correlation, control: StreamControl) {
        let state = {
            let guard = self.channels.lock().await;
            match guard.get(&channel) {
                Some(ChannelState::Reader(r)) => Some(ChannelState::Reader(r.clone())),
                Some(ChannelState::Writer(w)) => Some(ChannelState::Writer(w.clone())),
                None => None,
            }
        };
        match state {
            Some(ChannelState::Reader(r)) => match control {
                StreamControl::Chunk(bytes) => {
                    r.buf.lock().await.extend(bytes);
                    r.signal.notify_waiters();
                }
                StreamControl::Finish => {
                    *r.err.lock().await = Some(StreamError::Eof);
                    r.signal.notify_waiters();
                }
                StreamControl::Error(msg) => {
                    *r.err.lock().await = Some(StreamError::RemoteError(msg));
                    r.signal.notify_waiters();
                }
                StreamControl::Quota(_) => {}
            },
            Some(ChannelState::Writer(w)) => match control {
                StreamControl::Quota(n) => {
                    w.quota.fetch_add(n as i64, Ordering::AcqRel);
                    w.signal.notify_waiters();
                }
                StreamControl::Error(msg) => {
                    *w.err.lock().await = Some(StreamError::RemoteError(msg));
                    w.signal.notify_waiters();
                }
                StreamControl::Chunk(_) | StreamControl::Finish => {}
            },
            None => {}
        }
    }

    /// Latches a connection-closed error on every channel bound to `conn`.
    pub async fn on_conn_closed(&self, conn: ConnId, reason: &str) {
        let channels = self.by_conn.lock().await.remove(&conn).unwrap_or_default();
        let guard = self.channels.lock().await;
        for channel in channels {
            match guard.get(&channel) {
                Some(ChannelState::Reader(r)) => {
                    *r.err.lock().await = Some(StreamError::ConnectionClosed(reason.to_owned()));
                    r.signal.notify_waiters();
                }
                Some(ChannelState::Writer(w)) => {
                    *w.err.lock().await = Some(StreamError::ConnectionClosed(reason.to_owned()));
                    w.signal.notify_waiters();
                }
                None => {}
            }
        }
    }

    pub async fn remove(&self, channel: Correlation) {
        self.channels.lock().await.remove(&channel);
    }
}

impl Default for StreamController {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer handle for a stream whose bytes the remote peer produces.
pub struct StreamReader {
    pub channel: Correlation,
    state: Arc<ReaderState>,
}

impl StreamReader {
    /// Waits for and returns the next available chunk, or the latched
    /// terminal error (`Eof` on a clean finish).
    pub async fn read_chunk(&self) -> Result<Vec<u8>, StreamError> {
        loop {
            let notified = self.state.signal.notified();
            {
                let mut buf = self.state.buf.lock().await;
                if !buf.is_empty() {
                    let chunk: Vec<u8> = buf.drain(..).collect();
                    drop(buf);
                    self.account_for_read(chunk.len()).await;
                    return Ok(chunk);
                }
            }
            if let Some(err) = self.state.err.lock().await.clone() {
                return Err(err);
            }
            notified.await;
        }
    }

    async fn account_for_read(&self, n: usize) {
        let remaining = self.state.remaining_local_quota.fetch_sub(n as i64, Ordering::AcqRel) - n as i64;
        let threshold = (DEFAULT_QUOTA_SIZE as f64 * DEFAULT_QUOTA_THRESHOLD) as i64;
        if remaining < threshold {
            let refill = DEFAULT_QUOTA_SIZE as i64 - remaining;
            self.state.remaining_local_quota.fetch_add(refill, Ordering::AcqRel);
            let frame = protocol::ParsedFrame::StreamData {
                channel: self.channel,
                control: StreamControl::Quota(refill as u64),
            };
            let _ = self.state.conn.write_frame(&frame).await;
        }
    }

    pub async fn destroy(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let frame = protocol::ParsedFrame::StreamData {
            channel: self.channel,
            control: StreamControl::Error(reason.clone()),
        };
        let _ = self.state.conn.write_frame(&frame).await;
        *self.state.err.lock().await = Some(StreamError::Destroyed(reason));
        self.state.signal.notify_waiters();
    }
}

/// Producer handle for a stream whose bytes we write for the remote peer
/// to consume.
pub struct StreamWriter {
    pub channel: Correlation,
    state: Arc<WriterState>,
}

impl StreamWriter {
    /// Blocks until enough send quota is available, then writes one chunk
    /// frame. One frame per call — chunking is the caller's job.
    pub async fn write_chunk(&self, data: &[u8]) -> Result<(), StreamError> {
        loop {
            if let Some(err) = self.state.err.lock().await.clone() {
                return Err(err);
            }
            let notified = self.state.signal.notified();
            let remaining = self.state.quota.load(Ordering::Acquire);
            if remaining > 0 {
                let frame = protocol::ParsedFrame::StreamData {
                    channel: self.channel,
                    control: StreamControl::Chunk(data.to_vec()),
                };
                self.state
                    .conn
                    .write_frame(&frame)
                    .await
                    .map_err(|e| StreamError::ConnectionClosed(e.to_string()))?;
                self.state.quota.fetch_sub(data.len() as i64, Ordering::AcqRel);
                return Ok(());
            }
            notified.await;
        }
    }

    pub async fn close(&self) -> Result<(), StreamError> {
        let frame = protocol::ParsedFrame::StreamData {
            channel: self.channel,
            control: StreamControl::Finish,
        };
        self.state
            .conn
            .write_frame(&frame)
            .await
            .map_err(|e| StreamError::ConnectionClosed(e.to_string()))
    }

    pub async fn destroy(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let frame = protocol::ParsedFrame::StreamData {
            channel: self.channel,
            control: StreamControl::Error(reason.clone()),
        };
        let _ = self.state.conn.write_frame(&frame).await;
        *self.state.err.lock().await = Some(StreamError::Destroyed(reason));
        self.state.signal.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::split_boxed;
    use tokio::io::duplex;
    use tokio_tungstenite::WebSocketStream;

    async fn paired_connections() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = duplex(64 * 1024);
        let ws_a = WebSocketStream::from_raw_socket(a, tokio_tungstenite::tungstenite::protocol::Role::Client, None).await;
        let ws_b = WebSocketStream::from_raw_socket(b, tokio_tungstenite::tungstenite::protocol::Role::Server, None).await;
        let (sink_a, _stream_a) = split_boxed(ws_a);
        let (sink_b, _stream_b) = split_boxed(ws_b);
        (Connection::new(sink_a), Connection::new(sink_b))
    }

    #[tokio::test]
    async fn reader_observes_chunks_pushed_via_on_stream_data() {
        let (conn, _other) = paired_connections().await;
        let controller = StreamController::new();
        let (channel, reader) = controller.create_reader(conn).await;
        controller
            .on_stream_data(channel, StreamControl::Chunk(vec![1, 2, 3]))
            .await;
        let chunk = reader.read_chunk().await.unwrap();
        assert_eq!(chunk, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reader_returns_eof_after_finish() {
        let (conn, _other) = paired_connections().await;
        let controller = StreamController::new();
        let (channel, reader) = controller.create_reader(conn).await;
        controller.on_stream_data(channel, StreamControl::Finish).await;
        let err = reader.read_chunk().await.unwrap_err();
        assert!(matches!(err, StreamError::Eof));
    }

    #[tokio::test]
    async fn conn_closed_latches_error_on_bound_channels() {
        let (conn, _other) = paired_connections().await;
        let conn_id = conn.id;
        let controller = StreamController::new();
        let (_channel, reader) = controller.create_reader(conn).await;
        controller.on_conn_closed(conn_id, "reset").await;
        let err = reader.read_chunk().await.unwrap_err();
        assert!(matches!(err, StreamError::ConnectionClosed(_)));
    }
}
