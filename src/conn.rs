//! Wraps one transport connection: a write-serializing mutex plus an
//! `is_locked` probe the unit send policy uses to find an idle sibling.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;

use crate::transport::FrameTransport;
use protocol::ParsedFrame;

pub type BoxedSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type BoxedStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Erases the concrete transport type so `Unit`/`Peer` don't need to carry
/// a generic parameter around. Call sites (`dial`/`accept`, or a test
/// harness's in-memory duplex) stay generic over [`FrameTransport`].
pub fn split_boxed<S>(transport: S) -> (BoxedSink, BoxedStream)
where
    S: FrameTransport + 'static,
{
    let (sink, stream) = transport.split();
    (Box::pin(sink), Box::pin(stream))
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl ConnId {
    pub fn next() -> Self {
        Self(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// One transport to a remote peer. Multiple `Connection`s can belong to
/// the same [`crate::unit::Unit`].
pub struct Connection {
    pub id: ConnId,
    sink: Mutex<BoxedSink>,
    locked: AtomicBool,
}

impl Connection {
    pub fn new(sink: BoxedSink) -> Arc<Self> {
        Arc::new(Self {
            id: ConnId::next(),
            sink: Mutex::new(sink),
            locked: AtomicBool::new(false),
        })
    }

    /// True while a write is in flight — used by the unit send policy to
    /// prefer an idle sibling connection before blocking on a locked one.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub async fn write_frame(&self, frame: &ParsedFrame) -> Result<(), WsError> {
        let bytes = protocol::serialize_frame(frame);
        self.write_raw(Message::Binary(bytes.into())).await
    }

    pub async fn write_raw(&self, msg: Message) -> Result<(), WsError> {
        self.locked.store(true, Ordering::Release);
        let mut sink = self.sink.lock().await;
        let result = sink.send(msg).await;
        drop(sink);
        self.locked.store(false, Ordering::Release);
        result
    }

    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("locked", &self.is_locked())
            .finish()
    }
}
