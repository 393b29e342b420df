//! Contexts handed to role middleware. `RequestContext`'s `reply`/`reject`
//! latch via an internal flag so a second call is a no-op; `then`-bound
//! callbacks run LIFO right before the response frame goes out.
//!
//! Frame naming reflects the *remote's* intent: a `ReaderRequest` frame
//! means the remote wants to read, so the local context that answers it
//! must be able to write — [`WriterRequestContext`] — and vice versa for
//! [`ReaderRequestContext`] answering a `WriterRequest` frame. This mirrors
//! the wire protocol exactly; it is not a naming bug.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use protocol::{Correlation, ParsedFrame, Value};

use crate::conn::Connection;
use crate::stream::{StreamController, StreamReader, StreamWriter};
use crate::unit::Unit;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type MessageHandler = Arc<dyn Fn(Arc<MessageContext>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type RequestHandler = Arc<dyn Fn(Arc<RequestContext>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ReaderRequestHandler =
    Arc<dyn Fn(Arc<ReaderRequestContext>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type WriterRequestHandler =
    Arc<dyn Fn(Arc<WriterRequestContext>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Context for a one-way message. There is no reply path.
pub struct MessageContext {
    pub unit: Arc<Unit>,
    pub role: String,
    pub event: String,
    pub data: Value,
}

struct ReplyState {
    corr: Correlation,
    conn: Arc<Connection>,
    replied: AtomicBool,
    res: StdMutex<Option<Value>>,
    err: StdMutex<Option<Value>>,
    then_callbacks: StdMutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl ReplyState {
    fn new(corr: Correlation, conn: Arc<Connection>) -> Self {
        Self {
            corr,
            conn,
            replied: AtomicBool::new(false),
            res: StdMutex::new(None),
            err: StdMutex::new(None),
            then_callbacks: StdMutex::new(Vec::new()),
        }
    }

    fn run_then_callbacks(&self) {
        let mut cbs = self.then_callbacks.lock().unwrap();
        while let Some(cb) = cbs.pop() {
            cb();
        }
    }
}

/// Context for a request that resolves with a plain value (no stream).
pub struct RequestContext {
    pub unit: Arc<Unit>,
    pub role: String,
    pub event: String,
    pub data: Value,
    local_peer_id: String,
    reply: ReplyState,
}

impl RequestContext {
    pub fn new(
        unit: Arc<Unit>,
        role: String,
        event: String,
        data: Value,
        corr: Correlation,
        conn: Arc<Connection>,
        local_peer_id: String,
    ) -> Self {
        Self {
            unit,
            role,
            event,
            data,
            local_peer_id,
            reply: ReplyState::new(corr, conn),
        }
    }

    pub fn set_res(&self, value: Value) {
        *self.reply.res.lock().unwrap() = Some(value);
    }

    pub fn set_err(&self, value: Value) {
        *self.reply.err.lock().unwrap() = Some(value);
    }

    /// Registers a callback that runs LIFO right before the response
    /// frame is finalized.
    pub fn then(&self, cb: impl FnOnce() + Send + 'static) {
        self.reply.then_callbacks.lock().unwrap().push(Box::new(cb));
    }

    pub async fn reply(&self, data: Option<Value>) {
        if let Some(d) = data {
            self.set_res(d);
        }
        self.finalize().await;
    }

    pub async fn reject(&self, data: Option<Value>) {
        if let Some(d) = data {
            self.set_err(d);
        }
        self.finalize().await;
    }

    /// Called by the dispatcher once the middleware chain has finished, if
    /// nobody already replied: res, then err, then an auto-reject.
    pub async fn auto_finalize(&self) {
        if self.reply.replied.load(Ordering::Acquire) {
            return;
        }
        let has_res = self.reply.res.lock().unwrap().is_some();
        let has_err = self.reply.err.lock().unwrap().is_some();
        if !has_res && !has_err {
            let msg = format!(
                "event [{}] is not handled by peer [{}]",
                self.event, self.local_peer_id
            );
            self.set_err(Value::String(msg));
        }
        self.finalize().await;
    }

    async fn finalize(&self) {
        if self.reply.replied.swap(true, Ordering::AcqRel) {
            return;
        }
        self.reply.run_then_callbacks();
        let err = self.reply.err.lock().unwrap().clone();
        let frame = match err {
            Some(e) => ParsedFrame::Reject { corr: self.reply.corr, value: e },
            None => {
                let res = self.reply.res.lock().unwrap().clone().unwrap_or(Value::Null);
                ParsedFrame::Resolve { corr: self.reply.corr, value: res }
            }
        };
        let _ = self.reply.conn.write_frame(&frame).await;
    }
}

/// Context answering an incoming `writer-request` frame: the remote wants
/// to write, so replying gives the handler a [`StreamReader`] to consume
/// from.
pub struct ReaderRequestContext {
    pub inner: RequestContext,
    streams: Arc<StreamController>,
}

impl ReaderRequestContext {
    pub fn new(inner: RequestContext, streams: Arc<StreamController>) -> Self {
        Self { inner, streams }
    }

    pub fn then(&self, cb: impl FnOnce() + Send + 'static) {
        self.inner.then(cb);
    }

    pub fn reject(&self, data: Value) {
        self.inner.set_err(data);
    }

    /// Finalizes the handshake for this stream and returns the reader the
    /// handler reads from, or `None` if the context had already been
    /// rejected (by a prior reply, or by `Err` being set).
    pub async fn reply(&self, data: Option<Value>) -> Option<StreamReader> {
        if let Some(d) = data {
            self.inner.set_res(d);
        }
        self.finalize_stream().await
    }

    /// Called by the dispatcher once the middleware chain has finished, if
    /// nobody already replied: auto-rejects with "not handled" and drops
    /// the stream reader, since there is nobody left to hand it to.
    pub async fn finalize_if_unanswered(&self) {
        if self.inner.reply.replied.load(Ordering::Acquire) {
            return;
        }
        let has_res = self.inner.reply.res.lock().unwrap().is_some();
        let has_err = self.inner.reply.err.lock().unwrap().is_some();
        if !has_res && !has_err {
            let msg = format!(
                "event [{}] is not handled by peer [{}]",
                self.inner.event, self.inner.local_peer_id
            );
            self.inner.set_err(Value::String(msg));
        }
        self.finalize_stream().await;
    }

    async fn finalize_stream(&self) -> Option<StreamReader> {
        if self.inner.reply.replied.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.inner.reply.run_then_callbacks();
        let err = self.inner.reply.err.lock().unwrap().clone();
        if let Some(e) = err {
            let frame = ParsedFrame::StreamReject { corr: self.inner.reply.corr, channel: 0, value: e };
            let _ = self.inner.reply.conn.write_frame(&frame).await;
            return None;
        }
        let (channel, reader) = self.streams.create_reader(self.inner.reply.conn.clone()).await;
        let res = self.inner.reply.res.lock().unwrap().clone().unwrap_or(Value::Null);
        let frame = ParsedFrame::StreamResolve { corr: self.inner.reply.corr, channel, value: res };
        if self.inner.reply.conn.write_frame(&frame).await.is_err() {
            self.streams.remove(channel).await;
            return None;
        }
        Some(reader)
    }
}

/// Context answering an incoming `reader-request` frame: the remote wants
/// to read, so replying gives the handler a [`StreamWriter`] to produce
/// into.
pub struct WriterRequestContext {
    pub inner: RequestContext,
    streams: Arc<StreamController>,
}

impl WriterRequestContext {
    pub fn new(inner: RequestContext, streams: Arc<StreamController>) -> Self {
        Self { inner, streams }
    }

    pub fn then(&self, cb: impl FnOnce() + Send + 'static) {
        self.inner.then(cb);
    }

    pub fn reject(&self, data: Value) {
        self.inner.set_err(data);
    }

    pub async fn reply(&self, data: Option<Value>) -> Option<StreamWriter> {
        if let Some(d) = data {
            self.inner.set_res(d);
        }
        self.finalize_stream().await
    }

    /// Called by the dispatcher once the middleware chain has finished, if
    /// nobody already replied: auto-rejects with "not handled" and drops
    /// the stream writer, since there is nobody left to hand it to.
    pub async fn finalize_if_unanswered(&self) {
        if self.inner.reply.replied.load(Ordering::Acquire) {
            return;
        }
        let has_res = self.inner.reply.res.lock().unwrap().is_some();
        let has_err = self.inner.reply.err.lock().unwrap().is_some();
        if !has_res && !has_err {
            let msg = format!(
                "event [{}] is not handled by peer [{}]",
                self.inner.event, self.inner.local_peer_id
            );
            self.inner.set_err(Value::String(msg));
        }
        self.finalize_stream().await;
    }

    async fn finalize_stream(&self) -> Option<StreamWriter> {
        if self.inner.reply.replied.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.inner.reply.run_then_callbacks();
        let err = self.inner.reply.err.lock().unwrap().clone();
        if let Some(e) = err {
            let frame = ParsedFrame::StreamReject { corr: self.inner.reply.corr, channel: 0, value: e };
            let _ = self.inner.reply.conn.write_frame(&frame).await;
            return None;
        }
        let (channel, writer) = self.streams.create_writer(self.inner.reply.conn.clone()).await;
        let res = self.inner.reply.res.lock().unwrap().clone().unwrap_or(Value::Null);
        let frame = ParsedFrame::StreamResolve { corr: self.inner.reply.corr, channel, value: res };
        if self.inner.reply.conn.write_frame(&frame).await.is_err() {
            self.streams.remove(channel).await;
            return None;
        }
        Some(writer)
    }
}
