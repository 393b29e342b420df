//! Classifies inbound frames and routes them to the right place: stream
//! controller for `stream-data`, correlation table for resolve/reject,
//! role middleware for message/request/reader-request/writer-request.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use protocol::{ParsedFrame, Value};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::conn::Connection;
use crate::context::{MessageContext, ReaderRequestContext, RequestContext, WriterRequestContext};
use crate::peer::Peer;
use crate::unit::Unit;

pub const CLOSE_MANUAL: u16 = 4000;
pub const CLOSE_AUTH_REJECTED: u16 = 4001;
pub const CLOSE_WRONG_MESSAGE_TYPE: u16 = 4002;
pub const CLOSE_WRONG_DATA_TYPE: u16 = 4003;
pub const CLOSE_WRONG_CORRELATION: u16 = 4004;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4005;
pub const CLOSE_INCORRECT_MESSAGE_STRUCTURE: u16 = 4006;
pub const CLOSE_INCOMPATIBLE_PROTOCOL_VERSION: u16 = 4007;

/// Closes `conn` with a protocol-level close code and reason text.
pub async fn close_with_code(conn: &Connection, code: u16, reason: impl Into<String>) {
    let reason = reason.into();
    tracing::warn!(code, reason = %reason, "closing connection");
    let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
    let _ = conn
        .write_raw(tokio_tungstenite::tungstenite::Message::Close(Some(frame)))
        .await;
    conn.close().await;
}

/// Dispatches one already-parsed frame from `unit` on `conn`. Stream-data
/// frames never reach here — the caller routes those directly to the
/// stream controller before building any context.
pub async fn dispatch_frame(peer: &Arc<Peer>, unit: &Arc<Unit>, conn: &Arc<Connection>, frame: ParsedFrame) {
    let result = AssertUnwindSafe(dispatch_inner(peer, unit, conn, frame))
        .catch_unwind()
        .await;
    if let Err(panic) = result {
        let message = panic_message(&panic);
        close_with_code(conn, CLOSE_INCORRECT_MESSAGE_STRUCTURE, message).await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_owned()
    }
}

async fn dispatch_inner(peer: &Arc<Peer>, unit: &Arc<Unit>, conn: &Arc<Connection>, frame: ParsedFrame) {
    match frame {
        ParsedFrame::StreamData { .. } => {
            unreachable!("stream-data is routed before dispatch_frame is called")
        }
        ParsedFrame::Error { message } => {
            tracing::warn!(unit_id = %unit.id, message = %message, "peer reported an error");
        }
        ParsedFrame::Message { role, event, value } => {
            dispatch_message(peer, unit, role, event, value).await;
        }
        ParsedFrame::Request { role, event, corr, value } => {
            dispatch_request(peer, unit, conn, role, event, corr, value).await;
        }
        ParsedFrame::ReaderRequest { role, event, corr, channel, value } => {
            dispatch_reader_request(peer, unit, conn, role, event, corr, channel, value).await;
        }
        ParsedFrame::WriterRequest { role, event, corr, channel, value } => {
            dispatch_writer_request(peer, unit, conn, role, event, corr, channel, value).await;
        }
        ParsedFrame::Resolve { corr, value } => {
            unit.resolve_correlation(corr, value).await;
        }
        ParsedFrame::Reject { corr, value } => {
            unit.reject_correlation(corr, value).await;
        }
        ParsedFrame::StreamResolve { corr, channel, value } => {
            unit.resolve_stream_correlation(corr, channel, value).await;
        }
        ParsedFrame::StreamReject { corr, value, .. } => {
            unit.reject_correlation(corr, value).await;
        }
        ParsedFrame::Acquaint { json } => {
            peer.handle_acquaint(unit, &json).await;
        }
        ParsedFrame::RolesUpdate { json } => {
            peer.handle_roles_update(unit, &json).await;
        }
        ParsedFrame::AuthChallenge { .. }
        | ParsedFrame::AuthResponse { .. }
        | ParsedFrame::AuthConfirmed { .. } => {
            close_with_code(conn, CLOSE_WRONG_MESSAGE_TYPE, "auth frame after handshake").await;
        }
    }
}

async fn dispatch_message(peer: &Arc<Peer>, unit: &Arc<Unit>, role_name: String, event: String, value: Value) {
    let Some(role) = peer.find_role(&role_name) else {
        tracing::debug!(role = %role_name, "message for unknown role dropped");
        return;
    };
    let ctx = Arc::new(MessageContext { unit: unit.clone(), role: role_name, event: event.clone(), data: value });
    for handler in role.message_chain(&event) {
        handler(ctx.clone()).await;
    }
}

async fn dispatch_request(
    peer: &Arc<Peer>,
    unit: &Arc<Unit>,
    conn: &Arc<Connection>,
    role_name: String,
    event: String,
    corr: protocol::Correlation,
    value: Value,
) {
    let local_id = peer.id.clone();
    let ctx = Arc::new(RequestContext::new(unit.clone(), role_name.clone(), event.clone(), value, corr, conn.clone(), local_id));
    let Some(role) = peer.find_role(&role_name) else {
        ctx.set_err(Value::String(format!("no such role [{role_name}]")));
        ctx.auto_finalize().await;
        return;
    };
    for handler in role.request_chain(&event) {
        handler(ctx.clone()).await;
    }
    ctx.auto_finalize().await;
}

async fn dispatch_reader_request(
    peer: &Arc<Peer>,
    unit: &Arc<Unit>,
    conn: &Arc<Connection>,
    role_name: String,
    event: String,
    corr: protocol::Correlation,
    _channel: protocol::Correlation,
    value: Value,
) {
    let local_id = peer.id.clone();
    let inner = RequestContext::new(unit.clone(), role_name.clone(), event.clone(), value, corr, conn.clone(), local_id);
    // `reader-request` means the remote wants to read, so replying here
    // must produce a writer.
    let ctx = Arc::new(WriterRequestContext::new(inner, unit.streams()));
    let Some(role) = peer.find_role(&role_name) else {
        ctx.reject(Value::String(format!("no such role [{role_name}]")));
        ctx.finalize_if_unanswered().await;
        return;
    };
    for handler in role.writer_request_chain(&event) {
        handler(ctx.clone()).await;
    }
    ctx.finalize_if_unanswered().await;
}

async fn dispatch_writer_request(
    peer: &Arc<Peer>,
    unit: &Arc<Unit>,
    conn: &Arc<Connection>,
    role_name: String,
    event: String,
    corr: protocol::Correlation,
    _channel: protocol::Correlation,
    value: Value,
) {
    let local_id = peer.id.clone();
    let inner = RequestContext::new(unit.clone(), role_name.clone(), event.clone(), value, corr, conn.clone(), local_id);
    // `writer-request` means the remote wants to write, so replying here
    // must produce a reader.
    let ctx = Arc::new(ReaderRequestContext::new(inner, unit.streams()));
    let Some(role) = peer.find_role(&role_name) else {
        ctx.reject(Value::String(format!("no such role [{role_name}]")));
        ctx.finalize_if_unanswered().await;
        return;
    };
    for handler in role.reader_request_chain(&event) {
        handler(ctx.clone()).await;
    }
    ctx.finalize_if_unanswered().await;
}
