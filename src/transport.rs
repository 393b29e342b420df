//! The framed transport this crate runs on: a WebSocket-shaped duplex
//! stream of binary messages with ping/pong/close control frames. Every
//! connection-level component is generic over [`FrameTransport`] so tests
//! can drive it over an in-process duplex pair instead of a real socket.

use futures_util::{Sink, Stream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub trait FrameTransport:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send
{
}

impl<T> FrameTransport for T where
    T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send
{
}

pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type ServerStream = WebSocketStream<TcpStream>;

/// Dials `url` and completes the WebSocket upgrade. TLS (`wss://`) is
/// handled transparently by `tokio-tungstenite`'s `MaybeTlsStream`.
pub async fn dial(url: &str) -> Result<ClientStream, WsError> {
    let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
    Ok(stream)
}

/// Completes a server-side upgrade on an already-accepted TCP stream.
///
/// A roletalk peer dials and listens symmetrically and never needs an
/// HTTP application framework in front of it, so the upgrade is performed
/// directly rather than behind a router.
pub async fn accept(tcp: TcpStream) -> Result<ServerStream, WsError> {
    tokio_tungstenite::accept_async(tcp).await
}
