//! Peer-to-peer messaging runtime: every node dials or accepts WebSocket
//! connections, authenticates, and exchanges one-way messages, request/
//! response pairs, and flow-controlled byte streams, grouped by named
//! roles it offers and named destinations it consumes.

mod auth;
mod config;
mod conn;
mod context;
mod correlation;
mod destination;
mod dispatch;
mod error;
mod logging;
mod peer;
mod role;
mod stream;
mod transport;
mod unit;

pub use config::{PeerConfig, PresharedKeyConfig, load_config_from_path, load_config_from_str};
pub use context::{
    BoxFuture, MessageContext, MessageHandler, ReaderRequestContext, ReaderRequestHandler,
    RequestContext, RequestHandler, WriterRequestContext, WriterRequestHandler,
};
pub use correlation::ResponseOutcome;
pub use destination::Destination;
pub use error::{ConfigError, HandshakeError, PeerError, SendError, StreamError};
pub use logging::init_tracing;
pub use peer::{ConnectOptions, Peer, RoleHandler, UnitHandler};
pub use protocol::Value;
pub use role::Role;
pub use stream::{StreamReader, StreamWriter};
pub use unit::{CloseHandler, Unit};
