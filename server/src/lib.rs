//! talon-server: the connection-management core of a TCP server library.
//!
//! The server accepts inbound connections, drives their sockets through a
//! readiness engine, frames application messages with a pluggable protocol
//! and delivers framed messages plus lifecycle events to a [`ServiceHandler`]
//! from a single dispatch thread.
//!
//! Connections are referred to by [`ConnectionId`], a forgery-resistant
//! 64-bit handle that embeds a per-server magic tag, the listening port and
//! the connection's slot index. Handles survive being held across the
//! connection's death: operations on a stale or forged handle simply return
//! `false`.

pub mod cid;
pub mod config;
mod connection;
mod dispatch;
pub mod error;
mod queue;
pub mod server;
mod slots;
mod timeout;

pub use cid::ConnectionId;
pub use config::ServerOptions;
pub use error::ServerError;
pub use server::TcpServer;

/// Application callbacks, invoked serially from the dispatch thread.
///
/// `on_connected` for a handle always precedes its messages, and
/// `on_closed` follows the last of them. Implementations may call back
/// into the server (`send`, `close_connection`, ...) freely; a panic in a
/// callback is trapped and logged without stopping dispatch.
pub trait ServiceHandler: Send + Sync + 'static {
    /// A connection was accepted and installed.
    fn on_connected(&self, cid: ConnectionId);

    /// A complete framed message arrived. The payload is only valid for
    /// the duration of the call.
    fn on_message_received(&self, cid: ConnectionId, data: &[u8]);

    /// The connection was closed by the peer, an error, an idle timeout or
    /// an explicit `close_connection`.
    fn on_closed(&self, cid: ConnectionId);
}
