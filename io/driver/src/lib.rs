//! Readiness-based I/O engine for the talon TCP server.
//!
//! Two single-threaded components with explicit start/shutdown lifecycles:
//!
//! - [`Acceptor`]: owns the listening sockets and runs the accept loop,
//!   handing each new connection to an [`AcceptSink`].
//! - [`Reactor`]: epoll/kqueue readiness loop over registered sockets,
//!   delivering readable/writable/error events to an [`EventSink`] keyed
//!   by an opaque 64-bit tag, plus a periodic checking tick.
//!
//! Sockets are never owned here; callers register raw fds and keep
//! ownership of the streams behind them.

pub mod acceptor;
pub mod error;
pub mod handler;
pub mod reactor;

pub use acceptor::Acceptor;
pub use error::Error;
pub use handler::{AcceptSink, EventSink};
pub use reactor::{Reactor, unix_now};
