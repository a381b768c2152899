use std::io;
use std::net::{SocketAddr, TcpStream};

/// Receiver for readiness events from the [`Reactor`](crate::Reactor).
///
/// The tag is the opaque value supplied at registration; the reactor never
/// interprets it. All callbacks run on the reactor thread, so events for
/// one tag are serialised.
pub trait EventSink: Send + Sync {
    /// The socket behind `tag` is readable (or the peer half-closed it).
    fn on_recv_event(&self, tag: u64);

    /// The socket behind `tag` became writable again.
    fn on_send_event(&self, tag: u64);

    /// A socket-level error was reported for `tag`.
    fn on_error_event(&self, tag: u64, err: io::Error);

    /// Periodic tick, at most ~1s apart, with the current unix time in
    /// seconds. Fires even when no sockets are ready.
    fn on_checking_event(&self, now: u64);
}

/// Receiver for accepted connections from the [`Acceptor`](crate::Acceptor).
pub trait AcceptSink: Send + Sync {
    /// A connection was accepted on the listener bound to `listen_port`.
    ///
    /// The stream is non-blocking and ownership transfers to the sink.
    fn on_new_connection(&self, sock: TcpStream, listen_port: u16, peer: SocketAddr);
}
