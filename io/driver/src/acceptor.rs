//! Listening sockets and the accept loop.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, IntoRawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, warn};

use crate::error::Error;
use crate::handler::AcceptSink;

const WAKE: Token = Token(usize::MAX);
const BACKLOG: i32 = 1024;

struct ListenerEntry {
    listener: TcpListener,
    port: u16,
}

/// Owns the listening sockets and runs the accept loop on its own thread.
///
/// Listeners can be added before or after [`start`](Self::start); each
/// accepted connection is made non-blocking and handed to the sink together
/// with the local listening port and the peer address.
pub struct Acceptor {
    poll: Mutex<Option<Poll>>,
    registry: Registry,
    waker: Arc<Waker>,
    listeners: Arc<Mutex<Slab<ListenerEntry>>>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        Ok(Acceptor {
            poll: Mutex::new(Some(poll)),
            registry,
            waker,
            listeners: Arc::new(Mutex::new(Slab::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    /// Bind `addr` and register it with the accept loop.
    ///
    /// Returns the locally bound port (useful when `addr` carried port 0).
    pub fn add_listening(&self, addr: SocketAddr) -> Result<u16, Error> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&addr.into())
            .map_err(|e| Error::Listen(format!("{addr}: {e}")))?;
        socket
            .listen(BACKLOG)
            .map_err(|e| Error::Listen(format!("{addr}: {e}")))?;

        let std_listener: std::net::TcpListener = socket.into();
        let mut listener = TcpListener::from_std(std_listener);
        let port = listener.local_addr()?.port();

        let mut listeners = self.listeners.lock();
        let entry = listeners.vacant_entry();
        self.registry
            .register(&mut listener, Token(entry.key()), Interest::READABLE)?;
        entry.insert(ListenerEntry { listener, port });

        debug!(%addr, port, "listening");
        Ok(port)
    }

    /// Start the accept thread.
    pub fn start(&self, sink: Arc<dyn AcceptSink>) -> Result<(), Error> {
        let poll = self.poll.lock().take().ok_or(Error::AlreadyRunning)?;
        let listeners = self.listeners.clone();
        let shutdown = self.shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("talon-acceptor".to_string())
            .spawn(move || run_loop(poll, listeners, sink, shutdown))
            .map_err(Error::Io)?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Stop accepting, close all listening sockets and join the thread.
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            let _ = self.waker.wake();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        self.listeners.lock().clear();
    }
}

fn run_loop(
    mut poll: Poll,
    listeners: Arc<Mutex<Slab<ListenerEntry>>>,
    sink: Arc<dyn AcceptSink>,
    shutdown: Arc<AtomicBool>,
) {
    let mut events = Events::with_capacity(64);

    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }

        if let Err(e) = poll.poll(&mut events, Some(Duration::from_secs(1))) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %e, "acceptor poll failed");
            return;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKE {
                continue;
            }
            accept_pending(&listeners, token.0, &*sink);
        }
    }
}

/// Drain all pending connections on one listener.
fn accept_pending(listeners: &Mutex<Slab<ListenerEntry>>, key: usize, sink: &dyn AcceptSink) {
    loop {
        let (stream, peer, port) = {
            let guard = listeners.lock();
            let entry = match guard.get(key) {
                Some(e) => e,
                None => return,
            };
            match entry.listener.accept() {
                Ok((stream, peer)) => (stream, peer, entry.port),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        };

        // Re-wrap as a std stream; the sink owns the socket from here.
        let fd = stream.into_raw_fd();
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
        if let Err(e) = std_stream.set_nonblocking(true) {
            warn!(error = %e, "failed to set accepted socket non-blocking");
            continue;
        }
        sink.on_new_connection(std_stream, port, peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        accepted: AtomicUsize,
    }

    impl AcceptSink for CountingSink {
        fn on_new_connection(&self, _sock: std::net::TcpStream, _port: u16, _peer: SocketAddr) {
            self.accepted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn accepts_connections_and_reports_port() {
        let acceptor = Acceptor::new().unwrap();
        let port = acceptor
            .add_listening("127.0.0.1:0".parse().unwrap())
            .unwrap();
        assert_ne!(port, 0);

        let sink = Arc::new(CountingSink {
            accepted: AtomicUsize::new(0),
        });
        acceptor.start(sink.clone()).unwrap();

        let _c1 = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let _c2 = TcpStream::connect(("127.0.0.1", port)).unwrap();

        let start = std::time::Instant::now();
        while sink.accepted.load(Ordering::SeqCst) < 2
            && start.elapsed() < Duration::from_secs(2)
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(sink.accepted.load(Ordering::SeqCst), 2);

        acceptor.shutdown();
    }

    #[test]
    fn bind_conflict_is_reported() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap();

        let acceptor = Acceptor::new().unwrap();
        let err = acceptor.add_listening(addr);
        assert!(matches!(err, Err(Error::Listen(_))));
    }
}
