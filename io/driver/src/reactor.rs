//! Socket readiness loop.
//!
//! One thread, one `mio::Poll`. Sockets are registered by raw fd with an
//! opaque 64-bit tag and both READABLE and WRITABLE interest; the loop maps
//! readiness to [`EventSink`] callbacks. Registration and deregistration
//! are safe from any thread via a cloned registry handle.
//!
//! Events are edge-triggered: sinks must drain a ready socket until
//! `WouldBlock` or they will not hear about it again.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::error;

use crate::error::Error;
use crate::handler::EventSink;

/// Reserved token for the shutdown waker; never collides with a tag
/// because tags embed a bounded slot index in their low bits.
const WAKE: Token = Token(usize::MAX);

/// Upper bound on one poll wait, so the checking tick keeps firing while
/// the sockets are quiet.
const TICK: Duration = Duration::from_secs(1);

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Readiness engine over a single poll thread.
pub struct Reactor {
    poll: Mutex<Option<Poll>>,
    registry: Registry,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        Ok(Reactor {
            poll: Mutex::new(Some(poll)),
            registry,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    /// Watch `fd` for readability and writability under `tag`.
    pub fn add(&self, fd: RawFd, tag: u64) -> io::Result<()> {
        self.registry.register(
            &mut SourceFd(&fd),
            Token(tag as usize),
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    /// Stop watching `fd`. Must be called before the fd is closed.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }

    /// Start the poll thread. Events are delivered to `sink` until
    /// [`shutdown`](Self::shutdown).
    pub fn start(&self, sink: Arc<dyn EventSink>) -> Result<(), Error> {
        let poll = self.poll.lock().take().ok_or(Error::AlreadyRunning)?;
        let shutdown = self.shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("talon-reactor".to_string())
            .spawn(move || run_loop(poll, sink, shutdown))
            .map_err(Error::Io)?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Stop the poll thread and join it. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            let _ = self.waker.wake();
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run_loop(mut poll: Poll, sink: Arc<dyn EventSink>, shutdown: Arc<AtomicBool>) {
    let mut events = Events::with_capacity(1024);

    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }

        if let Err(e) = poll.poll(&mut events, Some(TICK)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "reactor poll failed");
            return;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKE {
                continue;
            }
            let tag = token.0 as u64;

            if event.is_error() {
                sink.on_error_event(tag, io::Error::other("socket error"));
                continue;
            }
            // Half-close surfaces as readable; the read path observes EOF.
            if event.is_readable() || event.is_read_closed() {
                sink.on_recv_event(tag);
            }
            if event.is_writable() {
                sink.on_send_event(tag);
            }
        }

        sink.on_checking_event(unix_now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSink {
        recv: AtomicUsize,
        ticks: AtomicUsize,
    }

    impl EventSink for CountingSink {
        fn on_recv_event(&self, _tag: u64) {
            self.recv.fetch_add(1, Ordering::SeqCst);
        }
        fn on_send_event(&self, _tag: u64) {}
        fn on_error_event(&self, _tag: u64, _err: io::Error) {}
        fn on_checking_event(&self, _now: u64) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(deadline: Duration, mut ready: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if ready() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn delivers_readable_events_for_registered_fd() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();

        let reactor = Reactor::new().unwrap();
        let sink = Arc::new(CountingSink::default());
        reactor.add(server_side.as_raw_fd(), 7).unwrap();
        reactor.start(sink.clone()).unwrap();

        client.write_all(b"ping").unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            sink.recv.load(Ordering::SeqCst) > 0
        }));

        reactor.shutdown();
    }

    #[test]
    fn ticks_fire_without_io() {
        let reactor = Reactor::new().unwrap();
        let sink = Arc::new(CountingSink::default());
        reactor.start(sink.clone()).unwrap();

        assert!(wait_until(Duration::from_secs(3), || {
            sink.ticks.load(Ordering::SeqCst) > 0
        }));

        reactor.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let reactor = Reactor::new().unwrap();
        let sink = Arc::new(CountingSink::default());
        reactor.start(sink).unwrap();
        reactor.shutdown();
        reactor.shutdown();
    }

    #[test]
    fn start_twice_is_rejected() {
        let reactor = Reactor::new().unwrap();
        let sink = Arc::new(CountingSink::default());
        reactor.start(sink.clone()).unwrap();
        assert!(matches!(reactor.start(sink), Err(Error::AlreadyRunning)));
        reactor.shutdown();
    }
}
