//! TCP server coordinator.
//!
//! Wires the acceptor, the reactor, the slot table and the dispatch thread
//! together. All state hangs off the server instance; I/O callbacks reach
//! it through `Arc<ServerCore>` and validate every handle before touching
//! the table.
//!
//! Lock discipline: the slot-table mutex is never held across socket I/O
//! or an application callback. Lookups clone the `Arc<Connection>` out of
//! the table and drop the lock before doing work.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use talon_framing::FramingProtocol;
use talon_io::{AcceptSink, Acceptor, EventSink, Reactor, unix_now};

use crate::ServiceHandler;
use crate::cid::ConnectionId;
use crate::config::ServerOptions;
use crate::connection::Connection;
use crate::dispatch::{DispatchQueue, EventRecord};
use crate::error::ServerError;
use crate::slots::SlotTable;

/// Minimum seconds between two expiry sweeps, however often the checking
/// tick fires.
const SWEEP_INTERVAL_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Initialised,
    Running,
    Stopping,
    Stopped,
}

/// The public server handle. Dropping it shuts the server down.
pub struct TcpServer {
    core: Arc<ServerCore>,
}

struct ServerCore {
    service: Arc<dyn ServiceHandler>,
    state: Mutex<State>,
    /// Fast-path copies of init-time values, readable without the state
    /// lock so handle validation stays lock-free.
    magic: AtomicU64,
    max_connections: AtomicU64,
    timeout_secs: AtomicU64,
    running: AtomicBool,
    last_sweep: AtomicU64,
    slots: Mutex<SlotTable>,
    protocol: Mutex<Option<Arc<dyn FramingProtocol>>>,
    acceptor: Mutex<Option<Arc<Acceptor>>>,
    reactor: Mutex<Option<Arc<Reactor>>>,
    dispatch: DispatchQueue,
    dispatch_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    pub fn new(service: Arc<dyn ServiceHandler>) -> Self {
        TcpServer {
            core: Arc::new(ServerCore {
                service,
                state: Mutex::new(State::Fresh),
                magic: AtomicU64::new(0),
                max_connections: AtomicU64::new(0),
                timeout_secs: AtomicU64::new(0),
                running: AtomicBool::new(false),
                last_sweep: AtomicU64::new(0),
                slots: Mutex::new(SlotTable::new(0)),
                protocol: Mutex::new(None),
                acceptor: Mutex::new(None),
                reactor: Mutex::new(None),
                dispatch: DispatchQueue::new(),
                dispatch_thread: Mutex::new(None),
            }),
        }
    }

    /// Attach the framing protocol used by all connections. Must be set
    /// before connections arrive; without it new connections are refused.
    pub fn set_protocol(&self, proto: Arc<dyn FramingProtocol>) {
        *self.core.protocol.lock() = Some(proto);
    }

    /// Initialise subcomponents and reserve the slot table. Valid on a
    /// fresh server or after [`shutdown`](Self::shutdown).
    pub fn init(&self, options: &ServerOptions) -> Result<(), ServerError> {
        self.core.init(options)
    }

    /// Resolve `addr` and add every resolved address to the listener.
    /// Per-address failures are aggregated; already-bound listeners stay.
    pub fn add_listening(&self, addr: &str) -> Result<(), ServerError> {
        self.core.add_listening(addr)
    }

    /// Start the listener, the I/O engine and the dispatch thread.
    pub fn start(&self) -> Result<(), ServerError> {
        self.core.clone().start()
    }

    /// Ordered teardown; drains all in-flight work. Idempotent.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    /// Frame `data` and queue it on the connection. `false` on an invalid
    /// handle, a dead connection, or a server that is not running.
    pub fn send(&self, cid: ConnectionId, data: &[u8]) -> bool {
        self.core.send_with_header(cid, &[], data)
    }

    /// Like [`send`](Self::send) with a caller-provided header; header and
    /// data form one logical frame.
    pub fn send_with_header(&self, cid: ConnectionId, header: &[u8], data: &[u8]) -> bool {
        self.core.send_with_header(cid, header, data)
    }

    /// Close a connection abruptly. Returns `true` iff the handle passed
    /// validation; closing an already-closed handle is a no-op.
    pub fn close_connection(&self, cid: ConnectionId) -> bool {
        let Some(index) = self.core.check_cid(cid) else {
            return false;
        };
        self.core.evict(index, cid, true);
        true
    }

    /// Attach an opaque value to the connection.
    pub fn set_user_data(&self, cid: ConnectionId, value: Option<Arc<dyn std::any::Any + Send + Sync>>) -> bool {
        match self.core.lookup(cid) {
            Some(conn) => {
                conn.set_user_data(value);
                true
            }
            None => false,
        }
    }

    pub fn get_user_data(&self, cid: ConnectionId) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.core.lookup(cid)?.user_data()
    }

    /// Per-connection 64-bit scratch value.
    pub fn set_extend_info(&self, cid: ConnectionId, value: u64) -> bool {
        match self.core.lookup(cid) {
            Some(conn) => {
                conn.set_extend_info(value);
                true
            }
            None => false,
        }
    }

    pub fn get_extend_info(&self, cid: ConnectionId) -> Option<u64> {
        Some(self.core.lookup(cid)?.extend_info())
    }

    /// The instance tag embedded in every handle this server issues.
    pub fn magic(&self) -> u16 {
        self.core.magic()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

impl ServerCore {
    fn magic(&self) -> u16 {
        self.magic.load(Ordering::Relaxed) as u16
    }

    fn max_connections(&self) -> u32 {
        self.max_connections.load(Ordering::Relaxed) as u32
    }

    /// O(1) handle validation; no lock taken.
    fn check_cid(&self, cid: ConnectionId) -> Option<u32> {
        if cid.is_invalid() {
            return None;
        }
        if cid.magic() != self.magic() {
            return None;
        }
        let index = cid.index();
        if index >= self.max_connections() {
            return None;
        }
        Some(index)
    }

    /// Validate, then fetch the connection. Rejects a handle whose slot
    /// has been reused for a newer connection.
    fn lookup(&self, cid: ConnectionId) -> Option<Arc<Connection>> {
        let index = self.check_cid(cid)?;
        let conn = self.slots.lock().lookup(index)?;
        if conn.cid() != cid {
            return None;
        }
        Some(conn)
    }

    fn init(&self, options: &ServerOptions) -> Result<(), ServerError> {
        options.validate()?;

        let mut state = self.state.lock();
        match *state {
            State::Fresh | State::Stopped => {}
            State::Initialised | State::Running | State::Stopping => {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let acceptor =
            Acceptor::new().map_err(|e| ServerError::start_failed("listener", e))?;
        let reactor = Reactor::new().map_err(|e| ServerError::start_failed("engine", e))?;

        *self.slots.lock() = SlotTable::new(options.max_connections);
        self.dispatch.reset();

        self.magic.store(magic_from_clock() as u64, Ordering::Relaxed);
        self.max_connections
            .store(options.max_connections as u64, Ordering::Relaxed);
        self.timeout_secs
            .store(options.connection_timeout_secs, Ordering::Relaxed);
        self.last_sweep.store(unix_now(), Ordering::Relaxed);

        *self.acceptor.lock() = Some(Arc::new(acceptor));
        *self.reactor.lock() = Some(Arc::new(reactor));

        *state = State::Initialised;
        Ok(())
    }

    fn add_listening(&self, addr: &str) -> Result<(), ServerError> {
        {
            let state = self.state.lock();
            if !matches!(*state, State::Initialised | State::Running) {
                return Err(ServerError::Uninitialized);
            }
        }
        let acceptor = self
            .acceptor
            .lock()
            .clone()
            .ok_or(ServerError::Uninitialized)?;

        let resolved: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|e| ServerError::Resolve {
                addr: addr.to_string(),
                source: e,
            })?
            .collect();
        if resolved.is_empty() {
            return Err(ServerError::Resolve {
                addr: addr.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
            });
        }

        let mut failure: Option<ServerError> = None;
        for resolved_addr in resolved {
            if let Err(e) = acceptor.add_listening(resolved_addr) {
                let msg = format!("{resolved_addr}: {e}");
                failure = Some(match failure {
                    None => ServerError::Listen {
                        messages: vec![msg],
                    },
                    Some(prior) => prior.append(msg),
                });
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn start(self: Arc<Self>) -> Result<(), ServerError> {
        let mut state = self.state.lock();
        if *state != State::Initialised {
            return Err(ServerError::Uninitialized);
        }

        let acceptor = self
            .acceptor
            .lock()
            .clone()
            .ok_or(ServerError::Uninitialized)?;
        let reactor = self
            .reactor
            .lock()
            .clone()
            .ok_or(ServerError::Uninitialized)?;

        acceptor
            .start(self.clone())
            .map_err(|e| ServerError::start_failed("listener", e))?;
        reactor
            .start(self.clone())
            .map_err(|e| ServerError::start_failed("engine", e))?;

        let core = self.clone();
        let handle = std::thread::Builder::new()
            .name("talon-dispatch".to_string())
            .spawn(move || core.dispatch.run(&*core.service))
            .map_err(|e| ServerError::start_failed("dispatch", e))?;
        *self.dispatch_thread.lock() = Some(handle);

        self.running.store(true, Ordering::Release);
        *state = State::Running;
        Ok(())
    }

    /// Teardown order is load-bearing: stop producers (listener, engine)
    /// before the dispatch thread, and only drain the queue once the
    /// dispatch thread has exited.
    ///
    /// The state lock is not held across the thread joins: a service
    /// callback running on the dispatch thread may itself call `shutdown`
    /// and must get the idempotent fast path, not a deadlock.
    fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                State::Fresh | State::Stopping | State::Stopped => return,
                State::Initialised | State::Running => *state = State::Stopping,
            }
        }

        self.running.store(false, Ordering::Release);

        let acceptor = self.acceptor.lock().take();
        if let Some(acceptor) = acceptor {
            acceptor.shutdown();
        }

        let reactor = self.reactor.lock().take();
        if let Some(reactor) = reactor {
            reactor.shutdown();
        }

        self.dispatch.request_stop();
        let dispatch_thread = self.dispatch_thread.lock().take();
        if let Some(handle) = dispatch_thread {
            let _ = handle.join();
        }

        let conns = self.slots.lock().drain_all();
        for conn in conns {
            conn.shutdown();
        }

        self.dispatch.drain();

        *self.state.lock() = State::Stopped;
    }

    fn send_with_header(&self, cid: ConnectionId, header: &[u8], data: &[u8]) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        let Some(conn) = self.lookup(cid) else {
            return false;
        };
        conn.send_frame(header, data).is_ok()
    }

    fn refresh_deadline(&self, index: u32) {
        let deadline = unix_now() + self.timeout_secs.load(Ordering::Relaxed);
        self.slots.lock().refresh(index, deadline);
    }

    /// Tear one connection down: clear the slot, deregister the socket,
    /// shut it and optionally notify the service. Idempotent per slot.
    fn evict(&self, index: u32, cid: ConnectionId, notify: bool) {
        let conn = {
            let mut slots = self.slots.lock();
            match slots.lookup(index) {
                // A handle for a previous tenant of the slot must not kill
                // the current one.
                Some(current) if current.cid() == cid => slots.evict(index),
                _ => None,
            }
        };
        let Some(conn) = conn else {
            return;
        };

        let reactor = self.reactor.lock().clone();
        if let Some(reactor) = reactor {
            let _ = reactor.remove(conn.raw_fd());
        }
        conn.shutdown();
        if notify {
            self.dispatch.post(EventRecord::closed(conn.cid()));
        }
    }

    /// Rate-limit gate for the expiry sweep.
    fn should_sweep(&self, now: u64) -> bool {
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now.saturating_sub(last) < SWEEP_INTERVAL_SECS {
            return false;
        }
        self.last_sweep
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

impl AcceptSink for ServerCore {
    fn on_new_connection(&self, sock: TcpStream, listen_port: u16, peer: SocketAddr) {
        if !self.running.load(Ordering::Acquire) {
            let _ = sock.shutdown(Shutdown::Both);
            return;
        }

        let proto = self.protocol.lock().clone();
        let Some(proto) = proto else {
            warn!(%peer, "no framing protocol attached; refusing connection");
            let _ = sock.shutdown(Shutdown::Both);
            return;
        };
        let reactor = self.reactor.lock().clone();
        let Some(reactor) = reactor else {
            let _ = sock.shutdown(Shutdown::Both);
            return;
        };

        let allocated = {
            let mut slots = self.slots.lock();
            slots.allocate()
        };
        let Some(index) = allocated else {
            error!(
                %peer,
                max_connections = self.max_connections(),
                "connection cap reached; refusing"
            );
            let _ = sock.shutdown(Shutdown::Both);
            return;
        };

        let cid = ConnectionId::build(self.magic(), listen_port, index);
        let conn = match Connection::new(cid, sock, peer, proto) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                warn!(%peer, error = %e, "failed to prepare accepted connection");
                self.slots.lock().release(index);
                return;
            }
        };

        let deadline = unix_now() + self.timeout_secs.load(Ordering::Relaxed);
        self.slots.lock().install(index, conn.clone(), deadline);

        // Queue Arrived before the reactor can produce the first message
        // for this connection.
        self.dispatch.post(EventRecord::arrived(cid, peer));

        if let Err(e) = reactor.add(conn.raw_fd(), cid.as_u64()) {
            warn!(?cid, error = %e, "failed to register connection; closing");
            self.evict(index, cid, true);
        }
    }
}

impl EventSink for ServerCore {
    fn on_recv_event(&self, tag: u64) {
        let cid = ConnectionId::from_u64(tag);
        let Some(index) = self.check_cid(cid) else {
            debug!(tag, "recv event for invalid connection id");
            return;
        };
        let Some(conn) = self.lookup(cid) else {
            return;
        };

        match conn.on_recv_event() {
            Ok(result) => {
                for payload in result.frames {
                    self.dispatch.post(EventRecord::message(cid, payload));
                }
                if result.eof {
                    self.evict(index, cid, true);
                } else {
                    self.refresh_deadline(index);
                }
            }
            Err(e) => {
                warn!(?cid, peer = %conn.peer_addr(), error = %e, "recv failed; closing connection");
                self.evict(index, cid, true);
            }
        }
    }

    fn on_send_event(&self, tag: u64) {
        let cid = ConnectionId::from_u64(tag);
        let Some(index) = self.check_cid(cid) else {
            debug!(tag, "send event for invalid connection id");
            return;
        };
        let Some(conn) = self.lookup(cid) else {
            return;
        };

        match conn.on_send_event() {
            Ok(()) => self.refresh_deadline(index),
            Err(e) => {
                warn!(?cid, peer = %conn.peer_addr(), error = %e, "send failed; closing connection");
                self.evict(index, cid, true);
            }
        }
    }

    fn on_error_event(&self, tag: u64, err: io::Error) {
        let cid = ConnectionId::from_u64(tag);
        let Some(index) = self.check_cid(cid) else {
            debug!(tag, "error event for invalid connection id");
            return;
        };
        debug!(?cid, error = %err, "socket error; closing connection");
        self.evict(index, cid, true);
    }

    fn on_checking_event(&self, now: u64) {
        if !self.should_sweep(now) {
            return;
        }

        let expired = self.slots.lock().take_expired(now);
        if expired.is_empty() {
            return;
        }

        let reactor = self.reactor.lock().clone();
        for (_index, conn) in expired {
            debug!(cid = ?conn.cid(), "idle connection evicted");
            if let Some(reactor) = &reactor {
                let _ = reactor.remove(conn.raw_fd());
            }
            conn.shutdown();
            self.dispatch.post(EventRecord::closed(conn.cid()));
        }
    }
}

/// Per-instance magic tag from the clock. The sixteen bits above the
/// low 65 microseconds change on every realistic restart interval.
fn magic_from_clock() -> u16 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    ((nanos >> 16) & 0xFFFF) as u16
}
