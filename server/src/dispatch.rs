//! Event handoff queue and the dispatch loop.
//!
//! I/O threads post [`EventRecord`]s; a single dispatch thread drains them
//! and invokes the service callbacks. The condition variable guards only
//! the "has work" predicate; callbacks run with no lock held, so they may
//! re-enter the server.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::ServiceHandler;
use crate::cid::ConnectionId;
use crate::queue::MpscQueue;

pub(crate) enum EventKind {
    Arrived,
    Message,
    Closed,
}

pub(crate) struct EventRecord {
    pub kind: EventKind,
    pub cid: ConnectionId,
    pub peer: Option<SocketAddr>,
    pub payload: Bytes,
}

impl EventRecord {
    pub fn arrived(cid: ConnectionId, peer: SocketAddr) -> Self {
        EventRecord {
            kind: EventKind::Arrived,
            cid,
            peer: Some(peer),
            payload: Bytes::new(),
        }
    }

    pub fn message(cid: ConnectionId, payload: Bytes) -> Self {
        EventRecord {
            kind: EventKind::Message,
            cid,
            peer: None,
            payload,
        }
    }

    pub fn closed(cid: ConnectionId) -> Self {
        EventRecord {
            kind: EventKind::Closed,
            cid,
            peer: None,
            payload: Bytes::new(),
        }
    }
}

pub(crate) struct DispatchQueue {
    queue: MpscQueue<EventRecord>,
    pending: AtomicUsize,
    lock: Mutex<()>,
    cv: Condvar,
    stop: AtomicBool,
}

impl DispatchQueue {
    pub fn new() -> Self {
        DispatchQueue {
            queue: MpscQueue::new(),
            pending: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
        }
    }

    /// Re-arm after a full shutdown drain so the server can be
    /// re-initialised.
    pub fn reset(&self) {
        self.stop.store(false, Ordering::Release);
    }

    pub fn post(&self, record: EventRecord) {
        self.queue.push(record);
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.cv.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wake the dispatch thread and make it return.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        // Notify under the lock so a waiter between its predicate check
        // and the wait cannot miss the wakeup.
        let _guard = self.lock.lock();
        self.cv.notify_all();
    }

    /// Dispatch loop body; runs on the dedicated dispatch thread.
    pub fn run(&self, service: &dyn ServiceHandler) {
        loop {
            if self.stop.load(Ordering::Acquire) {
                return;
            }

            let mut guard = self.lock.lock();
            while self.pending.load(Ordering::Acquire) == 0 {
                if self.stop.load(Ordering::Acquire) {
                    return;
                }
                self.cv.wait(&mut guard);
            }
            let record = self.queue.pop();
            drop(guard);

            // A None here means a producer is mid-enqueue; loop and retry.
            if let Some(record) = record {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                deliver(service, record);
            }
        }
    }

    /// Discard everything still queued. Only sound after the dispatch
    /// thread has exited and the I/O threads have stopped producing.
    pub fn drain(&self) {
        loop {
            let (record, empty) = self.queue.pop_and_check_end();
            if record.is_some() {
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
            if empty {
                break;
            }
        }
    }
}

fn deliver(service: &dyn ServiceHandler, record: EventRecord) {
    let cid = record.cid;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match record.kind {
        EventKind::Arrived => {
            if let Some(peer) = record.peer {
                debug!(?cid, %peer, "connection arrived");
            }
            service.on_connected(cid);
        }
        EventKind::Message => service.on_message_received(cid, &record.payload),
        EventKind::Closed => service.on_closed(cid),
    }));
    if outcome.is_err() {
        error!(?cid, "service callback panicked; continuing dispatch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingService {
        connected: AtomicUsize,
        messages: AtomicUsize,
        closed: AtomicUsize,
    }

    impl ServiceHandler for CountingService {
        fn on_connected(&self, _cid: ConnectionId) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_message_received(&self, _cid: ConnectionId, _data: &[u8]) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }
        fn on_closed(&self, _cid: ConnectionId) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[test]
    fn events_fan_out_to_the_matching_callback() {
        let dq = Arc::new(DispatchQueue::new());
        let service = Arc::new(CountingService::default());
        let cid = ConnectionId::build(1, 2, 3);

        dq.post(EventRecord::arrived(cid, peer()));
        dq.post(EventRecord::message(cid, Bytes::from_static(b"x")));
        dq.post(EventRecord::message(cid, Bytes::from_static(b"y")));
        dq.post(EventRecord::closed(cid));

        let thread = {
            let dq = dq.clone();
            let service = service.clone();
            std::thread::spawn(move || dq.run(&*service))
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while dq.pending() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        dq.request_stop();
        thread.join().unwrap();

        assert_eq!(service.connected.load(Ordering::SeqCst), 1);
        assert_eq!(service.messages.load(Ordering::SeqCst), 2);
        assert_eq!(service.closed.load(Ordering::SeqCst), 1);
        assert_eq!(dq.pending(), 0);
    }

    #[test]
    fn drain_zeroes_the_counter() {
        let dq = DispatchQueue::new();
        let cid = ConnectionId::build(1, 2, 3);
        for _ in 0..1000 {
            dq.post(EventRecord::message(cid, Bytes::from_static(b"m")));
        }
        assert_eq!(dq.pending(), 1000);

        dq.drain();
        assert_eq!(dq.pending(), 0);
        let (record, empty) = dq.queue.pop_and_check_end();
        assert!(record.is_none());
        assert!(empty);
    }

    #[test]
    fn stop_wins_over_pending_work() {
        let dq = Arc::new(DispatchQueue::new());
        let service = Arc::new(CountingService::default());
        let cid = ConnectionId::build(1, 2, 3);

        dq.request_stop();
        dq.post(EventRecord::message(cid, Bytes::from_static(b"late")));

        // The loop must return on the stop flag without waiting.
        dq.run(&*service);
        assert_eq!(service.messages.load(Ordering::SeqCst), 0);

        dq.drain();
        assert_eq!(dq.pending(), 0);
    }

    #[test]
    fn callback_panic_does_not_stop_dispatch() {
        struct PanickyService {
            closed: AtomicUsize,
        }
        impl ServiceHandler for PanickyService {
            fn on_connected(&self, _cid: ConnectionId) {
                panic!("service bug");
            }
            fn on_message_received(&self, _cid: ConnectionId, _data: &[u8]) {}
            fn on_closed(&self, _cid: ConnectionId) {
                self.closed.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dq = Arc::new(DispatchQueue::new());
        let service = Arc::new(PanickyService {
            closed: AtomicUsize::new(0),
        });
        let cid = ConnectionId::build(1, 2, 3);

        dq.post(EventRecord::arrived(cid, peer()));
        dq.post(EventRecord::closed(cid));

        let thread = {
            let dq = dq.clone();
            let service = service.clone();
            std::thread::spawn(move || dq.run(&*service))
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while service.closed.load(Ordering::SeqCst) == 0
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }

        dq.request_stop();
        thread.join().unwrap();
        assert_eq!(service.closed.load(Ordering::SeqCst), 1);
    }
}
