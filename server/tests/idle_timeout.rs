//! Idle-timeout eviction driven by the checking tick.

use std::io::Write;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use talon_framing::LengthPrefix;
use talon_server::{ConnectionId, ServerOptions, ServiceHandler, TcpServer};

#[derive(Default)]
struct Recorder {
    connected: Mutex<Vec<ConnectionId>>,
    closed: Mutex<Vec<ConnectionId>>,
}

impl ServiceHandler for Recorder {
    fn on_connected(&self, cid: ConnectionId) {
        self.connected.lock().unwrap().push(cid);
    }
    fn on_message_received(&self, _cid: ConnectionId, _data: &[u8]) {}
    fn on_closed(&self, cid: ConnectionId) {
        self.closed.lock().unwrap().push(cid);
    }
}

fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_until(deadline: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    false
}

#[test]
fn silent_connection_is_evicted_while_a_chatty_one_survives() {
    let recorder = Arc::new(Recorder::default());
    let server = TcpServer::new(recorder.clone());
    server.set_protocol(Arc::new(LengthPrefix::default()));
    server
        .init(&ServerOptions {
            max_connections: 4,
            connection_timeout_secs: 2,
        })
        .unwrap();
    let port = get_available_port();
    server.add_listening(&format!("127.0.0.1:{port}")).unwrap();
    server.start().unwrap();

    let mut silent = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        recorder.connected.lock().unwrap().len() == 1
    }));
    let silent_cid = recorder.connected.lock().unwrap()[0];

    let mut chatty = TcpStream::connect(("127.0.0.1", port)).unwrap();
    chatty.set_nodelay(true).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        recorder.connected.lock().unwrap().len() == 2
    }));
    let chatty_cid = recorder.connected.lock().unwrap()[1];

    // Keep the chatty connection busy past the idle deadline; successful
    // I/O refreshes its deadline each time.
    let proto = LengthPrefix::default();
    let deadline = Instant::now() + Duration::from_secs(6);
    let mut silent_closed = false;
    while Instant::now() < deadline {
        chatty.write_all(&proto.encode_frame(b"keepalive")).unwrap();
        std::thread::sleep(Duration::from_millis(400));
        if recorder.closed.lock().unwrap().contains(&silent_cid) {
            silent_closed = true;
            break;
        }
    }

    assert!(silent_closed, "silent connection was never evicted");
    assert!(
        !recorder.closed.lock().unwrap().contains(&chatty_cid),
        "active connection must not be evicted"
    );

    // The evicted peer observes EOF.
    silent
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(std::io::Read::read(&mut silent, &mut buf).unwrap_or(0), 0);

    // Exactly one close for the idle connection.
    let closed = recorder.closed.lock().unwrap().clone();
    assert_eq!(closed.iter().filter(|c| **c == silent_cid).count(), 1);

    server.shutdown();
}
