//! Per-connection socket state.
//!
//! A `Connection` owns its non-blocking socket plus the receive and send
//! buffers. The receive path reads until `WouldBlock`, then carves complete
//! frames off the front of the buffer with the attached framing protocol.
//! The send path appends whole frames and flushes opportunistically,
//! finishing later on writable events.

use std::any::Any;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use talon_framing::FramingProtocol;

use crate::cid::ConnectionId;

const RECV_CHUNK: usize = 8 * 1024;

/// Result of draining a readable socket.
#[derive(Debug)]
pub(crate) struct RecvResult {
    /// Complete frames, protocol header stripped, in wire order.
    pub frames: Vec<Bytes>,
    /// The peer closed its half of the connection.
    pub eof: bool,
}

struct SendBuf {
    buf: BytesMut,
    pos: usize,
}

pub(crate) struct Connection {
    cid: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    proto: Arc<dyn FramingProtocol>,
    online: AtomicBool,
    recv_buf: Mutex<BytesMut>,
    send_buf: Mutex<SendBuf>,
    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    extend_info: AtomicU64,
}

impl Connection {
    pub fn new(
        cid: ConnectionId,
        stream: TcpStream,
        peer: SocketAddr,
        proto: Arc<dyn FramingProtocol>,
    ) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Connection {
            cid,
            stream,
            peer,
            proto,
            online: AtomicBool::new(true),
            recv_buf: Mutex::new(BytesMut::with_capacity(RECV_CHUNK)),
            send_buf: Mutex::new(SendBuf {
                buf: BytesMut::with_capacity(RECV_CHUNK),
                pos: 0,
            }),
            user_data: Mutex::new(None),
            extend_info: AtomicU64::new(0),
        })
    }

    pub fn cid(&self) -> ConnectionId {
        self.cid
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Shut the socket down and drop buffered data. Idempotent. The fd
    /// stays open until the last `Arc<Connection>` is dropped, so in-flight
    /// readiness events cannot race a reused descriptor.
    pub fn shutdown(&self) {
        if self.online.swap(false, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
        self.recv_buf.lock().clear();
        let mut send = self.send_buf.lock();
        send.buf.clear();
        send.pos = 0;
    }

    /// Queue one frame (`header ++ body` behind a protocol header) and try
    /// to flush it.
    pub fn send_frame(&self, header: &[u8], body: &[u8]) -> io::Result<()> {
        if !self.is_online() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let proto_header = self.proto.build_package_header(header.len() + body.len());
        let mut send = self.send_buf.lock();
        send.buf.extend_from_slice(&proto_header);
        send.buf.extend_from_slice(header);
        send.buf.extend_from_slice(body);
        self.flush_locked(&mut send)
    }

    /// Writable event: push out whatever is still queued.
    pub fn on_send_event(&self) -> io::Result<()> {
        let mut send = self.send_buf.lock();
        self.flush_locked(&mut send)
    }

    fn flush_locked(&self, send: &mut SendBuf) -> io::Result<()> {
        while send.pos < send.buf.len() {
            match (&self.stream).write(&send.buf[send.pos..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => send.pos += n,
                // Socket full; the reactor will tell us when to resume.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if send.pos >= send.buf.len() {
            send.buf.clear();
            send.pos = 0;
        }
        Ok(())
    }

    /// Readable event: drain the socket, then extract complete frames.
    ///
    /// Framing errors (non-positive package length) surface as
    /// `InvalidData` and are fatal to the connection.
    pub fn on_recv_event(&self) -> io::Result<RecvResult> {
        let mut recv = self.recv_buf.lock();
        let mut chunk = [0u8; RECV_CHUNK];
        let mut eof = false;

        loop {
            match (&self.stream).read(&mut chunk) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => recv.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let frames = self.extract_frames(&mut recv)?;
        Ok(RecvResult { frames, eof })
    }

    fn extract_frames(&self, recv: &mut BytesMut) -> io::Result<Vec<Bytes>> {
        let header_len = self.proto.max_header_size();
        let mut frames = Vec::new();

        loop {
            if recv.len() < header_len {
                break;
            }
            let total = self.proto.check_package_length(&recv[..header_len]);
            if total <= 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad package length {total}"),
                ));
            }
            let total = total as usize;
            if recv.len() < total {
                break;
            }
            let mut frame = recv.split_to(total);
            frame.advance(header_len);
            frames.push(frame.freeze());
        }

        Ok(frames)
    }

    pub fn set_user_data(&self, value: Option<Arc<dyn Any + Send + Sync>>) {
        *self.user_data.lock() = value;
    }

    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_data.lock().clone()
    }

    pub fn set_extend_info(&self, value: u64) {
        self.extend_info.store(value, Ordering::Relaxed);
    }

    pub fn extend_info(&self) -> u64 {
        self.extend_info.load(Ordering::Relaxed)
    }
}
