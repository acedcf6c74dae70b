//! UDP backend
//!
//! Talks to the board's Ethernet bridge with the register protocol in
//! [`crate::protocol`]. Event data arrives on the same socket when the board's
//! receiver address points at this host; datagrams are routed by their first
//! bytes, so register responses and data can interleave freely.
//!
//! Lost datagrams are handled by resending a request up to `retries` times.
//! Register writes are idempotent on the controller, so a resend after a lost
//! response is harmless; control strobes are single-shot per write either
//! way.

use crate::backend::{BackendType, BoardBackend};
use crate::config::AsocConfig;
use crate::error::{AsocError, Result};
use crate::protocol::{self, Request, Response};
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Largest UDP payload.
const MAX_DATAGRAM: usize = 65_507;

/// How long `read_data` waits for a datagram when nothing is queued.
const DATA_POLL: Duration = Duration::from_millis(5);

/// UDP backend
#[derive(Debug)]
pub struct UdpBackend {
    socket: UdpSocket,
    board: SocketAddr,
    seq: u16,
    timeout: Duration,
    retries: u32,
    /// Event datagrams received while waiting for responses
    pending: VecDeque<Bytes>,
    scratch: Vec<u8>,
}

impl UdpBackend {
    /// Bind `host` and address `board`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket cannot be bound or configured.
    pub fn connect(
        host: SocketAddr,
        board: SocketAddr,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(host)?;
        debug!(
            "UDP control link {} -> {board} (timeout {timeout:?}, {retries} retries)",
            socket.local_addr()?
        );
        Ok(Self {
            socket,
            board,
            seq: 0,
            timeout,
            retries,
            pending: VecDeque::new(),
            scratch: vec![0u8; MAX_DATAGRAM],
        })
    }

    /// Local address of the socket (useful when bound to port 0).
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the OS cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn next_seq(&mut self) -> u16 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Receive one datagram from the board, waiting at most `wait`.
    ///
    /// Returns `Ok(None)` on timeout. Datagrams from other sources are dropped.
    fn recv(&mut self, wait: Duration) -> Result<Option<usize>> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(remaining))?;
            match self.socket.recv_from(&mut self.scratch) {
                Ok((n, from)) if from.ip() == self.board.ip() => return Ok(Some(n)),
                Ok((_, from)) => trace!("Ignoring datagram from {from}"),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn transact(&mut self, req: Request) -> Result<u32> {
        let packet = req.encode();
        for attempt in 0..=self.retries {
            if attempt > 0 {
                warn!(
                    "No response to {:?} {:#06x} (seq {}), resending ({attempt}/{})",
                    req.op, req.addr, req.seq, self.retries
                );
            }
            self.socket.send_to(&packet, self.board)?;

            let deadline = Instant::now() + self.timeout;
            loop {
                let wait = deadline.saturating_duration_since(Instant::now());
                let Some(n) = self.recv(wait)? else {
                    break;
                };
                let datagram = &self.scratch[..n];
                if protocol::is_event_data(datagram) {
                    self.pending.push_back(Bytes::copy_from_slice(datagram));
                    continue;
                }
                let resp = Response::decode(datagram)?;
                if is_stale(req.seq, resp.seq) {
                    // Late answer to an earlier or resent request.
                    debug!("Discarding stale response seq {}", resp.seq);
                    continue;
                }
                return resp.check(&req);
            }
        }
        let total = self.timeout * (self.retries + 1);
        Err(AsocError::Timeout {
            duration_ms: u64::try_from(total.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

/// Whether `got` answers a request sent before `sent`.
///
/// Sequence numbers wrap, so anything up to half the range behind counts as
/// stale. A response from ahead of `sent` is not stale.
fn is_stale(sent: u16, got: u16) -> bool {
    let behind = sent.wrapping_sub(got);
    behind != 0 && behind < 0x8000
}

impl BoardBackend for UdpBackend {
    fn init(config: &AsocConfig) -> Result<Self> {
        let board = config
            .connection
            .board
            .ok_or_else(|| AsocError::config("udp backend needs connection.board"))?;
        let host = config
            .connection
            .host
            .ok_or_else(|| AsocError::config("udp backend needs connection.host"))?;
        Self::connect(host, board, config.connection.timeout, config.connection.retries)
    }

    fn read_register(&mut self, addr: u16) -> Result<u32> {
        let seq = self.next_seq();
        let value = self.transact(Request::read(seq, addr))?;
        trace!("UDP read  {addr:#06x} -> {value:#010x}");
        Ok(value)
    }

    fn write_register(&mut self, addr: u16, value: u32) -> Result<()> {
        let seq = self.next_seq();
        self.transact(Request::write(seq, addr, value))?;
        trace!("UDP write {addr:#06x} <- {value:#010x}");
        Ok(())
    }

    fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending.is_empty() {
            let Some(n) = self.recv(DATA_POLL)? else {
                return Ok(0);
            };
            let datagram = &self.scratch[..n];
            if !protocol::is_event_data(datagram) {
                debug!("Dropping unsolicited {n}-byte control datagram");
                return Ok(0);
            }
            self.pending.push_back(Bytes::copy_from_slice(datagram));
        }

        let Some(front) = self.pending.front_mut() else {
            return Ok(0);
        };
        let n = front.len().min(buf.len());
        buf[..n].copy_from_slice(&front.split_to(n));
        if front.is_empty() {
            self.pending.pop_front();
        }
        Ok(n)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Udp
    }

    fn is_ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Board that answers `count` requests, echoing writes and returning the
    /// address as the value of reads. Sends `data` before each answer.
    fn fake_board(count: usize, data: Option<Vec<u8>>, drop_first: bool) -> (SocketAddr, thread::JoinHandle<()>) {
        let sock = UdpSocket::bind(loopback()).unwrap();
        let addr = sock.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let mut dropped = !drop_first;
            let mut answered = 0;
            while answered < count {
                let (n, from) = sock.recv_from(&mut buf).unwrap();
                let req = Request::decode(&buf[..n]).unwrap();
                if !dropped {
                    dropped = true;
                    continue;
                }
                if let Some(d) = &data {
                    sock.send_to(d, from).unwrap();
                }
                let value = match req.op {
                    protocol::Op::Read => u32::from(req.addr),
                    protocol::Op::Write => req.value,
                };
                sock.send_to(&Response::ok(&req, value).encode(), from).unwrap();
                answered += 1;
            }
        });
        (addr, handle)
    }

    #[test]
    fn register_round_trip_over_loopback() {
        let (board, handle) = fake_board(2, None, false);
        let mut be =
            UdpBackend::connect(loopback(), board, Duration::from_millis(500), 0).unwrap();
        be.write_register(0x10, 1234).unwrap();
        assert_eq!(be.read_register(0x0D).unwrap(), 0x0D);
        handle.join().unwrap();
    }

    #[test]
    fn lost_request_is_resent() {
        let (board, handle) = fake_board(1, None, true);
        let mut be =
            UdpBackend::connect(loopback(), board, Duration::from_millis(100), 2).unwrap();
        assert_eq!(be.read_register(0x02).unwrap(), 0x02);
        handle.join().unwrap();
    }

    /// Board that answers one request with a response per entry of
    /// `offsets`, each carrying the request's seq shifted by that offset.
    fn skewed_board(offsets: Vec<i16>) -> (SocketAddr, thread::JoinHandle<()>) {
        let sock = UdpSocket::bind(loopback()).unwrap();
        let addr = sock.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (n, from) = sock.recv_from(&mut buf).unwrap();
            let req = Request::decode(&buf[..n]).unwrap();
            for offset in offsets {
                let resp = Response {
                    seq: req.seq.wrapping_add_signed(offset),
                    ..Response::ok(&req, 0xAB)
                };
                sock.send_to(&resp.encode(), from).unwrap();
            }
        });
        (addr, handle)
    }

    #[test]
    fn stale_response_is_skipped() {
        let (board, handle) = skewed_board(vec![-1, -3, 0]);
        let mut be =
            UdpBackend::connect(loopback(), board, Duration::from_millis(500), 0).unwrap();
        assert_eq!(be.read_register(0x04).unwrap(), 0xAB);
        handle.join().unwrap();
    }

    #[test]
    fn response_from_the_future_is_a_protocol_error() {
        let (board, handle) = skewed_board(vec![5]);
        let mut be =
            UdpBackend::connect(loopback(), board, Duration::from_millis(500), 0).unwrap();
        let err = be.read_register(0x04).unwrap_err();
        assert!(matches!(err, AsocError::Protocol { .. }), "{err}");
        assert!(err.to_string().contains("sequence mismatch"));
        handle.join().unwrap();
    }

    #[test]
    fn staleness_wraps_around() {
        assert!(is_stale(1, 0));
        assert!(is_stale(0, u16::MAX));
        assert!(is_stale(3, 0x8004));
        assert!(!is_stale(7, 7));
        assert!(!is_stale(7, 8));
        assert!(!is_stale(u16::MAX, 0));
    }

    #[test]
    fn silent_board_times_out() {
        let silent = UdpSocket::bind(loopback()).unwrap();
        let mut be = UdpBackend::connect(
            loopback(),
            silent.local_addr().unwrap(),
            Duration::from_millis(20),
            1,
        )
        .unwrap();
        let err = be.read_register(0x00).unwrap_err();
        assert!(matches!(err, AsocError::Timeout { duration_ms: 40 }));
    }

    #[test]
    fn interleaved_event_data_is_queued() {
        let frame = b"EV\x01\x00payload".to_vec();
        let (board, handle) = fake_board(1, Some(frame.clone()), false);
        let mut be =
            UdpBackend::connect(loopback(), board, Duration::from_millis(500), 0).unwrap();
        be.read_register(0x02).unwrap();
        handle.join().unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(be.read_data(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"EV\x01\x00");
        let mut rest = [0u8; 64];
        let n = be.read_data(&mut rest).unwrap();
        assert_eq!(&rest[..n], b"payload");
        assert_eq!(be.read_data(&mut rest).unwrap(), 0);
    }
}
