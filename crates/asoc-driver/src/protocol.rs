//! Register access framing on the UDP control link.
//!
//! ```text
//! request  (host → board, 10 bytes, big-endian)
//!   0xA5 | op u8 | seq u16 | addr u16 | value u32
//! response (board → host, 10 bytes, big-endian)
//!   0x5A | status u8 | seq u16 | addr u16 | value u32
//! ```
//!
//! `op` is 1 for read and 2 for write; reads carry a zero value. A response
//! echoes the sequence number and address of the request it answers.
//! Datagrams starting with the event magic (`b"EV"`) share the socket and are
//! routed to the data path instead.

use crate::error::{AsocError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Request magic byte.
pub const REQUEST_MAGIC: u8 = 0xA5;
/// Response magic byte.
pub const RESPONSE_MAGIC: u8 = 0x5A;
/// Size of requests and responses.
pub const PACKET_LEN: usize = 10;

/// Register operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Read a register
    Read,
    /// Write a register
    Write,
}

impl Op {
    const fn code(self) -> u8 {
        match self {
            Self::Read => 1,
            Self::Write => 2,
        }
    }

    const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            _ => None,
        }
    }
}

/// Response status reported by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation performed
    Ok,
    /// Address not decoded by the controller
    BadAddress,
    /// Unknown operation code
    BadOp,
}

impl Status {
    const fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::BadAddress => 1,
            Self::BadOp => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Ok),
            1 => Ok(Self::BadAddress),
            2 => Ok(Self::BadOp),
            other => Err(AsocError::protocol(format!("unknown response status {other}"))),
        }
    }
}

/// Register request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Operation
    pub op: Op,
    /// Sequence number, echoed by the response
    pub seq: u16,
    /// Register address
    pub addr: u16,
    /// Value to write (zero for reads)
    pub value: u32,
}

impl Request {
    /// Read request.
    #[must_use]
    pub const fn read(seq: u16, addr: u16) -> Self {
        Self { op: Op::Read, seq, addr, value: 0 }
    }

    /// Write request.
    #[must_use]
    pub const fn write(seq: u16, addr: u16, value: u32) -> Self {
        Self { op: Op::Write, seq, addr, value }
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_LEN);
        buf.put_u8(REQUEST_MAGIC);
        buf.put_u8(self.op.code());
        buf.put_u16(self.seq);
        buf.put_u16(self.addr);
        buf.put_u32(self.value);
        buf.freeze()
    }

    /// Decode a request. Used by board-side emulators.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on short input, wrong magic, or unknown op.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PACKET_LEN {
            return Err(AsocError::protocol(format!(
                "request too short: {} bytes",
                bytes.len()
            )));
        }
        let magic = bytes.get_u8();
        if magic != REQUEST_MAGIC {
            return Err(AsocError::protocol(format!("bad request magic {magic:#04x}")));
        }
        let code = bytes.get_u8();
        let op = Op::from_code(code)
            .ok_or_else(|| AsocError::protocol(format!("unknown op {code}")))?;
        Ok(Self {
            op,
            seq: bytes.get_u16(),
            addr: bytes.get_u16(),
            value: bytes.get_u32(),
        })
    }
}

/// Register response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Board status for the operation
    pub status: Status,
    /// Sequence number of the answered request
    pub seq: u16,
    /// Register address of the answered request
    pub addr: u16,
    /// Register value (read result, or value written)
    pub value: u32,
}

impl Response {
    /// Build a successful response to `req`.
    #[must_use]
    pub const fn ok(req: &Request, value: u32) -> Self {
        Self { status: Status::Ok, seq: req.seq, addr: req.addr, value }
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PACKET_LEN);
        buf.put_u8(RESPONSE_MAGIC);
        buf.put_u8(self.status.code());
        buf.put_u16(self.seq);
        buf.put_u16(self.addr);
        buf.put_u32(self.value);
        buf.freeze()
    }

    /// Decode a response.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on short input, wrong magic, or unknown status.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PACKET_LEN {
            return Err(AsocError::protocol(format!(
                "response too short: {} bytes",
                bytes.len()
            )));
        }
        let magic = bytes.get_u8();
        if magic != RESPONSE_MAGIC {
            return Err(AsocError::protocol(format!("bad response magic {magic:#04x}")));
        }
        let status = Status::from_code(bytes.get_u8())?;
        Ok(Self {
            status,
            seq: bytes.get_u16(),
            addr: bytes.get_u16(),
            value: bytes.get_u32(),
        })
    }

    /// Check that this response answers `req` and reports success.
    ///
    /// # Errors
    ///
    /// Protocol error on sequence/address mismatch, hardware error on a
    /// non-OK status.
    pub fn check(&self, req: &Request) -> Result<u32> {
        if self.seq != req.seq {
            return Err(AsocError::protocol(format!(
                "sequence mismatch: sent {}, got {}",
                req.seq, self.seq
            )));
        }
        if self.addr != req.addr {
            return Err(AsocError::protocol(format!(
                "address mismatch: sent {:#06x}, got {:#06x}",
                req.addr, self.addr
            )));
        }
        match self.status {
            Status::Ok => Ok(self.value),
            Status::BadAddress => Err(AsocError::hardware(format!(
                "register {:#06x} not decoded by board",
                req.addr
            ))),
            Status::BadOp => Err(AsocError::hardware("board rejected operation")),
        }
    }
}

/// Whether a datagram carries event data rather than a register response.
#[must_use]
pub fn is_event_data(datagram: &[u8]) -> bool {
    datagram.len() >= 2 && datagram[0..2] == asoc_chip::event::MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_request_layout() {
        let bytes = Request::write(0x0102, 0x0010, 0xDEAD_BEEF).encode();
        assert_eq!(
            bytes.as_ref(),
            &[0xA5, 2, 0x01, 0x02, 0x00, 0x10, 0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn request_decodes_what_board_receives() {
        let req = Request::read(7, 0x02);
        assert_eq!(Request::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn response_must_answer_request() {
        let req = Request::read(5, 0x02);
        let resp = Response::ok(&Request::read(6, 0x02), 1);
        assert!(matches!(resp.check(&req), Err(AsocError::Protocol { .. })));

        let resp = Response::ok(&Request::read(5, 0x03), 1);
        assert!(matches!(resp.check(&req), Err(AsocError::Protocol { .. })));

        let resp = Response::ok(&req, 0x55);
        assert_eq!(resp.check(&req).unwrap(), 0x55);
    }

    #[test]
    fn bad_address_is_hardware_error() {
        let req = Request::write(1, 0x7FFF, 0);
        let resp = Response { status: Status::BadAddress, ..Response::ok(&req, 0) };
        let decoded = Response::decode(&resp.encode()).unwrap();
        assert!(matches!(decoded.check(&req), Err(AsocError::Hardware { .. })));
    }

    #[test]
    fn short_and_foreign_packets_rejected() {
        assert!(Response::decode(&[0x5A, 0, 0]).is_err());
        let mut bytes = Request::read(1, 1).encode().to_vec();
        assert!(Response::decode(&bytes).is_err());
        bytes[1] = 9;
        assert!(Request::decode(&bytes).is_err());
    }

    #[test]
    fn event_datagrams_are_recognised() {
        assert!(is_event_data(b"EV\x01\x04"));
        assert!(!is_event_data(&Request::read(0, 0).encode()));
        assert!(!is_event_data(b"E"));
    }
}
