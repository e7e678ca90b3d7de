//! Proxy PDU segmentation and reassembly
//!
//! Every proxy PDU starts with a header octet: the two high bits carry the
//! SAR field, the low six bits the message type. Messages larger than one
//! notification are split into first/continuation/last segments; each client
//! reassembles at most one inbound message at a time.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::time::Instant;

const SAR_COMPLETE: u8 = 0b00;
const SAR_FIRST: u8 = 0b01;
const SAR_CONTINUE: u8 = 0b10;
const SAR_LAST: u8 = 0b11;

const TYPE_MASK: u8 = 0x3F;

/// Proxy PDU message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    NetPdu,
    Beacon,
    Config,
    Prov,
}

impl MsgType {
    pub fn to_bits(self) -> u8 {
        match self {
            MsgType::NetPdu => 0x00,
            MsgType::Beacon => 0x01,
            MsgType::Config => 0x02,
            MsgType::Prov => 0x03,
        }
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x00 => Some(MsgType::NetPdu),
            0x01 => Some(MsgType::Beacon),
            0x02 => Some(MsgType::Config),
            0x03 => Some(MsgType::Prov),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SarError {
    #[error("Empty proxy PDU")]
    Empty,

    #[error("Complete PDU while a pending incomplete one")]
    UnexpectedComplete,

    #[error("First PDU while a pending incomplete one")]
    UnexpectedFirst,

    #[error("Continuation with no prior data")]
    UnexpectedContinuation,

    #[error("Unexpected message type in segment ({got:#04x} != {expected:#04x})")]
    TypeMismatch { expected: u8, got: u8 },

    #[error("Too big proxy PDU (capacity {capacity} bytes)")]
    Overflow { capacity: usize },

    #[error("MTU too small for proxy PDUs ({0} bytes)")]
    MtuTooSmall(usize),
}

fn header(sar: u8, msg_type: u8) -> u8 {
    (sar << 6) | (msg_type & TYPE_MASK)
}

/// Per-client receive state: one buffer and one SAR deadline.
#[derive(Debug, Clone)]
pub struct Reassembler {
    buf: BytesMut,
    msg_type: u8,
    capacity: usize,
    pending: bool,
    deadline: Option<Instant>,
}

impl Reassembler {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            msg_type: 0,
            capacity,
            pending: false,
            deadline: None,
        }
    }

    /// Drop any partial message and disarm the timer.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pending = false;
        self.deadline = None;
    }

    /// A first segment has arrived and its last one has not.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// When the partial message times out, if one is in flight.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Feed one written proxy PDU. Returns the message type bits and payload
    /// once a message is complete.
    pub fn recv(
        &mut self,
        pdu: &[u8],
        now: Instant,
        timeout: Duration,
    ) -> Result<Option<(u8, Bytes)>, SarError> {
        let (&hdr, data) = pdu.split_first().ok_or(SarError::Empty)?;
        let sar = hdr >> 6;
        let msg_type = hdr & TYPE_MASK;

        match sar {
            SAR_COMPLETE => {
                if self.is_pending() {
                    return Err(SarError::UnexpectedComplete);
                }
                self.check_room(data.len())?;
                Ok(Some((msg_type, Bytes::copy_from_slice(data))))
            }
            SAR_FIRST => {
                if self.is_pending() {
                    return Err(SarError::UnexpectedFirst);
                }
                self.check_room(data.len())?;
                self.deadline = Some(now + timeout);
                self.msg_type = msg_type;
                self.pending = true;
                self.buf.extend_from_slice(data);
                Ok(None)
            }
            // SAR_CONTINUE or SAR_LAST
            _ => {
                if !self.is_pending() {
                    return Err(SarError::UnexpectedContinuation);
                }
                if self.msg_type != msg_type {
                    return Err(SarError::TypeMismatch {
                        expected: self.msg_type,
                        got: msg_type,
                    });
                }
                if let Err(e) = self.check_room(self.buf.len() + data.len()) {
                    self.reset();
                    return Err(e);
                }
                self.buf.extend_from_slice(data);

                if sar == SAR_CONTINUE {
                    self.deadline = Some(now + timeout);
                    return Ok(None);
                }

                self.pending = false;
                self.deadline = None;
                let msg = self.buf.split().freeze();
                Ok(Some((self.msg_type, msg)))
            }
        }
    }

    fn check_room(&self, len: usize) -> Result<(), SarError> {
        if len > self.capacity {
            return Err(SarError::Overflow {
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

/// Split a message into proxy PDUs of at most `max_len` bytes each.
///
/// Consumes `buf`, carving each segment's payload off its front.
pub fn segment(msg_type: MsgType, mut buf: BytesMut, max_len: usize) -> Result<Vec<Bytes>, SarError> {
    if max_len < 2 {
        return Err(SarError::MtuTooSmall(max_len));
    }
    let ty = msg_type.to_bits();
    let chunk = max_len - 1;

    if buf.len() <= chunk {
        return Ok(vec![with_header(header(SAR_COMPLETE, ty), &buf)]);
    }

    let mut segments = Vec::with_capacity(buf.len() / chunk + 1);
    let first = buf.split_to(chunk);
    segments.push(with_header(header(SAR_FIRST, ty), &first));

    while buf.len() > chunk {
        let cont = buf.split_to(chunk);
        segments.push(with_header(header(SAR_CONTINUE, ty), &cont));
    }
    segments.push(with_header(header(SAR_LAST, ty), &buf));

    Ok(segments)
}

fn with_header(hdr: u8, data: &[u8]) -> Bytes {
    let mut seg = BytesMut::with_capacity(data.len() + 1);
    seg.put_u8(hdr);
    seg.extend_from_slice(data);
    seg.freeze()
}
