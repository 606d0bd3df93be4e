// Framed-TCP wire protocol
//
// Frame layout, all integers network byte order:
//
//   total_length  u32   whole frame including this header
//   message_kind  u16   application message code
//   version       u8    currently 1
//   reserved      u8    zero on send, ignored on receive
//   payload       total_length - 8 bytes
//
// The parser is an incremental two-state machine (Header -> Body) that
// accepts arbitrarily chunked input and emits complete messages.

use crate::buffer::ByteBuffer;
use crate::error::{GatewayError, Result};
use crate::id::{ConnectionId, IdGenerator};
use crate::network::ConnectionKind;
use crate::protocol::message::{Message, MessageDetail, MessageKind};
use crate::protocol::MAX_MESSAGE_SIZE;
use bytes::{BufMut, BytesMut};
use std::sync::Arc;

/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 8;

/// Protocol version stamped on outgoing frames.
pub const PROTOCOL_VERSION: u8 = 1;

/// Decoded framed-TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFrameHeader {
    pub total_length: u32,
    pub message_kind: u16,
    pub version: u8,
    pub reserved: u8,
}

impl TcpFrameHeader {
    /// Build the header for an outgoing frame with the given payload size.
    pub fn for_payload(message_kind: u16, payload_len: usize) -> Self {
        Self {
            total_length: (HEADER_SIZE + payload_len) as u32,
            message_kind,
            version: PROTOCOL_VERSION,
            reserved: 0,
        }
    }

    /// Payload size implied by the header.
    pub fn body_length(&self) -> usize {
        self.total_length as usize - HEADER_SIZE
    }
}

/// Encode one outgoing frame.
pub fn encode_frame(message_kind: u16, payload: &[u8]) -> Vec<u8> {
    let header = TcpFrameHeader::for_payload(message_kind, payload.len());
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(header.total_length);
    buf.put_u16(header.message_kind);
    buf.put_u8(header.version);
    buf.put_u8(header.reserved);
    buf.put_slice(payload);
    buf.to_vec()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Header,
    Body,
}

/// Incremental parser for the framed-TCP protocol. One instance per
/// connection; a framing error poisons the instance until `reset`.
pub struct TcpParser {
    connection_id: ConnectionId,
    ids: Arc<IdGenerator>,
    state: ParseState,
    header: Option<TcpFrameHeader>,
    buf: ByteBuffer,
    expected_body_length: usize,
    poisoned: bool,
}

impl TcpParser {
    pub fn new(connection_id: ConnectionId, ids: Arc<IdGenerator>) -> Self {
        Self {
            connection_id,
            ids,
            state: ParseState::Header,
            header: None,
            buf: ByteBuffer::new(),
            expected_body_length: 0,
            poisoned: false,
        }
    }

    /// Drop all intermediate state, including buffered bytes.
    pub fn reset(&mut self) {
        self.state = ParseState::Header;
        self.header = None;
        self.buf.retrieve_all();
        self.expected_body_length = 0;
        self.poisoned = false;
    }

    /// Append freshly read bytes and collect every message completed by
    /// them. A framing error is fatal: the caller must close the
    /// connection, and only `reset` revives the parser.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        if self.poisoned {
            return Err(GatewayError::InvalidState(
                "parser poisoned by earlier framing error".to_string(),
            ));
        }
        self.buf.append(data);

        let mut messages = Vec::new();
        loop {
            match self.state {
                ParseState::Header => {
                    if self.buf.readable_bytes() < HEADER_SIZE {
                        break;
                    }
                    let raw = self.buf.read(HEADER_SIZE).expect("checked length");
                    let header = TcpFrameHeader {
                        total_length: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
                        message_kind: u16::from_be_bytes([raw[4], raw[5]]),
                        version: raw[6],
                        reserved: raw[7],
                    };
                    if (header.total_length as usize) < HEADER_SIZE {
                        self.poisoned = true;
                        return Err(GatewayError::Parse(format!(
                            "frame length {} below header size",
                            header.total_length
                        )));
                    }
                    if header.total_length as usize > MAX_MESSAGE_SIZE {
                        self.poisoned = true;
                        return Err(GatewayError::Parse(format!(
                            "frame length {} exceeds limit",
                            header.total_length
                        )));
                    }
                    self.expected_body_length = header.body_length();
                    self.header = Some(header);
                    self.state = ParseState::Body;
                }
                ParseState::Body => {
                    if self.buf.readable_bytes() < self.expected_body_length {
                        break;
                    }
                    let payload = self
                        .buf
                        .read(self.expected_body_length)
                        .expect("checked length");
                    let header = self.header.take().expect("header parsed before body");
                    messages.push(Message::new(
                        self.ids.next_message_id(),
                        self.connection_id,
                        ConnectionKind::Tcp,
                        MessageKind::from_code(header.message_kind),
                        payload,
                        MessageDetail::Tcp(header),
                    ));
                    self.expected_body_length = 0;
                    self.state = ParseState::Header;
                }
            }
        }
        Ok(messages)
    }
}
