// RFC 6455 WebSocket framing
//
// Incremental frame parser (Header -> ExtendedLength -> MaskingKey ->
// Payload), fragmented-message reassembly, client-side unmasking, and the
// server handshake accept-key computation. Control frames surface as
// individual messages; data frames accumulate until a FIN frame completes
// the message.

use crate::buffer::ByteBuffer;
use crate::error::{GatewayError, Result};
use crate::id::{ConnectionId, IdGenerator};
use crate::network::ConnectionKind;
use crate::protocol::message::{Message, MessageDetail, MessageKind};
use crate::protocol::MAX_MESSAGE_SIZE;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};
use std::sync::Arc;

/// Frame opcodes defined by RFC 6455.
pub mod opcode {
    pub const CONTINUATION: u8 = 0x0;
    pub const TEXT: u8 = 0x1;
    pub const BINARY: u8 = 0x2;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xA;
}

/// GUID appended to the client key when computing `Sec-WebSocket-Accept`.
pub const HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(HANDSHAKE_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Encode a server-to-client frame. Server frames are never masked.
pub fn encode_frame(op: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(payload.len() + 10);
    let first = if fin { 0x80 | (op & 0x0F) } else { op & 0x0F };
    buf.put_u8(first);
    if payload.len() < 126 {
        buf.put_u8(payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        buf.put_u8(126);
        buf.put_u16(payload.len() as u16);
    } else {
        buf.put_u8(127);
        buf.put_u64(payload.len() as u64);
    }
    buf.put_slice(payload);
    buf.to_vec()
}

/// Encode a close frame with a status code and reason.
pub fn encode_close_frame(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    encode_frame(opcode::CLOSE, true, &payload)
}

fn is_control(op: u8) -> bool {
    op & 0x08 != 0
}

fn is_known(op: u8) -> bool {
    matches!(
        op,
        opcode::CONTINUATION | opcode::TEXT | opcode::BINARY | opcode::CLOSE | opcode::PING
            | opcode::PONG
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Header,
    ExtendedLength,
    MaskingKey,
    Payload,
}

/// Incremental RFC 6455 frame parser. One instance per connection; a
/// framing error poisons the instance until `reset`.
pub struct WebSocketParser {
    connection_id: ConnectionId,
    ids: Arc<IdGenerator>,
    state: ParseState,
    buf: ByteBuffer,
    // Current frame header fields
    fin: bool,
    frame_opcode: u8,
    masked: bool,
    length_code: u8,
    payload_len: u64,
    masking_key: [u8; 4],
    // Fragmented-message accumulation
    message_opcode: Option<u8>,
    message_payload: Vec<u8>,
    poisoned: bool,
}

impl WebSocketParser {
    pub fn new(connection_id: ConnectionId, ids: Arc<IdGenerator>) -> Self {
        Self {
            connection_id,
            ids,
            state: ParseState::Header,
            buf: ByteBuffer::new(),
            fin: false,
            frame_opcode: 0,
            masked: false,
            length_code: 0,
            payload_len: 0,
            masking_key: [0; 4],
            message_opcode: None,
            message_payload: Vec::new(),
            poisoned: false,
        }
    }

    /// Drop all intermediate state, including partial fragments.
    pub fn reset(&mut self) {
        self.state = ParseState::Header;
        self.buf.retrieve_all();
        self.message_opcode = None;
        self.message_payload.clear();
        self.poisoned = false;
    }

    /// Append freshly read bytes and collect the messages they complete.
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
                    let Some(head) = self.buf.peek(2) else { break };
                    let (b0, b1) = (head[0], head[1]);
                    self.buf.retrieve(2);

                    self.fin = b0 & 0x80 != 0;
                    self.frame_opcode = b0 & 0x0F;
                    self.masked = b1 & 0x80 != 0;
                    self.length_code = b1 & 0x7F;

                    if !is_known(self.frame_opcode) {
                        return self.fail(format!("unknown opcode {:#x}", self.frame_opcode));
                    }
                    if is_control(self.frame_opcode)
                        && (!self.fin || self.length_code > 125)
                    {
                        return self.fail("fragmented or oversized control frame".to_string());
                    }

                    if self.length_code >= 126 {
                        self.state = ParseState::ExtendedLength;
                    } else {
                        self.payload_len = self.length_code as u64;
                        self.state = self.after_length_state();
                    }
                }
                ParseState::ExtendedLength => {
                    if self.length_code == 126 {
                        let Some(raw) = self.buf.read(2) else { break };
                        self.payload_len = u16::from_be_bytes([raw[0], raw[1]]) as u64;
                    } else {
                        let Some(raw) = self.buf.read(8) else { break };
                        self.payload_len = u64::from_be_bytes([
                            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                        ]);
                    }
                    if self.payload_len > MAX_MESSAGE_SIZE as u64 {
                        return self.fail(format!("frame payload {} exceeds limit", self.payload_len));
                    }
                    self.state = self.after_length_state();
                }
                ParseState::MaskingKey => {
                    let Some(raw) = self.buf.read(4) else { break };
                    self.masking_key = [raw[0], raw[1], raw[2], raw[3]];
                    self.state = ParseState::Payload;
                }
                ParseState::Payload => {
                    let needed = self.payload_len as usize;
                    let Some(mut payload) = self.buf.read(needed) else { break };
                    if self.masked {
                        for (i, byte) in payload.iter_mut().enumerate() {
                            *byte ^= self.masking_key[i % 4];
                        }
                    }
                    if let Some(message) = self.complete_frame(payload)? {
                        messages.push(message);
                    }
                    self.state = ParseState::Header;
                }
            }
        }
        Ok(messages)
    }

    fn after_length_state(&self) -> ParseState {
        if self.masked {
            ParseState::MaskingKey
        } else {
            ParseState::Payload
        }
    }

    /// Finish one frame: control frames emit immediately, data frames
    /// accumulate until FIN.
    fn complete_frame(&mut self, payload: Vec<u8>) -> Result<Option<Message>> {
        if is_control(self.frame_opcode) {
            return Ok(Some(self.emit(self.frame_opcode, true, payload)));
        }

        match (self.frame_opcode, self.message_opcode) {
            (opcode::CONTINUATION, None) => {
                return self.fail("continuation frame without a pending message".to_string());
            }
            (opcode::CONTINUATION, Some(_)) => {}
            (op, Some(_)) => {
                return self.fail(format!(
                    "data frame {:#x} while a fragmented message is pending",
                    op
                ));
            }
            (op, None) => self.message_opcode = Some(op),
        }

        if self.message_payload.len() + payload.len() > MAX_MESSAGE_SIZE {
            return self.fail("fragmented message exceeds limit".to_string());
        }
        self.message_payload.extend_from_slice(&payload);

        if !self.fin {
            return Ok(None);
        }

        let op = self.message_opcode.take().expect("data frame recorded opcode");
        let body = std::mem::take(&mut self.message_payload);
        Ok(Some(self.emit(op, true, body)))
    }

    fn emit(&self, op: u8, fin: bool, payload: Vec<u8>) -> Message {
        let kind = if is_control(op) {
            MessageKind::Unrecognized(0)
        } else {
            MessageKind::from_payload_prefix(&payload)
        };
        Message::new(
            self.ids.next_message_id(),
            self.connection_id,
            ConnectionKind::WebSocket,
            kind,
            payload,
            MessageDetail::WebSocket { opcode: op, fin },
        )
    }

    fn fail<T>(&mut self, reason: String) -> Result<T> {
        self.poisoned = true;
        Err(GatewayError::Parse(reason))
    }
}
