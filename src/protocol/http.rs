// HTTP/1.1 message framing
//
// Incremental parser for requests and responses: start line, headers
// (names lowercased, values trimmed), then a fixed-length body, a chunked
// body, or no body. Emits one message per complete HTTP message and keeps
// the unconsumed tail for pipelined traffic.

use crate::buffer::ByteBuffer;
use crate::error::{GatewayError, Result};
use crate::id::{ConnectionId, IdGenerator};
use crate::network::ConnectionKind;
use crate::protocol::message::{Message, MessageDetail, MessageKind};
use crate::protocol::MAX_MESSAGE_SIZE;
use std::collections::HashMap;
use std::sync::Arc;

/// Longest accepted start line or header block.
const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    StartLine,
    Headers,
    FixedBody,
    ChunkSize,
    ChunkData,
    ChunkTrailer,
}

#[derive(Debug, Clone)]
enum StartLine {
    Request {
        method: String,
        url: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
}

/// Incremental HTTP/1.1 parser. One instance per connection; a framing
/// error poisons the instance until `reset`.
pub struct HttpParser {
    connection_id: ConnectionId,
    ids: Arc<IdGenerator>,
    state: ParseState,
    buf: ByteBuffer,
    start_line: Option<StartLine>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    content_length: usize,
    chunk_remaining: usize,
    poisoned: bool,
}

impl HttpParser {
    pub fn new(connection_id: ConnectionId, ids: Arc<IdGenerator>) -> Self {
        Self {
            connection_id,
            ids,
            state: ParseState::StartLine,
            buf: ByteBuffer::new(),
            start_line: None,
            headers: HashMap::new(),
            body: Vec::new(),
            content_length: 0,
            chunk_remaining: 0,
            poisoned: false,
        }
    }

    /// Drop all intermediate state, including buffered bytes.
    pub fn reset(&mut self) {
        self.state = ParseState::StartLine;
        self.buf.retrieve_all();
        self.start_line = None;
        self.headers.clear();
        self.body.clear();
        self.content_length = 0;
        self.chunk_remaining = 0;
        self.poisoned = false;
    }

    /// Append freshly read bytes and collect every message completed by
    /// them.
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
                ParseState::StartLine => {
                    let Some(line) = self.take_line()? else { break };
                    if line.is_empty() {
                        // Tolerate stray CRLF between pipelined messages.
                        continue;
                    }
                    self.start_line = Some(self.parse_start_line(&line)?);
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(line) = self.take_line()? else { break };
                    if line.is_empty() {
                        self.state = self.body_state()?;
                        if self.state == ParseState::StartLine {
                            // No body at all.
                            messages.push(self.emit());
                        }
                        continue;
                    }
                    if let Some(colon) = line.find(':') {
                        let name = line[..colon].trim().to_ascii_lowercase();
                        let value = line[colon + 1..].trim().to_string();
                        self.headers.insert(name, value);
                    }
                    // Lines without a colon are ignored, as upstream proxies
                    // occasionally emit stray continuation junk.
                }
                ParseState::FixedBody => {
                    let Some(body) = self.buf.read(self.content_length) else { break };
                    self.body = body;
                    messages.push(self.emit());
                }
                ParseState::ChunkSize => {
                    let Some(line) = self.take_line()? else { break };
                    let size_token = line.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_token, 16).map_err(|_| {
                        self.poisoned = true;
                        GatewayError::Parse(format!("malformed chunk size {:?}", size_token))
                    })?;
                    if self.body.len() + size > MAX_MESSAGE_SIZE {
                        return self.fail("chunked body exceeds limit".to_string());
                    }
                    if size == 0 {
                        self.state = ParseState::ChunkTrailer;
                    } else {
                        self.chunk_remaining = size;
                        self.state = ParseState::ChunkData;
                    }
                }
                ParseState::ChunkData => {
                    // Chunk data plus its trailing CRLF.
                    let Some(raw) = self.buf.read(self.chunk_remaining + 2) else { break };
                    if &raw[self.chunk_remaining..] != b"\r\n" {
                        return self.fail("chunk data not terminated by CRLF".to_string());
                    }
                    self.body.extend_from_slice(&raw[..self.chunk_remaining]);
                    self.chunk_remaining = 0;
                    self.state = ParseState::ChunkSize;
                }
                ParseState::ChunkTrailer => {
                    let Some(line) = self.take_line()? else { break };
                    if line.is_empty() {
                        messages.push(self.emit());
                    }
                    // Non-empty trailer headers are consumed and dropped.
                }
            }
        }
        Ok(messages)
    }

    /// Consume one CRLF-terminated line, or `None` if incomplete.
    fn take_line(&mut self) -> Result<Option<String>> {
        let data = self.buf.peek_all();
        let Some(pos) = data.windows(2).position(|w| w == b"\r\n") else {
            if data.len() > MAX_HEAD_SIZE {
                return self.fail("header section exceeds limit".to_string());
            }
            return Ok(None);
        };
        let line = String::from_utf8_lossy(&data[..pos]).into_owned();
        self.buf.retrieve(pos + 2);
        Ok(Some(line))
    }

    /// Classify the start line as request or response by the position of
    /// the HTTP-version token.
    fn parse_start_line(&mut self, line: &str) -> Result<StartLine> {
        let mut parts = line.splitn(3, ' ');
        let first = parts.next().unwrap_or("");
        let second = parts.next().unwrap_or("");
        let third = parts.next().unwrap_or("");

        if first.starts_with("HTTP/") {
            let status = second.parse::<u16>().map_err(|_| {
                self.poisoned = true;
                GatewayError::Parse(format!("invalid HTTP status {:?}", second))
            })?;
            Ok(StartLine::Response {
                version: first.to_string(),
                status,
                reason: third.to_string(),
            })
        } else if third.starts_with("HTTP/") {
            Ok(StartLine::Request {
                method: first.to_string(),
                url: second.to_string(),
                version: third.to_string(),
            })
        } else {
            self.fail(format!("malformed start line {:?}", line))
        }
    }

    /// Pick the body framing from the parsed headers. Returns `StartLine`
    /// when there is no body, which completes the message immediately.
    fn body_state(&mut self) -> Result<ParseState> {
        if let Some(value) = self.headers.get("content-length") {
            let length = value.parse::<usize>().map_err(|_| {
                self.poisoned = true;
                GatewayError::Parse(format!("invalid content-length {:?}", value))
            })?;
            if length > MAX_MESSAGE_SIZE {
                return self.fail("content-length exceeds limit".to_string());
            }
            self.content_length = length;
            if length == 0 {
                return Ok(ParseState::StartLine);
            }
            return Ok(ParseState::FixedBody);
        }
        if let Some(value) = self.headers.get("transfer-encoding") {
            if value.to_ascii_lowercase().contains("chunked") {
                return Ok(ParseState::ChunkSize);
            }
        }
        Ok(ParseState::StartLine)
    }

    /// Build the message from the accumulated parts and rearm for the next
    /// one. The unconsumed buffer tail is preserved.
    fn emit(&mut self) -> Message {
        let detail = match self.start_line.take().expect("start line parsed before emit") {
            StartLine::Request {
                method,
                url,
                version,
            } => MessageDetail::HttpRequest {
                method,
                url,
                version,
                headers: std::mem::take(&mut self.headers),
            },
            StartLine::Response {
                version,
                status,
                reason,
            } => MessageDetail::HttpResponse {
                version,
                status,
                reason,
                headers: std::mem::take(&mut self.headers),
            },
        };
        let body = std::mem::take(&mut self.body);
        self.content_length = 0;
        self.chunk_remaining = 0;
        self.state = ParseState::StartLine;
        Message::new(
            self.ids.next_message_id(),
            self.connection_id,
            ConnectionKind::Http,
            MessageKind::Unrecognized(0),
            body,
            detail,
        )
    }

    fn fail<T>(&mut self, reason: String) -> Result<T> {
        self.poisoned = true;
        Err(GatewayError::Parse(reason))
    }
}
