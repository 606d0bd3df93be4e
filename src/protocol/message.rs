// Uniform message envelope produced by the parsers
//
// One envelope type carries the fields every protocol shares; the
// per-protocol headers live in a tagged `MessageDetail` variant.
// `serialize` is the inverse of parsing: the produced bytes are acceptable
// to a peer speaking the same protocol.

use crate::error::{GatewayError, Result};
use crate::id::{ConnectionId, MessageId};
use crate::network::ConnectionKind;
use crate::protocol::{tcp, websocket};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::fmt;

/// Application-level message codes carried by the wire protocols.
///
/// The set is closed at the protocol level; codes outside it are legal on
/// the transport and surface as `Unrecognized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    LoginRequest,
    LoginResponse,
    LogoutRequest,
    LogoutResponse,
    RegisterRequest,
    RegisterResponse,
    ChatRequest,
    GroupChatRequest,
    MessageAck,
    UserStatusUpdate,
    SessionListRequest,
    SessionListResponse,
    MessageHistoryRequest,
    MessageHistoryResponse,
    ErrorResponse,
    HeartbeatRequest,
    HeartbeatResponse,
    Unrecognized(u16),
}

impl MessageKind {
    /// Map a wire code to its kind. Unknown codes map to `Unrecognized`.
    pub fn from_code(code: u16) -> Self {
        match code {
            1001 => MessageKind::LoginRequest,
            1002 => MessageKind::LoginResponse,
            1003 => MessageKind::LogoutRequest,
            1004 => MessageKind::LogoutResponse,
            1005 => MessageKind::RegisterRequest,
            1006 => MessageKind::RegisterResponse,
            2001 => MessageKind::ChatRequest,
            2002 => MessageKind::GroupChatRequest,
            2003 => MessageKind::MessageAck,
            3001 => MessageKind::UserStatusUpdate,
            3002 => MessageKind::SessionListRequest,
            3003 => MessageKind::SessionListResponse,
            3004 => MessageKind::MessageHistoryRequest,
            3005 => MessageKind::MessageHistoryResponse,
            9001 => MessageKind::ErrorResponse,
            9002 => MessageKind::HeartbeatRequest,
            9003 => MessageKind::HeartbeatResponse,
            other => MessageKind::Unrecognized(other),
        }
    }

    /// The wire code for this kind.
    pub fn code(&self) -> u16 {
        match self {
            MessageKind::LoginRequest => 1001,
            MessageKind::LoginResponse => 1002,
            MessageKind::LogoutRequest => 1003,
            MessageKind::LogoutResponse => 1004,
            MessageKind::RegisterRequest => 1005,
            MessageKind::RegisterResponse => 1006,
            MessageKind::ChatRequest => 2001,
            MessageKind::GroupChatRequest => 2002,
            MessageKind::MessageAck => 2003,
            MessageKind::UserStatusUpdate => 3001,
            MessageKind::SessionListRequest => 3002,
            MessageKind::SessionListResponse => 3003,
            MessageKind::MessageHistoryRequest => 3004,
            MessageKind::MessageHistoryResponse => 3005,
            MessageKind::ErrorResponse => 9001,
            MessageKind::HeartbeatRequest => 9002,
            MessageKind::HeartbeatResponse => 9003,
            MessageKind::Unrecognized(code) => *code,
        }
    }

    /// Whether the code belongs to the known application set.
    pub fn is_recognized(&self) -> bool {
        !matches!(self, MessageKind::Unrecognized(_))
    }

    /// Derive a kind from the first two payload bytes (big endian), used by
    /// transports whose framing carries no application code.
    pub fn from_payload_prefix(payload: &[u8]) -> Self {
        if payload.len() >= 2 {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let kind = MessageKind::from_code(code);
            if kind.is_recognized() {
                return kind;
            }
        }
        MessageKind::Unrecognized(0)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Unrecognized(code) => write!(f, "Unrecognized({})", code),
            other => write!(f, "{:?}({})", other, other.code()),
        }
    }
}

/// Per-protocol header block attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDetail {
    /// Framed-TCP envelope header.
    Tcp(tcp::TcpFrameHeader),
    /// WebSocket data frame metadata.
    WebSocket { opcode: u8, fin: bool },
    /// Parsed HTTP request line and headers.
    HttpRequest {
        method: String,
        url: String,
        version: String,
        headers: HashMap<String, String>,
    },
    /// Parsed HTTP status line and headers.
    HttpResponse {
        version: String,
        status: u16,
        reason: String,
        headers: HashMap<String, String>,
    },
}

/// The uniform in-process message envelope.
#[derive(Debug, Clone)]
pub struct Message {
    key: String,
    message_id: MessageId,
    connection_id: ConnectionId,
    connection_kind: ConnectionKind,
    kind: MessageKind,
    payload: Vec<u8>,
    detail: MessageDetail,
}

impl Message {
    pub fn new(
        message_id: MessageId,
        connection_id: ConnectionId,
        connection_kind: ConnectionKind,
        kind: MessageKind,
        payload: Vec<u8>,
        detail: MessageDetail,
    ) -> Self {
        let key = format!("{}_{}_{}", message_id, kind.code(), connection_id);
        Self {
            key,
            message_id,
            connection_id,
            connection_kind,
            kind,
            payload,
            detail,
        }
    }

    /// Diagnostic key: `<message_id>_<kind-code>_<connection_id>`.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn connection_kind(&self) -> ConnectionKind {
        self.connection_kind
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn detail(&self) -> &MessageDetail {
        &self.detail
    }

    /// Framed-TCP header, if this message arrived on a TCP connection.
    pub fn tcp_header(&self) -> Option<&tcp::TcpFrameHeader> {
        match &self.detail {
            MessageDetail::Tcp(header) => Some(header),
            _ => None,
        }
    }

    /// WebSocket opcode, if this message arrived on a WebSocket connection.
    pub fn ws_opcode(&self) -> Option<u8> {
        match &self.detail {
            MessageDetail::WebSocket { opcode, .. } => Some(*opcode),
            _ => None,
        }
    }

    /// WebSocket FIN flag.
    pub fn ws_fin(&self) -> Option<bool> {
        match &self.detail {
            MessageDetail::WebSocket { fin, .. } => Some(*fin),
            _ => None,
        }
    }

    /// HTTP request method, if this is a request message.
    pub fn http_method(&self) -> Option<&str> {
        match &self.detail {
            MessageDetail::HttpRequest { method, .. } => Some(method),
            _ => None,
        }
    }

    /// HTTP request URL, if this is a request message.
    pub fn http_url(&self) -> Option<&str> {
        match &self.detail {
            MessageDetail::HttpRequest { url, .. } => Some(url),
            _ => None,
        }
    }

    /// HTTP response status, if this is a response message.
    pub fn http_status(&self) -> Option<u16> {
        match &self.detail {
            MessageDetail::HttpResponse { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// HTTP header map, for either direction.
    pub fn http_headers(&self) -> Option<&HashMap<String, String>> {
        match &self.detail {
            MessageDetail::HttpRequest { headers, .. } => Some(headers),
            MessageDetail::HttpResponse { headers, .. } => Some(headers),
            _ => None,
        }
    }

    /// Serialize the message into bytes a peer of the same protocol accepts.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        match &self.detail {
            MessageDetail::Tcp(header) => {
                Ok(tcp::encode_frame(header.message_kind, &self.payload))
            }
            MessageDetail::WebSocket { opcode, fin } => {
                Ok(websocket::encode_frame(*opcode, *fin, &self.payload))
            }
            MessageDetail::HttpRequest {
                method,
                url,
                version,
                headers,
            } => {
                let start_line = format!("{} {} {}", method, url, version);
                Ok(encode_http(&start_line, headers, &self.payload))
            }
            MessageDetail::HttpResponse {
                version,
                status,
                reason,
                headers,
            } => {
                if *status < 100 {
                    return Err(GatewayError::Serialization(format!(
                        "invalid HTTP status {}",
                        status
                    )));
                }
                let start_line = format!("{} {} {}", version, status, reason);
                Ok(encode_http(&start_line, headers, &self.payload))
            }
        }
    }
}

fn encode_http(start_line: &str, headers: &HashMap<String, String>, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(start_line.len() + 64 + body.len());
    buf.put_slice(start_line.as_bytes());
    buf.put_slice(b"\r\n");
    for (name, value) in headers {
        if name == "content-length" {
            continue;
        }
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    if !body.is_empty() || headers.contains_key("content-length") {
        buf.put_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(body);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_code_round_trip() {
        for code in [1001, 1002, 2001, 2003, 3001, 9001, 9002, 9003] {
            let kind = MessageKind::from_code(code);
            assert!(kind.is_recognized());
            assert_eq!(kind.code(), code);
        }
        let unknown = MessageKind::from_code(4242);
        assert_eq!(unknown, MessageKind::Unrecognized(4242));
        assert_eq!(unknown.code(), 4242);
    }

    #[test]
    fn test_kind_from_payload_prefix() {
        assert_eq!(
            MessageKind::from_payload_prefix(&2001u16.to_be_bytes()),
            MessageKind::ChatRequest
        );
        assert_eq!(
            MessageKind::from_payload_prefix(b"ping"),
            MessageKind::Unrecognized(0)
        );
        assert_eq!(
            MessageKind::from_payload_prefix(b""),
            MessageKind::Unrecognized(0)
        );
    }

    #[test]
    fn test_diagnostic_key_shape() {
        let msg = Message::new(
            7,
            42,
            ConnectionKind::Tcp,
            MessageKind::ChatRequest,
            b"hi".to_vec(),
            MessageDetail::Tcp(tcp::TcpFrameHeader::for_payload(
                MessageKind::ChatRequest.code(),
                2,
            )),
        );
        assert_eq!(msg.key(), "7_2001_42");
    }

    #[test]
    fn test_http_response_serialization() {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        let msg = Message::new(
            1,
            1,
            ConnectionKind::Http,
            MessageKind::Unrecognized(0),
            b"{\"ok\":true}".to_vec(),
            MessageDetail::HttpResponse {
                version: "HTTP/1.1".to_string(),
                status: 200,
                reason: "OK".to_string(),
                headers,
            },
        );
        let bytes = msg.serialize().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 11\r\n"));
        assert!(text.ends_with("{\"ok\":true}"));
    }
}
