//! Wire messages.
//!
//! Every frame carries a one-byte kind, the request id it belongs to and an
//! opaque payload. The payload layout depends on the kind:
//!
//! | Kind          | Payload                                            |
//! |---------------|----------------------------------------------------|
//! | REQUEST       | hex content id, or JSON `{"h": id, "p": path}`     |
//! | DATA          | raw file bytes                                     |
//! | ERROR         | UTF-8 reason string                                |
//! | END           | empty                                              |
//! | HELLO         | `[weight u8][capabilities u8]`                     |
//! | PING / PONG   | empty (request id is the nonce)                    |
//! | BATCH_REQUEST | `[count u16]` then `[reqId u32][len u8][id]` each  |

use std::fmt;
use std::path::{Component, Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use swarmfetch_core::ContentHash;

use crate::config::{CAP_BATCH, MAX_BATCH_ENTRIES};
use crate::error::{P2pError, P2pResult};

/// ERROR frame reason strings.
pub mod reasons {
    /// The node is at an upload cap.
    pub const BUSY: &str = "Busy";
    /// The content is not held locally.
    pub const NOT_FOUND: &str = "Not Found";
    /// The local user is downloading and uploads are paused.
    pub const OWNER_BUSY: &str = "Owner Busy";
    /// Uploads to this peer class are switched off.
    pub const DISABLED: &str = "Disabled";
    /// The requester ran out of usage credits.
    pub const RATE_LIMITED: &str = "Rate Limited";
    /// The request did not name a valid content id.
    pub const INVALID_HASH: &str = "Invalid Hash";
    /// The request named a path outside the content root.
    pub const INVALID_PATH: &str = "Invalid Path";
    /// The file could not be read.
    pub const INTERNAL: &str = "Internal Error";
}

/// Frame kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Request = 1,
    Data = 2,
    Error = 3,
    End = 4,
    Hello = 5,
    Ping = 6,
    Pong = 7,
    BatchRequest = 8,
}

impl MessageKind {
    /// Get the name of this kind for logging.
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Data => "data",
            MessageKind::Error => "error",
            MessageKind::End => "end",
            MessageKind::Hello => "hello",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::BatchRequest => "batch_request",
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = P2pError;

    fn try_from(value: u8) -> P2pResult<Self> {
        Ok(match value {
            1 => MessageKind::Request,
            2 => MessageKind::Data,
            3 => MessageKind::Error,
            4 => MessageKind::End,
            5 => MessageKind::Hello,
            6 => MessageKind::Ping,
            7 => MessageKind::Pong,
            8 => MessageKind::BatchRequest,
            other => return Err(P2pError::UnknownMessageType(other)),
        })
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub request_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame from parts.
    pub fn new(kind: MessageKind, request_id: u32, payload: Bytes) -> Self {
        Self {
            kind,
            request_id,
            payload,
        }
    }

    pub fn request(request_id: u32, request: &RequestPayload) -> P2pResult<Self> {
        Ok(Self::new(MessageKind::Request, request_id, request.encode()?))
    }

    pub fn data(request_id: u32, chunk: Bytes) -> Self {
        Self::new(MessageKind::Data, request_id, chunk)
    }

    pub fn error(request_id: u32, reason: &str) -> Self {
        Self::new(
            MessageKind::Error,
            request_id,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn end(request_id: u32) -> Self {
        Self::new(MessageKind::End, request_id, Bytes::new())
    }

    pub fn hello(hello: Hello) -> Self {
        Self::new(MessageKind::Hello, 0, hello.encode())
    }

    pub fn ping(nonce: u32) -> Self {
        Self::new(MessageKind::Ping, nonce, Bytes::new())
    }

    pub fn pong(nonce: u32) -> Self {
        Self::new(MessageKind::Pong, nonce, Bytes::new())
    }

    pub fn batch(batch: &BatchRequest) -> P2pResult<Self> {
        Ok(Self::new(MessageKind::BatchRequest, 0, batch.encode()?))
    }

    /// Reason carried by an ERROR frame.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// First message on every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// Advertised capacity weight (0-10).
    pub weight: u8,
    /// Capability bit field.
    pub capabilities: u8,
}

impl Hello {
    /// Encoded payload size.
    pub const SIZE: usize = 2;

    pub fn new(weight: u8, supports_batch: bool) -> Self {
        Self {
            weight,
            capabilities: if supports_batch { CAP_BATCH } else { 0 },
        }
    }

    pub fn supports_batch(&self) -> bool {
        self.capabilities & CAP_BATCH != 0
    }

    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.weight, self.capabilities])
    }

    pub fn decode(payload: &[u8]) -> P2pResult<Self> {
        if payload.len() != Self::SIZE {
            return Err(P2pError::Protocol(format!(
                "hello payload must be {} bytes, got {}",
                Self::SIZE,
                payload.len()
            )));
        }
        Ok(Self {
            weight: payload[0],
            capabilities: payload[1],
        })
    }
}

/// A relative path proven not to escape its root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SafePath(PathBuf);

impl SafePath {
    /// Validate a peer-supplied relative path.
    ///
    /// Backslashes are treated as separators. Absolute paths, drive
    /// prefixes, `..` components and NUL bytes are rejected.
    pub fn parse(raw: &str) -> P2pResult<Self> {
        let reject = || P2pError::PathTraversal(raw.to_string());

        if raw.is_empty() || raw.contains('\0') {
            return Err(reject());
        }
        let normalized = raw.replace('\\', "/");
        if normalized.starts_with('/') {
            return Err(reject());
        }

        let mut clean = PathBuf::new();
        for component in Path::new(&normalized).components() {
            match component {
                Component::Normal(part) => {
                    if part.to_string_lossy().contains(':') {
                        return Err(reject());
                    }
                    clean.push(part);
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(reject())
                }
            }
        }

        if clean.as_os_str().is_empty() {
            return Err(reject());
        }
        Ok(Self(clean))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for SafePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[derive(Serialize, Deserialize)]
struct PathRequest {
    h: String,
    p: String,
}

/// What a REQUEST frame asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    /// A content-addressed object.
    Hash(ContentHash),
    /// A file at a relative path, verified against `hash`.
    Path { hash: ContentHash, path: SafePath },
}

impl RequestPayload {
    /// The content id being requested.
    pub fn hash(&self) -> &ContentHash {
        match self {
            RequestPayload::Hash(hash) | RequestPayload::Path { hash, .. } => hash,
        }
    }

    pub fn encode(&self) -> P2pResult<Bytes> {
        match self {
            RequestPayload::Hash(hash) => Ok(Bytes::copy_from_slice(hash.as_bytes())),
            RequestPayload::Path { hash, path } => {
                let json = serde_json::to_vec(&PathRequest {
                    h: hash.to_string(),
                    p: path.as_path().to_string_lossy().replace('\\', "/"),
                })
                .map_err(|e| P2pError::Protocol(e.to_string()))?;
                Ok(Bytes::from(json))
            }
        }
    }

    /// Decode and validate a request from an untrusted peer.
    ///
    /// Invalid ids and unsafe paths are security violations.
    pub fn decode(payload: &[u8]) -> P2pResult<Self> {
        if payload.first() == Some(&b'{') {
            let request: PathRequest = serde_json::from_slice(payload)
                .map_err(|e| P2pError::Protocol(format!("bad path request: {}", e)))?;
            let hash = ContentHash::parse(&request.h)?;
            let path = SafePath::parse(&request.p)?;
            return Ok(RequestPayload::Path { hash, path });
        }

        let text = std::str::from_utf8(payload)
            .map_err(|_| P2pError::InvalidContentId(swarmfetch_core::ContentIdError::NotHex))?;
        Ok(RequestPayload::Hash(ContentHash::parse(text)?))
    }
}

/// One entry of a batch request, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub request_id: u32,
    pub payload: Bytes,
}

/// Several small hash requests in one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRequest {
    pub entries: Vec<BatchEntry>,
}

impl BatchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request_id: u32, hash: &ContentHash) {
        self.entries.push(BatchEntry {
            request_id,
            payload: Bytes::copy_from_slice(hash.as_bytes()),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> P2pResult<Bytes> {
        if self.entries.len() > MAX_BATCH_ENTRIES {
            return Err(P2pError::Protocol(format!(
                "batch of {} entries exceeds {}",
                self.entries.len(),
                MAX_BATCH_ENTRIES
            )));
        }

        let mut buf = BytesMut::with_capacity(2 + self.entries.len() * 45);
        buf.put_u16(self.entries.len() as u16);
        for entry in &self.entries {
            let len = u8::try_from(entry.payload.len())
                .map_err(|_| P2pError::Protocol("batch entry too long".into()))?;
            buf.put_u32(entry.request_id);
            buf.put_u8(len);
            buf.put_slice(&entry.payload);
        }
        Ok(buf.freeze())
    }

    pub fn decode(payload: &[u8]) -> P2pResult<Self> {
        let mut buf = payload;
        if buf.remaining() < 2 {
            return Err(P2pError::Protocol("truncated batch header".into()));
        }
        let count = buf.get_u16() as usize;
        if count > MAX_BATCH_ENTRIES {
            return Err(P2pError::Protocol(format!(
                "batch of {} entries exceeds {}",
                count, MAX_BATCH_ENTRIES
            )));
        }

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 5 {
                return Err(P2pError::Protocol("truncated batch entry".into()));
            }
            let request_id = buf.get_u32();
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(P2pError::Protocol("truncated batch entry".into()));
            }
            entries.push(BatchEntry {
                request_id,
                payload: Bytes::copy_from_slice(&buf[..len]),
            });
            buf.advance(len);
        }

        if buf.has_remaining() {
            return Err(P2pError::Protocol("trailing bytes after batch".into()));
        }
        Ok(Self { entries })
    }
}
