//! Ferry wire protocol: message types, payloads and the envelope.

use serde::{Deserialize, Serialize};

/// Tag byte carried in front of every frame body. The full tag space is listed so reserved
/// values stay reserved; only `FileRequest` and `FileResponse` have a payload registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Stream = 0x1,
    Normal = 0x2,
    FileRequest = 0x3,
    FileResponse = 0x4,
    ChunkRequest = 0x5,
    ChunkData = 0x6,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0x1 => Ok(MessageType::Stream),
            0x2 => Ok(MessageType::Normal),
            0x3 => Ok(MessageType::FileRequest),
            0x4 => Ok(MessageType::FileResponse),
            0x5 => Ok(MessageType::ChunkRequest),
            0x6 => Ok(MessageType::ChunkData),
            other => Err(other),
        }
    }
}

/// Correlates a `FileResponse` with the `FileRequest` that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(uuid::Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Ask a peer for one file from its shared directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequest {
    pub file_name: String,
    pub request_id: RequestId,
}

/// Full content of a shared file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResponse {
    pub name: String,
    pub size: u64,
    pub data: Vec<u8>,
    /// Reserved for chunked transfer; never set by this protocol generation.
    pub checksum: Option<[u8; 32]>,
    /// Reserved for chunked transfer; never set by this protocol generation.
    pub num_chunks: Option<u32>,
    /// Echo of the request's id.
    pub request_id: RequestId,
}

impl FileResponse {
    pub fn new(name: String, data: Vec<u8>, request_id: RequestId) -> Self {
        Self {
            name,
            size: data.len() as u64,
            data,
            checksum: None,
            num_chunks: None,
            request_id,
        }
    }
}

/// Every registered payload. The decoder picks the variant from the tag byte alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    FileRequest(FileRequest),
    FileResponse(FileResponse),
}

/// Unit of wire communication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Logical id of the sender; may be empty.
    pub from: String,
    /// Network address of the sender. Overwritten by the receiving transport with the
    /// address it observed on the connection.
    pub from_addr: String,
    pub payload: Payload,
}

impl Message {
    pub fn file_request(from: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            from_addr: String::new(),
            payload: Payload::FileRequest(FileRequest {
                file_name: file_name.into(),
                request_id: RequestId::new(),
            }),
        }
    }

    pub fn file_response(
        from: impl Into<String>,
        from_addr: impl Into<String>,
        response: FileResponse,
    ) -> Self {
        Self {
            from: from.into(),
            from_addr: from_addr.into(),
            payload: Payload::FileResponse(response),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self.payload {
            Payload::FileRequest(_) => MessageType::FileRequest,
            Payload::FileResponse(_) => MessageType::FileResponse,
        }
    }
}
