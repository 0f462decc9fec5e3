//! 传输信封：每一帧的负载都是一个 `Envelope`，其中包着一个 `Request` 或 `Response`。
//!
//! 线上格式沿用客户端的字段名：
//! - Envelope: `{"type": 0|1, "data": "..."}`（0 = 请求，1 = 响应）
//! - Request:  `{"seq": 1, "type": "Networking.HandshakeRequest", "data": "..."}`
//! - Response: `{"seq": 1, "data": "..."}`

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 请求序号。由发起方分配，响应原样带回。
pub type Sequence = i64;

/// 未设置序号时的哨兵值
pub const UNSET_SEQUENCE: Sequence = -1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    #[error("unknown envelope kind {0}")]
    UnknownKind(u8),
    #[error("malformed request: {0}")]
    MalformedRequest(#[source] serde_json::Error),
    #[error("malformed response: {0}")]
    MalformedResponse(#[source] serde_json::Error),
    #[error("malformed {type_tag} payload: {source}")]
    MalformedPayload {
        type_tag: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize {type_tag}: {source}")]
    Serialize {
        type_tag: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// 信封种类；缺省时按请求处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EnvelopeKind {
    #[default]
    Request,
    Response,
}

impl From<EnvelopeKind> for u8 {
    fn from(kind: EnvelopeKind) -> Self {
        match kind {
            EnvelopeKind::Request => 0,
            EnvelopeKind::Response => 1,
        }
    }
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EnvelopeKind::Request),
            1 => Ok(EnvelopeKind::Response),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: EnvelopeKind,
    #[serde(rename = "data", default)]
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Request {
    #[serde(rename = "seq")]
    pub sequence: Sequence,
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(rename = "data")]
    pub payload: String,
}

impl Default for Request {
    fn default() -> Self {
        Request { sequence: UNSET_SEQUENCE, type_tag: String::new(), payload: String::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Response {
    #[serde(rename = "seq")]
    pub sequence: Sequence,
    #[serde(rename = "data")]
    pub payload: String,
}

impl Default for Response {
    fn default() -> Self {
        Response { sequence: UNSET_SEQUENCE, payload: String::new() }
    }
}

/// 解开信封后的消息，请求和响应二选一
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// 解析一帧的完整负载（信封 + 内层消息）
    pub fn parse(raw: &str) -> Result<Message, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(raw).map_err(ProtocolError::MalformedEnvelope)?;
        match envelope.kind {
            EnvelopeKind::Request => serde_json::from_str(&envelope.payload)
                .map(Message::Request)
                .map_err(ProtocolError::MalformedRequest),
            EnvelopeKind::Response => serde_json::from_str(&envelope.payload)
                .map(Message::Response)
                .map_err(ProtocolError::MalformedResponse),
        }
    }

    /// 序列化为帧负载（信封 JSON）
    pub fn to_raw(&self) -> Result<String, ProtocolError> {
        let (kind, inner) = match self {
            Message::Request(request) => (EnvelopeKind::Request, serde_json::to_string(request)),
            Message::Response(response) => (EnvelopeKind::Response, serde_json::to_string(response)),
        };
        let payload = inner.map_err(|source| ProtocolError::Serialize { type_tag: "message", source })?;
        serde_json::to_string(&Envelope { kind, payload })
            .map_err(|source| ProtocolError::Serialize { type_tag: "envelope", source })
    }

    pub fn sequence(&self) -> Sequence {
        match self {
            Message::Request(request) => request.sequence,
            Message::Response(response) => response.sequence,
        }
    }
}
