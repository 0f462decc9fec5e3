use crate::protocol::{ProtocolError, Request, Response, Sequence};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// 所有具体消息都序列化成 JSON 字符串，放在 Request/Response 的 `data` 字段里。
// 请求通过类型标签区分，响应则靠序号与原请求关联。

/// 一种具体消息的类型标签，必须与客户端完全一致
pub trait TypedMessage: Serialize + DeserializeOwned {
    const TYPE_TAG: &'static str;

    fn from_payload(payload: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(payload)
            .map_err(|source| ProtocolError::MalformedPayload { type_tag: Self::TYPE_TAG, source })
    }

    fn to_payload(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self)
            .map_err(|source| ProtocolError::Serialize { type_tag: Self::TYPE_TAG, source })
    }

    /// 包装成一个请求
    fn into_request(self, sequence: Sequence) -> Result<Request, ProtocolError> {
        Ok(Request { sequence, type_tag: Self::TYPE_TAG.to_string(), payload: self.to_payload()? })
    }

    /// 包装成对 `sequence` 号请求的响应
    fn into_response(self, sequence: Sequence) -> Result<Response, ProtocolError> {
        Ok(Response { sequence, payload: self.to_payload()? })
    }
}

// --- 握手 ---

/// 显示名的最大字节数。名字会进入每一次状态推送，并在多层 JSON 里被反复转义，
/// 过长的名字会让推送超出单帧上限。
pub const MAX_NAME_LEN: usize = 64;

/// 客户端 -> 服务器：声明自己的身份和显示名
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub profile_id: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct HandshakeResponse {
    pub success: bool,
}

// --- 游戏状态推送 ---

/// 服务器 -> 客户端：推送（过滤后的）游戏状态
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateGameStateRequest {
    pub server_timestamp_ms: i64,
    /// `GameStateInfo` 的 JSON 文本
    pub game_state_info_delta: String,
    /// 接收者当前可以执行的动作
    pub available_actions: Vec<String>,
}

impl Default for UpdateGameStateRequest {
    fn default() -> Self {
        UpdateGameStateRequest {
            server_timestamp_ms: -1,
            game_state_info_delta: String::new(),
            available_actions: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct UpdateGameStateResponse {
    pub success: bool,
}

// --- 玩家动作 ---

/// 客户端 -> 服务器：执行一个动作，`data` 的含义由动作决定
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DoActionRequest {
    pub action: String,
    pub data: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct DoActionResponse {
    pub success: bool,
}

impl TypedMessage for HandshakeRequest {
    const TYPE_TAG: &'static str = "Networking.HandshakeRequest";
}

impl TypedMessage for HandshakeResponse {
    const TYPE_TAG: &'static str = "Networking.HandshakeResponse";
}

impl TypedMessage for UpdateGameStateRequest {
    const TYPE_TAG: &'static str = "Networking.UpdateGameStateRequest";
}

impl TypedMessage for UpdateGameStateResponse {
    const TYPE_TAG: &'static str = "Networking.UpdateGameStateResponse";
}

impl TypedMessage for DoActionRequest {
    const TYPE_TAG: &'static str = "Networking.DoActionRequest";
}

impl TypedMessage for DoActionResponse {
    const TYPE_TAG: &'static str = "Networking.DoActionResponse";
}

/// 服务器能处理的客户端请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Handshake(HandshakeRequest),
    DoAction(DoActionRequest),
}

impl ClientRequest {
    /// 按类型标签解析请求负载。未知标签返回 `Ok(None)`。
    pub fn parse(type_tag: &str, payload: &str) -> Result<Option<ClientRequest>, ProtocolError> {
        let request = match type_tag {
            t if t == HandshakeRequest::TYPE_TAG => {
                ClientRequest::Handshake(HandshakeRequest::from_payload(payload)?)
            }
            t if t == DoActionRequest::TYPE_TAG => ClientRequest::DoAction(DoActionRequest::from_payload(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(request))
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            ClientRequest::Handshake(_) => HandshakeRequest::TYPE_TAG,
            ClientRequest::DoAction(_) => DoActionRequest::TYPE_TAG,
        }
    }
}

/// 服务器发出请求后期待的响应类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    UpdateGameState,
}

impl ResponseKind {
    pub fn type_tag(self) -> &'static str {
        match self {
            ResponseKind::UpdateGameState => UpdateGameStateResponse::TYPE_TAG,
        }
    }
}
