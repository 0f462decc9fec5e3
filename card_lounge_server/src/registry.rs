use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

/// 每个被接受的 TCP 连接都有一个唯一编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// 连接 -> 玩家身份 的映射。
/// 同一个身份任何时刻最多只绑定一个连接：新连接握手成功后，
/// 旧连接的绑定会被移除（旧连接本身不会被关闭）。
#[derive(Debug, Default)]
pub struct SessionRegistry {
    bindings: HashMap<ConnectionId, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 绑定连接与身份，返回被挤掉的旧连接（如果有）
    pub fn bind(&mut self, conn: ConnectionId, profile_id: &str) -> Option<ConnectionId> {
        let stale = self
            .bindings
            .iter()
            .find(|(c, p)| **c != conn && p.as_str() == profile_id)
            .map(|(c, _)| *c);
        if let Some(stale) = stale {
            self.bindings.remove(&stale);
        }
        self.bindings.insert(conn, profile_id.to_string());
        stale
    }

    /// 连接断开时调用，返回它原本绑定的身份
    pub fn unbind(&mut self, conn: ConnectionId) -> Option<String> {
        self.bindings.remove(&conn)
    }

    pub fn profile_of(&self, conn: ConnectionId) -> Option<&str> {
        self.bindings.get(&conn).map(String::as_str)
    }

    pub fn connection_of(&self, profile_id: &str) -> Option<ConnectionId> {
        self.bindings.iter().find(|(_, p)| p.as_str() == profile_id).map(|(c, _)| *c)
    }

    /// 名单中的每个身份是否都有在线连接
    pub fn all_present(&self, roster: &[String]) -> bool {
        roster.iter().all(|profile_id| self.connection_of(profile_id).is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &str)> {
        self.bindings.iter().map(|(c, p)| (*c, p.as_str()))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
