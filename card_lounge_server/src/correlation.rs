use std::collections::HashMap;
use std::time::Instant;

use card_lounge_core::{PlayerIndex, ResponseKind, Sequence};

use crate::registry::ConnectionId;

/// 发出请求时记下的上下文，响应到达（或失败）时交还给处理函数
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseContext {
    /// 向某位玩家推送了游戏状态
    StateUpdate { player: PlayerIndex },
}

/// 一个等待响应的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingResponse {
    pub kind: ResponseKind,
    pub context: ResponseContext,
    /// 请求发往的连接，只接受来自这个连接的响应
    pub conn: ConnectionId,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unresolved {
    UnknownSequence,
    /// 序号存在，但响应来自另一个连接；记录保持不变
    WrongConnection { expected: ConnectionId },
}

/// 序号 -> 等待中的响应。
/// 记录在响应到达、所属连接断开或超时时移除。
#[derive(Debug, Default)]
pub struct PendingResponses {
    entries: HashMap<Sequence, PendingResponse>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sequence: Sequence, pending: PendingResponse) {
        self.entries.insert(sequence, pending);
    }

    /// 响应到达时取出对应记录
    pub fn resolve(&mut self, sequence: Sequence, from: ConnectionId) -> Result<PendingResponse, Unresolved> {
        match self.entries.get(&sequence) {
            None => Err(Unresolved::UnknownSequence),
            Some(pending) if pending.conn != from => Err(Unresolved::WrongConnection { expected: pending.conn }),
            Some(_) => self.entries.remove(&sequence).ok_or(Unresolved::UnknownSequence),
        }
    }

    /// 移除某个连接名下的所有记录
    pub fn drain_connection(&mut self, conn: ConnectionId) -> Vec<(Sequence, PendingResponse)> {
        self.drain_where(|p| p.conn == conn)
    }

    /// 移除所有在 `now` 之前到期的记录
    pub fn drain_expired(&mut self, now: Instant) -> Vec<(Sequence, PendingResponse)> {
        self.drain_where(|p| p.deadline <= now)
    }

    fn drain_where(&mut self, pred: impl Fn(&PendingResponse) -> bool) -> Vec<(Sequence, PendingResponse)> {
        let matched: Vec<Sequence> = self.entries.iter().filter(|(_, p)| pred(p)).map(|(s, _)| *s).collect();
        let mut drained: Vec<_> = matched
            .into_iter()
            .filter_map(|seq| self.entries.remove(&seq).map(|p| (seq, p)))
            .collect();
        drained.sort_by_key(|(seq, _)| *seq);
        drained
    }

    pub fn contains(&self, sequence: Sequence) -> bool {
        self.entries.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
