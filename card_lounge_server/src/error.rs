use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// 监听套接字层面的错误。出现后整个循环会拆掉所有连接并重建监听套接字。
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("listener failed to accept: {0}")]
    Accept(#[source] io::Error),
}

/// 服务器发出的请求没能等到响应
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PendingResponseError {
    #[error("response timed out")]
    ResponseTimeout,
    #[error("connection closed before the response arrived")]
    ConnectionLost,
}

/// 游戏规则拒绝了一个动作
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("actions are not accepted in the current phase")]
    WrongPhase,
    #[error("connection has not completed a handshake")]
    NotSeated,
    #[error("player {0} is not the active player")]
    NotYourTurn(i32),
    #[error("player {0} has folded")]
    AlreadyFolded(i32),
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("invalid action data: {0}")]
    InvalidData(String),
    #[error("invalid bet amount {0}")]
    InvalidBet(i64),
}
