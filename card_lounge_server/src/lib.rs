//! # 卡牌对局服务器
//!
//! 单线程事件循环 + 请求/响应关联 + 对局进度状态机。
//! 具体的游戏规则通过 [`GameRules`] 接入，默认实现是 [`TableRules`]。

pub mod config;
pub mod correlation;
pub mod error;
pub mod registry;
pub mod router;
pub mod rules;
pub mod server;
pub mod session;

pub use config::{BroadcastPolicy, ServerConfig};
pub use error::{ActionError, PendingResponseError, ServerError};
pub use registry::{ConnectionId, SessionRegistry};
pub use rules::{GameRules, TableRules};
pub use server::{ServerHandle, start_server};
pub use session::{Outbound, Session, SessionPhase};
