//! # 卡牌对局协议核心库
//!
//! 这个 `core` crate 定义了客户端与服务器之间的全部线上约定：
//! 帧格式、请求/响应信封、各类具体消息、游戏状态结构以及扑克牌模型。
//! 它不涉及任何网络 I/O，服务器和客户端都依赖它。

mod card;
mod frame;
mod message;
mod protocol;
mod state;

pub use card::*;

pub use frame::*;

pub use message::*;

pub use protocol::*;

pub use state::*;
