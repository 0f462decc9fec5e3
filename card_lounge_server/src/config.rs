use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// 处于 `WaitingForAction` 时何时推送游戏状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastPolicy {
    /// 每处理完一个请求都推送
    #[default]
    EveryRequest,
    /// 只有在握手或动作真正修改了状态后才推送
    OnChange,
}

/// 服务器配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// 允许加入的玩家身份，顺序决定玩家编号
    pub profile_ids: Vec<String>,
    pub init_net_worth: i64,
    /// 事件循环在没有任何流量时检查停止标志的间隔
    pub poll_interval: Duration,
    /// 服务器发出的请求等待响应的最长时间
    pub response_timeout: Duration,
    /// 监听套接字失效后，重建之前等待的时间
    pub restart_backoff: Duration,
    pub broadcast_policy: BroadcastPolicy,
    /// 每位玩家开局发几张牌
    pub hand_size: usize,
    pub turn_timer: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8800,
            profile_ids: Vec::new(),
            init_net_worth: 500,
            poll_interval: Duration::from_secs(1),
            response_timeout: Duration::from_secs(30),
            restart_backoff: Duration::from_secs(1),
            broadcast_policy: BroadcastPolicy::EveryRequest,
            hand_size: 2,
            turn_timer: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}
