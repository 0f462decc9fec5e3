use std::net::IpAddr;

use clap::Parser;
use tracing::{error, info};

use card_lounge_server::{BroadcastPolicy, ServerConfig, start_server};

/// 卡牌对局服务器
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// 监听端口
    #[arg(long, default_value_t = 8800)]
    port: u16,

    /// 监听地址
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// 允许加入的玩家身份，按顺序决定玩家编号，可重复指定
    #[arg(long = "profile", required = true)]
    profiles: Vec<String>,

    /// 每位玩家的初始资产
    #[arg(long, default_value_t = 500)]
    init_net_worth: i64,

    /// 只在状态真正变化后推送，而不是每个请求之后都推送
    #[arg(long)]
    broadcast_on_change: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = ServerConfig {
        bind_addr: args.bind,
        port: args.port,
        profile_ids: args.profiles,
        init_net_worth: args.init_net_worth,
        broadcast_policy: if args.broadcast_on_change {
            BroadcastPolicy::OnChange
        } else {
            BroadcastPolicy::EveryRequest
        },
        ..ServerConfig::default()
    };

    let handle = match start_server(config).await {
        Ok(h) => h,
        Err(e) => {
            error!("服务器启动失败: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("无法监听 Ctrl-C: {}", e);
    }
    info!("收到中断信号");
    handle.stop().await;
}
