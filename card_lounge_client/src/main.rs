use std::io::Write;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;

use card_lounge_core::{
    DoActionRequest, FrameBuffer, GameStateInfo, HandshakeRequest, Message, TypedMessage, UpdateGameStateRequest,
    UpdateGameStateResponse, encode_frame,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:8800".to_string());

    println!("正在连接到: {}", addr);
    let stream = TcpStream::connect(&addr).await?;
    println!("连接成功!");

    let (read_half, mut write_half) = stream.into_split();

    // 读任务和主任务都需要发送消息，统一经由这个通道写出
    let (tx, mut rx) = mpsc::channel::<Message>(32);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match msg.to_raw().map_err(|e| e.to_string()).and_then(|raw| {
                encode_frame(&raw).map_err(|e| e.to_string())
            }) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("构造消息失败: {}", e);
                    continue;
                }
            };
            if write_half.write_all(&frame).await.is_err() {
                // 发送失败，说明服务器已断开，退出任务
                break;
            }
        }
    });

    // 启动一个任务来处理从服务器接收的消息
    tokio::spawn(receive_loop(read_half, tx.clone()));

    // 主任务处理用户输入
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    println!("--- 卡牌对局客户端 ---");
    println!("可用命令:");
    println!("  hello <身份> <昵称>       - 握手");
    println!("  follow                    - 跟注");
    println!("  raise <金额>              - 加注");
    println!("  fold                      - 弃牌");
    println!("  exit                      - 退出");

    let mut seq = 0;
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = stdin.next_line().await? else {
            break;
        };
        let parts: Vec<&str> = line.split_whitespace().collect();

        let request = match parts.first().copied() {
            Some("hello") => {
                if parts.len() < 3 {
                    println!("用法: hello <身份> <昵称>");
                    continue;
                }
                HandshakeRequest { profile_id: parts[1].to_string(), name: parts[2..].join(" ") }.into_request(seq)
            }
            Some("follow") => action("FollowBet", String::new()).into_request(seq),
            Some("fold") => action("Fold", String::new()).into_request(seq),
            Some("raise") => {
                let Some(amount) = parts.get(1).and_then(|s| s.parse::<i64>().ok()) else {
                    println!("用法: raise <金额>");
                    continue;
                };
                action("RaiseBet", serde_json::json!({ "bet": amount }).to_string()).into_request(seq)
            }
            Some("exit") => {
                println!("正在断开连接...");
                break;
            }
            None => continue,
            _ => {
                println!("未知命令: {}", line);
                continue;
            }
        };

        seq += 1;
        tx.send(Message::Request(request?)).await?;
    }

    Ok(())
}

fn action(name: &str, data: String) -> DoActionRequest {
    DoActionRequest { action: name.to_string(), data }
}

/// 打印服务器发来的消息；对状态推送回复确认
async fn receive_loop(mut reader: OwnedReadHalf, tx: mpsc::Sender<Message>) {
    let mut buffer = FrameBuffer::new();
    let mut chunk = [0u8; 2048];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                println!("\n服务器已断开连接");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                eprintln!("接收消息时出错: {}", e);
                return;
            }
        };
        buffer.extend(&chunk[..n]);

        loop {
            let raw = match buffer.next_frame() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    eprintln!("收到无效帧: {}", e);
                    continue;
                }
            };
            match Message::parse(&raw) {
                Ok(Message::Response(response)) => {
                    println!("\n<-- [响应 #{}]: {}\n", response.sequence, response.payload);
                }
                Ok(Message::Request(request)) if request.type_tag == UpdateGameStateRequest::TYPE_TAG => {
                    print_state_update(&request.payload);
                    let ack = UpdateGameStateResponse { success: true }.into_response(request.sequence);
                    if let Ok(ack) = ack {
                        if tx.send(Message::Response(ack)).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Message::Request(request)) => {
                    println!("\n<-- [未知请求 {}]\n", request.type_tag);
                }
                Err(e) => eprintln!("解析服务器消息失败: {}", e),
            }
            print!("> "); // 重新显示输入提示符
            let _ = std::io::stdout().flush();
        }
    }
}

fn print_state_update(payload: &str) {
    let parsed = UpdateGameStateRequest::from_payload(payload).map_err(|e| e.to_string()).and_then(|update| {
        serde_json::from_str::<GameStateInfo>(&update.game_state_info_delta)
            .map(|state| (update.available_actions, state))
            .map_err(|e| e.to_string())
    });
    match parsed {
        Ok((actions, state)) => {
            println!("\n<-- [游戏状态] 我是 {} 号玩家，轮到 {} 号行动", state.player_id, state.active_player);
            for (i, p) in state.player_infos.iter().enumerate() {
                let hand: Vec<String> = p.main_hand.iter().map(ToString::to_string).collect();
                println!(
                    "    #{} {:<12} 资产 {:>5} 下注 {:>5}{} {}",
                    i,
                    p.name,
                    p.net_worth,
                    p.bet,
                    if p.is_folded { " (已弃牌)" } else { "" },
                    hand.join(" ")
                );
            }
            if !actions.is_empty() {
                println!("    可用动作: {}", actions.join(", "));
            }
            println!();
        }
        Err(e) => eprintln!("解析游戏状态失败: {}", e),
    }
}
