//! TCP 服务器与事件循环。
//!
//! 一个事件循环任务独占监听套接字、所有连接的接收缓冲区以及 `Session`，
//! 用 `select!` 同时等待三件事：新连接、连接事件、定时器。
//! 每个连接有两个小任务：读任务只把读到的原始字节转发给事件循环，
//! 写任务只把事件循环排好的帧写出去。拆帧、分发、状态机全部在事件循环里同步完成。
//!
//! `accept()` 失败分三种：对端已放弃的连接直接忽略；文件描述符耗尽之类的暂时性错误
//! 只暂停接受新连接片刻，已有连接不受影响；只有监听套接字本身失效时，事件循环才拆掉
//! 所有连接并返回错误，由外层循环等待片刻后重建监听套接字。
//! 停止标志被设置后，事件循环在下一次定时器触发时正常退出。

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use card_lounge_core::{FrameBuffer, FrameError, encode_frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::registry::ConnectionId;
use crate::session::{Outbound, Session};

/// 单次读取的最大字节数
const READ_CHUNK: usize = 2048;
/// 所有连接共享的事件通道容量
const EVENT_QUEUE: usize = 256;
/// 单个连接待发送帧的上限，超过说明客户端读得太慢
const OUTGOING_QUEUE: usize = 64;
/// 暂时性的 accept 错误之后，暂停接受新连接的时间
const ACCEPT_PAUSE: Duration = Duration::from_millis(100);

/// 事件循环从这里接受新连接，平时就是 `TcpListener`
pub(crate) trait Incoming: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Incoming for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// 一次 accept 失败应当如何处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// 只影响这一个待接受的连接
    Connection,
    /// 资源暂时不足（EMFILE、ENFILE、ENOBUFS 等），监听套接字本身完好
    Transient,
    /// 监听套接字已失效，需要重建
    Listener,
}

fn classify_accept_error(e: &io::Error, listener_healthy: bool) -> AcceptFailure {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => AcceptFailure::Connection,
        _ if listener_healthy => AcceptFailure::Transient,
        _ => AcceptFailure::Listener,
    }
}

/// 连接任务发给事件循环的事件
enum ConnectionEvent {
    Data { conn: ConnectionId, bytes: Vec<u8> },
    Closed { conn: ConnectionId, reason: CloseReason },
}

enum CloseReason {
    PeerClosed,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "对端关闭"),
            CloseReason::ReadFailed(e) => write!(f, "读取失败: {e}"),
            CloseReason::WriteFailed(e) => write!(f, "写入失败: {e}"),
        }
    }
}

/// 事件循环眼中的一个连接
struct Connection {
    addr: SocketAddr,
    buffer: FrameBuffer,
    // 用于向该连接的写任务发送已分帧的消息
    outgoing: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Connection {
    // 两个任务都结束后，读写两半被释放，套接字随之关闭
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// `start_server` 返回的句柄，用来查询地址和停止服务器
pub struct ServerHandle {
    keep_running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// 实际监听的地址（端口配置为 0 时由系统分配）
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 设置停止标志并等待事件循环退出
    pub async fn stop(self) {
        info!("服务器正在停止...");
        self.keep_running.store(false, Ordering::SeqCst);
        if let Err(e) = self.task.await {
            error!("事件循环任务异常退出: {}", e);
        }
        info!("服务器已停止");
    }
}

/// 绑定监听地址并在后台启动事件循环
pub async fn start_server(config: ServerConfig) -> Result<ServerHandle, ServerError> {
    let listener = bind(config.socket_addr()).await?;
    launch(listener, bind, config)
}

/// 在后台启动事件循环；`rebind` 用来在监听套接字失效后重建它
fn launch<L, B, F>(listener: L, rebind: B, config: ServerConfig) -> Result<ServerHandle, ServerError>
where
    L: Incoming,
    B: FnMut(SocketAddr) -> F + Send + 'static,
    F: Future<Output = Result<L, ServerError>> + Send + 'static,
{
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::Bind { addr: config.socket_addr(), source })?;
    info!("服务器正在监听 {}", local_addr);

    let keep_running = Arc::new(AtomicBool::new(true));
    let mut session = Session::new(&config);
    session.start();

    let task = tokio::spawn(run(listener, rebind, local_addr, config, session, keep_running.clone()));
    Ok(ServerHandle { keep_running, local_addr, task })
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr).await.map_err(|source| ServerError::Bind { addr, source })
}

/// 外层循环：监听套接字失效时重建它，直到收到停止信号
async fn run<L, B, F>(
    listener: L,
    mut rebind: B,
    addr: SocketAddr,
    config: ServerConfig,
    mut session: Session,
    keep_running: Arc<AtomicBool>,
) where
    L: Incoming,
    B: FnMut(SocketAddr) -> F,
    F: Future<Output = Result<L, ServerError>>,
{
    let mut listener = Some(listener);
    while keep_running.load(Ordering::SeqCst) {
        let current = match listener.take() {
            Some(l) => l,
            None => match rebind(addr).await {
                Ok(l) => {
                    info!("监听套接字已重建 {}", addr);
                    l
                }
                Err(e) => {
                    error!("{}，{:?} 后重试", e, config.restart_backoff);
                    tokio::time::sleep(config.restart_backoff).await;
                    continue;
                }
            },
        };

        let mut event_loop = EventLoop::new(&mut session, &config, keep_running.clone());
        match event_loop.serve(&current).await {
            Ok(()) => break,
            Err(e) => {
                error!("{}，关闭所有连接，{:?} 后重建监听套接字", e, config.restart_backoff);
                drop(current);
                tokio::time::sleep(config.restart_backoff).await;
            }
        }
    }
    info!("事件循环已退出");
}

struct EventLoop<'a> {
    session: &'a mut Session,
    connections: HashMap<ConnectionId, Connection>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events_rx: mpsc::Receiver<ConnectionEvent>,
    keep_running: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl<'a> EventLoop<'a> {
    fn new(session: &'a mut Session, config: &ServerConfig, keep_running: Arc<AtomicBool>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        EventLoop {
            session,
            connections: HashMap::new(),
            events_tx,
            events_rx,
            keep_running,
            poll_interval: config.poll_interval,
        }
    }

    /// 运行直到收到停止信号（`Ok`）或监听套接字出错（`Err`），返回前关闭所有连接
    async fn serve(&mut self, listener: &impl Incoming) -> Result<(), ServerError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 暂停期间不再 accept，但连接事件和定时器照常处理
        let accept_pause = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(accept_pause);
        let mut accept_paused = false;

        let result = loop {
            tokio::select! {
                accepted = listener.accept(), if !accept_paused => match accepted {
                    Ok((stream, addr)) => self.accept(stream, addr),
                    Err(e) => match classify_accept_error(&e, listener.local_addr().is_ok()) {
                        AcceptFailure::Connection => debug!("接受连接失败，忽略: {}", e),
                        AcceptFailure::Transient => {
                            warn!("接受连接失败: {}，{:?} 内不再接受新连接", e, ACCEPT_PAUSE);
                            accept_pause.as_mut().reset(tokio::time::Instant::now() + ACCEPT_PAUSE);
                            accept_paused = true;
                        }
                        AcceptFailure::Listener => break Err(ServerError::Accept(e)),
                    },
                },
                () = &mut accept_pause, if accept_paused => accept_paused = false,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = ticker.tick() => {
                    if !self.keep_running.load(Ordering::SeqCst) {
                        break Ok(());
                    }
                    self.session.reap_expired(Instant::now());
                }
            }
        };

        self.teardown();
        result
    }

    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let conn = ConnectionId::new();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("设置 TCP_NODELAY 失败 {}: {}", addr, e);
        }
        let (read_half, write_half) = stream.into_split();
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);

        let reader = tokio::spawn(read_loop(conn, read_half, self.events_tx.clone()));
        let writer = tokio::spawn(write_loop(conn, write_half, outgoing_rx, self.events_tx.clone()));
        self.connections.insert(
            conn,
            Connection { addr, buffer: FrameBuffer::new(), outgoing, reader, writer },
        );
        info!("接受了客户端连接 {} ({})", conn, addr);
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Data { conn, bytes } => self.handle_data(conn, &bytes),
            ConnectionEvent::Closed { conn, reason } => {
                if self.connections.contains_key(&conn) {
                    info!("客户端 {} 断开连接: {}", conn, reason);
                    self.drop_connection(conn);
                }
            }
        }
    }

    /// 追加数据到接收缓冲区，并逐个分发其中所有完整的帧
    fn handle_data(&mut self, conn: ConnectionId, bytes: &[u8]) {
        match self.connections.get_mut(&conn) {
            Some(connection) => connection.buffer.extend(bytes),
            None => {
                debug!("忽略已关闭连接 {} 的数据", conn);
                return;
            }
        }

        loop {
            // 分发过程中连接可能已被拆除（例如发送队列已满）
            let Some(connection) = self.connections.get_mut(&conn) else {
                break;
            };
            match connection.buffer.next_frame() {
                Ok(Some(raw)) => {
                    let outbound = self.session.handle_frame(conn, &raw, Instant::now());
                    self.deliver(outbound);
                }
                Ok(None) => break,
                Err(e @ FrameError::InvalidUtf8 { .. }) => warn!("连接 {} 收到无效帧，已丢弃: {}", conn, e),
                Err(e) => {
                    warn!("连接 {} 的接收缓冲区异常: {}", conn, e);
                    break;
                }
            }
        }
    }

    fn deliver(&mut self, outbound: Vec<Outbound>) {
        for Outbound { conn, payload } in outbound {
            let frame = match encode_frame(&payload) {
                Ok(f) => f,
                Err(e) => {
                    error!("发往 {} 的消息无法分帧，已丢弃: {}", conn, e);
                    continue;
                }
            };
            let Some(connection) = self.connections.get(&conn) else {
                debug!("连接 {} 已关闭，丢弃待发送的消息", conn);
                continue;
            };
            match connection.outgoing.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("连接 {} 的发送队列已满，断开连接", conn);
                    self.drop_connection(conn);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("连接 {} 的写任务已结束", conn);
                    self.drop_connection(conn);
                }
            }
        }
    }

    /// 移除连接：释放缓冲区、结束读写任务，并通知会话
    fn drop_connection(&mut self, conn: ConnectionId) {
        if let Some(connection) = self.connections.remove(&conn) {
            debug!("关闭连接 {} ({})", conn, connection.addr);
        }
        self.session.connection_closed(conn);
    }

    fn teardown(&mut self) {
        let conns: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for conn in conns {
            self.drop_connection(conn);
        }
        info!("所有连接已关闭");
    }
}

async fn read_loop(conn: ConnectionId, mut reader: OwnedReadHalf, events: mpsc::Sender<ConnectionEvent>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let event = match reader.read(&mut buf).await {
            Ok(0) => ConnectionEvent::Closed { conn, reason: CloseReason::PeerClosed },
            Ok(n) => ConnectionEvent::Data { conn, bytes: buf[..n].to_vec() },
            Err(e) => ConnectionEvent::Closed { conn, reason: CloseReason::ReadFailed(e) },
        };
        let closed = matches!(event, ConnectionEvent::Closed { .. });
        if events.send(event).await.is_err() || closed {
            break;
        }
    }
}

async fn write_loop(
    conn: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<ConnectionEvent>,
) {
    while let Some(frame) = outgoing.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            // 发送失败，交给事件循环拆除这个连接
            let _ = events.send(ConnectionEvent::Closed { conn, reason: CloseReason::WriteFailed(e) }).await;
            break;
        }
    }
}
