// broker_sim/src/ws_server/service.rs

//! 开发代理的 WebSocket 服务：接受连接，完成 STOMP CONNECT 认证，
//! 然后处理 SUBSCRIBE / UNSUBSCRIBE / DISCONNECT 与双向心跳。
//!
//! 认证失败或订阅无权访问的设备时，代理先发送 ERROR 帧，再以 1000 正常关闭连接。

use crate::error::BrokerError;
use crate::ws_server::client_session::ClientSession;
use crate::ws_server::connection_manager::{ConnectionManager, ACCESS_DENIED, UNAUTHORIZED};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rust_stomp_utils::server::transport::{ServerTransport, WsStream};
use rust_stomp_utils::timer::{heartbeat_timer, sleep_until_opt, tick_opt, watchdog_limit};
use rust_stomp_utils::{next_inbound, HeartBeat, Inbound, StompCommand, StompError, StompFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;

/// 握手后等待 CONNECT 帧的最长时间。
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsSender = SplitSink<WsStream, Message>;
type WsReceiver = SplitStream<WsStream>;

/// 会话循环的下一步。
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

pub struct WsService {
    connection_manager: Arc<ConnectionManager>,
}

impl WsService {
    pub fn new(connection_manager: Arc<ConnectionManager>) -> Self {
        Self { connection_manager }
    }

    /// 按配置绑定监听地址。
    pub async fn bind(&self) -> Result<TcpListener, BrokerError> {
        let addr = self.connection_manager.config().bind_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("[代理服务] 已绑定 {}", listener.local_addr()?);
        Ok(listener)
    }

    /// 在监听器上持续接受连接。正常情况下不会返回。
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BrokerError> {
        let manager = Arc::clone(&self.connection_manager);
        ServerTransport::start(listener, move |ws_stream, addr, path| {
            let manager = Arc::clone(&manager);
            async move { handle_connection(manager, ws_stream, addr, path).await }
        })
        .await?;
        Ok(())
    }
}

async fn handle_connection(manager: Arc<ConnectionManager>, ws_stream: WsStream, addr: SocketAddr, path: String) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let config = manager.config();

    if path != config.ws_path {
        warn!("[代理服务] {} 请求了未知路径 '{}'，关闭连接。", addr, path);
        close_directly(&mut ws_sender, CloseCode::Policy, "unknown path").await;
        return;
    }

    let Some(connect) = wait_for_connect(&mut ws_receiver, addr).await else { return };
    if !matches!(connect.command, StompCommand::Connect | StompCommand::Stomp) {
        warn!("[代理服务] {} 的第一个帧是 {}，不是 CONNECT。", addr, connect.command);
        reject(&mut ws_sender, StompFrame::error("Expected CONNECT", "")).await;
        return;
    }
    let Some(user) = manager.authenticate(&connect) else {
        warn!("[代理服务] {} 认证失败。", addr);
        reject(&mut ws_sender, StompFrame::error(UNAUTHORIZED, "missing or invalid bearer token")).await;
        return;
    };

    let client_heartbeat = match connect.header("heart-beat").map(HeartBeat::parse) {
        Some(Ok(heartbeat)) => heartbeat,
        Some(Err(e)) => {
            debug!("[代理服务] {} 的 heart-beat 头部无效 ({})，按不使用心跳处理。", addr, e);
            HeartBeat::default()
        }
        None => HeartBeat::default(),
    };
    let server_heartbeat = HeartBeat::new(config.heartbeat_ms, config.heartbeat_ms);
    let negotiated = server_heartbeat.negotiate(&client_heartbeat);

    let connected = StompFrame::connected("1.2", server_heartbeat).encode();
    if let Err(e) = ws_sender.send(Message::Text(connected)).await {
        warn!("[代理服务] 向 {} 发送 CONNECTED 失败: {}", addr, e);
        return;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let session = Arc::new(ClientSession::new(user, addr, tx));
    manager.add_client(Arc::clone(&session));
    let sender_task = tokio::spawn(run_sender(ws_sender, rx, session.client_id.to_string()));

    let mut send_timer = heartbeat_timer(&negotiated);
    let watchdog = watchdog_limit(&negotiated);
    let mut last_inbound = Instant::now();

    'session: loop {
        let deadline = watchdog.map(|limit| last_inbound + limit);
        tokio::select! {
            _ = tick_opt(&mut send_timer) => {
                session.send_heartbeat();
            }
            _ = sleep_until_opt(deadline) => {
                warn!("[代理服务] 会话 {} 心跳超时。", session.client_id);
                session.close(CloseCode::Away, "heart-beat timeout");
                break 'session;
            }
            next = next_inbound(&mut ws_receiver) => {
                last_inbound = Instant::now();
                match next {
                    None => break 'session,
                    Some(Ok(Inbound::HeartBeat)) => {}
                    Some(Ok(Inbound::Close { code, reason })) => {
                        debug!("[代理服务] 会话 {} 由客户端关闭: code={}, reason='{}'", session.client_id, code, reason);
                        break 'session;
                    }
                    Some(Ok(Inbound::Frames(frames))) => {
                        for frame in frames {
                            if handle_frame(&manager, &session, frame) == Flow::Close {
                                break 'session;
                            }
                        }
                    }
                    Some(Err(StompError::FrameParse(details))) => {
                        warn!("[代理服务] 会话 {} 发送了无法解析的帧: {}", session.client_id, details);
                        session.send_frame(&StompFrame::error("Malformed frame", details));
                        session.close(CloseCode::Normal, "");
                        break 'session;
                    }
                    Some(Err(e)) => {
                        debug!("[代理服务] 会话 {} 接收出错: {}", session.client_id, e);
                        break 'session;
                    }
                }
            }
        }
    }

    manager.remove_client(&session.client_id);
    drop(session);
    if let Err(e) = sender_task.await {
        error!("[代理服务] 发送任务异常结束: {}", e);
    }
}

/// 处理一个已认证会话发来的帧。
fn handle_frame(manager: &ConnectionManager, session: &ClientSession, frame: StompFrame) -> Flow {
    match frame.command {
        StompCommand::Subscribe => {
            let (Some(id), Some(destination)) = (frame.header("id"), frame.header("destination")) else {
                session.send_frame(&StompFrame::error("Malformed frame", "SUBSCRIBE 需要 id 与 destination 头部"));
                session.close(CloseCode::Normal, "");
                return Flow::Close;
            };
            if !manager.may_subscribe(&session.user, destination) {
                warn!("[代理服务] 用户 {} 无权订阅 {}", session.user, destination);
                session.send_frame(&StompFrame::error(ACCESS_DENIED, format!("You do not own {}", destination)));
                session.close(CloseCode::Normal, "");
                return Flow::Close;
            }
            session.add_subscription(id, destination);
            debug!("[代理服务] 会话 {} 订阅 {} ({})", session.client_id, destination, id);
        }
        StompCommand::Unsubscribe => {
            if let Some(id) = frame.header("id") {
                match session.remove_subscription(id) {
                    Some(destination) => debug!("[代理服务] 会话 {} 取消订阅 {} ({})", session.client_id, destination, id),
                    None => debug!("[代理服务] 会话 {} 取消了未知的订阅 {}", session.client_id, id),
                }
            }
        }
        StompCommand::Disconnect => {
            if let Some(receipt) = frame.header("receipt") {
                session.send_frame(&StompFrame::receipt(receipt));
            }
            session.close(CloseCode::Normal, "");
            return Flow::Close;
        }
        other => debug!("[代理服务] 会话 {} 发送了 {} 帧，忽略。", session.client_id, other),
    }
    Flow::Continue
}

/// 等待客户端的第一个帧。超时、关闭或出错时返回 `None`。
async fn wait_for_connect(ws_receiver: &mut WsReceiver, addr: SocketAddr) -> Option<StompFrame> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        let next = match tokio::time::timeout_at(deadline, next_inbound(ws_receiver)).await {
            Ok(next) => next,
            Err(_) => {
                warn!("[代理服务] {} 在 {:?} 内没有发送 CONNECT。", addr, CONNECT_TIMEOUT);
                return None;
            }
        };
        match next {
            Some(Ok(Inbound::Frames(frames))) => {
                if let Some(frame) = frames.into_iter().next() {
                    return Some(frame);
                }
            }
            Some(Ok(Inbound::HeartBeat)) => continue,
            Some(Ok(Inbound::Close { .. })) | None => return None,
            Some(Err(e)) => {
                warn!("[代理服务] 读取 {} 的 CONNECT 失败: {}", addr, e);
                return None;
            }
        }
    }
}

/// 在会话建立之前拒绝连接：发送 ERROR 帧后正常关闭。
async fn reject(ws_sender: &mut WsSender, error: StompFrame) {
    if let Err(e) = ws_sender.send(Message::Text(error.encode())).await {
        debug!("[代理服务] 发送 ERROR 帧失败: {}", e);
    }
    close_directly(ws_sender, CloseCode::Normal, "").await;
}

async fn close_directly(ws_sender: &mut WsSender, code: CloseCode, reason: &str) {
    let frame = CloseFrame { code, reason: reason.to_string().into() };
    if let Err(e) = ws_sender.send(Message::Close(Some(frame))).await {
        debug!("[代理服务] 发送关闭帧失败: {}", e);
    }
}

/// 把会话发送队列中的数据按顺序写到 WebSocket，写出关闭帧或队列关闭后结束。
async fn run_sender(mut ws_sender: WsSender, mut rx: mpsc::UnboundedReceiver<Message>, client_id: String) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = ws_sender.send(message).await {
            debug!("[发送任务 {}] 写入失败，连接可能已断开: {}", client_id, e);
            return;
        }
        if closing {
            break;
        }
    }
    let _ = ws_sender.close().await;
    debug!("[发送任务 {}] 已结束。", client_id);
}
