// rust_stomp_utils/src/client/transport.rs

//! 客户端 STOMP over WebSocket 传输层核心逻辑。
//!
//! 负责一次完整的"物理连接"：WebSocket 握手 (声明 `v12.stomp` 子协议)、
//! 发送 STOMP `CONNECT` 帧并等待代理回复 `CONNECTED`，然后把拆分好的发送端/接收端
//! 交给调用方。重连、订阅管理等更高层的策略不在本模块中处理。

use crate::error::{Result, StompError};
use crate::frame::{HeartBeat, NegotiatedHeartBeat, StompCommand, StompFrame, STOMP_SUBPROTOCOL};
use crate::inbound::{next_inbound, Inbound};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame, Message},
    },
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

/// 客户端连接成功后得到的 WebSocket 流类型。
pub type ClientWsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// 一个已完成 STOMP 握手的客户端连接。
pub struct ClientConnection {
    /// 用于向代理发送 WebSocket 消息的发送端。
    pub ws_sender: SplitSink<ClientWsStream, Message>,
    /// 用于接收代理消息的接收端，配合 [`next_inbound`] 使用。
    pub ws_receiver: SplitStream<ClientWsStream>,
    /// 与代理协商出的心跳节奏。
    pub heartbeat: NegotiatedHeartBeat,
    /// 代理在 CONNECTED 帧中声明的协议版本。
    pub version: String,
    /// 与 CONNECTED 帧同一条 WebSocket 消息中到达的后续帧，调用方应先处理它们。
    pub early_frames: Vec<StompFrame>,
}

impl ClientConnection {
    /// 异步向代理发送一个 STOMP 帧。
    pub async fn send_frame(&mut self, frame: &StompFrame) -> Result<()> {
        debug!("[STOMP客户端] 发送 {} 帧", frame.command);
        self.ws_sender.send(Message::Text(frame.encode())).await?;
        Ok(())
    }

    /// 发送一个 EOL 心跳。
    pub async fn send_heartbeat(&mut self) -> Result<()> {
        self.ws_sender.send(Message::Text("\n".to_string())).await?;
        Ok(())
    }

    /// 优雅断开：发送带回执的 DISCONNECT，在 `grace` 内等待 RECEIPT，
    /// 然后以 1000 状态码关闭 WebSocket。
    ///
    /// 等待回执期间收到的其他帧会被丢弃。
    pub async fn disconnect(&mut self, grace: Duration) -> Result<()> {
        let receipt_id = "disconnect-0";
        self.send_frame(&StompFrame::disconnect(receipt_id)).await?;

        let wait_receipt = async {
            while let Some(item) = next_inbound(&mut self.ws_receiver).await {
                match item {
                    Ok(Inbound::Frames(frames)) => {
                        let acknowledged = frames.iter().any(|f| {
                            f.command == StompCommand::Receipt && f.header("receipt-id") == Some(receipt_id)
                        });
                        if acknowledged {
                            return true;
                        }
                    }
                    Ok(Inbound::HeartBeat) => {}
                    Ok(Inbound::Close { .. }) | Err(_) => return false,
                }
            }
            false
        };
        match tokio::time::timeout(grace, wait_receipt).await {
            Ok(true) => debug!("[STOMP客户端] 已收到 DISCONNECT 回执。"),
            Ok(false) => debug!("[STOMP客户端] 未收到 DISCONNECT 回执，连接已结束。"),
            Err(_) => warn!("[STOMP客户端] 等待 DISCONNECT 回执超时 ({:?})，直接关闭连接。", grace),
        }

        let close = CloseFrame { code: CloseCode::Normal, reason: "".into() };
        if let Err(e) = self.ws_sender.send(Message::Close(Some(close))).await {
            debug!("[STOMP客户端] 发送 Close 帧失败 (连接可能已关闭): {}", e);
        }
        Ok(())
    }
}

/// 连接到 STOMP 代理并完成 STOMP 握手。
///
/// # 参数
/// * `url_str` - 代理的 WebSocket 地址，例如 `ws://localhost:8088/ws`。
/// * `connect_headers` - 附加到 CONNECT 帧的头部 (例如 `Authorization: Bearer ...`)。
/// * `heartbeat` - 本端声明的心跳能力。
/// * `connect_timeout` - 从发起 TCP 连接到收到 CONNECTED 的总时限。
///
/// # 返回
/// * `Ok(ClientConnection)` - 握手成功。
/// * `Err(StompError::Rejected)` - 代理以 ERROR 帧拒绝了 CONNECT。
/// * 其他 `Err` - URL 无效、网络错误、超时或连接提前关闭。
pub async fn connect_client(
    url_str: &str,
    connect_headers: &[(String, String)],
    heartbeat: HeartBeat,
    connect_timeout: Duration,
) -> Result<ClientConnection> {
    info!("[STOMP客户端] 开始连接代理: {}", url_str);
    let parsed_url = Url::parse(url_str)
        .map_err(|e| StompError::InvalidUrl(format!("无效的 WebSocket URL '{}': {}", url_str, e)))?;
    let host = parsed_url.host_str().unwrap_or("localhost").to_string();

    let mut request = parsed_url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(STOMP_SUBPROTOCOL));

    let handshake = stomp_handshake(request, &host, heartbeat, connect_headers);

    match tokio::time::timeout(connect_timeout, handshake).await {
        Ok(Ok(connection)) => {
            info!(
                "[STOMP客户端] 已连接到 {} (STOMP {}，心跳 {:?})",
                url_str, connection.version, connection.heartbeat
            );
            Ok(connection)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            error!("[STOMP客户端] 连接 {} 超时 ({:?})", url_str, connect_timeout);
            Err(StompError::ConnectionTimeout)
        }
    }
}

/// WebSocket 握手 + STOMP CONNECT/CONNECTED 交换。
async fn stomp_handshake(
    request: Request,
    host: &str,
    heartbeat: HeartBeat,
    connect_headers: &[(String, String)],
) -> Result<ClientConnection> {
    let (ws_stream, response) = connect_async(request).await?;
    debug!("[STOMP客户端] WebSocket 握手完成 (HTTP 状态码: {})", response.status());
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connect_frame = StompFrame::connect(host, heartbeat, connect_headers);
    ws_sender.send(Message::Text(connect_frame.encode())).await?;

    loop {
        let next = next_inbound(&mut ws_receiver).await;
        match next {
            Some(Ok(Inbound::Frames(frames))) => {
                let mut frames = frames.into_iter();
                while let Some(frame) = frames.next() {
                    match frame.command {
                        StompCommand::Connected => {
                            let server_heartbeat = match frame.header("heart-beat") {
                                Some(value) => HeartBeat::parse(value).unwrap_or_else(|e| {
                                    warn!("[STOMP客户端] 代理返回的 heart-beat 头部无效，按 0,0 处理: {}", e);
                                    HeartBeat::default()
                                }),
                                None => HeartBeat::default(),
                            };
                            let version = frame.header("version").unwrap_or("1.0").to_string();
                            return Ok(ClientConnection {
                                ws_sender,
                                ws_receiver,
                                heartbeat: heartbeat.negotiate(&server_heartbeat),
                                version,
                                early_frames: frames.collect(),
                            });
                        }
                        StompCommand::Error => {
                            let message = frame.error_text();
                            error!("[STOMP客户端] 代理拒绝了 CONNECT: {}", message);
                            return Err(StompError::Rejected(message));
                        }
                        other => debug!("[STOMP客户端] 握手阶段忽略 {} 帧", other),
                    }
                }
            }
            Some(Ok(Inbound::HeartBeat)) => {}
            Some(Ok(Inbound::Close { code, reason })) => {
                warn!("[STOMP客户端] 握手阶段连接被关闭: code={}, reason='{}'", code, reason);
                return Err(StompError::ConnectionClosed);
            }
            Some(Err(e)) => return Err(e),
            None => return Err(StompError::ConnectionClosed),
        }
    }
}
