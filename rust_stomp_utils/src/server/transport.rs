// rust_stomp_utils/src/server/transport.rs

//! 服务端 WebSocket 监听、接受连接与 STOMP 子协议协商。

use crate::error::Result;
use crate::frame::STOMP_SUBPROTOCOL;
use log::{debug, error, info};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
    },
    WebSocketStream,
};

/// 经过 WebSocket 握手后的服务端流。
pub type WsStream = WebSocketStream<TcpStream>;

/// 负责 WebSocket 服务端的监听和连接接受。
pub struct ServerTransport;

impl ServerTransport {
    /// 在已绑定的监听器上持续接受连接。
    ///
    /// 客户端在握手请求中声明了 `v12.stomp` 子协议时，响应中回显该子协议。
    /// 每个握手成功的连接都会在独立的 Tokio 任务中调用 `on_connect`。
    ///
    /// # 参数
    /// * `listener` - 已绑定的 `TcpListener` (测试中通常绑定到 `127.0.0.1:0`)。
    /// * `on_connect` - 新连接回调，参数为握手后的流、对端地址和请求路径。
    ///
    /// # 返回
    /// 正常情况下不会返回；接受单个连接失败只记录日志并继续。
    pub async fn start<F, Fut>(listener: TcpListener, on_connect: F) -> Result<()>
    where
        F: Fn(WsStream, SocketAddr, String) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("[STOMP服务端] 正在监听地址: {}", listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((tcp_stream, peer_addr)) => {
                    debug!("[STOMP服务端] 从 {} 接受了新的 TCP 连接", peer_addr);
                    let on_connect_callback = on_connect.clone();
                    tokio::spawn(async move {
                        let mut path = String::new();
                        let negotiate = |request: &Request, mut response: Response| -> std::result::Result<Response, ErrorResponse> {
                            path = request.uri().path().to_string();
                            if offers_stomp(request) {
                                response
                                    .headers_mut()
                                    .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(STOMP_SUBPROTOCOL));
                            }
                            Ok(response)
                        };
                        match accept_hdr_async(tcp_stream, negotiate).await {
                            Ok(ws_stream) => {
                                debug!("[STOMP服务端] 与 {} 的 WebSocket 握手成功 (路径: {})", peer_addr, path);
                                on_connect_callback(ws_stream, peer_addr, path).await;
                            }
                            Err(e) => error!("[STOMP服务端] 与 {} 的 WebSocket 握手失败: {}", peer_addr, e),
                        }
                    });
                }
                Err(e) => error!("[STOMP服务端] 接受 TCP 连接失败: {}。服务器将继续运行。", e),
            }
        }
    }
}

fn offers_stomp(request: &Request) -> bool {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == STOMP_SUBPROTOCOL)
}
