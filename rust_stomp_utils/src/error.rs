// rust_stomp_utils/src/error.rs

//! 定义 STOMP over WebSocket 工具库相关的错误类型。

use thiserror::Error;

/// STOMP 工具库的统一错误类型。
#[derive(Error, Debug)]
pub enum StompError {
    /// WebSocket 协议相关的错误，例如握手失败、连接被重置等。
    #[error("WebSocket协议错误: {0}")]
    WebSocketProtocolError(#[from] tokio_tungstenite::tungstenite::Error),

    /// 底层 I/O 错误。
    #[error("I/O错误: {0}")]
    IoError(#[from] std::io::Error),

    /// 收到的文本无法解析为 STOMP 帧。
    #[error("STOMP帧解析错误: {0}")]
    FrameParse(String),

    /// 无效的 URL 格式。
    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    /// 连接头部无法放入 HTTP 握手请求。
    #[error("无效的头部: {0}")]
    InvalidHeader(String),

    /// 在限定时间内没有完成 WebSocket 握手或没有收到 CONNECTED 帧。
    #[error("连接超时")]
    ConnectionTimeout,

    /// 未连接错误，当尝试在未建立连接时进行操作。
    #[error("未连接")]
    NotConnected,

    /// 代理在 CONNECT 阶段回复了 ERROR 帧，内容为代理给出的错误描述。
    #[error("代理拒绝连接: {0}")]
    Rejected(String),

    /// 在收到 CONNECTED 之前连接就已关闭。
    #[error("连接已关闭")]
    ConnectionClosed,

    /// 当尝试发送消息到一个已关闭的通道时发生。
    #[error("发送错误: 通道已关闭")]
    SendErrorClosed,
}

pub type Result<T> = std::result::Result<T, StompError>;
