// telemetry_client/src/transport/mod.rs

//! 传输层抽象。
//!
//! 连接管理器只通过 [`Transport`] 与代理交互，连接生命周期中的一切变化都以
//! 带类型的 [`TransportEvent`] 经由 [`TransportHooks::on_event`] 报告给管理器的
//! 单一事件分发函数。生产环境使用 [`stomp::StompTransport`]，测试使用
//! [`fake::FakeTransport`]，后者不需要网络。

pub mod fake;
pub mod stomp;

pub use crate::error::TransportError;

use std::sync::Arc;

/// 传输层向管理器报告的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// STOMP 会话已建立 (收到 CONNECTED)。
    Connected,
    /// 会话按 DISCONNECT/RECEIPT 流程正常结束。
    Disconnected,
    /// 代理发送了 ERROR 帧。`message` 为 `message` 头部，帧体非空时以 `: ` 接在后面。
    ProtocolError { message: String },
    /// WebSocket 关闭，`code` 为关闭状态码 (1000 为正常关闭)。
    Closed { code: u16, reason: String },
    /// 网络或传输层错误。
    TransportError { message: String },
}

/// 正常关闭的 WebSocket 状态码。
pub const CLOSE_NORMAL: u16 = 1000;

/// 异常关闭 (没有关闭握手) 的 WebSocket 状态码。
pub const CLOSE_ABNORMAL: u16 = 1006;

/// 传输层回调到管理器的接口。
pub trait TransportHooks: Send + Sync {
    /// 每次物理连接尝试之前调用，返回附加到 CONNECT 帧的头部。
    fn connect_headers(&self) -> Vec<(String, String)>;

    /// 报告一个连接事件。同一传输层的事件按发生顺序串行报告。
    fn on_event(&self, event: TransportEvent);
}

/// 一条订阅收到的消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub destination: String,
    pub subscription: String,
    pub body: String,
}

/// 订阅消息回调，按到达顺序同步调用。
pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// 传输层为一次订阅分配的标识 (即 STOMP `SUBSCRIBE` 帧的 `id` 头部)。
pub type SubscriptionId = String;

pub trait Transport: Send + Sync {
    /// 启动传输层：持续连接，断开后按固定间隔自动重连。已启动时不做任何事。
    fn activate(&self, hooks: Arc<dyn TransportHooks>);

    /// 停止传输层并断开连接。之后不再报告任何事件。
    fn deactivate(&self);

    fn is_active(&self) -> bool;

    /// 是否存在已建立的 STOMP 会话。
    fn is_connected(&self) -> bool;

    /// 在当前会话上订阅 `destination`。
    fn subscribe(&self, destination: &str, handler: MessageHandler) -> Result<SubscriptionId, TransportError>;

    /// 取消订阅。未知的标识不算错误。
    fn unsubscribe(&self, id: &str) -> Result<(), TransportError>;
}
