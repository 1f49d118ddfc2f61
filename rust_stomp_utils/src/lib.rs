//! `rust_stomp_utils` 是一个提供 STOMP over WebSocket 通信实用功能的 Rust Crate。
//!
//! 主要模块包括：
//! - `frame`: STOMP 1.2 帧 (`StompFrame`) 的编码、解析以及心跳 (`HeartBeat`) 协商。
//! - `inbound`: 把 WebSocket 接收流转换成帧、心跳和关闭事件。
//! - `error`: 库中使用的错误类型 `StompError`。
//! - `timer`: 心跳发送与超时检测计时器。
//! - `client`: 客户端连接与 STOMP 握手。
//! - `server`: 服务端监听与 `v12.stomp` 子协议协商。

pub mod client;
pub mod error;
pub mod frame;
pub mod inbound;
pub mod server;
pub mod timer;

pub use error::StompError;
pub use frame::{HeartBeat, NegotiatedHeartBeat, StompCommand, StompFrame};
pub use inbound::{next_inbound, Inbound};
