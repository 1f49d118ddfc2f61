// broker_sim/src/ws_server/mod.rs

//! WebSocket/STOMP 服务端模块。
//!
//! - `client_session`: 单个已认证会话的状态与发送队列。
//! - `connection_manager`: 会话注册表、认证、订阅授权与消息扇出。
//! - `service`: 监听、握手后的 STOMP 会话循环。

pub mod client_session;
pub mod connection_manager;
pub mod service;
