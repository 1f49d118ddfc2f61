// rust_stomp_utils/src/server/mod.rs

//! STOMP 服务端模块。
//!
//! 只负责监听、WebSocket 握手与子协议协商；帧的收发由调用方借助
//! [`crate::frame`] 与 [`crate::inbound`] 完成 (参见 `broker_sim`)。

pub mod transport;
