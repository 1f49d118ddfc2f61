// rust_stomp_utils/src/client/mod.rs

//! STOMP 客户端模块。
//!
//! `transport` 子模块提供单次物理连接的建立 (`connect_client`) 与帧发送；
//! 重连、心跳调度与订阅路由由上层的连接任务负责。

pub mod transport;
