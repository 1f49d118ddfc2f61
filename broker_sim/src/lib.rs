//! `broker_sim` 开发用 STOMP 消息代理。
//!
//! 在本地提供一个与生产代理行为一致的 STOMP over WebSocket 端点，供遥测客户端联调与集成测试使用：
//! CONNECT 需要 `Authorization: Bearer <token>`，设备主题只允许设备所有者订阅，
//! 恒温器模拟器按固定间隔向各自的主题发布遥测。
//!
//! 主要模块包括：
//! - `config`: 代理配置 (用户、设备、发布间隔、心跳) 的加载与保存。
//! - `ws_server`: WebSocket 服务、会话管理与消息扇出。
//! - `simulator`: 恒温器模拟器。
//! - `broker`: 在后台启动整个代理。

pub mod broker;
pub mod config;
pub mod error;
pub mod simulator;
pub mod ws_server;

pub use broker::{start_broker, RunningBroker};
pub use config::BrokerConfig;
pub use error::BrokerError;
