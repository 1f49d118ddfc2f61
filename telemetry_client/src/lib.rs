//! `telemetry_client` 恒温器实时遥测客户端的核心库。
//!
//! 通过一条 STOMP over WebSocket 持久连接订阅多台设备的遥测数据：
//!
//! - [`manager`]: 连接管理器，包含连接状态机、订阅复用与待处理队列。
//! - [`status`]: 连接状态广播中心。
//! - [`decoder`]: 遥测消息解码与校验。
//! - [`transport`]: 传输层抽象，以及 STOMP 实现和测试用的内存实现。
//! - [`config`] / [`credentials`] / [`topic`] / [`staleness`]: 配置、访问令牌、主题命名与数据新鲜度。
//!
//! 可执行程序 `telemetry_monitor` (见 `main.rs`) 是这些组件的组装入口。

// --- 公开模块声明 ---
pub mod config;      // 客户端配置加载与管理
pub mod credentials; // 访问令牌提供者
pub mod decoder;     // 遥测消息解码
pub mod error;       // 错误类型
pub mod manager;     // 连接管理器
pub mod staleness;   // 数据新鲜度跟踪
pub mod status;      // 状态广播中心
pub mod topic;       // 主题命名规则
pub mod transport;   // 传输层

pub use common_models::{ConnectionStatus, SensorData, TelemetryMessage};
pub use config::ClientConfig;
pub use credentials::{CredentialProvider, StaticTokenProvider};
pub use manager::{ConnectionManager, DeviceSubscription, ManagerOptions};
pub use status::StatusSubscription;
pub use transport::{Transport, TransportEvent};
