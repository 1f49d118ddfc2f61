//! `common_models` 公共模型库 crate。
//!
//! 本 crate 集中定义了恒温器遥测系统中各个 Rust 组件（`telemetry_client` 遥测客户端、
//! `broker_sim` 开发用消息代理与设备模拟器）之间共享的核心数据结构和枚举类型。
//!
//! 主要包含以下类型的模型：
//! - **遥测消息 (`telemetry`)**: 设备通过代理主题 (topic) 推送的遥测记录，
//!   即 `TelemetryMessage` 及其内部的 `SensorData`。
//! - **通用枚举 (`enums`)**: 例如连接状态 (`ConnectionStatus`)，保证各组件对状态的表示一致。
//!
//! 设计原则：
//! - **序列化/反序列化**: 所有模型都派生 `serde::Serialize` 和 `serde::Deserialize`，
//!   JSON 字段名与前端/后端约定的 camelCase 保持一致。
//! - **可调试性与克隆**: 所有模型也派生 `Debug` 和 `Clone`。

pub mod enums; // 项目中通用的枚举类型定义
pub mod telemetry; // 遥测消息负载

pub use enums::ConnectionStatus;
pub use telemetry::{SensorData, TelemetryMessage};
