// common_models/src/telemetry.rs

//! 遥测消息负载定义。
//!
//! 每台恒温器的遥测记录都发布在自己的主题上，消息体是如下 JSON：
//!
//! ```json
//! { "deviceId": "device-1",
//!   "timestamp": "2024-01-01T00:00:00Z",
//!   "data": { "currentTemperature": 21.5, "targetTemperature": 22.0, "heatingStatus": true } }
//! ```
//!
//! `targetTemperature` 是可选字段，其余字段必须存在。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 一条解码后的遥测消息。
///
/// 生命周期很短：每收到一帧就构造一个，交给订阅者回调后即丢弃。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    /// 产生该记录的设备标识。
    pub device_id: String,
    /// 采样时间 (ISO-8601，统一换算为 UTC)。
    pub timestamp: DateTime<Utc>,
    /// 传感器读数。
    pub data: SensorData,
}

/// 恒温器的传感器读数。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorData {
    /// 当前温度 (摄氏度)。
    pub current_temperature: f64,
    /// 目标温度 (摄氏度)，部分设备不上报。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_temperature: Option<f64>,
    /// 是否正在加热。
    pub heating_status: bool,
}

impl TelemetryMessage {
    /// 以当前 UTC 时间为时间戳创建一条遥测消息。
    pub fn new(device_id: impl Into<String>, data: SensorData) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// 检查消息内容是否可用，返回第一条不满足的规则。
    ///
    /// 规则：设备标识非空白且不含 NUL 字节；温度值必须是有限数。
    pub fn validation_error(&self) -> Option<&'static str> {
        if self.device_id.trim().is_empty() {
            return Some("deviceId 为空");
        }
        if self.device_id.contains('\0') {
            return Some("deviceId 含有 NUL 字节");
        }
        if !self.data.current_temperature.is_finite() {
            return Some("currentTemperature 不是有限数");
        }
        if let Some(target) = self.data.target_temperature {
            if !target.is_finite() {
                return Some("targetTemperature 不是有限数");
            }
        }
        None
    }

    pub fn is_valid(&self) -> bool {
        self.validation_error().is_none()
    }
}
