// telemetry_client/src/decoder.rs

//! 遥测消息解码。
//!
//! 把订阅收到的原始消息体解析为 [`TelemetryMessage`] 并做内容校验。
//! 任何一条消息解码失败都只丢弃这一条，订阅本身不受影响。

use crate::error::DecodeError;
use common_models::TelemetryMessage;

/// 解码一条遥测消息。
///
/// # 参数
/// * `body` - 消息体原文 (JSON)。
/// * `expected_device` - 本订阅对应的设备标识；消息中的 `deviceId` 必须与之相同。
pub fn decode_telemetry(body: &str, expected_device: &str) -> Result<TelemetryMessage, DecodeError> {
    if body.trim().is_empty() {
        return Err(DecodeError::EmptyBody);
    }
    let message: TelemetryMessage = serde_json::from_str(body)?;
    if let Some(reason) = message.validation_error() {
        return Err(DecodeError::Invalid(reason));
    }
    if message.device_id != expected_device {
        return Err(DecodeError::DeviceMismatch {
            expected: expected_device.to_string(),
            actual: message.device_id,
        });
    }
    Ok(message)
}
