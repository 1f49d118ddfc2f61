//! 通用枚举模块。
//!
//! 本模块定义了在遥测系统中多个组件之间共享的通用枚举类型。
//! 所有枚举都派生 `Serialize`, `Deserialize`, `Debug`, `Clone`, `Copy`, `PartialEq`, `Eq`, `Hash`，
//! 以支持数据交换、调试、比较和集合操作。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 与消息代理之间那一条持久连接的当前状态。
///
/// 任意时刻只有一个当前值；状态只能经由连接状态机转换，
/// 监听者只会在值真正发生变化时收到通知。
/// 序列化为小写字符串 (`"connecting"`, `"connected"`, `"disconnected"`, `"error"`)，
/// 与界面侧使用的取值保持一致。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// 已启动传输层，正在尝试建立连接。
    Connecting,
    /// STOMP 会话已建立，可以直接订阅。
    Connected,
    /// 初始状态；主动停用或连接异常关闭后也会回到此状态。
    #[default]
    Disconnected,
    /// 传输层错误或代理返回了 ERROR 帧（包括无权访问设备）。
    Error,
}

impl ConnectionStatus {
    /// 返回与序列化结果一致的小写名称。
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
