// telemetry_client/src/error.rs

//! `telemetry_client` 中使用的错误类型。
//!
//! 这些错误都不会穿过 [`crate::manager::ConnectionManager`] 的公共接口：
//! 管理器内部记录日志后自行处理，调用方看到的只有连接状态的变化。

use thiserror::Error;

/// 配置加载与保存过程中的错误。
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("读取配置文件 '{path}' 失败: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("写入配置文件 '{path}' 失败: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("解析配置文件 '{path}' 的内容失败: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("序列化配置失败: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("配置项 '{field}' 无效: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 单条遥测消息解码失败的原因。解码失败只影响这一条消息。
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("消息体为空")]
    EmptyBody,

    #[error("JSON 解析失败: {0}")]
    Json(#[from] serde_json::Error),

    #[error("消息内容无效: {0}")]
    Invalid(&'static str),

    #[error("消息来自设备 '{actual}'，但订阅的是设备 '{expected}'")]
    DeviceMismatch { expected: String, actual: String },
}

/// 传输层同步调用 (订阅、取消订阅、启动) 的错误。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// 当前没有已建立的 STOMP 会话。
    #[error("传输层未连接")]
    NotConnected,

    /// 连接任务已经结束，命令无法送达。
    #[error("传输层命令通道已关闭")]
    ChannelClosed,

    /// 传输层拒绝了本次请求。
    #[error("传输层拒绝了请求: {0}")]
    Rejected(String),

    /// 调用线程上没有 Tokio 运行时，无法启动连接任务。
    #[error("当前线程没有可用的 Tokio 运行时")]
    NoRuntime,
}
