// telemetry_client/src/config.rs

//! 遥测客户端配置管理模块。
//!
//! 定义客户端运行所需的配置参数 (`ClientConfig`)，负责从 JSON 文件
//! (默认 `telemetry_settings.json`) 加载配置，文件不存在时写入一份默认配置，
//! 并支持用环境变量覆盖代理地址。

use crate::error::ConfigError;
use log::{error, info, warn};
use rust_stomp_utils::HeartBeat;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// 默认的配置文件名。
pub const DEFAULT_CONFIG_FILE: &str = "telemetry_settings.json";

/// 覆盖 `broker_url` 的环境变量。
pub const ENV_BROKER_URL: &str = "TELEMETRY_BROKER_URL";

/// 提供访问令牌的环境变量 (由命令行入口读取)。
pub const ENV_TOKEN: &str = "TELEMETRY_TOKEN";

/// 遥测客户端配置，对应配置文件中的内容。
///
/// 文件中缺失的字段取默认值，因此旧版本的配置文件可以直接使用。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// 消息代理的 WebSocket 地址，例如 `"ws://localhost:8088/ws"`。
    pub broker_url: String,

    /// 设备主题前缀，设备 `X` 的主题为 `<topic_prefix>.X`。
    pub topic_prefix: String,

    /// 连接断开后重新连接前的固定等待时间 (毫秒)。
    pub reconnect_delay_ms: u64,

    /// 希望收到代理心跳的间隔 (毫秒)，0 表示不检查。
    pub heartbeat_incoming_ms: u64,

    /// 本端发送心跳的间隔 (毫秒)，0 表示不发送。
    pub heartbeat_outgoing_ms: u64,

    /// 单次连接尝试 (WebSocket 握手 + STOMP CONNECT) 的超时 (毫秒)。
    pub connect_timeout_ms: u64,

    /// 超过该时长没有收到某设备的遥测，即认为其数据已过期 (毫秒)。
    pub stale_after_ms: u64,

    /// 连接恢复后是否自动重新订阅断线前的活跃订阅。
    pub resubscribe_on_reconnect: bool,

    /// 日志级别：`"trace"`, `"debug"`, `"info"`, `"warn"`, `"error"`。
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://localhost:8088/ws".to_string(),
            topic_prefix: "/topic/device".to_string(),
            reconnect_delay_ms: 5000,
            heartbeat_incoming_ms: 10000,
            heartbeat_outgoing_ms: 10000,
            connect_timeout_ms: 10000,
            stale_after_ms: 30000,
            resubscribe_on_reconnect: true,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// CONNECT 帧中声明的心跳能力。
    pub fn heartbeat(&self) -> HeartBeat {
        HeartBeat::new(self.heartbeat_outgoing_ms, self.heartbeat_incoming_ms)
    }

    /// 检查配置值是否可用。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.broker_url.starts_with("ws://") || self.broker_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                field: "broker_url",
                reason: format!("'{}' 不是 ws:// 或 wss:// 地址", self.broker_url),
            });
        }
        if self.topic_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "topic_prefix", reason: "不能为空".to_string() });
        }
        if self.reconnect_delay_ms == 0 {
            return Err(ConfigError::Invalid { field: "reconnect_delay_ms", reason: "必须大于 0".to_string() });
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid { field: "connect_timeout_ms", reason: "必须大于 0".to_string() });
        }
        Ok(())
    }

    /// 用外部变量覆盖配置项。`lookup` 通常是 `|key| std::env::var(key).ok()`。
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BROKER_URL).filter(|v| !v.trim().is_empty()) {
            info!("[配置模块] 使用环境变量 {} 覆盖代理地址: {}", ENV_BROKER_URL, url);
            self.broker_url = url;
        }
    }

    /// 从 `path` 加载配置；文件不存在时写入并返回默认配置。
    pub fn load_or_create(path: &Path) -> Result<ClientConfig, ConfigError> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
            let config: ClientConfig = serde_json::from_str(&content)
                .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })?;
            Ok(config)
        } else {
            info!("[配置模块] 配置文件 '{}' 未找到，将使用默认配置参数创建新文件。", path.display());
            let config = ClientConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// 以格式化 JSON 保存配置，必要时创建父目录。
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent_dir) = path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                fs::create_dir_all(parent_dir)
                    .map_err(|source| ConfigError::Write { path: parent_dir.display().to_string(), source })?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write { path: path.display().to_string(), source })?;
        info!("[配置模块] 配置已保存至: '{}'", path.display());
        Ok(())
    }
}

/// 初始化配置：加载 (或创建) 配置文件并应用环境变量覆盖。
///
/// 任何一步失败都只记录日志并退回到默认配置，保证客户端总能启动。
pub fn init_client_config(path: &Path) -> ClientConfig {
    info!("[配置模块] 开始初始化客户端配置...");
    let mut config = match ClientConfig::load_or_create(path) {
        Ok(config) => config,
        Err(e) => {
            error!("[配置模块] {}。将使用默认配置。", e);
            ClientConfig::default()
        }
    };
    config.apply_overrides(|key| std::env::var(key).ok());
    if let Err(e) = config.validate() {
        warn!("[配置模块] {}。将使用默认配置。", e);
        config = ClientConfig::default();
    }
    config
}
