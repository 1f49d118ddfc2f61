// broker_sim/src/config.rs

//! 开发代理的配置管理模块。
//!
//! 配置保存在 JSON 文件 (默认 `broker_settings.json`) 中，文件不存在时写入默认配置。
//! 默认配置包含一个演示用户 `demo-user` (令牌 `demo-token`)，拥有两台恒温器。

use crate::error::BrokerError;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// 默认的配置文件名。
pub const DEFAULT_CONFIG_FILE: &str = "broker_settings.json";

/// 一台模拟恒温器。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub id: String,
    /// 设备所有者的用户标识，只有所有者可以订阅该设备的主题。
    pub owner: String,
    pub target_temperature: f64,
}

/// 代理配置。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// 监听的主机地址
    pub host: String,
    /// 监听的端口号，0 表示由系统分配
    pub port: u16,
    /// 接受 WebSocket 连接的路径
    pub ws_path: String,
    /// 设备主题前缀
    pub topic_prefix: String,
    /// 访问令牌 → 用户标识
    pub users: BTreeMap<String, String>,
    pub devices: Vec<DeviceConfig>,
    /// 模拟器发布遥测的间隔 (毫秒)
    pub publish_interval_ms: u64,
    /// 代理希望的心跳间隔 (毫秒)，双向相同，0 表示不使用心跳
    pub heartbeat_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let mut users = BTreeMap::new();
        users.insert("demo-token".to_string(), "demo-user".to_string());
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
            ws_path: "/ws".to_string(),
            topic_prefix: "/topic/device".to_string(),
            users,
            devices: vec![
                DeviceConfig { id: "thermostat-1".to_string(), owner: "demo-user".to_string(), target_temperature: 21.0 },
                DeviceConfig { id: "thermostat-2".to_string(), owner: "demo-user".to_string(), target_temperature: 19.5 },
            ],
            publish_interval_ms: 2000,
            heartbeat_ms: 10000,
        }
    }
}

impl BrokerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    /// 根据访问令牌查找用户。
    pub fn user_for_token(&self, token: &str) -> Option<&str> {
        self.users.get(token).map(String::as_str)
    }

    pub fn owner_of(&self, device_id: &str) -> Option<&str> {
        self.devices.iter().find(|d| d.id == device_id).map(|d| d.owner.as_str())
    }

    /// 设备主题，与客户端的命名规则一致：`<topic_prefix>.<deviceId>`。
    pub fn topic_for(&self, device_id: &str) -> String {
        format!("{}.{}", self.topic_prefix, device_id)
    }

    /// 从主题中取出设备标识；不符合命名规则时返回 `None`。
    pub fn device_from_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.topic_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|id| !id.is_empty())
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if !self.ws_path.starts_with('/') {
            return Err(BrokerError::Config(format!("ws_path 必须以 '/' 开头: '{}'", self.ws_path)));
        }
        if self.publish_interval_ms == 0 {
            return Err(BrokerError::Config("publish_interval_ms 必须大于 0".to_string()));
        }
        for device in &self.devices {
            if !self.users.values().any(|user| user == &device.owner) {
                warn!("[配置模块] 设备 {} 的所有者 {} 没有对应的令牌，无人可以订阅它。", device.id, device.owner);
            }
        }
        Ok(())
    }

    /// 加载配置文件；文件不存在时写入默认配置并返回。
    pub fn load_or_create(path: &Path) -> Result<Self, BrokerError> {
        if !path.exists() {
            let config = Self::default();
            info!("[配置模块] 未找到配置文件 {:?}，写入默认配置。", path);
            config.save(path)?;
            return Ok(config);
        }
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        info!("[配置模块] 已从 {:?} 加载代理配置。", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), BrokerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
