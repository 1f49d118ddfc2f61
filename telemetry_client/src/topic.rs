// telemetry_client/src/topic.rs

//! 设备主题命名规则：设备 `X` 的遥测发布在 `<前缀>.X` 上。

/// 默认主题前缀。
pub const DEFAULT_TOPIC_PREFIX: &str = "/topic/device";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_PREFIX)
    }
}

impl TopicScheme {
    /// 前缀末尾多余的 `.` 会被去掉。
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self { prefix: prefix.trim_end_matches('.').to_string() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn for_device(&self, device_id: &str) -> String {
        format!("{}.{}", self.prefix, device_id)
    }
}
