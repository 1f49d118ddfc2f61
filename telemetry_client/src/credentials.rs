// telemetry_client/src/credentials.rs

//! 访问令牌的来源。
//!
//! 令牌的获取 (登录、刷新) 不属于本 crate；连接管理器只通过 [`CredentialProvider`]
//! 在每次连接尝试前读取当前令牌。

use parking_lot::RwLock;

/// 外部凭据提供者。
pub trait CredentialProvider: Send + Sync {
    /// 当前的访问令牌；未登录时为 `None`。
    fn token(&self) -> Option<String>;

    fn is_logged_in(&self) -> bool {
        self.token().is_some()
    }

    /// 清除凭据。
    fn logout(&self);
}

/// 持有一个可替换令牌的简单实现，供命令行入口与测试使用。
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self { token: RwLock::new(token.filter(|t| !t.trim().is_empty())) }
    }

    /// 替换令牌 (例如刷新后)，下一次连接尝试即使用新令牌。
    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }
}

impl CredentialProvider for StaticTokenProvider {
    fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn logout(&self) {
        *self.token.write() = None;
    }
}
