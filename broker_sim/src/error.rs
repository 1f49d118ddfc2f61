// broker_sim/src/error.rs

use rust_stomp_utils::StompError;
use thiserror::Error;

/// 开发代理的错误类型。
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("STOMP 错误: {0}")]
    Stomp(#[from] StompError),
}
