// broker_sim/src/ws_server/connection_manager.rs

//! 会话注册表、认证与授权，以及向订阅者扇出消息。

use crate::config::BrokerConfig;
use crate::ws_server::client_session::ClientSession;
use dashmap::DashMap;
use log::{debug, info};
use rust_stomp_utils::StompFrame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// 认证失败时 ERROR 帧的 `message` 头部。
pub const UNAUTHORIZED: &str = "Unauthorized";
/// 订阅无权访问的设备时 ERROR 帧的 `message` 头部。
pub const ACCESS_DENIED: &str = "Access Denied";

#[derive(Debug)]
pub struct ConnectionManager {
    config: Arc<BrokerConfig>,
    /// 所有已认证的会话。Key: 会话标识。
    clients: DashMap<Uuid, Arc<ClientSession>>,
    next_message_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(config: Arc<BrokerConfig>) -> Self {
        Self { config, clients: DashMap::new(), next_message_id: AtomicU64::new(0) }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// 从 CONNECT 帧的 `Authorization: Bearer <token>` 头部认证用户。
    ///
    /// 头部名不区分大小写。
    pub fn authenticate(&self, connect: &StompFrame) -> Option<String> {
        let value = connect
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
            .map(|(_, value)| value.trim())?;
        let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?.trim();
        self.config.user_for_token(token).map(str::to_string)
    }

    /// 只有设备所有者可以订阅设备主题；其他主题一律拒绝。
    pub fn may_subscribe(&self, user: &str, destination: &str) -> bool {
        self.config
            .device_from_topic(destination)
            .and_then(|device_id| self.config.owner_of(device_id))
            .is_some_and(|owner| owner == user)
    }

    pub fn add_client(&self, session: Arc<ClientSession>) {
        info!(
            "[连接管理] 新会话: id={}, 用户={}, addr={}",
            session.client_id, session.user, session.addr
        );
        self.clients.insert(session.client_id, session);
        debug!("[连接管理] 当前会话总数: {}", self.clients.len());
    }

    pub fn remove_client(&self, client_id: &Uuid) -> Option<Arc<ClientSession>> {
        let removed = self.clients.remove(client_id).map(|(_, session)| session);
        if let Some(session) = &removed {
            info!("[连接管理] 会话结束: id={}, 用户={}", session.client_id, session.user);
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// 向订阅了 `destination` 的所有会话发送一条 MESSAGE，返回送出的帧数。
    pub fn publish(&self, destination: &str, body: &str) -> usize {
        let mut delivered = 0;
        for entry in self.clients.iter() {
            let session = entry.value();
            for subscription in session.subscriptions_for(destination) {
                let message_id = format!("msg-{}", self.next_message_id.fetch_add(1, Ordering::Relaxed));
                let frame = StompFrame::message(destination, &subscription, &message_id, body);
                if session.send_frame(&frame) {
                    delivered += 1;
                }
            }
        }
        if delivered > 0 {
            debug!("[连接管理] {} -> {} 个订阅", destination, delivered);
        }
        delivered
    }
}
