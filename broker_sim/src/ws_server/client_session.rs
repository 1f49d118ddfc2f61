// broker_sim/src/ws_server/client_session.rs

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;
use rust_stomp_utils::StompFrame;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// 一个已通过 STOMP CONNECT 认证的客户端会话。
///
/// 出站数据统一写入 `sender`，由该连接专用的发送任务按顺序写到 WebSocket，
/// 因此 ERROR 帧总是先于随后的关闭帧到达客户端。
#[derive(Debug)]
pub struct ClientSession {
    /// 服务端生成的会话标识 (UUID v4)。
    pub client_id: Uuid,
    /// 通过令牌认证得到的用户标识。
    pub user: String,
    pub addr: SocketAddr,
    pub creation_time: DateTime<Utc>,
    sender: mpsc::UnboundedSender<Message>,
    /// 订阅标识 → 目标主题
    subscriptions: DashMap<String, String>,
}

impl ClientSession {
    pub fn new(user: String, addr: SocketAddr, sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            user,
            addr,
            creation_time: Utc::now(),
            sender,
            subscriptions: DashMap::new(),
        }
    }

    /// 把一个帧放入发送队列。连接已关闭时返回 `false`。
    pub fn send_frame(&self, frame: &StompFrame) -> bool {
        self.send_raw(Message::Text(frame.encode()))
    }

    pub fn send_heartbeat(&self) -> bool {
        self.send_raw(Message::Text("\n".to_string()))
    }

    /// 请求关闭 WebSocket。发送任务写出关闭帧后结束。
    pub fn close(&self, code: CloseCode, reason: &str) {
        let frame = CloseFrame { code, reason: reason.to_string().into() };
        self.send_raw(Message::Close(Some(frame)));
    }

    fn send_raw(&self, message: Message) -> bool {
        if self.sender.send(message).is_err() {
            debug!("[会话 {}] 发送队列已关闭，丢弃出站数据。", self.client_id);
            return false;
        }
        true
    }

    pub fn add_subscription(&self, id: &str, destination: &str) {
        self.subscriptions.insert(id.to_string(), destination.to_string());
    }

    pub fn remove_subscription(&self, id: &str) -> Option<String> {
        self.subscriptions.remove(id).map(|(_, destination)| destination)
    }

    /// 订阅了 `destination` 的全部订阅标识。
    pub fn subscriptions_for(&self, destination: &str) -> Vec<String> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.value() == destination)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}
