// telemetry_client/src/manager.rs

//! 实时遥测连接管理器。
//!
//! [`ConnectionManager`] 维护与消息代理之间唯一的一条持久连接：
//!
//! - **连接状态机**：`activate` / `deactivate` 启停传输层；传输层报告的
//!   [`TransportEvent`] 全部经由 [`ConnectionManager::handle_event`] 这一个分发函数
//!   驱动状态变化。
//! - **订阅复用**：每个设备一个主题。已连接时立即订阅，否则登记到待处理队列，
//!   连接建立时按登记顺序 (FIFO) 一次性重放。
//! - **状态广播**：通过 [`StatusHub`] 通知任意数量的监听者。
//!
//! `Connected` 事件的处理顺序固定为：状态值先变为 `connected` → 重放待处理订阅
//! → 通知监听者。因此监听者看到 `connected` 时，订阅已经全部发出。
//!
//! 内部状态由一把锁保护，调用传输层的订阅操作和任何用户回调时都不持有该锁，
//! 回调里可以重新进入管理器 (例如在消息回调中取消订阅)。

use crate::config::ClientConfig;
use crate::credentials::CredentialProvider;
use crate::decoder::decode_telemetry;
use crate::status::{StatusHub, StatusSubscription};
use crate::topic::TopicScheme;
use crate::transport::stomp::{StompSettings, StompTransport};
use crate::transport::{
    InboundMessage, MessageHandler, SubscriptionId, Transport, TransportError, TransportEvent, TransportHooks,
    CLOSE_NORMAL,
};
use common_models::{ConnectionStatus, TelemetryMessage};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// 一次 `subscribe_to_device` 在同步订阅中连续遇到 `NotConnected` 时的最多尝试次数，
/// 超过后转入待处理队列。
const MAX_PLACE_ATTEMPTS: usize = 3;

/// 遥测消息回调。
pub type TelemetryCallback = Arc<dyn Fn(TelemetryMessage) + Send + Sync>;

/// 代理 ERROR 帧的分类，只影响日志与订阅清理，状态一律变为 `error`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// 无权访问设备 (不是设备所有者)。
    AuthorizationDenied,
    /// 其他代理错误。
    Broker,
}

/// 根据 ERROR 帧文本判断错误类别 (不区分大小写)。
pub fn classify_protocol_error(message: &str) -> ProtocolErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("access denied") || lower.contains("do not own") {
        ProtocolErrorKind::AuthorizationDenied
    } else {
        ProtocolErrorKind::Broker
    }
}

/// 管理器的可选行为。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    pub topic_prefix: String,
    /// 连接断开后，是否把活跃订阅放回待处理队列，在下次连接时自动恢复。
    pub resubscribe_on_reconnect: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self { topic_prefix: crate::topic::DEFAULT_TOPIC_PREFIX.to_string(), resubscribe_on_reconnect: true }
    }
}

impl From<&ClientConfig> for ManagerOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            topic_prefix: config.topic_prefix.clone(),
            resubscribe_on_reconnect: config.resubscribe_on_reconnect,
        }
    }
}

type RegistrationId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
enum RegistrationState {
    /// 等待连接建立 (在队列中，或正在被重放)。
    Pending,
    /// 已在传输层订阅，`generation` 为订阅时的连接代数。
    Active { subscription_id: SubscriptionId, generation: u64 },
}

/// 一次 `subscribe_to_device` 调用产生的登记。同一设备的多次订阅互不影响。
struct Registration {
    device_id: String,
    topic: String,
    callback: TelemetryCallback,
    state: RegistrationState,
    delivered: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    next_id: RegistrationId,
    registrations: HashMap<RegistrationId, Registration>,
    pending: VecDeque<RegistrationId>,
    /// 每次收到 `Connected` 加一。
    generation: u64,
    /// 每次连接失效 (关闭、断开、传输错误、停用) 加一。
    epoch: u64,
}

struct Inner {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    topics: TopicScheme,
    resubscribe_on_reconnect: bool,
    status: Arc<StatusHub>,
    registry: Mutex<Registry>,
}

/// 实时遥测连接管理器。克隆得到的是同一个管理器的句柄。
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                credentials,
                topics: TopicScheme::new(options.topic_prefix),
                resubscribe_on_reconnect: options.resubscribe_on_reconnect,
                status: StatusHub::new(),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// 用配置构造使用 [`StompTransport`] 的管理器。
    pub fn from_config(config: &ClientConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        let transport = StompTransport::new(StompSettings::from(config));
        Self::new(transport, credentials, ManagerOptions::from(config))
    }

    // ---- 连接状态机 ----

    /// 启动连接。传输层已启动时不做任何事；否则状态变为 `connecting`，
    /// 传输层开始连接并在断开后按固定间隔自动重连。
    pub fn activate(&self) {
        if self.inner.transport.is_active() {
            debug!("[遥测连接] activate: 传输层已在运行。");
            return;
        }
        info!("[遥测连接] 启动与代理的连接。");
        self.inner.status.set(ConnectionStatus::Connecting);
        let hooks: Arc<dyn TransportHooks> = Arc::new(ManagerHooks { inner: Arc::downgrade(&self.inner) });
        self.inner.transport.activate(hooks);
    }

    /// 停止连接。未启动时不做任何事；否则关闭传输层并把状态置为 `disconnected`。
    /// 可以重复调用。
    pub fn deactivate(&self) {
        if !self.inner.transport.is_active() {
            debug!("[遥测连接] deactivate: 传输层未启动，忽略。");
            return;
        }
        info!("[遥测连接] 停止与代理的连接。");
        self.inner.transport.deactivate();
        self.inner.demote_active();
        self.inner.status.set(ConnectionStatus::Disconnected);
    }

    /// 处理一个传输层事件。所有状态转换都经由这里。
    pub fn handle_event(&self, event: TransportEvent) {
        self.inner.handle_event(event);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.current()
    }

    /// 状态是否为 `connected`。收到 ERROR 帧后即为 `false`，即使代理尚未关闭连接。
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// 传输层是否已启动。`subscribe_to_device` 会在未启动时自动启动它。
    pub fn is_active(&self) -> bool {
        self.inner.transport.is_active()
    }

    // ---- 状态广播 ----

    /// 注册状态监听者。注册时立即以当前状态同步调用一次，之后每次状态真正变化时调用。
    pub fn on_status_change<F>(&self, listener: F) -> StatusSubscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.inner.status.register(listener)
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.watch()
    }

    // ---- 订阅复用 ----

    /// 订阅一台设备的遥测。
    ///
    /// 传输层未启动时会先调用 [`activate`](Self::activate)。已连接时立即订阅，
    /// 否则登记到待处理队列，在下次连接建立时按登记顺序重放。
    /// 同步订阅失败只记录日志，返回的句柄始终可以安全地取消。
    pub fn subscribe_to_device<F>(&self, device_id: &str, on_message: F) -> DeviceSubscription
    where
        F: Fn(TelemetryMessage) + Send + Sync + 'static,
    {
        if !self.is_active() {
            info!("[遥测连接] 订阅设备 {} 时连接尚未启动，自动启动连接。", device_id);
            self.activate();
        }

        let topic = self.inner.topics.for_device(device_id);
        let cancelled = Arc::new(AtomicBool::new(false));
        let id = {
            let mut registry = self.inner.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.registrations.insert(
                id,
                Registration {
                    device_id: device_id.to_string(),
                    topic: topic.clone(),
                    callback: Arc::new(on_message),
                    state: RegistrationState::Pending,
                    delivered: Arc::new(AtomicBool::new(false)),
                    cancelled: cancelled.clone(),
                },
            );
            id
        };
        debug!("[遥测连接] 登记订阅 #{}: {}", id, topic);
        self.inner.place(id);

        DeviceSubscription { inner: Arc::downgrade(&self.inner), id, device_id: device_id.to_string(), cancelled }
    }

    /// 已在传输层订阅的登记数。
    pub fn active_subscription_count(&self) -> usize {
        self.inner
            .registry
            .lock()
            .registrations
            .values()
            .filter(|r| matches!(r.state, RegistrationState::Active { .. }))
            .count()
    }

    /// 待处理队列的长度。
    pub fn pending_subscription_count(&self) -> usize {
        self.inner.registry.lock().pending.len()
    }

}

impl Inner {
    fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if !self.transport.is_active() {
                    debug!("[遥测连接] 连接已停用，忽略 Connected 事件。");
                    return;
                }
                // 先让新状态可见，再重放队列，最后通知监听者
                let notification = self.status.transition(ConnectionStatus::Connected);
                let batch: Vec<RegistrationId> = {
                    let mut registry = self.registry.lock();
                    registry.generation += 1;
                    registry.pending.drain(..).collect()
                };
                info!("[遥测连接] 已连接到代理，重放 {} 个待处理订阅。", batch.len());
                for id in batch {
                    self.place(id);
                }
                if let Some(notification) = notification {
                    notification.deliver();
                }
            }
            TransportEvent::ProtocolError { message } => {
                match classify_protocol_error(&message) {
                    ProtocolErrorKind::AuthorizationDenied => {
                        warn!("[遥测连接] 代理拒绝访问 (无设备权限): {}", message);
                        self.prune_denied(&message);
                    }
                    ProtocolErrorKind::Broker => error!("[遥测连接] 代理返回错误: {}", message),
                }
                self.status.set(ConnectionStatus::Error);
            }
            TransportEvent::Closed { code, reason } => {
                self.demote_active();
                if code != CLOSE_NORMAL {
                    warn!("[遥测连接] 连接异常关闭 (code={}, reason='{}')，等待自动重连。", code, reason);
                    self.status.set(ConnectionStatus::Disconnected);
                } else {
                    info!("[遥测连接] 连接已正常关闭。");
                }
            }
            TransportEvent::Disconnected => {
                info!("[遥测连接] 代理已结束会话。");
                self.demote_active();
                self.status.set(ConnectionStatus::Disconnected);
            }
            TransportEvent::TransportError { message } => {
                error!("[遥测连接] 传输层错误: {}", message);
                self.demote_active();
                self.status.set(ConnectionStatus::Error);
            }
        }
    }

    /// 尝试在传输层订阅登记 `id`；未连接时放入待处理队列。
    ///
    /// 连接状态的检查与入队在同一把锁内完成，与 `Connected` 时的队列快照互斥，
    /// 因此不会出现入队晚于重放、登记被遗留在队列中的情况。
    /// 订阅调用期间连接失效时，刚得到的传输层订阅作废，重新判断一次。
    fn place(self: &Arc<Self>, id: RegistrationId) {
        for _ in 0..MAX_PLACE_ATTEMPTS {
            let (topic, handler, generation, epoch) = {
                let mut registry = self.registry.lock();
                let (generation, epoch) = (registry.generation, registry.epoch);
                let Some(registration) = registry.registrations.get(&id) else { return };
                if !self.transport.is_connected() {
                    registry.pending.push_back(id);
                    debug!("[遥测连接] 尚未连接，订阅 #{} 进入待处理队列。", id);
                    return;
                }
                (registration.topic.clone(), delivery_handler(registration), generation, epoch)
            };

            match self.transport.subscribe(&topic, handler) {
                Ok(subscription_id) => {
                    let outcome = {
                        let mut registry = self.registry.lock();
                        let lapsed = registry.epoch != epoch || !self.transport.is_connected();
                        match registry.registrations.get_mut(&id) {
                            Some(_) if lapsed => Placement::Lapsed,
                            Some(registration) => {
                                registration.state =
                                    RegistrationState::Active { subscription_id: subscription_id.clone(), generation };
                                Placement::Active
                            }
                            None => Placement::Cancelled,
                        }
                    };
                    match outcome {
                        Placement::Active => {
                            debug!("[遥测连接] 订阅 #{} 已生效: {} ({})", id, topic, subscription_id);
                            return;
                        }
                        Placement::Cancelled => {
                            // 订阅过程中已被取消
                            self.release(&subscription_id);
                            return;
                        }
                        Placement::Lapsed => {
                            debug!("[遥测连接] 订阅 #{} 生效前连接已失效，重新判断。", id);
                            self.release(&subscription_id);
                        }
                    }
                }
                Err(TransportError::NotConnected) => {
                    debug!("[遥测连接] 订阅 #{} 时连接已断开，重新判断。", id);
                }
                Err(e) => {
                    error!("[遥测连接] 订阅 {} 失败，放弃本次订阅: {}", topic, e);
                    if let Some(registration) = self.registry.lock().registrations.remove(&id) {
                        registration.cancelled.store(true, Ordering::SeqCst);
                    }
                    return;
                }
            }
        }
        let mut registry = self.registry.lock();
        if registry.registrations.contains_key(&id) {
            warn!("[遥测连接] 订阅 #{} 多次遇到未连接，转入待处理队列。", id);
            registry.pending.push_back(id);
        }
    }

    /// 连接失效后处理活跃订阅：放回待处理队列 (按登记顺序)，或直接丢弃。
    fn demote_active(&self) {
        let mut registry = self.registry.lock();
        registry.epoch += 1;
        let mut lapsed: Vec<RegistrationId> = registry
            .registrations
            .iter()
            .filter(|(_, r)| matches!(r.state, RegistrationState::Active { .. }))
            .map(|(id, _)| *id)
            .collect();
        if lapsed.is_empty() {
            return;
        }
        lapsed.sort_unstable();
        if self.resubscribe_on_reconnect {
            for id in &lapsed {
                if let Some(registration) = registry.registrations.get_mut(id) {
                    registration.state = RegistrationState::Pending;
                }
            }
            registry.pending.extend(lapsed.iter().copied());
            registry.pending.make_contiguous().sort_unstable();
            info!("[遥测连接] {} 个订阅将在重新连接后恢复。", lapsed.len());
        } else {
            for id in &lapsed {
                if let Some(registration) = registry.registrations.remove(id) {
                    registration.cancelled.store(true, Ordering::SeqCst);
                }
            }
            info!("[遥测连接] 连接断开，{} 个订阅已失效。", lapsed.len());
        }
    }

    /// 无权访问时丢弃被拒绝的订阅，避免反复被拒。
    ///
    /// 错误文本中点名了主题时只丢弃订阅该主题的登记；否则丢弃本次连接中生效、
    /// 但尚未收到任何消息的订阅。
    fn prune_denied(&self, message: &str) {
        let released: Vec<(String, SubscriptionId)> = {
            let mut registry = self.registry.lock();
            let named: Vec<RegistrationId> = registry
                .registrations
                .iter()
                .filter(|(_, r)| mentions_topic(message, &r.topic))
                .map(|(id, _)| *id)
                .collect();
            let denied: Vec<RegistrationId> = if named.is_empty() {
                let generation = registry.generation;
                registry
                    .registrations
                    .iter()
                    .filter(|(_, r)| {
                        matches!(&r.state, RegistrationState::Active { generation: g, .. } if *g == generation)
                            && !r.delivered.load(Ordering::SeqCst)
                    })
                    .map(|(id, _)| *id)
                    .collect()
            } else {
                named
            };
            let mut released = Vec::new();
            for id in denied {
                let Some(registration) = registry.registrations.remove(&id) else { continue };
                registration.cancelled.store(true, Ordering::SeqCst);
                warn!("[遥测连接] 放弃对设备 {} 的订阅 #{} (无访问权限)。", registration.device_id, id);
                match registration.state {
                    RegistrationState::Active { subscription_id, .. } => {
                        released.push((registration.device_id, subscription_id))
                    }
                    RegistrationState::Pending => registry.pending.retain(|queued| *queued != id),
                }
            }
            released
        };
        for (device_id, subscription_id) in released {
            debug!("[遥测连接] 释放设备 {} 的传输层订阅 {}", device_id, subscription_id);
            self.release(&subscription_id);
        }
    }

    fn release(&self, subscription_id: &str) {
        if let Err(e) = self.transport.unsubscribe(subscription_id) {
            debug!("[遥测连接] 取消传输层订阅 {} 失败: {}", subscription_id, e);
        }
    }

    fn cancel(&self, id: RegistrationId) {
        let released = {
            let mut registry = self.registry.lock();
            match registry.registrations.remove(&id) {
                Some(registration) => match registration.state {
                    RegistrationState::Pending => {
                        registry.pending.retain(|queued| *queued != id);
                        debug!("[遥测连接] 已从待处理队列移除订阅 #{}", id);
                        None
                    }
                    RegistrationState::Active { subscription_id, .. } => Some(subscription_id),
                },
                None => None,
            }
        };
        if let Some(subscription_id) = released {
            debug!("[遥测连接] 取消订阅 #{} ({})", id, subscription_id);
            self.release(&subscription_id);
        }
    }
}

/// 一次传输层订阅调用之后登记的去向。
enum Placement {
    Active,
    /// 调用期间登记已被取消。
    Cancelled,
    /// 调用期间连接已失效。
    Lapsed,
}

/// `message` 中是否出现完整的 `topic` (后面不紧跟设备标识中可能出现的字符)。
fn mentions_topic(message: &str, topic: &str) -> bool {
    message.match_indices(topic).any(|(start, _)| {
        !message[start + topic.len()..].starts_with(|c: char| c.is_alphanumeric() || c == '-' || c == '_')
    })
}

/// 构造投递闭包：解码、校验后交给用户回调。取消后的回调不会再被调用。
fn delivery_handler(registration: &Registration) -> MessageHandler {
    let device_id = registration.device_id.clone();
    let callback = registration.callback.clone();
    let delivered = registration.delivered.clone();
    let cancelled = registration.cancelled.clone();
    Arc::new(move |message: &InboundMessage| {
        if cancelled.load(Ordering::SeqCst) {
            return;
        }
        match decode_telemetry(&message.body, &device_id) {
            Ok(telemetry) => {
                delivered.store(true, Ordering::SeqCst);
                callback(telemetry);
            }
            Err(e) => warn!("[遥测连接] 丢弃设备 {} 的无效消息 ({}): {}", device_id, message.destination, e),
        }
    })
}

/// 传输层回调到管理器的适配器。只持有弱引用，管理器被丢弃后回调自动失效。
struct ManagerHooks {
    inner: Weak<Inner>,
}

impl TransportHooks for ManagerHooks {
    fn connect_headers(&self) -> Vec<(String, String)> {
        let Some(inner) = self.inner.upgrade() else { return Vec::new() };
        match inner.credentials.token() {
            Some(token) => vec![("Authorization".to_string(), format!("Bearer {}", token))],
            None => {
                warn!("[遥测连接] 没有可用的访问令牌，仍尝试连接 (代理可能拒绝)。");
                Vec::new()
            }
        }
    }

    fn on_event(&self, event: TransportEvent) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_event(event);
        }
    }
}

/// `subscribe_to_device` 返回的句柄。丢弃句柄不会取消订阅。
#[derive(Debug)]
pub struct DeviceSubscription {
    inner: Weak<Inner>,
    id: RegistrationId,
    device_id: String,
    cancelled: Arc<AtomicBool>,
}

impl DeviceSubscription {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// 取消订阅。仍在队列中则从队列移除；已生效则取消传输层订阅；
    /// 已失效则什么也不做。可以在任何时候、任何线程重复调用。
    pub fn unsubscribe(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.cancel(self.id);
        }
    }

    /// 句柄是否已失效 (主动取消、订阅失败或因无权限被丢弃)。
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticTokenProvider;
    use crate::transport::fake::{FakeCall, FakeTransport};
    use crate::transport::CLOSE_ABNORMAL;

    const FIRST_MESSAGE: &str = r#"{"deviceId":"device-1","timestamp":"2024-01-01T00:00:00Z","data":{"currentTemperature":21.5,"heatingStatus":true}}"#;

    fn init_test_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn body_for(device_id: &str, temperature: f64) -> String {
        format!(
            r#"{{"deviceId":"{}","timestamp":"2024-01-01T00:00:00Z","data":{{"currentTemperature":{},"heatingStatus":false}}}}"#,
            device_id, temperature
        )
    }

    struct Fixture {
        transport: Arc<FakeTransport>,
        credentials: Arc<StaticTokenProvider>,
        manager: ConnectionManager,
    }

    fn fixture_with(options: ManagerOptions) -> Fixture {
        init_test_logger();
        let transport = FakeTransport::new();
        let credentials = Arc::new(StaticTokenProvider::new(Some("token-1".to_string())));
        let manager = ConnectionManager::new(transport.clone(), credentials.clone(), options);
        Fixture { transport, credentials, manager }
    }

    fn fixture() -> Fixture {
        fixture_with(ManagerOptions::default())
    }

    /// 收集回调收到的消息。
    fn collector() -> (Arc<Mutex<Vec<TelemetryMessage>>>, impl Fn(TelemetryMessage) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |message| sink.lock().push(message))
    }

    fn status_log(manager: &ConnectionManager) -> (Arc<Mutex<Vec<ConnectionStatus>>>, StatusSubscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = manager.on_status_change(move |status| sink.lock().push(status));
        (seen, subscription)
    }

    #[test]
    fn test_classify_protocol_error() {
        assert_eq!(classify_protocol_error("Access Denied"), ProtocolErrorKind::AuthorizationDenied);
        assert_eq!(
            classify_protocol_error("Failed to send message: ACCESS DENIED for /topic/device.x"),
            ProtocolErrorKind::AuthorizationDenied
        );
        assert_eq!(classify_protocol_error("You do not own this device"), ProtocolErrorKind::AuthorizationDenied);
        assert_eq!(classify_protocol_error("Unauthorized"), ProtocolErrorKind::Broker);
    }

    #[test]
    /// 断开期间的多次订阅在下次连接时各执行一次，且按登记顺序。
    fn test_pending_subscriptions_replay_once_in_fifo_order() {
        let f = fixture();
        let _a = f.manager.subscribe_to_device("device-a", |_| {});
        let _b = f.manager.subscribe_to_device("device-b", |_| {});
        let _c = f.manager.subscribe_to_device("device-c", |_| {});
        assert_eq!(f.manager.pending_subscription_count(), 3);
        assert!(f.transport.subscribed_destinations().is_empty());

        assert!(f.transport.connect());
        assert_eq!(
            f.transport.subscribed_destinations(),
            vec!["/topic/device.device-a", "/topic/device.device-b", "/topic/device.device-c"]
        );
        assert_eq!(f.manager.pending_subscription_count(), 0);
        assert_eq!(f.manager.active_subscription_count(), 3);

        // 重复的 Connected 不会再次执行已生效的订阅
        f.manager.handle_event(TransportEvent::Connected);
        assert_eq!(f.transport.subscribed_destinations().len(), 3);
    }

    #[test]
    fn test_subscribe_auto_activates() {
        let f = fixture();
        assert!(!f.manager.is_active());
        let _sub = f.manager.subscribe_to_device("device-1", |_| {});
        assert!(f.manager.is_active());
        assert_eq!(f.manager.status(), ConnectionStatus::Connecting);
        assert_eq!(f.transport.calls().first(), Some(&FakeCall::Activate));
    }

    #[test]
    fn test_unsubscribe_pending_request_never_fires() {
        let f = fixture();
        let (seen, callback) = collector();
        let cancelled = f.manager.subscribe_to_device("device-1", callback);
        let _kept = f.manager.subscribe_to_device("device-2", |_| {});
        cancelled.unsubscribe();
        assert_eq!(f.manager.pending_subscription_count(), 1);

        f.transport.connect();
        assert_eq!(f.transport.subscribed_destinations(), vec!["/topic/device.device-2"]);
        assert_eq!(f.transport.deliver("/topic/device.device-1", FIRST_MESSAGE), 0);
        assert!(seen.lock().is_empty());
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn test_unsubscribe_active_subscription_cancels_transport_subscription() {
        let f = fixture();
        let (seen, callback) = collector();
        let subscription = f.manager.subscribe_to_device("device-1", callback);
        f.transport.connect();
        assert_eq!(f.transport.deliver("/topic/device.device-1", FIRST_MESSAGE), 1);

        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(f.transport.calls().contains(&FakeCall::Unsubscribe { id: "sub-0".to_string() }));
        assert_eq!(f.transport.deliver("/topic/device.device-1", FIRST_MESSAGE), 0);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(f.manager.active_subscription_count(), 0);
    }

    #[test]
    fn test_unsubscribe_after_manager_dropped_is_safe() {
        let f = fixture();
        let subscription = f.manager.subscribe_to_device("device-1", |_| {});
        drop(f);
        subscription.unsubscribe();
        assert!(subscription.is_cancelled());
    }

    #[test]
    fn test_status_listener_receives_current_status_on_registration() {
        let f = fixture();
        let (seen, _subscription) = status_log(&f.manager);
        assert_eq!(*seen.lock(), vec![ConnectionStatus::Disconnected]);
    }

    #[test]
    fn test_listeners_notified_once_per_real_change() {
        let f = fixture();
        let (seen, _subscription) = status_log(&f.manager);
        f.manager.activate();
        f.manager.activate();
        f.transport.connect();
        f.manager.handle_event(TransportEvent::Connected);
        assert_eq!(
            *seen.lock(),
            vec![ConnectionStatus::Disconnected, ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
        assert_eq!(f.transport.calls().iter().filter(|c| **c == FakeCall::Activate).count(), 1);
    }

    #[test]
    fn test_malformed_messages_are_dropped_and_stream_continues() {
        let f = fixture();
        let (seen, callback) = collector();
        let _sub = f.manager.subscribe_to_device("device-1", callback);
        f.transport.connect();

        let topic = "/topic/device.device-1";
        f.transport.deliver(topic, "not json at all");
        f.transport.deliver(topic, "");
        f.transport.deliver(topic, r#"{"deviceId":"device-1"}"#);
        f.transport.deliver(topic, &body_for("someone-else", 20.0));
        f.transport.deliver(topic, &body_for("device-1", 22.25));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].data.current_temperature, 22.25);
        assert_eq!(f.manager.status(), ConnectionStatus::Connected);
    }

    #[test]
    /// 断开时订阅 device-1，连接后回调收到第一条消息。
    fn test_first_message_after_connect() {
        let f = fixture();
        let (seen, callback) = collector();
        let _sub = f.manager.subscribe_to_device("device-1", callback);
        f.transport.connect();
        f.transport.deliver("/topic/device.device-1", FIRST_MESSAGE);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].device_id, "device-1");
        assert_eq!(seen[0].timestamp.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(seen[0].data.current_temperature, 21.5);
        assert_eq!(seen[0].data.target_temperature, None);
        assert!(seen[0].data.heating_status);
    }

    #[test]
    fn test_independent_subscribers_to_same_device() {
        let f = fixture();
        let (seen_a, callback_a) = collector();
        let (seen_b, callback_b) = collector();
        let sub_a = f.manager.subscribe_to_device("device-1", callback_a);
        let _sub_b = f.manager.subscribe_to_device("device-1", callback_b);
        f.transport.connect();
        assert_eq!(f.manager.active_subscription_count(), 2);

        sub_a.unsubscribe();
        f.transport.deliver("/topic/device.device-1", FIRST_MESSAGE);
        assert!(seen_a.lock().is_empty());
        assert_eq!(seen_b.lock().len(), 1);
    }

    #[test]
    fn test_deactivate_without_activate_is_noop() {
        let f = fixture();
        let (seen, _subscription) = status_log(&f.manager);
        f.manager.deactivate();
        f.manager.deactivate();
        assert_eq!(f.manager.status(), ConnectionStatus::Disconnected);
        assert!(f.transport.calls().is_empty());
        assert_eq!(*seen.lock(), vec![ConnectionStatus::Disconnected]);
    }

    #[test]
    fn test_access_denied_sets_error_and_late_listener_sees_it() {
        let f = fixture();
        f.manager.activate();
        f.transport.connect();
        f.transport.protocol_error("Access Denied");
        assert_eq!(f.manager.status(), ConnectionStatus::Error);

        let (seen, _subscription) = status_log(&f.manager);
        assert_eq!(*seen.lock(), vec![ConnectionStatus::Error]);

        // 代理随后正常关闭连接，状态保持 error
        f.transport.close(CLOSE_NORMAL, "");
        assert_eq!(f.manager.status(), ConnectionStatus::Error);
    }

    #[test]
    fn test_other_broker_error_also_sets_error() {
        let f = fixture();
        f.manager.activate();
        f.transport.connect();
        f.transport.protocol_error("Unauthorized");
        assert_eq!(f.manager.status(), ConnectionStatus::Error);
    }

    #[test]
    /// 无权访问时丢弃本次连接中尚未收到消息的订阅，已收到消息的订阅在重连后恢复。
    fn test_access_denied_prunes_silent_subscriptions() {
        let f = fixture();
        let owned = f.manager.subscribe_to_device("device-1", |_| {});
        let foreign = f.manager.subscribe_to_device("foreign", |_| {});
        f.transport.connect();
        f.transport.deliver("/topic/device.device-1", FIRST_MESSAGE);

        f.transport.protocol_error("Access Denied");
        assert!(foreign.is_cancelled());
        assert!(!owned.is_cancelled());
        f.transport.close(CLOSE_NORMAL, "");

        f.transport.connect();
        assert_eq!(
            f.transport.subscribed_destinations(),
            vec!["/topic/device.device-1", "/topic/device.foreign", "/topic/device.device-1"]
        );
        // 已被丢弃的句柄仍可安全取消
        foreign.unsubscribe();
    }

    #[test]
    fn test_abnormal_close_sets_disconnected_and_resubscribes_on_reconnect() {
        let f = fixture();
        let (seen, callback) = collector();
        let _sub = f.manager.subscribe_to_device("device-1", callback);
        let _other = f.manager.subscribe_to_device("device-2", |_| {});
        f.transport.connect();

        f.transport.close(CLOSE_ABNORMAL, "network");
        assert_eq!(f.manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(f.manager.active_subscription_count(), 0);
        assert_eq!(f.manager.pending_subscription_count(), 2);

        f.transport.connect();
        assert_eq!(f.manager.status(), ConnectionStatus::Connected);
        assert_eq!(
            f.transport.subscribed_destinations(),
            vec![
                "/topic/device.device-1",
                "/topic/device.device-2",
                "/topic/device.device-1",
                "/topic/device.device-2"
            ]
        );
        f.transport.deliver("/topic/device.device-1", FIRST_MESSAGE);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_lapsed_subscriptions_dropped_when_resubscribe_disabled() {
        let f = fixture_with(ManagerOptions { resubscribe_on_reconnect: false, ..ManagerOptions::default() });
        let subscription = f.manager.subscribe_to_device("device-1", |_| {});
        f.transport.connect();
        f.transport.transport_error("connection reset");
        assert_eq!(f.manager.status(), ConnectionStatus::Error);
        assert!(subscription.is_cancelled());

        f.transport.connect();
        assert_eq!(f.transport.subscribed_destinations().len(), 1);
    }

    #[test]
    fn test_graceful_disconnect_event() {
        let f = fixture();
        f.manager.activate();
        f.transport.connect();
        f.transport.disconnect();
        assert_eq!(f.manager.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    /// 每次连接尝试都重新读取令牌；没有令牌时照常尝试连接。
    fn test_token_is_read_for_every_connect_attempt() {
        let f = fixture();
        f.manager.activate();
        f.transport.connect();
        f.transport.close(CLOSE_ABNORMAL, "");
        f.credentials.set_token("token-2");
        f.transport.connect();
        f.transport.close(CLOSE_ABNORMAL, "");
        f.credentials.logout();
        assert!(f.transport.connect());

        let headers = f.transport.connect_headers();
        assert_eq!(headers[0], vec![("Authorization".to_string(), "Bearer token-1".to_string())]);
        assert_eq!(headers[1], vec![("Authorization".to_string(), "Bearer token-2".to_string())]);
        assert!(headers[2].is_empty());
        assert_eq!(f.manager.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_synchronous_subscribe_failure_is_absorbed() {
        let f = fixture();
        f.manager.activate();
        f.transport.connect();
        f.transport.fail_next_subscribe(TransportError::Rejected("boom".to_string()));

        let failed = f.manager.subscribe_to_device("device-1", |_| {});
        assert!(failed.is_cancelled());
        assert_eq!(f.manager.pending_subscription_count(), 0);
        failed.unsubscribe();

        let _ok = f.manager.subscribe_to_device("device-2", |_| {});
        assert_eq!(f.transport.subscribed_destinations(), vec!["/topic/device.device-2"]);
    }

    #[test]
    fn test_not_connected_failure_is_retried() {
        let f = fixture();
        f.manager.activate();
        f.transport.connect();
        f.transport.fail_next_subscribe(TransportError::NotConnected);
        let subscription = f.manager.subscribe_to_device("device-1", |_| {});
        assert!(!subscription.is_cancelled());
        assert_eq!(f.manager.active_subscription_count(), 1);
    }

    #[test]
    fn test_unsubscribe_from_inside_callback() {
        let f = fixture();
        let count = Arc::new(Mutex::new(0));
        let slot: Arc<Mutex<Option<DeviceSubscription>>> = Arc::new(Mutex::new(None));
        let (count_ref, slot_ref) = (count.clone(), slot.clone());
        let subscription = f.manager.subscribe_to_device("device-1", move |_| {
            *count_ref.lock() += 1;
            if let Some(subscription) = slot_ref.lock().as_ref() {
                subscription.unsubscribe();
            }
        });
        *slot.lock() = Some(subscription);
        f.transport.connect();

        f.transport.deliver("/topic/device.device-1", FIRST_MESSAGE);
        f.transport.deliver("/topic/device.device-1", FIRST_MESSAGE);
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    /// 监听者收到 connected 时队列已经重放完毕；在监听者中发起的订阅立即生效且只执行一次。
    fn test_drain_completes_before_listeners_are_notified() {
        let f = fixture();
        let _queued = f.manager.subscribe_to_device("device-1", |_| {});

        let observed = Arc::new(Mutex::new(Vec::new()));
        let extra: Arc<Mutex<Vec<DeviceSubscription>>> = Arc::new(Mutex::new(Vec::new()));
        let manager = f.manager.clone();
        let (observed_ref, extra_ref) = (observed.clone(), extra.clone());
        let _listener = f.manager.on_status_change(move |status| {
            if status == ConnectionStatus::Connected {
                observed_ref.lock().push((manager.active_subscription_count(), manager.pending_subscription_count()));
                extra_ref.lock().push(manager.subscribe_to_device("device-2", |_| {}));
            }
        });

        f.transport.connect();
        assert_eq!(*observed.lock(), vec![(1, 0)]);
        assert_eq!(
            f.transport.subscribed_destinations(),
            vec!["/topic/device.device-1", "/topic/device.device-2"]
        );
        assert_eq!(f.manager.pending_subscription_count(), 0);
    }

    #[test]
    fn test_deactivate_disconnects_and_ignores_late_connected() {
        let f = fixture();
        let _sub = f.manager.subscribe_to_device("device-1", |_| {});
        f.transport.connect();
        f.manager.deactivate();
        assert_eq!(f.manager.status(), ConnectionStatus::Disconnected);
        assert!(!f.manager.is_active());
        assert!(f.transport.calls().contains(&FakeCall::Deactivate));

        f.manager.handle_event(TransportEvent::Connected);
        assert_eq!(f.manager.status(), ConnectionStatus::Disconnected);

        // 重新启动后，停用前的订阅会恢复
        f.manager.activate();
        f.transport.connect();
        assert_eq!(f.transport.subscribed_destinations().len(), 2);
    }

    /// 第一次 `subscribe` 成功返回之前会话就已断开的传输层。
    struct DroppingTransport {
        fake: Arc<FakeTransport>,
        drop_on_subscribe: AtomicBool,
    }

    impl Transport for DroppingTransport {
        fn activate(&self, hooks: Arc<dyn TransportHooks>) {
            self.fake.activate(hooks);
        }

        fn deactivate(&self) {
            self.fake.deactivate();
        }

        fn is_active(&self) -> bool {
            self.fake.is_active()
        }

        fn is_connected(&self) -> bool {
            self.fake.is_connected()
        }

        fn subscribe(&self, destination: &str, handler: MessageHandler) -> Result<SubscriptionId, TransportError> {
            let result = self.fake.subscribe(destination, handler);
            if result.is_ok() && self.drop_on_subscribe.swap(false, Ordering::SeqCst) {
                self.fake.close(CLOSE_ABNORMAL, "connection reset");
            }
            result
        }

        fn unsubscribe(&self, id: &str) -> Result<(), TransportError> {
            self.fake.unsubscribe(id)
        }
    }

    #[test]
    /// 订阅调用期间会话断开，登记回到待处理队列，重连后恢复。
    fn test_session_lost_during_subscribe_is_replayed_on_reconnect() {
        init_test_logger();
        let fake = FakeTransport::new();
        let transport = Arc::new(DroppingTransport { fake: fake.clone(), drop_on_subscribe: AtomicBool::new(false) });
        let credentials = Arc::new(StaticTokenProvider::new(Some("token-1".to_string())));
        let manager = ConnectionManager::new(transport.clone(), credentials, ManagerOptions::default());
        manager.activate();
        fake.connect();
        transport.drop_on_subscribe.store(true, Ordering::SeqCst);

        let (seen, callback) = collector();
        let subscription = manager.subscribe_to_device("device-1", callback);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(!subscription.is_cancelled());
        assert_eq!(manager.active_subscription_count(), 0);
        assert_eq!(manager.pending_subscription_count(), 1);
        assert_eq!(fake.route_count(), 0);

        fake.connect();
        assert_eq!(manager.active_subscription_count(), 1);
        assert_eq!(manager.pending_subscription_count(), 0);
        assert_eq!(fake.route_count(), 1);
        assert_eq!(fake.deliver("/topic/device.device-1", FIRST_MESSAGE), 1);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    /// ERROR 帧点名了被拒绝的主题时，只丢弃该主题的订阅，其他设备在重连后恢复。
    fn test_access_denied_for_named_topic_keeps_other_subscriptions() {
        let f = fixture();
        let (seen, callback) = collector();
        let owned = f.manager.subscribe_to_device("device-1", callback);
        let foreign = f.manager.subscribe_to_device("foreign", |_| {});
        f.transport.connect();

        f.transport.protocol_error("Access Denied: You do not own /topic/device.foreign");
        assert!(foreign.is_cancelled());
        assert!(!owned.is_cancelled());
        assert_eq!(f.manager.active_subscription_count(), 1);

        f.transport.close(CLOSE_NORMAL, "");
        assert_eq!(f.manager.status(), ConnectionStatus::Error);
        f.transport.connect();
        assert_eq!(
            f.transport.subscribed_destinations(),
            vec!["/topic/device.device-1", "/topic/device.foreign", "/topic/device.device-1"]
        );
        assert_eq!(f.transport.deliver("/topic/device.device-1", FIRST_MESSAGE), 1);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_mentions_topic_requires_whole_device_id() {
        assert!(mentions_topic("You do not own /topic/device.foreign", "/topic/device.foreign"));
        assert!(mentions_topic("You do not own /topic/device.foreign.", "/topic/device.foreign"));
        assert!(!mentions_topic("You do not own /topic/device.foreign-2", "/topic/device.foreign"));
        assert!(!mentions_topic("Access Denied", "/topic/device.foreign"));
    }

    #[test]
    /// 收到 ERROR 帧后即使代理尚未关闭连接，`is_connected` 也与状态一致。
    fn test_is_connected_follows_status() {
        let f = fixture();
        f.manager.activate();
        assert!(!f.manager.is_connected());
        f.transport.connect();
        assert!(f.manager.is_connected());

        f.transport.protocol_error("Unauthorized");
        assert!(f.transport.is_connected());
        assert!(!f.manager.is_connected());
        f.transport.close(CLOSE_NORMAL, "");
        assert!(!f.manager.is_connected());
    }
}
