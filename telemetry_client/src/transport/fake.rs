// telemetry_client/src/transport/fake.rs

//! 内存中的传输层实现，不需要网络。
//!
//! 测试通过 [`FakeTransport::connect`]、[`FakeTransport::close`]、
//! [`FakeTransport::protocol_error`] 等方法模拟代理行为，并用
//! [`FakeTransport::deliver`] 向某个主题推送消息体。所有调用都会被记录下来以便断言。
//! 事件回调总是在内部锁释放之后进行。

use super::{
    InboundMessage, MessageHandler, SubscriptionId, Transport, TransportError, TransportEvent, TransportHooks,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// 记录下来的一次传输层调用。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Activate,
    Deactivate,
    Subscribe { id: SubscriptionId, destination: String },
    Unsubscribe { id: SubscriptionId },
}

struct Route {
    destination: String,
    handler: MessageHandler,
}

#[derive(Default)]
struct FakeState {
    active: bool,
    connected: bool,
    hooks: Option<Arc<dyn TransportHooks>>,
    next_id: u64,
    // 按订阅标识排序，投递顺序稳定
    routes: BTreeMap<u64, Route>,
    calls: Vec<FakeCall>,
    connect_headers: Vec<Vec<(String, String)>>,
    fail_next_subscribe: Option<TransportError>,
}

#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 模拟一次成功的物理连接：先向管理器索取连接头部，再报告 `Connected`。
    ///
    /// 未启动时什么也不做，返回 `false`。
    pub fn connect(&self) -> bool {
        let hooks = {
            let state = self.state.lock();
            if !state.active {
                return false;
            }
            state.hooks.clone()
        };
        let Some(hooks) = hooks else { return false };
        let headers = hooks.connect_headers();
        {
            let mut state = self.state.lock();
            state.connect_headers.push(headers);
            state.connected = true;
        }
        hooks.on_event(TransportEvent::Connected);
        true
    }

    /// 模拟 WebSocket 关闭。会话中的订阅全部失效。
    pub fn close(&self, code: u16, reason: &str) {
        let hooks = self.drop_session();
        if let Some(hooks) = hooks {
            hooks.on_event(TransportEvent::Closed { code, reason: reason.to_string() });
        }
    }

    /// 模拟代理正常结束会话 (DISCONNECT 回执)。
    pub fn disconnect(&self) {
        if let Some(hooks) = self.drop_session() {
            hooks.on_event(TransportEvent::Disconnected);
        }
    }

    /// 模拟代理发送 ERROR 帧。会话保持不变，由测试决定之后是否关闭。
    pub fn protocol_error(&self, message: &str) {
        let hooks = self.state.lock().hooks.clone();
        if let Some(hooks) = hooks {
            hooks.on_event(TransportEvent::ProtocolError { message: message.to_string() });
        }
    }

    /// 模拟网络错误。会话中的订阅全部失效。
    pub fn transport_error(&self, message: &str) {
        if let Some(hooks) = self.drop_session() {
            hooks.on_event(TransportEvent::TransportError { message: message.to_string() });
        }
    }

    /// 向订阅了 `destination` 的所有回调投递一条消息，返回投递次数。
    pub fn deliver(&self, destination: &str, body: &str) -> usize {
        let targets: Vec<(String, MessageHandler)> = {
            let state = self.state.lock();
            state
                .routes
                .iter()
                .filter(|(_, route)| route.destination == destination)
                .map(|(id, route)| (format!("sub-{}", id), route.handler.clone()))
                .collect()
        };
        for (subscription, handler) in &targets {
            handler(&InboundMessage {
                destination: destination.to_string(),
                subscription: subscription.clone(),
                body: body.to_string(),
            });
        }
        targets.len()
    }

    /// 让下一次 `subscribe` 调用以给定错误失败。
    pub fn fail_next_subscribe(&self, error: TransportError) {
        self.state.lock().fail_next_subscribe = Some(error);
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state.lock().calls.clone()
    }

    /// 按调用顺序列出 `subscribe` 的目标主题。
    pub fn subscribed_destinations(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                FakeCall::Subscribe { destination, .. } => Some(destination.clone()),
                _ => None,
            })
            .collect()
    }

    /// 当前会话中仍有效的订阅数。
    pub fn route_count(&self) -> usize {
        self.state.lock().routes.len()
    }

    /// 每次连接时管理器提供的 CONNECT 头部。
    pub fn connect_headers(&self) -> Vec<Vec<(String, String)>> {
        self.state.lock().connect_headers.clone()
    }

    fn drop_session(&self) -> Option<Arc<dyn TransportHooks>> {
        let mut state = self.state.lock();
        state.connected = false;
        state.routes.clear();
        if state.active {
            state.hooks.clone()
        } else {
            None
        }
    }
}

impl Transport for FakeTransport {
    fn activate(&self, hooks: Arc<dyn TransportHooks>) {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::Activate);
        if state.active {
            return;
        }
        state.active = true;
        state.hooks = Some(hooks);
    }

    fn deactivate(&self) {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::Deactivate);
        state.active = false;
        state.connected = false;
        state.hooks = None;
        state.routes.clear();
    }

    fn is_active(&self) -> bool {
        self.state.lock().active
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn subscribe(&self, destination: &str, handler: MessageHandler) -> Result<SubscriptionId, TransportError> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_next_subscribe.take() {
            return Err(error);
        }
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        let id = state.next_id;
        state.next_id += 1;
        let subscription_id = format!("sub-{}", id);
        state.routes.insert(id, Route { destination: destination.to_string(), handler });
        state.calls.push(FakeCall::Subscribe { id: subscription_id.clone(), destination: destination.to_string() });
        Ok(subscription_id)
    }

    fn unsubscribe(&self, id: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.calls.push(FakeCall::Unsubscribe { id: id.to_string() });
        if let Some(numeric) = id.strip_prefix("sub-").and_then(|n| n.parse::<u64>().ok()) {
            state.routes.remove(&numeric);
        }
        Ok(())
    }
}
