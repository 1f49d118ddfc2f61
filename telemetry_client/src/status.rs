// telemetry_client/src/status.rs

//! 连接状态广播中心。
//!
//! 保存唯一的当前 [`ConnectionStatus`]，并把每一次真实的状态变化同步推送给所有
//! 已注册的监听者。新注册的监听者会立刻收到一次当前状态。
//!
//! 状态的修改与通知分为两步 ([`StatusHub::transition`] 与
//! [`StatusNotification::deliver`])：调用方可以先让新值生效，做完其他工作
//! (例如重放待处理订阅) 后再通知监听者。内部锁从不在调用监听者时持有，
//! 监听者可以在回调中查询状态或注销自己。

use common_models::ConnectionStatus;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// 状态监听回调。
pub type StatusListener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

struct HubState {
    current: ConnectionStatus,
    next_id: u64,
    listeners: HashMap<u64, StatusListener>,
}

pub struct StatusHub {
    state: Mutex<HubState>,
    watch_tx: Arc<watch::Sender<ConnectionStatus>>,
}

impl StatusHub {
    /// 创建状态中心，初始状态为 `Disconnected`。
    pub fn new() -> Arc<Self> {
        let initial = ConnectionStatus::default();
        let (watch_tx, _) = watch::channel(initial);
        Arc::new(Self {
            state: Mutex::new(HubState { current: initial, next_id: 0, listeners: HashMap::new() }),
            watch_tx: Arc::new(watch_tx),
        })
    }

    pub fn current(&self) -> ConnectionStatus {
        self.state.lock().current
    }

    /// 注册监听者，并立即用当前状态同步调用一次。
    pub fn register<F>(self: &Arc<Self>, listener: F) -> StatusSubscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let listener: StatusListener = Arc::new(listener);
        let (id, current) = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.listeners.insert(id, listener.clone());
            (id, state.current)
        };
        listener(current);
        StatusSubscription { hub: Arc::downgrade(self), id }
    }

    /// 异步消费者使用的状态接收端。
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.watch_tx.subscribe()
    }

    /// 设置新状态。值没有变化时返回 `None`，不会产生任何通知。
    ///
    /// 返回的通知必须调用 [`StatusNotification::deliver`] 才会送达监听者。
    #[must_use = "状态变化只有在 deliver() 之后才会通知监听者"]
    pub fn transition(&self, status: ConnectionStatus) -> Option<StatusNotification> {
        let mut state = self.state.lock();
        if state.current == status {
            return None;
        }
        debug!("[状态中心] {} -> {}", state.current, status);
        state.current = status;
        Some(StatusNotification {
            status,
            listeners: state.listeners.values().cloned().collect(),
            watch_tx: self.watch_tx.clone(),
        })
    }

    /// 设置新状态并立即通知。
    pub fn set(&self, status: ConnectionStatus) {
        if let Some(notification) = self.transition(status) {
            notification.deliver();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    fn remove(&self, id: u64) -> bool {
        self.state.lock().listeners.remove(&id).is_some()
    }
}

/// 一次尚未送达的状态变化。
#[must_use = "状态变化只有在 deliver() 之后才会通知监听者"]
pub struct StatusNotification {
    status: ConnectionStatus,
    listeners: Vec<StatusListener>,
    watch_tx: Arc<watch::Sender<ConnectionStatus>>,
}

impl StatusNotification {
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// 同步调用状态变化时已注册的全部监听者，并更新 watch 通道。
    pub fn deliver(self) {
        for listener in &self.listeners {
            listener(self.status);
        }
        self.watch_tx.send_replace(self.status);
    }
}

/// [`StatusHub::register`] 返回的注销句柄。丢弃句柄不会注销监听者。
#[derive(Debug)]
pub struct StatusSubscription {
    hub: Weak<StatusHub>,
    id: u64,
}

impl StatusSubscription {
    /// 注销这一个监听者。可重复调用；返回本次调用是否真正移除了监听者。
    pub fn unsubscribe(&self) -> bool {
        match self.hub.upgrade() {
            Some(hub) => hub.remove(self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<ConnectionStatus>>>, impl Fn(ConnectionStatus) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |status| sink.lock().push(status))
    }

    #[test]
    fn test_register_delivers_current_status_immediately() {
        let hub = StatusHub::new();
        let (seen, listener) = recorder();
        let _subscription = hub.register(listener);
        assert_eq!(*seen.lock(), vec![ConnectionStatus::Disconnected]);
    }

    #[test]
    fn test_same_value_transition_is_not_notified() {
        let hub = StatusHub::new();
        let (seen, listener) = recorder();
        let _subscription = hub.register(listener);

        hub.set(ConnectionStatus::Connecting);
        hub.set(ConnectionStatus::Connected);
        hub.set(ConnectionStatus::Connected);
        assert!(hub.transition(ConnectionStatus::Connected).is_none());

        assert_eq!(
            *seen.lock(),
            vec![ConnectionStatus::Disconnected, ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
    }

    #[test]
    /// 新值在 transition 后立即可读，监听者要等到 deliver 才收到通知。
    fn test_transition_then_deliver() {
        let hub = StatusHub::new();
        let (seen, listener) = recorder();
        let _subscription = hub.register(listener);

        let notification = hub.transition(ConnectionStatus::Error).expect("状态发生变化，应返回通知");
        assert_eq!(hub.current(), ConnectionStatus::Error);
        assert_eq!(seen.lock().len(), 1);

        notification.deliver();
        assert_eq!(seen.lock().last(), Some(&ConnectionStatus::Error));
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_removes_only_that_listener() {
        let hub = StatusHub::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let (f, s) = (first.clone(), second.clone());
        let sub_a = hub.register(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let _sub_b = hub.register(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        assert!(sub_a.unsubscribe());
        assert!(!sub_a.unsubscribe());
        assert_eq!(hub.listener_count(), 1);

        hub.set(ConnectionStatus::Connecting);
        assert_eq!(first.load(Ordering::SeqCst), 1, "已注销的监听者只应收到注册时的那一次");
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    /// 监听者在回调中查询状态、注销自己都不会死锁。
    fn test_listener_may_reenter_hub() {
        let hub = StatusHub::new();
        let slot: Arc<Mutex<Option<StatusSubscription>>> = Arc::new(Mutex::new(None));
        let observed = Arc::new(Mutex::new(Vec::new()));
        let (hub_ref, slot_ref, observed_ref) = (Arc::downgrade(&hub), slot.clone(), observed.clone());
        let subscription = hub.register(move |status| {
            if let Some(hub) = hub_ref.upgrade() {
                observed_ref.lock().push(hub.current());
            }
            if status == ConnectionStatus::Error {
                if let Some(subscription) = slot_ref.lock().as_ref() {
                    subscription.unsubscribe();
                }
            }
        });
        *slot.lock() = Some(subscription);

        hub.set(ConnectionStatus::Error);
        hub.set(ConnectionStatus::Connecting);
        assert_eq!(*observed.lock(), vec![ConnectionStatus::Disconnected, ConnectionStatus::Error]);
        assert_eq!(hub.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_follows_delivered_status() {
        let hub = StatusHub::new();
        let mut rx = hub.watch();
        assert_eq!(*rx.borrow(), ConnectionStatus::Disconnected);
        hub.set(ConnectionStatus::Connected);
        rx.changed().await.expect("watch 通道不应关闭");
        assert_eq!(*rx.borrow_and_update(), ConnectionStatus::Connected);
    }
}
