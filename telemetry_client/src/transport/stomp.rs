// telemetry_client/src/transport/stomp.rs

//! 基于 STOMP over WebSocket 的生产环境传输层。
//!
//! 每次 `activate` 启动一个 Tokio 连接任务，循环执行：
//! 索取连接头部 → 连接并完成 STOMP 握手 → 运行会话 (命令、心跳、入站帧)
//! → 会话结束后报告事件 → 等待固定的重连间隔 → 再次连接，次数不限。
//!
//! 同步方法 (`subscribe` / `unsubscribe` / `deactivate`) 通过无界命令通道与连接任务
//! 通信，因此可以在任何线程 (包括消息回调内部) 调用。

use super::{
    InboundMessage, MessageHandler, SubscriptionId, Transport, TransportError, TransportEvent, TransportHooks,
    CLOSE_ABNORMAL,
};
use crate::config::ClientConfig;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rust_stomp_utils::client::transport::{connect_client, ClientConnection};
use rust_stomp_utils::timer::{heartbeat_timer, sleep_until_opt, tick_opt, watchdog_limit};
use rust_stomp_utils::{next_inbound, HeartBeat, Inbound, StompCommand, StompError, StompFrame};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// 主动断开时等待 DISCONNECT 回执的最长时间。
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// 连接任务的参数。
#[derive(Debug, Clone)]
pub struct StompSettings {
    pub broker_url: String,
    pub heartbeat: HeartBeat,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl From<&ClientConfig> for StompSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            broker_url: config.broker_url.clone(),
            heartbeat: config.heartbeat(),
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

enum Command {
    Subscribe { id: SubscriptionId, destination: String },
    Unsubscribe { id: SubscriptionId },
    Shutdown,
}

struct Route {
    destination: String,
    handler: MessageHandler,
}

/// 一次 activate 对应的运行状态，由同步方法与连接任务共享。
#[derive(Default)]
struct RunState {
    connected: AtomicBool,
    stopped: AtomicBool,
    routes: Mutex<HashMap<SubscriptionId, Route>>,
}

struct RunHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<RunState>,
}

pub struct StompTransport {
    settings: StompSettings,
    run: Mutex<Option<RunHandle>>,
    next_subscription: AtomicU64,
}

impl StompTransport {
    pub fn new(settings: StompSettings) -> Arc<Self> {
        Arc::new(Self { settings, run: Mutex::new(None), next_subscription: AtomicU64::new(0) })
    }
}

impl Transport for StompTransport {
    fn activate(&self, hooks: Arc<dyn TransportHooks>) {
        let mut run = self.run.lock();
        if run.is_some() {
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                drop(run);
                error!("[STOMP传输] 无法启动连接任务: {}", e);
                hooks.on_event(TransportEvent::TransportError { message: TransportError::NoRuntime.to_string() });
                return;
            }
        };
        let (commands, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(RunState::default());
        runtime.spawn(run_connection_loop(self.settings.clone(), state.clone(), hooks, receiver));
        *run = Some(RunHandle { commands, state });
        info!("[STOMP传输] 已启动连接任务，代理地址: {}", self.settings.broker_url);
    }

    fn deactivate(&self) {
        let Some(run) = self.run.lock().take() else { return };
        run.state.stopped.store(true, Ordering::SeqCst);
        run.state.connected.store(false, Ordering::SeqCst);
        run.state.routes.lock().clear();
        if run.commands.send(Command::Shutdown).is_err() {
            debug!("[STOMP传输] 连接任务已结束，无需发送停止命令。");
        }
        info!("[STOMP传输] 已请求停止连接任务。");
    }

    fn is_active(&self) -> bool {
        self.run.lock().is_some()
    }

    fn is_connected(&self) -> bool {
        self.run.lock().as_ref().map_or(false, |run| run.state.connected.load(Ordering::SeqCst))
    }

    fn subscribe(&self, destination: &str, handler: MessageHandler) -> Result<SubscriptionId, TransportError> {
        let run = self.run.lock();
        let run = run.as_ref().ok_or(TransportError::NotConnected)?;
        if !run.state.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let id = format!("sub-{}", self.next_subscription.fetch_add(1, Ordering::SeqCst));
        run.state.routes.lock().insert(id.clone(), Route { destination: destination.to_string(), handler });
        let command = Command::Subscribe { id: id.clone(), destination: destination.to_string() };
        if run.commands.send(command).is_err() {
            run.state.routes.lock().remove(&id);
            return Err(TransportError::ChannelClosed);
        }
        Ok(id)
    }

    fn unsubscribe(&self, id: &str) -> Result<(), TransportError> {
        let run = self.run.lock();
        let Some(run) = run.as_ref() else { return Ok(()) };
        let removed = run.state.routes.lock().remove(id).is_some();
        if removed && run.state.connected.load(Ordering::SeqCst) {
            run.commands
                .send(Command::Unsubscribe { id: id.to_string() })
                .map_err(|_| TransportError::ChannelClosed)?;
        }
        Ok(())
    }
}

/// 会话结束的原因。
enum SessionEnd {
    Shutdown,
    Closed { code: u16, reason: String },
    Failed(String),
}

fn emit(state: &RunState, hooks: &Arc<dyn TransportHooks>, event: TransportEvent) {
    if state.stopped.load(Ordering::SeqCst) {
        debug!("[STOMP传输] 传输层已停止，丢弃事件 {:?}", event);
        return;
    }
    hooks.on_event(event);
}

/// 在非会话期间等待停止命令；其余命令已无意义，直接丢弃。
async fn wait_for_shutdown(commands: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match commands.recv().await {
            Some(Command::Shutdown) | None => return,
            Some(Command::Subscribe { id, .. }) | Some(Command::Unsubscribe { id }) => {
                debug!("[STOMP传输] 当前没有会话，丢弃针对 {} 的命令。", id);
            }
        }
    }
}

async fn run_connection_loop(
    settings: StompSettings,
    state: Arc<RunState>,
    hooks: Arc<dyn TransportHooks>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let headers = hooks.connect_headers();
        debug!("[STOMP传输] 第 {} 次连接尝试: {}", attempt, settings.broker_url);

        let outcome = tokio::select! {
            result = connect_client(&settings.broker_url, &headers, settings.heartbeat, settings.connect_timeout) => result,
            _ = wait_for_shutdown(&mut commands) => {
                debug!("[STOMP传输] 连接过程中收到停止命令。");
                return;
            }
        };

        match outcome {
            Ok(connection) => {
                attempt = 0;
                state.routes.lock().clear();
                state.connected.store(true, Ordering::SeqCst);
                emit(&state, &hooks, TransportEvent::Connected);

                let end = run_session(connection, &state, &hooks, &mut commands).await;
                state.connected.store(false, Ordering::SeqCst);
                state.routes.lock().clear();
                match end {
                    SessionEnd::Shutdown => {
                        info!("[STOMP传输] 连接任务已停止。");
                        return;
                    }
                    SessionEnd::Closed { code, reason } => {
                        info!("[STOMP传输] 连接已关闭: code={}, reason='{}'", code, reason);
                        emit(&state, &hooks, TransportEvent::Closed { code, reason });
                    }
                    SessionEnd::Failed(message) => {
                        warn!("[STOMP传输] 会话异常结束: {}", message);
                        emit(&state, &hooks, TransportEvent::TransportError { message: message.clone() });
                        emit(&state, &hooks, TransportEvent::Closed { code: CLOSE_ABNORMAL, reason: message });
                    }
                }
            }
            Err(StompError::Rejected(message)) => {
                emit(&state, &hooks, TransportEvent::ProtocolError { message });
            }
            Err(e) => {
                warn!("[STOMP传输] 连接 {} 失败: {}", settings.broker_url, e);
                emit(&state, &hooks, TransportEvent::TransportError { message: e.to_string() });
            }
        }

        debug!("[STOMP传输] {:?} 后重新连接。", settings.reconnect_delay);
        tokio::select! {
            _ = tokio::time::sleep(settings.reconnect_delay) => {}
            _ = wait_for_shutdown(&mut commands) => {
                debug!("[STOMP传输] 重连等待期间收到停止命令。");
                return;
            }
        }
    }
}

async fn run_session(
    mut connection: ClientConnection,
    state: &RunState,
    hooks: &Arc<dyn TransportHooks>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> SessionEnd {
    for frame in std::mem::take(&mut connection.early_frames) {
        handle_frame(frame, state, hooks);
    }

    let mut send_timer = heartbeat_timer(&connection.heartbeat);
    let watchdog = watchdog_limit(&connection.heartbeat);
    let mut last_inbound = Instant::now();

    loop {
        let deadline = watchdog.map(|limit| last_inbound + limit);
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Subscribe { id, destination }) => {
                    let still_wanted = state.routes.lock().contains_key(&id);
                    if still_wanted {
                        if let Err(e) = connection.send_frame(&StompFrame::subscribe(&id, &destination)).await {
                            return SessionEnd::Failed(format!("发送 SUBSCRIBE 失败: {}", e));
                        }
                        debug!("[STOMP传输] 已订阅 {} ({})", destination, id);
                    }
                }
                Some(Command::Unsubscribe { id }) => {
                    if let Err(e) = connection.send_frame(&StompFrame::unsubscribe(&id)).await {
                        return SessionEnd::Failed(format!("发送 UNSUBSCRIBE 失败: {}", e));
                    }
                    debug!("[STOMP传输] 已取消订阅 {}", id);
                }
                Some(Command::Shutdown) | None => {
                    if let Err(e) = connection.disconnect(DISCONNECT_GRACE).await {
                        debug!("[STOMP传输] 断开连接时出错: {}", e);
                    }
                    return SessionEnd::Shutdown;
                }
            },
            _ = tick_opt(&mut send_timer) => {
                if let Err(e) = connection.send_heartbeat().await {
                    return SessionEnd::Failed(format!("发送心跳失败: {}", e));
                }
            },
            _ = sleep_until_opt(deadline) => {
                return SessionEnd::Failed(format!("超过 {:?} 没有收到代理的心跳", watchdog.unwrap_or_default()));
            },
            inbound = next_inbound(&mut connection.ws_receiver) => match inbound {
                Some(Ok(Inbound::Frames(frames))) => {
                    last_inbound = Instant::now();
                    for frame in frames {
                        handle_frame(frame, state, hooks);
                    }
                }
                Some(Ok(Inbound::HeartBeat)) => last_inbound = Instant::now(),
                Some(Ok(Inbound::Close { code, reason })) => return SessionEnd::Closed { code, reason },
                Some(Err(StompError::FrameParse(e))) => {
                    last_inbound = Instant::now();
                    warn!("[STOMP传输] 丢弃无法解析的数据: {}", e);
                }
                Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                None => return SessionEnd::Closed { code: CLOSE_ABNORMAL, reason: "连接已断开".to_string() },
            },
        }
    }
}

fn handle_frame(frame: StompFrame, state: &RunState, hooks: &Arc<dyn TransportHooks>) {
    match frame.command {
        StompCommand::Message => {
            let subscription = frame.header("subscription").unwrap_or_default().to_string();
            let route = state
                .routes
                .lock()
                .get(&subscription)
                .map(|route| (route.destination.clone(), route.handler.clone()));
            match route {
                Some((subscribed, handler)) => {
                    let destination = frame.header("destination").map(str::to_string).unwrap_or(subscribed);
                    handler(&InboundMessage { destination, subscription, body: frame.body });
                }
                None => debug!("[STOMP传输] 丢弃发往未知订阅 '{}' 的消息", subscription),
            }
        }
        StompCommand::Error => {
            let mut message = frame.error_text();
            let details = frame.body.trim();
            if !details.is_empty() && details != message {
                message = format!("{}: {}", message, details);
            }
            warn!("[STOMP传输] 代理返回 ERROR 帧: {}", message);
            emit(state, hooks, TransportEvent::ProtocolError { message });
        }
        StompCommand::Receipt => debug!("[STOMP传输] 收到回执 {:?}", frame.header("receipt-id")),
        other => debug!("[STOMP传输] 忽略 {} 帧", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_sim::config::BrokerConfig;
    use broker_sim::start_broker;

    const WAIT: Duration = Duration::from_secs(10);

    struct RecordingHooks {
        token: String,
        events: mpsc::UnboundedSender<TransportEvent>,
    }

    impl TransportHooks for RecordingHooks {
        fn connect_headers(&self) -> Vec<(String, String)> {
            vec![("Authorization".to_string(), format!("Bearer {}", self.token))]
        }

        fn on_event(&self, event: TransportEvent) {
            let _ = self.events.send(event);
        }
    }

    fn hooks(token: &str) -> (Arc<dyn TransportHooks>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Arc::new(RecordingHooks { token: token.to_string(), events }), receiver)
    }

    fn settings(broker_url: String) -> StompSettings {
        StompSettings {
            broker_url,
            heartbeat: HeartBeat::new(0, 0),
            reconnect_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(2),
        }
    }

    async fn next_event(receiver: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(WAIT, receiver.recv()).await.expect("等待传输层事件超时").expect("事件通道已关闭")
    }

    #[test]
    fn test_activate_without_runtime_reports_transport_error() {
        let transport = StompTransport::new(settings("ws://127.0.0.1:1/ws".to_string()));
        let (hooks, mut receiver) = hooks("t");
        transport.activate(hooks);
        assert!(!transport.is_active());
        assert!(matches!(receiver.try_recv(), Ok(TransportEvent::TransportError { .. })));
    }

    #[test]
    fn test_subscribe_requires_connection() {
        let transport = StompTransport::new(settings("ws://127.0.0.1:1/ws".to_string()));
        let result = transport.subscribe("/topic/device.x", Arc::new(|_: &InboundMessage| {}));
        assert_eq!(result, Err(TransportError::NotConnected));
        assert_eq!(transport.unsubscribe("sub-0"), Ok(()));
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_error_and_retries() {
        let transport = StompTransport::new(settings("ws://127.0.0.1:1/ws".to_string()));
        let (hooks, mut receiver) = hooks("t");
        transport.activate(hooks);
        assert!(matches!(next_event(&mut receiver).await, TransportEvent::TransportError { .. }));
        assert!(matches!(next_event(&mut receiver).await, TransportEvent::TransportError { .. }));
        transport.deactivate();
        assert!(!transport.is_active());
    }

    #[tokio::test]
    async fn test_routes_messages_and_stops_cleanly() {
        let _ = env_logger::builder().is_test(true).try_init();
        let broker = start_broker(BrokerConfig { port: 0, heartbeat_ms: 0, ..BrokerConfig::default() }, false)
            .await
            .expect("启动代理失败");
        let transport = StompTransport::new(settings(broker.ws_url()));
        let (hooks, mut receiver) = hooks("demo-token");
        transport.activate(hooks);
        assert_eq!(next_event(&mut receiver).await, TransportEvent::Connected);
        assert!(transport.is_connected());

        let (bodies_tx, mut bodies) = mpsc::unbounded_channel();
        let id = transport
            .subscribe(
                "/topic/device.thermostat-1",
                Arc::new(move |message: &InboundMessage| {
                    let _ = bodies_tx.send(message.body.clone());
                }),
            )
            .expect("已连接时订阅应成功");
        assert_eq!(id, "sub-0");

        let mut delivered = 0;
        for _ in 0..50 {
            delivered = broker.publish("/topic/device.thermostat-1", "{}");
            if delivered > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(delivered, 1);
        let body = tokio::time::timeout(WAIT, bodies.recv()).await.expect("等待消息超时");
        assert_eq!(body.as_deref(), Some("{}"));

        transport.deactivate();
        assert!(!transport.is_connected());
        // 停止后不再报告任何事件
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(receiver.try_recv().is_err());
    }
}
