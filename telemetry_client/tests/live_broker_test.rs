// telemetry_client/tests/live_broker_test.rs

//! 连接管理器 + STOMP 传输层对接本地开发代理的端到端测试。

use broker_sim::config::{BrokerConfig, DeviceConfig};
use broker_sim::{start_broker, RunningBroker};
use std::sync::Arc;
use std::time::Duration;
use telemetry_client::{ClientConfig, ConnectionManager, ConnectionStatus, StaticTokenProvider, TelemetryMessage};
use tokio::sync::{mpsc, watch};

const WAIT: Duration = Duration::from_secs(10);

fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn broker(with_simulators: bool) -> RunningBroker {
    let mut config = BrokerConfig { port: 0, publish_interval_ms: 50, heartbeat_ms: 200, ..BrokerConfig::default() };
    config.users.insert("other-token".to_string(), "other-user".to_string());
    config.devices.push(DeviceConfig {
        id: "thermostat-3".to_string(),
        owner: "other-user".to_string(),
        target_temperature: 20.0,
    });
    start_broker(config, with_simulators).await.expect("启动代理失败")
}

fn manager_for(broker: &RunningBroker, token: Option<&str>) -> ConnectionManager {
    let config = ClientConfig {
        broker_url: broker.ws_url(),
        reconnect_delay_ms: 100,
        heartbeat_incoming_ms: 200,
        heartbeat_outgoing_ms: 200,
        connect_timeout_ms: 2000,
        ..ClientConfig::default()
    };
    let credentials = Arc::new(StaticTokenProvider::new(token.map(str::to_string)));
    ConnectionManager::from_config(&config, credentials)
}

async fn wait_for_status(rx: &mut watch::Receiver<ConnectionStatus>, target: ConnectionStatus) {
    let reached = tokio::time::timeout(WAIT, async {
        loop {
            if *rx.borrow_and_update() == target {
                return;
            }
            if rx.changed().await.is_err() {
                panic!("状态通道已关闭");
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "等待状态 {} 超时，当前为 {}", target, *rx.borrow());
}

#[tokio::test]
async fn test_pending_subscription_receives_live_telemetry() {
    init_test_logger();
    let broker = broker(true).await;
    let manager = manager_for(&broker, Some("demo-token"));
    let mut status = manager.status_watch();

    let (tx, mut rx) = mpsc::unbounded_channel::<TelemetryMessage>();
    let subscription = manager.subscribe_to_device("thermostat-1", move |message| {
        let _ = tx.send(message);
    });
    assert!(manager.is_active());

    let message = tokio::time::timeout(WAIT, rx.recv()).await.expect("等待遥测超时").expect("回调通道已关闭");
    assert_eq!(message.device_id, "thermostat-1");
    assert_eq!(message.data.target_temperature, Some(21.0));
    wait_for_status(&mut status, ConnectionStatus::Connected).await;
    assert!(manager.is_connected());

    subscription.unsubscribe();
    manager.deactivate();
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert!(!manager.is_active());
}

#[tokio::test]
async fn test_invalid_token_reports_error() {
    init_test_logger();
    let broker = broker(false).await;
    let manager = manager_for(&broker, Some("wrong-token"));
    let mut status = manager.status_watch();

    manager.activate();
    wait_for_status(&mut status, ConnectionStatus::Error).await;
    manager.deactivate();
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_foreign_device_reports_error_and_owned_device_keeps_streaming() {
    init_test_logger();
    let broker = broker(true).await;
    let manager = manager_for(&broker, Some("other-token"));
    let mut status = manager.status_watch();

    let denied = manager.subscribe_to_device("thermostat-1", |_| {});
    let (tx, mut rx) = mpsc::unbounded_channel::<TelemetryMessage>();
    let owned = manager.subscribe_to_device("thermostat-3", move |message| {
        let _ = tx.send(message);
    });
    wait_for_status(&mut status, ConnectionStatus::Error).await;

    // 只有被拒绝的设备被放弃，自己的设备在重连后继续收到遥测
    let dropped = tokio::time::timeout(WAIT, async {
        while !denied.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(dropped.is_ok(), "被拒绝的订阅应被放弃");
    wait_for_status(&mut status, ConnectionStatus::Connected).await;
    assert!(!owned.is_cancelled());

    let message = tokio::time::timeout(WAIT, rx.recv()).await.expect("等待遥测超时").expect("回调通道已关闭");
    assert_eq!(message.device_id, "thermostat-3");
    assert_eq!(message.data.target_temperature, Some(20.0));
    assert!(!owned.is_cancelled());
    manager.deactivate();
}

#[tokio::test]
async fn test_deactivate_closes_broker_session() {
    init_test_logger();
    let broker = broker(false).await;
    let manager = manager_for(&broker, Some("demo-token"));
    let mut status = manager.status_watch();
    manager.activate();
    wait_for_status(&mut status, ConnectionStatus::Connected).await;
    assert_eq!(broker.manager().client_count(), 1);

    manager.deactivate();
    manager.deactivate();
    let closed = tokio::time::timeout(WAIT, async {
        while broker.manager().client_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(closed.is_ok(), "停用后代理侧会话应结束");
}
