// broker_sim/src/broker.rs

//! 在后台启动一个完整的开发代理 (服务 + 可选的模拟器)。

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::simulator::run_simulators;
use crate::ws_server::connection_manager::ConnectionManager;
use crate::ws_server::service::WsService;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// 正在运行的代理。丢弃时停止所有后台任务。
pub struct RunningBroker {
    local_addr: SocketAddr,
    ws_path: String,
    manager: Arc<ConnectionManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningBroker {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 客户端使用的地址，例如 `ws://127.0.0.1:8088/ws`。
    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.local_addr, self.ws_path)
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn publish(&self, destination: &str, body: &str) -> usize {
        self.manager.publish(destination, body)
    }

    pub fn shutdown(mut self) {
        self.abort_tasks();
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for RunningBroker {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// 绑定监听地址并在后台启动代理。
///
/// `with_simulators` 为 `true` 时同时启动配置中的恒温器模拟器。
pub async fn start_broker(config: BrokerConfig, with_simulators: bool) -> Result<RunningBroker, BrokerError> {
    config.validate()?;
    let interval = config.publish_interval();
    let ws_path = config.ws_path.clone();
    let manager = Arc::new(ConnectionManager::new(Arc::new(config)));
    let service = WsService::new(Arc::clone(&manager));
    let listener = service.bind().await?;
    let local_addr = listener.local_addr()?;

    let mut tasks = vec![tokio::spawn(async move {
        if let Err(e) = service.serve(listener).await {
            error!("[代理] 服务异常结束: {}", e);
        }
    })];
    if with_simulators {
        tasks.push(tokio::spawn(run_simulators(Arc::clone(&manager), interval)));
    }
    info!("[代理] 已在 ws://{}{} 上运行", local_addr, ws_path);
    Ok(RunningBroker { local_addr, ws_path, manager, tasks })
}
