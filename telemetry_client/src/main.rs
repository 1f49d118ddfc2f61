// telemetry_client/src/main.rs

//! `telemetry_monitor`：在终端中实时查看恒温器遥测。
//!
//! 用法：`telemetry_monitor [--config PATH] [--broker-url URL] [--token TOKEN] DEVICE_ID...`

use anyhow::{bail, Context};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry_client::config::{init_client_config, DEFAULT_CONFIG_FILE, ENV_TOKEN};
use telemetry_client::staleness::StalenessTracker;
use telemetry_client::{ConnectionManager, StaticTokenProvider, TelemetryMessage};

/// 过期检查的最短间隔。
const MIN_STALE_CHECK: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "telemetry_monitor", version, about = "订阅恒温器实时遥测并打印到日志")]
struct Cli {
    /// 配置文件路径，不存在时会写入一份默认配置
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// 覆盖配置中的代理地址
    #[arg(long)]
    broker_url: Option<String>,

    /// 访问令牌
    #[arg(long, env = ENV_TOKEN)]
    token: Option<String>,

    /// 要订阅的设备标识
    #[arg(required = true)]
    devices: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let rust_log_set = std::env::var_os("RUST_LOG").is_some();
    env_logger::Builder::new()
        .filter_level(LevelFilter::Trace)
        .filter_module("tungstenite", LevelFilter::Warn)
        .filter_module("tokio_tungstenite", LevelFilter::Warn)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init()
        .context("初始化 env_logger 日志服务失败")?;
    log::set_max_level(LevelFilter::Info);

    let mut config = init_client_config(&cli.config);
    if let Some(url) = cli.broker_url {
        config.broker_url = url;
    }
    config.validate().context("命令行参数无效")?;
    if !rust_log_set {
        match LevelFilter::from_str(&config.log_level) {
            Ok(level) => log::set_max_level(level),
            Err(_) => warn!("[遥测监视器] 无法识别的日志级别 '{}'，使用 info。", config.log_level),
        }
    }
    if cli.devices.iter().any(|d| d.trim().is_empty()) {
        bail!("设备标识不能为空");
    }

    info!("[遥测监视器] 正在启动，代理地址: {}", config.broker_url);
    let credentials = Arc::new(StaticTokenProvider::new(cli.token));
    let manager = ConnectionManager::from_config(&config, credentials);

    let _status_listener = manager.on_status_change(|status| info!("[遥测监视器] 连接状态: {}", status));

    let tracker = Arc::new(Mutex::new(StalenessTracker::new(config.stale_after())));
    manager.activate();
    let subscriptions: Vec<_> = cli
        .devices
        .iter()
        .map(|device_id| {
            let tracker = tracker.clone();
            manager.subscribe_to_device(device_id, move |message| {
                tracker.lock().record(&message.device_id, Instant::now());
                print_telemetry(&message);
            })
        })
        .collect();

    let mut stale_check = tokio::time::interval((config.stale_after() / 2).max(MIN_STALE_CHECK));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("[遥测监视器] 监听 Ctrl-C 失败: {}", e);
                }
                break;
            }
            _ = stale_check.tick() => {
                let now = Instant::now();
                let tracker = tracker.lock();
                let stale: Vec<&String> = cli.devices.iter().filter(|d| tracker.is_stale(d, now)).collect();
                if !stale.is_empty() {
                    warn!("[遥测监视器] 以下设备超过 {:?} 没有新数据: {:?}", tracker.window(), stale);
                }
            }
        }
    }

    info!("[遥测监视器] 收到退出信号，正在取消订阅并断开连接...");
    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    manager.deactivate();
    // 给后台连接任务留出发送 DISCONNECT 的时间
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("[遥测监视器] 已退出。");
    Ok(())
}

fn print_telemetry(message: &TelemetryMessage) {
    let local = message.timestamp.with_timezone(&chrono::Local);
    let target = match message.data.target_temperature {
        Some(t) => format!("{:.1}°C", t),
        None => "-".to_string(),
    };
    info!(
        "[遥测] {} @ {} 当前 {:.1}°C 目标 {} 加热 {}",
        message.device_id,
        local.format("%H:%M:%S%.3f"),
        message.data.current_temperature,
        target,
        if message.data.heating_status { "开" } else { "关" }
    );
}
