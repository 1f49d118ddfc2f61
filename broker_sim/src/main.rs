// broker_sim/src/main.rs

use anyhow::Context;
use broker_sim::config::{BrokerConfig, DEFAULT_CONFIG_FILE};
use broker_sim::start_broker;
use clap::Parser;
use log::{info, LevelFilter};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "broker_sim", version, about = "开发用 STOMP 消息代理与恒温器模拟器")]
struct Cli {
    /// 配置文件路径，不存在时会写入一份默认配置
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// 覆盖配置中的监听地址
    #[arg(long)]
    host: Option<String>,

    /// 覆盖配置中的端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 不启动恒温器模拟器，只提供代理
    #[arg(long)]
    no_simulators: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("tungstenite", LevelFilter::Warn)
        .filter_module("tokio_tungstenite", LevelFilter::Warn)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
    info!("[主程序] 日志系统已初始化。");

    let cli = Cli::parse();
    let mut config = BrokerConfig::load_or_create(&cli.config)
        .with_context(|| format!("加载配置文件 {:?} 失败", cli.config))?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    for (token, user) in &config.users {
        info!("[主程序] 可用令牌: {} (用户 {})", token, user);
    }
    for device in &config.devices {
        info!("[主程序] 设备 {} 属于 {}", device.id, device.owner);
    }

    let broker = start_broker(config, !cli.no_simulators).await.context("启动代理失败")?;
    info!("[主程序] 代理地址: {}，按 Ctrl-C 退出。", broker.ws_url());

    tokio::signal::ctrl_c().await?;
    info!("[主程序] 收到退出信号，正在停止代理...");
    broker.shutdown();
    Ok(())
}
