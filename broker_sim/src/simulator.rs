// broker_sim/src/simulator.rs

//! 恒温器模拟器。
//!
//! 加热时温度上升直到达到目标温度后停止加热；停止加热时温度缓慢下降，
//! 低于目标温度 0.5°C 后重新开始加热。每一步叠加少量随机扰动。

use crate::ws_server::connection_manager::ConnectionManager;
use common_models::{SensorData, TelemetryMessage};
use log::{debug, info, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// 停止加热后允许低于目标温度的幅度。
const HYSTERESIS: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct ThermostatSimulator {
    device_id: String,
    current_temperature: f64,
    target_temperature: f64,
    heating: bool,
}

impl ThermostatSimulator {
    pub fn new(device_id: impl Into<String>, current_temperature: f64, target_temperature: f64) -> Self {
        Self {
            device_id: device_id.into(),
            current_temperature,
            target_temperature,
            heating: current_temperature < target_temperature,
        }
    }

    /// 初始温度在 18~23°C 之间随机。
    pub fn with_random_start<R: Rng>(device_id: impl Into<String>, target_temperature: f64, rng: &mut R) -> Self {
        let start = round2(rng.gen_range(18.0..23.0));
        Self::new(device_id, start, target_temperature)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn current_temperature(&self) -> f64 {
        self.current_temperature
    }

    pub fn is_heating(&self) -> bool {
        self.heating
    }

    pub fn set_target(&mut self, target_temperature: f64) {
        self.target_temperature = target_temperature;
    }

    /// 推进一步模拟。
    pub fn step<R: Rng>(&mut self, rng: &mut R) {
        if self.heating {
            self.current_temperature += rng.gen_range(0.3..0.8);
            if self.current_temperature >= self.target_temperature {
                self.heating = false;
                debug!("[模拟器] {} 停止加热", self.device_id);
            }
        } else {
            self.current_temperature -= rng.gen_range(0.1..0.4);
            if self.current_temperature < self.target_temperature - HYSTERESIS {
                self.heating = true;
                debug!("[模拟器] {} 开始加热", self.device_id);
            }
        }
        self.current_temperature = round2(self.current_temperature + rng.gen_range(-0.1..0.1));
    }

    pub fn telemetry(&self) -> TelemetryMessage {
        TelemetryMessage::new(
            self.device_id.clone(),
            SensorData {
                current_temperature: self.current_temperature,
                target_temperature: Some(self.target_temperature),
                heating_status: self.heating,
            },
        )
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// 按固定间隔推进所有模拟器，并把遥测发布到各自的设备主题。
pub async fn run_simulators(manager: Arc<ConnectionManager>, interval: Duration) {
    let mut simulators: Vec<ThermostatSimulator> = {
        let mut rng = rand::thread_rng();
        manager
            .config()
            .devices
            .iter()
            .map(|device| ThermostatSimulator::with_random_start(device.id.clone(), device.target_temperature, &mut rng))
            .collect()
    };
    info!("[模拟器] 启动 {} 台恒温器，发布间隔 {:?}", simulators.len(), interval);

    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        {
            let mut rng = rand::thread_rng();
            for simulator in simulators.iter_mut() {
                simulator.step(&mut rng);
            }
        }
        for simulator in &simulators {
            let topic = manager.config().topic_for(simulator.device_id());
            match serde_json::to_string(&simulator.telemetry()) {
                Ok(body) => {
                    manager.publish(&topic, &body);
                }
                Err(e) => warn!("[模拟器] 序列化 {} 的遥测失败: {}", topic, e),
            }
        }
    }
}
