// rust_stomp_utils/src/timer.rs

//! 心跳发送与超时检测用的计时器，客户端与服务端共用。
//!
//! 心跳被禁用 (协商结果为 `None`) 时，对应的等待永远不会完成，
//! 可以直接放进 `tokio::select!` 的分支中。

use crate::frame::NegotiatedHeartBeat;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

/// 连续两个协商间隔内没有收到任何数据即判定连接失效。
pub const WATCHDOG_FACTOR: u32 = 2;

/// 按协商结果创建心跳发送计时器，第一次触发在一个间隔之后。
pub fn heartbeat_timer(heartbeat: &NegotiatedHeartBeat) -> Option<Interval> {
    heartbeat.send_every.map(|every| {
        let mut timer = interval_at(Instant::now() + every, every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    })
}

/// 对端静默超过该时长即视为连接失效；不检测时为 `None`。
pub fn watchdog_limit(heartbeat: &NegotiatedHeartBeat) -> Option<Duration> {
    heartbeat.expect_every.map(|every| every * WATCHDOG_FACTOR)
}

/// 等待计时器下一次触发；没有计时器时永远挂起。
pub async fn tick_opt(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// 等待到期；没有期限时永远挂起。
pub async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
