// rust_stomp_utils/src/inbound.rs

//! 把 WebSocket 接收流上的消息转换为 STOMP 层面的入站事件。
//!
//! 客户端与服务端共用：两者的接收端都是产出 `tungstenite::Message` 的 `Stream`，
//! 只是底层 TCP 流的类型不同。

use crate::error::StompError;
use crate::frame::{is_heartbeat, parse_frames, StompFrame};
use futures_util::{Stream, StreamExt};
use log::debug;
use tokio_tungstenite::tungstenite::{protocol::Message, Error as TungsteniteError};

/// 没有携带关闭帧的 Close 消息对应的状态码 (RFC 6455 "No Status Received")。
pub const CLOSE_CODE_NO_STATUS: u16 = 1005;

/// 一次读取得到的入站事件。
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// 一个或多个完整的 STOMP 帧。
    Frames(Vec<StompFrame>),
    /// 只含 EOL 的心跳。
    HeartBeat,
    /// 对端发起了 WebSocket 关闭握手。
    Close { code: u16, reason: String },
}

/// 从接收流中读取下一个入站事件。
///
/// # 返回
/// - `Some(Ok(inbound))`：读到了帧、心跳或关闭通知。
/// - `Some(Err(e))`：底层错误或帧解析失败。
/// - `None`：流已结束，连接已经关闭。
///
/// Ping / Pong 由 tungstenite 自动处理，这里直接跳过。
pub async fn next_inbound<S>(receiver: &mut S) -> Option<Result<Inbound, StompError>>
where
    S: Stream<Item = Result<Message, TungsteniteError>> + Unpin,
{
    loop {
        let message = match receiver.next().await? {
            Ok(message) => message,
            Err(TungsteniteError::ConnectionClosed | TungsteniteError::AlreadyClosed) => {
                debug!("[STOMP传输] 接收流报告连接已关闭。");
                return None;
            }
            Err(e) => return Some(Err(StompError::WebSocketProtocolError(e))),
        };
        match message {
            Message::Text(text) => return Some(decode_text(&text)),
            Message::Binary(bytes) => {
                return Some(match String::from_utf8(bytes) {
                    Ok(text) => decode_text(&text),
                    Err(_) => Err(StompError::FrameParse("二进制消息不是有效的 UTF-8 文本".to_string())),
                });
            }
            Message::Close(frame) => {
                let (code, reason) = match frame {
                    Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                    None => (CLOSE_CODE_NO_STATUS, String::new()),
                };
                debug!("[STOMP传输] 收到 Close 帧: code={}, reason='{}'", code, reason);
                return Some(Ok(Inbound::Close { code, reason }));
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        }
    }
}

fn decode_text(text: &str) -> Result<Inbound, StompError> {
    if is_heartbeat(text) {
        return Ok(Inbound::HeartBeat);
    }
    parse_frames(text).map(Inbound::Frames)
}
