// rust_stomp_utils/src/frame.rs

//! STOMP 1.2 帧的定义、编码与解析。
//!
//! 一个 STOMP 帧的线上格式为：
//!
//! ```text
//! COMMAND\n
//! header1:value1\n
//! header2:value2\n
//! \n
//! body^@
//! ```
//!
//! 其中 `^@` 为 NUL 字节。帧与帧之间可以夹杂任意数量的换行 (EOL)，
//! 单独的 EOL 即心跳。一个 WebSocket 文本消息中可能包含多个帧。

use crate::error::{Result, StompError};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 代理与客户端协商使用的 WebSocket 子协议名称。
pub const STOMP_SUBPROTOCOL: &str = "v12.stomp";

/// 客户端在 CONNECT 帧中声明支持的 STOMP 版本。
pub const ACCEPT_VERSIONS: &str = "1.2,1.1,1.0";

/// STOMP 帧命令。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StompCommand {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl StompCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            StompCommand::Connect => "CONNECT",
            StompCommand::Stomp => "STOMP",
            StompCommand::Connected => "CONNECTED",
            StompCommand::Send => "SEND",
            StompCommand::Subscribe => "SUBSCRIBE",
            StompCommand::Unsubscribe => "UNSUBSCRIBE",
            StompCommand::Ack => "ACK",
            StompCommand::Nack => "NACK",
            StompCommand::Begin => "BEGIN",
            StompCommand::Commit => "COMMIT",
            StompCommand::Abort => "ABORT",
            StompCommand::Disconnect => "DISCONNECT",
            StompCommand::Message => "MESSAGE",
            StompCommand::Receipt => "RECEIPT",
            StompCommand::Error => "ERROR",
        }
    }

    /// CONNECT / STOMP / CONNECTED 帧的头部不做转义处理 (STOMP 1.2 规定)。
    fn escapes_headers(&self) -> bool {
        !matches!(self, StompCommand::Connect | StompCommand::Stomp | StompCommand::Connected)
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StompCommand {
    type Err = StompError;

    fn from_str(s: &str) -> Result<Self> {
        let command = match s {
            "CONNECT" => StompCommand::Connect,
            "STOMP" => StompCommand::Stomp,
            "CONNECTED" => StompCommand::Connected,
            "SEND" => StompCommand::Send,
            "SUBSCRIBE" => StompCommand::Subscribe,
            "UNSUBSCRIBE" => StompCommand::Unsubscribe,
            "ACK" => StompCommand::Ack,
            "NACK" => StompCommand::Nack,
            "BEGIN" => StompCommand::Begin,
            "COMMIT" => StompCommand::Commit,
            "ABORT" => StompCommand::Abort,
            "DISCONNECT" => StompCommand::Disconnect,
            "MESSAGE" => StompCommand::Message,
            "RECEIPT" => StompCommand::Receipt,
            "ERROR" => StompCommand::Error,
            other => return Err(StompError::FrameParse(format!("未知的 STOMP 命令: '{}'", other))),
        };
        Ok(command)
    }
}

/// 一个 STOMP 帧。
///
/// 头部保持收到时的顺序；同名头部重复出现时，以第一次出现的值为准。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: StompCommand) -> Self {
        Self { command, headers: Vec::new(), body: String::new() }
    }

    /// 追加一个头部并返回自身，便于链式构造。
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// 查找头部的值 (第一次出现者)。
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// ERROR 帧的可读描述：优先取 `message` 头部，为空时退回到帧体。
    pub fn error_text(&self) -> String {
        match self.header("message") {
            Some(message) if !message.trim().is_empty() => message.to_string(),
            _ => self.body.clone(),
        }
    }

    // ---- 常用帧的构造函数 ----

    /// 构造客户端 CONNECT 帧。`extra_headers` 通常携带 `Authorization` 等认证信息。
    pub fn connect(host: &str, heartbeat: HeartBeat, extra_headers: &[(String, String)]) -> Self {
        let mut frame = StompFrame::new(StompCommand::Connect)
            .with_header("accept-version", ACCEPT_VERSIONS)
            .with_header("host", host)
            .with_header("heart-beat", heartbeat.to_header_value());
        frame.headers.extend(extra_headers.iter().cloned());
        frame
    }

    pub fn connected(version: &str, heartbeat: HeartBeat) -> Self {
        StompFrame::new(StompCommand::Connected)
            .with_header("version", version)
            .with_header("heart-beat", heartbeat.to_header_value())
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        StompFrame::new(StompCommand::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        StompFrame::new(StompCommand::Unsubscribe).with_header("id", id)
    }

    pub fn disconnect(receipt: &str) -> Self {
        StompFrame::new(StompCommand::Disconnect).with_header("receipt", receipt)
    }

    pub fn receipt(receipt_id: &str) -> Self {
        StompFrame::new(StompCommand::Receipt).with_header("receipt-id", receipt_id)
    }

    pub fn message(destination: &str, subscription: &str, message_id: &str, body: impl Into<String>) -> Self {
        StompFrame::new(StompCommand::Message)
            .with_header("destination", destination)
            .with_header("subscription", subscription)
            .with_header("message-id", message_id)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    pub fn error(message: &str, details: impl Into<String>) -> Self {
        StompFrame::new(StompCommand::Error)
            .with_header("message", message)
            .with_header("content-type", "text/plain")
            .with_body(details)
    }

    /// 将帧编码为线上文本 (以 NUL 结尾)。
    ///
    /// 帧体非空且未显式给出 `content-length` 时自动补上。
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => {
                return Err(StompError::FrameParse(format!("头部含有未定义的转义序列: '\\{}'", other.map(String::from).unwrap_or_default())));
            }
        }
    }
    Ok(out)
}

/// 判断一段文本是否只由 EOL 组成 (即一个或多个心跳)。
pub fn is_heartbeat(text: &str) -> bool {
    text.chars().all(|c| c == '\n' || c == '\r')
}

/// 解析一段文本中包含的全部 STOMP 帧。
///
/// 帧之间的 EOL 心跳会被跳过；只含心跳的文本返回空列表。
pub fn parse_frames(text: &str) -> Result<Vec<StompFrame>> {
    let mut frames = Vec::new();
    let mut rest = text;
    loop {
        rest = rest.trim_start_matches(['\n', '\r']);
        if rest.is_empty() {
            break;
        }
        let (frame, consumed) = parse_one(rest)?;
        frames.push(frame);
        rest = &rest[consumed..];
    }
    Ok(frames)
}

/// 读取从 `pos` 开始的一行 (去掉结尾的 `\r`)，并把 `pos` 移到下一行开头。
fn next_line<'a>(input: &'a str, pos: &mut usize) -> Result<&'a str> {
    let remaining = &input[*pos..];
    let end = remaining
        .find('\n')
        .ok_or_else(|| StompError::FrameParse("帧在头部结束前被截断".to_string()))?;
    *pos += end + 1;
    let line = &remaining[..end];
    Ok(line.strip_suffix('\r').unwrap_or(line))
}

/// 从 `input` 开头解析一个帧，返回帧和消耗的字节数 (包括结尾的 NUL)。
fn parse_one(input: &str) -> Result<(StompFrame, usize)> {
    let mut pos = 0usize;
    let command: StompCommand = next_line(input, &mut pos)?.parse()?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let line = next_line(input, &mut pos)?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StompError::FrameParse(format!("头部缺少冒号: '{}'", line)))?;
        if escaped {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| StompError::FrameParse(format!("无效的 content-length: '{}'", v)))
        })
        .transpose()?;

    let remaining = &input[pos..];
    let body_len = match content_length {
        Some(len) => {
            if remaining.as_bytes().get(len) != Some(&0) {
                return Err(StompError::FrameParse(format!("content-length 为 {} 但帧体后没有 NUL 结束符", len)));
            }
            len
        }
        None => remaining
            .find('\0')
            .ok_or_else(|| StompError::FrameParse("帧缺少 NUL 结束符".to_string()))?,
    };
    let body = remaining
        .get(..body_len)
        .ok_or_else(|| StompError::FrameParse("content-length 落在多字节字符中间".to_string()))?
        .to_string();

    Ok((StompFrame { command, headers, body }, pos + body_len + 1))
}

/// `heart-beat` 头部的取值 `cx,cy`。
///
/// `outgoing_ms` 为本端最短能以多长间隔发送心跳，`incoming_ms` 为本端希望
/// 收到对端心跳的间隔。0 表示不发送 / 不需要。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub outgoing_ms: u64,
    pub incoming_ms: u64,
}

/// 协商后的心跳节奏。`None` 表示该方向不启用心跳。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiatedHeartBeat {
    pub send_every: Option<Duration>,
    pub expect_every: Option<Duration>,
}

impl HeartBeat {
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self { outgoing_ms, incoming_ms }
    }

    pub fn to_header_value(&self) -> String {
        format!("{},{}", self.outgoing_ms, self.incoming_ms)
    }

    /// 解析 `heart-beat` 头部；格式不正确时返回错误。
    pub fn parse(value: &str) -> Result<Self> {
        let (out, inc) = value
            .split_once(',')
            .ok_or_else(|| StompError::FrameParse(format!("无效的 heart-beat 头部: '{}'", value)))?;
        let parse = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| StompError::FrameParse(format!("无效的 heart-beat 头部: '{}'", value)))
        };
        Ok(Self { outgoing_ms: parse(out)?, incoming_ms: parse(inc)? })
    }

    /// 以本端为视角，与对端声明的心跳取值协商出实际节奏。
    ///
    /// 发送间隔为 max(本端 outgoing, 对端 incoming)，任一方为 0 则不发送；
    /// 期望接收间隔为 max(本端 incoming, 对端 outgoing)，任一方为 0 则不检查。
    pub fn negotiate(&self, peer: &HeartBeat) -> NegotiatedHeartBeat {
        let pick = |mine: u64, theirs: u64| {
            if mine == 0 || theirs == 0 {
                None
            } else {
                Some(Duration::from_millis(mine.max(theirs)))
            }
        };
        NegotiatedHeartBeat {
            send_every: pick(self.outgoing_ms, peer.incoming_ms),
            expect_every: pick(self.incoming_ms, peer.outgoing_ms),
        }
    }
}
