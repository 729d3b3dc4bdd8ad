//! STOMP 1.2 frame codec.
//!
//! Wire format:
//! ```text
//! COMMAND\n
//! header1:value1\n
//! header2:value2\n
//! \n
//! body^@
//! ```
//! A bare EOL between frames is a heartbeat. Header values are escaped
//! (`\\`, `\n`, `\r`, `\c`) in every frame except CONNECT and CONNECTED.
//!
//! Bodies are kept as `String`: everything this crate exchanges is JSON or
//! plain-text error descriptions.

use std::time::Duration;
use thiserror::Error;

/// Upper bound for a single buffered frame.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Malformed header line: {0}")]
    MalformedHeader(String),
    #[error("Invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    #[error("Invalid content-length: {0}")]
    InvalidContentLength(String),
    #[error("Frame body not terminated by NUL")]
    MissingTerminator,
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("Frame exceeds {MAX_FRAME_BYTES} bytes")]
    TooLarge,
    #[error("Invalid heart-beat header: {0}")]
    InvalidHeartBeat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
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

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Result<Self, FrameError> {
        Ok(match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }

    fn escapes_headers(&self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of the first header named `name` (repeated headers: first wins).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    // ── Constructors ────────────────────────────────────────────

    pub fn connect(host: Option<&str>, heart_beat: HeartBeat) -> Self {
        let mut frame = Self::new(Command::Connect).header("accept-version", "1.2,1.1,1.0");
        if let Some(host) = host {
            frame = frame.header("host", host);
        }
        frame.header("heart-beat", heart_beat.to_string())
    }

    pub fn connected(heart_beat: HeartBeat) -> Self {
        Self::new(Command::Connected)
            .header("version", "1.2")
            .header("heart-beat", heart_beat.to_string())
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send_json(destination: &str, body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn message(destination: &str, subscription: &str, message_id: &str, body: &str) -> Self {
        Self::new(Command::Message)
            .header("destination", destination)
            .header("subscription", subscription)
            .header("message-id", message_id)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn disconnect(receipt: Option<&str>) -> Self {
        let frame = Self::new(Command::Disconnect);
        match receipt {
            Some(id) => frame.header("receipt", id),
            None => frame,
        }
    }

    pub fn receipt(receipt_id: &str) -> Self {
        Self::new(Command::Receipt).header("receipt-id", receipt_id)
    }

    pub fn error(message: &str, detail: impl Into<String>) -> Self {
        Self::new(Command::Error)
            .header("message", message)
            .header("content-type", "text/plain")
            .with_body(detail)
    }

    /// Serialize to wire format. `content-length` is added for non-empty
    /// bodies unless already present.
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
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Negotiated heart-beat advertised by this frame, `0,0` if absent.
    pub fn heart_beat(&self) -> Result<HeartBeat, FrameError> {
        match self.get("heart-beat") {
            Some(value) => value.parse(),
            None => Ok(HeartBeat::default()),
        }
    }
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(s.to_string())),
        }
    }
    Ok(out)
}

// ───────────────────────────────────────────────────────────────────
// Heart-beating
// ───────────────────────────────────────────────────────────────────

/// The `heart-beat:<send>,<recv>` header, milliseconds (0 = disabled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub send_ms: u64,
    pub recv_ms: u64,
}

impl HeartBeat {
    pub fn new(send_ms: u64, recv_ms: u64) -> Self {
        Self { send_ms, recv_ms }
    }

    /// Combine our advertised values with the peer's.
    pub fn negotiate(&self, remote: &HeartBeat) -> NegotiatedHeartBeat {
        let pick = |ours: u64, theirs: u64| {
            (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
        };
        NegotiatedHeartBeat {
            outgoing: pick(self.send_ms, remote.recv_ms),
            incoming: pick(self.recv_ms, remote.send_ms),
        }
    }
}

impl std::fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.send_ms, self.recv_ms)
    }
}

impl std::str::FromStr for HeartBeat {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (send, recv) = s
            .split_once(',')
            .ok_or_else(|| FrameError::InvalidHeartBeat(s.to_string()))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| FrameError::InvalidHeartBeat(s.to_string()))
        };
        Ok(Self {
            send_ms: parse(send)?,
            recv_ms: parse(recv)?,
        })
    }
}

/// Effective heartbeat intervals after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiatedHeartBeat {
    /// How often we must send something
    pub outgoing: Option<Duration>,
    /// How often we should hear something
    pub incoming: Option<Duration>,
}

// ───────────────────────────────────────────────────────────────────
// Streaming decoder
// ───────────────────────────────────────────────────────────────────

/// Decoded unit of inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Heartbeat,
    Frame(Frame),
}

/// Incremental decoder. WebSocket messages may carry several frames, a
/// frame split across messages, or bare heartbeats; feed everything through
/// [`FrameDecoder::push`] and drain with [`FrameDecoder::next_incoming`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete unit, `Ok(None)` if more input is needed.
    pub fn next_incoming(&mut self) -> Result<Option<Incoming>, FrameError> {
        match self.buf.first() {
            None => return Ok(None),
            Some(b'\n') => {
                self.buf.drain(..1);
                return Ok(Some(Incoming::Heartbeat));
            }
            Some(b'\r') => {
                return match self.buf.get(1) {
                    None => Ok(None),
                    Some(b'\n') => {
                        self.buf.drain(..2);
                        Ok(Some(Incoming::Heartbeat))
                    }
                    Some(_) => Err(FrameError::UnknownCommand("\r".into())),
                };
            }
            Some(_) => {}
        }

        let result = self.parse_frame();
        if matches!(result, Ok(None)) && self.buf.len() > MAX_FRAME_BYTES {
            self.buf.clear();
            return Err(FrameError::TooLarge);
        }
        result.map(|frame| frame.map(Incoming::Frame))
    }

    fn parse_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut pos = 0;
        let mut lines = Vec::new();
        loop {
            let Some(offset) = self.buf[pos..].iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let mut line = &self.buf[pos..pos + offset];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            pos += offset + 1;
            if line.is_empty() {
                break;
            }
            lines.push(std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)?.to_string());
        }

        let mut lines = lines.into_iter();
        let command = Command::parse(&lines.next().unwrap_or_default())?;
        let mut frame = Frame::new(command);
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.clone()))?;
            if command.escapes_headers() {
                frame.headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                frame.headers.push((name.to_string(), value.to_string()));
            }
        }

        let body_start = pos;
        let body_end = match frame.get("content-length") {
            Some(len) => {
                let len: usize = len
                    .trim()
                    .parse()
                    .map_err(|_| FrameError::InvalidContentLength(len.to_string()))?;
                if len > MAX_FRAME_BYTES {
                    return Err(FrameError::TooLarge);
                }
                let end = body_start + len;
                match self.buf.get(end) {
                    None => return Ok(None),
                    Some(0) => end,
                    Some(_) => return Err(FrameError::MissingTerminator),
                }
            }
            None => match self.buf[body_start..].iter().position(|&b| b == 0) {
                Some(offset) => body_start + offset,
                None => return Ok(None),
            },
        };

        frame.body = std::str::from_utf8(&self.buf[body_start..body_end])
            .map_err(|_| FrameError::InvalidUtf8)?
            .to_string();
        self.buf.drain(..=body_end);
        Ok(Some(frame))
    }
}

/// Decode every complete unit in `data`. Trailing partial input is an error.
pub fn decode_all(data: &[u8]) -> Result<Vec<Incoming>, FrameError> {
    let mut decoder = FrameDecoder::new();
    decoder.push(data);
    let mut out = Vec::new();
    while let Some(incoming) = decoder.next_incoming()? {
        out.push(incoming);
    }
    if decoder.buffered() > 0 {
        return Err(FrameError::MissingTerminator);
    }
    Ok(out)
}
