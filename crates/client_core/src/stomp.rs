use std::{fmt, time::Duration};

use thiserror::Error;

pub const ACCEPT_VERSIONS: &str = "1.2,1.1,1.0";
pub const HEARTBEAT_EOL: &str = "\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StompError {
    #[error("unknown STOMP command '{0}'")]
    UnknownCommand(String),
    #[error("malformed STOMP header line '{0}'")]
    MalformedHeader(String),
    #[error("STOMP frame is missing its NUL terminator")]
    Unterminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn parse(raw: &str) -> Result<Self, StompError> {
        Ok(match raw {
            "CONNECT" | "STOMP" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            other => return Err(StompError::UnknownCommand(other.to_string())),
        })
    }

    // CONNECT and CONNECTED headers are sent without escaping.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
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

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn connect(host: &str, outgoing: Duration, incoming: Duration) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", ACCEPT_VERSIONS)
            .header("host", host)
            .header(
                "heart-beat",
                format!("{},{}", outgoing.as_millis(), incoming.as_millis()),
            )
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

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
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

// Bare EOLs between frames are heartbeats.
pub fn decode(text: &str) -> Result<Vec<Frame>, StompError> {
    let mut frames = Vec::new();
    let mut rest = text;
    loop {
        rest = rest.trim_start_matches(['\n', '\r']);
        if rest.is_empty() {
            return Ok(frames);
        }
        let end = rest.find('\0').ok_or(StompError::Unterminated)?;
        frames.push(parse_frame(&rest[..end])?);
        rest = &rest[end + 1..];
    }
}

fn parse_frame(raw: &str) -> Result<Frame, StompError> {
    let (head, body) = match raw.find("\n\n") {
        Some(idx) => (&raw[..idx], &raw[idx + 2..]),
        None => match raw.find("\r\n\r\n") {
            Some(idx) => (&raw[..idx], &raw[idx + 4..]),
            None => (raw, ""),
        },
    };

    let mut lines = head.lines();
    let command = Command::parse(lines.next().unwrap_or_default().trim_end_matches('\r'))?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
        if escaped {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    Ok(Frame {
        command,
        headers,
        body: body.to_string(),
    })
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(StompError::MalformedHeader(raw.to_string())),
        }
    }
    Ok(out)
}

pub fn parse_heart_beat(value: &str) -> Option<(u64, u64)> {
    let (sx, sy) = value.split_once(',')?;
    Some((sx.trim().parse().ok()?, sy.trim().parse().ok()?))
}

/// Settles the heartbeat intervals from what the client offered and what the
/// server answered in CONNECTED. Returns `(send_every, expect_within)`; a
/// zero duration disables that direction.
pub fn negotiate_heartbeat(
    client_outgoing: Duration,
    client_incoming: Duration,
    server: (u64, u64),
) -> (Duration, Duration) {
    let cx = client_outgoing.as_millis() as u64;
    let cy = client_incoming.as_millis() as u64;
    let (sx, sy) = server;

    let outgoing = if cx == 0 || sy == 0 { 0 } else { cx.max(sy) };
    let incoming = if sx == 0 || cy == 0 { 0 } else { sx.max(cy) };
    (
        Duration::from_millis(outgoing),
        Duration::from_millis(incoming),
    )
}

#[cfg(test)]
#[path = "tests/stomp_tests.rs"]
mod tests;
