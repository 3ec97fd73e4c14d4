/// Sentinel byte terminating every frame on the wire.
pub const TERMINATOR: char = '\0';

/// Fixed command vocabulary of the feed protocol.
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
    pub fn as_str(&self) -> &'static str {
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

    /// Parse a command line. Unknown commands are `None`, not errors.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CONNECT" => Some(Command::Connect),
            "CONNECTED" => Some(Command::Connected),
            "SUBSCRIBE" => Some(Command::Subscribe),
            "UNSUBSCRIBE" => Some(Command::Unsubscribe),
            "SEND" => Some(Command::Send),
            "MESSAGE" => Some(Command::Message),
            "RECEIPT" => Some(Command::Receipt),
            "ERROR" => Some(Command::Error),
            "DISCONNECT" => Some(Command::Disconnect),
            _ => None,
        }
    }
}

/// One unit of the upstream wire protocol.
///
/// Headers keep their wire order so `encode` is byte-stable:
/// `decode(encode(f)) == f` holds for any frame with a non-empty body or no
/// body at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// First header with the given name, if any.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Handshake frame opening a session.
    pub fn connect(accept_version: &str) -> Self {
        Frame::new(Command::Connect).with_header("accept-version", accept_version)
    }

    /// Subscribe frame for one destination.
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
    }

    /// Send frame carrying a body to a destination.
    pub fn send(destination: &str, body: &str) -> Self {
        Frame::new(Command::Send)
            .with_header("destination", destination)
            .with_body(body)
    }

    /// Decode one frame from raw text.
    ///
    /// The command is the first line, headers run until the first blank
    /// line, and the body is everything after it up to the terminator,
    /// which is stripped. A missing terminator, missing blank line, or
    /// unknown command yields `None`. Header lines without a `:` are
    /// skipped. An empty body decodes to `None`.
    pub fn decode(raw: &str) -> Option<Frame> {
        let end = raw.find(TERMINATOR)?;
        let content = &raw[..end];

        let (head, body) = content.split_once("\n\n")?;
        let mut lines = head.lines();
        let command = Command::parse(lines.next()?)?;

        let mut headers = Vec::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let body = if body.is_empty() {
            None
        } else {
            Some(body.to_string())
        };

        Some(Frame {
            command,
            headers,
            body,
        })
    }

    /// Encode this frame to raw wire text. Strict inverse of `decode`.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        if let Some(ref body) = self.body {
            out.push_str(body);
        }
        out.push(TERMINATOR);
        out
    }
}
