//! SMTP dialogue state machine.
//!
//! The session only interprets command lines and produces replies; reading
//! from and writing to the socket is left to the server. This keeps the
//! protocol rules testable without a network.

use std::fmt;

/// Where the client is in the dialogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no HELO/EHLO yet.
    Connected,
    /// Greeted; no transaction in progress.
    Ready,
    /// `MAIL FROM` accepted.
    Mail,
    /// At least one `RCPT TO` accepted.
    Rcpt,
    /// `DATA` accepted; the server is reading the payload.
    Data,
    Closed,
}

/// A numbered reply, possibly spanning several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// `true` for 2xx and 3xx replies.
    pub fn is_positive(&self) -> bool {
        self.code < 400
    }
}

/// Wire format: `250-first`, ..., `250 last`, each terminated by CRLF.
impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);
        if self.lines.is_empty() {
            return write!(f, "{}\r\n", self.code);
        }
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            write!(f, "{}{}{}\r\n", self.code, sep, line)?;
        }
        Ok(())
    }
}

/// What the server should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send the reply and read the next command.
    Reply(Reply),
    /// Send the reply (354) and read the message payload.
    ReadData(Reply),
    /// Send the reply and close the connection.
    Close(Reply),
}

/// One line of the DATA payload after dot-unstuffing.
#[derive(Debug, PartialEq, Eq)]
pub enum DataLine<'a> {
    Content(&'a [u8]),
    /// The lone `.` that ends the payload.
    End,
}

/// Classify a payload line that starts at the beginning of a line.
///
/// `line` may still carry its CRLF; it is kept in [`DataLine::Content`].
pub fn data_line(line: &[u8]) -> DataLine<'_> {
    let bare = line.strip_suffix(b"\n").unwrap_or(line);
    let bare = bare.strip_suffix(b"\r").unwrap_or(bare);
    if bare == b"." {
        DataLine::End
    } else if line.starts_with(b"..") {
        DataLine::Content(&line[1..])
    } else {
        DataLine::Content(line)
    }
}

/// Per-connection SMTP state.
#[derive(Debug)]
pub struct Session {
    hostname: String,
    state: SessionState,
    client: Option<String>,
    sender: Option<String>,
    recipients: Vec<String>,
}

impl Session {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            state: SessionState::Connected,
            client: None,
            sender: None,
            recipients: Vec::new(),
        }
    }

    /// The 220 banner sent when the connection opens.
    pub fn greeting(&self) -> Reply {
        Reply::new(220, format!("{} ESMTP papercut ready", self.hostname))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Reverse path of the current transaction (`""` for the null sender).
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Name the client gave in HELO/EHLO.
    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }

    /// `true` while a transaction has been started but not completed.
    pub fn in_transaction(&self) -> bool {
        matches!(
            self.state,
            SessionState::Mail | SessionState::Rcpt | SessionState::Data
        )
    }

    /// Interpret one command line (without its CRLF).
    pub fn handle_command(&mut self, line: &str) -> Action {
        let line = line.trim();
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => self.helo(arg, false),
            "EHLO" => self.helo(arg, true),
            "MAIL" => self.mail(arg),
            "RCPT" => self.rcpt(arg),
            "DATA" => self.data(arg),
            "RSET" => {
                self.reset();
                Action::Reply(Reply::new(250, "OK"))
            }
            "NOOP" => Action::Reply(Reply::new(250, "OK")),
            "VRFY" => Action::Reply(Reply::new(
                252,
                "Cannot VRFY user, but will accept message and attempt delivery",
            )),
            "HELP" => Action::Reply(Reply::new(
                214,
                "Commands: HELO EHLO MAIL RCPT DATA RSET NOOP VRFY HELP QUIT",
            )),
            "QUIT" => {
                self.state = SessionState::Closed;
                Action::Close(Reply::new(
                    221,
                    format!("{} closing connection", self.hostname),
                ))
            }
            "" => Action::Reply(Reply::new(500, "Syntax error, command unrecognized")),
            _ => Action::Reply(Reply::new(502, "Command not implemented")),
        }
    }

    /// Reply for a command line longer than the configured limit.
    pub fn line_too_long(&self) -> Reply {
        Reply::new(500, "Line too long")
    }

    /// Close the DATA phase. `stored` tells whether the payload was persisted.
    pub fn finish_data(&mut self, stored: bool) -> Reply {
        self.reset();
        if stored {
            Reply::new(250, "OK: message accepted")
        } else {
            Reply::new(451, "Requested action aborted: local error in processing")
        }
    }

    /// The 421 sent before dropping an idle client.
    pub fn timeout(&mut self) -> Reply {
        self.state = SessionState::Closed;
        Reply::new(
            421,
            format!("{} timeout, closing connection", self.hostname),
        )
    }

    fn helo(&mut self, arg: &str, extended: bool) -> Action {
        let verb = if extended { "EHLO" } else { "HELO" };
        if arg.is_empty() {
            return Action::Reply(Reply::new(501, format!("Syntax: {verb} hostname")));
        }
        self.reset();
        self.client = Some(arg.to_string());
        self.state = SessionState::Ready;

        let hello = format!("{} Hello {arg}", self.hostname);
        if extended {
            Action::Reply(Reply::multiline(
                250,
                vec![hello, "8BITMIME".into(), "SIZE".into(), "HELP".into()],
            ))
        } else {
            Action::Reply(Reply::new(250, hello))
        }
    }

    fn mail(&mut self, arg: &str) -> Action {
        match self.state {
            SessionState::Connected => {
                return Action::Reply(Reply::new(503, "Send HELO/EHLO first"));
            }
            SessionState::Mail | SessionState::Rcpt => {
                return Action::Reply(Reply::new(503, "Sender already specified"));
            }
            _ => {}
        }
        let Some(path) = strip_keyword(arg, "FROM:") else {
            return Action::Reply(Reply::new(501, "Syntax: MAIL FROM:<address>"));
        };
        let Some(address) = parse_path(path) else {
            return Action::Reply(Reply::new(501, "Syntax: MAIL FROM:<address>"));
        };
        self.sender = Some(address);
        self.state = SessionState::Mail;
        Action::Reply(Reply::new(250, "OK"))
    }

    fn rcpt(&mut self, arg: &str) -> Action {
        if !matches!(self.state, SessionState::Mail | SessionState::Rcpt) {
            return Action::Reply(Reply::new(503, "Need MAIL before RCPT"));
        }
        let address = strip_keyword(arg, "TO:")
            .and_then(parse_path)
            .filter(|a| !a.is_empty());
        let Some(address) = address else {
            return Action::Reply(Reply::new(501, "Syntax: RCPT TO:<address>"));
        };
        self.recipients.push(address);
        self.state = SessionState::Rcpt;
        Action::Reply(Reply::new(250, "OK"))
    }

    fn data(&mut self, arg: &str) -> Action {
        if self.state != SessionState::Rcpt {
            return Action::Reply(Reply::new(503, "Need RCPT before DATA"));
        }
        if !arg.is_empty() {
            return Action::Reply(Reply::new(501, "Syntax: DATA"));
        }
        self.state = SessionState::Data;
        Action::ReadData(Reply::new(354, "End data with <CR><LF>.<CR><LF>"))
    }

    fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
        if self.state != SessionState::Connected {
            self.state = SessionState::Ready;
        }
    }
}

/// Strip a case-insensitive keyword like `FROM:` from the start of `arg`.
fn strip_keyword<'a>(arg: &'a str, keyword: &str) -> Option<&'a str> {
    let head = arg.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| arg[keyword.len()..].trim_start())
}

/// `<addr> [params]` or a bare `addr`. Returns the address without brackets.
fn parse_path(path: &str) -> Option<String> {
    let path = path.trim();
    if let Some(rest) = path.strip_prefix('<') {
        let end = rest.find('>')?;
        return Some(rest[..end].trim().to_string());
    }
    let address = path.split_whitespace().next()?;
    Some(address.to_string())
}
