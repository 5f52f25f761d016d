//! The SMTP listener: accept loop, per-connection threads, payload spooling.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::SmtpConfig;
use crate::error::{PapercutError, Result};
use crate::model::MessageEntry;
use crate::smtp::session::{data_line, Action, DataLine, Reply, Session};
use crate::store::MessageStore;

/// How often the accept loop checks for a stop request.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Upper bound on one read while receiving DATA.
const DATA_CHUNK: u64 = 64 * 1024;

/// A loopback SMTP server that writes every delivered message into a
/// [`MessageStore`] and reports it on the arrivals channel.
///
/// Lifecycle: `Stopped --start--> Bound --stop--> Stopped`. [`SmtpListener::bind`]
/// restarts it with the current configuration.
pub struct SmtpListener {
    config: SmtpConfig,
    store: Arc<MessageStore>,
    arrivals: Sender<MessageEntry>,
    running: Option<Running>,
}

struct Running {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept: JoinHandle<()>,
}

/// Everything a connection thread needs.
struct ConnectionContext {
    hostname: String,
    max_line_length: usize,
    idle_timeout: Duration,
    store: Arc<MessageStore>,
    arrivals: Sender<MessageEntry>,
}

impl SmtpListener {
    /// Create a stopped listener.
    pub fn new(config: SmtpConfig, store: Arc<MessageStore>, arrivals: Sender<MessageEntry>) -> Self {
        Self {
            config,
            store,
            arrivals,
            running: None,
        }
    }

    /// Bind to `host:port` and start accepting connections.
    ///
    /// On failure the listener is left exactly as it was. On success the
    /// address becomes the one [`SmtpListener::bind`] reuses.
    pub fn start(&mut self, host: &str, port: u16) -> Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Err(PapercutError::AlreadyBound(running.addr));
        }

        let listener = TcpListener::bind((host, port)).map_err(|source| PapercutError::Bind {
            addr: format!("{host}:{port}"),
            source,
        })?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(ConnectionContext {
            hostname: self.config.hostname.clone(),
            max_line_length: self.config.max_line_length.max(1),
            idle_timeout: Duration::from_secs(self.config.idle_timeout_secs.max(1)),
            store: Arc::clone(&self.store),
            arrivals: self.arrivals.clone(),
        });
        let flag = Arc::clone(&shutdown);
        let accept = thread::Builder::new()
            .name("papercut-smtp-accept".into())
            .spawn(move || accept_loop(listener, flag, ctx))?;

        self.config.host = host.to_string();
        self.config.port = port;
        self.running = Some(Running {
            addr,
            shutdown,
            accept,
        });
        info!(addr = %addr, "SMTP listener bound");
        Ok(addr)
    }

    /// Close the listening socket and every open connection. Idempotent.
    ///
    /// Messages whose DATA phase was interrupted are discarded; completed
    /// ones are already registered.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.shutdown.store(true, Ordering::Release);
        if running.accept.join().is_err() {
            warn!(addr = %running.addr, "SMTP accept thread panicked");
        }
        info!(addr = %running.addr, "SMTP listener stopped");
    }

    /// Stop, then start again on the configured address.
    ///
    /// On failure the listener stays stopped and the error is returned.
    pub fn bind(&mut self) -> Result<SocketAddr> {
        self.stop();
        let host = self.config.host.clone();
        self.start(&host, self.config.port)
    }

    /// Replace the configuration used by the next [`SmtpListener::bind`].
    pub fn reconfigure(&mut self, config: SmtpConfig) {
        self.config = config;
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    pub fn is_bound(&self) -> bool {
        self.running.is_some()
    }
}

impl Drop for SmtpListener {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open connections, so they can be closed when the listener stops.
#[derive(Default)]
struct ConnectionSet {
    open: Vec<Connection>,
}

struct Connection {
    peer: SocketAddr,
    stream: TcpStream,
    handle: JoinHandle<()>,
}

impl ConnectionSet {
    fn spawn(&mut self, stream: TcpStream, peer: SocketAddr, ctx: &Arc<ConnectionContext>) {
        let control = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping connection: cannot clone socket");
                return;
            }
        };
        let ctx = Arc::clone(ctx);
        let spawned = thread::Builder::new()
            .name(format!("papercut-smtp-{peer}"))
            .spawn(move || handle_connection(stream, peer, &ctx));
        match spawned {
            Ok(handle) => self.open.push(Connection {
                peer,
                stream: control,
                handle,
            }),
            Err(e) => warn!(peer = %peer, error = %e, "Failed to spawn connection thread"),
        }
    }

    /// Join connections that already finished.
    fn reap(&mut self) {
        let (finished, open): (Vec<_>, Vec<_>) =
            self.open.drain(..).partition(|c| c.handle.is_finished());
        self.open = open;
        for conn in finished {
            join(conn);
        }
    }

    fn close_all(&mut self) {
        for conn in self.open.drain(..) {
            // Wakes the thread out of its blocking read.
            let _ = conn.stream.shutdown(Shutdown::Both);
            join(conn);
        }
    }
}

fn join(conn: Connection) {
    if conn.handle.join().is_err() {
        warn!(peer = %conn.peer, "Connection thread panicked");
    }
}

fn accept_loop(listener: TcpListener, shutdown: Arc<AtomicBool>, ctx: Arc<ConnectionContext>) {
    let mut connections = ConnectionSet::default();

    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(peer = %peer, error = %e, "Dropping connection");
                    continue;
                }
                debug!(peer = %peer, "Connection accepted");
                connections.spawn(stream, peer, &ctx);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!(error = %e, "Accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
        connections.reap();
    }

    drop(listener);
    connections.close_all();
}

fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: &ConnectionContext) {
    match serve(stream, ctx) {
        Ok(()) => debug!(peer = %peer, "Connection closed"),
        Err(e) => warn!(peer = %peer, error = %e, "Connection aborted"),
    }
}

/// Result of reading one command line.
enum CommandLine {
    Line(String),
    TooLong,
    Eof,
    Idle,
}

fn serve(stream: TcpStream, ctx: &ConnectionContext) -> Result<()> {
    stream.set_read_timeout(Some(ctx.idle_timeout))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut session = Session::new(ctx.hostname.clone());

    send(&mut writer, &session.greeting())?;

    loop {
        let line = match read_command(&mut reader, ctx.max_line_length)? {
            CommandLine::Line(line) => line,
            CommandLine::TooLong => {
                send(&mut writer, &session.line_too_long())?;
                continue;
            }
            CommandLine::Eof if session.in_transaction() => {
                return Err(PapercutError::Protocol(
                    "connection closed mid-transaction".into(),
                ));
            }
            CommandLine::Eof => return Ok(()),
            CommandLine::Idle => {
                send(&mut writer, &session.timeout())?;
                return Ok(());
            }
        };

        match session.handle_command(&line) {
            Action::Reply(reply) => send(&mut writer, &reply)?,
            Action::Close(reply) => {
                send(&mut writer, &reply)?;
                return Ok(());
            }
            Action::ReadData(reply) => {
                send(&mut writer, &reply)?;
                let stored = receive_data(&mut reader, ctx)?;
                let reply = session.finish_data(stored.is_some());
                send(&mut writer, &reply)?;
                if let Some(entry) = stored {
                    // The consumer may be gone during shutdown.
                    let _ = ctx.arrivals.send(entry);
                }
            }
        }
    }
}

fn send(writer: &mut TcpStream, reply: &Reply) -> Result<()> {
    writer.write_all(reply.to_string().as_bytes())?;
    writer.flush()?;
    Ok(())
}

fn read_command<R: BufRead>(reader: &mut R, max_len: usize) -> Result<CommandLine> {
    let limit = max_len as u64 + 2;
    let mut buf = Vec::new();
    let n = match reader.by_ref().take(limit).read_until(b'\n', &mut buf) {
        Ok(n) => n,
        Err(e) if is_timeout(&e) => return Ok(CommandLine::Idle),
        Err(e) => return Err(e.into()),
    };
    if n == 0 {
        return Ok(CommandLine::Eof);
    }
    if !buf.ends_with(b"\n") {
        if (n as u64) < limit {
            return Ok(CommandLine::Eof);
        }
        discard_line(reader)?;
        return Ok(CommandLine::TooLong);
    }

    let text = String::from_utf8_lossy(&buf);
    Ok(CommandLine::Line(text.trim_end_matches(['\r', '\n']).to_string()))
}

/// Skip the rest of an over-long line.
fn discard_line<R: BufRead>(reader: &mut R) -> Result<()> {
    let mut sink = Vec::new();
    loop {
        sink.clear();
        let n = reader.by_ref().take(DATA_CHUNK).read_until(b'\n', &mut sink)?;
        if n == 0 || sink.ends_with(b"\n") {
            return Ok(());
        }
    }
}

/// Read the DATA payload up to the lone `.` line, spooling it to disk.
///
/// Returns the registered entry, or `None` when storage failed (the payload
/// is still drained so the session can continue). A client that disconnects
/// before the terminator is an error; its partial payload is discarded.
fn receive_data<R: BufRead>(reader: &mut R, ctx: &ConnectionContext) -> Result<Option<MessageEntry>> {
    let mut spool = match ctx.store.spool() {
        Ok(spool) => Some(spool),
        Err(e) => {
            warn!(error = %e, "Cannot create message file");
            None
        }
    };
    let mut buf = Vec::new();
    let mut at_line_start = true;

    loop {
        buf.clear();
        let n = match reader.by_ref().take(DATA_CHUNK).read_until(b'\n', &mut buf) {
            Ok(n) => n,
            Err(e) if is_timeout(&e) => {
                return Err(PapercutError::Protocol("client idle during DATA".into()));
            }
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Err(PapercutError::Protocol(
                "connection closed before end of data".into(),
            ));
        }

        let content = if at_line_start {
            match data_line(&buf) {
                DataLine::End if buf.ends_with(b"\n") => break,
                // A lone `.` cut off by EOF is not the end-of-data sequence.
                DataLine::End => {
                    return Err(PapercutError::Protocol(
                        "connection closed before end of data".into(),
                    ));
                }
                DataLine::Content(bytes) => bytes,
            }
        } else {
            &buf[..]
        };
        at_line_start = buf.ends_with(b"\n");

        if let Some(writer) = spool.as_mut() {
            if let Err(e) = writer.write_all(content) {
                warn!(error = %e, "Failed writing message; draining the rest");
                spool = None;
            }
        }
    }

    let Some(spool) = spool else {
        return Ok(None);
    };
    let size = spool.bytes_written();
    let registered = spool
        .commit()
        .and_then(|path| ctx.store.register(path));
    match registered {
        Ok(entry) => {
            info!(path = %entry.path().display(), size, "Message received");
            Ok(Some(entry))
        }
        Err(e) => {
            warn!(error = %e, "Failed to store message");
            Ok(None)
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
