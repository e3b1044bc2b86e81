//! The control connection: command pipeline, reply demultiplexer and
//! authentication handshake.
//!
//! All protocol state is owned by [`ControlConnection`], which runs as one
//! tokio task. The session handle and the directory watcher talk to it with
//! [`IoMsg`]s; results go back to callers over oneshot channels and to the
//! watcher as [`WatchMsg`]s.
//!
//! Replies are matched to commands strictly in order: the command at the
//! front of the queue owns every synchronous line until its final line
//! arrives. Asynchronous `6xy` lines can interleave at any point and are
//! routed to observers instead.

use crate::auth::{cookie_authenticate_command, format_cookie_hex, generate_client_nonce};
use crate::auth::{safecookie_response, ControlCredentials};
use crate::config::{AuthMethod, TorControlConfig};
use crate::error::{Result, StatusCode, TorControlError};
use crate::events::{EventType, TorEvent};
use crate::observer::{ObserverId, ObserverList, TorControlObserver};
use crate::protocol::{
    escapify, format_command, parse_kv_exact, parse_quoted, FinalReply, Position, ReplyClass,
    ReplyLine,
};
use crate::watcher::WatchMsg;

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Callback for intermediate reply lines: `(status, body)`.
pub(crate) type LineCallback = Box<dyn FnMut(&str, &str) + Send>;

// ============================================================================
// Messages
// ============================================================================

/// Requests handled by the I/O task.
pub(crate) enum IoMsg {
    /// Connect to a freshly discovered control port.
    Open {
        generation: u64,
        credentials: ControlCredentials,
    },
    /// A connect attempt finished.
    Connected {
        generation: u64,
        cookie: Vec<u8>,
        result: Result<TcpStream>,
    },
    /// Queue a command.
    Command {
        text: String,
        completion: Completion,
    },
    Subscribe {
        event: EventType,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        event: EventType,
        respond_to: oneshot::Sender<Result<()>>,
    },
    AddObserver {
        id: ObserverId,
        observer: Arc<dyn TorControlObserver>,
    },
    RemoveObserver {
        id: ObserverId,
    },
    /// Drop the connection, fail pending commands and forget subscriptions.
    Stop,
    /// Like `Stop`, then exit the task.
    Shutdown,
}

/// What to do with a command's reply lines.
pub(crate) enum Completion {
    /// Raw command from a caller.
    Caller {
        per_line: Option<LineCallback>,
        respond_to: oneshot::Sender<Result<FinalReply>>,
    },
    /// `GETINFO version`.
    Version {
        version: Option<String>,
        respond_to: oneshot::Sender<Result<String>>,
    },
    /// `GETINFO net/listeners/socks`.
    SocksListeners {
        listeners: Vec<String>,
        respond_to: oneshot::Sender<Result<Vec<String>>>,
    },
    /// `GETINFO status/circuit-established`.
    CircuitEstablished {
        value: Option<String>,
        respond_to: oneshot::Sender<Result<bool>>,
    },
    /// Any command whose only useful answer is `250 OK`.
    Confirm {
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// `SETEVENTS` after a subscription went from zero to one.
    Subscribe {
        event: EventType,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// `SETEVENTS` after a subscription went to zero.
    Unsubscribe {
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// `SETEVENTS` restoring the subscriptions after a reconnect.
    Resubscribe,
    /// `AUTHENTICATE`.
    Authenticate,
    /// `AUTHCHALLENGE SAFECOOKIE`.
    AuthChallenge {
        cookie: Vec<u8>,
        client_nonce: [u8; 32],
    },
    /// Fire and forget.
    Ignore,
}

impl Completion {
    /// Route an intermediate line to whoever is collecting it.
    fn on_line(&mut self, status: &str, body: &str) {
        match self {
            Completion::Caller {
                per_line: Some(per_line),
                ..
            } => per_line(status, body),
            Completion::Version { version, .. } => capture_value(version, "version=", status, body),
            Completion::CircuitEstablished { value, .. } => {
                capture_value(value, "status/circuit-established=", status, body)
            }
            Completion::SocksListeners { listeners, .. } => {
                if StatusCode::from_status(status) != StatusCode::Ok {
                    warn!(status, "unexpected GETINFO reply line");
                    return;
                }
                if let Some(rest) = body.strip_prefix("net/listeners/socks=") {
                    listeners.extend(split_listeners(rest));
                }
            }
            _ => {}
        }
    }
}

/// Keep the first `<prefix><value>` line of a single-key GETINFO.
fn capture_value(slot: &mut Option<String>, prefix: &str, status: &str, body: &str) {
    match body.strip_prefix(prefix) {
        Some(value) if StatusCode::from_status(status) == StatusCode::Ok && slot.is_none() => {
            *slot = Some(value.to_string())
        }
        _ => warn!(
            status,
            line = %escapify(body.as_bytes()),
            "unexpected GETINFO reply line"
        ),
    }
}

/// Split a listener list; entries are quoted when they contain spaces.
fn split_listeners(rest: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut rest = rest.as_bytes();
    loop {
        while let [b' ', tail @ ..] = rest {
            rest = tail;
        }
        if rest.is_empty() {
            return values;
        }
        if rest[0] == b'"' {
            if let Ok((value, end)) = parse_quoted(rest) {
                values.push(String::from_utf8_lossy(&value).into_owned());
                rest = &rest[end..];
                continue;
            }
        }
        let end = rest.iter().position(|&b| b == b' ').unwrap_or(rest.len());
        values.push(String::from_utf8_lossy(&rest[..end]).into_owned());
        rest = &rest[end..];
    }
}

/// A multi-line asynchronous reply being assembled.
#[derive(Debug, Default)]
struct PendingEvent {
    event: Option<EventType>,
    initial: String,
    extra: BTreeMap<String, Vec<u8>>,
    skipped: bool,
}

impl PendingEvent {
    fn mark_skipped(&mut self) {
        self.skipped = true;
        self.event = None;
        self.initial.clear();
        self.extra.clear();
    }

    fn merge(&mut self, body: &[u8]) -> Result<()> {
        let (key, value) = parse_kv_exact(body).map_err(|e| {
            TorControlError::ProtocolError(format!("invalid async continuation line: {e}"))
        })?;
        match self.extra.entry(key) {
            Entry::Occupied(entry) => Err(TorControlError::ProtocolError(format!(
                "duplicate key {} in async reply",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }
}

// ============================================================================
// Connection Actor
// ============================================================================

/// Owner of the control socket and every piece of protocol state.
pub(crate) struct ControlConnection {
    config: Arc<TorControlConfig>,
    rx: mpsc::UnboundedReceiver<IoMsg>,
    /// Used by connect tasks to report back.
    self_tx: mpsc::UnboundedSender<IoMsg>,
    watch_tx: mpsc::UnboundedSender<WatchMsg>,

    /// False once `stop` was requested; teardowns then stop retrying.
    running: bool,
    /// Watcher generation of the current connect attempt or connection.
    attempt: Option<u64>,

    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,

    write_queue: VecDeque<Vec<u8>>,
    write_buf: Vec<u8>,
    write_pos: usize,
    writing: bool,

    read_buf: Vec<u8>,
    read_filled: usize,
    read_start: usize,
    read_cr: bool,
    reading: bool,
    in_data_block: bool,

    commands: VecDeque<Completion>,
    subscriptions: BTreeMap<EventType, usize>,
    pending_event: Option<PendingEvent>,
    observers: ObserverList,
}

impl ControlConnection {
    pub(crate) fn new(
        config: Arc<TorControlConfig>,
        rx: mpsc::UnboundedReceiver<IoMsg>,
        self_tx: mpsc::UnboundedSender<IoMsg>,
        watch_tx: mpsc::UnboundedSender<WatchMsg>,
    ) -> Self {
        Self {
            config,
            rx,
            self_tx,
            watch_tx,
            running: false,
            attempt: None,
            reader: None,
            writer: None,
            write_queue: VecDeque::new(),
            write_buf: Vec::new(),
            write_pos: 0,
            writing: false,
            read_buf: Vec::new(),
            read_filled: 0,
            read_start: 0,
            read_cr: false,
            reading: false,
            in_data_block: false,
            commands: VecDeque::new(),
            subscriptions: BTreeMap::new(),
            pending_event: None,
            observers: ObserverList::new(),
        }
    }

    /// Runs the actor until `Shutdown` or until every sender is gone.
    pub(crate) async fn run(mut self) {
        debug!("control I/O task starting");

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(IoMsg::Shutdown) | None => break,
                    Some(msg) => self.handle_message(msg),
                },
                result = write_some(self.writer.as_mut(), &self.write_buf[self.write_pos..]),
                    if self.writing => self.write_done(result),
                result = read_some(self.reader.as_mut(), &mut self.read_buf[self.read_filled..]),
                    if self.reading => self.read_done(result),
            }
        }

        self.stop();
        debug!("control I/O task stopped");
    }

    fn handle_message(&mut self, msg: IoMsg) {
        match msg {
            IoMsg::Open {
                generation,
                credentials,
            } => self.open(generation, credentials),
            IoMsg::Connected {
                generation,
                cookie,
                result,
            } => self.connected(generation, cookie, result),
            IoMsg::Command { text, completion } => self.do_cmd(text, completion),
            IoMsg::Subscribe { event, respond_to } => self.subscribe(event, respond_to),
            IoMsg::Unsubscribe { event, respond_to } => self.unsubscribe(event, respond_to),
            IoMsg::AddObserver { id, observer } => self.observers.add(id, observer),
            IoMsg::RemoveObserver { id } => {
                if !self.observers.remove(id) {
                    debug!(?id, "removing unknown observer");
                }
            }
            IoMsg::Stop => self.stop(),
            // Handled by the run loop.
            IoMsg::Shutdown => {}
        }
    }

    // ========================================================================
    // Connect and Authenticate
    // ========================================================================

    fn open(&mut self, generation: u64, credentials: ControlCredentials) {
        if self.writer.is_some() {
            warn!(generation, "ignoring open request while connected");
            return;
        }

        self.running = true;
        self.attempt = Some(generation);

        let ControlCredentials { port, cookie } = credentials;
        debug!(port, "connecting to control port");

        let tx = self.self_tx.clone();
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            let result =
                match tokio::time::timeout(timeout, TcpStream::connect((Ipv4Addr::LOCALHOST, port)))
                    .await
                {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(e)) => Err(TorControlError::ConnectionFailed(format!(
                        "127.0.0.1:{port}: {e}"
                    ))),
                    Err(_) => Err(TorControlError::Timeout),
                };
            let _ = tx.send(IoMsg::Connected {
                generation,
                cookie,
                result,
            });
        });
    }

    fn connected(&mut self, generation: u64, cookie: Vec<u8>, result: Result<TcpStream>) {
        if !self.running || self.attempt != Some(generation) {
            debug!(generation, "dropping stale connect result");
            return;
        }

        match result {
            Ok(stream) => {
                let (reader, writer) = stream.into_split();
                self.reader = Some(reader);
                self.writer = Some(writer);
                self.authenticate(cookie);
            }
            Err(e) => {
                warn!(error = %e, "failed to connect to control port");
                self.observers.notify(|o| o.on_closed(true));
                let _ = self.watch_tx.send(WatchMsg::ConnectFailed { generation });
            }
        }
    }

    fn authenticate(&mut self, cookie: Vec<u8>) {
        match self.config.auth_method {
            AuthMethod::Cookie => {
                self.do_cmd(cookie_authenticate_command(&cookie), Completion::Authenticate)
            }
            AuthMethod::SafeCookie => {
                let client_nonce = generate_client_nonce();
                self.do_cmd(
                    format!("AUTHCHALLENGE SAFECOOKIE {}", format_cookie_hex(&client_nonce)),
                    Completion::AuthChallenge {
                        cookie,
                        client_nonce,
                    },
                );
            }
        }
    }

    fn auth_challenged(
        &mut self,
        cookie: Vec<u8>,
        client_nonce: [u8; 32],
        outcome: Result<FinalReply>,
    ) {
        let reply = match outcome {
            Ok(reply) if reply.status_code() == StatusCode::Ok => reply,
            Ok(reply) => {
                warn!(status = %reply.status, "control port rejected AUTHCHALLENGE");
                return self.auth_failed();
            }
            Err(e) => {
                debug!(error = %e, "AUTHCHALLENGE did not complete");
                return;
            }
        };

        match safecookie_response(&cookie, &client_nonce, &reply.body) {
            Ok(line) => self.do_cmd(line, Completion::Authenticate),
            Err(e) => {
                warn!(error = %e, "SAFECOOKIE challenge failed");
                self.auth_failed();
            }
        }
    }

    fn authenticated(&mut self, outcome: Result<FinalReply>) {
        match outcome {
            Ok(reply) if reply.is_ok() => {
                debug!("authenticated to control port");
                if self.config.take_ownership {
                    self.do_cmd("TAKEOWNERSHIP".to_string(), Completion::Ignore);
                    self.do_cmd(
                        "RESETCONF __OwningControllerProcess".to_string(),
                        Completion::Ignore,
                    );
                }
                // Subscriptions outlive a dropped connection; restore them.
                if !self.subscriptions.is_empty() {
                    let command = self.set_events_command();
                    self.do_cmd(command, Completion::Resubscribe);
                }
                self.observers.notify(|o| o.on_ready());
                if let Some(generation) = self.attempt {
                    let _ = self.watch_tx.send(WatchMsg::Ready { generation });
                }
            }
            Ok(reply) if reply.status_code().is_auth_failure() => {
                warn!(status = %reply.status, "control port rejected the cookie");
                self.auth_failed();
            }
            Ok(reply) => {
                warn!(
                    status = %reply.status,
                    reply = %escapify(reply.body.as_bytes()),
                    "unexpected reply to AUTHENTICATE"
                );
                self.auth_failed();
            }
            Err(e) => debug!(error = %e, "authentication did not complete"),
        }
    }

    /// Close the connection without asking the watcher to retry.
    fn auth_failed(&mut self) {
        let running = self.running;
        self.observers.notify(|o| o.on_closed(running));
        self.teardown();
        if let Some(generation) = self.attempt {
            let _ = self.watch_tx.send(WatchMsg::AuthFailed { generation });
        }
    }

    // ========================================================================
    // Commands and Subscriptions
    // ========================================================================

    fn do_cmd(&mut self, text: String, completion: Completion) {
        self.observers.notify(|o| o.on_raw_cmd(&text));

        if self.writer.is_none() {
            debug!(command = keyword(&text), "control connection not open");
            return self.complete(completion, Err(TorControlError::NotConnected));
        }

        let limit = self.config.max_pending_commands;
        if self.write_queue.len() >= limit || self.commands.len() >= limit {
            warn!(
                command = keyword(&text),
                pending = self.commands.len(),
                limit,
                "too many pending control commands"
            );
            return self.complete(completion, Err(TorControlError::QueueFull { limit }));
        }

        trace!(command = keyword(&text), "queueing control command");
        let mut line = text.into_bytes();
        line.extend_from_slice(b"\r\n");
        self.write_queue.push_back(line);
        self.commands.push_back(completion);

        if !self.writing {
            self.next_write();
        }
        if !self.reading {
            self.start_reading();
        }
    }

    fn set_events_command(&self) -> String {
        let names: Vec<&str> = self.subscriptions.keys().map(EventType::as_str).collect();
        format_command("SETEVENTS", &names)
    }

    fn subscribe(&mut self, event: EventType, respond_to: oneshot::Sender<Result<()>>) {
        let count = self.subscriptions.entry(event).or_insert(0);
        *count += 1;
        if *count > 1 {
            let _ = respond_to.send(Ok(()));
            return;
        }

        debug!(%event, "subscribing to control event");
        let command = self.set_events_command();
        self.do_cmd(command, Completion::Subscribe { event, respond_to });
    }

    fn unsubscribe(&mut self, event: EventType, respond_to: oneshot::Sender<Result<()>>) {
        let Some(count) = self.subscriptions.get_mut(&event) else {
            let _ = respond_to.send(Err(TorControlError::InvalidArgument(format!(
                "not subscribed to {event}"
            ))));
            return;
        };
        *count -= 1;
        if *count > 0 {
            let _ = respond_to.send(Ok(()));
            return;
        }

        self.subscriptions.remove(&event);
        debug!(%event, "unsubscribing from control event");
        let command = self.set_events_command();
        self.do_cmd(command, Completion::Unsubscribe { respond_to });
    }

    /// Undo a subscription the server refused.
    fn release(&mut self, event: EventType) {
        if let Entry::Occupied(mut entry) = self.subscriptions.entry(event) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
            }
        }
    }

    /// Deliver the outcome of a command to whoever is waiting for it.
    fn complete(&mut self, completion: Completion, outcome: Result<FinalReply>) {
        match completion {
            Completion::Caller { respond_to, .. } => {
                let _ = respond_to.send(outcome);
            }
            Completion::Version {
                version,
                respond_to,
            } => {
                let result = outcome.and_then(FinalReply::into_ok).and_then(|_| {
                    version.ok_or_else(|| {
                        TorControlError::ParseError("no version in GETINFO reply".to_string())
                    })
                });
                let _ = respond_to.send(result);
            }
            Completion::SocksListeners {
                listeners,
                respond_to,
            } => {
                let result = outcome.and_then(FinalReply::into_ok).and_then(|_| {
                    if listeners.is_empty() {
                        Err(TorControlError::ParseError(
                            "no SOCKS listeners in GETINFO reply".to_string(),
                        ))
                    } else {
                        Ok(listeners)
                    }
                });
                let _ = respond_to.send(result);
            }
            Completion::CircuitEstablished { value, respond_to } => {
                let result =
                    outcome
                        .and_then(FinalReply::into_ok)
                        .and_then(|_| match value.as_deref() {
                            Some("1") => Ok(true),
                            Some("0") => Ok(false),
                            other => Err(TorControlError::ParseError(format!(
                                "unexpected circuit-established value {other:?}"
                            ))),
                        });
                let _ = respond_to.send(result);
            }
            Completion::Confirm { respond_to } => {
                let _ = respond_to.send(outcome.and_then(FinalReply::into_ok).map(|_| ()));
            }
            Completion::Subscribe { event, respond_to } => {
                let result = accepted(outcome);
                if let Err(e) = &result {
                    warn!(%event, error = %e, "subscription failed");
                    self.release(event);
                }
                let _ = respond_to.send(result);
            }
            Completion::Unsubscribe { respond_to } => {
                let _ = respond_to.send(accepted(outcome));
            }
            Completion::Resubscribe => {
                // The counts stay as they are; the next subscription change
                // sends the full list again.
                if let Err(e) = accepted(outcome) {
                    if !matches!(e, TorControlError::ConnectionClosed) {
                        warn!(error = %e, "restoring event subscriptions failed");
                    }
                }
            }
            Completion::Authenticate => self.authenticated(outcome),
            Completion::AuthChallenge {
                cookie,
                client_nonce,
            } => self.auth_challenged(cookie, client_nonce, outcome),
            Completion::Ignore => {
                if let Ok(reply) = outcome {
                    if !reply.is_ok() {
                        debug!(status = %reply.status, "ignored command was refused");
                    }
                }
            }
        }
    }

    // ========================================================================
    // Write Pump
    // ========================================================================

    fn next_write(&mut self) {
        match self.write_queue.pop_front() {
            Some(buf) => {
                self.write_buf = buf;
                self.write_pos = 0;
                self.writing = true;
            }
            None => {
                self.write_buf.clear();
                self.write_pos = 0;
                self.writing = false;
            }
        }
    }

    fn write_done(&mut self, result: io::Result<usize>) {
        match result {
            Ok(0) => self.fail(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => {
                self.write_pos += n;
                if self.write_pos >= self.write_buf.len() {
                    self.next_write();
                }
            }
            Err(e) => self.fail(e.into()),
        }
    }

    // ========================================================================
    // Read Pump
    // ========================================================================

    fn start_reading(&mut self) {
        self.read_buf = vec![0; self.config.read_buffer_size];
        self.read_filled = 0;
        self.read_start = 0;
        self.read_cr = false;
        self.reading = true;
    }

    fn stop_reading(&mut self) {
        self.read_buf = Vec::new();
        self.read_filled = 0;
        self.read_start = 0;
        self.read_cr = false;
        self.reading = false;
    }

    fn read_done(&mut self, result: io::Result<usize>) {
        let n = match result {
            Ok(0) => {
                warn!("control connection closed by peer");
                return self.fail(TorControlError::ConnectionClosed);
            }
            Ok(n) => n,
            Err(e) => return self.fail(e.into()),
        };

        let start = self.read_filled;
        let filled = start + n;
        for i in start..filled {
            let byte = self.read_buf[i];
            if !self.read_cr {
                match byte {
                    b'\r' => self.read_cr = true,
                    b'\n' => {
                        return self.fail(TorControlError::ProtocolError(
                            "stray line feed".to_string(),
                        ))
                    }
                    _ => {}
                }
                continue;
            }
            if byte != b'\n' {
                return self.fail(TorControlError::ProtocolError(
                    "stray carriage return".to_string(),
                ));
            }

            let line = self.read_buf[self.read_start..i - 1].to_vec();
            self.read_start = i + 1;
            self.read_cr = false;
            if let Err(e) = self.read_line(&line) {
                return self.fail(e);
            }
            // A reply may have closed the connection, e.g. failed auth.
            if !self.reading {
                return;
            }
        }

        if filled == self.read_buf.len() {
            if self.read_start == 0 {
                return self.fail(TorControlError::ProtocolError(
                    "control line too long".to_string(),
                ));
            }
            self.read_buf.copy_within(self.read_start..filled, 0);
            self.read_filled = filled - self.read_start;
            self.read_start = 0;
        } else {
            self.read_filled = filled;
        }

        if self.read_start == self.read_filled
            && self.commands.is_empty()
            && self.subscriptions.is_empty()
        {
            self.stop_reading();
        }
    }

    fn read_line(&mut self, raw: &[u8]) -> Result<()> {
        trace!(line = %escapify(raw), "control reply line");

        if self.in_data_block {
            if raw == b"." {
                self.in_data_block = false;
            }
            return Ok(());
        }

        let line = ReplyLine::parse(raw)?;
        match line.class() {
            ReplyClass::Async => self.read_async(line),
            ReplyClass::Sync => {
                self.read_sync(line);
                Ok(())
            }
        }
    }

    fn read_sync(&mut self, line: ReplyLine<'_>) {
        let body = line.body_str();
        match line.position {
            Position::Intermediate => {
                self.observers.notify(|o| o.on_raw_mid(line.status, &body));
                match self.commands.front_mut() {
                    Some(command) => command.on_line(line.status, &body),
                    None => warn!(status = line.status, "intermediate reply with no command"),
                }
            }
            Position::Data => {
                debug!(status = line.status, "skipping data reply");
                self.in_data_block = true;
            }
            Position::Final => {
                self.observers.notify(|o| o.on_raw_end(line.status, &body));
                match self.commands.pop_front() {
                    Some(command) => {
                        let reply = FinalReply::new(line.status, body.into_owned());
                        self.complete(command, Ok(reply));
                    }
                    None => warn!(status = line.status, "final reply with no command"),
                }
            }
        }
    }

    fn read_async(&mut self, line: ReplyLine<'_>) -> Result<()> {
        let body = line.body_str();
        self.observers.notify(|o| o.on_raw_async(line.status, &body));

        if line.position == Position::Data {
            debug!(status = line.status, "skipping asynchronous data reply");
            let mut pending = self.pending_event.take().unwrap_or_default();
            pending.mark_skipped();
            self.pending_event = Some(pending);
            self.in_data_block = true;
            return Ok(());
        }

        let Some(mut pending) = self.pending_event.take() else {
            self.begin_event(&body, line.position);
            return Ok(());
        };

        match line.position {
            Position::Intermediate => {
                if !pending.skipped && !self.is_subscribed(pending.event) {
                    debug!("subscription revoked during event, skipping it");
                    pending.mark_skipped();
                }
                if !pending.skipped {
                    pending.merge(line.body)?;
                }
                self.pending_event = Some(pending);
            }
            _ => {
                // Tor ends some multi-line events with a bare `650 OK`.
                if !pending.skipped && line.body != b"OK" {
                    pending.merge(line.body)?;
                }
                match pending.event {
                    Some(event) if !pending.skipped && self.is_subscribed(Some(event)) => {
                        self.dispatch(TorEvent {
                            event,
                            initial: pending.initial,
                            extra: pending.extra,
                        });
                    }
                    _ => trace!("dropping skipped event"),
                }
            }
        }
        Ok(())
    }

    fn begin_event(&mut self, body: &str, position: Position) {
        let (name, initial) = body.split_once(' ').unwrap_or((body, ""));
        let event = EventType::from_name(name);

        if position == Position::Intermediate {
            if event.is_none() {
                warn!(event = %escapify(name.as_bytes()), "unknown control event, skipping");
            }
            self.pending_event = Some(PendingEvent {
                event,
                initial: initial.to_string(),
                extra: BTreeMap::new(),
                skipped: event.is_none(),
            });
            return;
        }

        match event {
            None => warn!(event = %escapify(name.as_bytes()), "unknown control event"),
            Some(event) if !self.subscriptions.contains_key(&event) => {
                debug!(%event, "dropping spurious event")
            }
            Some(event) => self.dispatch(TorEvent::new(event, initial)),
        }
    }

    fn is_subscribed(&self, event: Option<EventType>) -> bool {
        event.is_some_and(|event| self.subscriptions.contains_key(&event))
    }

    fn dispatch(&self, event: TorEvent) {
        trace!(event = %event.event, "dispatching control event");
        self.observers.notify(|o| o.on_event(&event));
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Fatal error on the connection: close it and let the watcher retry.
    fn fail(&mut self, error: TorControlError) {
        let running = self.running;
        warn!(error = %error, running, "closing control connection");
        self.observers.notify(|o| o.on_closed(running));
        self.teardown();
        if running {
            if let Some(generation) = self.attempt {
                let _ = self.watch_tx.send(WatchMsg::Closed { generation });
            }
        }
    }

    fn stop(&mut self) {
        let active = self.attempt.is_some() || self.writer.is_some();
        self.running = false;
        self.attempt = None;
        self.subscriptions.clear();
        if active {
            debug!(pending = self.commands.len(), "stopping control connection");
            self.observers.notify(|o| o.on_closed(false));
        }
        self.teardown();
    }

    /// Close the socket, reset buffers and fail every pending command in order.
    fn teardown(&mut self) {
        self.reader = None;
        self.writer = None;
        self.write_queue.clear();
        self.next_write();
        self.stop_reading();
        self.in_data_block = false;
        self.pending_event = None;

        let pending = std::mem::take(&mut self.commands);
        for completion in pending {
            self.complete(completion, Err(TorControlError::ConnectionClosed));
        }
    }
}

/// Subscription changes only need a `250` status.
fn accepted(outcome: Result<FinalReply>) -> Result<()> {
    let reply = outcome?;
    if reply.status_code() == StatusCode::Ok {
        Ok(())
    } else {
        Err(TorControlError::rejected(reply.status, reply.body))
    }
}

/// First word of a command, safe to log even for `AUTHENTICATE`.
fn keyword(text: &str) -> &str {
    text.split(' ').next().unwrap_or(text)
}

async fn write_some(writer: Option<&mut OwnedWriteHalf>, buf: &[u8]) -> io::Result<usize> {
    match writer {
        Some(writer) => writer.write(buf).await,
        None => std::future::pending().await,
    }
}

async fn read_some(reader: Option<&mut OwnedReadHalf>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}
