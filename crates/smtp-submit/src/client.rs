use crate::extension::{ExtensionRef, ExtensionStage};
use crate::transport::{Connection, ConnectionEvents, Transport};
use crate::types::{MessageContext, ProtocolStage, Reply};
use mail_headers::HeaderMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::Level;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("reply is not UTF8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Malformed Reply Line: {0}")]
    MalformedReplyLine(String),
}

#[derive(Clone, Debug)]
pub enum SessionTraceEvent {
    /// A complete reply line from the server, terminator stripped.
    Read(String),
    /// An outbound protocol write, terminator stripped.
    Write(String),
    Closed,
    Diagnostic { level: Level, message: String },
}

/// Sink for per-session wire diagnostics.
pub trait SessionTracer: std::fmt::Debug {
    fn trace_event(&self, event: SessionTraceEvent);
}

/// One-shot boolean completion handle.
///
/// Resolves exactly once. If the client is torn down before the outcome
/// is known, the handle resolves false.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<bool>,
}

impl Completion {
    fn new(rx: oneshot::Receiver<bool>) -> Self {
        Self { rx }
    }

    fn resolved(value: bool) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self { rx }
    }
}

impl Future for Completion {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            Poll::Ready(Err(_)) => Poll::Ready(false),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct OutgoingMail {
    headers: HeaderMap,
    body: Vec<u8>,
    recipients: VecDeque<String>,
}

/// Asynchronous SMTP submission client.
///
/// The client connects through a pluggable [Transport], drives the
/// RFC 5321 submission dialog for each message handed to [send_mail],
/// and signals outcomes through one-shot [Completion] handles. Replies
/// arriving from the transport are processed in arrival order; outbound
/// commands are written in the order the state machine produces them.
///
/// [send_mail]: SmtpClient::send_mail
#[derive(Clone)]
pub struct SmtpClient {
    inner: Arc<Inner>,
    transport: Arc<dyn Transport>,
}

struct Inner {
    engine: Mutex<Engine>,
}

impl SmtpClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine: Mutex::new(Engine::new()),
            }),
            transport,
        }
    }

    /// Make `handler` available for the server to enable by advertising
    /// `name` in its EHLO reply.
    pub fn register_extension<N: Into<String>>(&self, name: N, handler: ExtensionRef) {
        self.inner
            .engine
            .lock()
            .registered
            .insert(name.into(), handler);
    }

    pub fn set_tracer(&self, tracer: Arc<dyn SessionTracer + Send + Sync>) {
        self.inner.engine.lock().tracer.replace(tracer);
    }

    /// Establish a connection to the server. Resolves true once the
    /// socket (and TLS tunnel, when the transport has one) is up; the
    /// greeting and option exchange are awaited separately through
    /// [SmtpClient::ready_or_broken].
    pub async fn connect(&self, host: &str, port: u16) -> bool {
        let session = {
            let mut engine = self.inner.engine.lock();
            for handler in engine.registered.values() {
                handler.reset();
            }
            if let Some(connection) = engine.connection.take() {
                connection.close();
            }
            engine.supported.clear();
            engine.read_buffer.clear();
            engine.context = MessageContext::default();
            engine.hostname = host.to_string();
            engine.session += 1;
            engine.session
        };

        let Some(connection) = self.transport.connect(host, port).await else {
            self.inner
                .engine
                .lock()
                .diagnostic(Level::WARN, "unable to connect to SMTP server");
            return false;
        };

        self.inner.engine.lock().connection = Some(connection.clone());
        connection.start(Arc::new(EventProxy {
            inner: Arc::downgrade(&self.inner),
            session,
        }));
        true
    }

    /// Tear the session down. Idempotent. Outstanding handles resolve
    /// false through the broken path, and the context is reset so a
    /// subsequent connect starts fresh.
    pub fn disconnect(&self) {
        let mut engine = self.inner.engine.lock();
        // From here on, events from this session's I/O tasks are stale.
        engine.session += 1;
        engine.on_broken(true);
        engine.context = MessageContext::default();
    }

    /// Submit one message. The returned handle resolves true iff the
    /// server accepted it with a final 250.
    ///
    /// Preconditions: the session is idle (the protocol stage is
    /// ready-to-send) and `headers` carries a `From` header. Otherwise
    /// the handle resolves false immediately and nothing is written.
    /// Callers must await the outcome (or [SmtpClient::ready_or_broken])
    /// before submitting the next message.
    pub fn send_mail<B: AsRef<[u8]>>(&self, headers: HeaderMap, body: B) -> Completion {
        let mut engine = self.inner.engine.lock();
        if engine.context.protocol_stage != ProtocolStage::ReadyToSend
            || engine.connection.is_none()
            || !headers.has_header("From")
        {
            return Completion::resolved(false);
        }
        let (tx, rx) = oneshot::channel();
        engine.send_completed = Some(tx);
        let sender = headers
            .get_first("From")
            .map(|header| header.value().to_string())
            .unwrap_or_default();
        engine.mail = Some(OutgoingMail {
            body: process_body(body.as_ref()),
            recipients: headers.multi_value("To").into(),
            headers,
        });
        engine.send_via_extensions(&format!("MAIL FROM:{sender}"));
        engine.transition(ProtocolStage::DeclaringSender);
        Completion::new(rx)
    }

    /// A handle resolving true on the next transition into the idle
    /// ready-to-send stage (immediately, if the session is already idle)
    /// and false when the session breaks. Every call returns a distinct
    /// handle.
    pub fn ready_or_broken(&self) -> Completion {
        let mut engine = self.inner.engine.lock();
        if engine.connection.is_some()
            && engine.context.protocol_stage == ProtocolStage::ReadyToSend
            && engine.active_extension.is_none()
        {
            return Completion::resolved(true);
        }
        let (tx, rx) = oneshot::channel();
        engine.ready_or_broken.push(tx);
        Completion::new(rx)
    }
}

/// Adapter delivering transport events into the engine. Holds a weak
/// reference so the transport never keeps the client alive, and carries
/// the session number so events from a superseded connection are
/// discarded.
struct EventProxy {
    inner: Weak<Inner>,
    session: u64,
}

impl ConnectionEvents for EventProxy {
    fn on_bytes(&self, bytes: &[u8]) {
        if let Some(inner) = self.inner.upgrade() {
            let mut engine = inner.engine.lock();
            if engine.session == self.session {
                engine.on_bytes(bytes);
            }
        }
    }

    fn on_broken(&self, graceful: bool) {
        if let Some(inner) = self.inner.upgrade() {
            let mut engine = inner.engine.lock();
            if engine.session == self.session {
                engine.on_broken(graceful);
            }
        }
    }
}

struct Engine {
    context: MessageContext,
    registered: HashMap<String, ExtensionRef>,
    /// Names of registered extensions the server advertised, in the
    /// order it advertised them.
    supported: Vec<String>,
    connection: Option<Arc<dyn Connection>>,
    session: u64,
    hostname: String,
    read_buffer: Vec<u8>,
    ready_or_broken: Vec<oneshot::Sender<bool>>,
    send_completed: Option<oneshot::Sender<bool>>,
    active_extension: Option<String>,
    mail: Option<OutgoingMail>,
    tracer: Option<Arc<dyn SessionTracer + Send + Sync>>,
}

impl Engine {
    fn new() -> Self {
        Self {
            context: MessageContext::default(),
            registered: HashMap::new(),
            supported: Vec::new(),
            connection: None,
            session: 0,
            hostname: String::new(),
            read_buffer: Vec::with_capacity(1024),
            ready_or_broken: Vec::new(),
            send_completed: None,
            active_extension: None,
            mail: None,
            tracer: None,
        }
    }

    fn on_bytes(&mut self, bytes: &[u8]) {
        self.read_buffer.extend_from_slice(bytes);
        while let Some(line) = self.next_line() {
            if !self.process_line(line) {
                return;
            }
        }
    }

    fn on_broken(&mut self, _graceful: bool) {
        self.hard_failure();
    }

    /// Extract the next complete CRLF-terminated line, terminator
    /// included. A lone CR at the end of the buffer waits for more data.
    fn next_line(&mut self) -> Option<Vec<u8>> {
        let idx = memchr::memmem::find(&self.read_buffer, b"\r\n")?;
        Some(self.read_buffer.drain(0..idx + 2).collect())
    }

    fn process_line(&mut self, line: Vec<u8>) -> bool {
        if self.active_extension.is_none() {
            let printable = String::from_utf8_lossy(&line);
            let printable = printable.strip_suffix("\r\n").unwrap_or(&printable);
            tracing::trace!("recv<-{}: {}", self.hostname, printable.escape_debug());
            self.trace(SessionTraceEvent::Read(printable.to_string()));
        }

        let reply = match parse_reply_line(line) {
            Ok(reply) => reply,
            Err(err) => {
                self.diagnostic(Level::ERROR, &format!("{err:#}"));
                self.hard_failure();
                return false;
            }
        };

        if let Some(name) = self.active_extension.clone() {
            let Some(handler) = self.registered.get(&name).cloned() else {
                self.hard_failure();
                return false;
            };
            let connection = self.connection.clone();
            let mut stage = ExtensionStage::new(connection.as_deref());
            if !handler.handle_reply(&self.context, &reply, &mut stage) {
                self.hard_failure();
                return false;
            }
            match stage.take_completion() {
                Some(true) => {
                    let stage_now = self.context.protocol_stage;
                    self.transition(stage_now);
                }
                Some(false) => self.soft_failure(),
                None => {}
            }
            return true;
        }

        self.dispatch(reply)
    }

    /// The core state table. Returns false when processing of any
    /// further buffered lines must stop.
    fn dispatch(&mut self, reply: Reply) -> bool {
        match self.context.protocol_stage {
            ProtocolStage::Greeting => {
                let local_addr = self.connection.as_ref().map(|c| c.local_addr());
                match local_addr {
                    Some(local_addr) if reply.code == 220 => {
                        self.send_direct(
                            format!("EHLO {}\r\n", address_literal(local_addr)).as_bytes(),
                        );
                        self.transition(ProtocolStage::Options);
                        true
                    }
                    _ => {
                        self.hard_failure();
                        false
                    }
                }
            }

            ProtocolStage::HelloResponse => {
                if reply.code == 250 {
                    if reply.last {
                        self.message_ready();
                    } else {
                        self.transition(ProtocolStage::Options);
                    }
                    true
                } else {
                    self.hard_failure();
                    false
                }
            }

            ProtocolStage::Options => {
                if reply.code == 250 {
                    self.register_capability(&reply.text);
                    if reply.last {
                        self.message_ready();
                    }
                    true
                } else {
                    self.hard_failure();
                    false
                }
            }

            ProtocolStage::DeclaringSender => {
                if reply.code == 250 {
                    self.transition(ProtocolStage::DeclaringRecipients);
                    self.announce_next_recipient();
                } else {
                    self.soft_failure();
                }
                true
            }

            ProtocolStage::DeclaringRecipients => {
                if reply.code == 250 {
                    self.announce_next_recipient();
                } else {
                    self.soft_failure();
                }
                true
            }

            ProtocolStage::SendingData => {
                if reply.code == 354 {
                    self.transition(ProtocolStage::AwaitingSendResponse);
                    if let Some(mail) = self.mail.take() {
                        self.send_direct(mail.headers.generate_raw().as_bytes());
                        self.send_direct(&mail.body);
                        if !mail.body.ends_with(b"\r\n") {
                            self.send_direct(b"\r\n");
                        }
                        self.send_direct(b".\r\n");
                    }
                } else {
                    self.soft_failure();
                }
                true
            }

            ProtocolStage::AwaitingSendResponse => {
                if let Some(handle) = self.send_completed.take() {
                    let _ = handle.send(reply.code == 250);
                }
                self.message_ready();
                true
            }

            ProtocolStage::ReadyToSend => {
                // A reply with no command outstanding is a protocol
                // violation.
                self.hard_failure();
                false
            }
        }
    }

    /// An EHLO option line: the keyword, optionally followed by a
    /// parameter string after the first space.
    fn register_capability(&mut self, text: &str) {
        let (name, params) = match text.split_once(' ') {
            Some((name, params)) => (name, params),
            None => (text, ""),
        };
        if let Some(handler) = self.registered.get(name).cloned() {
            if !self.supported.iter().any(|supported| supported == name) {
                self.supported.push(name.to_string());
            }
            handler.configure(params);
        }
    }

    /// Move to the next stage, giving supported extensions the chance to
    /// run a sub-stage of their own first.
    fn transition(&mut self, next: ProtocolStage) {
        self.active_extension = None;
        self.context.protocol_stage = next;
        let mut completion = None;
        for name in self.supported.clone() {
            let Some(handler) = self.registered.get(&name).cloned() else {
                continue;
            };
            if handler.needs_extra_stage(&self.context) {
                self.active_extension = Some(name);
                let connection = self.connection.clone();
                let mut stage = ExtensionStage::new(connection.as_deref());
                handler.go_ahead(&mut stage);
                completion = stage.take_completion();
                break;
            }
        }
        match completion {
            // The extension finished synchronously; re-enter the stage
            // so the next extension (or the core) can proceed.
            Some(true) => return self.transition(self.context.protocol_stage),
            Some(false) => return self.soft_failure(),
            None => {}
        }
        if self.context.protocol_stage == ProtocolStage::ReadyToSend
            && self.active_extension.is_none()
        {
            self.notify_ready();
        }
    }

    fn announce_next_recipient(&mut self) {
        let next = self
            .mail
            .as_mut()
            .and_then(|mail| mail.recipients.pop_front());
        match next {
            Some(recipient) => self.send_via_extensions(&format!("RCPT TO:{recipient}")),
            None => {
                self.send_via_extensions("DATA");
                self.transition(ProtocolStage::SendingData);
            }
        }
    }

    fn message_ready(&mut self) {
        self.transition(ProtocolStage::ReadyToSend);
    }

    fn notify_ready(&mut self) {
        for handle in std::mem::take(&mut self.ready_or_broken) {
            let _ = handle.send(true);
        }
    }

    /// The current mail is rejected but the session stays usable.
    fn soft_failure(&mut self) {
        if let Some(handle) = self.send_completed.take() {
            let _ = handle.send(false);
        }
        self.mail = None;
        self.message_ready();
    }

    /// The session is unusable: resolve every outstanding handle with
    /// false and drop the connection.
    fn hard_failure(&mut self) {
        for handle in std::mem::take(&mut self.ready_or_broken) {
            let _ = handle.send(false);
        }
        if let Some(handle) = self.send_completed.take() {
            let _ = handle.send(false);
        }
        self.mail = None;
        self.active_extension = None;
        if let Some(connection) = self.connection.take() {
            connection.close();
            self.trace(SessionTraceEvent::Closed);
        }
    }

    /// Run a command line through the modify pipeline of the supported
    /// extensions (advertised order), then send it.
    fn send_via_extensions(&mut self, input: &str) {
        let mut line = input.to_string();
        for name in &self.supported {
            if let Some(handler) = self.registered.get(name) {
                line = handler.modify_message(&self.context, line);
            }
        }
        line.push_str("\r\n");
        self.send_direct(line.as_bytes());
    }

    fn send_direct(&self, data: &[u8]) {
        let printable = String::from_utf8_lossy(data);
        let printable = printable.strip_suffix("\r\n").unwrap_or(&printable);
        tracing::trace!("send->{}: {}", self.hostname, printable.escape_debug());
        self.trace(SessionTraceEvent::Write(printable.to_string()));
        if let Some(connection) = &self.connection {
            connection.send(data);
        }
    }

    fn trace(&self, event: SessionTraceEvent) {
        if let Some(tracer) = &self.tracer {
            tracer.trace_event(event);
        }
    }

    fn diagnostic(&self, level: Level, message: &str) {
        // The tracing macros want a const level, so dispatch explicitly.
        match level {
            Level::ERROR => tracing::error!("{message}"),
            Level::WARN => tracing::warn!("{message}"),
            _ => tracing::trace!("{message}"),
        }
        self.trace(SessionTraceEvent::Diagnostic {
            level,
            message: message.to_string(),
        });
    }
}

/// RFC 5321 address literal for the locally bound address, as used in
/// the EHLO argument.
fn address_literal(addr: SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("[{}]", v4.ip()),
        SocketAddr::V6(v6) => format!("[IPv6:{}]", v6.ip()),
    }
}

fn parse_reply_line(line: Vec<u8>) -> Result<Reply, ClientError> {
    let line = String::from_utf8(line)?;
    // 3-digit code, separator, CRLF
    if line.len() < 6 || !line.as_bytes()[0..3].iter().all(|b| b.is_ascii_digit()) {
        return Err(ClientError::MalformedReplyLine(line));
    }
    let last = match line.as_bytes()[3] {
        b' ' => true,
        b'-' => false,
        _ => return Err(ClientError::MalformedReplyLine(line)),
    };
    let code = match line[0..3].parse::<u16>() {
        Ok(code) => code,
        Err(_) => return Err(ClientError::MalformedReplyLine(line)),
    };
    let text = line[4..line.len() - 2].to_string();
    Ok(Reply { code, last, text })
}

/// Normalize line endings to CRLF, discarding any stray CR, and give a
/// non-empty body a terminal CRLF if it lacks one. Running this twice
/// yields the same bytes as running it once.
fn normalize_line_endings(body: &[u8]) -> Vec<u8> {
    let mut normalized = Vec::with_capacity(body.len() + 2);
    for &byte in body {
        match byte {
            b'\n' => normalized.extend_from_slice(b"\r\n"),
            b'\r' => {}
            _ => normalized.push(byte),
        }
    }
    if !normalized.is_empty() && !normalized.ends_with(b"\r\n") {
        normalized.extend_from_slice(b"\r\n");
    }
    normalized
}

/// RFC 5321 4.5.2: double the leading dot of any line that starts with
/// one, so that `.` on a line of its own unambiguously ends the body.
/// Returns None when the body needs no stuffing.
fn dot_stuff(data: &[u8]) -> Option<Vec<u8>> {
    if !data.starts_with(b".") && memchr::memmem::find(data, b"\n.").is_none() {
        return None;
    }

    let mut stuffed = Vec::with_capacity(data.len() + 8);
    if data.starts_with(b".") {
        stuffed.push(b'.');
    }
    let mut last_idx = 0;
    for i in memchr::memmem::find_iter(data, b"\n.") {
        stuffed.extend_from_slice(&data[last_idx..=i]);
        stuffed.push(b'.');
        last_idx = i + 1;
    }
    stuffed.extend_from_slice(&data[last_idx..]);
    Some(stuffed)
}

fn process_body(body: &[u8]) -> Vec<u8> {
    let normalized = normalize_line_endings(body);
    match dot_stuff(&normalized) {
        Some(stuffed) => stuffed,
        None => normalized,
    }
}
