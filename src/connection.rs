//! Connection lifecycle, frame dispatch, and the per-socket reader task

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::{
    command::{
        serialize_sendmsg_batch, EslCommand, EslResponse, SendMsg,
    },
    constants::{
        CONNECT_TIMEOUT, DEFAULT_COMMAND_TIMEOUT, DEFAULT_IDLE_READ_WINDOW,
        HEADER_CONTENT_DISPOSITION, JOB_ENTRY_TTL, MAX_EVENT_QUEUE_SIZE, READ_POLL_INTERVAL,
        SOCKET_BUF_SIZE,
    },
    correlate::{JobRegistry, PendingReplies, ReplyOutcome},
    error::{EslError, EslResult},
    event::{EslEvent, EslEventType},
    listener::{ChannelEventListener, Context},
    message::{ContentType, EslMessage, EslParser},
    options::ServerOption,
};

/// Per-socket connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// TCP session being established
    Connecting,
    /// Inbound handshake in progress (`auth/request` → `auth <pw>` → `+OK`)
    Authenticating,
    /// Commands and events flow
    Ready,
    /// Terminal condition hit; outstanding promises being failed
    Draining,
    /// Socket gone, everything failed
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Server sent `text/disconnect-notice`
    ServerNotice,
    /// Clean EOF on the TCP connection
    ConnectionClosed,
    /// TCP I/O error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// Fatal framing or decoding error
    ProtocolError(String),
    /// Client called `close()`
    ClientRequested,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ServerNotice => write!(f, "server sent disconnect notice"),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
        }
    }
}

/// Parameters fixed at connection setup.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Deadline for each command reply.
    pub command_timeout: Duration,
    /// Reader-idle window before a `bgapi status` probe goes out.
    /// Zero disables probing.
    pub idle_read_window: Duration,
    /// Capacity of the ordered event dispatch queue.
    pub event_queue_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            idle_read_window: DEFAULT_IDLE_READ_WINDOW,
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
        }
    }
}

struct ConnInner {
    writer: Mutex<OwnedWriteHalf>,
    replies: PendingReplies,
    jobs: JobRegistry,
    state_tx: watch::Sender<ConnState>,
    remote_addr: String,
    command_timeout_ms: AtomicU64,
    idle_window_ms: AtomicU64,
    listener: Arc<dyn ChannelEventListener>,
    connect_pool: Arc<Semaphore>,
}

/// Handle to one ESL session (Clone + Send).
///
/// Commands are serialized through the writer mutex; the reply slot is
/// reserved inside the same critical section that writes the bytes, so the
/// reply FIFO always matches wire order.
#[derive(Clone)]
pub struct EslConnection {
    inner: Arc<ConnInner>,
    state_rx: watch::Receiver<ConnState>,
}

impl std::fmt::Debug for EslConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EslConnection")
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Awaitable handle to a submitted `bgapi` job.
#[derive(Debug)]
pub struct BackgroundJob {
    job_uuid: String,
    rx: oneshot::Receiver<EslEvent>,
}

impl BackgroundJob {
    /// The `Job-UUID` returned by the synchronous reply.
    pub fn job_uuid(&self) -> &str {
        &self.job_uuid
    }

    /// Await the `BACKGROUND_JOB` completion event.
    pub async fn wait(self) -> EslResult<EslEvent> {
        self.rx.await.map_err(|_| EslError::ConnectionClosed)
    }

    /// Await the completion event with a deadline. On expiry the registry
    /// entry is abandoned and a late completion is dropped silently.
    pub async fn wait_timeout(self, deadline: Duration) -> EslResult<EslEvent> {
        match timeout(deadline, self.rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(EslError::ConnectionClosed),
            Err(_) => Err(EslError::Timeout {
                timeout_ms: deadline.as_millis() as u64,
            }),
        }
    }
}

/// Read one frame from an unsplit stream. Used during the inbound handshake,
/// before the reader task owns the socket.
async fn recv_frame(
    stream: &mut TcpStream,
    parser: &mut EslParser,
    read_buf: &mut [u8],
    deadline: Duration,
) -> EslResult<EslMessage> {
    let started = Instant::now();
    loop {
        if let Some(message) = parser.parse_message()? {
            trace!(content_type = %message.content_type(), "handshake frame");
            return Ok(message);
        }

        let remaining = deadline
            .checked_sub(started.elapsed())
            .ok_or(EslError::Timeout {
                timeout_ms: deadline.as_millis() as u64,
            })?;
        let n = match timeout(remaining, stream.read(read_buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(EslError::Io(e)),
            Err(_) => {
                return Err(EslError::Timeout {
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
        };
        if n == 0 {
            return match parser.eof_error() {
                Some(e) => Err(e),
                None => Err(EslError::ConnectionClosed),
            };
        }
        parser.feed(&read_buf[..n])?;
    }
}

impl EslConnection {
    /// Inbound mode: dial the server, authenticate, subscribe to events.
    pub(crate) async fn connect_inbound(
        option: &ServerOption,
        listener: Arc<dyn ChannelEventListener>,
        connect_pool: Arc<Semaphore>,
    ) -> EslResult<Self> {
        let remote_addr = option.addr();
        info!(remote_addr = %remote_addr, "connecting to FreeSWITCH");

        let (state_tx, state_rx) = watch::channel(ConnState::Connecting);

        let mut stream = match timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((option.host.as_str(), option.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(EslError::Io(e)),
            Err(_) => {
                return Err(EslError::Timeout {
                    timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
                })
            }
        };

        let _ = state_tx.send(ConnState::Authenticating);
        let mut parser = EslParser::new();
        let mut read_buf = vec![0u8; SOCKET_BUF_SIZE];
        let deadline = option.command_timeout;

        let first = recv_frame(&mut stream, &mut parser, &mut read_buf, deadline).await?;
        match first.content_type() {
            ContentType::AuthRequest => {}
            ContentType::RudeRejection => {
                return Err(EslError::auth_failed(
                    first.body().unwrap_or("access denied").trim().to_string(),
                ));
            }
            other => {
                return Err(EslError::protocol_error(format!(
                    "expected auth/request, got {}",
                    other
                )));
            }
        }

        let auth = EslCommand::Auth {
            password: option.password.clone(),
        };
        debug!("sending command: auth [REDACTED]");
        stream
            .write_all(auth.to_wire_format()?.as_bytes())
            .await
            .map_err(EslError::Io)?;

        let reply = recv_frame(&mut stream, &mut parser, &mut read_buf, deadline).await?;
        let response = EslResponse::from_message(reply);
        if !response.is_success() {
            let reason = response
                .reply_text()
                .map(|t| t.into_owned())
                .unwrap_or_else(|| "authentication rejected".to_string());
            return Err(EslError::auth_failed(reason));
        }
        let _ = state_tx.send(ConnState::Ready);
        info!(remote_addr = %remote_addr, "authenticated");

        let conn = Self::spawn(
            stream,
            parser,
            remote_addr,
            option.settings(),
            listener,
            connect_pool,
            state_tx,
            state_rx,
        );

        if !option.event_subscription.is_empty() {
            if let Err(e) = conn.subscribe_events(&option.event_subscription).await {
                conn.close().await;
                return Err(e);
            }
        }

        Ok(conn)
    }

    /// Outbound mode: wrap an accepted socket. The caller drives the
    /// `connect` handshake via [`connect_session`](Self::connect_session).
    pub(crate) fn accept_outbound(
        stream: TcpStream,
        remote_addr: String,
        settings: ConnectionSettings,
        listener: Arc<dyn ChannelEventListener>,
        connect_pool: Arc<Semaphore>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnState::Connecting);
        Self::spawn(
            stream,
            EslParser::new(),
            remote_addr,
            settings,
            listener,
            connect_pool,
            state_tx,
            state_rx,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        stream: TcpStream,
        parser: EslParser,
        remote_addr: String,
        settings: ConnectionSettings,
        listener: Arc<dyn ChannelEventListener>,
        connect_pool: Arc<Semaphore>,
        state_tx: watch::Sender<ConnState>,
        state_rx: watch::Receiver<ConnState>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();

        let inner = Arc::new(ConnInner {
            writer: Mutex::new(write_half),
            replies: PendingReplies::new(),
            jobs: JobRegistry::new(JOB_ENTRY_TTL),
            state_tx,
            remote_addr,
            command_timeout_ms: AtomicU64::new(settings.command_timeout.as_millis() as u64),
            idle_window_ms: AtomicU64::new(settings.idle_read_window.as_millis() as u64),
            listener,
            connect_pool,
        });

        let conn = EslConnection { inner, state_rx };

        let (event_tx, event_rx) = mpsc::channel(settings.event_queue_size.max(1));
        tokio::spawn(reader_loop(read_half, parser, conn.clone(), event_tx));
        tokio::spawn(dispatch_loop(event_rx, conn.clone()));

        conn
    }

    /// Canonical `host:port` of the remote end.
    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    /// `true` while commands can be issued.
    pub fn is_live(&self) -> bool {
        !matches!(self.state(), ConnState::Draining | ConnState::Closed)
    }

    /// Wait until the connection reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state_rx.clone();
        while *rx.borrow() != ConnState::Closed {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Override the per-command reply deadline.
    pub fn set_command_timeout(&self, deadline: Duration) {
        self.inner
            .command_timeout_ms
            .store(deadline.as_millis() as u64, Ordering::Relaxed);
    }

    /// Override the reader-idle probe window. Zero disables probing.
    pub fn set_idle_read_window(&self, window: Duration) {
        self.inner
            .idle_window_ms
            .store(window.as_millis() as u64, Ordering::Relaxed);
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.command_timeout_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn context(&self) -> Context {
        Context::new(self.clone())
    }

    pub(crate) fn mark_ready(&self) {
        self.inner.state_tx.send_if_modified(|state| {
            if *state == ConnState::Connecting {
                *state = ConnState::Ready;
                true
            } else {
                false
            }
        });
    }

    /// Write a wire string and reserve its reply slot, atomically with
    /// respect to other writers.
    async fn write_and_enqueue(&self, wire: &str) -> EslResult<oneshot::Receiver<EslMessage>> {
        if !self.is_live() {
            return Err(EslError::NotConnected);
        }
        let mut writer = self.inner.writer.lock().await;
        let rx = self.inner.replies.enqueue();
        if let Err(e) = writer.write_all(wire.as_bytes()).await {
            self.inner.replies.abandon_newest();
            return Err(EslError::Io(e));
        }
        Ok(rx)
    }

    async fn send_recv(&self, wire: String, deadline: Duration) -> EslResult<EslMessage> {
        let rx = self.write_and_enqueue(&wire).await?;
        match timeout(deadline, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(EslError::ConnectionClosed),
            // The slot stays queued as a tombstone; the late reply pops it
            // and is dropped, keeping younger commands aligned.
            Err(_) => Err(EslError::Timeout {
                timeout_ms: deadline.as_millis() as u64,
            }),
        }
    }

    /// Send a command and await its reply under the default deadline.
    pub async fn send_command(&self, command: &EslCommand) -> EslResult<EslResponse> {
        self.send_command_timeout(command, self.command_timeout()).await
    }

    /// Send a command and await its reply under an explicit deadline.
    pub async fn send_command_timeout(
        &self,
        command: &EslCommand,
        deadline: Duration,
    ) -> EslResult<EslResponse> {
        let wire = command.to_wire_format()?;
        debug!(remote_addr = %self.inner.remote_addr, command = %command.display_line(), "sending command");
        let message = self.send_recv(wire, deadline).await?;
        Ok(EslResponse::from_message(message))
    }

    /// Execute an `api` command and return the response.
    pub async fn api(&self, command: &str) -> EslResult<EslResponse> {
        self.send_command(&EslCommand::Api {
            command: command.to_string(),
        })
        .await
    }

    /// Submit a `bgapi` command; returns the `Job-UUID` once the synchronous
    /// reply arrives. The completion event flows to the event listener.
    pub async fn bgapi_submit(&self, command: &str) -> EslResult<String> {
        let response = self
            .send_command(&EslCommand::BgApi {
                command: command.to_string(),
            })
            .await?
            .into_result()?;
        response
            .job_uuid()
            .map(|u| u.into_owned())
            .ok_or(EslError::MissingJobUuid)
    }

    /// Submit a `bgapi` command and register for its completion event.
    ///
    /// The returned [`BackgroundJob`] resolves when the matching
    /// `BACKGROUND_JOB` event arrives; that event is not delivered to the
    /// listener.
    pub async fn bgapi(&self, command: &str) -> EslResult<BackgroundJob> {
        let response = self
            .send_command(&EslCommand::BgApi {
                command: command.to_string(),
            })
            .await?
            .into_result()?;
        let job_uuid = response
            .job_uuid()
            .map(|u| u.into_owned())
            .ok_or(EslError::MissingJobUuid)?;
        let rx = self.inner.jobs.register(&job_uuid)?;
        Ok(BackgroundJob { job_uuid, rx })
    }

    /// Subscribe to events; the expression goes out verbatim as
    /// `event <expression>`.
    pub async fn subscribe_events(&self, expression: &str) -> EslResult<()> {
        self.send_command(&EslCommand::Events {
            expression: expression.to_string(),
        })
        .await?
        .into_result()
        .map(|_| ())
    }

    /// Inject one `sendmsg` unit and await its reply.
    pub async fn send_msg(&self, msg: SendMsg) -> EslResult<EslResponse> {
        self.send_command(&EslCommand::SendMsg { msg }).await
    }

    /// Inject a batch of `sendmsg` units in one write, without awaiting the
    /// replies. Each unit still produces a `command/reply`; the reserved
    /// slots are abandoned so those replies are dropped on arrival.
    pub async fn send_msg_batch(&self, batch: &[SendMsg]) -> EslResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if !self.is_live() {
            return Err(EslError::NotConnected);
        }
        let wire = serialize_sendmsg_batch(batch);
        let mut writer = self.inner.writer.lock().await;
        let mut slots = Vec::with_capacity(batch.len());
        for _ in batch {
            slots.push(self.inner.replies.enqueue());
        }
        if let Err(e) = writer.write_all(wire.as_bytes()).await {
            for _ in &slots {
                self.inner.replies.abandon_newest();
            }
            return Err(EslError::Io(e));
        }
        Ok(())
    }

    /// Execute a dialplan application (`sendmsg` with `call-command: execute`).
    pub async fn execute(
        &self,
        app: &str,
        arg: Option<&str>,
        uuid: Option<&str>,
    ) -> EslResult<EslResponse> {
        self.send_command(&EslCommand::Execute {
            app: app.to_string(),
            arg: arg.map(str::to_string),
            uuid: uuid.map(str::to_string),
        })
        .await
    }

    /// Outbound mode: send `connect` and promote the reply into the initial
    /// channel-data event.
    pub async fn connect_session(&self) -> EslResult<EslEvent> {
        let message = self
            .send_recv(EslCommand::Connect.to_wire_format()?, self.command_timeout())
            .await?;
        self.mark_ready();
        Ok(EslEvent::from_command_reply(message))
    }

    /// Set an event filter (`filter <header> <value>`).
    pub async fn filter_events(&self, header: &str, value: &str) -> EslResult<()> {
        self.send_command(&EslCommand::Filter {
            header: header.to_string(),
            value: value.to_string(),
        })
        .await?
        .into_result()
        .map(|_| ())
    }

    /// Remove an event filter, or all filters for a header.
    pub async fn filter_delete(&self, header: &str, value: Option<&str>) -> EslResult<()> {
        self.send_command(&EslCommand::FilterDelete {
            header: header.to_string(),
            value: value.map(str::to_string),
        })
        .await?
        .into_result()
        .map(|_| ())
    }

    /// Subscribe to the attached session's events (outbound mode).
    pub async fn myevents(&self, format: &str) -> EslResult<()> {
        self.send_command(&EslCommand::MyEvents {
            format: format.to_string(),
            uuid: None,
        })
        .await?
        .into_result()
        .map(|_| ())
    }

    /// Unsubscribe from specific events.
    pub async fn nixevent(&self, events: &str) -> EslResult<()> {
        self.send_command(&EslCommand::NixEvent {
            events: events.to_string(),
        })
        .await?
        .into_result()
        .map(|_| ())
    }

    /// Unsubscribe from all events.
    pub async fn noevents(&self) -> EslResult<()> {
        self.send_command(&EslCommand::NoEvents)
            .await?
            .into_result()
            .map(|_| ())
    }

    /// Keep the socket open after channel hangup (outbound mode).
    pub async fn linger(&self, timeout: Option<u32>) -> EslResult<()> {
        self.send_command(&EslCommand::Linger { timeout })
            .await?
            .into_result()
            .map(|_| ())
    }

    /// Cancel linger mode.
    pub async fn nolinger(&self) -> EslResult<()> {
        self.send_command(&EslCommand::NoLinger)
            .await?
            .into_result()
            .map(|_| ())
    }

    /// Resume dialplan execution when the socket closes (outbound mode).
    pub async fn resume(&self) -> EslResult<()> {
        self.send_command(&EslCommand::Resume)
            .await?
            .into_result()
            .map(|_| ())
    }

    /// Redirect session events to this socket (outbound mode).
    pub async fn divert_events(&self, on: bool) -> EslResult<()> {
        self.send_command(&EslCommand::DivertEvents { on })
            .await?
            .into_result()
            .map(|_| ())
    }

    /// Read a channel variable (outbound mode).
    ///
    /// Protocol quirk: `getvar` returns the bare value in `Reply-Text` with
    /// no `+OK` prefix, and an empty string for a missing variable.
    pub async fn getvar(&self, name: &str) -> EslResult<String> {
        let response = self
            .send_command(&EslCommand::GetVar {
                name: name.to_string(),
            })
            .await?;
        Ok(response
            .reply_text()
            .map(|t| t.into_owned())
            .unwrap_or_default())
    }

    /// Enable FreeSWITCH log forwarding at the given level.
    pub async fn log(&self, level: &str) -> EslResult<EslResponse> {
        self.send_command(&EslCommand::Log {
            level: level.to_string(),
        })
        .await
    }

    /// Disable log forwarding.
    pub async fn nolog(&self) -> EslResult<EslResponse> {
        self.send_command(&EslCommand::NoLog).await
    }

    /// Send a no-op keepalive.
    pub async fn noop(&self) -> EslResult<EslResponse> {
        self.send_command(&EslCommand::NoOp).await
    }

    /// Send `exit` and await the server's goodbye.
    pub async fn exit(&self) -> EslResult<EslResponse> {
        self.send_command(&EslCommand::Exit).await
    }

    /// Close the connection from this side. Outstanding replies and jobs
    /// fail with `ConnectionClosed`.
    pub async fn close(&self) {
        {
            let mut writer = self.inner.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.teardown(DisconnectReason::ClientRequested).await;
    }

    /// Fire the `bgapi status` liveness probe without waiting for its reply.
    /// The reserved slot is abandoned immediately, so the reply is dropped
    /// on arrival and no user callback fires.
    fn spawn_idle_probe(&self) {
        let conn = self.clone();
        tokio::spawn(async move {
            debug!(remote_addr = %conn.inner.remote_addr, "reader idle, probing with bgapi status");
            let command = EslCommand::BgApi {
                command: "status".to_string(),
            };
            let wire = match command.to_wire_format() {
                Ok(wire) => wire,
                Err(_) => return,
            };
            if let Err(e) = conn.write_and_enqueue(&wire).await {
                debug!(remote_addr = %conn.inner.remote_addr, error = %e, "idle probe failed");
            }
        });
    }

    /// Fail everything and close, exactly once.
    pub(crate) async fn teardown(&self, reason: DisconnectReason) {
        let mut claimed = false;
        self.inner.state_tx.send_if_modified(|state| {
            if matches!(*state, ConnState::Draining | ConnState::Closed) {
                false
            } else {
                *state = ConnState::Draining;
                claimed = true;
                true
            }
        });
        if !claimed {
            return;
        }

        info!(remote_addr = %self.inner.remote_addr, reason = %reason, "connection closing");
        let pending = self.inner.replies.len() + self.inner.jobs.len();
        if pending > 0 {
            debug!(remote_addr = %self.inner.remote_addr, pending, "failing outstanding promises");
        }
        self.inner.replies.fail_all();
        self.inner.jobs.fail_all();
        let _ = self.inner.state_tx.send(ConnState::Closed);

        let listener = self.inner.listener.clone();
        let ctx = self.context();
        let remote_addr = self.inner.remote_addr.clone();
        let callback = AssertUnwindSafe(listener.handle_disconnect_notice(&remote_addr, ctx));
        if futures_util::FutureExt::catch_unwind(callback).await.is_err() {
            tracing::error!(remote_addr = %remote_addr, "disconnect listener panicked");
        }
    }

    /// Frame dispatch per the connection design: events to the dispatcher or
    /// the job registry, replies to the FIFO, notices to teardown.
    async fn handle_frame(
        &self,
        message: EslMessage,
        event_tx: &mpsc::Sender<EslEvent>,
    ) -> Result<(), DisconnectReason> {
        match message.content_type().clone() {
            ContentType::EventPlain | ContentType::EventXml | ContentType::EventJson => {
                let event = match EslEvent::from_event_message(message) {
                    Ok(event) => event,
                    Err(e) => return Err(DisconnectReason::ProtocolError(e.to_string())),
                };
                let event = if event.is_event_type(EslEventType::BackgroundJob) {
                    let job_uuid = event.job_uuid().map(|u| u.into_owned());
                    match job_uuid {
                        Some(job_uuid) => match self.inner.jobs.complete(&job_uuid, event) {
                            None => {
                                trace!(job_uuid = %job_uuid, "background job correlated");
                                return Ok(());
                            }
                            // No waiter registered (e.g. the idle probe's
                            // phantom job): falls through to the listener.
                            Some(event) => event,
                        },
                        None => {
                            warn!("BACKGROUND_JOB event without Job-UUID header");
                            event
                        }
                    }
                } else {
                    event
                };
                if event_tx.send(event).await.is_err() {
                    return Err(DisconnectReason::ConnectionClosed);
                }
                Ok(())
            }
            ContentType::CommandReply | ContentType::ApiResponse => {
                match self.inner.replies.complete_next(message) {
                    ReplyOutcome::Delivered => {}
                    ReplyOutcome::LateDropped => {
                        debug!(remote_addr = %self.inner.remote_addr, "late reply dropped")
                    }
                    ReplyOutcome::NonePending => {
                        warn!(remote_addr = %self.inner.remote_addr, "reply received with no pending command, dropping")
                    }
                }
                Ok(())
            }
            ContentType::AuthRequest => {
                // Post-handshake auth requests are surfaced to the listener,
                // which replies with `auth <pw>` (inbound mode only).
                let listener = self.inner.listener.clone();
                let ctx = self.context();
                tokio::spawn(async move {
                    let callback = AssertUnwindSafe(listener.handle_auth_request(ctx));
                    if futures_util::FutureExt::catch_unwind(callback).await.is_err() {
                        tracing::error!("auth request listener panicked");
                    }
                });
                Ok(())
            }
            ContentType::DisconnectNotice => {
                let disposition = message
                    .header(HEADER_CONTENT_DISPOSITION)
                    .map(|d| d.into_owned());
                if disposition.as_deref() == Some("linger") {
                    debug!(remote_addr = %self.inner.remote_addr, "disconnect notice with linger disposition, staying open");
                    return Ok(());
                }
                Err(DisconnectReason::ServerNotice)
            }
            ContentType::RudeRejection => {
                warn!(
                    remote_addr = %self.inner.remote_addr,
                    body = message.body().unwrap_or(""),
                    "server rejected the connection"
                );
                Ok(())
            }
            ContentType::Unknown(content_type) => {
                let err = EslError::UnsupportedContentType { content_type };
                warn!(remote_addr = %self.inner.remote_addr, "{}, dropping frame", err);
                Ok(())
            }
        }
    }
}

/// Background reader: frames bytes, dispatches, and tears the connection
/// down when the socket or codec gives out.
async fn reader_loop(
    reader: OwnedReadHalf,
    parser: EslParser,
    conn: EslConnection,
    event_tx: mpsc::Sender<EslEvent>,
) {
    let inner = AssertUnwindSafe(reader_loop_inner(reader, parser, conn.clone(), event_tx));
    match futures_util::FutureExt::catch_unwind(inner).await {
        Ok(reason) => conn.teardown(reason).await,
        Err(_) => {
            tracing::error!(remote_addr = %conn.remote_addr(), "reader task panicked");
            conn.teardown(DisconnectReason::ProtocolError("reader task panicked".into()))
                .await;
        }
    }
}

async fn reader_loop_inner(
    mut reader: OwnedReadHalf,
    mut parser: EslParser,
    conn: EslConnection,
    event_tx: mpsc::Sender<EslEvent>,
) -> DisconnectReason {
    let mut read_buf = vec![0u8; SOCKET_BUF_SIZE];
    let mut last_recv = Instant::now();
    let mut last_probe: Option<Instant> = None;

    loop {
        // Drain every complete frame before touching the socket again
        match parser.parse_message() {
            Ok(Some(message)) => {
                if let Err(reason) = conn.handle_frame(message, &event_tx).await {
                    return reason;
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(remote_addr = %conn.remote_addr(), error = %e, "frame decode failed");
                return DisconnectReason::ProtocolError(e.to_string());
            }
        }

        match timeout(READ_POLL_INTERVAL, reader.read(&mut read_buf)).await {
            Ok(Ok(0)) => {
                return match parser.eof_error() {
                    Some(e) => {
                        warn!(remote_addr = %conn.remote_addr(), error = %e, "EOF mid-frame");
                        DisconnectReason::ProtocolError(e.to_string())
                    }
                    None => {
                        info!(remote_addr = %conn.remote_addr(), "connection closed (EOF)");
                        DisconnectReason::ConnectionClosed
                    }
                };
            }
            Ok(Ok(n)) => {
                trace!(remote_addr = %conn.remote_addr(), bytes = n, "read");
                last_recv = Instant::now();
                last_probe = None;
                if let Err(e) = parser.feed(&read_buf[..n]) {
                    warn!(remote_addr = %conn.remote_addr(), error = %e, "buffer error");
                    return DisconnectReason::ProtocolError(e.to_string());
                }
            }
            Ok(Err(e)) => {
                warn!(remote_addr = %conn.remote_addr(), error = %e, "read error");
                return DisconnectReason::IoError(e.to_string());
            }
            Err(_) => {
                let window_ms = conn.inner.idle_window_ms.load(Ordering::Relaxed);
                if window_ms == 0 || conn.state() != ConnState::Ready {
                    continue;
                }
                let window = Duration::from_millis(window_ms);
                let probe_due = last_recv.elapsed() >= window
                    && last_probe.map(|p| p.elapsed() >= window).unwrap_or(true);
                if probe_due {
                    last_probe = Some(Instant::now());
                    conn.spawn_idle_probe();
                }
            }
        }
    }
}

/// Ordered event delivery: one consumer per connection, so the listener
/// observes events in wire arrival order. Panics are contained per event.
async fn dispatch_loop(mut event_rx: mpsc::Receiver<EslEvent>, conn: EslConnection) {
    while let Some(event) = event_rx.recv().await {
        let listener = conn.inner.listener.clone();
        let ctx = conn.context();
        let callback = AssertUnwindSafe(listener.handle_esl_event(ctx, event));
        if futures_util::FutureExt::catch_unwind(callback).await.is_err() {
            tracing::error!(remote_addr = %conn.remote_addr(), "event listener panicked");
        }
    }
}

/// Deliver the promoted channel-data event on the shared bounded pool.
///
/// `on_connect` may run long (dialplan logic); the semaphore keeps one slow
/// session from serializing the rest while still bounding concurrency.
pub(crate) fn dispatch_on_connect(conn: &EslConnection, channel_data: EslEvent) {
    let listener = conn.inner.listener.clone();
    let pool = conn.inner.connect_pool.clone();
    let ctx = conn.context();
    let remote_addr = conn.remote_addr().to_string();
    tokio::spawn(async move {
        let _permit = match pool.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let callback = AssertUnwindSafe(listener.on_connect(ctx, channel_data));
        if futures_util::FutureExt::catch_unwind(callback).await.is_err() {
            tracing::error!(remote_addr = %remote_addr, "on_connect listener panicked");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_reason_display() {
        assert_eq!(
            DisconnectReason::ServerNotice.to_string(),
            "server sent disconnect notice"
        );
        assert_eq!(
            DisconnectReason::IoError("broken pipe".into()).to_string(),
            "I/O error: broken pipe"
        );
    }

    #[test]
    fn default_settings() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.command_timeout, DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(settings.idle_read_window, DEFAULT_IDLE_READ_WINDOW);
        assert_eq!(settings.event_queue_size, MAX_EVENT_QUEUE_SIZE);
    }
}
