//! Listener contract for connection and event callbacks

use crate::{
    command::{EslResponse, SendMsg},
    connection::{BackgroundJob, EslConnection},
    constants::DEFAULT_COMMAND_TIMEOUT,
    error::EslResult,
    event::EslEvent,
};
use async_trait::async_trait;
use std::time::Duration;

/// Handle passed to listener callbacks, binding the connection that produced
/// the event and a default command timeout.
///
/// Cheap to clone; commands issued through it go out on the originating
/// connection. Do not retain a `Context` beyond the connection's lifetime —
/// commands on a closed connection fail with
/// [`NotConnected`](crate::EslError::NotConnected).
#[derive(Clone)]
pub struct Context {
    connection: EslConnection,
    command_timeout: Duration,
}

impl Context {
    pub(crate) fn new(connection: EslConnection) -> Self {
        Self {
            connection,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// The connection this callback fired on.
    pub fn connection(&self) -> &EslConnection {
        &self.connection
    }

    /// Canonical `host:port` of the remote end.
    pub fn remote_addr(&self) -> &str {
        self.connection.remote_addr()
    }

    /// Default deadline applied to commands issued through this context.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Run an `api` command on the originating connection.
    pub async fn api(&self, command: &str) -> EslResult<EslResponse> {
        self.connection.api(command).await
    }

    /// Submit a `bgapi` command and await its `BACKGROUND_JOB` completion.
    pub async fn bgapi(&self, command: &str) -> EslResult<BackgroundJob> {
        self.connection.bgapi(command).await
    }

    /// Execute a dialplan application on the attached channel.
    pub async fn execute(&self, app: &str, arg: Option<&str>) -> EslResult<EslResponse> {
        self.connection.execute(app, arg, None).await
    }

    /// Inject a `sendmsg` unit.
    pub async fn send_msg(&self, msg: SendMsg) -> EslResult<EslResponse> {
        self.connection.send_msg(msg).await
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}

/// Callbacks surfaced by the runtime.
///
/// Delivery contexts differ per method:
///
/// - [`handle_esl_event`](Self::handle_esl_event) runs on a single dispatcher
///   task per connection, so events are observed in wire arrival order.
/// - [`on_connect`](Self::on_connect) runs on a bounded pool shared across
///   connections; dialplan logic may be slow without serializing other
///   sessions behind it.
///
/// No callback ever runs on the socket reader itself. Default implementations
/// do nothing.
#[async_trait]
pub trait ChannelEventListener: Send + Sync + 'static {
    /// Outbound mode: called once per accepted session with the channel data
    /// promoted from the `connect` reply.
    async fn on_connect(&self, _ctx: Context, _channel_data: EslEvent) {}

    /// A wire event, delivered in arrival order per connection.
    async fn handle_esl_event(&self, _ctx: Context, _event: EslEvent) {}

    /// Inbound mode: the server asked for authentication outside the
    /// connection handshake. Implementations reply with `auth <password>`.
    async fn handle_auth_request(&self, _ctx: Context) {}

    /// The connection is gone — either the server announced it
    /// (`text/disconnect-notice`) or the socket failed. Terminal per
    /// connection.
    async fn handle_disconnect_notice(&self, _remote_addr: &str, _ctx: Context) {}
}

/// Listener that ignores everything; useful for command-only clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

#[async_trait]
impl ChannelEventListener for NoopListener {}
