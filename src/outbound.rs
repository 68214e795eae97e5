//! Outbound mode: accept per-call-leg sessions dialed by FreeSWITCH
//!
//! FreeSWITCH connects once per call leg (`<action application="socket" …/>`).
//! For each accepted socket the server sends `connect`, promotes the reply
//! into the initial channel-data event, and hands it to the listener's
//! `on_connect` on the shared bounded pool. Events then flow through the
//! listener's ordered `handle_esl_event` per session.

use crate::{
    connection::{dispatch_on_connect, ConnectionSettings, EslConnection},
    constants::CONNECT_POOL_SIZE,
    error::{EslError, EslResult},
    listener::ChannelEventListener,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Options for an [`OutboundServer`].
#[derive(Debug, Clone)]
pub struct OutboundServerOptions {
    /// Per-session connection parameters.
    pub settings: ConnectionSettings,
    /// Bound on concurrent `on_connect` callbacks across sessions.
    pub connect_pool_size: usize,
}

impl Default for OutboundServerOptions {
    fn default() -> Self {
        Self {
            settings: ConnectionSettings::default(),
            connect_pool_size: CONNECT_POOL_SIZE,
        }
    }
}

/// TCP acceptor for outbound ESL sessions.
pub struct OutboundServer {
    bind_address: SocketAddr,
    listener: Arc<dyn ChannelEventListener>,
    settings: ConnectionSettings,
    connect_pool: Arc<Semaphore>,
    tcp: Mutex<Option<TcpListener>>,
    running: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    sessions: Arc<Mutex<Vec<EslConnection>>>,
}

impl OutboundServer {
    /// Bind the acceptor. Call [`start`](Self::start) to begin accepting.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        listener: Arc<dyn ChannelEventListener>,
    ) -> EslResult<Self> {
        Self::bind_with_options(addr, listener, OutboundServerOptions::default()).await
    }

    /// Bind with explicit options.
    pub async fn bind_with_options(
        addr: impl ToSocketAddrs,
        listener: Arc<dyn ChannelEventListener>,
        options: OutboundServerOptions,
    ) -> EslResult<Self> {
        let tcp = TcpListener::bind(addr).await.map_err(EslError::Io)?;
        let bind_address = tcp.local_addr().map_err(EslError::Io)?;
        info!(bind_address = %bind_address, "outbound acceptor bound");

        Ok(Self {
            bind_address,
            listener,
            settings: options.settings,
            connect_pool: Arc::new(Semaphore::new(options.connect_pool_size.max(1))),
            tcp: Mutex::new(Some(tcp)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            accept_task: Mutex::new(None),
            sessions: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Actual bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.bind_address
    }

    /// Start the accept loop.
    pub fn start(&self) -> EslResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EslError::protocol_error("acceptor already running"));
        }
        let tcp = self
            .tcp
            .lock()
            .expect("listener slot poisoned")
            .take()
            .ok_or_else(|| EslError::protocol_error("acceptor already consumed"))?;

        let listener = self.listener.clone();
        let settings = self.settings.clone();
        let connect_pool = self.connect_pool.clone();
        let running = self.running.clone();
        let shutdown_notify = self.shutdown_notify.clone();
        let sessions = self.sessions.clone();

        let handle = tokio::spawn(async move {
            info!("accepting outbound sessions");
            loop {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let accepted = tokio::select! {
                    result = tcp.accept() => result,
                    _ = shutdown_notify.notified() => break,
                };
                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(peer_addr = %peer_addr, "accepted outbound session");
                        let conn = EslConnection::accept_outbound(
                            stream,
                            peer_addr.to_string(),
                            settings.clone(),
                            listener.clone(),
                            connect_pool.clone(),
                        );
                        {
                            let mut sessions = sessions.lock().expect("session list poisoned");
                            sessions.retain(|c| c.is_live());
                            sessions.push(conn.clone());
                        }
                        tokio::spawn(establish_session(conn));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        // Back off on errors to avoid a tight loop
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
            info!("accept loop terminated");
        });
        *self.accept_task.lock().expect("accept task slot poisoned") = Some(handle);
        Ok(())
    }

    /// Number of sessions that are still live.
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .expect("session list poisoned")
            .iter()
            .filter(|c| c.is_live())
            .count()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting and close every live session.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("shutting down outbound acceptor");
        self.shutdown_notify.notify_waiters();

        let task = self.accept_task.lock().expect("accept task slot poisoned").take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
        }

        let sessions: Vec<EslConnection> = {
            let mut sessions = self.sessions.lock().expect("session list poisoned");
            sessions.drain(..).collect()
        };
        for conn in sessions {
            conn.close().await;
        }
    }
}

impl std::fmt::Debug for OutboundServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundServer")
            .field("bind_address", &self.bind_address)
            .field("running", &self.is_running())
            .field("session_count", &self.session_count())
            .finish()
    }
}

/// Drive the `connect` handshake for one accepted session and deliver the
/// promoted channel data.
async fn establish_session(conn: EslConnection) {
    match conn.connect_session().await {
        Ok(channel_data) => {
            debug!(
                remote_addr = %conn.remote_addr(),
                channel = channel_data.channel_name().as_deref().unwrap_or("?"),
                "outbound session established"
            );
            dispatch_on_connect(&conn, channel_data);
        }
        Err(e) => {
            warn!(remote_addr = %conn.remote_addr(), error = %e, "connect handshake failed");
            conn.close().await;
        }
    }
}
