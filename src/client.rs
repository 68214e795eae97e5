//! Client facade: a pool of inbound connections keyed by remote server

use crate::{
    command::SendMsg,
    connection::{BackgroundJob, EslConnection},
    constants::CONNECT_POOL_SIZE,
    error::{EslError, EslResult},
    event::EslEvent,
    listener::ChannelEventListener,
    options::ServerOption,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ServerEntry {
    option: ServerOption,
    option_tx: watch::Sender<ServerOption>,
    conn_rx: watch::Receiver<Option<EslConnection>>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

struct ClientInner {
    listener: Arc<dyn ChannelEventListener>,
    connect_pool: Arc<Semaphore>,
    servers: Mutex<HashMap<String, ServerEntry>>,
}

/// Pool of ESL sessions, one per configured server, with automatic
/// reconnect.
///
/// Each added server gets a supervisor task that dials, authenticates,
/// subscribes, and re-establishes the session with exponential backoff when
/// it drops. Commands are addressed by the server's `host:port`.
///
/// Pending replies fail the moment a connection drops; pending background
/// jobs fail as well, because FreeSWITCH forgets the job with the session.
#[derive(Clone)]
pub struct EslClient {
    inner: Arc<ClientInner>,
}

impl EslClient {
    /// Create a client delivering callbacks to `listener`.
    pub fn new(listener: Arc<dyn ChannelEventListener>) -> Self {
        Self::with_connect_pool_size(listener, CONNECT_POOL_SIZE)
    }

    /// Create a client with a custom bound on concurrent slow callbacks.
    pub fn with_connect_pool_size(
        listener: Arc<dyn ChannelEventListener>,
        pool_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                listener,
                connect_pool: Arc::new(Semaphore::new(pool_size.max(1))),
                servers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Add a server, or replace the option record of an existing one.
    ///
    /// Idempotent. Replacing an entry keeps the live session unless
    /// credentials changed, in which case the session is torn down and the
    /// supervisor reconnects with the new option.
    pub fn add_server(&self, option: ServerOption) {
        let addr = option.addr();
        let mut servers = self.inner.servers.lock().expect("server map poisoned");

        if let Some(entry) = servers.get_mut(&addr) {
            let needs_reconnect = option.auth_changed(&entry.option);
            entry.option = option.clone();
            let _ = entry.option_tx.send(option);
            if needs_reconnect {
                debug!(addr = %addr, "credentials changed, recycling session");
                if let Some(conn) = entry.conn_rx.borrow().clone() {
                    tokio::spawn(async move { conn.close().await });
                }
            }
            return;
        }

        info!(addr = %addr, "adding server");
        let (option_tx, option_rx) = watch::channel(option.clone());
        let (conn_tx, conn_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(
            option_rx,
            conn_tx,
            shutdown_rx,
            self.inner.listener.clone(),
            self.inner.connect_pool.clone(),
        ));
        servers.insert(
            addr,
            ServerEntry {
                option,
                option_tx,
                conn_rx,
                shutdown_tx,
                supervisor,
            },
        );
    }

    /// Remove a server and close its session. Idempotent.
    pub async fn remove_server(&self, host: &str, port: u16) {
        self.close(&format!("{}:{}", host, port)).await;
    }

    /// Snapshot of the configured options, stable under concurrent mutation.
    pub fn server_options(&self) -> Vec<ServerOption> {
        self.inner
            .servers
            .lock()
            .expect("server map poisoned")
            .values()
            .map(|entry| entry.option.clone())
            .collect()
    }

    /// The live connection for `addr`, if the session is up.
    pub fn connection(&self, addr: &str) -> EslResult<EslConnection> {
        let servers = self.inner.servers.lock().expect("server map poisoned");
        let entry = servers.get(addr).ok_or(EslError::NotConnected)?;
        let conn = entry.conn_rx.borrow().clone();
        conn.ok_or(EslError::NotConnected)
    }

    /// Run an `api` command and return the response body.
    ///
    /// `deadline` overrides the server's configured command timeout.
    pub async fn send_sync_api_command(
        &self,
        addr: &str,
        api: &str,
        arg: &str,
        deadline: Option<Duration>,
    ) -> EslResult<String> {
        let conn = self.connection(addr)?;
        let command = crate::command::EslCommand::Api {
            command: join_api(api, arg),
        };
        let response = match deadline {
            Some(deadline) => conn.send_command_timeout(&command, deadline).await?,
            None => conn.send_command(&command).await?,
        };
        Ok(response.into_result()?.body_string())
    }

    /// Submit a `bgapi` command; returns its `Job-UUID` after the synchronous
    /// reply. The `BACKGROUND_JOB` completion is delivered to the listener.
    pub async fn send_async_api_command(
        &self,
        addr: &str,
        api: &str,
        arg: &str,
    ) -> EslResult<String> {
        self.connection(addr)?.bgapi_submit(&join_api(api, arg)).await
    }

    /// Submit a `bgapi` command and await the matching `BACKGROUND_JOB`
    /// event. The event is not delivered to the listener.
    pub async fn send_background_api_command(
        &self,
        addr: &str,
        api: &str,
        arg: &str,
    ) -> EslResult<EslEvent> {
        self.background_job(addr, api, arg).await?.wait().await
    }

    /// Like [`send_background_api_command`](Self::send_background_api_command)
    /// but returns the job handle so the caller controls the wait.
    pub async fn background_job(
        &self,
        addr: &str,
        api: &str,
        arg: &str,
    ) -> EslResult<BackgroundJob> {
        self.connection(addr)?.bgapi(&join_api(api, arg)).await
    }

    /// Inject a `sendmsg` unit on a server's session.
    pub async fn send_msg(&self, addr: &str, msg: SendMsg) -> EslResult<()> {
        self.connection(addr)?
            .send_msg(msg)
            .await?
            .into_result()
            .map(|_| ())
    }

    /// Inject a batch of `sendmsg` units in one write, fire-and-forget.
    pub async fn send_msg_batch(&self, addr: &str, batch: &[SendMsg]) -> EslResult<()> {
        self.connection(addr)?.send_msg_batch(batch).await
    }

    /// Close one server's session and stop supervising it.
    pub async fn close(&self, addr: &str) {
        let entry = {
            let mut servers = self.inner.servers.lock().expect("server map poisoned");
            servers.remove(addr)
        };
        let Some(entry) = entry else { return };

        info!(addr = %addr, "closing server");
        let _ = entry.shutdown_tx.send(true);
        let conn = entry.conn_rx.borrow().clone();
        if let Some(conn) = conn {
            conn.close().await;
        }
        let _ = entry.supervisor.await;
    }

    /// Orderly shutdown of every session.
    pub async fn close_all(&self) {
        let addrs: Vec<String> = {
            let servers = self.inner.servers.lock().expect("server map poisoned");
            servers.keys().cloned().collect()
        };
        for addr in addrs {
            self.close(&addr).await;
        }
    }
}

impl std::fmt::Debug for EslClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let servers = self.inner.servers.lock().expect("server map poisoned");
        f.debug_struct("EslClient")
            .field("servers", &servers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn join_api(api: &str, arg: &str) -> String {
    if arg.is_empty() {
        api.to_string()
    } else {
        format!("{} {}", api, arg)
    }
}

/// Keep one server's session alive: connect, hand the connection out through
/// the watch channel, wait for it to die, back off, repeat.
async fn supervise(
    option_rx: watch::Receiver<ServerOption>,
    conn_tx: watch::Sender<Option<EslConnection>>,
    mut shutdown_rx: watch::Receiver<bool>,
    listener: Arc<dyn ChannelEventListener>,
    connect_pool: Arc<Semaphore>,
) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let option = option_rx.borrow().clone();
        let addr = option.addr();

        let connect_result = tokio::select! {
            result = EslConnection::connect_inbound(&option, listener.clone(), connect_pool.clone()) => result,
            _ = watch_shutdown(&mut shutdown_rx) => break,
        };
        match connect_result {
            Ok(conn) => {
                attempt = 0;
                let _ = conn_tx.send(Some(conn.clone()));
                tokio::select! {
                    _ = conn.closed() => {
                        let _ = conn_tx.send(None);
                        warn!(addr = %addr, "session lost");
                    }
                    _ = watch_shutdown(&mut shutdown_rx) => {
                        let _ = conn_tx.send(None);
                        conn.close().await;
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(addr = %addr, error = %e, "connect failed");
            }
        }

        let delay = option.reconnect.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        debug!(addr = %addr, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = watch_shutdown(&mut shutdown_rx) => break,
        }
    }
    debug!("supervisor stopped");
}

async fn watch_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::NoopListener;

    #[test]
    fn join_api_with_and_without_arg() {
        assert_eq!(join_api("status", ""), "status");
        assert_eq!(
            join_api("originate", "sofia/gw/x 1000"),
            "originate sofia/gw/x 1000"
        );
    }

    #[tokio::test]
    async fn unknown_server_is_not_connected() {
        let client = EslClient::new(Arc::new(NoopListener));
        assert!(matches!(
            client.connection("10.9.9.9:8021"),
            Err(EslError::NotConnected)
        ));
        assert!(matches!(
            client
                .send_sync_api_command("10.9.9.9:8021", "status", "", None)
                .await,
            Err(EslError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn server_options_snapshot() {
        let client = EslClient::new(Arc::new(NoopListener));
        client.add_server(ServerOption::new("127.0.0.1", 18021, "ClueCon"));
        client.add_server(ServerOption::new("127.0.0.1", 18022, "ClueCon"));

        let mut addrs: Vec<String> =
            client.server_options().iter().map(|o| o.addr()).collect();
        addrs.sort();
        assert_eq!(addrs, ["127.0.0.1:18021", "127.0.0.1:18022"]);

        client.close_all().await;
        assert!(client.server_options().is_empty());
    }

    #[tokio::test]
    async fn add_server_is_idempotent_and_replaces_option() {
        let client = EslClient::new(Arc::new(NoopListener));
        client.add_server(ServerOption::new("127.0.0.1", 18021, "ClueCon"));
        client.add_server(
            ServerOption::new("127.0.0.1", 18021, "ClueCon")
                .event_subscription("plain CHANNEL_HANGUP"),
        );

        let options = client.server_options();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].event_subscription, "plain CHANNEL_HANGUP");

        client.close_all().await;
    }
}
