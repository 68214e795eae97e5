//! Mock FreeSWITCH ESL server and a recording listener for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use freeswitch_esl_client::{ChannelEventListener, Context, EslEvent};
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub struct MockEslServer {
    listener: TcpListener,
    password: String,
}

pub struct MockClient {
    stream: TcpStream,
}

impl MockEslServer {
    pub async fn start(password: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self {
            listener,
            password: password.to_string(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// `host:port` string as the client facade sees it.
    pub fn client_addr(&self) -> String {
        format!("127.0.0.1:{}", self.port())
    }

    /// Accept a connection without any handshake.
    pub async fn accept_raw(&self) -> MockClient {
        let (stream, _addr) = self.listener.accept().await.unwrap();
        MockClient { stream }
    }

    /// Accept a connection and perform the auth handshake.
    pub async fn accept(&self) -> MockClient {
        let mut client = self.accept_raw().await;

        client.send_raw("Content-Type: auth/request\n\n").await;

        let cmd = client.read_command().await;
        let expected = format!("auth {}\n\n", self.password);
        if cmd == expected {
            client.reply_ok().await;
        } else {
            client.reply_err("invalid password").await;
        }

        client
    }

    /// Accept, authenticate, and consume the `event <expr>` subscription.
    pub async fn accept_with_subscription(&self) -> (MockClient, String) {
        let mut client = self.accept().await;
        let cmd = client.read_command().await;
        assert!(
            cmd.starts_with("event "),
            "expected event subscription, got {cmd:?}"
        );
        client.reply_ok().await;
        (client, cmd)
    }
}

impl MockClient {
    /// Dial a peer, playing the FreeSWITCH side of an outbound session.
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
        }
    }

    pub async fn send_raw(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).await.unwrap();
    }

    /// Send a `text/event-plain` event with the two-part wire format and
    /// percent-encoded values.
    pub async fn send_event_plain(&mut self, event_name: &str, headers: &[(&str, &str)]) {
        let mut body = format!(
            "Event-Name: {}\n",
            percent_encode(event_name.as_bytes(), NON_ALPHANUMERIC)
        );
        for (key, value) in headers {
            body.push_str(&format!(
                "{}: {}\n",
                key,
                percent_encode(value.as_bytes(), NON_ALPHANUMERIC)
            ));
        }
        body.push('\n');

        let envelope = format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n",
            body.len()
        );
        self.send_raw(&format!("{}{}", envelope, body)).await;
    }

    /// Send a `BACKGROUND_JOB` completion event with a result body.
    pub async fn send_background_job(&mut self, job_uuid: &str, result: &str) {
        let body = format!(
            "Event-Name: BACKGROUND%5FJOB\nJob-UUID: {}\nContent-Length: {}\n\n{}",
            job_uuid,
            result.len(),
            result
        );
        let envelope = format!(
            "Content-Length: {}\nContent-Type: text/event-plain\n\n",
            body.len()
        );
        self.send_raw(&format!("{}{}", envelope, body)).await;
    }

    /// Send a disconnect notice.
    pub async fn send_disconnect_notice(&mut self, message: &str) {
        let data = format!(
            "Content-Type: text/disconnect-notice\nContent-Disposition: disconnect\nContent-Length: {}\n\n{}",
            message.len(),
            message
        );
        self.send_raw(&data).await;
    }

    /// Read one command from the client (until `\n\n`).
    pub async fn read_command(&mut self) -> String {
        let mut reader = BufReader::new(&mut self.stream);
        let mut result = String::new();

        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.unwrap();
            if n == 0 {
                break;
            }
            result.push_str(&line);
            if result.ends_with("\n\n") {
                break;
            }
        }

        result
    }

    /// Send a `+OK` command reply.
    pub async fn reply_ok(&mut self) {
        self.send_raw("Content-Type: command/reply\nReply-Text: +OK accepted\n\n")
            .await;
    }

    /// Send a `+OK` reply carrying a `Job-UUID` (bgapi acknowledgment).
    pub async fn reply_ok_with_job(&mut self, job_uuid: &str) {
        let msg = format!(
            "Content-Type: command/reply\nReply-Text: +OK Job-UUID: {uuid}\nJob-UUID: {uuid}\n\n",
            uuid = job_uuid
        );
        self.send_raw(&msg).await;
    }

    /// Send an `api/response` with the given body.
    pub async fn reply_api(&mut self, body: &str) {
        let data = format!(
            "Content-Type: api/response\nContent-Length: {}\n\n{}",
            body.len(),
            body
        );
        self.send_raw(&data).await;
    }

    /// Send a `-ERR` command reply.
    pub async fn reply_err(&mut self, text: &str) {
        let msg = format!("Content-Type: command/reply\nReply-Text: -ERR {}\n\n", text);
        self.send_raw(&msg).await;
    }

    /// Drop the TCP connection.
    pub async fn drop_connection(self) {
        drop(self.stream);
    }
}

/// What the listener observed, in callback order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerCall {
    Connect {
        promoted: bool,
        channel_name: Option<String>,
    },
    Event {
        name: String,
        job_uuid: Option<String>,
    },
    AuthRequest,
    Disconnect {
        remote_addr: String,
    },
}

/// Listener that records every callback into an unbounded channel.
pub struct RecordingListener {
    tx: mpsc::UnboundedSender<ListenerCall>,
}

impl RecordingListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ListenerCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl ChannelEventListener for RecordingListener {
    async fn on_connect(&self, _ctx: Context, channel_data: EslEvent) {
        let _ = self.tx.send(ListenerCall::Connect {
            promoted: channel_data.is_promoted_reply(),
            channel_name: channel_data.channel_name().map(|c| c.into_owned()),
        });
    }

    async fn handle_esl_event(&self, _ctx: Context, event: EslEvent) {
        let _ = self.tx.send(ListenerCall::Event {
            name: event.name().unwrap_or("").to_string(),
            job_uuid: event.job_uuid().map(|u| u.into_owned()),
        });
    }

    async fn handle_auth_request(&self, _ctx: Context) {
        let _ = self.tx.send(ListenerCall::AuthRequest);
    }

    async fn handle_disconnect_notice(&self, remote_addr: &str, _ctx: Context) {
        let _ = self.tx.send(ListenerCall::Disconnect {
            remote_addr: remote_addr.to_string(),
        });
    }
}
