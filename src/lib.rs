//! FreeSWITCH Event Socket Library (ESL) client runtime
//!
//! This crate drives a FreeSWITCH switch over its Event Socket protocol, in
//! both directions:
//!
//! - **Outbound mode** — FreeSWITCH dials *your* process once per call leg
//!   (`<action application="socket" data="127.0.0.1:8040 async full"/>`);
//!   an [`OutboundServer`] accepts the session, performs the `connect`
//!   handshake, and hands the channel data to your
//!   [`ChannelEventListener::on_connect`].
//! - **Inbound mode** — an [`EslClient`] dials one or more servers,
//!   authenticates, subscribes to events, and keeps each session alive with
//!   exponential-backoff reconnects.
//!
//! # Architecture
//!
//! Each connection runs a background reader task that frames the byte
//! stream into protocol messages. Replies correlate to commands through a
//! per-connection FIFO (ESL replies arrive in command order on one socket);
//! `bgapi` completions correlate through a `Job-UUID` registry. Events are
//! delivered in wire arrival order through a single dispatcher task per
//! connection, while slow connect callbacks run on a shared bounded pool.
//!
//! # Inbound example
//!
//! ```rust,no_run
//! use freeswitch_esl_client::{EslClient, NoopListener, ServerOption};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), freeswitch_esl_client::EslError> {
//!     let client = EslClient::new(Arc::new(NoopListener));
//!     client.add_server(ServerOption::new("127.0.0.1", 8021, "ClueCon"));
//!
//!     let status = client
//!         .send_sync_api_command("127.0.0.1:8021", "status", "", None)
//!         .await?;
//!     println!("{status}");
//!
//!     let job = client
//!         .send_background_api_command("127.0.0.1:8021", "originate", "user/1000 &park")
//!         .await?;
//!     println!("originate finished: {:?}", job.body());
//!     Ok(())
//! }
//! ```
//!
//! # Outbound example
//!
//! ```rust,no_run
//! use freeswitch_esl_client::{ChannelEventListener, Context, EslEvent, OutboundServer};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Dialplan;
//!
//! #[async_trait]
//! impl ChannelEventListener for Dialplan {
//!     async fn on_connect(&self, ctx: Context, channel_data: EslEvent) {
//!         let caller = channel_data.header("Caller-Caller-ID-Number");
//!         println!("call from {:?}", caller);
//!         let _ = ctx.execute("answer", None).await;
//!         let _ = ctx.execute("playback", Some("ivr/ivr-welcome.wav")).await;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), freeswitch_esl_client::EslError> {
//!     let server = OutboundServer::bind("0.0.0.0:8040", Arc::new(Dialplan)).await?;
//!     server.start()?;
//!     tokio::signal::ctrl_c().await.ok();
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```

#[macro_use]
mod macros;

pub mod client;
pub mod command;
pub mod connection;
pub mod error;
pub mod event;
pub mod headers;
pub mod listener;
pub mod message;
pub mod options;
pub mod outbound;

pub(crate) mod buffer;
pub mod constants;
pub(crate) mod correlate;

pub use client::EslClient;
pub use command::{EslCommand, EslResponse, ReplyStatus, SendMsg};
pub use connection::{
    BackgroundJob, ConnState, ConnectionSettings, DisconnectReason, EslConnection,
};
pub use constants::DEFAULT_ESL_PORT;
pub use error::{EslError, EslResult};
pub use event::{EslEvent, EslEventType, ParseEventTypeError};
pub use headers::EventHeader;
pub use listener::{ChannelEventListener, Context, NoopListener};
pub use message::{ContentType, EslMessage, EslParser, HeaderMap};
pub use options::{ReconnectPolicy, ServerOption};
pub use outbound::{OutboundServer, OutboundServerOptions};
