//! Outbound-mode integration tests: the mock plays FreeSWITCH dialing in

mod mock_server;

use async_trait::async_trait;
use freeswitch_esl_client::{
    ChannelEventListener, Context, EslEvent, OutboundServer,
};
use mock_server::{ListenerCall, MockClient, RecordingListener};
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// Reply to `connect` the way switch_event_serialize() does: channel data as
/// percent-encoded headers on a command/reply.
async fn reply_channel_data(mock: &mut MockClient, channel_name: &str, unique_id: &str) {
    let headers = [
        ("Content-Type", "command/reply"),
        ("Reply-Text", "+OK"),
        ("Socket-Mode", "async"),
        ("Control", "full"),
        ("Event-Name", "CHANNEL_DATA"),
        ("Channel-Name", channel_name),
        ("Unique-ID", unique_id),
        ("Caller-Caller-ID-Number", "5551234"),
    ];
    let mut data = String::new();
    for (key, value) in headers {
        data.push_str(&format!(
            "{}: {}\n",
            key,
            percent_encode(value.as_bytes(), NON_ALPHANUMERIC)
        ));
    }
    data.push('\n');
    mock.send_raw(&data).await;
}

#[tokio::test]
async fn connect_reply_is_promoted_and_delivered_to_on_connect() {
    let (listener, mut calls) = RecordingListener::new();
    let server = OutboundServer::bind("127.0.0.1:0", listener).await.unwrap();
    server.start().unwrap();

    let mut mock = MockClient::connect(server.local_addr()).await;
    assert_eq!(mock.read_command().await, "connect\n\n");
    reply_channel_data(&mut mock, "sofia/internal/1000@example.com", "abcd-1234").await;

    let call = timeout(Duration::from_secs(2), calls.recv()).await.unwrap();
    assert_eq!(
        call,
        Some(ListenerCall::Connect {
            promoted: true,
            channel_name: Some("sofia/internal/1000@example.com".to_string()),
        })
    );

    server.shutdown().await;
}

#[tokio::test]
async fn session_events_arrive_in_wire_order_then_disconnect() {
    let (listener, mut calls) = RecordingListener::new();
    let server = OutboundServer::bind("127.0.0.1:0", listener).await.unwrap();
    server.start().unwrap();

    let mut mock = MockClient::connect(server.local_addr()).await;
    assert_eq!(mock.read_command().await, "connect\n\n");
    reply_channel_data(&mut mock, "sofia/internal/1001@example.com", "leg-1").await;

    let connect = timeout(Duration::from_secs(2), calls.recv()).await.unwrap();
    assert!(matches!(connect, Some(ListenerCall::Connect { .. })));

    mock.send_event_plain("CHANNEL_ANSWER", &[("Unique-ID", "leg-1")])
        .await;
    mock.send_event_plain("DTMF", &[("Unique-ID", "leg-1"), ("DTMF-Digit", "5")])
        .await;
    mock.send_event_plain("CHANNEL_HANGUP", &[("Unique-ID", "leg-1")])
        .await;

    let mut names = Vec::new();
    for _ in 0..3 {
        match timeout(Duration::from_secs(2), calls.recv()).await.unwrap() {
            Some(ListenerCall::Event { name, .. }) => names.push(name),
            other => panic!("unexpected listener call: {other:?}"),
        }
    }
    assert_eq!(names, ["CHANNEL_ANSWER", "DTMF", "CHANNEL_HANGUP"]);

    // Hangup done: FreeSWITCH drops the socket
    mock.drop_connection().await;
    let disconnect = timeout(Duration::from_secs(2), calls.recv()).await.unwrap();
    assert!(matches!(disconnect, Some(ListenerCall::Disconnect { .. })));

    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_legs_each_get_on_connect() {
    let (listener, mut calls) = RecordingListener::new();
    let server = OutboundServer::bind("127.0.0.1:0", listener).await.unwrap();
    server.start().unwrap();

    let mut leg_a = MockClient::connect(server.local_addr()).await;
    let mut leg_b = MockClient::connect(server.local_addr()).await;

    assert_eq!(leg_a.read_command().await, "connect\n\n");
    assert_eq!(leg_b.read_command().await, "connect\n\n");
    reply_channel_data(&mut leg_a, "sofia/internal/2000@example.com", "leg-a").await;
    reply_channel_data(&mut leg_b, "sofia/internal/2001@example.com", "leg-b").await;

    let mut channels = Vec::new();
    for _ in 0..2 {
        match timeout(Duration::from_secs(2), calls.recv()).await.unwrap() {
            Some(ListenerCall::Connect { channel_name, .. }) => {
                channels.push(channel_name.unwrap())
            }
            other => panic!("unexpected listener call: {other:?}"),
        }
    }
    channels.sort();
    assert_eq!(
        channels,
        [
            "sofia/internal/2000@example.com",
            "sofia/internal/2001@example.com"
        ]
    );
    assert_eq!(server.session_count(), 2);

    server.shutdown().await;
}

/// A listener that drives the dialplan from `on_connect`, exercising the
/// command path from callback context.
struct AnswerListener;

#[async_trait]
impl ChannelEventListener for AnswerListener {
    async fn on_connect(&self, ctx: Context, _channel_data: EslEvent) {
        ctx.execute("answer", None).await.unwrap();
        ctx.execute("playback", Some("ivr/ivr-welcome.wav"))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn on_connect_can_drive_the_dialplan() {
    let server = OutboundServer::bind("127.0.0.1:0", Arc::new(AnswerListener))
        .await
        .unwrap();
    server.start().unwrap();

    let mut mock = MockClient::connect(server.local_addr()).await;
    assert_eq!(mock.read_command().await, "connect\n\n");
    reply_channel_data(&mut mock, "sofia/internal/1000@example.com", "leg-1").await;

    let answer = mock.read_command().await;
    assert!(answer.starts_with("sendmsg\n"));
    assert!(answer.contains("call-command: execute\n"));
    assert!(answer.contains("execute-app-name: answer\n"));
    mock.reply_ok().await;

    let playback = mock.read_command().await;
    assert!(playback.contains("execute-app-name: playback\n"));
    assert!(playback.contains("execute-app-arg: ivr/ivr-welcome.wav\n"));
    mock.reply_ok().await;

    server.shutdown().await;
}

#[tokio::test]
async fn linger_disposition_keeps_session_open() {
    let (listener, mut calls) = RecordingListener::new();
    let server = OutboundServer::bind("127.0.0.1:0", listener).await.unwrap();
    server.start().unwrap();

    let mut mock = MockClient::connect(server.local_addr()).await;
    assert_eq!(mock.read_command().await, "connect\n\n");
    reply_channel_data(&mut mock, "sofia/internal/1000@example.com", "leg-1").await;
    let connect = timeout(Duration::from_secs(2), calls.recv()).await.unwrap();
    assert!(matches!(connect, Some(ListenerCall::Connect { .. })));

    // Linger notice: socket stays open and events keep flowing
    mock.send_raw("Content-Type: text/disconnect-notice\nContent-Disposition: linger\n\n")
        .await;
    mock.send_event_plain("CHANNEL_HANGUP", &[("Unique-ID", "leg-1")])
        .await;

    let event = timeout(Duration::from_secs(2), calls.recv()).await.unwrap();
    assert_eq!(
        event,
        Some(ListenerCall::Event {
            name: "CHANNEL_HANGUP".to_string(),
            job_uuid: None,
        })
    );
    assert_eq!(server.session_count(), 1);

    server.shutdown().await;
    sleep(Duration::from_millis(50)).await;
    let disconnect = timeout(Duration::from_secs(2), calls.recv()).await.unwrap();
    assert!(matches!(disconnect, Some(ListenerCall::Disconnect { .. })));
}
