//! Command serialization and reply classification

use crate::{
    constants::{HEADER_REPLY_TEXT, LINE_TERMINATOR, MESSAGE_TERMINATOR},
    error::{EslError, EslResult},
    headers::EventHeader,
    message::{EslMessage, HeaderMap},
};
use std::borrow::Cow;
use std::fmt;

/// Validate that a user-provided string contains no newline characters.
///
/// ESL commands are line-delimited; embedded newlines would allow injection
/// of arbitrary protocol commands.
fn validate_no_newlines(s: &str, context: &str) -> EslResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(EslError::protocol_error(format!(
            "{} must not contain newlines",
            context
        )));
    }
    Ok(())
}

/// Reply-Text classification per the ESL wire protocol.
///
/// FreeSWITCH commands return `+OK …` on success and `-ERR …` on failure.
/// A handful of commands (`getvar`) return the raw value with no prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplyStatus {
    /// Reply-Text starts with `+OK` or is absent/empty.
    Ok,
    /// Reply-Text starts with `-ERR`.
    Err,
    /// Reply-Text present but matches neither marker (normal for `getvar`).
    Other,
}

/// Response to a synchronous command (`command/reply` or `api/response`).
#[derive(Debug, Clone)]
pub struct EslResponse {
    headers: HeaderMap,
    body: Option<String>,
    status: ReplyStatus,
}

impl EslResponse {
    /// `ReplyStatus` is derived from the decoded `Reply-Text` header.
    pub fn new(headers: HeaderMap, body: Option<String>) -> Self {
        let status = match headers.get(HEADER_REPLY_TEXT).as_deref() {
            None | Some("") => ReplyStatus::Ok,
            Some(t) if t.starts_with("+OK") => ReplyStatus::Ok,
            Some(t) if t.starts_with("-ERR") => ReplyStatus::Err,
            Some(_) => ReplyStatus::Other,
        };
        Self {
            headers,
            body,
            status,
        }
    }

    pub fn from_message(message: EslMessage) -> Self {
        let (_, headers, body) = message.into_parts();
        Self::new(headers, body)
    }

    /// `true` if Reply-Text is `+OK` or absent.
    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    pub fn reply_status(&self) -> ReplyStatus {
        self.status
    }

    /// Response body (the `api/response` payload).
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Body as owned `String`, empty if absent.
    pub fn body_string(&self) -> String {
        self.body.clone().unwrap_or_default()
    }

    /// Decoded response header lookup.
    pub fn header(&self, name: impl AsRef<str>) -> Option<Cow<'_, str>> {
        self.headers.get(name)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Decoded `Reply-Text` header value (e.g. `+OK`, `-ERR invalid command`).
    pub fn reply_text(&self) -> Option<Cow<'_, str>> {
        self.headers.get(HEADER_REPLY_TEXT)
    }

    /// `Job-UUID` header from `bgapi` replies.
    ///
    /// FreeSWITCH returns the Job-UUID both in Reply-Text
    /// (`+OK Job-UUID: <uuid>`) and as a dedicated header; this reads the
    /// dedicated header.
    pub fn job_uuid(&self) -> Option<Cow<'_, str>> {
        self.headers.get(EventHeader::JobUuid)
    }

    /// Surface a `-ERR …` reply as [`EslError::CommandError`].
    pub fn into_result(self) -> EslResult<Self> {
        match self.status {
            ReplyStatus::Err => {
                let reply_text = self
                    .reply_text()
                    .map(Cow::into_owned)
                    .unwrap_or_else(|| "-ERR".to_string());
                Err(EslError::CommandError { reply_text })
            }
            _ => Ok(self),
        }
    }
}

/// One `sendmsg` unit: the command line plus its dialplan headers, in order.
///
/// Serialized as each line followed by `\n` and terminated by a blank line.
/// Units can be batched; see [`serialize_sendmsg_batch`].
#[derive(Debug, Clone)]
pub struct SendMsg {
    lines: Vec<String>,
}

impl SendMsg {
    /// A `sendmsg` addressed to the channel attached to the socket
    /// (outbound mode).
    pub fn new() -> Self {
        Self {
            lines: vec!["sendmsg".to_string()],
        }
    }

    /// A `sendmsg <uuid>` addressed to a specific channel (inbound mode).
    pub fn with_uuid(uuid: &str) -> EslResult<Self> {
        validate_no_newlines(uuid, "sendmsg uuid")?;
        Ok(Self {
            lines: vec![format!("sendmsg {}", uuid)],
        })
    }

    /// Shortcut for the common execute unit:
    /// `call-command: execute` + app name + optional argument.
    pub fn execute(app: &str, arg: Option<&str>, uuid: Option<&str>) -> EslResult<Self> {
        let mut msg = match uuid {
            Some(u) => Self::with_uuid(u)?,
            None => Self::new(),
        };
        msg = msg.call_command("execute")?.execute_app_name(app)?;
        if let Some(arg) = arg {
            msg = msg.execute_app_arg(arg)?;
        }
        Ok(msg)
    }

    /// Append a `name: value` dialplan line.
    pub fn line(mut self, name: &str, value: &str) -> EslResult<Self> {
        validate_no_newlines(name, "sendmsg header name")?;
        validate_no_newlines(value, "sendmsg header value")?;
        self.lines.push(format!("{}: {}", name, value));
        Ok(self)
    }

    /// `call-command` line (`execute`, `hangup`, `unicast`, …).
    pub fn call_command(self, command: &str) -> EslResult<Self> {
        self.line("call-command", command)
    }

    /// `execute-app-name` line.
    pub fn execute_app_name(self, app: &str) -> EslResult<Self> {
        self.line("execute-app-name", app)
    }

    /// `execute-app-arg` line.
    pub fn execute_app_arg(self, arg: &str) -> EslResult<Self> {
        self.line("execute-app-arg", arg)
    }

    /// `loops` line: how many times to repeat the application.
    pub fn loops(self, count: u32) -> EslResult<Self> {
        self.line("loops", &count.to_string())
    }

    /// `event-lock: true` line: serialize this command with channel events.
    pub fn event_lock(self) -> EslResult<Self> {
        self.line("event-lock", "true")
    }

    /// `hangup-cause` line for `call-command: hangup` units.
    pub fn hangup_cause(self, cause: &str) -> EslResult<Self> {
        self.line("hangup-cause", cause)
    }

    /// The accumulated wire lines, command line first.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl Default for SendMsg {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize a single-line command: `command\n\n`.
pub(crate) fn serialize_single_line(command: &str) -> String {
    let mut result = String::with_capacity(command.len() + 2);
    result.push_str(command);
    result.push_str(MESSAGE_TERMINATOR);
    result
}

/// Serialize a multi-line command: each line + `\n`, final extra `\n`.
pub(crate) fn serialize_multi_line<S: AsRef<str>>(lines: &[S]) -> String {
    let mut result = String::new();
    for line in lines {
        result.push_str(line.as_ref());
        result.push_str(LINE_TERMINATOR);
    }
    result.push_str(LINE_TERMINATOR);
    result
}

/// Serialize a batch of `sendmsg` units: units separated by a blank line,
/// the whole batch ending in `\n\n`.
pub(crate) fn serialize_sendmsg_batch(batch: &[SendMsg]) -> String {
    let mut result = String::new();
    for msg in batch {
        for line in msg.lines() {
            result.push_str(line);
            result.push_str(LINE_TERMINATOR);
        }
        result.push_str(LINE_TERMINATOR);
    }
    result
}

/// Commands the core emits on the wire.
#[derive(Clone)]
pub enum EslCommand {
    /// Authenticate with password (inbound)
    Auth { password: String },
    /// Request channel data (outbound, first command on the socket)
    Connect,
    /// Subscribe to events; the expression is forwarded verbatim
    /// (e.g. `plain ALL`, `plain CHANNEL_ANSWER CHANNEL_HANGUP`)
    Events { expression: String },
    /// Execute API command synchronously
    Api { command: String },
    /// Execute API command in the background, result arrives as a
    /// `BACKGROUND_JOB` event
    BgApi { command: String },
    /// Inject a dialplan action on a channel
    SendMsg { msg: SendMsg },
    /// Execute an application on a channel (sugar over `SendMsg`)
    Execute {
        app: String,
        arg: Option<String>,
        uuid: Option<String>,
    },
    /// Set an event filter
    Filter { header: String, value: String },
    /// Remove event filters
    FilterDelete {
        header: String,
        value: Option<String>,
    },
    /// Subscribe to session events (outbound: no uuid)
    MyEvents {
        format: String,
        uuid: Option<String>,
    },
    /// Unsubscribe from specific events
    NixEvent { events: String },
    /// Unsubscribe from all events
    NoEvents,
    /// Keep socket open after channel hangup
    Linger { timeout: Option<u32> },
    /// Cancel linger mode
    NoLinger,
    /// Resume dialplan execution on socket disconnect
    Resume,
    /// Redirect session events to the socket
    DivertEvents { on: bool },
    /// Read a channel variable (outbound)
    GetVar { name: String },
    /// Enable log forwarding at the given level
    Log { level: String },
    /// Disable log forwarding
    NoLog,
    /// No operation / keepalive
    NoOp,
    /// Close the session gracefully
    Exit,
}

impl fmt::Debug for EslCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EslCommand::Auth { .. } => f
                .debug_struct("Auth")
                .field("password", &"[REDACTED]")
                .finish(),
            other => f.write_str(&other.display_line()),
        }
    }
}

impl EslCommand {
    /// First wire line, for logging. The auth password is redacted.
    pub fn display_line(&self) -> String {
        match self {
            EslCommand::Auth { .. } => "auth [REDACTED]".to_string(),
            other => other
                .to_wire_format()
                .map(|w| w.lines().next().unwrap_or_default().to_string())
                .unwrap_or_else(|_| "<invalid command>".to_string()),
        }
    }

    fn simple(cmd: &str, args: &[&str]) -> String {
        let mut line = String::from(cmd);
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        serialize_single_line(&line)
    }

    /// Validate all user-supplied fields, then convert to wire format.
    pub fn to_wire_format(&self) -> EslResult<String> {
        match self {
            EslCommand::Auth { password } => {
                validate_no_newlines(password, "password")?;
                Ok(Self::simple("auth", &[password]))
            }
            EslCommand::Connect => Ok(Self::simple("connect", &[])),
            EslCommand::Events { expression } => {
                validate_no_newlines(expression, "event subscription")?;
                Ok(Self::simple("event", &[expression]))
            }
            EslCommand::Api { command } => {
                validate_no_newlines(command, "api command")?;
                Ok(Self::simple("api", &[command]))
            }
            EslCommand::BgApi { command } => {
                validate_no_newlines(command, "bgapi command")?;
                Ok(Self::simple("bgapi", &[command]))
            }
            EslCommand::SendMsg { msg } => Ok(serialize_multi_line(msg.lines())),
            EslCommand::Execute { app, arg, uuid } => {
                let msg = SendMsg::execute(app, arg.as_deref(), uuid.as_deref())?;
                Ok(serialize_multi_line(msg.lines()))
            }
            EslCommand::Filter { header, value } => {
                validate_no_newlines(header, "filter header")?;
                validate_no_newlines(value, "filter value")?;
                Ok(Self::simple("filter", &[header, value]))
            }
            EslCommand::FilterDelete { header, value } => {
                validate_no_newlines(header, "filter delete header")?;
                if let Some(v) = value {
                    validate_no_newlines(v, "filter delete value")?;
                }
                Ok(match value {
                    Some(v) => Self::simple("filter", &["delete", header, v]),
                    None => Self::simple("filter", &["delete", header]),
                })
            }
            EslCommand::MyEvents { format, uuid } => {
                validate_no_newlines(format, "myevents format")?;
                if let Some(u) = uuid {
                    validate_no_newlines(u, "myevents uuid")?;
                }
                Ok(match uuid {
                    Some(u) => Self::simple("myevents", &[u, format]),
                    None => Self::simple("myevents", &[format]),
                })
            }
            EslCommand::NixEvent { events } => {
                validate_no_newlines(events, "nixevent list")?;
                Ok(Self::simple("nixevent", &[events]))
            }
            EslCommand::NoEvents => Ok(Self::simple("noevents", &[])),
            EslCommand::Linger { timeout } => Ok(match timeout {
                Some(n) => Self::simple("linger", &[&n.to_string()]),
                None => Self::simple("linger", &[]),
            }),
            EslCommand::NoLinger => Ok(Self::simple("nolinger", &[])),
            EslCommand::Resume => Ok(Self::simple("resume", &[])),
            EslCommand::DivertEvents { on } => {
                Ok(Self::simple("divert_events", &[if *on { "on" } else { "off" }]))
            }
            EslCommand::GetVar { name } => {
                validate_no_newlines(name, "getvar name")?;
                Ok(Self::simple("getvar", &[name]))
            }
            EslCommand::Log { level } => {
                validate_no_newlines(level, "log level")?;
                Ok(Self::simple("log", &[level]))
            }
            EslCommand::NoLog => Ok(Self::simple("nolog", &[])),
            EslCommand::NoOp => Ok(Self::simple("noop", &[])),
            EslCommand::Exit => Ok(Self::simple("exit", &[])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_commands() {
        let auth = EslCommand::Auth {
            password: "ClueCon".to_string(),
        };
        assert_eq!(auth.to_wire_format().unwrap(), "auth ClueCon\n\n");

        let api = EslCommand::Api {
            command: "status".to_string(),
        };
        assert_eq!(api.to_wire_format().unwrap(), "api status\n\n");

        let bgapi = EslCommand::BgApi {
            command: "originate sofia/gw/x 1000".to_string(),
        };
        assert_eq!(
            bgapi.to_wire_format().unwrap(),
            "bgapi originate sofia/gw/x 1000\n\n"
        );

        assert_eq!(EslCommand::Connect.to_wire_format().unwrap(), "connect\n\n");
        assert_eq!(EslCommand::Exit.to_wire_format().unwrap(), "exit\n\n");
    }

    #[test]
    fn event_subscription_forwarded_verbatim() {
        let events = EslCommand::Events {
            expression: "plain CHANNEL_HANGUP CHANNEL_ANSWER".to_string(),
        };
        assert_eq!(
            events.to_wire_format().unwrap(),
            "event plain CHANNEL_HANGUP CHANNEL_ANSWER\n\n"
        );
    }

    #[test]
    fn sendmsg_unit_wire_format() {
        let msg = SendMsg::execute("playback", Some("ivr/ivr-welcome.wav"), None).unwrap();
        let cmd = EslCommand::SendMsg { msg };
        let wire = cmd.to_wire_format().unwrap();

        assert_eq!(
            wire,
            "sendmsg\ncall-command: execute\nexecute-app-name: playback\nexecute-app-arg: ivr/ivr-welcome.wav\n\n"
        );
    }

    #[test]
    fn sendmsg_with_uuid() {
        let msg = SendMsg::execute("answer", None, Some("abcd-1234")).unwrap();
        let wire = serialize_multi_line(msg.lines());
        assert!(wire.starts_with("sendmsg abcd-1234\n"));
        assert!(wire.ends_with("\n\n"));
    }

    #[test]
    fn sendmsg_batch_separated_by_blank_lines() {
        let first = SendMsg::execute("answer", None, None).unwrap();
        let second = SendMsg::execute("playback", Some("a.wav"), None)
            .unwrap()
            .event_lock()
            .unwrap();
        let wire = serialize_sendmsg_batch(&[first, second]);

        assert_eq!(
            wire,
            "sendmsg\ncall-command: execute\nexecute-app-name: answer\n\n\
             sendmsg\ncall-command: execute\nexecute-app-name: playback\nexecute-app-arg: a.wav\nevent-lock: true\n\n"
        );
    }

    #[test]
    fn execute_command_builds_sendmsg() {
        let cmd = EslCommand::Execute {
            app: "hangup".to_string(),
            arg: Some("NORMAL_CLEARING".to_string()),
            uuid: None,
        };
        let wire = cmd.to_wire_format().unwrap();
        assert!(wire.contains("execute-app-name: hangup"));
        assert!(wire.contains("execute-app-arg: NORMAL_CLEARING"));
    }

    #[test]
    fn newline_injection_rejected() {
        let api = EslCommand::Api {
            command: "status\n\nevent plain ALL".to_string(),
        };
        assert!(api.to_wire_format().is_err());

        let auth = EslCommand::Auth {
            password: "pw\napi status".to_string(),
        };
        assert!(auth.to_wire_format().is_err());

        assert!(SendMsg::execute("playback", Some("x\n\nexit"), None).is_err());
        assert!(SendMsg::with_uuid("u\r\n").is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let auth = EslCommand::Auth {
            password: "secret".to_string(),
        };
        let debug_str = format!("{:?}", auth);
        assert!(!debug_str.contains("secret"));
        assert!(debug_str.contains("REDACTED"));
        assert_eq!(auth.display_line(), "auth [REDACTED]");
    }

    #[test]
    fn reply_status_classification() {
        let ok: HeaderMap = [("Reply-Text", "+OK accepted")].into_iter().collect();
        let resp = EslResponse::new(ok, None);
        assert_eq!(resp.reply_status(), ReplyStatus::Ok);
        assert!(resp.is_success());
        assert!(resp.into_result().is_ok());

        let err: HeaderMap = [("Reply-Text", "-ERR invalid command")].into_iter().collect();
        let resp = EslResponse::new(err, None);
        assert_eq!(resp.reply_status(), ReplyStatus::Err);
        assert!(!resp.is_success());
        let e = resp.into_result().unwrap_err();
        assert!(
            matches!(e, EslError::CommandError { ref reply_text } if reply_text == "-ERR invalid command")
        );

        // getvar quirk: bare value is neither +OK nor -ERR and not a failure
        let other: HeaderMap = [("Reply-Text", "sip_from_user")].into_iter().collect();
        let resp = EslResponse::new(other, None);
        assert_eq!(resp.reply_status(), ReplyStatus::Other);
        assert!(resp.into_result().is_ok());
    }

    #[test]
    fn reply_status_absent_or_empty_is_ok() {
        let resp = EslResponse::new(HeaderMap::new(), None);
        assert_eq!(resp.reply_status(), ReplyStatus::Ok);

        let empty: HeaderMap = [("Reply-Text", "")].into_iter().collect();
        let resp = EslResponse::new(empty, None);
        assert_eq!(resp.reply_status(), ReplyStatus::Ok);
    }

    #[test]
    fn reply_text_percent_decoded_before_classification() {
        let encoded: HeaderMap = [("Reply-Text", "%2BOK%20accepted")].into_iter().collect();
        let resp = EslResponse::new(encoded, None);
        assert_eq!(resp.reply_status(), ReplyStatus::Ok);
        assert_eq!(resp.reply_text().as_deref(), Some("+OK accepted"));
    }

    #[test]
    fn job_uuid_from_bgapi_reply() {
        let headers: HeaderMap = [
            ("Reply-Text", "+OK Job-UUID: 1111"),
            ("Job-UUID", "1111"),
        ]
        .into_iter()
        .collect();
        let resp = EslResponse::new(headers, None);
        assert_eq!(resp.job_uuid().as_deref(), Some("1111"));
    }
}
