//! ESL event types and event promotion from protocol frames

use crate::{
    constants::HEADER_CONTENT_LENGTH,
    error::{EslError, EslResult},
    headers::EventHeader,
    message::{parse_header_block, ContentType, EslMessage, HeaderMap},
};
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// Generates `EslEventType` with `Display`, `FromStr`, and `parse_event_type`.
macro_rules! esl_event_types {
    (
        $(
            $(#[$attr:meta])*
            $variant:ident => $wire:literal
        ),+ $(,)?
    ) => {
        /// FreeSWITCH event types, named after their canonical wire names
        /// (e.g. `ChannelAnswer` = `CHANNEL_ANSWER`).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[non_exhaustive]
        #[allow(missing_docs)]
        pub enum EslEventType {
            $(
                $(#[$attr])*
                $variant,
            )+
        }

        impl fmt::Display for EslEventType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $( EslEventType::$variant => $wire, )+
                };
                f.write_str(name)
            }
        }

        impl EslEventType {
            /// Parse event type from wire name (case-insensitive).
            pub fn parse_event_type(s: &str) -> Option<Self> {
                match s.to_uppercase().as_str() {
                    $( $wire => Some(EslEventType::$variant), )+
                    _ => None,
                }
            }
        }

        impl FromStr for EslEventType {
            type Err = ParseEventTypeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse_event_type(s).ok_or_else(|| ParseEventTypeError(s.to_string()))
            }
        }
    };
}

esl_event_types! {
    Custom => "CUSTOM",
    ChannelCreate => "CHANNEL_CREATE",
    ChannelDestroy => "CHANNEL_DESTROY",
    ChannelState => "CHANNEL_STATE",
    ChannelCallstate => "CHANNEL_CALLSTATE",
    ChannelAnswer => "CHANNEL_ANSWER",
    ChannelHangup => "CHANNEL_HANGUP",
    ChannelHangupComplete => "CHANNEL_HANGUP_COMPLETE",
    ChannelExecute => "CHANNEL_EXECUTE",
    ChannelExecuteComplete => "CHANNEL_EXECUTE_COMPLETE",
    ChannelHold => "CHANNEL_HOLD",
    ChannelUnhold => "CHANNEL_UNHOLD",
    ChannelBridge => "CHANNEL_BRIDGE",
    ChannelUnbridge => "CHANNEL_UNBRIDGE",
    ChannelProgress => "CHANNEL_PROGRESS",
    ChannelProgressMedia => "CHANNEL_PROGRESS_MEDIA",
    ChannelOutgoing => "CHANNEL_OUTGOING",
    ChannelPark => "CHANNEL_PARK",
    ChannelUnpark => "CHANNEL_UNPARK",
    ChannelApplication => "CHANNEL_APPLICATION",
    ChannelOriginate => "CHANNEL_ORIGINATE",
    ChannelUuid => "CHANNEL_UUID",
    ChannelData => "CHANNEL_DATA",
    Api => "API",
    Log => "LOG",
    Startup => "STARTUP",
    Shutdown => "SHUTDOWN",
    ShutdownRequested => "SHUTDOWN_REQUESTED",
    Talk => "TALK",
    Notalk => "NOTALK",
    SessionCrash => "SESSION_CRASH",
    ModuleLoad => "MODULE_LOAD",
    ModuleUnload => "MODULE_UNLOAD",
    Dtmf => "DTMF",
    Message => "MESSAGE",
    PresenceIn => "PRESENCE_IN",
    PresenceOut => "PRESENCE_OUT",
    MessageWaiting => "MESSAGE_WAITING",
    Codec => "CODEC",
    BackgroundJob => "BACKGROUND_JOB",
    DetectedSpeech => "DETECTED_SPEECH",
    DetectedTone => "DETECTED_TONE",
    Heartbeat => "HEARTBEAT",
    Trap => "TRAP",
    AddSchedule => "ADD_SCHEDULE",
    DelSchedule => "DEL_SCHEDULE",
    ExeSchedule => "EXE_SCHEDULE",
    ReSchedule => "RE_SCHEDULE",
    ReloadXml => "RELOADXML",
    Notify => "NOTIFY",
    SendMessage => "SEND_MESSAGE",
    RecvMessage => "RECV_MESSAGE",
    RecordStart => "RECORD_START",
    RecordStop => "RECORD_STOP",
    PlaybackStart => "PLAYBACK_START",
    PlaybackStop => "PLAYBACK_STOP",
    CallUpdate => "CALL_UPDATE",
    CallSecure => "CALL_SECURE",
    SessionHeartbeat => "SESSION_HEARTBEAT",
    ClientDisconnected => "CLIENT_DISCONNECTED",
    ServerDisconnected => "SERVER_DISCONNECTED",
    General => "GENERAL",
    Command => "COMMAND",
    Failure => "FAILURE",
    SocketData => "SOCKET_DATA",
    /// Subscribe to all events
    All => "ALL",
}

/// Error returned when parsing an unknown event type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventTypeError(pub String);

impl fmt::Display for ParseEventTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for ParseEventTypeError {}

/// Semantic view over an event-carrying [`EslMessage`].
///
/// Event headers come from the frame body (plain format) or document
/// (XML/JSON). Plain-format values stay percent-encoded in storage and are
/// decoded on access; XML and JSON documents carry literal values.
#[derive(Debug, Clone)]
pub struct EslEvent {
    name: Option<String>,
    event_type: Option<EslEventType>,
    headers: HeaderMap,
    body: Option<String>,
    promoted_reply: bool,
    values_encoded: bool,
}

impl EslEvent {
    /// Create a new empty event (for `sendevent`-style construction).
    pub fn new() -> Self {
        Self {
            name: None,
            event_type: None,
            headers: HeaderMap::new(),
            body: None,
            promoted_reply: false,
            values_encoded: false,
        }
    }

    /// Create an event with the given type, setting `Event-Name`.
    pub fn with_type(event_type: EslEventType) -> Self {
        let mut event = Self::new();
        event.set_name(event_type.to_string());
        event
    }

    /// Promote an event frame (`text/event-plain`, `text/event-xml`,
    /// `text/event-json`) into an `EslEvent`.
    pub fn from_event_message(message: EslMessage) -> EslResult<Self> {
        let event = match message.content_type() {
            ContentType::EventPlain => Self::from_plain_body(message)?,
            ContentType::EventXml => Self::from_xml_body(message)?,
            ContentType::EventJson => Self::from_json_body(message)?,
            other => {
                return Err(EslError::protocol_error(format!(
                    "cannot promote {} frame to event",
                    other
                )))
            }
        };
        if event.name.is_none() {
            return Err(EslError::protocol_error("event frame missing Event-Name"));
        }
        Ok(event)
    }

    /// Promote a `command/reply` frame into an event.
    ///
    /// Used at connect time in outbound mode: the reply to `connect` carries
    /// the channel data as percent-encoded headers. The resulting event is
    /// flagged so listeners can tell it apart from a wire event.
    pub fn from_command_reply(message: EslMessage) -> Self {
        let (_, headers, body) = message.into_parts();
        let name = headers.get(EventHeader::EventName).map(Cow::into_owned);
        let event_type = name.as_deref().and_then(EslEventType::parse_event_type);
        Self {
            name,
            event_type,
            headers,
            body,
            promoted_reply: true,
            values_encoded: true,
        }
    }

    /// Plain format: the frame body is itself a header block, optionally
    /// followed by a length-delimited inner body (e.g. a DTMF payload or a
    /// `bgapi` result). The inner `Content-Length` is authoritative, so a
    /// body containing `\n\n` is not truncated.
    fn from_plain_body(message: EslMessage) -> EslResult<Self> {
        let body = message
            .body()
            .ok_or_else(|| EslError::protocol_error("plain event frame missing body"))?;

        let (header_section, tail) = match body.find("\n\n") {
            Some(pos) => (&body[..pos], &body[pos + 2..]),
            None => (body, ""),
        };
        let headers = parse_header_block(header_section)?;

        let inner_body = match headers.get_raw(HEADER_CONTENT_LENGTH) {
            Some(raw) => {
                let length: usize =
                    raw.trim()
                        .parse()
                        .map_err(|_| EslError::InvalidContentLength {
                            value: raw.to_string(),
                        })?;
                let taken = tail.as_bytes().get(..length).unwrap_or(tail.as_bytes());
                Some(String::from_utf8_lossy(taken).into_owned())
            }
            None if !tail.is_empty() => Some(tail.to_string()),
            None => None,
        };

        let name = headers.get(EventHeader::EventName).map(Cow::into_owned);
        let event_type = name.as_deref().and_then(EslEventType::parse_event_type);
        Ok(Self {
            name,
            event_type,
            headers,
            body: inner_body.filter(|b| !b.is_empty()),
            promoted_reply: false,
            values_encoded: true,
        })
    }

    /// XML format: `<event><headers>…</headers><body>…</body></event>`.
    ///
    /// The system never emits XML events; this only parses what the server
    /// sends when XML subscription is configured.
    fn from_xml_body(message: EslMessage) -> EslResult<Self> {
        use quick_xml::events::Event as XmlEvent;
        use quick_xml::Reader;

        let body = message
            .body()
            .ok_or_else(|| EslError::protocol_error("XML event frame missing body"))?;

        let mut reader = Reader::from_str(body);
        let mut headers = HeaderMap::new();
        let mut event_body: Option<String> = None;
        let mut in_headers = false;
        let mut in_body = false;
        let mut current_tag: Option<String> = None;

        loop {
            match reader.read_event() {
                Ok(XmlEvent::Start(ref e)) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    match tag.as_str() {
                        "headers" => in_headers = true,
                        "body" => in_body = true,
                        _ if in_headers => current_tag = Some(tag),
                        _ => {}
                    }
                }
                Ok(XmlEvent::End(ref e)) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    match tag.as_str() {
                        "headers" => in_headers = false,
                        "body" => in_body = false,
                        _ if in_headers => current_tag = None,
                        _ => {}
                    }
                }
                Ok(XmlEvent::Text(ref e)) => {
                    let text = e.unescape()?.to_string();
                    if in_body {
                        event_body = Some(text);
                    } else if let Some(ref tag) = current_tag {
                        headers.insert(tag.clone(), text);
                    }
                }
                Ok(XmlEvent::Eof) => break,
                Err(e) => return Err(EslError::XmlError(e)),
                _ => {}
            }
        }

        let name = headers.get_raw(EventHeader::EventName).map(str::to_owned);
        let event_type = name.as_deref().and_then(EslEventType::parse_event_type);
        Ok(Self {
            name,
            event_type,
            headers,
            body: event_body,
            promoted_reply: false,
            values_encoded: false,
        })
    }

    /// JSON format: a flat object of header names to values, with the
    /// optional body under the `_body` key.
    fn from_json_body(message: EslMessage) -> EslResult<Self> {
        let body = message
            .body()
            .ok_or_else(|| EslError::protocol_error("JSON event frame missing body"))?;

        let value: serde_json::Value = serde_json::from_str(body)?;
        let object = value
            .as_object()
            .ok_or_else(|| EslError::protocol_error("JSON event is not an object"))?;

        let mut headers = HeaderMap::new();
        let mut event_body = None;
        for (key, value) in object {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if key == "_body" {
                event_body = Some(text);
            } else {
                headers.insert(key.clone(), text);
            }
        }

        let name = headers.get_raw(EventHeader::EventName).map(str::to_owned);
        let event_type = name.as_deref().and_then(EslEventType::parse_event_type);
        Ok(Self {
            name,
            event_type,
            headers,
            body: event_body,
            promoted_reply: false,
            values_encoded: false,
        })
    }

    /// `Event-Name` header value.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Parsed event type, if the name is a recognized FreeSWITCH event.
    pub fn event_type(&self) -> Option<EslEventType> {
        self.event_type
    }

    /// `true` when this event was promoted from a `command/reply` at connect
    /// time rather than received as a wire event.
    pub fn is_promoted_reply(&self) -> bool {
        self.promoted_reply
    }

    pub fn is_event_type(&self, event_type: EslEventType) -> bool {
        self.event_type == Some(event_type)
    }

    /// Look up an event header, decoded.
    pub fn header(&self, name: impl AsRef<str>) -> Option<Cow<'_, str>> {
        if self.values_encoded {
            self.headers.get(name)
        } else {
            self.headers.get_raw(name).map(Cow::Borrowed)
        }
    }

    /// Look up an event header in its stored wire form.
    pub fn header_raw(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers.get_raw(name)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Set or overwrite a header (literal value).
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    fn set_name(&mut self, name: String) {
        self.event_type = EslEventType::parse_event_type(&name);
        self.headers.insert(EventHeader::EventName.as_str(), name.clone());
        self.name = Some(name);
    }

    /// Event message body, if any.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Event message body split into lines.
    pub fn body_lines(&self) -> Vec<&str> {
        self.body.as_deref().map(|b| b.lines().collect()).unwrap_or_default()
    }

    pub fn set_body(&mut self, body: String) {
        self.body = Some(body);
    }

    /// `Job-UUID` header from `BACKGROUND_JOB` events and `bgapi` replies.
    pub fn job_uuid(&self) -> Option<Cow<'_, str>> {
        self.header(EventHeader::JobUuid)
    }

    /// `Unique-ID` header, falling back to `Caller-Unique-ID`.
    pub fn unique_id(&self) -> Option<Cow<'_, str>> {
        self.header(EventHeader::UniqueId)
            .or_else(|| self.header(EventHeader::CallerUniqueId))
    }

    /// `Channel-Name` header (e.g. `sofia/internal/1000@domain`).
    pub fn channel_name(&self) -> Option<Cow<'_, str>> {
        self.header(EventHeader::ChannelName)
    }

    /// `Event-Subclass` header for `CUSTOM` events (e.g. `sofia::register`).
    pub fn event_subclass(&self) -> Option<Cow<'_, str>> {
        self.header(EventHeader::EventSubclass)
    }

    /// Look up a channel variable (`variable_{name}` header).
    pub fn variable(&self, name: &str) -> Option<Cow<'_, str>> {
        self.header(format!("variable_{}", name))
    }

    /// Serialize to the plain-text wire body with percent-encoded values.
    ///
    /// Inverse of the plain-event promotion: feeding the output back through
    /// the parser reconstructs an equivalent event, headers in the same
    /// order. `Content-Length` is recomputed from the body.
    pub fn to_plain_format(&self) -> String {
        use std::fmt::Write;
        let mut result = String::new();

        for (key, value) in self.headers.iter() {
            if key == HEADER_CONTENT_LENGTH {
                continue;
            }
            let value: Cow<'_, str> = if self.values_encoded {
                Cow::Borrowed(value)
            } else {
                Cow::Owned(percent_encode(value.as_bytes(), NON_ALPHANUMERIC).to_string())
            };
            let _ = writeln!(result, "{}: {}", key, value);
        }

        if let Some(body) = &self.body {
            let _ = writeln!(result, "Content-Length: {}", body.len());
            result.push('\n');
            result.push_str(body);
        } else {
            result.push('\n');
        }

        result
    }
}

impl Default for EslEvent {
    fn default() -> Self {
        Self::new()
    }
}
