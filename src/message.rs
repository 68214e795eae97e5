//! ESL wire framing: header blocks, content types, and the incremental parser

use crate::{
    buffer::StreamBuffer,
    constants::{
        CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST, CONTENT_TYPE_COMMAND_REPLY,
        CONTENT_TYPE_DISCONNECT_NOTICE, CONTENT_TYPE_RUDE_REJECTION, CONTENT_TYPE_TEXT_EVENT_JSON,
        CONTENT_TYPE_TEXT_EVENT_PLAIN, CONTENT_TYPE_TEXT_EVENT_XML, HEADER_CONTENT_LENGTH,
        HEADER_CONTENT_TYPE, MAX_MESSAGE_SIZE, MESSAGE_TERMINATOR,
    },
    error::{EslError, EslResult},
};
use percent_encoding::percent_decode_str;
use std::borrow::Cow;

/// Percent-decode a header value, falling back to the raw form when the
/// escape sequence is invalid.
pub(crate) fn decode_value(raw: &str) -> Cow<'_, str> {
    match percent_decode_str(raw).decode_utf8() {
        Ok(decoded) => decoded,
        Err(_) => Cow::Borrowed(raw),
    }
}

/// Ordered `Name: Value` header collection.
///
/// FreeSWITCH emits headers in a meaningful order and the protocol never
/// relies on duplicates, so this is a flat list with replace-on-insert.
/// Values are stored raw (possibly `%NN`-escaped); [`get`](Self::get)
/// decodes on access while [`get_raw`](Self::get_raw) returns the wire form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header, preserving first-insertion order.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Raw (wire-form) value lookup.
    pub fn get_raw(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Percent-decoded value lookup.
    pub fn get(&self, name: impl AsRef<str>) -> Option<Cow<'_, str>> {
        self.get_raw(name).map(decode_value)
    }

    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.get_raw(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(name, raw value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut map = HeaderMap::new();
        for (n, v) in iter {
            map.insert(n, v);
        }
        map
    }
}

/// Content types the ESL protocol defines, with unknown types passed through.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ContentType {
    /// Server requests authentication (inbound mode)
    AuthRequest,
    /// Reply to a command
    CommandReply,
    /// Reply to an `api` command, body carries the result
    ApiResponse,
    /// Event serialized as a plain-text header block
    EventPlain,
    /// Event serialized as XML
    EventXml,
    /// Event serialized as JSON
    EventJson,
    /// Server is about to close the socket
    DisconnectNotice,
    /// Server refused the connection (ACL)
    RudeRejection,
    /// Anything else; delivered to the handler, logged, and dropped
    Unknown(String),
}

impl ContentType {
    pub fn from_wire(value: &str) -> Self {
        match value {
            CONTENT_TYPE_AUTH_REQUEST => ContentType::AuthRequest,
            CONTENT_TYPE_COMMAND_REPLY => ContentType::CommandReply,
            CONTENT_TYPE_API_RESPONSE => ContentType::ApiResponse,
            CONTENT_TYPE_TEXT_EVENT_PLAIN => ContentType::EventPlain,
            CONTENT_TYPE_TEXT_EVENT_XML => ContentType::EventXml,
            CONTENT_TYPE_TEXT_EVENT_JSON => ContentType::EventJson,
            CONTENT_TYPE_DISCONNECT_NOTICE => ContentType::DisconnectNotice,
            CONTENT_TYPE_RUDE_REJECTION => ContentType::RudeRejection,
            other => ContentType::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ContentType::AuthRequest => CONTENT_TYPE_AUTH_REQUEST,
            ContentType::CommandReply => CONTENT_TYPE_COMMAND_REPLY,
            ContentType::ApiResponse => CONTENT_TYPE_API_RESPONSE,
            ContentType::EventPlain => CONTENT_TYPE_TEXT_EVENT_PLAIN,
            ContentType::EventXml => CONTENT_TYPE_TEXT_EVENT_XML,
            ContentType::EventJson => CONTENT_TYPE_TEXT_EVENT_JSON,
            ContentType::DisconnectNotice => CONTENT_TYPE_DISCONNECT_NOTICE,
            ContentType::RudeRejection => CONTENT_TYPE_RUDE_REJECTION,
            ContentType::Unknown(other) => other,
        }
    }

    /// `true` for the content types that carry an event payload.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            ContentType::EventPlain | ContentType::EventXml | ContentType::EventJson
        )
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct EslMessage {
    content_type: ContentType,
    headers: HeaderMap,
    body: Option<String>,
}

impl EslMessage {
    pub fn new(content_type: ContentType, headers: HeaderMap, body: Option<String>) -> Self {
        Self {
            content_type,
            headers,
            body,
        }
    }

    pub fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    /// Percent-decoded header lookup.
    pub fn header(&self, name: impl AsRef<str>) -> Option<Cow<'_, str>> {
        self.headers.get(name)
    }

    /// Raw (wire-form) header lookup.
    pub fn header_raw(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers.get_raw(name)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Body byte length (zero when absent).
    pub fn content_length(&self) -> usize {
        self.body.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn into_parts(self) -> (ContentType, HeaderMap, Option<String>) {
        (self.content_type, self.headers, self.body)
    }
}

/// Parse a `Name: Value` header block.
///
/// One optional space after the colon is trimmed; further whitespace is part
/// of the value. A line without a colon is a framing error.
pub(crate) fn parse_header_block(text: &str) -> EslResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let colon = line
            .find(':')
            .ok_or_else(|| EslError::malformed_header(line))?;
        let name = &line[..colon];
        let value = line[colon + 1..].strip_prefix(' ').unwrap_or(&line[colon + 1..]);
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Parser state for handling incomplete frames
enum ParseState {
    AwaitingHeaders,
    AwaitingBody {
        content_type: ContentType,
        headers: HeaderMap,
        body_length: usize,
    },
}

/// Incremental ESL frame parser.
///
/// Feed raw socket bytes with [`feed`](Self::feed), then drain complete
/// frames with [`parse_message`](Self::parse_message) until it returns
/// `Ok(None)`.
pub struct EslParser {
    buffer: StreamBuffer,
    state: ParseState,
}

impl EslParser {
    pub fn new() -> Self {
        Self {
            buffer: StreamBuffer::new(),
            state: ParseState::AwaitingHeaders,
        }
    }

    /// Append bytes read from the socket.
    pub fn feed(&mut self, data: &[u8]) -> EslResult<()> {
        self.buffer.extend_from_slice(data);
        self.buffer.check_size_limits()
    }

    /// `true` when EOF at this point would cut a frame short.
    pub fn mid_frame(&self) -> bool {
        matches!(self.state, ParseState::AwaitingBody { .. }) || !self.buffer.is_empty()
    }

    /// Error describing the truncation if the stream ended now.
    pub fn eof_error(&self) -> Option<EslError> {
        match &self.state {
            ParseState::AwaitingBody { body_length, .. } => Some(EslError::UnexpectedEof {
                needed: body_length - self.buffer.len(),
            }),
            ParseState::AwaitingHeaders if !self.buffer.is_empty() => {
                Some(EslError::UnexpectedEof { needed: 0 })
            }
            ParseState::AwaitingHeaders => None,
        }
    }

    /// Try to complete one frame from buffered data.
    pub fn parse_message(&mut self) -> EslResult<Option<EslMessage>> {
        match &self.state {
            ParseState::AwaitingHeaders => {
                let Some(header_bytes) = self
                    .buffer
                    .extract_until_pattern(MESSAGE_TERMINATOR.as_bytes())
                else {
                    return Ok(None);
                };
                self.buffer.compact();

                let header_text = std::str::from_utf8(&header_bytes)?;
                let headers = parse_header_block(header_text)?;

                // Every ESL frame carries Content-Type. Absence means the
                // stream desynced (e.g. after a corrupted Content-Length).
                let content_type = headers
                    .get(HEADER_CONTENT_TYPE)
                    .map(|ct| ContentType::from_wire(&ct))
                    .ok_or_else(|| {
                        EslError::protocol_error("missing Content-Type header, stream desync")
                    })?;

                let body_length = match headers.get_raw(HEADER_CONTENT_LENGTH) {
                    Some(raw) => {
                        let length: usize = raw.trim().parse().map_err(|_| {
                            EslError::InvalidContentLength {
                                value: raw.to_string(),
                            }
                        })?;
                        if length > MAX_MESSAGE_SIZE {
                            return Err(EslError::InvalidContentLength {
                                value: raw.to_string(),
                            });
                        }
                        length
                    }
                    None => 0,
                };

                if body_length > 0 {
                    self.state = ParseState::AwaitingBody {
                        content_type,
                        headers,
                        body_length,
                    };
                    self.parse_message()
                } else {
                    Ok(Some(EslMessage::new(content_type, headers, None)))
                }
            }
            ParseState::AwaitingBody {
                content_type,
                headers,
                body_length,
            } => {
                let Some(body_bytes) = self.buffer.extract_bytes(*body_length) else {
                    return Ok(None);
                };
                self.buffer.compact();

                let body = std::str::from_utf8(&body_bytes)?.to_owned();
                let message =
                    EslMessage::new(content_type.clone(), headers.clone(), Some(body));
                self.state = ParseState::AwaitingHeaders;
                Ok(Some(message))
            }
        }
    }
}

impl Default for EslParser {
    fn default() -> Self {
        Self::new()
    }
}
