//! HTTP/1.1 upgrade handshake messages
//!
//! This module holds the pieces of the upgrade exchange that do not depend
//! on threads or timing:
//! - Building the initiator's upgrade request and the acceptor's 101 reply
//! - Reading a header block off a transport until CR LF CR LF, within a
//!   fixed size limit
//! - Classifying the peer message per role and extracting pseudo-headers
//!
//! The orchestration (background reader, timeout, cancellation) lives in
//! [`crate::upgrade`].

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::headers::{HeaderFields, PseudoHeaders};
use crate::transport::{Transport, is_retryable};
use crate::{CRLFCRLF, Config};

/// Shortest possible header line: one-byte name, colon, CR LF
const MIN_HEADER_LINE: usize = 4;

/// HTTP version token `httparse` accepts
const HTTP_11: &[u8] = b"HTTP/1.1";

/// Pseudo-headers an initiator must provide
const REQUIRED_PSEUDO_HEADERS: [&str; 3] = [":path", ":host", ":version"];

/// Which side of the connection this handshake runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// Sends the upgrade request and expects 101
    Initiator,
    /// Waits for the upgrade request and answers it
    Acceptor,
}

/// Classification of the peer's HTTP/1.1 message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResult {
    /// Peer agreed to (or asked for) the upgrade
    Upgrade,
    /// Well-formed message that is not an upgrade
    NonUpgrade,
    /// Transport closed before a complete header block arrived
    ConnectionClosed,
}

/// The peer's handshake message as read off the transport
///
/// `header_bytes` and `trailing` are slices of one buffer. `trailing` holds
/// whatever the peer sent after the terminator; it already belongs to the
/// binary protocol and must be consumed before reading the transport again.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub result: HandshakeResult,
    /// Header block including the terminator
    pub header_bytes: Bytes,
    /// Bytes read past the terminator
    pub trailing: Bytes,
    /// Pseudo-headers extracted from an upgrade request (acceptor only)
    pub headers: PseudoHeaders,
}

impl HandshakeResponse {
    fn closed() -> Self {
        Self {
            result: HandshakeResult::ConnectionClosed,
            header_bytes: Bytes::new(),
            trailing: Bytes::new(),
            headers: PseudoHeaders::new(),
        }
    }

    /// Header block as text, for diagnostics
    pub fn header_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.header_bytes)
    }
}

/// Initiator request with its required pseudo-headers validated
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    headers: PseudoHeaders,
}

impl UpgradeRequest {
    /// Validate pseudo-headers for the upgrade request
    ///
    /// `:path`, `:host` and `:version` are required. Every name must start
    /// with `:` and no name or value may contain characters that would break
    /// the request line or the settings block.
    pub fn new(headers: PseudoHeaders) -> Result<Self> {
        for name in REQUIRED_PSEUDO_HEADERS {
            if !headers.contains(name) {
                return Err(Error::MissingPseudoHeader(name));
            }
        }

        for (name, value) in headers.iter() {
            let bad_name = name.len() < 2
                || !name.starts_with(':')
                || name.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control());
            let bad_value = value.is_empty() || value.bytes().any(|b| b == b'\r' || b == b'\n');
            let bad_target = (name.eq_ignore_ascii_case(":path")
                || name.eq_ignore_ascii_case(":host"))
                && value.bytes().any(|b| b.is_ascii_whitespace());

            if bad_name || bad_value || bad_target {
                return Err(Error::InvalidPseudoHeader(name.to_string()));
            }
        }

        Ok(Self { headers })
    }

    pub fn path(&self) -> &str {
        self.headers.get(":path").unwrap_or("/")
    }

    pub fn host(&self) -> &str {
        self.headers.get(":host").unwrap_or_default()
    }

    pub fn headers(&self) -> &PseudoHeaders {
        &self.headers
    }

    /// Encode the upgrade request
    ///
    /// ```text
    /// GET <path> HTTP/1.1
    /// Host: <host>
    /// Connection: Upgrade, <settings header>
    /// Upgrade: <protocol>
    /// <settings header>: <base64 pseudo-headers>
    /// ```
    pub fn encode(&self, config: &Config) -> Bytes {
        let settings = self.headers.to_settings_blob();
        let mut buf = BytesMut::with_capacity(256 + settings.len());

        buf.put_slice(b"GET ");
        buf.put_slice(self.path().as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");
        buf.put_slice(b"Host: ");
        buf.put_slice(self.host().as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(b"Connection: Upgrade, ");
        buf.put_slice(config.settings_header.as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(b"Upgrade: ");
        buf.put_slice(config.protocol.as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(config.settings_header.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(settings.as_bytes());
        buf.put_slice(b"\r\n\r\n");
        buf.freeze()
    }
}

/// Build the acceptor's 101 reply
pub fn build_response(config: &Config) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Upgrade: ");
    buf.put_slice(config.protocol.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Position of the first CR LF CR LF in `buf[from..]`
#[inline]
pub fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(CRLFCRLF.len())
        .position(|window| window == CRLFCRLF)
        .map(|pos| pos + from)
}

/// First offset worth scanning after a read of `received` bytes that ended
/// at `offset`
///
/// Only new bytes are scanned, plus enough of the old ones to catch a
/// terminator split across two reads.
#[inline]
pub fn scan_start(offset: usize, received: usize) -> usize {
    offset.saturating_sub(received + CRLFCRLF.len() - 1)
}

/// Read the peer's header block and classify it
///
/// Runs until the terminator shows up, the transport closes, the buffer
/// reaches `config.size_limit` or `cancel` is raised. Closure is reported as
/// [`HandshakeResult::ConnectionClosed`], not as an error. Receives that
/// time out or would block are retried after checking `cancel`, at most once
/// per poll interval.
pub fn read_handshake<T: Transport + ?Sized>(
    transport: &T,
    end: ConnectionEnd,
    config: &Config,
    cancel: &AtomicBool,
) -> Result<HandshakeResponse> {
    let limit = config.size_limit;
    let poll_interval = config.effective_poll_interval();
    let mut buf = BytesMut::zeroed(limit);
    let mut offset = 0;

    while offset < limit {
        if cancel.load(Ordering::Acquire) {
            return Err(Error::Timeout);
        }

        let started = Instant::now();
        let received = match transport.receive(&mut buf[offset..limit]) {
            Ok(0) => {
                tracing::debug!(offset, "transport closed during handshake");
                return Ok(HandshakeResponse::closed());
            }
            Ok(n) => n.min(limit - offset),
            Err(e) if is_retryable(&e) => {
                // non-blocking transports come back at once; pace them
                thread::sleep(poll_interval.saturating_sub(started.elapsed()));
                continue;
            }
            Err(e) => {
                tracing::debug!(error = %e, offset, "handshake receive failed");
                return Ok(HandshakeResponse::closed());
            }
        };

        offset += received;
        if let Some(pos) = find_terminator(&buf[..offset], scan_start(offset, received)) {
            buf.truncate(offset);
            return inspect(end, buf.freeze(), pos + CRLFCRLF.len(), config);
        }
    }

    Err(Error::SizeLimitExceeded)
}

/// Split the buffer at the end of the header block and classify it
fn inspect(
    end: ConnectionEnd,
    buf: Bytes,
    split: usize,
    config: &Config,
) -> Result<HandshakeResponse> {
    let header_bytes = buf.slice(..split);
    let trailing = buf.slice(split..);

    let (result, headers) = match end {
        ConnectionEnd::Initiator => (
            classify_response(&header_bytes, config),
            PseudoHeaders::new(),
        ),
        ConnectionEnd::Acceptor => classify_request(&header_bytes, config)?,
    };

    tracing::debug!(
        ?end,
        ?result,
        header_len = header_bytes.len(),
        trailing_len = trailing.len(),
        "handshake message inspected"
    );

    Ok(HandshakeResponse {
        result,
        header_bytes,
        trailing,
        headers,
    })
}

/// Header slots for a block of `len` bytes
///
/// Every header line takes at least [`MIN_HEADER_LINE`] bytes, so the block
/// can never hold more lines than this; the size limit is the only cap.
fn header_storage<'b>(len: usize) -> Vec<httparse::Header<'b>> {
    vec![httparse::EMPTY_HEADER; len / MIN_HEADER_LINE + 1]
}

/// Where the version token sits on the first line
#[derive(Debug, Clone, Copy)]
enum VersionAt {
    /// Status line: `HTTP/1.1 101 ...`
    LineStart,
    /// Request line: `GET / HTTP/1.1`
    LineEnd,
}

/// Uppercase a mixed-case `HTTP/1.1` token so `httparse` accepts it
///
/// Borrows the input unless the token actually needs rewriting.
fn normalize_version(raw: &[u8], at: VersionAt) -> Cow<'_, [u8]> {
    let line_end = raw
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(raw.len());
    let start = match at {
        VersionAt::LineStart => 0,
        VersionAt::LineEnd => match line_end.checked_sub(HTTP_11.len()) {
            Some(start) => start,
            None => return Cow::Borrowed(raw),
        },
    };

    match raw.get(start..start + HTTP_11.len()) {
        Some(token) if token != HTTP_11 && token.eq_ignore_ascii_case(HTTP_11) => {
            let mut owned = raw.to_vec();
            owned[start..start + HTTP_11.len()].copy_from_slice(HTTP_11);
            Cow::Owned(owned)
        }
        _ => Cow::Borrowed(raw),
    }
}

/// Classify the acceptor's reply as seen by the initiator
///
/// Requires `HTTP/1.1 101 Switching Protocols`, a `Connection` header
/// listing `Upgrade` and an `Upgrade` header naming the configured protocol.
/// The status line is matched without regard to case.
pub fn classify_response(raw: &[u8], config: &Config) -> HandshakeResult {
    let raw = normalize_version(raw, VersionAt::LineStart);
    let mut storage = header_storage(raw.len());
    let mut res = httparse::Response::new(&mut storage);

    match res.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return HandshakeResult::NonUpgrade,
        Err(e) => {
            tracing::debug!(error = %e, "unparsable handshake response");
            return HandshakeResult::NonUpgrade;
        }
    }

    let switching = res.version == Some(1)
        && res.code == Some(101)
        && res
            .reason
            .is_some_and(|reason| reason.eq_ignore_ascii_case("Switching Protocols"));

    let fields = HeaderFields::from_httparse(res.headers);
    let upgrade = fields.has_token("connection", "upgrade")
        && fields
            .get("upgrade")
            .is_some_and(|proto| proto.eq_ignore_ascii_case(&config.protocol));

    if switching && upgrade {
        HandshakeResult::Upgrade
    } else {
        HandshakeResult::NonUpgrade
    }
}

/// Classify the initiator's request as seen by the acceptor
///
/// Requires a `Connection` header listing both `Upgrade` and the settings
/// header, an `Upgrade` header naming the configured protocol and the
/// settings header itself. On upgrade the request target becomes `:path`
/// and the settings blob supplies the remaining pseudo-headers; a blob that
/// cannot be decoded fails the whole handshake.
pub fn classify_request(raw: &[u8], config: &Config) -> Result<(HandshakeResult, PseudoHeaders)> {
    let not_upgrade = Ok((HandshakeResult::NonUpgrade, PseudoHeaders::new()));

    let raw = normalize_version(raw, VersionAt::LineEnd);
    let mut storage = header_storage(raw.len());
    let mut req = httparse::Request::new(&mut storage);

    match req.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return not_upgrade,
        Err(e) => {
            tracing::debug!(error = %e, "unparsable handshake request");
            return not_upgrade;
        }
    }

    let fields = HeaderFields::from_httparse(req.headers);
    let settings_header = config.settings_header.as_str();

    let connection = fields.has_token("connection", "upgrade")
        && fields.has_token("connection", settings_header);
    let protocol = fields
        .get("upgrade")
        .is_some_and(|proto| proto.eq_ignore_ascii_case(&config.protocol));
    let (Some(path), Some(blob)) = (req.path, fields.get(settings_header)) else {
        return not_upgrade;
    };
    if !connection || !protocol {
        return not_upgrade;
    }

    let mut headers = PseudoHeaders::new();
    headers.insert(":path", path);
    for (name, value) in PseudoHeaders::from_settings_blob(blob)? {
        if name != ":path" {
            headers.insert(name, value);
        }
    }

    Ok((HandshakeResult::Upgrade, headers))
}
