//! Handshake tests over a scripted in-memory transport.
//!
//! These cover the reader and orchestrator paths that are hard to force on
//! a real socket:
//! - Header blocks delivered in arbitrarily small chunks
//! - Size limit, closure, silence (timeout) and rejection
//! - Settings blobs that cannot be decoded
//! - Getting the transport back after a failed attempt
//! - Pacing of transports that never block

mod common;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine;
use common::{ScriptedTransport, expect_failure, init_tracing};
use h2c_upgrade::handshake::{UpgradeRequest, read_handshake};
use h2c_upgrade::{
    Config, ConnectionEnd, Error, Frame, HandshakeResult, PseudoHeaders, Transport,
    UpgradeHandshaker, WindowUpdateFrame,
};

const SWITCHING: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
    Connection: Upgrade\r\n\
    Upgrade: HTTP-draft-04/2.0\r\n\r\n";

fn pseudo_headers() -> PseudoHeaders {
    PseudoHeaders::from_iter([(":path", "/"), (":host", "example.com"), (":version", "2")])
}

fn upgrade_request(config: &Config) -> Vec<u8> {
    UpgradeRequest::new(pseudo_headers())
        .unwrap()
        .encode(config)
        .to_vec()
}

fn fast_config() -> Config {
    Config::builder()
        .timeout(Duration::from_secs(5))
        .poll_interval(Duration::from_millis(10))
        .build()
}

#[test]
fn test_chunked_delivery_matches_whole_delivery() {
    init_tracing();
    let config = Config::default();
    let frame = WindowUpdateFrame::new(0, 1024);

    let mut stream = upgrade_request(&config);
    let header_len = stream.len();
    stream.extend_from_slice(frame.as_bytes());

    let whole = ScriptedTransport::chunked(&stream, stream.len(), true);
    let reference = read_handshake(
        &whole,
        ConnectionEnd::Acceptor,
        &config,
        &AtomicBool::new(false),
    )
    .unwrap();
    assert_eq!(reference.result, HandshakeResult::Upgrade);
    assert_eq!(reference.header_bytes.len(), header_len);
    assert_eq!(&reference.trailing[..], frame.as_bytes());

    for size in [1, 2, 3, 5, 7, 64, 200] {
        let transport = ScriptedTransport::chunked(&stream, size, true);
        let response = read_handshake(
            &transport,
            ConnectionEnd::Acceptor,
            &config,
            &AtomicBool::new(false),
        )
        .unwrap();

        assert_eq!(response.result, HandshakeResult::Upgrade, "chunk size {}", size);
        assert_eq!(response.header_bytes, reference.header_bytes, "chunk size {}", size);
        assert_eq!(response.headers, reference.headers, "chunk size {}", size);

        // whatever was not read past the terminator is still in the transport
        let mut rest = response.trailing.to_vec();
        rest.extend(transport.remaining());
        assert_eq!(rest, frame.as_bytes(), "chunk size {}", size);
    }
}

#[test]
fn test_terminator_split_across_reads() {
    let config = Config::default();
    let chunks = vec![
        b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\n".to_vec(),
        b"Upgrade: HTTP-draft-04/2.0\r\n\r".to_vec(),
        b"\nextra".to_vec(),
    ];
    let transport = ScriptedTransport::new(chunks, true);

    let response = read_handshake(
        &transport,
        ConnectionEnd::Initiator,
        &config,
        &AtomicBool::new(false),
    )
    .unwrap();
    assert_eq!(response.result, HandshakeResult::Upgrade);
    assert_eq!(&response.trailing[..], b"extra");
    assert!(response.header_text().ends_with("\r\n\r\n"));
}

#[test]
fn test_initiator_upgrade_keeps_trailing_frame() {
    init_tracing();
    let config = fast_config();
    let frame = WindowUpdateFrame::new(0, 65_535);

    let mut reply = SWITCHING.to_vec();
    reply.extend_from_slice(frame.as_bytes());
    let transport = ScriptedTransport::new(vec![reply], false);

    let upgraded = UpgradeHandshaker::initiator(transport, pseudo_headers(), config.clone())
        .unwrap()
        .handshake()
        .unwrap();

    assert_eq!(upgraded.end(), ConnectionEnd::Initiator);
    assert!(upgraded.headers().is_empty());
    assert_eq!(upgraded.transport().sent(), upgrade_request(&config));

    let (_, _, trailing) = upgraded.into_parts();
    let received = WindowUpdateFrame::from_frame(Frame::from_wire(trailing).unwrap()).unwrap();
    assert_eq!(received.delta(), 65_535);
}

#[test]
fn test_acceptor_upgrade_replies_and_extracts_headers() {
    let config = fast_config();
    let transport = ScriptedTransport::chunked(&upgrade_request(&config), 16, false);

    let upgraded = UpgradeHandshaker::acceptor(transport, config)
        .handshake()
        .unwrap();

    assert_eq!(upgraded.headers(), &pseudo_headers());
    assert_eq!(upgraded.transport().sent(), SWITCHING);
    assert!(upgraded.trailing().is_empty());
}

#[test]
fn test_initiator_rejected_by_plain_response() {
    let config = fast_config();
    let transport = ScriptedTransport::new(vec![b"HTTP/1.1 200 OK\r\n\r\n".to_vec()], false);

    let result = UpgradeHandshaker::initiator(transport, pseudo_headers(), config.clone())
        .unwrap()
        .handshake();
    let (error, transport, response) = expect_failure(result).into_parts();

    assert!(matches!(error, Error::Rejected));
    let response = response.unwrap();
    assert_eq!(response.result, HandshakeResult::NonUpgrade);
    assert_eq!(&response.header_bytes[..], b"HTTP/1.1 200 OK\r\n\r\n");
    assert_eq!(transport.unwrap().sent(), upgrade_request(&config));
}

#[test]
fn test_retry_on_same_transport_after_rejection() {
    let frame = WindowUpdateFrame::new(0, 100);
    let mut upgrade = SWITCHING.to_vec();
    upgrade.extend_from_slice(frame.as_bytes());
    let transport = ScriptedTransport::new(
        vec![b"HTTP/1.1 503 Service Unavailable\r\n\r\n".to_vec(), upgrade],
        false,
    );

    let first = UpgradeHandshaker::initiator(transport, pseudo_headers(), fast_config())
        .unwrap()
        .handshake();
    let failure = expect_failure(first);
    assert!(matches!(failure.error(), Error::Rejected));
    let (_, transport, _) = failure.into_parts();

    let retry = UpgradeHandshaker::initiator(transport.unwrap(), pseudo_headers(), fast_config());
    let upgraded = retry.unwrap().handshake().unwrap();
    assert_eq!(&upgraded.trailing()[..], frame.as_bytes());
}

#[test]
fn test_acceptor_does_not_reply_to_plain_request() {
    let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
    let transport = ScriptedTransport::new(vec![request.clone()], false);

    let result = UpgradeHandshaker::acceptor(transport, fast_config()).handshake();
    let failure = expect_failure(result);
    assert!(matches!(failure.error(), Error::Rejected));
    assert!(failure.transport().unwrap().sent().is_empty());
    // the plain request is still there for an HTTP/1.1 fallback
    assert_eq!(&failure.response().unwrap().header_bytes[..], &request[..]);
}

#[test]
fn test_acceptor_malformed_settings() {
    let request = b"GET / HTTP/1.1\r\n\
        Host: example.com\r\n\
        Connection: Upgrade, HTTP2-Settings\r\n\
        Upgrade: HTTP-draft-04/2.0\r\n\
        HTTP2-Settings: ???\r\n\r\n"
        .to_vec();
    let transport = ScriptedTransport::new(vec![request], false);

    let result = UpgradeHandshaker::acceptor(transport, fast_config()).handshake();
    let failure = expect_failure(result);
    assert!(matches!(failure.error(), Error::MalformedSettings(_)));
    assert!(failure.transport().unwrap().sent().is_empty());
}

#[test]
fn test_acceptor_settings_line_without_value() {
    let blob = base64::engine::general_purpose::STANDARD.encode(":host\r\n");
    let request = format!(
        "GET / HTTP/1.1\r\n\
         Connection: Upgrade, HTTP2-Settings\r\n\
         Upgrade: HTTP-draft-04/2.0\r\n\
         HTTP2-Settings: {}\r\n\r\n",
        blob
    );
    let transport = ScriptedTransport::new(vec![request.into_bytes()], false);

    let result = UpgradeHandshaker::acceptor(transport, fast_config()).handshake();
    let failure = expect_failure(result);
    assert!(matches!(failure.error(), Error::MalformedSettings(_)));
}

#[test]
fn test_size_limit_exceeded() {
    let config = fast_config();
    let flood = vec![b'a'; config.size_limit + 1];
    let transport = ScriptedTransport::chunked(&flood, 1000, false);

    let failure = expect_failure(UpgradeHandshaker::acceptor(transport, config).handshake());
    assert!(matches!(failure.error(), Error::SizeLimitExceeded));
    assert!(failure.transport().is_some());
}

#[test]
fn test_terminator_ending_at_size_limit() {
    let request = upgrade_request(&Config::default());

    let config = Config::builder().size_limit(request.len()).build();
    for size in [1, 7, request.len()] {
        let transport = ScriptedTransport::chunked(&request, size, true);
        let response = read_handshake(
            &transport,
            ConnectionEnd::Acceptor,
            &config,
            &AtomicBool::new(false),
        )
        .unwrap();
        assert_eq!(response.result, HandshakeResult::Upgrade, "chunk size {}", size);
        assert_eq!(&response.header_bytes[..], &request[..]);
        assert!(response.trailing.is_empty());
    }

    let config = Config::builder().size_limit(request.len() - 1).build();
    let transport = ScriptedTransport::chunked(&request, request.len(), true);
    let result = read_handshake(
        &transport,
        ConnectionEnd::Acceptor,
        &config,
        &AtomicBool::new(false),
    );
    assert!(matches!(result, Err(Error::SizeLimitExceeded)));
}

#[test]
fn test_connection_closed_before_terminator() {
    let transport = ScriptedTransport::new(vec![b"HTTP/1.1 101 Swi".to_vec()], true);

    let result = UpgradeHandshaker::initiator(transport, pseudo_headers(), fast_config())
        .unwrap()
        .handshake();
    let failure = expect_failure(result);
    assert!(matches!(failure.error(), Error::ConnectionClosed));
    assert!(failure.transport().is_some());
}

#[test]
fn test_silent_peer_times_out() {
    init_tracing();
    let timeout = Duration::from_millis(200);
    let config = Config::builder()
        .timeout(timeout)
        .poll_interval(Duration::from_millis(10))
        .build();

    let start = Instant::now();
    let result = UpgradeHandshaker::acceptor(ScriptedTransport::silent(), config).handshake();

    assert!(matches!(expect_failure(result).error(), Error::Timeout));
    let elapsed = start.elapsed();
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(2), "took {:?}", elapsed);
}

#[test]
fn test_zero_poll_interval_still_times_out() {
    let timeout = Duration::from_millis(100);
    let config = Config {
        timeout,
        poll_interval: Duration::ZERO,
        ..Config::default()
    };

    let result = UpgradeHandshaker::acceptor(ScriptedTransport::silent(), config).handshake();
    assert!(matches!(expect_failure(result).error(), Error::Timeout));
}

#[test]
fn test_non_blocking_transport_is_paced() {
    let transport = NonBlocking::default();
    let cancel = AtomicBool::new(false);
    let config = Config::builder()
        .poll_interval(Duration::from_millis(20))
        .build();

    let result = thread::scope(|s| {
        let reader =
            s.spawn(|| read_handshake(&transport, ConnectionEnd::Acceptor, &config, &cancel));
        thread::sleep(Duration::from_millis(200));
        cancel.store(true, Ordering::Release);
        reader.join().unwrap()
    });

    assert!(matches!(result, Err(Error::Timeout)));
    // roughly one receive per poll interval, not a busy loop
    let polls = transport.polls.load(Ordering::Relaxed);
    assert!(polls <= 30, "polled {} times", polls);
}

#[test]
fn test_cancelled_reader_stops() {
    let cancel = AtomicBool::new(true);
    let result = read_handshake(
        &ScriptedTransport::silent(),
        ConnectionEnd::Acceptor,
        &Config::default(),
        &cancel,
    );
    assert!(matches!(result, Err(Error::Timeout)));
}

#[test]
fn test_initiator_missing_pseudo_header() {
    let mut headers = pseudo_headers();
    headers.remove(":version");

    let result = UpgradeHandshaker::initiator(ScriptedTransport::silent(), headers, fast_config());
    assert!(matches!(result, Err(Error::MissingPseudoHeader(":version"))));
}

/// Transport that never has data and never blocks
#[derive(Default)]
struct NonBlocking {
    polls: AtomicUsize,
}

impl Transport for NonBlocking {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        Ok(data.len())
    }

    fn receive(&self, _buf: &mut [u8]) -> io::Result<usize> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        Err(io::ErrorKind::WouldBlock.into())
    }
}
