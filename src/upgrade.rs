//! Upgrade handshake orchestration
//!
//! One [`UpgradeHandshaker`] drives exactly one attempt:
//!
//! ```text
//! Idle -> Sending (initiator) / AwaitingRequest (acceptor) -> Reading
//!      -> Inspecting -> Upgraded | Rejected | Closed | TimedOut | Failed
//! ```
//!
//! A dedicated reader thread reads and classifies the peer's header block
//! while the calling thread sends. The reader hands its single result over a
//! bounded(1) channel; the caller waits on that channel with the configured
//! timeout. On timeout a cancellation flag is raised and the reader exits
//! at its next poll, so no thread is ever killed mid-receive.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::Config;
use crate::error::{Error, Result};
use crate::handshake::{
    ConnectionEnd, HandshakeResponse, HandshakeResult, UpgradeRequest, build_response,
    read_handshake,
};
use crate::headers::PseudoHeaders;
use crate::transport::Transport;

/// Drives a single upgrade attempt over a transport
pub struct UpgradeHandshaker<T: Transport> {
    transport: Arc<T>,
    end: ConnectionEnd,
    request: Option<UpgradeRequest>,
    config: Config,
}

impl<T: Transport> UpgradeHandshaker<T> {
    /// Handshaker for the side that sends the upgrade request
    ///
    /// `headers` must contain `:path`, `:host` and `:version`; anything
    /// missing or unusable fails here rather than during the handshake.
    pub fn initiator(transport: T, headers: PseudoHeaders, config: Config) -> Result<Self> {
        let request = UpgradeRequest::new(headers)?;
        Ok(Self {
            transport: Arc::new(transport),
            end: ConnectionEnd::Initiator,
            request: Some(request),
            config,
        })
    }

    /// Handshaker for the side that waits for the upgrade request
    pub fn acceptor(transport: T, config: Config) -> Self {
        Self {
            transport: Arc::new(transport),
            end: ConnectionEnd::Acceptor,
            request: None,
            config,
        }
    }

    pub fn end(&self) -> ConnectionEnd {
        self.end
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the handshake
    ///
    /// The initiator sends its request and then waits for the 101 reply.
    /// The acceptor waits for the request first and replies with 101 only
    /// if it asks for the upgrade. On success the transport comes back
    /// together with any bytes the peer sent after its header block.
    ///
    /// On failure the transport comes back inside the [`HandshakeError`]
    /// whenever the reader has finished with it, so the caller can keep
    /// talking HTTP/1.1 or try again on the same connection.
    pub fn handshake(self) -> std::result::Result<Upgraded<T>, HandshakeError<T>> {
        let Self {
            transport,
            end,
            request,
            config,
        } = self;

        if let Err(e) = transport.set_poll_interval(Some(config.effective_poll_interval())) {
            return Err(HandshakeError::recover(e.into(), transport, None));
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let (reader, rx) = match spawn_reader(&transport, end, &config, &cancel) {
            Ok(spawned) => spawned,
            Err(e) => return Err(HandshakeError::recover(e, transport, None)),
        };

        let exchanged = exchange(
            &*transport,
            end,
            request.as_ref(),
            &config,
            &rx,
            reader,
            &cancel,
        );
        let response = match exchanged {
            Ok(response) => response,
            Err(e) => return Err(HandshakeError::recover(e, transport, None)),
        };

        let failure = match response.result {
            HandshakeResult::Upgrade => None,
            HandshakeResult::NonUpgrade => {
                tracing::warn!(
                    ?end,
                    message = %response.header_text(),
                    "peer did not upgrade"
                );
                Some(Error::Rejected)
            }
            HandshakeResult::ConnectionClosed => {
                tracing::warn!(?end, "connection closed during handshake");
                Some(Error::ConnectionClosed)
            }
        };
        if let Some(error) = failure {
            return Err(HandshakeError::recover(error, transport, Some(response)));
        }

        if let Err(e) = transport.set_poll_interval(None) {
            return Err(HandshakeError::recover(e.into(), transport, Some(response)));
        }
        let transport = match Arc::try_unwrap(transport) {
            Ok(transport) => transport,
            Err(_) => {
                return Err(HandshakeError {
                    error: Error::Internal("transport still shared after handshake"),
                    transport: None,
                    response: Some(response),
                });
            }
        };

        tracing::debug!(?end, trailing = response.trailing.len(), "upgrade complete");

        Ok(Upgraded {
            transport,
            end,
            headers: response.headers,
            trailing: response.trailing,
        })
    }
}

/// Role-specific send and wait
fn exchange<T: Transport>(
    transport: &T,
    end: ConnectionEnd,
    request: Option<&UpgradeRequest>,
    config: &Config,
    rx: &Receiver<Result<HandshakeResponse>>,
    reader: JoinHandle<()>,
    cancel: &AtomicBool,
) -> Result<HandshakeResponse> {
    match (end, request) {
        (ConnectionEnd::Initiator, Some(request)) => {
            let bytes = request.encode(config);
            if let Err(e) = transport.send_all(&bytes) {
                cancel.store(true, Ordering::Release);
                return Err(e.into());
            }
            tracing::debug!(
                path = request.path(),
                host = request.host(),
                "upgrade request sent"
            );

            await_response(rx, reader, cancel, config.timeout)
        }
        (ConnectionEnd::Acceptor, _) => {
            let response = await_response(rx, reader, cancel, config.timeout)?;
            if response.result == HandshakeResult::Upgrade {
                transport.send_all(&build_response(config))?;
                tracing::debug!("switching protocols reply sent");
            }
            Ok(response)
        }
        (ConnectionEnd::Initiator, None) => {
            cancel.store(true, Ordering::Release);
            Err(Error::Internal("initiator without an upgrade request"))
        }
    }
}

/// Start the background reader; it sends exactly one result
fn spawn_reader<T: Transport>(
    transport: &Arc<T>,
    end: ConnectionEnd,
    config: &Config,
    cancel: &Arc<AtomicBool>,
) -> Result<(JoinHandle<()>, Receiver<Result<HandshakeResponse>>)> {
    let (tx, rx) = crossbeam_channel::bounded(1);

    let transport = Arc::clone(transport);
    let cancel = Arc::clone(cancel);
    let config = config.clone();

    let handle = thread::Builder::new()
        .name("h2c-upgrade-reader".to_string())
        .spawn(move || {
            let result = read_handshake(&*transport, end, &config, &cancel);
            if let Err(e) = &result {
                if !cancel.load(Ordering::Acquire) {
                    tracing::error!(?end, error = %e, "handshake reader failed");
                }
            }
            // release our handle on the transport before signalling
            drop(transport);
            let _ = tx.send(result);
        })
        .map_err(Error::Io)?;

    Ok((handle, rx))
}

/// Wait for the reader's result
///
/// On timeout the reader is cancelled and left to exit on its own. Once a
/// result has arrived the reader has nothing left to do, so it is joined.
fn await_response(
    rx: &Receiver<Result<HandshakeResponse>>,
    reader: JoinHandle<()>,
    cancel: &AtomicBool,
    timeout: Duration,
) -> Result<HandshakeResponse> {
    match rx.recv_timeout(timeout) {
        Ok(result) => {
            reader
                .join()
                .map_err(|_| Error::Internal("handshake reader panicked"))?;
            result
        }
        Err(RecvTimeoutError::Timeout) => {
            cancel.store(true, Ordering::Release);
            tracing::warn!(?timeout, "handshake timed out");
            Err(Error::Timeout)
        }
        Err(RecvTimeoutError::Disconnected) => {
            let _ = reader.join();
            Err(Error::Internal("handshake reader exited without a result"))
        }
    }
}

/// A failed upgrade attempt
///
/// Carries the transport back to the caller when the background reader has
/// released it. That is the case for every outcome except a timeout or a
/// failed send, where the reader may still be parked in a receive. The
/// peer's message, when one was read, comes along too.
pub struct HandshakeError<T> {
    error: Error,
    transport: Option<T>,
    response: Option<HandshakeResponse>,
}

impl<T: Transport> HandshakeError<T> {
    /// Take the transport back if nothing else holds it
    fn recover(error: Error, transport: Arc<T>, response: Option<HandshakeResponse>) -> Self {
        let transport = Arc::try_unwrap(transport).ok();
        if let Some(transport) = &transport {
            if let Err(e) = transport.set_poll_interval(None) {
                tracing::debug!(error = %e, "failed to restore blocking receives");
            }
        }
        Self {
            error,
            transport,
            response,
        }
    }
}

impl<T> HandshakeError<T> {
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// The transport, unless a reader thread still holds it
    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    /// The peer's header block and trailing bytes, if one was read
    pub fn response(&self) -> Option<&HandshakeResponse> {
        self.response.as_ref()
    }

    pub fn into_error(self) -> Error {
        self.error
    }

    /// Split into error, transport and peer message
    pub fn into_parts(self) -> (Error, Option<T>, Option<HandshakeResponse>) {
        (self.error, self.transport, self.response)
    }
}

impl<T> fmt::Debug for HandshakeError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeError")
            .field("error", &self.error)
            .field("transport", &self.transport.is_some())
            .field("response", &self.response)
            .finish()
    }
}

impl<T> fmt::Display for HandshakeError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<T> std::error::Error for HandshakeError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl<T> From<HandshakeError<T>> for Error {
    fn from(err: HandshakeError<T>) -> Self {
        err.error
    }
}

/// A connection that completed the upgrade
#[derive(Debug)]
pub struct Upgraded<T> {
    transport: T,
    end: ConnectionEnd,
    headers: PseudoHeaders,
    trailing: Bytes,
}

impl<T> Upgraded<T> {
    pub fn end(&self) -> ConnectionEnd {
        self.end
    }

    /// Pseudo-headers sent by the initiator (empty on the initiator side)
    pub fn headers(&self) -> &PseudoHeaders {
        &self.headers
    }

    /// Bytes the peer sent after its header block
    ///
    /// Binary protocol processing must start here before reading the
    /// transport again.
    pub fn trailing(&self) -> &Bytes {
        &self.trailing
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Split into transport, pseudo-headers and trailing bytes
    pub fn into_parts(self) -> (T, PseudoHeaders, Bytes) {
        (self.transport, self.headers, self.trailing)
    }
}
