//! # h2c-upgrade: HTTP/1.1 to HTTP/2 upgrade handshake
//!
//! Negotiates the switch from a text HTTP/1.1 connection to the binary,
//! multiplexed framing layer and provides the frame envelope that every
//! binary frame shares.
//!
//! ## Pieces
//!
//! - **Frame envelope**: zero-copy views over wire bytes and owned outgoing
//!   buffers, plus the window-update frame variant
//! - **Upgrade handshake**: role-aware request/response exchange with a
//!   background reader, a hard timeout and cooperative cancellation
//! - **Transport**: the minimal send/receive seam the handshake runs over,
//!   implemented for [`std::net::TcpStream`]
//!
//! ## Example
//!
//! ```no_run
//! use std::net::TcpStream;
//! use h2c_upgrade::{Config, PseudoHeaders, UpgradeHandshaker};
//!
//! let stream = TcpStream::connect("127.0.0.1:8080")?;
//! let headers = PseudoHeaders::from_iter([
//!     (":path", "/"),
//!     (":host", "127.0.0.1"),
//!     (":version", "2"),
//! ]);
//!
//! let upgraded = UpgradeHandshaker::initiator(stream, headers, Config::default())?
//!     .handshake()?;
//! let (stream, _headers, trailing) = upgraded.into_parts();
//! // continue with binary frames, starting from `trailing`
//! # let _ = (stream, trailing);
//! # Ok::<(), h2c_upgrade::Error>(())
//! ```

use std::time::Duration;

pub mod error;
pub mod frame;
pub mod handshake;
pub mod headers;
pub mod transport;
pub mod upgrade;

pub use error::{Error, Result};
pub use frame::{Frame, FrameType, StreamId, WindowUpdateFrame};
pub use handshake::{ConnectionEnd, HandshakeResponse, HandshakeResult};
pub use headers::PseudoHeaders;
pub use transport::Transport;
pub use upgrade::{HandshakeError, UpgradeHandshaker, Upgraded};

/// Frame preamble size (3 length + 1 type + 1 flags + 4 stream id)
pub const FRAME_PREAMBLE_SIZE: usize = 9;

/// Largest payload the 24-bit length field can describe
pub const MAX_PAYLOAD_LENGTH: usize = (1 << 24) - 1;

/// Default cap on the HTTP/1.1 handshake message, terminator included
pub const HANDSHAKE_SIZE_LIMIT: usize = 4096;

/// Default deadline for the whole handshake exchange
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default upgrade protocol token
pub const UPGRADE_PROTOCOL: &str = "HTTP-draft-04/2.0";

/// Default name of the header carrying the encoded pseudo-headers
pub const SETTINGS_HEADER: &str = "HTTP2-Settings";

/// Shortest receive poll the reader will use
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// End of the HTTP/1.1 header block
pub const CRLFCRLF: &[u8; 4] = b"\r\n\r\n";

/// Configuration for one upgrade handshake
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use h2c_upgrade::Config;
///
/// let config = Config::builder()
///     .timeout(Duration::from_secs(5))
///     .size_limit(8 * 1024)
///     .build();
/// assert_eq!(config.protocol, "HTTP-draft-04/2.0");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Deadline for the peer's message (default: 60s)
    pub timeout: Duration,
    /// Maximum size of the peer's header block (default: 4KB)
    pub size_limit: usize,
    /// Token sent and expected in the `Upgrade` header
    pub protocol: String,
    /// Header carrying the Base64 pseudo-header blob
    pub settings_header: String,
    /// How long a single receive may block before the reader checks
    /// for cancellation (default: 100ms)
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: HANDSHAKE_TIMEOUT,
            size_limit: HANDSHAKE_SIZE_LIMIT,
            protocol: UPGRADE_PROTOCOL.to_string(),
            settings_header: SETTINGS_HEADER.to_string(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Poll interval actually applied to the transport
    ///
    /// Never below [`MIN_POLL_INTERVAL`]; transports treat zero as "block
    /// forever" or reject it outright.
    pub fn effective_poll_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }
}

/// Builder for handshake configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the handshake deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the header block size limit
    pub fn size_limit(mut self, size: usize) -> Self {
        self.config.size_limit = size;
        self
    }

    /// Set the upgrade protocol token
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.config.protocol = protocol.into();
        self
    }

    /// Set the settings header name
    pub fn settings_header(mut self, name: impl Into<String>) -> Self {
        self.config.settings_header = name.into();
        self
    }

    /// Set the cancellation poll interval
    ///
    /// A zero interval is bumped to [`MIN_POLL_INTERVAL`].
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::error::{Error, Result};
    pub use crate::frame::{Frame, FrameType, WindowUpdateFrame};
    pub use crate::handshake::ConnectionEnd;
    pub use crate::headers::PseudoHeaders;
    pub use crate::transport::Transport;
    pub use crate::upgrade::{HandshakeError, UpgradeHandshaker, Upgraded};
}
