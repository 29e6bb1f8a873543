//! Transport seam for the upgrade handshake
//!
//! The handshake only needs to send bytes and receive bytes, and it does
//! both at once: the orchestrating thread sends while a background reader
//! receives. Transports therefore take `&self` for both directions, the
//! way `&TcpStream` implements both `Read` and `Write`.
//!
//! # Example
//!
//! ```no_run
//! use std::net::TcpStream;
//! use h2c_upgrade::Transport;
//!
//! let stream = TcpStream::connect("127.0.0.1:8080")?;
//! stream.send_all(b"GET / HTTP/1.1\r\n\r\n")?;
//! # Ok::<(), std::io::Error>(())
//! ```

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Byte transport the handshake runs over
///
/// `receive` returning `Ok(0)` or a hard error means the connection is
/// closed. `WouldBlock`, `TimedOut` and `Interrupted` mean "nothing yet";
/// the reader checks for cancellation and tries again.
pub trait Transport: Send + Sync + 'static {
    /// Send some of `data`, returning how many bytes were taken
    fn send(&self, data: &[u8]) -> io::Result<usize>;

    /// Receive into `buf`, returning how many bytes were written
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Bound how long one `receive` may block
    ///
    /// `None` restores fully blocking receives. Transports that never block
    /// for long can keep the default no-op.
    fn set_poll_interval(&self, interval: Option<Duration>) -> io::Result<()> {
        let _ = interval;
        Ok(())
    }

    /// Send all of `data`
    fn send_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match self.send(data) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport accepted no bytes",
                    ));
                }
                Ok(n) => data = &data[n.min(data.len())..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Errors that mean "try again" rather than "closed"
#[inline]
pub(crate) fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

impl Transport for TcpStream {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.write(data)
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.read(buf)
    }

    fn set_poll_interval(&self, interval: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(interval)
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.write(data)
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.read(buf)
    }

    fn set_poll_interval(&self, interval: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(interval)
    }
}
