//! Shared helpers for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::thread;
use std::time::Duration;

use h2c_upgrade::{HandshakeError, Transport, Upgraded};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once; RUST_LOG controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Unwrap a handshake that is expected to fail
pub fn expect_failure<T>(result: Result<Upgraded<T>, HandshakeError<T>>) -> HandshakeError<T> {
    match result {
        Ok(_) => panic!("handshake unexpectedly upgraded"),
        Err(e) => e,
    }
}

/// In-memory transport that hands out pre-scripted chunks
///
/// Each `receive` returns at most one chunk. Once the script runs dry the
/// transport either reports closure or keeps saying "nothing yet".
pub struct ScriptedTransport {
    chunks: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<u8>>,
    close_when_empty: bool,
}

impl ScriptedTransport {
    pub fn new(chunks: impl IntoIterator<Item = Vec<u8>>, close_when_empty: bool) -> Self {
        Self {
            chunks: Mutex::new(chunks.into_iter().filter(|c| !c.is_empty()).collect()),
            sent: Mutex::new(Vec::new()),
            close_when_empty,
        }
    }

    /// Deliver `data` in chunks of `size` bytes
    pub fn chunked(data: &[u8], size: usize, close_when_empty: bool) -> Self {
        Self::new(data.chunks(size).map(<[u8]>::to_vec), close_when_empty)
    }

    /// Peer that never sends anything and never closes
    pub fn silent() -> Self {
        Self::new(Vec::new(), false)
    }

    pub fn sent(&self) -> Vec<u8> {
        self.sent.lock().clone()
    }

    /// Bytes still waiting to be received
    pub fn remaining(&self) -> Vec<u8> {
        self.chunks.lock().iter().flatten().copied().collect()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.sent.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut chunks = self.chunks.lock();
        match chunks.front_mut() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                chunk.drain(..n);
                if chunk.is_empty() {
                    chunks.pop_front();
                }
                Ok(n)
            }
            None if self.close_when_empty => Ok(0),
            None => {
                drop(chunks);
                thread::sleep(Duration::from_millis(5));
                Err(io::ErrorKind::WouldBlock.into())
            }
        }
    }
}
