// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stream io helpers.
//!
//! `read_until` accumulates bytes up to a delimiter. The timeout helpers
//! wrap [`with_timeout`] with the matching per-direction cancel hook.

use std::future::Future;
use std::time::Duration;

use rill_rt::combinators::with_timeout;
use rill_rt::error::{ErrorKind, Result};

use crate::acceptor::Acceptor;
use crate::datagram::DatagramSocket;
use crate::proto::Protocol;
use crate::stream::StreamSocket;

/// Read until `delim` appears in `buf`, appending as needed.
///
/// Returns the number of bytes of `buf` up to and including the first
/// delimiter. Bytes already in `buf` are searched first; bytes past the
/// delimiter may remain in `buf` from the final chunk. EOF before the
/// delimiter is `Err(Eof)`.
pub async fn read_until<P: Protocol>(
    sock: &StreamSocket<P>,
    buf: &mut Vec<u8>,
    delim: u8,
) -> Result<usize> {
    let mut searched = 0;
    loop {
        if let Some(pos) = buf[searched..].iter().position(|b| *b == delim) {
            return Ok(searched + pos + 1);
        }
        searched = buf.len();

        let mut chunk = [0u8; 256];
        let n = sock.read_some(&mut chunk).await?;
        if n == 0 {
            return Err(ErrorKind::Eof);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Write the whole buffer, looping over short writes.
pub async fn write_all<P: Protocol>(sock: &StreamSocket<P>, data: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        written += sock.write_some(&data[written..]).await?;
    }
    Ok(())
}

/// A socket whose read side can be cancelled from another task.
pub trait CancelRead: Clone + Send + 'static {
    fn cancel_read(&self);
}

/// A socket whose write side can be cancelled from another task.
pub trait CancelWrite: Clone + Send + 'static {
    fn cancel_write(&self);
}

impl<P: Protocol> CancelRead for StreamSocket<P> {
    fn cancel_read(&self) {
        StreamSocket::cancel_read(self);
    }
}

impl<P: Protocol> CancelWrite for StreamSocket<P> {
    fn cancel_write(&self) {
        StreamSocket::cancel_write(self);
    }
}

impl<P: Protocol> CancelRead for DatagramSocket<P> {
    fn cancel_read(&self) {
        DatagramSocket::cancel_read(self);
    }
}

impl<P: Protocol> CancelWrite for DatagramSocket<P> {
    fn cancel_write(&self) {
        DatagramSocket::cancel_write(self);
    }
}

impl<P: Protocol> CancelRead for Acceptor<P> {
    fn cancel_read(&self) {
        Acceptor::cancel_read(self);
    }
}

/// `with_timeout` that cancels the read side on expiry.
pub async fn with_timeout_read<S, F, T>(sock: &S, op: F, timeout: Duration) -> Result<T>
where
    S: CancelRead,
    F: Future<Output = Result<T>>,
{
    let s = sock.clone();
    with_timeout(op, timeout, move || s.cancel_read()).await
}

/// `with_timeout` that cancels the write side on expiry.
pub async fn with_timeout_write<S, F, T>(sock: &S, op: F, timeout: Duration) -> Result<T>
where
    S: CancelWrite,
    F: Future<Output = Result<T>>,
{
    let s = sock.clone();
    with_timeout(op, timeout, move || s.cancel_write()).await
}
