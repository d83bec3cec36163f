// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Protocol-typed stream socket facade.

use std::marker::PhantomData;
use std::sync::Arc;

use rill_rt::error::Result;
use rill_rt::executor::IoExecutor;

use crate::endpoint::Endpoint;
use crate::option::SocketOption;
use crate::proto::Protocol;
use crate::socket::stream::StreamSocketImpl;

pub use crate::socket::stream::ShutdownHow;

/// A connected (or connectable) stream socket.
///
/// Cheap to clone; clones share the underlying socket. At most one read,
/// one write, and one connect may be in flight across all clones.
pub struct StreamSocket<P: Protocol> {
    imp: Arc<StreamSocketImpl>,
    _p: PhantomData<P>,
}

impl<P: Protocol> Clone for StreamSocket<P> {
    fn clone(&self) -> Self {
        StreamSocket {
            imp: self.imp.clone(),
            _p: PhantomData,
        }
    }
}

impl<P: Protocol> StreamSocket<P> {
    pub fn new(ex: &IoExecutor) -> Self {
        StreamSocket {
            imp: Arc::new(StreamSocketImpl::new(ex.clone())),
            _p: PhantomData,
        }
    }

    /// Wrap an already-connected fd (acceptor path).
    pub(crate) fn from_fd(ex: &IoExecutor, fd: i32) -> Result<Self> {
        let sock = StreamSocket::new(ex);
        sock.imp.assign(fd)?;
        Ok(sock)
    }

    pub fn executor(&self) -> &IoExecutor {
        self.imp.executor()
    }

    pub fn native_handle(&self) -> i32 {
        self.imp.native_handle()
    }

    pub fn is_open(&self) -> bool {
        self.imp.is_open()
    }

    pub fn is_connected(&self) -> bool {
        self.imp.is_connected()
    }

    pub fn bind(&self, ep: &P::Endpoint) -> Result<()> {
        self.imp.bind(&ep.to_native())
    }

    pub async fn connect(&self, ep: &P::Endpoint) -> Result<()> {
        self.imp.connect(&ep.to_native()).await
    }

    /// Read at most `buf.len()` bytes; `Ok(0)` is EOF.
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        self.imp.read_some(buf).await
    }

    /// Write at most `buf.len()` bytes.
    pub async fn write_some(&self, buf: &[u8]) -> Result<usize> {
        self.imp.write_some(buf).await
    }

    pub fn shutdown(&self, how: ShutdownHow) -> Result<()> {
        self.imp.shutdown(how)
    }

    pub fn cancel(&self) {
        self.imp.cancel();
    }

    pub fn cancel_read(&self) {
        self.imp.cancel_read();
    }

    pub fn cancel_write(&self) {
        self.imp.cancel_write();
    }

    pub fn cancel_connect(&self) {
        self.imp.cancel_connect();
    }

    /// Close; in-flight operations resume with `OperationAborted`.
    pub fn close(&self) {
        self.imp.close();
    }

    pub fn local_endpoint(&self) -> Result<P::Endpoint> {
        P::Endpoint::from_native(&self.imp.local_native()?)
    }

    pub fn remote_endpoint(&self) -> Result<P::Endpoint> {
        P::Endpoint::from_native(&self.imp.remote_native()?)
    }

    pub fn set_option<O: SocketOption>(&self, opt: &O) -> Result<()> {
        self.imp.set_option(opt)
    }

    pub fn get_option<O: SocketOption>(&self, opt: &mut O) -> Result<()> {
        self.imp.get_option(opt)
    }
}
