// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Protocol-typed datagram socket facade.

use std::marker::PhantomData;
use std::sync::Arc;

use rill_rt::error::Result;
use rill_rt::executor::IoExecutor;

use crate::endpoint::Endpoint;
use crate::option::SocketOption;
use crate::proto::Protocol;
use crate::socket::datagram::DatagramSocketImpl;

/// A message-oriented socket.
///
/// Cheap to clone; clones share the underlying socket. Send and receive
/// sides each admit one in-flight operation.
pub struct DatagramSocket<P: Protocol> {
    imp: Arc<DatagramSocketImpl>,
    _p: PhantomData<P>,
}

impl<P: Protocol> Clone for DatagramSocket<P> {
    fn clone(&self) -> Self {
        DatagramSocket {
            imp: self.imp.clone(),
            _p: PhantomData,
        }
    }
}

impl<P: Protocol> DatagramSocket<P> {
    pub fn new(ex: &IoExecutor) -> Self {
        DatagramSocket {
            imp: Arc::new(DatagramSocketImpl::new(ex.clone())),
            _p: PhantomData,
        }
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

    pub fn is_bound(&self) -> bool {
        self.imp.is_bound()
    }

    pub fn is_connected(&self) -> bool {
        self.imp.is_connected()
    }

    /// Open without binding; the socket is idle (cannot receive).
    pub fn open(&self, ep: &P::Endpoint) -> Result<()> {
        self.imp.open(ep.family(), P::SOCK_TYPE, P::PROTOCOL)
    }

    /// Bind to a local endpoint (opens the socket if needed).
    pub fn bind(&self, ep: &P::Endpoint) -> Result<()> {
        self.imp.bind(&ep.to_native())
    }

    /// Fix the remote peer; `send_to` destinations must then match it.
    pub fn connect(&self, ep: &P::Endpoint) -> Result<()> {
        self.imp.connect(&ep.to_native())
    }

    /// Send one datagram to `dest` (or to the connected peer when `None`).
    pub async fn send_to(&self, buf: &[u8], dest: Option<&P::Endpoint>) -> Result<usize> {
        let native = dest.map(|d| d.to_native());
        self.imp.send_to(buf, native.as_ref()).await
    }

    /// Receive one datagram; returns the byte count and source endpoint.
    pub async fn receive_from(&self, buf: &mut [u8]) -> Result<(usize, P::Endpoint)> {
        let (n, src) = self.imp.receive_from(buf).await?;
        Ok((n, P::Endpoint::from_native(&src)?))
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

    pub fn close(&self) {
        self.imp.close();
    }

    pub fn local_endpoint(&self) -> Result<P::Endpoint> {
        P::Endpoint::from_native(&self.imp.local_native()?)
    }

    pub fn set_option<O: SocketOption>(&self, opt: &O) -> Result<()> {
        self.imp.set_option(opt)
    }

    pub fn get_option<O: SocketOption>(&self, opt: &mut O) -> Result<()> {
        self.imp.get_option(opt)
    }
}
