// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Protocol-typed acceptor facade.

use std::marker::PhantomData;
use std::sync::Arc;

use rill_rt::error::Result;
use rill_rt::executor::IoExecutor;

use crate::endpoint::Endpoint;
use crate::option::{ReuseAddr, SocketOption};
use crate::proto::Protocol;
use crate::socket::acceptor::AcceptorImpl;
use crate::stream::StreamSocket;

/// A listening socket producing connected [`StreamSocket`]s.
///
/// Cheap to clone; clones share the listener. Concurrent `accept` calls
/// are served first-in first-out.
pub struct Acceptor<P: Protocol> {
    imp: Arc<AcceptorImpl>,
    _p: PhantomData<P>,
}

impl<P: Protocol> Clone for Acceptor<P> {
    fn clone(&self) -> Self {
        Acceptor {
            imp: self.imp.clone(),
            _p: PhantomData,
        }
    }
}

impl<P: Protocol> Acceptor<P> {
    pub fn new(ex: &IoExecutor) -> Self {
        Acceptor {
            imp: Arc::new(AcceptorImpl::new(ex.clone())),
            _p: PhantomData,
        }
    }

    /// Open, set SO_REUSEADDR, bind, and listen in one step.
    pub fn bind(ex: &IoExecutor, ep: &P::Endpoint, backlog: i32) -> Result<Self> {
        let acc = Acceptor::new(ex);
        acc.imp.open(ep.family())?;
        acc.imp.set_option(&ReuseAddr::from(true))?;
        acc.imp.bind(&ep.to_native())?;
        acc.imp.listen(backlog)?;
        Ok(acc)
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

    pub fn is_listening(&self) -> bool {
        self.imp.is_listening()
    }

    pub fn open(&self, ep: &P::Endpoint) -> Result<()> {
        self.imp.open(ep.family())
    }

    pub fn bind_endpoint(&self, ep: &P::Endpoint) -> Result<()> {
        self.imp.bind(&ep.to_native())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.imp.listen(backlog)
    }

    /// Accept the next connection as a connected stream socket.
    pub async fn accept(&self) -> Result<StreamSocket<P>> {
        let fd = self.imp.accept().await?;
        match StreamSocket::from_fd(self.imp.executor(), fd) {
            Ok(sock) => Ok(sock),
            Err(e) => {
                unsafe { libc::close(fd) };
                Err(e)
            }
        }
    }

    /// Abort the active accept and poison queued ones.
    pub fn cancel(&self) {
        self.imp.cancel();
    }

    pub fn cancel_read(&self) {
        self.imp.cancel_read();
    }

    pub fn close(&self) {
        self.imp.close();
    }

    /// Bound endpoint; reports the real port after an ephemeral bind.
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
