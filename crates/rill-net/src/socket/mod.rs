// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fd-owning socket state machines (protocol-agnostic).

pub(crate) mod acceptor;
pub(crate) mod base;
pub(crate) mod datagram;
pub(crate) mod stream;
