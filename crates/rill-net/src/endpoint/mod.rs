// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Endpoint types and native sockaddr views.
//!
//! The socket layer below the facades speaks only `SockAddr` (a sized view
//! of `sockaddr_storage`); protocol-typed endpoints convert to and from it.

pub mod ip;
pub mod local;

use rill_rt::error::Result;

/// A native socket address: storage plus the significant length.
#[derive(Clone, Copy)]
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddr {
    /// Zeroed storage with the full capacity as length; used as an
    /// out-parameter for `recvfrom`/`getsockname`/`accept`.
    pub fn zeroed() -> Self {
        SockAddr {
            storage: unsafe { std::mem::zeroed() },
            len: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    /// # Safety
    /// The first `len` bytes of `storage` must hold a valid address of the
    /// family recorded in `ss_family`.
    pub unsafe fn from_raw(storage: libc::sockaddr_storage, len: libc::socklen_t) -> Self {
        SockAddr { storage, len }
    }

    pub fn family(&self) -> libc::c_int {
        self.storage.ss_family as libc::c_int
    }

    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn set_len(&mut self, len: libc::socklen_t) {
        self.len = len;
    }

    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }

    pub fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        &mut self.storage as *mut _ as *mut libc::sockaddr
    }

    pub(crate) fn storage(&self) -> &libc::sockaddr_storage {
        &self.storage
    }

    fn bytes(&self) -> &[u8] {
        let p = &self.storage as *const _ as *const u8;
        let n = (self.len as usize).min(std::mem::size_of::<libc::sockaddr_storage>());
        unsafe { std::slice::from_raw_parts(p, n) }
    }
}

impl PartialEq for SockAddr {
    /// Bitwise over the significant length — the comparison the datagram
    /// layer uses to validate `send_to` destinations on connected sockets.
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.bytes() == other.bytes()
    }
}

impl Eq for SockAddr {}

impl std::fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SockAddr")
            .field("family", &self.family())
            .field("len", &self.len)
            .finish()
    }
}

/// Protocol-typed endpoint convertible to and from a native address.
pub trait Endpoint: Sized + Clone + Send + Sync + 'static {
    fn family(&self) -> libc::c_int;
    fn to_native(&self) -> SockAddr;
    fn from_native(addr: &SockAddr) -> Result<Self>;
}
