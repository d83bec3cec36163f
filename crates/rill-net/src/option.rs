// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Typed socket options for getsockopt/setsockopt.

/// A socket option viewable as raw level/name/data.
pub trait SocketOption {
    fn level(&self) -> libc::c_int;
    fn name(&self) -> libc::c_int;
    fn data(&self) -> *const libc::c_void;
    fn data_mut(&mut self) -> *mut libc::c_void;
    fn size(&self) -> libc::socklen_t;
}

macro_rules! int_option {
    ($(#[$doc:meta])* $ty:ident, $level:expr, $name:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $ty {
            value: libc::c_int,
        }

        impl $ty {
            pub fn new(value: i32) -> Self {
                $ty { value }
            }

            pub fn value(&self) -> i32 {
                self.value
            }
        }

        impl From<bool> for $ty {
            fn from(on: bool) -> Self {
                $ty {
                    value: libc::c_int::from(on),
                }
            }
        }

        impl SocketOption for $ty {
            fn level(&self) -> libc::c_int {
                $level
            }
            fn name(&self) -> libc::c_int {
                $name
            }
            fn data(&self) -> *const libc::c_void {
                &self.value as *const _ as *const libc::c_void
            }
            fn data_mut(&mut self) -> *mut libc::c_void {
                &mut self.value as *mut _ as *mut libc::c_void
            }
            fn size(&self) -> libc::socklen_t {
                std::mem::size_of::<libc::c_int>() as libc::socklen_t
            }
        }
    };
}

int_option!(
    /// SO_REUSEADDR.
    ReuseAddr,
    libc::SOL_SOCKET,
    libc::SO_REUSEADDR
);
int_option!(
    /// SO_KEEPALIVE.
    KeepAlive,
    libc::SOL_SOCKET,
    libc::SO_KEEPALIVE
);
int_option!(
    /// SO_RCVBUF.
    RecvBufferSize,
    libc::SOL_SOCKET,
    libc::SO_RCVBUF
);
int_option!(
    /// SO_SNDBUF.
    SendBufferSize,
    libc::SOL_SOCKET,
    libc::SO_SNDBUF
);
int_option!(
    /// TCP_NODELAY.
    TcpNoDelay,
    libc::IPPROTO_TCP,
    libc::TCP_NODELAY
);

/// SO_LINGER.
#[derive(Debug, Clone, Copy)]
pub struct Linger {
    value: libc::linger,
}

impl Linger {
    pub fn new(enabled: bool, seconds: i32) -> Self {
        Linger {
            value: libc::linger {
                l_onoff: libc::c_int::from(enabled),
                l_linger: seconds,
            },
        }
    }

    pub fn enabled(&self) -> bool {
        self.value.l_onoff != 0
    }

    pub fn seconds(&self) -> i32 {
        self.value.l_linger
    }
}

impl Default for Linger {
    fn default() -> Self {
        Linger::new(false, 0)
    }
}

impl SocketOption for Linger {
    fn level(&self) -> libc::c_int {
        libc::SOL_SOCKET
    }
    fn name(&self) -> libc::c_int {
        libc::SO_LINGER
    }
    fn data(&self) -> *const libc::c_void {
        &self.value as *const _ as *const libc::c_void
    }
    fn data_mut(&mut self) -> *mut libc::c_void {
        &mut self.value as *mut _ as *mut libc::c_void
    }
    fn size(&self) -> libc::socklen_t {
        std::mem::size_of::<libc::linger>() as libc::socklen_t
    }
}
