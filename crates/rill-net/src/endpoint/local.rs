// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Unix-domain endpoints.
//!
//! Filesystem paths and Linux abstract names (leading NUL). Unnamed
//! endpoints (as returned for an unbound peer) carry an empty name.

use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use rill_rt::error::{ErrorKind, Result};

use super::{Endpoint, SockAddr};

fn sun_path_offset() -> usize {
    // offset of sun_path within sockaddr_un
    std::mem::size_of::<libc::sa_family_t>()
}

fn sun_path_capacity() -> usize {
    std::mem::size_of::<libc::sockaddr_un>() - sun_path_offset()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Name {
    Unnamed,
    Path(Vec<u8>),
    Abstract(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalEndpoint {
    name: Name,
}

impl LocalEndpoint {
    /// Endpoint at a filesystem path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = path.as_ref().as_os_str().as_bytes().to_vec();
        if bytes.is_empty() || bytes.contains(&0) {
            return Err(ErrorKind::InvalidEndpoint);
        }
        // NUL terminator must also fit.
        if bytes.len() + 1 > sun_path_capacity() {
            return Err(ErrorKind::InvalidEndpoint);
        }
        Ok(LocalEndpoint {
            name: Name::Path(bytes),
        })
    }

    /// Linux abstract-namespace endpoint (no filesystem presence).
    pub fn abstract_name(name: &[u8]) -> Result<Self> {
        if name.is_empty() || name.len() + 1 > sun_path_capacity() {
            return Err(ErrorKind::InvalidEndpoint);
        }
        Ok(LocalEndpoint {
            name: Name::Abstract(name.to_vec()),
        })
    }

    pub fn unnamed() -> Self {
        LocalEndpoint { name: Name::Unnamed }
    }

    pub fn is_unnamed(&self) -> bool {
        matches!(self.name, Name::Unnamed)
    }

    pub fn is_abstract(&self) -> bool {
        matches!(self.name, Name::Abstract(_))
    }

    /// Filesystem path, when this is a path endpoint.
    pub fn as_path(&self) -> Option<&Path> {
        match &self.name {
            Name::Path(p) => Some(Path::new(std::ffi::OsStr::from_bytes(p))),
            _ => None,
        }
    }
}

impl std::fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Name::Unnamed => write!(f, "<unnamed>"),
            Name::Path(p) => write!(f, "{}", String::from_utf8_lossy(p)),
            Name::Abstract(n) => write!(f, "@{}", String::from_utf8_lossy(n)),
        }
    }
}

impl Endpoint for LocalEndpoint {
    fn family(&self) -> libc::c_int {
        libc::AF_UNIX
    }

    fn to_native(&self) -> SockAddr {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let sun = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_un) };
        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;

        let len = match &self.name {
            Name::Unnamed => sun_path_offset(),
            Name::Path(p) => {
                for (i, b) in p.iter().enumerate() {
                    sun.sun_path[i] = *b as libc::c_char;
                }
                // NUL-terminated; length excludes the terminator.
                sun_path_offset() + p.len() + 1
            }
            Name::Abstract(n) => {
                sun.sun_path[0] = 0;
                for (i, b) in n.iter().enumerate() {
                    sun.sun_path[i + 1] = *b as libc::c_char;
                }
                sun_path_offset() + 1 + n.len()
            }
        };
        unsafe { SockAddr::from_raw(storage, len as libc::socklen_t) }
    }

    fn from_native(addr: &SockAddr) -> Result<Self> {
        if addr.family() != libc::AF_UNIX {
            return Err(ErrorKind::UnsupportedAddressFamily);
        }
        let len = addr.len() as usize;
        if len < sun_path_offset() {
            return Err(ErrorKind::InvalidEndpoint);
        }
        let path_len = len - sun_path_offset();
        if path_len == 0 {
            return Ok(LocalEndpoint::unnamed());
        }

        let sun = unsafe { &*(addr.storage() as *const _ as *const libc::sockaddr_un) };
        let raw: Vec<u8> = sun.sun_path[..path_len.min(sun_path_capacity())]
            .iter()
            .map(|c| *c as u8)
            .collect();

        if raw[0] == 0 {
            Ok(LocalEndpoint {
                name: Name::Abstract(raw[1..].to_vec()),
            })
        } else {
            // Trim the NUL terminator if the kernel included it.
            let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
            Ok(LocalEndpoint {
                name: Name::Path(raw[..end].to_vec()),
            })
        }
    }
}
