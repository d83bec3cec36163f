// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-fd pending-operation slots.
//!
//! Each known fd has two independent slots (read, write), each holding at
//! most one reactor op plus a monotonically-increasing token. Cancellation
//! matches on `(fd, kind, token)` so a stale cancel request issued against a
//! prior registration never removes a newer op that reused the slot.
//!
//! Accesses are serialized by the reactor's registry mutex; the struct
//! itself carries no locking.

use crate::reactor::op::OpBox;

/// Sentinel for "no registration".
pub const INVALID_TOKEN: u64 = 0;

/// Which direction a slot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdEventKind {
    Read,
    Write,
}

/// Backend interest derived from the non-empty slots of one fd.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FdInterest {
    pub want_read: bool,
    pub want_write: bool,
}

impl FdInterest {
    pub fn any(self) -> bool {
        self.want_read || self.want_write
    }
}

#[derive(Default)]
struct FdOps {
    read_op: Option<OpBox>,
    write_op: Option<OpBox>,
    read_token: u64,
    write_token: u64,
}

impl FdOps {
    fn interest(&self) -> FdInterest {
        FdInterest {
            want_read: self.read_op.is_some(),
            want_write: self.write_op.is_some(),
        }
    }
}

pub struct RegisterResult {
    pub token: u64,
    /// Previous occupant of the slot, if any. The caller aborts it.
    pub replaced: Option<OpBox>,
    pub interest: FdInterest,
}

pub struct CancelResult {
    pub removed: Option<OpBox>,
    pub interest: FdInterest,
    pub matched: bool,
}

pub struct ReadyResult {
    pub read: Option<OpBox>,
    pub write: Option<OpBox>,
    pub interest: FdInterest,
}

pub struct DeregisterResult {
    pub read: Option<OpBox>,
    pub write: Option<OpBox>,
    pub had_any: bool,
}

/// Slot map indexed by fd value.
///
/// INVARIANT: `active_count` equals the number of occupied slots across all
/// fds; `max_active_fd` bounds the storage tail so the vector can be trimmed
/// after the highest registered fd goes quiet.
#[derive(Default)]
pub struct FdRegistry {
    slots: Vec<FdOps>,
    next_token: u64,
    active_count: usize,
    max_active_fd: usize,
}

impl FdRegistry {
    pub fn new() -> Self {
        FdRegistry {
            slots: Vec::new(),
            next_token: 1,
            active_count: 0,
            max_active_fd: 0,
        }
    }

    pub fn register_read(&mut self, fd: i32, op: OpBox) -> RegisterResult {
        self.register_impl(fd, op, FdEventKind::Read)
    }

    pub fn register_write(&mut self, fd: i32, op: OpBox) -> RegisterResult {
        self.register_impl(fd, op, FdEventKind::Write)
    }

    fn register_impl(&mut self, fd: i32, op: OpBox, kind: FdEventKind) -> RegisterResult {
        if fd < 0 {
            return RegisterResult {
                token: INVALID_TOKEN,
                replaced: Some(op),
                interest: FdInterest::default(),
            };
        }
        let idx = fd as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, FdOps::default);
        }

        let token = self.next_token;
        self.next_token += 1;

        let ops = &mut self.slots[idx];
        let (slot, tok_slot) = match kind {
            FdEventKind::Read => (&mut ops.read_op, &mut ops.read_token),
            FdEventKind::Write => (&mut ops.write_op, &mut ops.write_token),
        };
        let replaced = slot.replace(op);
        *tok_slot = token;

        if replaced.is_none() {
            self.active_count += 1;
            if idx > self.max_active_fd {
                self.max_active_fd = idx;
            }
        }

        RegisterResult {
            token,
            replaced,
            interest: self.slots[idx].interest(),
        }
    }

    /// Remove the `(fd, kind)` op iff its token still matches.
    pub fn cancel(&mut self, fd: i32, kind: FdEventKind, token: u64) -> CancelResult {
        if fd < 0 || fd as usize >= self.slots.len() || token == INVALID_TOKEN {
            return CancelResult {
                removed: None,
                interest: FdInterest::default(),
                matched: false,
            };
        }
        let idx = fd as usize;
        let ops = &mut self.slots[idx];
        let (slot, tok_slot) = match kind {
            FdEventKind::Read => (&mut ops.read_op, &mut ops.read_token),
            FdEventKind::Write => (&mut ops.write_op, &mut ops.write_token),
        };

        if slot.is_none() || *tok_slot != token {
            return CancelResult {
                removed: None,
                interest: FdInterest::default(),
                matched: false,
            };
        }

        let removed = slot.take();
        *tok_slot = INVALID_TOKEN;
        self.active_count -= 1;

        let interest = ops.interest();
        if idx == self.max_active_fd && !interest.any() {
            self.trim_tail(idx);
        }

        CancelResult {
            removed,
            interest,
            matched: true,
        }
    }

    /// Take whichever ops the readiness event covers.
    pub fn take_ready(&mut self, fd: i32, can_read: bool, can_write: bool) -> ReadyResult {
        if fd < 0 || fd as usize >= self.slots.len() {
            return ReadyResult {
                read: None,
                write: None,
                interest: FdInterest::default(),
            };
        }
        let idx = fd as usize;
        let ops = &mut self.slots[idx];

        let read = if can_read {
            ops.read_token = INVALID_TOKEN;
            ops.read_op.take()
        } else {
            None
        };
        let write = if can_write {
            ops.write_token = INVALID_TOKEN;
            ops.write_op.take()
        } else {
            None
        };
        self.active_count -= usize::from(read.is_some()) + usize::from(write.is_some());

        let interest = ops.interest();
        if idx == self.max_active_fd && !interest.any() {
            self.trim_tail(idx);
        }

        ReadyResult {
            read,
            write,
            interest,
        }
    }

    /// Clear both slots of an fd.
    pub fn deregister(&mut self, fd: i32) -> DeregisterResult {
        if fd < 0 || fd as usize >= self.slots.len() {
            return DeregisterResult {
                read: None,
                write: None,
                had_any: false,
            };
        }
        let idx = fd as usize;
        let ops = &mut self.slots[idx];
        let read = ops.read_op.take();
        let write = ops.write_op.take();
        ops.read_token = INVALID_TOKEN;
        ops.write_token = INVALID_TOKEN;
        let had_any = read.is_some() || write.is_some();
        self.active_count -= usize::from(read.is_some()) + usize::from(write.is_some());

        if idx == self.max_active_fd {
            self.trim_tail(idx);
        }

        DeregisterResult {
            read,
            write,
            had_any,
        }
    }

    /// Empty the registry; used on reactor teardown.
    pub fn drain_all(&mut self) -> (Vec<i32>, Vec<OpBox>) {
        let mut fds = Vec::new();
        let mut ops = Vec::with_capacity(self.active_count);
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let had_any = slot.read_op.is_some() || slot.write_op.is_some();
            if had_any {
                fds.push(idx as i32);
            }
            if let Some(op) = slot.read_op.take() {
                ops.push(op);
            }
            if let Some(op) = slot.write_op.take() {
                ops.push(op);
            }
            slot.read_token = INVALID_TOKEN;
            slot.write_token = INVALID_TOKEN;
        }
        self.slots.clear();
        self.next_token = 1;
        self.active_count = 0;
        self.max_active_fd = 0;
        (fds, ops)
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    fn trim_tail(&mut self, fd_index: usize) {
        if self.slots.is_empty() {
            self.max_active_fd = 0;
            return;
        }
        let mut i = fd_index.min(self.slots.len() - 1);
        while i > 0 {
            let ops = &self.slots[i];
            if ops.read_op.is_some() || ops.write_op.is_some() {
                break;
            }
            i -= 1;
        }
        if i == 0 && self.slots[0].read_op.is_none() && self.slots[0].write_op.is_none() {
            self.slots.clear();
            self.max_active_fd = 0;
            return;
        }
        self.max_active_fd = i;
        if self.slots.len() > i + 1 {
            self.slots.truncate(i + 1);
        }
    }
}
