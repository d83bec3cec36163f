// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! io_uring backend (Linux, `uring` feature).
//!
//! Readiness is modelled with one-shot poll-add SQEs per `(fd, mask)`.
//! `user_data` packs `(tag, fd, generation)`; the generation is bumped on
//! every re-arm so completions belonging to a replaced arming are ignored.
//! Interest changes submit a poll-remove first; its ECANCELED CQE is
//! silently absorbed. A persistent poll on an eventfd carries cross-thread
//! wakeups and is re-armed after each fire.
//!
//! The kernel may deliver a new arming's CQE before the cancellation CQE of
//! the arming it replaced; generation matching makes the ordering
//! irrelevant.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use io_uring::{opcode, types, IoUring};

use crate::error::ErrorKind;
use crate::reactor::backend::{Backend, Event};

const WAKE_TAG: u64 = 1 << 63;
const FD_SHIFT: u32 = 32;
const GEN_MASK: u64 = (1 << FD_SHIFT) - 1;

fn pack(fd: i32, generation: u32) -> u64 {
    ((fd as u64) << FD_SHIFT) | generation as u64
}

fn unpack(user_data: u64) -> (i32, u32) {
    (
        (user_data >> FD_SHIFT) as i32,
        (user_data & GEN_MASK) as u32,
    )
}

struct Arming {
    generation: u32,
    want_read: bool,
    want_write: bool,
}

struct UringState {
    ring: IoUring,
    armed: HashMap<i32, Arming>,
    next_generation: u32,
}

pub struct UringBackend {
    wake_fd: i32,
    // Ring access is reactor-thread-only (interest updates and wait run on
    // the thread inside run*); `wakeup` touches only the eventfd.
    state: Mutex<UringState>,
}

impl UringBackend {
    pub fn new() -> io::Result<Self> {
        let ring = IoUring::new(256)?;

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let backend = UringBackend {
            wake_fd,
            state: Mutex::new(UringState {
                ring,
                armed: HashMap::new(),
                next_generation: 1,
            }),
        };
        backend.arm_wakeup(&mut backend.state.lock().unwrap())?;
        Ok(backend)
    }

    fn poll_mask(want_read: bool, want_write: bool) -> u32 {
        let mut mask = (libc::POLLERR | libc::POLLHUP | libc::POLLRDHUP) as u32;
        if want_read {
            mask |= libc::POLLIN as u32;
        }
        if want_write {
            mask |= libc::POLLOUT as u32;
        }
        mask
    }

    fn push_sqe(st: &mut UringState, entry: io_uring::squeue::Entry) -> io::Result<()> {
        loop {
            let pushed = unsafe { st.ring.submission().push(&entry).is_ok() };
            if pushed {
                return Ok(());
            }
            st.ring.submit()?;
        }
    }

    fn arm_wakeup(&self, st: &mut UringState) -> io::Result<()> {
        let entry = opcode::PollAdd::new(types::Fd(self.wake_fd), libc::POLLIN as u32)
            .build()
            .user_data(WAKE_TAG);
        Self::push_sqe(st, entry)?;
        st.ring.submit()?;
        Ok(())
    }

    fn next_generation(st: &mut UringState) -> u32 {
        // Generation 0 is reserved for "no arming".
        st.next_generation = st.next_generation.wrapping_add(1);
        if st.next_generation == 0 {
            st.next_generation = 1;
        }
        st.next_generation
    }
}

impl Backend for UringBackend {
    fn update_interest(&self, fd: i32, want_read: bool, want_write: bool) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        let st = &mut *st;

        let current = st
            .armed
            .get(&fd)
            .map(|a| (a.generation, a.want_read, a.want_write));
        if let Some((generation, cur_read, cur_write)) = current {
            if cur_read == want_read && cur_write == want_write {
                return Ok(());
            }
            // Replace the in-flight poll; its ECANCELED CQE is absorbed in
            // `wait` and its generation no longer matches anything.
            let old = pack(fd, generation);
            let remove = opcode::PollRemove::new(old).build().user_data(old);
            Self::push_sqe(st, remove)?;
            st.armed.remove(&fd);
        }

        if !want_read && !want_write {
            st.ring.submit()?;
            return Ok(());
        }

        let generation = Self::next_generation(st);
        let add = opcode::PollAdd::new(types::Fd(fd), Self::poll_mask(want_read, want_write))
            .build()
            .user_data(pack(fd, generation));
        Self::push_sqe(st, add)?;
        st.armed.insert(
            fd,
            Arming {
                generation,
                want_read,
                want_write,
            },
        );
        st.ring.submit()?;
        Ok(())
    }

    fn remove_interest(&self, fd: i32) {
        let _ = self.update_interest(fd, false, false);
    }

    fn wait(&self, max_wait: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize> {
        let mut st = self.state.lock().unwrap();
        let st = &mut *st;

        let wait_result = match max_wait {
            Some(d) => {
                let ts = types::Timespec::new()
                    .sec(d.as_secs())
                    .nsec(d.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                st.ring.submitter().submit_with_args(1, &args)
            }
            None => st.ring.submitter().submit_and_wait(1),
        };
        if let Err(err) = wait_result {
            match err.raw_os_error() {
                // Timeout or signal: drain whatever completed anyway.
                Some(libc::ETIME) | Some(libc::EINTR) => {}
                _ => return Err(err),
            }
        }

        let mut appended = 0;
        let mut rearm_wakeup = false;
        {
            let cq = st.ring.completion();
            for cqe in cq {
                let user_data = cqe.user_data();
                if user_data == WAKE_TAG {
                    let mut buf = [0u8; 8];
                    unsafe {
                        libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                    }
                    rearm_wakeup = true;
                    continue;
                }

                let result = cqe.result();
                if result == -libc::ECANCELED {
                    // Completion of a removed poll (or of the remove SQE
                    // itself). Nothing to deliver.
                    continue;
                }

                let (fd, generation) = unpack(user_data);
                let live = st.armed.get(&fd).map(|a| a.generation) == Some(generation);
                if !live {
                    // Stale generation: the arming was replaced.
                    continue;
                }
                // One-shot poll consumed.
                st.armed.remove(&fd);

                if result < 0 {
                    out.push(Event {
                        fd,
                        readable: false,
                        writable: false,
                        error: true,
                        hint: Some(ErrorKind::from_errno(-result)),
                    });
                    appended += 1;
                    continue;
                }

                let revents = result as u32;
                let hup = revents & (libc::POLLHUP as u32 | libc::POLLRDHUP as u32) != 0;
                let err = revents & libc::POLLERR as u32 != 0;
                let hint = if hup {
                    Some(ErrorKind::Eof)
                } else if err {
                    Some(ErrorKind::ConnectionReset)
                } else {
                    None
                };
                out.push(Event {
                    fd,
                    readable: revents & (libc::POLLIN as u32 | libc::POLLPRI as u32) != 0,
                    writable: revents & libc::POLLOUT as u32 != 0,
                    error: hup || err,
                    hint,
                });
                appended += 1;
            }
        }

        if rearm_wakeup {
            self.arm_wakeup(st)?;
        }
        Ok(appended)
    }

    fn wakeup(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }
}

impl Drop for UringBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
        }
    }
}
