//! Kernel submission/completion ring (Linux, `io-uring` feature).
//!
//! One ring per shard. Requests park their buffers and completers in a slab
//! indexed by the sqe's `user_data`; the reap pass resolves them from cqes.
//! SQPOLL can be enabled for syscall-free submission on kernels that
//! support it.

use std::os::unix::io::RawFd;

use fxhash::FxHashSet;
use io_uring::{opcode, types, IoUring};

use super::sink::IoOutcome;
use crate::smp::Completer;
use crate::Error;

/// Ring construction options.
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// Submission queue depth (power of two).
    pub entries: u32,
    /// Kernel-side submission polling idle time in milliseconds, when
    /// enabled.
    pub sqpoll_idle_ms: Option<u32>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            entries: 256,
            sqpoll_idle_ms: None,
        }
    }
}

struct Inflight {
    fd: RawFd,
    buf: Vec<u8>,
    is_read: bool,
    completer: Completer<IoOutcome>,
}

pub(crate) struct KernelRing {
    ring: IoUring,
    inflight: Vec<Option<Inflight>>,
    free: Vec<usize>,
}

impl KernelRing {
    pub(crate) fn new(config: RingConfig) -> std::io::Result<Self> {
        let mut builder = IoUring::builder();
        if let Some(idle) = config.sqpoll_idle_ms {
            builder.setup_sqpoll(idle);
        }
        let ring = builder.build(config.entries)?;
        Ok(Self {
            ring,
            inflight: Vec::new(),
            free: Vec::new(),
        })
    }

    fn park(&mut self, op: Inflight) -> usize {
        if let Some(slot) = self.free.pop() {
            self.inflight[slot] = Some(op);
            slot
        } else {
            self.inflight.push(Some(op));
            self.inflight.len() - 1
        }
    }

    fn push_sqe(&mut self, entry: io_uring::squeue::Entry) {
        // SAFETY: the buffers the sqe points at live in `inflight` until the
        // matching cqe is reaped.
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                // Queue full: make room and retry once.
                let _ = self.ring.submit();
                self.ring
                    .submission()
                    .push(&entry)
                    .expect("submission queue full after submit");
            }
        }
    }

    pub(crate) fn push_read(
        &mut self,
        fd: RawFd,
        len: usize,
        offset: i64,
        completer: Completer<IoOutcome>,
    ) {
        let buf = vec![0u8; len];
        let slot = self.park(Inflight {
            fd,
            buf,
            is_read: true,
            completer,
        });
        let op = self.inflight[slot].as_mut().expect("slot just filled");
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let entry = opcode::Read::new(types::Fd(fd), op.buf.as_mut_ptr(), op.buf.len() as u32)
            .offset(offset as u64)
            .build()
            .user_data(slot as u64);
        self.push_sqe(entry);
    }

    pub(crate) fn push_write(
        &mut self,
        fd: RawFd,
        buf: Vec<u8>,
        offset: i64,
        completer: Completer<IoOutcome>,
    ) {
        let slot = self.park(Inflight {
            fd,
            buf,
            is_read: false,
            completer,
        });
        let op = self.inflight[slot].as_ref().expect("slot just filled");
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let entry = opcode::Write::new(types::Fd(fd), op.buf.as_ptr(), op.buf.len() as u32)
            .offset(offset as u64)
            .build()
            .user_data(slot as u64);
        self.push_sqe(entry);
    }

    pub(crate) fn push_fsync(&mut self, fd: RawFd, completer: Completer<IoOutcome>) {
        let slot = self.park(Inflight {
            fd,
            buf: Vec::new(),
            is_read: false,
            completer,
        });
        let entry = opcode::Fsync::new(types::Fd(fd))
            .build()
            .user_data(slot as u64);
        self.push_sqe(entry);
    }

    /// Pushes queued sqes to the kernel. Returns the number submitted.
    pub(crate) fn submit(&mut self) -> usize {
        self.ring.submit().unwrap_or(0)
    }

    /// Resolves available completions. An error on a shut-down handle
    /// (including would-block) reports `connection_aborted`.
    pub(crate) fn reap(&mut self, aborted: &FxHashSet<RawFd>) -> bool {
        let mut any = false;
        let entries: Vec<(u64, i32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();
        for (user_data, result) in entries {
            let slot = usize::try_from(user_data).expect("user_data fits usize");
            let Some(mut op) = self.inflight[slot].take() else {
                continue;
            };
            self.free.push(slot);
            any = true;
            if result < 0 {
                let code = -result;
                if aborted.contains(&op.fd) {
                    op.completer.complete(Err(Error::ConnectionAborted));
                } else {
                    op.completer.complete(Err(Error::Io { code }));
                }
            } else {
                #[allow(clippy::cast_sign_loss)]
                let bytes = result as usize;
                if op.is_read {
                    op.buf.truncate(bytes);
                }
                op.completer.complete(Ok(IoOutcome { bytes, buf: op.buf }));
            }
        }
        any
    }

    /// Requests parked in the slab awaiting their cqe.
    pub(crate) fn inflight_count(&self) -> usize {
        self.inflight.len() - self.free.len()
    }
}
