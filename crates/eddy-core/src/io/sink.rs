//! Per-shard I/O sink.
//!
//! Requests are staged into per-device FIFO queues; the submit poller moves
//! them round-robin into the kernel backend (an io_uring ring when the
//! `io-uring` feature is on, the syscall pool otherwise), the kernel-submit
//! poller pushes them to the OS, and the reap poller resolves completions.
//! A handle that has been `shutdown` fails subsequent operations with
//! `connection_aborted` instead of letting them spin on would-block.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use fxhash::{FxHashMap, FxHashSet};

use super::syscall::SyscallPool;
use crate::smp::{new_ticket, Completer, Ticket};
use crate::Error;

/// Identifies a fair-queue lane, typically one per backing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

/// Result of a completed I/O request.
#[derive(Debug)]
pub struct IoOutcome {
    /// Bytes transferred.
    pub bytes: usize,
    /// The buffer, with read data filled in.
    pub buf: Vec<u8>,
}

enum IoOpKind {
    Read { len: usize, offset: i64 },
    Write { buf: Vec<u8>, offset: i64 },
    Fsync,
}

struct PendingOp {
    fd: RawFd,
    kind: IoOpKind,
    completer: Completer<IoOutcome>,
}

/// Per-shard staging and dispatch of I/O requests.
pub(crate) struct IoSink {
    /// Per-device FIFOs awaiting backend capacity.
    devices: FxHashMap<u32, VecDeque<PendingOp>>,
    /// Round-robin cursor over device ids.
    rr: Vec<u32>,
    rr_next: usize,
    /// Handles that have been shut down.
    aborted: FxHashSet<RawFd>,
    pool: Rc<SyscallPool>,
    #[cfg(all(target_os = "linux", feature = "io-uring"))]
    ring: Option<super::ring::KernelRing>,
    /// Ring-backed requests accepted but not yet pushed to the OS.
    #[cfg(all(target_os = "linux", feature = "io-uring"))]
    staged_for_kernel: usize,
}

impl IoSink {
    pub(crate) fn new(pool: Rc<SyscallPool>) -> Self {
        Self {
            devices: FxHashMap::default(),
            rr: Vec::new(),
            rr_next: 0,
            aborted: FxHashSet::default(),
            pool,
            #[cfg(all(target_os = "linux", feature = "io-uring"))]
            ring: None,
            #[cfg(all(target_os = "linux", feature = "io-uring"))]
            staged_for_kernel: 0,
        }
    }

    #[cfg(all(target_os = "linux", feature = "io-uring"))]
    pub(crate) fn with_ring(pool: Rc<SyscallPool>, ring: super::ring::KernelRing) -> Self {
        let mut sink = Self::new(pool);
        sink.ring = Some(ring);
        sink
    }

    fn enqueue(&mut self, device: DeviceId, op: PendingOp) {
        let queue = self.devices.entry(device.0).or_insert_with(|| {
            self.rr.push(device.0);
            VecDeque::new()
        });
        queue.push_back(op);
    }

    /// Queues a read of up to `len` bytes at `offset` (-1 for the current
    /// position).
    pub(crate) fn submit_read(
        &mut self,
        device: DeviceId,
        fd: RawFd,
        len: usize,
        offset: i64,
    ) -> Ticket<IoOutcome> {
        let (ticket, completer) = new_ticket();
        self.enqueue(
            device,
            PendingOp {
                fd,
                kind: IoOpKind::Read { len, offset },
                completer,
            },
        );
        ticket
    }

    /// Queues a write of `buf` at `offset` (-1 for the current position).
    pub(crate) fn submit_write(
        &mut self,
        device: DeviceId,
        fd: RawFd,
        buf: Vec<u8>,
        offset: i64,
    ) -> Ticket<IoOutcome> {
        let (ticket, completer) = new_ticket();
        self.enqueue(
            device,
            PendingOp {
                fd,
                kind: IoOpKind::Write { buf, offset },
                completer,
            },
        );
        ticket
    }

    /// Queues an fsync.
    pub(crate) fn submit_fsync(&mut self, device: DeviceId, fd: RawFd) -> Ticket<IoOutcome> {
        let (ticket, completer) = new_ticket();
        self.enqueue(
            device,
            PendingOp {
                fd,
                kind: IoOpKind::Fsync,
                completer,
            },
        );
        ticket
    }

    /// Aborts a handle: pending and future operations on it fail with
    /// `connection_aborted`, and the socket (if it is one) is shut down.
    pub(crate) fn shutdown(&mut self, fd: RawFd) {
        self.aborted.insert(fd);
        // SAFETY: plain shutdown; harmless on non-socket fds (ENOTSOCK).
        unsafe {
            libc::shutdown(fd, libc::SHUT_RDWR);
        }
    }

    /// Moves staged requests into the backend, one per device per round so
    /// no device starves the others.
    pub(crate) fn poll_submit(&mut self) -> bool {
        let mut moved = false;
        let mut idle_rounds = 0;
        while idle_rounds < self.rr.len() {
            if self.rr.is_empty() {
                break;
            }
            let device = self.rr[self.rr_next % self.rr.len()];
            self.rr_next = (self.rr_next + 1) % self.rr.len();
            let Some(queue) = self.devices.get_mut(&device) else {
                idle_rounds += 1;
                continue;
            };
            let Some(op) = queue.pop_front() else {
                idle_rounds += 1;
                continue;
            };
            self.dispatch(op);
            moved = true;
            idle_rounds = 0;
        }
        moved
    }

    fn dispatch(&mut self, op: PendingOp) {
        if self.aborted.contains(&op.fd) {
            op.completer.complete(Err(Error::ConnectionAborted));
            return;
        }
        #[cfg(all(target_os = "linux", feature = "io-uring"))]
        if let Some(ring) = self.ring.as_mut() {
            match op.kind {
                IoOpKind::Read { len, offset } => {
                    ring.push_read(op.fd, len, offset, op.completer);
                }
                IoOpKind::Write { buf, offset } => {
                    ring.push_write(op.fd, buf, offset, op.completer);
                }
                IoOpKind::Fsync => ring.push_fsync(op.fd, op.completer),
            }
            self.staged_for_kernel += 1;
            return;
        }
        // Fallback: run the request on the syscall pool.
        let fd = op.fd;
        let completer = op.completer;
        match op.kind {
            IoOpKind::Read { len, offset } => {
                let t = self.pool.submit(move || blocking_read(fd, len, offset));
                relay(t, completer);
            }
            IoOpKind::Write { buf, offset } => {
                let t = self.pool.submit(move || blocking_write(fd, buf, offset));
                relay(t, completer);
            }
            IoOpKind::Fsync => {
                let t = self.pool.submit(move || blocking_fsync(fd));
                relay(t, completer);
            }
        }
    }

    /// Pushes ring submissions to the OS. No-op on the fallback backend.
    pub(crate) fn kernel_submit(&mut self) -> bool {
        #[cfg(all(target_os = "linux", feature = "io-uring"))]
        if let Some(ring) = self.ring.as_mut() {
            if self.staged_for_kernel > 0 {
                let pushed = ring.submit();
                self.staged_for_kernel = 0;
                return pushed > 0;
            }
        }
        false
    }

    /// Reaps kernel completions and resolves their tickets.
    pub(crate) fn poll_completions(&mut self) -> bool {
        #[cfg(all(target_os = "linux", feature = "io-uring"))]
        if let Some(ring) = self.ring.as_mut() {
            return ring.reap(&self.aborted);
        }
        false
    }

    /// Read-only check for the sleep decision.
    pub(crate) fn pure_poll(&self) -> bool {
        if self.devices.values().any(|q| !q.is_empty()) {
            return true;
        }
        #[cfg(all(target_os = "linux", feature = "io-uring"))]
        if let Some(ring) = self.ring.as_ref() {
            return self.staged_for_kernel > 0 || ring.inflight_count() > 0;
        }
        false
    }
}

/// Parks a syscall-pool ticket next to the caller's completer; the reap
/// poller forwards the result once the pool resolves it.
fn relay(ticket: Ticket<IoOutcome>, completer: Completer<IoOutcome>) {
    RELAYS.with(|r| r.borrow_mut().push((ticket, Some(completer))));
}

thread_local! {
    static RELAYS: std::cell::RefCell<Vec<(Ticket<IoOutcome>, Option<Completer<IoOutcome>>)>> =
        const { std::cell::RefCell::new(Vec::new()) };
}

/// Resolves relayed fallback completions. Called by the reap poller.
pub(crate) fn poll_relays() -> bool {
    RELAYS.with(|r| {
        let mut relays = r.borrow_mut();
        if relays.is_empty() {
            return false;
        }
        let mut any = false;
        relays.retain_mut(|(ticket, completer)| match ticket.try_take() {
            Some(result) => {
                completer
                    .take()
                    .expect("relay completed twice")
                    .complete(result);
                any = true;
                false
            }
            None => true,
        });
        any
    })
}

fn blocking_read(fd: RawFd, len: usize, offset: i64) -> Result<IoOutcome, Error> {
    let mut buf = vec![0u8; len];
    // SAFETY: buf lives for the call and is len bytes long.
    let n = unsafe {
        if offset < 0 {
            libc::read(fd, buf.as_mut_ptr().cast(), len)
        } else {
            libc::pread(fd, buf.as_mut_ptr().cast(), len, offset)
        }
    };
    if n < 0 {
        return Err(os_error());
    }
    #[allow(clippy::cast_sign_loss)]
    let n = n as usize;
    buf.truncate(n);
    Ok(IoOutcome { bytes: n, buf })
}

fn blocking_write(fd: RawFd, buf: Vec<u8>, offset: i64) -> Result<IoOutcome, Error> {
    // SAFETY: buf lives for the call.
    let n = unsafe {
        if offset < 0 {
            libc::write(fd, buf.as_ptr().cast(), buf.len())
        } else {
            libc::pwrite(fd, buf.as_ptr().cast(), buf.len(), offset)
        }
    };
    if n < 0 {
        return Err(os_error());
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(IoOutcome {
        bytes: n as usize,
        buf,
    })
}

fn blocking_fsync(fd: RawFd) -> Result<IoOutcome, Error> {
    // SAFETY: plain fsync.
    if unsafe { libc::fsync(fd) } < 0 {
        return Err(os_error());
    }
    Ok(IoOutcome {
        bytes: 0,
        buf: Vec::new(),
    })
}

fn os_error() -> Error {
    let err = std::io::Error::last_os_error();
    Error::Io {
        code: err.raw_os_error().unwrap_or(libc::EIO),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn sink() -> IoSink {
        let pool = Rc::new(SyscallPool::new(0, 1, Arc::new(|| {})));
        IoSink::new(pool)
    }

    fn drive(sink: &mut IoSink, ticket: &Ticket<IoOutcome>) -> Result<IoOutcome, Error> {
        for _ in 0..2000 {
            sink.poll_submit();
            sink.kernel_submit();
            sink.pool.poll_completions();
            sink.poll_completions();
            poll_relays();
            if let Some(r) = ticket.try_take() {
                return r;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("io ticket never resolved");
    }

    #[test]
    fn pipe_write_then_read_round_trip() {
        let mut fds = [0; 2];
        // SAFETY: valid out array.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut s = sink();
        let w = s.submit_write(DeviceId(0), fds[1], b"hello".to_vec(), -1);
        let got = drive(&mut s, &w).unwrap();
        assert_eq!(got.bytes, 5);
        let r = s.submit_read(DeviceId(0), fds[0], 16, -1);
        let got = drive(&mut s, &r).unwrap();
        assert_eq!(&got.buf, b"hello");
        // SAFETY: closing our own pipe.
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn read_from_bad_fd_reports_io_error() {
        let mut s = sink();
        let t = s.submit_read(DeviceId(0), -1, 8, -1);
        let err = drive(&mut s, &t).unwrap_err();
        assert!(matches!(err, Error::Io { code } if code == libc::EBADF));
    }

    #[test]
    fn shutdown_aborts_pending_and_future_ops() {
        let mut fds = [0; 2];
        // SAFETY: valid out array.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut s = sink();
        let t1 = s.submit_read(DeviceId(0), fds[0], 8, -1);
        s.shutdown(fds[0]);
        let err = drive(&mut s, &t1).unwrap_err();
        assert!(matches!(err, Error::ConnectionAborted));
        let t2 = s.submit_read(DeviceId(0), fds[0], 8, -1);
        let err = drive(&mut s, &t2).unwrap_err();
        assert!(matches!(err, Error::ConnectionAborted));
        // SAFETY: closing our own pipe.
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn devices_share_the_submit_poller_fairly() {
        let mut fds_a = [0; 2];
        let mut fds_b = [0; 2];
        // SAFETY: valid out arrays.
        unsafe {
            assert_eq!(libc::pipe(fds_a.as_mut_ptr()), 0);
            assert_eq!(libc::pipe(fds_b.as_mut_ptr()), 0);
        }
        let mut s = sink();
        let ta = s.submit_write(DeviceId(1), fds_a[1], b"a".to_vec(), -1);
        let tb = s.submit_write(DeviceId(2), fds_b[1], b"b".to_vec(), -1);
        assert!(s.poll_submit());
        drive(&mut s, &ta).unwrap();
        drive(&mut s, &tb).unwrap();
        // SAFETY: closing our own pipes.
        unsafe {
            for fd in fds_a.iter().chain(fds_b.iter()) {
                libc::close(*fd);
            }
        }
    }
}
