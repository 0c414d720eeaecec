//! Shard wakeup notifier.
//!
//! An eventfd (pipe pair off Linux) a sleeping reactor blocks on. Producers
//! that observe the destination's sleeping flag write one token; the owner
//! drains it on wake. Writes are async-signal-safe, so signal handlers may
//! poke a notifier directly.

use std::io;
use std::os::unix::io::RawFd;

pub(crate) struct Notifier {
    read_fd: RawFd,
    write_fd: RawFd,
}

// SAFETY: raw fd operations are thread-safe; the fds live until Drop.
unsafe impl Send for Notifier {}
unsafe impl Sync for Notifier {}

impl Notifier {
    pub(crate) fn new() -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: plain eventfd creation.
            let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                read_fd: fd,
                write_fd: fd,
            })
        }
        #[cfg(not(target_os = "linux"))]
        {
            let mut fds = [0 as RawFd; 2];
            // SAFETY: fds is a valid out array.
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
            for fd in fds {
                // SAFETY: fcntl on a fd we just created.
                unsafe {
                    libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                    libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                }
            }
            Ok(Self {
                read_fd: fds[0],
                write_fd: fds[1],
            })
        }
    }

    /// Wakes the owner. Callable from any thread and from signal handlers.
    pub(crate) fn signal(&self) {
        let one: u64 = 1;
        // SAFETY: write of 8 bytes from a live buffer; EAGAIN (counter
        // saturated) is as good as delivered.
        unsafe {
            libc::write(self.write_fd, std::ptr::addr_of!(one).cast(), 8);
        }
    }

    /// Consumes pending wakeups. Owner side only.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 8];
        // SAFETY: read into a valid buffer; the fd is nonblocking.
        while unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), 8) } > 0 {}
    }

    /// The fd a sleeping reactor polls on.
    pub(crate) fn poll_fd(&self) -> RawFd {
        self.read_fd
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // SAFETY: closing fds we own.
        unsafe {
            libc::close(self.read_fd);
            if self.write_fd != self.read_fd {
                libc::close(self.write_fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_then_drain() {
        let n = Notifier::new().unwrap();
        n.signal();
        n.signal();
        let mut fds = libc::pollfd {
            fd: n.poll_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd.
        let ready = unsafe { libc::poll(&mut fds, 1, 100) };
        assert_eq!(ready, 1);
        n.drain();
        // Drained: nothing readable now.
        fds.revents = 0;
        // SAFETY: one valid pollfd.
        let ready = unsafe { libc::poll(&mut fds, 1, 0) };
        assert_eq!(ready, 0);
    }
}
