//! Pipe construction and file-descriptor ownership.
//!
//! Every descriptor created here is wrapped in a move-only [`OwnedFd`] so
//! that each end is closed exactly once: either explicitly, when ownership
//! is handed to the child, or implicitly on drop. All pipes are created
//! close-on-exec so a concurrent spawn on another task cannot leak an end
//! into an unrelated child.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

/// A unidirectional pipe whose ends are tracked individually.
///
/// Ends removed with [`take_read`](Self::take_read) /
/// [`take_write`](Self::take_write) become the new owner's responsibility;
/// whatever is left is closed by [`close_all`](Self::close_all) or on drop.
#[derive(Debug)]
pub(crate) struct CreatedPipe {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl CreatedPipe {
    /// Create a new pipe with both ends close-on-exec.
    pub(crate) fn new() -> io::Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(Self {
            read: Some(read),
            write: Some(write),
        })
    }

    /// Raw view of the read end, if still held.
    pub(crate) fn read_fd(&self) -> Option<RawFd> {
        self.read.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Transfer ownership of the read end.
    pub(crate) fn take_read(&mut self) -> Option<OwnedFd> {
        self.read.take()
    }

    /// Transfer ownership of the write end.
    pub(crate) fn take_write(&mut self) -> Option<OwnedFd> {
        self.write.take()
    }

    /// Close both ends. Idempotent: closing an already-closed pipe is a
    /// no-op.
    pub(crate) fn close_all(&mut self) {
        self.read.take();
        self.write.take();
    }
}

/// Duplicate `fd` onto a descriptor above stderr, close-on-exec.
///
/// Descriptors destined for the child must not sit in 0..=2: the dup2 dance
/// that installs the stdio trio would clobber them mid-sequence. Callers
/// pass any child-destined fd through here when it is at or below stderr.
pub(crate) fn dup_above_stderr(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC returns a fresh descriptor we uniquely own.
    let duped = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3) };
    if duped < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: just created above, not owned by anything else.
    Ok(unsafe { OwnedFd::from_raw_fd(duped) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_byte(fd: RawFd) -> Result<(), i32> {
        let byte = [0u8];
        // SAFETY: one-byte write from a stack buffer.
        let n = unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
        if n == 1 {
            Ok(())
        } else {
            Err(io::Error::last_os_error().raw_os_error().unwrap_or(0))
        }
    }

    #[test]
    fn pipe_ends_are_cloexec() {
        let pipe = CreatedPipe::new().unwrap();
        let read = pipe.read_fd().unwrap();
        // SAFETY: read-only flag query.
        let flags = unsafe { libc::fcntl(read, libc::F_GETFD) };
        assert!(flags >= 0);
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn close_all_is_idempotent() {
        let mut pipe = CreatedPipe::new().unwrap();
        pipe.close_all();
        assert!(pipe.read_fd().is_none());
        // Second close must not touch a descriptor that may have been
        // recycled by another part of the process.
        pipe.close_all();
        assert!(pipe.read_fd().is_none());
    }

    #[test]
    fn taken_end_survives_pipe_drop() {
        let mut pipe = CreatedPipe::new().unwrap();
        let write = pipe.take_write().unwrap();
        drop(pipe);
        // The read end went down with the pipe, so a write now reports
        // EPIPE - which also proves the taken write end itself is alive.
        assert_eq!(write_byte(write.as_raw_fd()), Err(libc::EPIPE));
    }

    #[test]
    fn dup_lands_above_stderr() {
        let pipe = CreatedPipe::new().unwrap();
        let duped = dup_above_stderr(pipe.read_fd().unwrap()).unwrap();
        assert!(duped.as_raw_fd() > 2);
    }
}
