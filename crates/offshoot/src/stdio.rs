//! Standard I/O dispositions and their per-spawn wiring.
//!
//! A disposition describes what one of the child's standard streams is
//! connected to. [`prepare`] turns the three dispositions into the raw
//! descriptors the child will dup2 onto 0/1/2, plus the parent-side pipe
//! ends the [`Execution`](crate::execution::Execution) hands to the caller.

use std::fs::OpenOptions;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::error::Result;
use crate::pipe::{dup_above_stderr, CreatedPipe};

/// A caller-provided descriptor plus the close-after-spawn contract.
#[derive(Debug)]
pub struct FdSlot {
    fd: RawFd,
    owned: bool,
}

impl FdSlot {
    fn into_parts(self) -> (RawFd, bool) {
        let parts = (self.fd, self.owned);
        mem::forget(self);
        parts
    }
}

impl Drop for FdSlot {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: the slot owns the descriptor and this is its only
            // close.
            unsafe { libc::close(self.fd) };
        }
    }
}

/// Disposition of the child's standard input.
#[derive(Debug)]
pub enum Input {
    /// The child reads EOF immediately (stdin is /dev/null).
    Null,

    /// The child reads from the given descriptor.
    File(FdSlot),

    /// A pipe whose write end is handed to the caller as an
    /// [`InputWriter`](crate::io::InputWriter).
    Piped,
}

impl Input {
    /// No input: the child's stdin reads from /dev/null.
    #[must_use]
    pub fn null() -> Self {
        Self::Null
    }

    /// Read from a descriptor the library takes ownership of; it is closed
    /// once the spawn completes.
    #[must_use]
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self::File(FdSlot {
            fd: fd.into_raw_fd(),
            owned: true,
        })
    }

    /// Read from a raw descriptor.
    ///
    /// With `close_after_spawn` the descriptor is closed once the spawn
    /// completes; otherwise it is left untouched.
    ///
    /// # Safety
    ///
    /// `fd` must be open, and with `close_after_spawn` it must not be owned
    /// (or closed) by anything else.
    #[must_use]
    pub unsafe fn from_raw_fd(fd: RawFd, close_after_spawn: bool) -> Self {
        Self::File(FdSlot {
            fd,
            owned: close_after_spawn,
        })
    }

    /// A pipe the caller writes through.
    #[must_use]
    pub fn piped() -> Self {
        Self::Piped
    }
}

impl Default for Input {
    fn default() -> Self {
        Self::Null
    }
}

/// Disposition of the child's standard output or standard error.
#[derive(Debug)]
pub enum Output {
    /// The stream is discarded (/dev/null).
    Discard,

    /// The stream is written to the given descriptor.
    File(FdSlot),

    /// The stream is captured into memory, optionally retaining at most
    /// `limit` bytes (the rest is drained and dropped so the child never
    /// blocks).
    Collect {
        /// Retention cap; `None` keeps everything.
        limit: Option<usize>,
    },

    /// A pipe read by the caller as a stream of byte buffers.
    Stream,
}

impl Output {
    /// Discard the stream.
    #[must_use]
    pub fn discard() -> Self {
        Self::Discard
    }

    /// Write to a descriptor the library takes ownership of; it is closed
    /// once the spawn completes.
    #[must_use]
    pub fn to_fd(fd: OwnedFd) -> Self {
        Self::File(FdSlot {
            fd: fd.into_raw_fd(),
            owned: true,
        })
    }

    /// Write to a raw descriptor.
    ///
    /// With `close_after_spawn` the descriptor is closed once the spawn
    /// completes; otherwise it is left untouched.
    ///
    /// # Safety
    ///
    /// `fd` must be open, and with `close_after_spawn` it must not be owned
    /// (or closed) by anything else.
    #[must_use]
    pub unsafe fn to_raw_fd(fd: RawFd, close_after_spawn: bool) -> Self {
        Self::File(FdSlot {
            fd,
            owned: close_after_spawn,
        })
    }

    /// Capture the whole stream into memory.
    #[must_use]
    pub fn collect() -> Self {
        Self::Collect { limit: None }
    }

    /// Capture the stream, retaining at most `limit` bytes.
    #[must_use]
    pub fn collect_limited(limit: usize) -> Self {
        Self::Collect { limit: Some(limit) }
    }

    /// Hand the stream to the caller as a lazily read sequence of buffers.
    #[must_use]
    pub fn stream() -> Self {
        Self::Stream
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::Discard
    }
}

/// Descriptors the child installs as 0/1/2, plus every parent-held owner
/// that must be released once the fork has happened.
#[derive(Debug)]
pub(crate) struct ChildEnds {
    pub(crate) stdin: RawFd,
    pub(crate) stdout: RawFd,
    pub(crate) stderr: RawFd,
    /// Owners backing the raw descriptors above (pipes' child ends,
    /// /dev/null handles, adopted caller descriptors). Dropping this after
    /// fork is the parent-side close of the child-destined ends.
    owned: Vec<OwnedFd>,
}

impl ChildEnds {
    /// Close the child-destined ends in the parent. Called exactly once,
    /// after the fork (successful or not).
    pub(crate) fn close_in_parent(self) {
        drop(self);
    }
}

/// Parent-side pipe ends, handed to the execution controller.
#[derive(Debug, Default)]
pub(crate) struct ParentEnds {
    pub(crate) stdin: Option<OwnedFd>,
    pub(crate) stdout: Option<OwnedFd>,
    pub(crate) stderr: Option<OwnedFd>,
    pub(crate) stdout_limit: Option<usize>,
    pub(crate) stderr_limit: Option<usize>,
}

fn dev_null(write: bool) -> io::Result<OwnedFd> {
    let file = OpenOptions::new()
        .read(!write)
        .write(write)
        .open("/dev/null")?;
    Ok(file.into())
}

/// Keep a child-destined descriptor above stderr, tracking any owners.
fn child_fd(fd: RawFd, owner: Option<OwnedFd>, owned: &mut Vec<OwnedFd>) -> io::Result<RawFd> {
    if fd > 2 {
        owned.extend(owner);
        return Ok(fd);
    }
    let duped = dup_above_stderr(fd)?;
    let raw = duped.as_raw_fd();
    owned.push(duped);
    owned.extend(owner);
    Ok(raw)
}

/// Wire the three dispositions into child descriptors and parent handles.
pub(crate) fn prepare(
    input: Input,
    output: Output,
    error: Output,
) -> Result<(ChildEnds, ParentEnds)> {
    let mut owned = Vec::new();
    let mut parent = ParentEnds::default();

    let stdin = match input {
        Input::Null => {
            let null = dev_null(false)?;
            child_fd(null.as_raw_fd(), Some(null), &mut owned)?
        },
        Input::File(slot) => {
            let (fd, adopt) = slot.into_parts();
            let owner = adopt.then(|| {
                // SAFETY: into_parts disarmed the slot; ownership moves here.
                unsafe { OwnedFd::from_raw_fd(fd) }
            });
            child_fd(fd, owner, &mut owned)?
        },
        Input::Piped => {
            let mut pipe = CreatedPipe::new()?;
            let read = pipe.take_read().expect("fresh pipe has a read end");
            parent.stdin = pipe.take_write();
            child_fd(read.as_raw_fd(), Some(read), &mut owned)?
        },
    };

    let (stdout, stdout_limit) = prepare_output(output, &mut owned, &mut parent.stdout)?;
    parent.stdout_limit = stdout_limit;
    let (stderr, stderr_limit) = prepare_output(error, &mut owned, &mut parent.stderr)?;
    parent.stderr_limit = stderr_limit;

    Ok((
        ChildEnds {
            stdin,
            stdout,
            stderr,
            owned,
        },
        parent,
    ))
}

fn prepare_output(
    disposition: Output,
    owned: &mut Vec<OwnedFd>,
    parent_read: &mut Option<OwnedFd>,
) -> Result<(RawFd, Option<usize>)> {
    match disposition {
        Output::Discard => {
            let null = dev_null(true)?;
            Ok((child_fd(null.as_raw_fd(), Some(null), owned)?, None))
        },
        Output::File(slot) => {
            let (fd, adopt) = slot.into_parts();
            let owner = adopt.then(|| {
                // SAFETY: into_parts disarmed the slot; ownership moves here.
                unsafe { OwnedFd::from_raw_fd(fd) }
            });
            Ok((child_fd(fd, owner, owned)?, None))
        },
        Output::Collect { limit } => {
            let mut pipe = CreatedPipe::new()?;
            let write = pipe.take_write().expect("fresh pipe has a write end");
            *parent_read = pipe.take_read();
            Ok((child_fd(write.as_raw_fd(), Some(write), owned)?, limit))
        },
        Output::Stream => {
            let mut pipe = CreatedPipe::new()?;
            let write = pipe.take_write().expect("fresh pipe has a write end");
            *parent_read = pipe.take_read();
            Ok((child_fd(write.as_raw_fd(), Some(write), owned)?, None))
        },
    }
}
