//! The handle returned to callers for a running child.
//!
//! An [`Execution`] owns the parent-side pipe endpoints and the
//! output-consumption gate. Each output pipe can be drained exactly once -
//! either streamed buffer by buffer, or through [`capture_both`]
//! (concurrently, so a child filling one pipe while the other is read
//! cannot deadlock). Undrained endpoints are closed when the handle drops.
//!
//! [`capture_both`]: Execution::capture_both

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::Result;
use crate::io::{InputWriter, OutputReader};
use crate::reaper;
use crate::stdio::ParentEnds;

const STDOUT_CONSUMED: u8 = 0b01;
const STDERR_CONSUMED: u8 = 0b10;

/// How often teardown re-checks whether the child has gone away.
const TEARDOWN_POLL: Duration = Duration::from_millis(20);

/// A running (or already terminated, not yet awaited) child process.
#[derive(Debug)]
pub struct Execution {
    pid: Pid,
    stdin: Option<InputWriter>,
    stdout: Option<OutputReader>,
    stderr: Option<OutputReader>,
    stdout_limit: Option<usize>,
    stderr_limit: Option<usize>,
    /// Consumption gate: one bit per output side, each flips 0 -> 1 at most
    /// once.
    consumed: AtomicU8,
}

impl Execution {
    pub(crate) fn new(pid: Pid, ends: ParentEnds) -> io::Result<Self> {
        Ok(Self {
            pid,
            stdin: ends.stdin.map(InputWriter::new).transpose()?,
            stdout: ends.stdout.map(OutputReader::new).transpose()?,
            stderr: ends.stderr.map(OutputReader::new).transpose()?,
            stdout_limit: ends.stdout_limit,
            stderr_limit: ends.stderr_limit,
            consumed: AtomicU8::new(0),
        })
    }

    /// OS process id of the child. Valid until the child is reaped.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Take the writer feeding the child's standard input.
    ///
    /// Present only when the input disposition was
    /// [`Input::piped`](crate::stdio::Input::piped); subsequent calls
    /// return `None`.
    pub fn stdin_writer(&mut self) -> Option<InputWriter> {
        self.stdin.take()
    }

    /// Claim the streaming view of the child's standard output.
    ///
    /// # Panics
    ///
    /// Panics if standard output was not pipe-backed, or on a second claim:
    /// a pipe can be drained only once, and a second consumer would
    /// silently lose bytes.
    pub fn stdout_reader(&mut self) -> OutputReader {
        self.claim_stdout()
            .expect("standard output was not requested as a pipe")
    }

    /// Claim the streaming view of the child's standard error.
    ///
    /// # Panics
    ///
    /// Panics if standard error was not pipe-backed, or on a second claim.
    pub fn stderr_reader(&mut self) -> OutputReader {
        self.claim_stderr()
            .expect("standard error was not requested as a pipe")
    }

    /// Drain standard output and standard error concurrently to EOF.
    ///
    /// Sides whose disposition carried a retention limit keep only the
    /// first `limit` bytes but are still drained fully, so the child is
    /// never blocked on a full pipe. Non-piped sides yield an empty buffer.
    /// Cancelling the returned future cancels both drainers and discards
    /// partial data; the child is not signaled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::error::Error::Io) if reading either
    /// pipe fails; the sibling drainer is cancelled.
    ///
    /// # Panics
    ///
    /// Panics if either side was already consumed.
    pub async fn capture_both(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let stdout = self.claim_stdout();
        let stderr = self.claim_stderr();
        let stdout_limit = self.stdout_limit;
        let stderr_limit = self.stderr_limit;
        tokio::try_join!(drain(stdout, stdout_limit), drain(stderr, stderr_limit))
    }

    /// Send a signal to the child.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::error::Error::Io) if the signal cannot
    /// be delivered (for instance, the child was already reaped).
    pub fn send_signal(&self, signal: Signal) -> Result<()> {
        kill(self.pid, signal)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32).into())
    }

    /// Terminate the child gracefully: SIGTERM, a bounded wait for it to
    /// disappear, then SIGKILL.
    ///
    /// Best effort; the caller still observes the termination status
    /// through the owning `run` operation.
    pub async fn teardown(&self, graceful: Duration) {
        if kill(self.pid, Signal::SIGTERM).is_err() {
            // Already gone.
            return;
        }
        debug!(pid = %self.pid, "sent SIGTERM, waiting for exit");

        let deadline = tokio::time::Instant::now() + graceful;
        while tokio::time::Instant::now() < deadline {
            if self.is_gone() {
                return;
            }
            tokio::time::sleep(TEARDOWN_POLL).await;
        }

        warn!(pid = %self.pid, "graceful window elapsed, sending SIGKILL");
        let _ = kill(self.pid, Signal::SIGKILL);
    }

    /// Whether the child has terminated as far as the parent can observe:
    /// its status is parked with the reaper, or its pid no longer exists.
    fn is_gone(&self) -> bool {
        reaper::global().has_status(self.pid) || kill(self.pid, None).is_err()
    }

    fn claim_stdout(&mut self) -> Option<OutputReader> {
        let previous = self.consumed.fetch_or(STDOUT_CONSUMED, Ordering::AcqRel);
        assert!(
            previous & STDOUT_CONSUMED == 0,
            "standard output of child {} consumed twice",
            self.pid
        );
        self.stdout.take()
    }

    fn claim_stderr(&mut self) -> Option<OutputReader> {
        let previous = self.consumed.fetch_or(STDERR_CONSUMED, Ordering::AcqRel);
        assert!(
            previous & STDERR_CONSUMED == 0,
            "standard error of child {} consumed twice",
            self.pid
        );
        self.stderr.take()
    }
}

/// Read a pipe to EOF, retaining at most `limit` bytes.
async fn drain(reader: Option<OutputReader>, limit: Option<usize>) -> Result<Vec<u8>> {
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut collected = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(collected);
        }
        let keep = match limit {
            None => n,
            Some(limit) => n.min(limit.saturating_sub(collected.len())),
        };
        collected.extend_from_slice(&buf[..keep]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::CreatedPipe;
    use std::os::fd::AsRawFd;
    use tokio::io::AsyncWriteExt;

    fn piped_ends() -> (ParentEnds, CreatedPipe, CreatedPipe) {
        let mut out_pipe = CreatedPipe::new().unwrap();
        let mut err_pipe = CreatedPipe::new().unwrap();
        let ends = ParentEnds {
            stdin: None,
            stdout: out_pipe.take_read(),
            stderr: err_pipe.take_read(),
            stdout_limit: None,
            stderr_limit: None,
        };
        (ends, out_pipe, err_pipe)
    }

    #[tokio::test]
    #[should_panic(expected = "consumed twice")]
    async fn stdout_cannot_be_claimed_twice() {
        let (ends, _out, _err) = piped_ends();
        let mut execution = Execution::new(Pid::from_raw(1), ends).unwrap();
        let _first = execution.stdout_reader();
        let _second = execution.stdout_reader();
    }

    #[tokio::test]
    async fn stderr_is_gated_on_its_own_bit() {
        let (ends, _out, _err) = piped_ends();
        let mut execution = Execution::new(Pid::from_raw(1), ends).unwrap();
        // Consuming stdout must leave stderr claimable, and vice versa.
        let _stdout = execution.stdout_reader();
        let _stderr = execution.stderr_reader();
    }

    #[tokio::test]
    #[should_panic(expected = "consumed twice")]
    async fn capture_both_after_streaming_panics() {
        let (ends, _out, _err) = piped_ends();
        let mut execution = Execution::new(Pid::from_raw(1), ends).unwrap();
        let _stdout = execution.stdout_reader();
        let _ = execution.capture_both().await;
    }

    #[tokio::test]
    async fn drop_closes_parent_ends() {
        let (ends, mut out, _err) = piped_ends();
        let execution = Execution::new(Pid::from_raw(1), ends).unwrap();
        drop(execution);
        // The read end died with the execution, so writing the still-held
        // write end reports EPIPE.
        let write = out.take_write().unwrap();
        let byte = [0u8];
        // SAFETY: one-byte write from a stack buffer.
        let n = unsafe { libc::write(write.as_raw_fd(), byte.as_ptr().cast(), 1) };
        assert_eq!(n, -1);
        assert_eq!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::EPIPE)
        );
    }

    #[tokio::test]
    async fn capture_both_honors_limit_without_stalling() {
        let mut out_pipe = CreatedPipe::new().unwrap();
        let mut err_pipe = CreatedPipe::new().unwrap();
        let ends = ParentEnds {
            stdin: None,
            stdout: out_pipe.take_read(),
            stderr: err_pipe.take_read(),
            stdout_limit: Some(4),
            stderr_limit: None,
        };
        let mut out_writer = InputWriter::new(out_pipe.take_write().unwrap()).unwrap();
        let mut err_writer = InputWriter::new(err_pipe.take_write().unwrap()).unwrap();

        let feeder = tokio::spawn(async move {
            out_writer.write_all(b"0123456789").await.unwrap();
            err_writer.write_all(b"abc").await.unwrap();
            out_writer.finish();
            err_writer.finish();
        });

        let mut execution = Execution::new(Pid::from_raw(1), ends).unwrap();
        let (stdout, stderr) = execution.capture_both().await.unwrap();
        feeder.await.unwrap();

        assert_eq!(stdout, b"0123");
        assert_eq!(stderr, b"abc");
    }
}
