//! Caller-facing spawn operations.

use std::future::Future;
use std::os::fd::OwnedFd;

use tracing::debug;

use crate::error::Result;
use crate::execution::Execution;
use crate::reaper;
use crate::request::SpawnRequest;
use crate::spawner;
use crate::stdio::{Input, Output};
use crate::TerminationStatus;

/// Collected result of [`run_collected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedResult {
    /// How the child terminated.
    pub status: TerminationStatus,

    /// Captured standard output bytes.
    pub stdout: Vec<u8>,

    /// Captured standard error bytes.
    pub stderr: Vec<u8>,
}

/// Spawn a child, hand the [`Execution`] to `body`, then await both the
/// body and the child's termination.
///
/// The termination status is observed through the process-wide reaper, so
/// either order - child exiting before the body finishes, or after - is
/// handled. Dropping pipes the body never consumed closes them.
///
/// # Examples
///
/// ```no_run
/// use offshoot::{run, Input, Output, SpawnRequest};
///
/// # async fn example() -> Result<(), offshoot::Error> {
/// let request = SpawnRequest::builder()
///     .program("/bin/cat")
///     .build();
/// let (first_chunk, status) = run(
///     request,
///     Input::null(),
///     Output::stream(),
///     Output::discard(),
///     |mut execution| async move {
///         let mut stdout = execution.stdout_reader();
///         stdout.next_chunk().await
///     },
/// )
/// .await?;
/// # let _ = (first_chunk, status);
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns a spawn error if the child could not be started; errors inside
/// `body` are the body's own business (make its output a `Result` to
/// propagate them).
pub async fn run<F, Fut, R>(
    request: SpawnRequest,
    input: Input,
    output: Output,
    error: Output,
    body: F,
) -> Result<(R, TerminationStatus)>
where
    F: FnOnce(Execution) -> Fut,
    Fut: Future<Output = R>,
{
    let (execution, pid) = spawner::spawn(request, input, output, error)?;
    let result = body(execution).await;
    let status = reaper::global().wait_for(pid).await;
    debug!(%pid, %status, "child terminated");
    Ok((result, status))
}

/// Spawn a child and capture both of its outputs to EOF.
///
/// Standard output and standard error are drained concurrently, so a child
/// that interleaves large writes on both cannot deadlock against a full
/// pipe buffer.
///
/// # Examples
///
/// ```no_run
/// use offshoot::{run_collected, Input, SpawnRequest};
///
/// # async fn example() -> Result<(), offshoot::Error> {
/// let result = run_collected(
///     SpawnRequest::builder().program("/bin/echo").arg("hello").build(),
///     Input::null(),
/// )
/// .await?;
/// assert!(result.status.success());
/// assert_eq!(result.stdout, b"hello\n");
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns a spawn error if the child could not be started, or an I/O
/// error surfaced while draining the pipes.
pub async fn run_collected(request: SpawnRequest, input: Input) -> Result<CollectedResult> {
    let (capture, status) = run(
        request,
        input,
        Output::collect(),
        Output::collect(),
        |mut execution| async move { execution.capture_both().await },
    )
    .await?;
    let (stdout, stderr) = capture?;
    Ok(CollectedResult {
        status,
        stdout,
        stderr,
    })
}

/// Spawn a child without installing any waiter and return its pid.
///
/// Never blocks on the child. Omitted descriptors default to /dev/null
/// (input) and discard (outputs) - equivalent to a spawn with all three
/// sides discarded. The process-wide reaper still collects the child's
/// termination eventually, so no zombie remains.
///
/// Must be called from within a tokio runtime (the reaper's dispatcher
/// lives on it).
///
/// # Errors
///
/// Returns a spawn error if the child could not be started.
#[allow(clippy::cast_sign_loss)]
pub fn run_detached(
    request: SpawnRequest,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
) -> Result<u32> {
    let input = stdin.map_or_else(Input::null, Input::from_fd);
    let output = stdout.map_or_else(Output::discard, Output::to_fd);
    let error = stderr.map_or_else(Output::discard, Output::to_fd);

    let (execution, pid) = spawner::spawn(request, input, output, error)?;
    // No pipes were requested; the handle holds nothing worth keeping.
    drop(execution);
    Ok(pid.as_raw() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, PoisonError};

    /// The global reaper map is shared by every test thread; spawning
    /// tests serialize so the emptiness assertion below is exact.
    static SPAWN_LOCK: Mutex<()> = Mutex::new(());

    #[tokio::test]
    async fn collected_echo_round_trip() {
        let _guard = SPAWN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let result = run_collected(
            SpawnRequest::builder().program("/bin/echo").arg("hello").build(),
            Input::null(),
        )
        .await
        .unwrap();

        assert_eq!(result.status, TerminationStatus::Exited(0));
        assert_eq!(result.stdout, b"hello\n");
        assert_eq!(result.stderr, b"");
    }

    #[tokio::test]
    async fn waiter_map_returns_to_empty() {
        let _guard = SPAWN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..5 {
            let result = run_collected(SpawnRequest::new("/bin/true"), Input::null())
                .await
                .unwrap();
            assert!(result.status.success());
        }
        // Every awaited child must have been removed at rendezvous.
        assert_eq!(reaper::global().outstanding(), 0);
    }
}
