//! Process-wide child reaper.
//!
//! A single dispatcher task per process owns the SIGCHLD stream. Each
//! delivery runs a non-blocking wait-any loop (signals coalesce, so one
//! SIGCHLD may stand for several terminated children) and routes every
//! harvested status to its per-pid waiter. The rendezvous tolerates either
//! order of arrival: a status landing before anyone waits is parked as
//! `Ready`; a waiter arriving first parks as `Waiting`.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

/// How a child terminated.
///
/// Produced exactly once per child, by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationStatus {
    /// Normal exit with the given code.
    Exited(i32),

    /// Terminated by the given signal.
    Signaled(i32),
}

impl TerminationStatus {
    /// Returns `true` for a normal exit with code zero.
    #[must_use]
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// The exit code, if the child exited normally.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(_) => None,
        }
    }

    /// The terminating signal, if there was one.
    #[must_use]
    pub fn signal(&self) -> Option<i32> {
        match self {
            Self::Exited(_) => None,
            Self::Signaled(signal) => Some(*signal),
        }
    }
}

impl std::fmt::Display for TerminationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited (code: {code})"),
            Self::Signaled(signal) => write!(f, "signaled (signal: {signal})"),
        }
    }
}

/// How long a waiter sleeps before double-checking that the dispatcher is
/// still alive. Purely a self-healing backstop; deliveries normally arrive
/// through the SIGCHLD path well before this elapses.
const DISPATCHER_RECHECK: std::time::Duration = std::time::Duration::from_millis(500);

/// Rendezvous state for one outstanding child.
enum WaiterState {
    /// Someone is waiting; resume them when the status arrives.
    Waiting(oneshot::Sender<TerminationStatus>),

    /// The status arrived before anyone waited.
    Ready(TerminationStatus),
}

/// Global child reaper instance (lazily initialized).
static REAPER: OnceLock<Reaper> = OnceLock::new();

/// Get or initialize the global reaper.
pub(crate) fn global() -> &'static Reaper {
    REAPER.get_or_init(Reaper::new)
}

/// The reaper: a waiter map plus the handle of the dispatcher task.
pub(crate) struct Reaper {
    waiters: Mutex<HashMap<i32, WaiterState>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(None),
        }
    }

    /// Ensure the SIGCHLD dispatcher is running. Idempotent; must be
    /// called before every fork so no termination can slip by unobserved.
    ///
    /// The dispatcher lives on the current runtime. When that runtime
    /// shuts down (test binaries create several), the next install notices
    /// the finished task and re-arms on the runtime at hand; the catch-up
    /// drain below then collects anything that terminated in between.
    pub(crate) fn install(&'static self) -> Result<()> {
        let mut dispatcher = self
            .dispatcher
            .lock()
            .expect("reaper dispatcher lock poisoned");
        if let Some(handle) = dispatcher.as_ref() {
            if !handle.is_finished() {
                return Ok(());
            }
        }

        let mut stream = signal(SignalKind::child())?;
        let handle = tokio::spawn(async move {
            // The stream re-arms itself after every delivery; the loop only
            // ends when the runtime drops the signal driver.
            while stream.recv().await.is_some() {
                self.drain();
            }
        });
        *dispatcher = Some(handle);
        drop(dispatcher);

        // Catch up on anything that terminated while no dispatcher ran.
        self.drain();
        Ok(())
    }

    /// Await the termination status of `pid`.
    ///
    /// Cannot fail: it either completes with the child's status or stays
    /// suspended. At most one waiter per child is permitted.
    ///
    /// The wait periodically re-checks the dispatcher: if the runtime it
    /// lived on has shut down, a fresh one is installed on the waiter's
    /// runtime and its catch-up drain collects whatever terminated in the
    /// gap.
    ///
    /// # Panics
    ///
    /// Panics if a second waiter registers for the same pid.
    pub(crate) async fn wait_for(&'static self, pid: Pid) -> TerminationStatus {
        let mut receiver = {
            let mut waiters = self.waiters.lock().expect("reaper waiter lock poisoned");
            match waiters.remove(&pid.as_raw()) {
                Some(WaiterState::Ready(status)) => return status,
                Some(WaiterState::Waiting(_)) => {
                    panic!("child {pid} is already being awaited");
                },
                None => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.insert(pid.as_raw(), WaiterState::Waiting(sender));
                    receiver
                },
            }
        };
        loop {
            match tokio::time::timeout(DISPATCHER_RECHECK, &mut receiver).await {
                Ok(delivery) => {
                    return delivery.expect("SIGCHLD dispatcher dropped a pending waiter");
                },
                Err(_elapsed) => {
                    if let Err(err) = self.install() {
                        warn!(%pid, error = %err, "could not re-arm SIGCHLD dispatcher");
                    }
                },
            }
        }
    }

    /// Drop `pid`'s status, now or when it arrives.
    ///
    /// Used for children the caller will never observe (a child whose exec
    /// failed): the entry is removed immediately if the status already
    /// landed, otherwise a waiter with no listener is registered so the
    /// eventual delivery clears the map.
    pub(crate) fn discard(&self, pid: Pid) {
        let mut waiters = self.waiters.lock().expect("reaper waiter lock poisoned");
        match waiters.remove(&pid.as_raw()) {
            Some(WaiterState::Ready(status)) => {
                debug!(%pid, %status, "discarded termination status");
            },
            Some(state @ WaiterState::Waiting(_)) => {
                // Someone is genuinely waiting; leave them be.
                waiters.insert(pid.as_raw(), state);
            },
            None => {
                let (sender, _) = oneshot::channel();
                waiters.insert(pid.as_raw(), WaiterState::Waiting(sender));
            },
        }
    }

    /// Whether `pid`'s status has been harvested and is parked unclaimed.
    pub(crate) fn has_status(&self, pid: Pid) -> bool {
        let waiters = self.waiters.lock().expect("reaper waiter lock poisoned");
        matches!(waiters.get(&pid.as_raw()), Some(WaiterState::Ready(_)))
    }

    /// Number of map entries, waiting or parked. Test observability.
    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.waiters
            .lock()
            .expect("reaper waiter lock poisoned")
            .len()
    }

    /// Harvest every terminated child and route the statuses.
    ///
    /// Runs the whole loop under the map lock so a concurrently arriving
    /// waiter observes either the pre-reap or post-reap state, never a
    /// half-delivered one.
    fn drain(&self) {
        let mut waiters = self.waiters.lock().expect("reaper waiter lock poisoned");
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    Self::deliver(&mut waiters, pid, TerminationStatus::Exited(code));
                },
                Ok(WaitStatus::Signaled(pid, signal, _core_dumped)) => {
                    Self::deliver(&mut waiters, pid, TerminationStatus::Signaled(signal as i32));
                },
                // Stop/continue shapes are not terminal; keep draining.
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => {},
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => {},
                Err(errno) => {
                    warn!(%errno, "wait-any failed; stopping this drain pass");
                    break;
                },
            }
        }
    }

    fn deliver(
        waiters: &mut HashMap<i32, WaiterState>,
        pid: Pid,
        status: TerminationStatus,
    ) {
        debug!(%pid, %status, "reaped child");
        match waiters.remove(&pid.as_raw()) {
            Some(WaiterState::Waiting(sender)) => {
                // The waiter may have been cancelled; the status is then
                // dropped, which is the cancelled caller's contract.
                let _ = sender.send(status);
            },
            Some(WaiterState::Ready(previous)) => {
                warn!(%pid, %previous, "duplicate status for child; keeping the newer one");
                waiters.insert(pid.as_raw(), WaiterState::Ready(status));
            },
            None => {
                waiters.insert(pid.as_raw(), WaiterState::Ready(status));
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_predicates() {
        assert!(TerminationStatus::Exited(0).success());
        assert!(!TerminationStatus::Exited(7).success());
        assert!(!TerminationStatus::Signaled(15).success());
        assert_eq!(TerminationStatus::Exited(7).code(), Some(7));
        assert_eq!(TerminationStatus::Signaled(9).signal(), Some(9));
        assert_eq!(TerminationStatus::Signaled(9).code(), None);
    }

    #[test]
    fn status_display() {
        assert_eq!(TerminationStatus::Exited(0).to_string(), "exited (code: 0)");
        assert_eq!(
            TerminationStatus::Signaled(15).to_string(),
            "signaled (signal: 15)"
        );
    }

    #[tokio::test]
    async fn ready_before_wait_rendezvous() {
        // Box::leak stands in for the global's 'static lifetime.
        let reaper: &'static Reaper = Box::leak(Box::new(Reaper::new()));
        let pid = Pid::from_raw(999_999);
        {
            let mut waiters = reaper.waiters.lock().unwrap();
            Reaper::deliver(&mut waiters, pid, TerminationStatus::Exited(3));
        }
        assert!(reaper.has_status(pid));
        assert_eq!(reaper.wait_for(pid).await, TerminationStatus::Exited(3));
        assert_eq!(reaper.outstanding(), 0);
    }

    #[tokio::test]
    async fn wait_before_ready_rendezvous() {
        // Box::leak stands in for the global's 'static lifetime.
        let reaper: &'static Reaper = Box::leak(Box::new(Reaper::new()));
        let pid = Pid::from_raw(999_998);

        let waiter = tokio::spawn(reaper.wait_for(pid));
        tokio::task::yield_now().await;

        {
            let mut waiters = reaper.waiters.lock().unwrap();
            Reaper::deliver(&mut waiters, pid, TerminationStatus::Signaled(15));
        }
        assert_eq!(waiter.await.unwrap(), TerminationStatus::Signaled(15));
        assert_eq!(reaper.outstanding(), 0);
    }

    #[tokio::test]
    async fn discard_clears_parked_status() {
        let reaper = Reaper::new();
        let pid = Pid::from_raw(999_997);
        {
            let mut waiters = reaper.waiters.lock().unwrap();
            Reaper::deliver(&mut waiters, pid, TerminationStatus::Exited(127));
        }
        reaper.discard(pid);
        assert_eq!(reaper.outstanding(), 0);
    }

    #[tokio::test]
    async fn discard_before_status_clears_on_delivery() {
        let reaper = Reaper::new();
        let pid = Pid::from_raw(999_996);
        reaper.discard(pid);
        assert_eq!(reaper.outstanding(), 1);
        {
            let mut waiters = reaper.waiters.lock().unwrap();
            Reaper::deliver(&mut waiters, pid, TerminationStatus::Exited(127));
        }
        assert_eq!(reaper.outstanding(), 0);
    }
}
