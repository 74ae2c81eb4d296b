//! # offshoot
//!
//! Asynchronous subprocess execution for POSIX/Linux targets: spawn
//! children with precisely controlled standard I/O, credentials, and
//! session state; reap their termination through a process-wide SIGCHLD
//! dispatcher; and drain standard output and standard error concurrently
//! without deadlock.
//!
//! ## Features
//!
//! - **Controlled spawning**: direct fork/exec with an error pipe, so
//!   failures between fork and exec surface as typed errors and never
//!   leave a zombie
//! - **Credentials**: uid/gid, supplementary groups, process group or new
//!   session, and an async-signal-safe pre-exec hook
//! - **Async reaping**: a single SIGCHLD dispatcher per process routes
//!   termination statuses to per-pid waiters
//! - **Deadlock-free capture**: both output pipes are drained concurrently;
//!   a child interleaving large writes on both cannot stall
//!
//! ## Example
//!
//! ```rust,no_run
//! use offshoot::{run_collected, Input, SpawnRequest};
//!
//! # async fn example() -> Result<(), offshoot::Error> {
//! let request = SpawnRequest::builder()
//!     .program("/bin/echo")
//!     .arg("hello")
//!     .build();
//!
//! let result = run_collected(request, Input::null()).await?;
//! assert!(result.status.success());
//! assert_eq!(result.stdout, b"hello\n");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod credentials;
pub mod environment;
pub mod error;
pub mod execution;
pub mod io;
mod pipe;
mod reaper;
pub mod request;
mod run;
mod spawner;
pub mod stdio;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::credentials::Credentials;
    pub use crate::environment::Environment;
    pub use crate::error::Error;
    pub use crate::execution::Execution;
    pub use crate::request::SpawnRequest;
    pub use crate::run::{run, run_collected, run_detached, CollectedResult};
    pub use crate::stdio::{Input, Output};
    pub use crate::TerminationStatus;
}

/// Re-export commonly used types at the crate root.
pub use credentials::Credentials;
pub use environment::Environment;
pub use error::Error;
pub use execution::Execution;
pub use reaper::TerminationStatus;
pub use request::{SpawnRequest, SpawnRequestBuilder};
pub use run::{run, run_collected, run_detached, CollectedResult};
pub use stdio::{Input, Output};

/// Signals deliverable to a child via
/// [`Execution::send_signal`](execution::Execution::send_signal).
pub use nix::sys::signal::Signal;
