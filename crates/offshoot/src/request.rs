//! Spawn requests - what to run and under which identity.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::PathBuf;

use crate::credentials::Credentials;
use crate::environment::Environment;

/// Specification of a process to spawn.
///
/// Built with [`SpawnRequest::builder`] and consumed by a single spawn.
///
/// # Examples
///
/// ```
/// use offshoot::SpawnRequest;
///
/// let request = SpawnRequest::builder()
///     .program("/bin/echo")
///     .arg("hello")
///     .build();
/// ```
#[derive(Debug)]
pub struct SpawnRequest {
    /// Program to execute: an absolute path is used verbatim, a bare name
    /// is searched across PATH.
    pub(crate) program: OsString,

    /// Override for argv\[0\]; defaults to the program as given.
    pub(crate) arg0: Option<OsString>,

    /// Arguments following argv\[0\].
    pub(crate) args: Vec<OsString>,

    /// Environment the child observes.
    pub(crate) environment: Environment,

    /// Working directory; `None` inherits the parent's.
    pub(crate) working_dir: Option<PathBuf>,

    /// Credential and session settings applied in the child.
    pub(crate) credentials: Credentials,
}

impl SpawnRequest {
    /// Create a request for `program` with defaults everywhere else.
    #[must_use]
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self::builder().program(program).build()
    }

    /// Create a new builder for `SpawnRequest`.
    #[must_use]
    pub fn builder() -> SpawnRequestBuilder {
        SpawnRequestBuilder::default()
    }
}

/// Builder for [`SpawnRequest`].
#[derive(Debug, Default)]
pub struct SpawnRequestBuilder {
    program: Option<OsString>,
    arg0: Option<OsString>,
    args: Vec<OsString>,
    environment: Environment,
    working_dir: Option<PathBuf>,
    credentials: Credentials,
}

impl SpawnRequestBuilder {
    /// Set the program to execute.
    #[must_use]
    pub fn program(mut self, program: impl AsRef<OsStr>) -> Self {
        self.program = Some(program.as_ref().to_os_string());
        self
    }

    /// Override argv\[0\] seen by the child.
    #[must_use]
    pub fn arg0(mut self, arg0: impl AsRef<OsStr>) -> Self {
        self.arg0 = Some(arg0.as_ref().to_os_string());
        self
    }

    /// Append a single argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    /// Set the environment (inherited with a spawn-time snapshot by
    /// default).
    #[must_use]
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Set the working directory. If it equals the parent's current
    /// directory at spawn time, no chdir is issued in the child.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the user id the child assumes.
    #[must_use]
    pub fn uid(mut self, uid: u32) -> Self {
        self.credentials.uid = Some(uid);
        self
    }

    /// Set the group id the child assumes.
    #[must_use]
    pub fn gid(mut self, gid: u32) -> Self {
        self.credentials.gid = Some(gid);
        self
    }

    /// Replace the child's supplementary group memberships.
    #[must_use]
    pub fn supplementary_groups<I>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        self.credentials.supplementary_groups = Some(groups.into_iter().collect());
        self
    }

    /// Join the given process group. Mutually exclusive with
    /// [`create_session`](Self::create_session).
    #[must_use]
    pub fn process_group(mut self, pgid: i32) -> Self {
        self.credentials.process_group = Some(pgid);
        self
    }

    /// Create a new session with the child as leader, detaching the
    /// controlling terminal. Mutually exclusive with
    /// [`process_group`](Self::process_group).
    #[must_use]
    pub fn create_session(mut self, create: bool) -> Self {
        self.credentials.create_session = create;
        self
    }

    /// Register a hook run in the child between fork and exec.
    ///
    /// # Safety
    ///
    /// The hook runs after fork in a process that may have forked from a
    /// multithreaded parent: it must only perform async-signal-safe
    /// operations (no allocation, no locks, no stdio). Returning an error
    /// aborts the spawn and is reported to the parent.
    #[must_use]
    pub unsafe fn pre_exec<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> io::Result<()> + Send + Sync + 'static,
    {
        self.credentials.pre_exec = Some(Box::new(hook));
        self
    }

    /// Build the `SpawnRequest`.
    ///
    /// # Panics
    ///
    /// Panics if `program` is not set.
    #[must_use]
    pub fn build(self) -> SpawnRequest {
        SpawnRequest {
            program: self.program.expect("program is required"),
            arg0: self.arg0,
            args: self.args,
            environment: self.environment,
            working_dir: self.working_dir,
            credentials: self.credentials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_fields() {
        let request = SpawnRequest::builder()
            .program("/bin/echo")
            .arg("hello")
            .args(["wide", "world"])
            .working_dir("/tmp")
            .build();

        assert_eq!(request.program, "/bin/echo");
        assert_eq!(request.args, ["hello", "wide", "world"]);
        assert_eq!(request.working_dir, Some(PathBuf::from("/tmp")));
        assert!(request.credentials.is_empty());
    }

    #[test]
    #[should_panic(expected = "program is required")]
    fn build_without_program_panics() {
        let _ = SpawnRequest::builder().arg("orphan").build();
    }

    #[test]
    fn credential_setters_populate_block() {
        let request = SpawnRequest::builder()
            .program("/bin/true")
            .uid(65534)
            .gid(65534)
            .supplementary_groups([100])
            .create_session(true)
            .build();

        assert_eq!(request.credentials.uid, Some(65534));
        assert!(request.credentials.create_session);
        assert!(request.credentials.validate().is_ok());
    }
}
