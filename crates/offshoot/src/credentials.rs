//! Credential and session configuration applied in the child before exec.
//!
//! All of these take effect between fork and exec, in the child only; the
//! parent's credentials are never touched. Supplementary groups are applied
//! first (while still privileged), then the gid, then the uid. Creating a
//! new session implicitly creates a process group, so the two settings are
//! mutually exclusive.

use std::fmt;
use std::io;

use crate::error::{Error, Result};

/// Hook run in the child after fork, immediately before exec.
///
/// The hook runs in the post-fork window where only async-signal-safe
/// operations are sound: no allocation, no locks, no stdio.
pub type PreExecHook = Box<dyn FnMut() -> io::Result<()> + Send + Sync + 'static>;

/// Credential block of a spawn request.
#[derive(Default)]
pub struct Credentials {
    /// User id to assume (real, effective, and saved).
    pub(crate) uid: Option<u32>,

    /// Group id to assume (real, effective, and saved).
    pub(crate) gid: Option<u32>,

    /// Supplementary group memberships, replacing the inherited set.
    pub(crate) supplementary_groups: Option<Vec<u32>>,

    /// Process group to join. Mutually exclusive with `create_session`.
    pub(crate) process_group: Option<i32>,

    /// Create a new session with the child as leader, detaching the
    /// controlling terminal.
    pub(crate) create_session: bool,

    /// Hook run between fork and exec.
    pub(crate) pre_exec: Option<PreExecHook>,
}

impl Credentials {
    /// Returns `true` when nothing needs to happen in the child.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uid.is_none()
            && self.gid.is_none()
            && self.supplementary_groups.is_none()
            && self.process_group.is_none()
            && !self.create_session
            && self.pre_exec.is_none()
    }

    /// Reject combinations the kernel cannot honor.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.create_session && self.process_group.is_some() {
            return Err(Error::InvalidConfiguration(
                "create_session and process_group are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    /// Raw scratch values for the post-fork window, prepared in the parent
    /// so the child allocates nothing.
    pub(crate) fn scratch(&self) -> CredentialScratch {
        CredentialScratch {
            uid: self.uid.map(|uid| uid as libc::uid_t),
            gid: self.gid.map(|gid| gid as libc::gid_t),
            groups: self
                .supplementary_groups
                .as_ref()
                .map(|groups| groups.iter().map(|&g| g as libc::gid_t).collect()),
            process_group: self.process_group.map(|pg| pg as libc::pid_t),
            create_session: self.create_session,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("supplementary_groups", &self.supplementary_groups)
            .field("process_group", &self.process_group)
            .field("create_session", &self.create_session)
            .field("pre_exec", &self.pre_exec.as_ref().map(|_| "…"))
            .finish()
    }
}

/// Parent-materialized credential values, consumed by the child sequence.
pub(crate) struct CredentialScratch {
    pub(crate) uid: Option<libc::uid_t>,
    pub(crate) gid: Option<libc::gid_t>,
    pub(crate) groups: Option<Vec<libc::gid_t>>,
    pub(crate) process_group: Option<libc::pid_t>,
    pub(crate) create_session: bool,
}
