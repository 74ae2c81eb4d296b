//! Direct fork/exec spawning.
//!
//! Everything the child needs is materialized in the parent before the
//! fork: resolved executable path, argv/envp as contiguous null-terminated
//! pointer arrays, credential scratch, and the stdio descriptors. The
//! post-fork window in the child therefore performs only async-signal-safe
//! libc calls on pre-built memory - no allocation, no locks.
//!
//! Failures between fork and exec are reported to the parent through a
//! close-on-exec pipe as `[stage, errno_be32]`; exec success closes the
//! pipe and the parent reads EOF.

use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, info, warn};

use crate::credentials::{CredentialScratch, PreExecHook};
use crate::environment;
use crate::error::{Error, Result};
use crate::execution::Execution;
use crate::pipe::CreatedPipe;
use crate::reaper;
use crate::request::SpawnRequest;
use crate::stdio::{self, Input, Output};

/// Exit code of a child that failed between fork and exec. The reaper
/// harvests it like any other status; the parent reports the decoded error
/// from the pipe instead.
const EXIT_CHILD_SETUP_FAILED: i32 = 127;

/// Stages of the child-side sequence, reported on failure.
const STAGE_CHDIR: u8 = 1;
const STAGE_GROUPS: u8 = 2;
const STAGE_GID: u8 = 3;
const STAGE_UID: u8 = 4;
const STAGE_SESSION: u8 = 5;
const STAGE_PGROUP: u8 = 6;
const STAGE_DUP2: u8 = 7;
const STAGE_PRE_EXEC: u8 = 8;
const STAGE_EXEC: u8 = 9;
const STAGE_SIGPIPE: u8 = 10;

fn stage_name(stage: u8) -> &'static str {
    match stage {
        STAGE_CHDIR => "chdir",
        STAGE_GROUPS => "setgroups",
        STAGE_GID => "setgid",
        STAGE_UID => "setuid",
        STAGE_SESSION => "setsid",
        STAGE_PGROUP => "setpgid",
        STAGE_DUP2 => "dup2",
        STAGE_PRE_EXEC => "pre-exec hook",
        STAGE_EXEC => "exec",
        STAGE_SIGPIPE => "sigpipe reset",
        _ => "unknown",
    }
}

/// Null-terminated array of C strings, stable for the duration of a spawn.
#[derive(Debug)]
struct CStringArray {
    /// Backing storage the pointer array points into; must outlive exec.
    #[allow(dead_code)]
    items: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl CStringArray {
    fn new(items: Vec<CString>) -> Self {
        let mut ptrs: Vec<*const libc::c_char> =
            items.iter().map(|item| item.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        Self { items, ptrs }
    }

    fn as_ptr(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

fn cstring(value: &OsStr, what: &str) -> Result<CString> {
    CString::new(value.as_bytes())
        .map_err(|_| Error::InvalidConfiguration(format!("nul byte in {what}")))
}

/// Resolve the program to the path handed to execve.
///
/// A program containing a slash is used verbatim (a missing path fails
/// before the fork). A bare name is searched across the PATH of the
/// child's effective environment, falling back to the parent's.
fn resolve_executable(program: &OsStr, envp: &[CString]) -> Result<CString> {
    let display = program.to_string_lossy().into_owned();
    if program.is_empty() {
        return Err(Error::ExecutableNotFound(display));
    }

    if program.as_bytes().contains(&b'/') {
        match Path::new(program).metadata() {
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::ExecutableNotFound(display));
            },
            // Other failures (permissions, dangling components) surface
            // from exec with the right errno.
            _ => {},
        }
        return cstring(program, "program path");
    }

    let parent_path = std::env::var_os("PATH").unwrap_or_default();
    let path = environment::lookup(envp, "PATH").unwrap_or_else(|| parent_path.as_bytes());

    for dir in path.split(|&byte| byte == b':') {
        let mut candidate = Vec::with_capacity(dir.len() + program.len() + 2);
        // POSIX: an empty PATH entry means the current directory.
        candidate.extend_from_slice(if dir.is_empty() { b"." } else { dir });
        candidate.push(b'/');
        candidate.extend_from_slice(program.as_bytes());
        let Ok(candidate) = CString::new(candidate) else {
            continue;
        };
        // SAFETY: candidate is a valid nul-terminated path.
        if unsafe { libc::access(candidate.as_ptr(), libc::X_OK) } == 0 {
            return Ok(candidate);
        }
    }
    Err(Error::ExecutableNotFound(display))
}

fn materialize_argv(
    program: &OsStr,
    arg0: Option<&OsString>,
    args: &[OsString],
) -> Result<CStringArray> {
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(cstring(arg0.map_or(program, OsString::as_os_str), "argv[0]")?);
    for arg in args {
        argv.push(cstring(arg, "argument")?);
    }
    Ok(CStringArray::new(argv))
}

/// The working directory the child must chdir into, or `None` when it
/// already equals the parent's current directory.
fn effective_cwd(requested: Option<&Path>) -> Result<Option<CString>> {
    let Some(dir) = requested else {
        return Ok(None);
    };
    if std::env::current_dir().is_ok_and(|current| current == dir) {
        return Ok(None);
    }
    cstring(dir.as_os_str(), "working directory").map(Some)
}

/// Everything the child touches after the fork. All memory is owned by the
/// parent's call frame and outlives the exec.
struct ChildContext<'a> {
    exe: &'a CString,
    argv: &'a CStringArray,
    envp: &'a CStringArray,
    cwd: Option<&'a CString>,
    scratch: &'a CredentialScratch,
    pre_exec: Option<&'a mut PreExecHook>,
    stdin: RawFd,
    stdout: RawFd,
    stderr: RawFd,
    error_fd: RawFd,
}

/// Spawn the request. Returns the execution handle and the child's pid.
pub(crate) fn spawn(
    request: SpawnRequest,
    input: Input,
    output: Output,
    error: Output,
) -> Result<(Execution, Pid)> {
    let SpawnRequest {
        program,
        arg0,
        args,
        environment,
        working_dir,
        mut credentials,
    } = request;

    credentials.validate()?;
    debug!(program = ?program, args = ?args, "spawning child process");

    let envp_items = environment.materialize()?;
    let exe = resolve_executable(&program, &envp_items)?;
    let argv = materialize_argv(&program, arg0.as_ref(), &args)?;
    let envp = CStringArray::new(envp_items);
    let cwd = effective_cwd(working_dir.as_deref())?;
    let scratch = credentials.scratch();
    let mut pre_exec = credentials.pre_exec.take();

    // The reaper must observe SIGCHLD before any child of ours can exist.
    reaper::global().install()?;

    let (child_ends, parent_ends) = stdio::prepare(input, output, error)?;
    let mut error_pipe = CreatedPipe::new().map_err(Error::Io)?;

    let error_write = error_pipe
        .take_write()
        .expect("fresh pipe has a write end");

    let ctx = ChildContext {
        exe: &exe,
        argv: &argv,
        envp: &envp,
        cwd: cwd.as_ref(),
        scratch: &scratch,
        pre_exec: pre_exec.as_mut(),
        stdin: child_ends.stdin,
        stdout: child_ends.stdout,
        stderr: child_ends.stderr,
        error_fd: error_write.as_raw_fd(),
    };

    // SAFETY: the child branch only runs async-signal-safe code on memory
    // materialized above, then execs or _exits.
    let fork_result = unsafe { fork() };
    let child = match fork_result {
        Ok(ForkResult::Child) => {
            // SAFETY: we are the child, single-threaded by definition.
            unsafe { exec_child(ctx) }
        },
        Ok(ForkResult::Parent { child }) => child,
        Err(errno) => {
            child_ends.close_in_parent();
            return Err(Error::from_child_errno(errno as i32, "fork"));
        },
    };

    // Child-destined ends belong to the child now; release the parent's
    // copies so EOF propagates correctly.
    child_ends.close_in_parent();
    drop(error_write);

    if let Some((stage, errno)) = read_spawn_error(&mut error_pipe)? {
        // The child exited with the sentinel code; hand its status to the
        // reaper so no zombie remains and the map stays clean.
        reaper::global().discard(child);
        debug!(
            %child,
            stage = stage_name(stage),
            errno,
            "child failed before exec"
        );
        return Err(Error::from_child_errno(
            errno,
            &program.to_string_lossy(),
        ));
    }

    info!(pid = %child, program = ?program, "spawned child process");

    match Execution::new(child, parent_ends) {
        Ok(execution) => Ok((execution, child)),
        Err(err) => {
            // The exec already succeeded; the child runs unobserved. Let
            // the reaper clean up whenever it terminates.
            warn!(pid = %child, error = %err, "failed to register pipe endpoints");
            reaper::global().discard(child);
            Err(Error::Io(err))
        },
    }
}

/// Read the child's `[stage, errno_be32]` report, or `None` on the EOF that
/// signals a successful exec.
fn read_spawn_error(error_pipe: &mut CreatedPipe) -> Result<Option<(u8, i32)>> {
    let fd = error_pipe
        .read_fd()
        .expect("error pipe read end is held until decoded");
    let mut buf = [0u8; 5];
    let mut filled = 0;
    while filled < buf.len() {
        // SAFETY: reading into a stack buffer we own; blocking is fine, the
        // pipe closes on exec.
        let n = unsafe {
            libc::read(
                fd,
                buf[filled..].as_mut_ptr().cast(),
                buf.len() - filled,
            )
        };
        match n {
            0 => break,
            n if n < 0 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error_pipe.close_all();
                return Err(Error::Io(err));
            },
            #[allow(clippy::cast_sign_loss)]
            n => filled += n as usize,
        }
    }
    error_pipe.close_all();

    match filled {
        0 => Ok(None),
        5 => {
            let errno = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
            Ok(Some((buf[0], errno)))
        },
        _ => {
            // A write of at most PIPE_BUF bytes is atomic; a short report
            // means the child died mid-write.
            Ok(Some((STAGE_EXEC, libc::EINVAL)))
        },
    }
}

/// Report a failed stage through the error pipe and exit with the
/// sentinel code. Runs in the child.
unsafe fn report_and_exit(error_fd: RawFd, stage: u8) -> ! {
    let errno = io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL);
    let errno_bytes = errno.to_be_bytes();
    let report = [
        stage,
        errno_bytes[0],
        errno_bytes[1],
        errno_bytes[2],
        errno_bytes[3],
    ];
    // A report this small is atomic on a pipe; nothing useful can be done
    // if the write itself fails.
    libc::write(error_fd, report.as_ptr().cast(), report.len());
    libc::_exit(EXIT_CHILD_SETUP_FAILED);
}

/// dup2 with EINTR retry.
unsafe fn dup2_retry(from: RawFd, to: RawFd) -> libc::c_int {
    loop {
        let ret = libc::dup2(from, to);
        if ret >= 0 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            return ret;
        }
    }
}

/// Close every descriptor above stderr except `keep`.
///
/// Anything the library created is close-on-exec already; this sweeps
/// descriptors inherited from elsewhere in the parent.
unsafe fn close_descriptors_above_stderr(keep: RawFd) {
    #[allow(clippy::cast_sign_loss)]
    let keep = keep as libc::c_uint;
    let mut swept = true;
    if keep > 3 {
        swept &= libc::close_range(3, keep - 1, 0) == 0;
    }
    if keep < libc::c_uint::MAX {
        swept &= libc::close_range(keep + 1, libc::c_uint::MAX, 0) == 0;
    }
    if swept {
        return;
    }

    // close_range is unavailable (pre-5.9 kernels): walk the table.
    let max = libc::sysconf(libc::_SC_OPEN_MAX);
    let max = if max > 0 { max as RawFd } else { 65536 };
    for fd in 3..max {
        if fd as libc::c_uint != keep {
            libc::close(fd);
        }
    }
}

/// The child-side sequence: working directory, credentials, session, stdio,
/// descriptor hygiene, pre-exec hook, exec. Order matters: supplementary
/// groups must be set while still privileged, and session creation
/// implies the process group, which is why the two are exclusive.
///
/// # Safety
///
/// Must only be called in the forked child. Performs only
/// async-signal-safe operations on memory materialized pre-fork.
unsafe fn exec_child(ctx: ChildContext<'_>) -> ! {
    let error_fd = ctx.error_fd;

    if let Some(cwd) = ctx.cwd {
        if libc::chdir(cwd.as_ptr()) != 0 {
            report_and_exit(error_fd, STAGE_CHDIR);
        }
    }

    if let Some(groups) = &ctx.scratch.groups {
        if libc::setgroups(groups.len(), groups.as_ptr()) != 0 {
            report_and_exit(error_fd, STAGE_GROUPS);
        }
    }
    if let Some(gid) = ctx.scratch.gid {
        if libc::setgid(gid) != 0 {
            report_and_exit(error_fd, STAGE_GID);
        }
    }
    if let Some(uid) = ctx.scratch.uid {
        if libc::setuid(uid) != 0 {
            report_and_exit(error_fd, STAGE_UID);
        }
    }

    if ctx.scratch.create_session {
        if libc::setsid() < 0 {
            report_and_exit(error_fd, STAGE_SESSION);
        }
    } else if let Some(pgid) = ctx.scratch.process_group {
        if libc::setpgid(0, pgid) != 0 {
            report_and_exit(error_fd, STAGE_PGROUP);
        }
    }

    // The Rust runtime ignores SIGPIPE process-wide and that disposition
    // would survive exec; the child gets the default back.
    if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
        report_and_exit(error_fd, STAGE_SIGPIPE);
    }

    if dup2_retry(ctx.stdin, libc::STDIN_FILENO) < 0
        || dup2_retry(ctx.stdout, libc::STDOUT_FILENO) < 0
        || dup2_retry(ctx.stderr, libc::STDERR_FILENO) < 0
    {
        report_and_exit(error_fd, STAGE_DUP2);
    }

    close_descriptors_above_stderr(error_fd);

    if let Some(hook) = ctx.pre_exec {
        if let Err(err) = hook() {
            let errno = err.raw_os_error().unwrap_or(libc::EINVAL);
            let errno_bytes = errno.to_be_bytes();
            let report = [
                STAGE_PRE_EXEC,
                errno_bytes[0],
                errno_bytes[1],
                errno_bytes[2],
                errno_bytes[3],
            ];
            libc::write(error_fd, report.as_ptr().cast(), report.len());
            libc::_exit(EXIT_CHILD_SETUP_FAILED);
        }
    }

    libc::execve(ctx.exe.as_ptr(), ctx.argv.as_ptr(), ctx.envp.as_ptr());
    report_and_exit(error_fd, STAGE_EXEC);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;

    #[test]
    fn absolute_path_used_verbatim() {
        let envp = Environment::inherit().materialize().unwrap();
        let exe = resolve_executable(OsStr::new("/bin/sh"), &envp).unwrap();
        assert_eq!(exe.as_bytes(), b"/bin/sh");
    }

    #[test]
    fn missing_absolute_path_fails_before_fork() {
        let envp = Environment::inherit().materialize().unwrap();
        let err = resolve_executable(OsStr::new("/does/not/exist"), &envp).unwrap_err();
        assert!(matches!(err, Error::ExecutableNotFound(_)));
    }

    #[test]
    fn bare_name_searches_path() {
        let envp = Environment::inherit().materialize().unwrap();
        let exe = resolve_executable(OsStr::new("sh"), &envp).unwrap();
        assert!(exe.as_bytes().ends_with(b"/sh"));
        assert!(exe.as_bytes().contains(&b'/'));
    }

    #[test]
    fn bare_name_uses_child_environment_path() {
        let envp = Environment::replace([("PATH", "/definitely/not/here")])
            .materialize()
            .unwrap();
        let err = resolve_executable(OsStr::new("sh"), &envp).unwrap_err();
        assert!(matches!(err, Error::ExecutableNotFound(_)));
    }

    #[test]
    fn argv_starts_with_program_and_is_null_terminated() {
        let argv = materialize_argv(
            OsStr::new("/bin/echo"),
            None,
            &[OsString::from("hello")],
        )
        .unwrap();
        assert_eq!(argv.items.len(), 2);
        assert_eq!(argv.items[0].as_bytes(), b"/bin/echo");
        assert_eq!(argv.ptrs.len(), 3);
        assert!(argv.ptrs[2].is_null());
    }

    #[test]
    fn arg0_override_replaces_first_element() {
        let argv = materialize_argv(OsStr::new("/bin/sh"), Some(&OsString::from("-sh")), &[])
            .unwrap();
        assert_eq!(argv.items[0].as_bytes(), b"-sh");
    }

    #[test]
    fn nul_in_argument_is_rejected() {
        let err = materialize_argv(
            OsStr::new("/bin/echo"),
            None,
            &[OsString::from("a\0b")],
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn cwd_equal_to_current_is_suppressed() {
        let current = std::env::current_dir().unwrap();
        assert!(effective_cwd(Some(&current)).unwrap().is_none());
    }

    #[test]
    fn cwd_differing_from_current_is_kept() {
        let cwd = effective_cwd(Some(Path::new("/"))).unwrap();
        assert_eq!(cwd.unwrap().as_bytes(), b"/");
    }
}
