//! POSIX pty backend.
//!
//! Allocates a master/slave pair with `openpty`, forks, and execs the program
//! as a session leader with the slave as its controlling terminal. `setsid`
//! already makes the child a process group leader; `setpgid` must not be
//! used on top of it.
//!
//! The master is non-blocking. Reads and writes wait in `poll` on the master
//! and on a wake pipe, so `close` can interrupt them; the descriptor itself
//! is closed once the last in-flight call lets go of it.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, fork, pipe, ForkResult, Pid};
use tracing::{debug, trace};

use super::latch::ExitLatch;
use super::normalize::normalize;
use super::session::Pty;
use crate::config::{LaunchConfig, ShutdownPolicy, TermSize};
use crate::error::{CloseFailure, Error, Result};

/// Exit status reported by the child when it fails before `execve` succeeds.
const EXEC_FAILED: libc::c_int = 127;

nix::ioctl_read_bad!(get_winsize, libc::TIOCGWINSZ, Winsize);
nix::ioctl_write_ptr_bad!(set_winsize, libc::TIOCSWINSZ, Winsize);

/// A process running on a POSIX pty.
pub struct UnixPty {
    master: Master,
    pid: Pid,
    exit: Arc<ExitLatch>,
    policy: Mutex<ShutdownPolicy>,
    closed: OnceLock<std::result::Result<(), CloseFailure>>,
}

impl UnixPty {
    /// Normalize `config`, allocate a pty and spawn the program on it.
    pub fn start(config: LaunchConfig) -> Result<Self> {
        let config = normalize(config)?;
        let command = ExecCommand::new(&config)?;

        let winsize = to_winsize(config.size);
        let pair = openpty(Some(&winsize), None)
            .map_err(|errno| Error::PtyAllocation(errno.into()))?;
        set_cloexec(pair.master.as_raw_fd())
            .and_then(|()| set_cloexec(pair.slave.as_raw_fd()))
            .and_then(|()| set_nonblocking(pair.master.as_raw_fd()))
            .map_err(|errno| Error::PtyAllocation(errno.into()))?;
        let master = Master::new(pair.master).map_err(Error::PtyAllocation)?;
        trace!(rows = config.size.rows, cols = config.size.cols, "pty allocated");

        let (err_read, err_write) = cloexec_pipe().map_err(Error::ProcessSpawn)?;

        // SAFETY: the child only performs async-signal-safe libc calls on
        // buffers prepared before the fork, then execs or exits.
        let pid = match unsafe { fork() } {
            Ok(ForkResult::Child) => unsafe {
                command.exec(pair.slave.as_raw_fd(), err_write.as_raw_fd())
            },
            Ok(ForkResult::Parent { child }) => child,
            Err(errno) => return Err(Error::ProcessSpawn(errno.into())),
        };

        drop(pair.slave);
        drop(err_write);

        if let Some(errno) = read_exec_error(err_read) {
            reap(pid);
            return Err(Error::ProcessSpawn(io::Error::from_raw_os_error(errno)));
        }
        debug!(pid = pid.as_raw(), program = %config.argv[0], "spawned pty process");

        let exit = Arc::new(ExitLatch::new());
        let watcher_exit = Arc::clone(&exit);
        let watcher = thread::Builder::new()
            .name(format!("xpty-wait-{pid}"))
            .spawn(move || {
                let code = wait_exit_code(pid);
                trace!(pid = pid.as_raw(), code, "process exited");
                watcher_exit.fire(code);
            });
        if let Err(e) = watcher {
            let _ = kill(pid, Signal::SIGKILL);
            reap(pid);
            return Err(Error::ProcessSpawn(e));
        }

        Ok(Self {
            master,
            pid,
            exit,
            policy: Mutex::new(ShutdownPolicy::default()),
            closed: OnceLock::new(),
        })
    }

    /// Current terminal size as seen by the kernel.
    pub fn size(&self) -> Result<TermSize> {
        let fd = self.master.get().ok_or_else(closed_error).map_err(Error::Resize)?;
        let mut ws = to_winsize(TermSize::default());
        // SAFETY: `ws` is a valid winsize and `fd` keeps the descriptor open.
        unsafe { get_winsize(fd.as_raw_fd(), &mut ws) }
            .map_err(|errno| Error::Resize(errno.into()))?;
        Ok(TermSize::with_pixels(ws.ws_row, ws.ws_col, ws.ws_xpixel, ws.ws_ypixel))
    }

    fn shut_down(&self) -> std::result::Result<(), CloseFailure> {
        let policy = *self.policy.lock().unwrap_or_else(PoisonError::into_inner);

        // Closing the master hangs up the child's foreground process group.
        self.master.close();

        if self.exit.wait_timeout(policy.force_kill_delay).is_some() {
            return Ok(());
        }

        debug!(
            pid = self.pid.as_raw(),
            signal = policy.force_kill_signal.as_str(),
            "process survived hangup, killing"
        );

        match escalation(signal_group(self.pid, policy.force_kill_signal)) {
            Escalation::Done => Ok(()),
            Escalation::Fail(failure) => Err(failure),
            Escalation::Await { pending } => {
                settle(pending, self.exit.wait_timeout(policy.kill_grace()))
            }
        }
    }
}

impl Pty for UnixPty {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(fd) = self.master.get() else {
            return Ok(0);
        };
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if !self.master.ready(&fd, PollFlags::POLLIN)? {
                return Ok(0);
            }
            match unistd::read(fd.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EAGAIN | Errno::EINTR) => continue,
                // Linux reports EIO once the slave side has no open references.
                Err(Errno::EIO) => return Ok(0),
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.master.get().ok_or_else(closed_error)?;
        loop {
            match unistd::write(fd.as_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    if !self.master.ready(&fd, PollFlags::POLLOUT)? {
                        return Err(closed_error());
                    }
                }
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    fn resize(&self, size: TermSize) -> Result<()> {
        let fd = self.master.get().ok_or_else(closed_error).map_err(Error::Resize)?;
        let ws = to_winsize(size);
        // SAFETY: `ws` outlives the call and `fd` keeps the descriptor open.
        unsafe { set_winsize(fd.as_raw_fd(), &ws) }
            .map_err(|errno| Error::Resize(errno.into()))?;
        Ok(())
    }

    fn set_shutdown_policy(&self, policy: ShutdownPolicy) -> Result<()> {
        policy.validate()?;
        *self.policy.lock().unwrap_or_else(PoisonError::into_inner) = policy;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        (*self.closed.get_or_init(|| self.shut_down())).map_err(Error::from)
    }

    fn wait(&self) -> i32 {
        self.exit.wait()
    }

    fn try_wait(&self) -> Option<i32> {
        self.exit.try_get()
    }

    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }
}

/// Next step of the escalation once the group has been signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    /// The group is already gone.
    Done,
    /// Wait out the kill grace; `pending` is reported if no exit arrives.
    Await { pending: Option<CloseFailure> },
    Fail(CloseFailure),
}

fn escalation(signalled: nix::Result<()>) -> Escalation {
    match signalled {
        Ok(()) => Escalation::Await { pending: None },
        Err(Errno::ESRCH) => Escalation::Done,
        // The pid may have been recycled; if so the real exit is imminent.
        Err(Errno::EPERM) => Escalation::Await {
            pending: Some(CloseFailure::PermissionDenied(Errno::EPERM as i32)),
        },
        Err(errno) => Escalation::Fail(CloseFailure::Signal(errno as i32)),
    }
}

/// An exit seen during the grace period wins over any pending signal error.
fn settle(
    pending: Option<CloseFailure>,
    exit: Option<i32>,
) -> std::result::Result<(), CloseFailure> {
    match exit {
        Some(_) => Ok(()),
        None => Err(pending.unwrap_or(CloseFailure::KillTimeout)),
    }
}

/// Send `signal` to the child's process group.
///
/// Review: for `pid > 1` this targets `-pid`, the whole group the child
/// leads, not only the leader. Inside some containers or pid namespaces that
/// group can be wider than expected; the plain pid is used for `pid <= 1` so
/// we never signal everything we can reach.
fn signal_group(pid: Pid, signal: Signal) -> nix::Result<()> {
    let target = if pid.as_raw() > 1 {
        Pid::from_raw(-pid.as_raw())
    } else {
        pid
    };
    kill(target, signal)
}

fn wait_exit_code(pid: Pid) -> i32 {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(..)) => return -1,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => return -1,
        }
    }
}

fn reap(pid: Pid) {
    let _ = wait_exit_code(pid);
}

fn to_winsize(size: TermSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: size.pixel_width,
        ws_ypixel: size.pixel_height,
    }
}

fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = pipe()?;
    set_cloexec(read.as_raw_fd())?;
    set_cloexec(write.as_raw_fd())?;
    Ok((read, write))
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pty is closed")
}

/// Wait for the child to either exec (pipe closes empty) or report the errno
/// that stopped it.
fn read_exec_error(pipe: OwnedFd) -> Option<i32> {
    let mut buf = [0u8; 4];
    match File::from(pipe).read_exact(&mut buf) {
        Ok(()) => Some(i32::from_ne_bytes(buf)),
        Err(_) => None,
    }
}

/// The pty master and the pipe that wakes callers parked in [`Master::ready`].
///
/// Callers hold an `Arc` clone of the descriptor for the length of one call,
/// so closing never pulls a descriptor out from under them and the number
/// can't be reused by an unrelated `open` while they still use it.
struct Master {
    open: Mutex<Option<Open>>,
    wake: OwnedFd,
}

struct Open {
    fd: Arc<OwnedFd>,
    /// Dropping the write end makes `wake` readable for every poller.
    trigger: OwnedFd,
}

impl Master {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        let (wake, trigger) = cloexec_pipe()?;
        Ok(Self {
            open: Mutex::new(Some(Open {
                fd: Arc::new(fd),
                trigger,
            })),
            wake,
        })
    }

    fn get(&self) -> Option<Arc<OwnedFd>> {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.as_ref().map(|open| Arc::clone(&open.fd))
    }

    /// Drop our reference and wake everyone waiting on the master. The
    /// descriptor closes when the last in-flight call returns.
    fn close(&self) {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Open { fd, trigger }) = open {
            drop(fd);
            drop(trigger);
        }
    }

    /// Block until `fd` is ready for `events`. Returns `false` once the
    /// master has been closed.
    fn ready(&self, fd: &OwnedFd, events: PollFlags) -> io::Result<bool> {
        let mut fds = [
            PollFd::new(fd.as_fd(), events),
            PollFd::new(self.wake.as_fd(), PollFlags::POLLIN),
        ];
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
        let woken = fds[1].revents().map_or(false, |revents| !revents.is_empty());
        Ok(!woken)
    }
}


/// Everything the child needs, converted before `fork` so the child never
/// allocates.
struct ExecCommand {
    program: CString,
    dir: CString,
    _args: Vec<CString>,
    _env: Vec<CString>,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
}

impl ExecCommand {
    fn new(config: &LaunchConfig) -> Result<Self> {
        let program = c_string(config.argv[0].as_bytes())?;
        let dir = match &config.dir {
            Some(dir) => c_string(dir.as_os_str().as_bytes())?,
            None => c_string(b".")?,
        };
        let args = config
            .argv
            .iter()
            .map(|arg| c_string(arg.as_bytes()))
            .collect::<Result<Vec<_>>>()?;
        let env = config
            .env
            .iter()
            .flatten()
            .map(|entry| c_string(entry.as_bytes()))
            .collect::<Result<Vec<_>>>()?;

        let argv = args
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp = env
            .iter()
            .map(|entry| entry.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        Ok(Self {
            program,
            dir,
            _args: args,
            _env: env,
            argv,
            envp,
        })
    }

    /// Runs in the forked child. Never returns: either execs or reports
    /// errno on `err_fd` and exits.
    ///
    /// # Safety
    ///
    /// Only call between `fork` and `exec`. The body sticks to
    /// async-signal-safe libc calls and touches no allocator.
    unsafe fn exec(&self, slave: RawFd, err_fd: RawFd) -> ! {
        if libc::setsid() < 0 {
            exec_failed(err_fd);
        }
        if libc::ioctl(slave, libc::TIOCSCTTY as _, 0) < 0 {
            exec_failed(err_fd);
        }
        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if libc::dup2(slave, target) < 0 {
                exec_failed(err_fd);
            }
        }
        if slave > libc::STDERR_FILENO {
            libc::close(slave);
        }

        // Rust ignores SIGPIPE; ignored dispositions survive exec.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());

        if libc::chdir(self.dir.as_ptr()) < 0 {
            exec_failed(err_fd);
        }
        libc::execve(self.program.as_ptr(), self.argv.as_ptr(), self.envp.as_ptr());
        exec_failed(err_fd)
    }
}

/// Child side only: report errno on `err_fd` and exit without unwinding.
unsafe fn exec_failed(err_fd: RawFd) -> ! {
    let errno = Errno::last() as i32;
    let bytes = errno.to_ne_bytes();
    libc::write(err_fd, bytes.as_ptr().cast(), bytes.len());
    libc::_exit(EXEC_FAILED)
}

fn c_string(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|e| Error::InvalidArgument(e.to_string()))
}
