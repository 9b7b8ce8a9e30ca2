//! ConPTY backend for Windows
//!
//! This module owns the pseudo console device and the session built on top
//! of it. The pseudo console API is resolved from kernel32 at runtime so the
//! crate still loads on Windows releases that predate it; there `start`
//! fails with [`Error::ConPtyNotSupported`].

use std::ffi::c_void;
use std::io;
use std::os::windows::io::{FromRawHandle, IntoRawHandle, OwnedHandle};
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;

use tracing::{debug, trace};
use windows::core::{s, w, HRESULT};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_BROKEN_PIPE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows::Win32::System::Console::{COORD, HPCON};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::TerminateProcess;

use super::latch::ExitLatch;
use super::normalize::normalize;
use super::process::{self, AttributeList, WindowsOptions};
use super::session::Pty;
use crate::config::{LaunchConfig, ShutdownPolicy, TermSize};
use crate::error::{CloseFailure, Error, Result};

/// Exit code given to a process terminated by `close`.
const TERMINATED_EXIT_CODE: u32 = 1;

type CreatePseudoConsoleFn =
    unsafe extern "system" fn(COORD, HANDLE, HANDLE, u32, *mut HPCON) -> HRESULT;
type ResizePseudoConsoleFn = unsafe extern "system" fn(HPCON, COORD) -> HRESULT;
type ClosePseudoConsoleFn = unsafe extern "system" fn(HPCON);
type ReleasePseudoConsoleFn = unsafe extern "system" fn(HPCON) -> HRESULT;

/// Pseudo console entry points exported by this version of kernel32.
struct ConPtyApi {
    create: CreatePseudoConsoleFn,
    resize: ResizePseudoConsoleFn,
    close: ClosePseudoConsoleFn,
    /// Windows 11 24H2 / Server 2025 (build 26100) and later.
    release: Option<ReleasePseudoConsoleFn>,
}

impl ConPtyApi {
    fn get() -> Option<&'static ConPtyApi> {
        static API: OnceLock<Option<ConPtyApi>> = OnceLock::new();
        API.get_or_init(|| unsafe { Self::load() }).as_ref()
    }

    unsafe fn load() -> Option<Self> {
        let kernel32 = GetModuleHandleW(w!("kernel32.dll")).ok()?;
        let create = GetProcAddress(kernel32, s!("CreatePseudoConsole"))?;
        let resize = GetProcAddress(kernel32, s!("ResizePseudoConsole"))?;
        let close = GetProcAddress(kernel32, s!("ClosePseudoConsole"))?;
        let release = GetProcAddress(kernel32, s!("ReleasePseudoConsole"));

        Some(Self {
            create: std::mem::transmute::<_, CreatePseudoConsoleFn>(create),
            resize: std::mem::transmute::<_, ResizePseudoConsoleFn>(resize),
            close: std::mem::transmute::<_, ClosePseudoConsoleFn>(close),
            release: release.map(|f| std::mem::transmute::<_, ReleasePseudoConsoleFn>(f)),
        })
    }
}

/// Whether this Windows build has ConPTY (Windows 10 1809 and later).
pub fn probe_conpty() -> bool {
    ConPtyApi::get().is_some()
}

/// ConPTY session
pub struct ConPty {
    console: Console,
    /// Our end of the child's input pipe.
    input: HandleCell,
    /// Our end of the child's output pipe.
    output: HandleCell,
    process: HandleCell,
    attributes: Mutex<Option<AttributeList>>,
    pid: u32,
    exit: Arc<ExitLatch>,
    policy: Mutex<ShutdownPolicy>,
    closed: OnceLock<std::result::Result<(), CloseFailure>>,
}

impl ConPty {
    /// Normalize `config`, open a pseudo console and start the process on it.
    pub fn start(mut config: LaunchConfig, options: &WindowsOptions) -> Result<Self> {
        if config.env.is_none() {
            if let Some(token) = options.token {
                config.env = Some(process::default_env_for_token(token)?);
            }
        }
        let config = normalize(config)?;

        let (console, input, output) = open_console(config.size)?;
        let spawned = process::spawn(&config, options, console.handle())?;
        debug!(pid = spawned.pid, program = %config.argv[0], "spawned ConPTY process");

        let exit = Arc::new(ExitLatch::new());
        watch_or_terminate(
            thread::Builder::new(),
            spawned.pid,
            spawned.process.raw(),
            &exit,
        )?;

        if let Err(e) = console.release_on_disconnect() {
            terminate(spawned.process.raw());
            return Err(e);
        }

        Ok(Self {
            console,
            input,
            output,
            process: spawned.process,
            attributes: Mutex::new(Some(spawned.attributes)),
            pid: spawned.pid,
            exit,
            policy: Mutex::new(ShutdownPolicy::default()),
            closed: OnceLock::new(),
        })
    }

    fn shut_down(&self) -> std::result::Result<(), CloseFailure> {
        let policy = *self.policy.lock().unwrap_or_else(PoisonError::into_inner);

        // Closing the input pipe sends CTRL_CLOSE_EVENT to the console client.
        drop(self.input.take());

        let result = self.escalate(&policy);
        self.release();
        result
    }

    fn escalate(&self, policy: &ShutdownPolicy) -> std::result::Result<(), CloseFailure> {
        if self.exit.wait_timeout(policy.force_kill_delay).is_some() {
            return Ok(());
        }

        debug!(pid = self.pid, "process survived close event, terminating");
        if let Some(process) = self.process.get() {
            if let Err(e) = unsafe { TerminateProcess(process, TERMINATED_EXIT_CODE) } {
                // Terminating an already terminated process fails with
                // ERROR_ACCESS_DENIED while handles to it are still open.
                if e.code() != ERROR_ACCESS_DENIED.to_hresult() {
                    return Err(CloseFailure::Terminate(win32_code(e.code())));
                }
            }
        }

        match self.exit.wait_timeout(policy.kill_grace()) {
            Some(_) => Ok(()),
            None => Err(CloseFailure::KillTimeout),
        }
    }

    /// Release every OS resource that is still held.
    fn release(&self) {
        drop(
            self.attributes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        drop(self.process.take());
        self.console.close();
        drop(self.output.take());
    }
}

impl Pty for ConPty {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(handle) = self.output.get() else {
            return Ok(0);
        };
        let len = buf.len().min(u32::MAX as usize);
        let mut read = 0u32;
        match unsafe { ReadFile(handle, Some(&mut buf[..len]), Some(&mut read), None) } {
            Ok(()) => Ok(read as usize),
            Err(e) => {
                let err = to_io_error(e);
                if err.raw_os_error() == Some(ERROR_BROKEN_PIPE.0 as i32) {
                    return Ok(0);
                }
                Err(err)
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let handle = self
            .input
            .get()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pseudo console is closed"))?;
        let len = buf.len().min(u32::MAX as usize);
        let mut written = 0u32;
        unsafe { WriteFile(handle, Some(&buf[..len]), Some(&mut written), None) }
            .map_err(to_io_error)?;
        Ok(written as usize)
    }

    fn resize(&self, size: TermSize) -> Result<()> {
        self.console.resize(size)
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
        self.pid
    }
}

impl Drop for ConPty {
    fn drop(&mut self) {
        drop(self.input.take());
        self.release();
    }
}

/// Create the pseudo console and the pipes feeding it.
///
/// Returns the console, our write end of its input and our read end of its
/// output.
fn open_console(size: TermSize) -> Result<(Console, HandleCell, HandleCell)> {
    let api = ConPtyApi::get().ok_or(Error::ConPtyNotSupported)?;

    let (output_read, console_output) = create_pipe()?;
    let (console_input, input_write) = create_pipe()?;

    let mut hpc = HPCON::default();
    let created = unsafe {
        (api.create)(
            coord(size),
            HANDLE(console_input.as_raw()),
            HANDLE(console_output.as_raw()),
            0,
            &mut hpc,
        )
    };

    // The console duplicates the ends it was given; ours can go now.
    drop(console_input);
    drop(console_output);

    created
        .ok()
        .map_err(|e| Error::ConPtyCreation(to_io_error(e)))?;
    trace!(rows = size.rows, cols = size.cols, "pseudo console created");

    Ok((
        Console::new(api, hpc),
        HandleCell::new(input_write),
        HandleCell::new(output_read),
    ))
}

/// Start the exit watcher. If that fails the process is killed, so a
/// failed start leaves nothing running.
fn watch_or_terminate(
    builder: thread::Builder,
    pid: u32,
    process: HANDLE,
    exit: &Arc<ExitLatch>,
) -> Result<()> {
    process::watch_exit(builder, pid, process, Arc::clone(exit)).map_err(|e| {
        terminate(process);
        Error::ProcessSpawn(e)
    })
}

fn terminate(process: HANDLE) {
    unsafe {
        let _ = TerminateProcess(process, TERMINATED_EXIT_CODE);
    }
}

fn create_pipe() -> Result<(PipeEnd, PipeEnd)> {
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    unsafe { CreatePipe(&mut read, &mut write, None, 0) }
        .map_err(|e| Error::PipeCreation(to_io_error(e)))?;
    Ok((PipeEnd::new(read), PipeEnd::new(write)))
}

fn coord(size: TermSize) -> COORD {
    COORD {
        X: size.cols.min(i16::MAX as u16) as i16,
        Y: size.rows.min(i16::MAX as u16) as i16,
    }
}

/// An owned pipe handle not yet shared with other threads.
struct PipeEnd(OwnedHandle);

impl PipeEnd {
    fn new(handle: HANDLE) -> Self {
        Self(unsafe { OwnedHandle::from_raw_handle(handle.0 as _) })
    }

    fn as_raw(&self) -> *mut c_void {
        use std::os::windows::io::AsRawHandle;
        self.0.as_raw_handle() as _
    }
}

/// A handle owned by the session that any thread may use and that `take`
/// closes exactly once.
pub(crate) struct HandleCell(AtomicPtr<c_void>);

impl HandleCell {
    fn new(pipe: PipeEnd) -> Self {
        Self(AtomicPtr::new(pipe.0.into_raw_handle() as _))
    }

    pub(crate) fn from_raw(handle: HANDLE) -> Self {
        Self(AtomicPtr::new(handle.0 as _))
    }

    pub(crate) fn get(&self) -> Option<HANDLE> {
        let raw = self.0.load(Ordering::Acquire);
        (!raw.is_null()).then(|| HANDLE(raw as _))
    }

    /// Same as `get`, for callers that know the handle is still open.
    pub(crate) fn raw(&self) -> HANDLE {
        HANDLE(self.0.load(Ordering::Acquire) as _)
    }

    pub(crate) fn take(&self) -> Option<OwnedHandle> {
        let raw = self.0.swap(std::ptr::null_mut(), Ordering::AcqRel);
        (!raw.is_null()).then(|| unsafe { OwnedHandle::from_raw_handle(raw as _) })
    }
}

impl Drop for HandleCell {
    fn drop(&mut self) {
        drop(self.take());
    }
}

/// The pseudo console device.
struct Console {
    api: &'static ConPtyApi,
    handle: AtomicIsize,
}

impl Console {
    fn new(api: &'static ConPtyApi, hpc: HPCON) -> Self {
        Self {
            api,
            handle: AtomicIsize::new(hpc.0 as isize),
        }
    }

    fn handle(&self) -> HPCON {
        HPCON(self.handle.load(Ordering::Acquire) as _)
    }

    fn resize(&self, size: TermSize) -> Result<()> {
        unsafe { (self.api.resize)(self.handle(), coord(size)) }
            .ok()
            .map_err(|e| Error::Resize(to_io_error(e)))
    }

    fn close(&self) {
        let raw = self.handle.swap(0, Ordering::AcqRel);
        if raw != 0 {
            unsafe { (self.api.close)(HPCON(raw as _)) };
        }
    }

    /// Make the console end the session once its client exits.
    ///
    /// By default an HPCON keeps the session alive forever, so reads on the
    /// output pipe block after the child is gone instead of failing like a
    /// POSIX pty.
    fn release_on_disconnect(&self) -> Result<()> {
        if let Some(release) = self.api.release {
            trace!("releasing pseudo console reference");
            return unsafe { release(self.handle()) }
                .ok()
                .map_err(|e| Error::AutoClose(to_io_error(e)));
        }

        trace!("ReleasePseudoConsole unavailable, closing legacy reference handle");
        unsafe { close_legacy_reference(self.handle()) }
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.close();
    }
}

/// Layout of the allocation behind an HPCON on Windows builds that lack
/// `ReleasePseudoConsole`, as defined by `PseudoConsole` in
/// microsoft/terminal `src/winconpty/winconpty.h`.
///
/// FRAGILE: this is an undocumented internal layout. It is frozen on the old
/// builds that need it, but must never be used when `ReleasePseudoConsole`
/// exists.
#[repr(C)]
struct LegacyPseudoConsole {
    signal: HANDLE,
    reference: HANDLE,
    process: HANDLE,
}

/// Run `f` on the legacy record behind `hpc`. The borrow cannot outlive the
/// call.
///
/// # Safety
///
/// `hpc` must be a live handle from `CreatePseudoConsole` on a build without
/// `ReleasePseudoConsole`.
unsafe fn with_legacy_layout<R>(
    hpc: HPCON,
    f: impl FnOnce(&mut LegacyPseudoConsole) -> R,
) -> Result<R> {
    let raw = hpc.0 as isize;
    if raw == 0 || raw == INVALID_HANDLE_VALUE.0 as isize {
        return Err(Error::AutoClose(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid pseudo console handle",
        )));
    }
    let record = &mut *(raw as *mut LegacyPseudoConsole);
    Ok(f(record))
}

/// Close the reference handle that keeps a legacy pseudo console alive, the
/// same thing `ReleasePseudoConsole` does on newer builds.
///
/// # Safety
///
/// See [`with_legacy_layout`].
unsafe fn close_legacy_reference(hpc: HPCON) -> Result<()> {
    with_legacy_layout(hpc, |record| {
        if !record.reference.is_invalid() {
            let _ = CloseHandle(record.reference);
            record.reference = HANDLE::default();
        }
    })
}

/// Win32 error code carried by an HRESULT, or the HRESULT itself.
pub(crate) fn win32_code(hr: HRESULT) -> i32 {
    let value = hr.0 as u32;
    if value & 0xFFFF_0000 == 0x8007_0000 {
        (value & 0xFFFF) as i32
    } else {
        hr.0
    }
}

pub(crate) fn to_io_error(e: windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error(win32_code(e.code()))
}
