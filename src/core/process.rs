//! Process creation on a pseudo console.

use std::ffi::c_void;
use std::ffi::OsStr;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::sync::Arc;
use std::thread;

use tracing::{trace, warn};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, HANDLE, WAIT_OBJECT_0,
};
use windows::Win32::System::Console::HPCON;
use windows::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use windows::Win32::System::Threading::{
    CreateProcessAsUserW, CreateProcessW, DeleteProcThreadAttributeList, GetCurrentProcess,
    GetExitCodeProcess, InitializeProcThreadAttributeList, OpenProcess, UpdateProcThreadAttribute,
    WaitForSingleObject, CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT, INFINITE,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_CREATION_FLAGS, PROCESS_INFORMATION,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SYNCHRONIZE, STARTF_USESHOWWINDOW,
    STARTF_USESTDHANDLES, STARTUPINFOEXW,
};
use windows::Win32::UI::WindowsAndMessaging::SW_HIDE;

use super::cmdline::make_cmdline;
use super::env_block::{build_env_block, dedup_env_case_insensitive, parse_env_block};
use super::latch::ExitLatch;
use super::pty::{to_io_error, HandleCell};
use crate::config::LaunchConfig;
use crate::error::{Error, Result};

const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;

/// Windows-only process creation options.
#[derive(Debug, Clone, Default)]
pub struct WindowsOptions {
    /// Start the process with its window hidden.
    pub hide_window: bool,
    /// Use this command line verbatim instead of quoting `argv`.
    ///
    /// `argv[0]` is still the program that is started.
    pub cmdline: Option<String>,
    /// Extra `CreateProcess` creation flags.
    pub creation_flags: u32,
    /// Start the process as the user of this primary token.
    ///
    /// The token stays owned by the caller.
    pub token: Option<HANDLE>,
}

/// A process started on a pseudo console.
pub(crate) struct Spawned {
    pub process: HandleCell,
    pub pid: u32,
    pub attributes: AttributeList,
}

/// Process thread attribute list holding the pseudo console.
pub(crate) struct AttributeList {
    buffer: Vec<usize>,
    initialized: bool,
}

impl AttributeList {
    fn with_pseudo_console(hpc: HPCON) -> Result<Self> {
        let mut size = 0usize;
        unsafe {
            let _ = InitializeProcThreadAttributeList(
                LPPROC_THREAD_ATTRIBUTE_LIST::default(),
                1,
                0,
                &mut size,
            );
        }

        let words = ((size + mem::size_of::<usize>() - 1) / mem::size_of::<usize>()).max(1);
        let mut list = Self {
            buffer: vec![0usize; words],
            initialized: false,
        };

        unsafe { InitializeProcThreadAttributeList(list.as_raw(), 1, 0, &mut size) }
            .map_err(|e| Error::ProcessSpawn(to_io_error(e)))?;
        list.initialized = true;

        unsafe {
            UpdateProcThreadAttribute(
                list.as_raw(),
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
                Some(hpc.0 as *const _),
                mem::size_of::<HPCON>(),
                None,
                None,
            )
        }
        .map_err(|e| Error::ProcessSpawn(to_io_error(e)))?;

        Ok(list)
    }

    fn as_raw(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.buffer.as_mut_ptr() as *mut c_void)
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        if self.initialized {
            unsafe { DeleteProcThreadAttributeList(self.as_raw()) };
            self.initialized = false;
        }
    }
}

/// Start the normalized `config` attached to the pseudo console `hpc`.
pub(crate) fn spawn(
    config: &LaunchConfig,
    options: &WindowsOptions,
    hpc: HPCON,
) -> Result<Spawned> {
    let mut attributes = AttributeList::with_pseudo_console(hpc)?;

    let mut startup = STARTUPINFOEXW {
        StartupInfo: unsafe { mem::zeroed() },
        lpAttributeList: attributes.as_raw(),
    };
    startup.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
    startup.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
    if options.hide_window {
        startup.StartupInfo.dwFlags |= STARTF_USESHOWWINDOW;
        startup.StartupInfo.wShowWindow = SW_HIDE.0 as u16;
    }

    let program = wide(OsStr::new(&config.argv[0]))?;
    let cmdline = match &options.cmdline {
        Some(cmdline) => cmdline.clone(),
        None => make_cmdline(&config.argv),
    };
    let mut cmdline = wide(OsStr::new(&cmdline))?;
    let dir = match &config.dir {
        Some(dir) => Some(wide(dir.as_os_str())?),
        None => None,
    };
    let dir = dir.as_ref().map_or(PCWSTR::null(), |dir| PCWSTR(dir.as_ptr()));

    let env = dedup_env_case_insensitive(config.env.as_deref().unwrap_or_default());
    let env_block = build_env_block(&env);

    let flags = CREATE_UNICODE_ENVIRONMENT
        | EXTENDED_STARTUPINFO_PRESENT
        | PROCESS_CREATION_FLAGS(options.creation_flags);

    let mut info = PROCESS_INFORMATION::default();
    let created = unsafe {
        match options.token {
            Some(token) => CreateProcessAsUserW(
                token,
                PCWSTR(program.as_ptr()),
                PWSTR(cmdline.as_mut_ptr()),
                None,
                None,
                false,
                flags,
                Some(env_block.as_ptr() as *const c_void),
                dir,
                &startup.StartupInfo,
                &mut info,
            ),
            None => CreateProcessW(
                PCWSTR(program.as_ptr()),
                PWSTR(cmdline.as_mut_ptr()),
                None,
                None,
                false,
                flags,
                Some(env_block.as_ptr() as *const c_void),
                dir,
                &startup.StartupInfo,
                &mut info,
            ),
        }
    };
    created.map_err(|e| Error::ProcessSpawn(to_io_error(e)))?;

    unsafe {
        let _ = CloseHandle(info.hThread);
    }

    Ok(Spawned {
        process: HandleCell::from_raw(info.hProcess),
        pid: info.dwProcessId,
        attributes,
    })
}

/// The profile environment of the user behind `token`.
pub fn default_env_for_token(token: HANDLE) -> Result<Vec<String>> {
    let mut block: *mut c_void = std::ptr::null_mut();
    unsafe { CreateEnvironmentBlock(&mut block, token, false) }
        .map_err(|e| Error::ProcessSpawn(to_io_error(e)))?;

    let env = unsafe { parse_env_block(block as *const u16) };
    unsafe {
        let _ = DestroyEnvironmentBlock(block);
    }
    Ok(env)
}

/// Exit status `GetExitCodeProcess` reports while the process still runs.
const STILL_ACTIVE: i32 = 259;

/// Spawn the thread that fires `exit` once process `pid` is gone.
///
/// `session` is the session's own process handle, used only when the
/// watcher cannot get a handle of its own.
pub(crate) fn watch_exit(
    builder: thread::Builder,
    pid: u32,
    session: HANDLE,
    exit: Arc<ExitLatch>,
) -> std::io::Result<()> {
    let own = open_for_wait(pid, session).map(|h| h.0 as usize);
    let session = session.0 as usize;

    let spawned = builder
        .name(format!("xpty-wait-{pid}"))
        .spawn(move || {
            let code = match own {
                Some(handle) => wait_exit_code(HANDLE(handle as _)),
                None => {
                    warn!(pid, "cannot wait on process, querying exit code once");
                    fallback_code(exit_code(HANDLE(session as _)))
                }
            };
            trace!(pid, code, "process exited");
            exit.fire(code);
        });
    if let Err(e) = spawned {
        if let Some(handle) = own {
            unsafe {
                let _ = CloseHandle(HANDLE(handle as _));
            }
        }
        return Err(e);
    }
    Ok(())
}

/// The one-shot query cannot tell a live process from one that exited with
/// 259, so both report as unknown.
fn fallback_code(code: Option<i32>) -> i32 {
    match code {
        Some(code) if code != STILL_ACTIVE => code,
        _ => -1,
    }
}

/// A handle the watcher owns, so `close` releasing the session's handle
/// does not race the wait.
fn open_for_wait(pid: u32, session: HANDLE) -> Option<HANDLE> {
    unsafe {
        if let Ok(handle) = OpenProcess(
            PROCESS_SYNCHRONIZE | PROCESS_QUERY_LIMITED_INFORMATION,
            false,
            pid,
        ) {
            return Some(handle);
        }

        let current = GetCurrentProcess();
        let mut handle = HANDLE::default();
        DuplicateHandle(
            current,
            session,
            current,
            &mut handle,
            0,
            false,
            DUPLICATE_SAME_ACCESS,
        )
        .ok()
        .map(|()| handle)
    }
}

/// Wait on `handle`, read the exit code and close the handle.
fn wait_exit_code(handle: HANDLE) -> i32 {
    unsafe {
        let code = if WaitForSingleObject(handle, INFINITE) == WAIT_OBJECT_0 {
            exit_code(handle).unwrap_or(-1)
        } else {
            -1
        };
        let _ = CloseHandle(handle);
        code
    }
}

fn exit_code(process: HANDLE) -> Option<i32> {
    let mut code = 0u32;
    unsafe { GetExitCodeProcess(process, &mut code) }
        .ok()
        .map(|()| code as i32)
}

fn wide(s: &OsStr) -> Result<Vec<u16>> {
    let mut wide: Vec<u16> = s.encode_wide().collect();
    if wide.contains(&0) {
        return Err(Error::InvalidArgument(format!(
            "interior NUL in {}",
            s.to_string_lossy()
        )));
    }
    wide.push(0);
    Ok(wide)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::{start_with_options, Pty};
    use std::io::Read;

    fn drain(pty: &dyn Pty) -> String {
        let mut output = Vec::new();
        let mut reader = pty;
        reader.read_to_end(&mut output).unwrap();
        String::from_utf8_lossy(&output).into_owned()
    }

    #[test]
    fn test_fallback_code_hides_still_active() {
        assert_eq!(fallback_code(Some(STILL_ACTIVE)), -1);
        assert_eq!(fallback_code(None), -1);
        assert_eq!(fallback_code(Some(0)), 0);
        assert_eq!(fallback_code(Some(42)), 42);
    }

    #[test]
    fn test_watcher_spawn_failure_leaves_latch_unfired() {
        let exit = Arc::new(ExitLatch::new());
        // No stack that large can be reserved, so the thread never starts.
        let builder = thread::Builder::new().stack_size(usize::MAX);
        let result = watch_exit(
            builder,
            std::process::id(),
            unsafe { GetCurrentProcess() },
            Arc::clone(&exit),
        );
        assert!(result.is_err());
        assert_eq!(exit.try_get(), None);
    }

    #[test]
    fn test_wide_rejects_nul() {
        assert!(matches!(
            wide(OsStr::new("a\0b")),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(wide(OsStr::new("ab")).unwrap(), vec![97, 98, 0]);
    }

    #[test]
    fn test_hidden_window_and_exit_code() {
        let options = WindowsOptions {
            hide_window: true,
            ..Default::default()
        };
        let pty = start_with_options(
            LaunchConfig::new(["cmd.exe", "/c", "exit 42"]),
            &options,
        )
        .unwrap();
        drain(&*pty);
        assert_eq!(pty.wait(), 42);
        assert_eq!(pty.try_wait(), Some(42));
        pty.close().unwrap();
    }

    #[test]
    fn test_explicit_cmdline() {
        let options = WindowsOptions {
            cmdline: Some("cmd.exe /c echo verbatim^&done".to_string()),
            ..Default::default()
        };
        let pty = start_with_options(LaunchConfig::new(["cmd.exe"]), &options).unwrap();
        let output = drain(&*pty);
        assert!(output.contains("verbatim&done"), "{output:?}");
        pty.close().unwrap();
    }

    #[test]
    fn test_env_reaches_child() {
        let config = LaunchConfig::new(["cmd.exe", "/c", "echo %XPTY_MARK%"])
            .inject("XPTY_MARK", "marked");
        let pty = start_with_options(config, &WindowsOptions::default()).unwrap();
        let output = drain(&*pty);
        assert!(output.contains("marked"), "{output:?}");
        pty.close().unwrap();
    }

    #[test]
    fn test_missing_program() {
        let result = start_with_options(
            LaunchConfig::new(["C:\\definitely\\missing\\nothing.exe"]),
            &WindowsOptions::default(),
        );
        assert!(result.is_err());
    }
}
