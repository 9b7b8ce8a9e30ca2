//! xpty - run a command in a pseudo terminal
//!
//! Puts the current terminal in raw mode and passes everything through to a
//! child running in a fresh pty (Unix) or pseudo console (Windows). The
//! child's size follows the outer terminal.
//!
//! ```text
//! xpty                  # Default shell
//! xpty -- vim notes.md  # Any command
//! ```

use std::env;
use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
#[cfg(windows)]
use std::time::Duration;

use anyhow::{bail, Context};
use crossterm::terminal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use xpty::{ConfigFile, Pty, TermSize};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often the outer terminal size is polled on Windows.
#[cfg(windows)]
const RESIZE_POLL: Duration = Duration::from_millis(250);

/// Command line options
#[derive(Default)]
struct Options {
    /// Config file given with `--config`
    config: Option<PathBuf>,
    /// Command to run instead of the configured one
    argv: Vec<String>,
}

fn print_version() {
    eprintln!("xpty {}", VERSION);
}

fn print_help() {
    eprintln!("xpty {} - run a command in a pseudo terminal", VERSION);
    eprintln!();
    eprintln!("Usage: xpty [OPTIONS] [--] [COMMAND [ARGS...]]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <PATH>   Read settings from PATH");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Without COMMAND the configured command runs, or the default shell.");
    eprintln!();
    eprintln!("Configuration: ~/.xpty/config.toml");
    eprintln!("Log file:      ~/.xpty/xpty.log (level from RUST_LOG)");
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();
    let mut options = Options::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing config path".to_string());
                }
                options.config = Some(PathBuf::from(&args[i]));
            }
            "--" => {
                options.argv = args[i + 1..].to_vec();
                break;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            _ => {
                options.argv = args[i..].to_vec();
                break;
            }
        }
        i += 1;
    }

    Ok(options)
}

fn default_shell() -> Vec<String> {
    if cfg!(windows) {
        vec!["cmd.exe".to_string()]
    } else {
        let shell = env::var("SHELL").unwrap_or_else(|_| "sh".to_string());
        vec![shell, "-i".to_string()]
    }
}

fn init_logging() {
    let home = env::var_os("USERPROFILE")
        .or_else(|| env::var_os("HOME"))
        .map(PathBuf::from);

    let log_path = home
        .map(|h| h.join(".xpty").join("xpty.log"))
        .unwrap_or_else(|| PathBuf::from("xpty.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// Leaves raw mode when dropped.
struct RawMode;

impl RawMode {
    fn enable() -> anyhow::Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

fn main() -> anyhow::Result<()> {
    let options = match parse_args() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    init_logging();
    info!("xpty starting...");

    let file = match &options.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::load_default()?,
    };

    let mut command = file.command;
    if !options.argv.is_empty() {
        command.argv = options.argv;
    } else if command.argv.is_empty() {
        command.argv = default_shell();
    }

    if !io::stdin().is_terminal() || !io::stdout().is_terminal() {
        bail!("xpty needs an interactive terminal");
    }

    let (cols, rows) = terminal::size().unwrap_or((80, 24));
    let command = command.size(TermSize::new(rows, cols));

    let pty: Arc<dyn Pty> = Arc::from(xpty::start(command)?);
    pty.set_shutdown_policy(file.shutdown)?;
    info!(pid = pty.pid(), "session started");

    let code = {
        let _raw = RawMode::enable()?;
        spawn_input(Arc::clone(&pty))?;
        spawn_resize_watcher(Arc::clone(&pty), (cols, rows))?;

        if let Err(e) = copy_output(&*pty) {
            warn!("output copy failed: {}", e);
        }
        let code = pty.wait();
        if let Err(e) = pty.close() {
            error!("close failed: {}", e);
        }
        code
    };

    info!(code, "session ended");
    eprintln!("[process exited with code {}]", code);
    std::process::exit(code);
}

/// Copy the child's output to our stdout until it is gone.
fn copy_output(pty: &dyn Pty) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    let mut buf = [0u8; 8192];
    loop {
        let n = Pty::read(pty, &mut buf)?;
        if n == 0 {
            return Ok(());
        }
        stdout.write_all(&buf[..n])?;
        stdout.flush()?;
    }
}

/// Forward our stdin to the child. The thread is left blocked on stdin when
/// the child exits.
fn spawn_input(pty: Arc<dyn Pty>) -> io::Result<()> {
    thread::Builder::new()
        .name("xpty-input".to_string())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            let mut buf = [0u8; 1024];
            loop {
                let n = match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if let Err(e) = (&*pty).write_all(&buf[..n]) {
                    debug!("input forwarding stopped: {}", e);
                    break;
                }
            }
        })?;
    Ok(())
}

/// Pass outer terminal size changes on to the child, woken by SIGWINCH.
#[cfg(unix)]
fn spawn_resize_watcher(pty: Arc<dyn Pty>, initial: (u16, u16)) -> io::Result<()> {
    use signal_hook::consts::SIGWINCH;
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGWINCH])?;
    thread::Builder::new()
        .name("xpty-resize".to_string())
        .spawn(move || {
            let mut last = initial;
            for _ in signals.forever() {
                if !forward_size(&*pty, &mut last) {
                    break;
                }
            }
        })?;
    Ok(())
}

/// Poll the outer terminal size and pass changes on to the child. The
/// console has no resize signal to wait on.
#[cfg(windows)]
fn spawn_resize_watcher(pty: Arc<dyn Pty>, initial: (u16, u16)) -> io::Result<()> {
    thread::Builder::new()
        .name("xpty-resize".to_string())
        .spawn(move || {
            let mut last = initial;
            while pty.try_wait().is_none() {
                thread::sleep(RESIZE_POLL);
                if !forward_size(&*pty, &mut last) {
                    break;
                }
            }
        })?;
    Ok(())
}

/// Resize the child if the outer terminal changed. Returns false once the
/// session refuses resizes.
fn forward_size(pty: &dyn Pty, last: &mut (u16, u16)) -> bool {
    let Ok(current) = terminal::size() else {
        return true;
    };
    let Some(size) = size_change(last, current) else {
        return true;
    };
    debug!(rows = size.rows, cols = size.cols, "terminal resized");
    if let Err(e) = pty.resize(size) {
        warn!("resize failed: {}", e);
        return false;
    }
    true
}

/// The new size when `current` (cols, rows) differs from `last`.
fn size_change(last: &mut (u16, u16), current: (u16, u16)) -> Option<TermSize> {
    if current == *last {
        return None;
    }
    *last = current;
    let (cols, rows) = current;
    Some(TermSize::new(rows, cols))
}
