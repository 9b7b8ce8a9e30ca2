//! Launch configuration normalization.
//!
//! Fills in every default of a [`LaunchConfig`] so the backends only ever see
//! fully specified commands. The process-wide working directory and
//! environment are read once into a [`HostContext`]; everything after that is
//! a pure function of its inputs.

use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{LaunchConfig, TermSize, DEFAULT_COLS, DEFAULT_ROWS};
use crate::error::{Error, Result};

/// Snapshot of the caller's process state used during normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    /// Absolute current working directory.
    pub cwd: PathBuf,
    /// Inherited environment as `KEY=VALUE` strings.
    pub env: Vec<String>,
}

impl HostContext {
    /// Capture the current process's working directory and environment.
    ///
    /// Variables whose name or value is not valid UTF-8 are left out rather
    /// than passed on mangled.
    pub fn current() -> Result<Self> {
        let cwd = std::env::current_dir().map_err(Error::WorkingDirectory)?;
        let env = std::env::vars_os()
            .filter_map(|(k, v)| env_entry(k, v))
            .collect();
        Ok(Self { cwd, env })
    }

    /// Value of `key` in the captured environment. Case-insensitive on Windows.
    pub fn var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            let matches = if cfg!(windows) {
                k.eq_ignore_ascii_case(key)
            } else {
                k == key
            };
            matches.then_some(v)
        })
    }
}

/// Normalize `config` against the current process state.
///
/// Safe to call repeatedly: normalizing a normalized config is a no-op.
pub fn normalize(config: LaunchConfig) -> Result<LaunchConfig> {
    normalize_in(config, &HostContext::current()?)
}

/// Normalize `config` against an explicit host snapshot.
pub fn normalize_in(mut config: LaunchConfig, host: &HostContext) -> Result<LaunchConfig> {
    if config.argv.is_empty() {
        return Err(Error::EmptyArgv);
    }

    let dir = match config.dir.take() {
        Some(dir) if dir.as_os_str().is_empty() => host.cwd.clone(),
        Some(dir) if dir.is_absolute() => dir,
        Some(dir) => host.cwd.join(dir),
        None => host.cwd.clone(),
    };
    if !dir.is_absolute() {
        return Err(Error::WorkingDirectory(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not an absolute path", dir.display()),
        )));
    }

    let program = resolve_program(&config.argv[0], &dir, host)?;
    config.argv[0] = program.into_os_string().into_string().map_err(|path| {
        Error::InvalidArgument(format!(
            "resolved program {} is not valid UTF-8",
            Path::new(&path).display()
        ))
    })?;

    let env = config.env.take().unwrap_or_else(|| host.env.clone());

    let fallback = config
        .env_fallback
        .take()
        .unwrap_or_else(|| default_fallback(host));

    let mut inject = config.env_inject.take().unwrap_or_default();
    if cfg!(unix) && !inject.contains_key("PWD") {
        match dir.to_str() {
            Some(pwd) => {
                inject.insert("PWD".to_string(), pwd.to_string());
            }
            None => debug!(dir = %dir.display(), "working directory is not UTF-8, PWD not set"),
        }
    }

    config.env = Some(apply_env_fallback_and_inject(&env, &fallback, &inject));
    config.env_fallback = Some(fallback);
    config.env_inject = Some(inject);
    config.dir = Some(dir);

    if config.size.is_unset() {
        config.size = TermSize::new(DEFAULT_ROWS, DEFAULT_COLS);
    }

    Ok(config)
}

/// `KEY=VALUE` for one inherited variable, or `None` when either half is
/// not UTF-8.
fn env_entry(key: OsString, value: OsString) -> Option<String> {
    match (key.into_string(), value.into_string()) {
        (Ok(key), Ok(value)) => Some(format!("{key}={value}")),
        (key, _) => {
            debug!(key = ?key, "skipping environment variable that is not UTF-8");
            None
        }
    }
}

/// Merge `env` with fallback and injected variables.
///
/// Injected keys win over everything (an empty value removes the key).
/// Entries of `env` whose key is not injected are kept verbatim, including
/// duplicates and entries without `=`. Fallback keys are only added when the
/// key appears in neither `env` nor `inject`.
///
/// Output order is: surviving `env` entries, fallback entries, injected
/// entries.
pub fn apply_env_fallback_and_inject(
    env: &[String],
    fallback: &BTreeMap<String, String>,
    inject: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut merged = Vec::with_capacity(env.len() + fallback.len() + inject.len());
    let mut present: HashSet<&str> = HashSet::with_capacity(env.len());

    for entry in env {
        let key = env_key(entry);
        present.insert(key);
        if inject.contains_key(key) {
            continue;
        }
        merged.push(entry.clone());
    }

    for (key, value) in fallback {
        if present.contains(key.as_str()) || inject.contains_key(key) {
            continue;
        }
        merged.push(format!("{key}={value}"));
    }

    for (key, value) in inject {
        if value.is_empty() {
            continue;
        }
        merged.push(format!("{key}={value}"));
    }

    merged
}

/// Key part of an environment entry. Entries without `=` are all key.
fn env_key(entry: &str) -> &str {
    entry.split_once('=').map_or(entry, |(key, _)| key)
}

fn default_fallback(host: &HostContext) -> BTreeMap<String, String> {
    let mut fallback = BTreeMap::new();
    fallback.insert("TERM".to_string(), "vt100".to_string());
    if cfg!(windows) {
        for entry in &host.env {
            if let Some((key, value)) = entry.split_once('=') {
                if key.eq_ignore_ascii_case("SYSTEMROOT") {
                    fallback.insert(key.to_string(), value.to_string());
                }
            }
        }
    }
    fallback
}

fn resolve_program(argv0: &str, dir: &Path, host: &HostContext) -> Result<PathBuf> {
    let path = Path::new(argv0);

    if is_bare_name(path) {
        let search_path = host.var("PATH").map(OsString::from);
        return which::which_in(argv0, search_path, &host.cwd).map_err(|source| {
            Error::ExecutableNotFound {
                name: argv0.to_string(),
                source,
            }
        });
    }

    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(dir.join(path))
    }
}

/// A bare name has no directory component and is looked up in `PATH`.
fn is_bare_name(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path.components().count() == 1
        && path.file_name() == Some(path.as_os_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn sorted(mut items: Vec<String>) -> Vec<String> {
        items.sort();
        items
    }

    #[test]
    fn test_inject_overrides_and_fallback_fills() {
        let got = apply_env_fallback_and_inject(
            &strings(&["HOST=localhost", "PORT=80"]),
            &map(&[("USER", "admin")]),
            &map(&[("PORT", "443")]),
        );
        assert_eq!(
            sorted(got),
            sorted(strings(&["HOST=localhost", "PORT=443", "USER=admin"]))
        );
    }

    #[test]
    fn test_malformed_and_duplicate_entries_pass_through() {
        let got = apply_env_fallback_and_inject(
            &strings(&["A", "B=", "A", "C=1"]),
            &map(&[("D", "2")]),
            &BTreeMap::new(),
        );
        assert_eq!(got, strings(&["A", "B=", "A", "C=1", "D=2"]));
    }

    #[test]
    fn test_empty_inject_deletes_without_fallback() {
        let got = apply_env_fallback_and_inject(
            &strings(&["A=1", "B=2"]),
            &map(&[("A", "fallback")]),
            &map(&[("A", "")]),
        );
        assert_eq!(got, strings(&["B=2"]));
    }

    #[test]
    fn test_inject_replaces_bare_keys() {
        let got = apply_env_fallback_and_inject(
            &strings(&["WEIRD_KEY", "EMPTY="]),
            &BTreeMap::new(),
            &map(&[("WEIRD_KEY", "fixed"), ("EMPTY", "filled")]),
        );
        assert_eq!(
            sorted(got),
            sorted(strings(&["WEIRD_KEY=fixed", "EMPTY=filled"]))
        );
    }

    #[test]
    fn test_fallback_does_not_override_existing() {
        let got = apply_env_fallback_and_inject(
            &strings(&["A=original"]),
            &map(&[("A", "fallback")]),
            &BTreeMap::new(),
        );
        assert_eq!(got, strings(&["A=original"]));
    }

    fn host() -> HostContext {
        let cwd = std::env::temp_dir();
        let path = std::env::var("PATH").unwrap_or_default();
        HostContext {
            cwd,
            env: vec![format!("PATH={path}"), "HOME=/home/test".to_string()],
        }
    }

    fn test_program() -> &'static str {
        if cfg!(windows) {
            "cmd"
        } else {
            "sh"
        }
    }

    #[test]
    fn test_empty_argv_is_rejected() {
        let result = normalize_in(LaunchConfig::default(), &host());
        assert!(matches!(result, Err(Error::EmptyArgv)));
    }

    #[test]
    fn test_unknown_program_is_rejected() {
        let config = LaunchConfig::new(["definitely-not-a-real-program-xpty"]);
        let result = normalize_in(config, &host());
        assert!(matches!(result, Err(Error::ExecutableNotFound { .. })));
    }

    #[test]
    fn test_defaults_are_filled() {
        let host = host();
        let config = normalize_in(LaunchConfig::new([test_program()]), &host).unwrap();

        assert!(Path::new(&config.argv[0]).is_absolute());
        assert_eq!(config.dir.as_deref(), Some(host.cwd.as_path()));
        assert_eq!(config.size, TermSize::new(24, 80));

        let env = config.env.unwrap();
        assert!(env.contains(&"HOME=/home/test".to_string()));
        assert!(env.contains(&"TERM=vt100".to_string()));
        #[cfg(unix)]
        assert!(env.contains(&format!("PWD={}", host.cwd.display())));
    }

    #[test]
    fn test_explicit_term_wins_over_fallback() {
        let config = LaunchConfig::new([test_program()]).env(["MYVAR=1", "TERM=custom"]);
        let config = normalize_in(config, &host()).unwrap();
        let env = config.env.unwrap();
        let terms: Vec<_> = env.iter().filter(|e| e.starts_with("TERM=")).collect();
        assert_eq!(terms, vec!["TERM=custom"]);
    }

    #[test]
    fn test_injected_term() {
        let config = LaunchConfig::new([test_program()]).inject("TERM", "xterm-256color");
        let config = normalize_in(config, &host()).unwrap();
        let env = config.env.unwrap();
        assert!(env.contains(&"TERM=xterm-256color".to_string()));
        assert!(!env.contains(&"TERM=vt100".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_explicit_pwd_inject_is_kept() {
        let config = LaunchConfig::new(["sh"]).inject("PWD", "");
        let config = normalize_in(config, &host()).unwrap();
        assert!(!config.env.unwrap().iter().any(|e| e.starts_with("PWD=")));
    }

    #[test]
    fn test_relative_dir_and_program() {
        let tmp = tempfile::tempdir().unwrap();
        let host = HostContext {
            cwd: tmp.path().to_path_buf(),
            env: Vec::new(),
        };
        let config = LaunchConfig::new(["./bin/tool"]).dir("work");
        let config = normalize_in(config, &host).unwrap();

        let dir = tmp.path().join("work");
        assert_eq!(config.dir.as_deref(), Some(dir.as_path()));
        assert_eq!(
            PathBuf::from(&config.argv[0]),
            dir.join("./bin/tool")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_variables_are_skipped() {
        use std::os::unix::ffi::OsStringExt;

        let bad = OsString::from_vec(vec![b'a', 0xff]);
        assert_eq!(env_entry("KEY".into(), "v".into()), Some("KEY=v".to_string()));
        assert_eq!(env_entry("KEY".into(), bad.clone()), None);
        assert_eq!(env_entry(bad, "v".into()), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_dir() {
        use std::os::unix::ffi::OsStringExt;

        let dir = PathBuf::from(OsString::from_vec(b"/tmp/xpty-\xff".to_vec()));
        let config = LaunchConfig::new([test_program()]).dir(dir.clone());
        let config = normalize_in(config, &host()).unwrap();
        let env = config.env.unwrap();
        assert!(!env.iter().any(|entry| entry.starts_with("PWD=")), "{env:?}");

        let config = LaunchConfig::new(["./tool"]).dir(dir);
        assert!(matches!(
            normalize_in(config, &host()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_zero_dimension_uses_default_size() {
        let config = LaunchConfig::new([test_program()]).size(TermSize::new(0, 132));
        let config = normalize_in(config, &host()).unwrap();
        assert_eq!(config.size, TermSize::new(24, 80));

        let config = LaunchConfig::new([test_program()]).size(TermSize::with_pixels(50, 132, 8, 16));
        let config = normalize_in(config, &host()).unwrap();
        assert_eq!(config.size, TermSize::with_pixels(50, 132, 8, 16));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let host = host();
        let config = LaunchConfig::new([test_program(), "-c", "true"])
            .env(["A", "B=1", "A", "TERM=x"])
            .inject("B", "2")
            .inject("C", "")
            .fallback("D", "4");
        let once = normalize_in(config, &host).unwrap();
        let twice = normalize_in(once.clone(), &host).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_bare_name_detection() {
        assert!(is_bare_name(Path::new("sh")));
        assert!(!is_bare_name(Path::new("./sh")));
        assert!(!is_bare_name(Path::new("bin/sh")));
        assert!(!is_bare_name(Path::new("/bin/sh")));
        assert!(!is_bare_name(Path::new("")));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn entry() -> impl Strategy<Value = String> {
            prop_oneof![
                "[A-E]{1,2}=[a-z0-9]{0,3}",
                "[A-E]{1,2}",
            ]
        }

        fn vars() -> impl Strategy<Value = BTreeMap<String, String>> {
            prop::collection::btree_map("[A-G]{1,2}", "[a-z0-9]{0,3}", 0..4)
        }

        proptest! {
            #[test]
            fn normalize_twice_equals_once(
                env in prop::collection::vec(entry(), 0..8),
                fallback in vars(),
                inject in vars(),
                rows in 0u16..100,
                cols in 0u16..100,
            ) {
                let host = host();
                let config = LaunchConfig {
                    argv: vec![test_program().to_string()],
                    dir: None,
                    env: Some(env),
                    env_fallback: Some(fallback),
                    env_inject: Some(inject),
                    size: TermSize::new(rows, cols),
                };
                let once = normalize_in(config, &host).unwrap();
                let twice = normalize_in(once.clone(), &host).unwrap();
                prop_assert_eq!(once, twice);
            }

            #[test]
            fn injected_keys_appear_exactly_as_injected(
                env in prop::collection::vec(entry(), 0..8),
                fallback in vars(),
                inject in vars(),
            ) {
                let merged = apply_env_fallback_and_inject(&env, &fallback, &inject);
                for (key, value) in &inject {
                    let hits: Vec<_> = merged.iter().filter(|e| env_key(e) == key).collect();
                    if value.is_empty() {
                        prop_assert!(hits.is_empty());
                    } else {
                        let expected = format!("{key}={value}");
                        prop_assert_eq!(hits, vec![&expected]);
                    }
                }
            }
        }
    }
}
