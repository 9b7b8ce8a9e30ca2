//! Windows command line quoting.
//!
//! `CreateProcessW` takes a single command line string that the child splits
//! with `CommandLineToArgvW` rules: arguments are separated by spaces or tabs,
//! double quotes group, and backslashes are literal unless they precede a
//! double quote.

use std::borrow::Cow;

/// Quote `arg` so the child's argv parser reproduces it exactly.
pub fn escape_arg(arg: &str) -> Cow<'_, str> {
    if arg.is_empty() {
        return Cow::Borrowed("\"\"");
    }

    let needs_backslash = arg.contains(['"', '\\']);
    let has_space = arg.contains([' ', '\t']);

    if !needs_backslash && !has_space {
        return Cow::Borrowed(arg);
    }
    if !needs_backslash {
        return Cow::Owned(format!("\"{arg}\""));
    }

    let mut escaped = String::with_capacity(arg.len() + 2);
    if has_space {
        escaped.push('"');
    }
    let mut slashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => slashes += 1,
            '"' => {
                // Backslashes before a quote are doubled, then the quote itself
                // is escaped.
                escaped.extend(std::iter::repeat('\\').take(slashes + 1));
                slashes = 0;
            }
            _ => slashes = 0,
        }
        escaped.push(c);
    }
    if has_space {
        // Trailing backslashes would escape the closing quote.
        escaped.extend(std::iter::repeat('\\').take(slashes));
        escaped.push('"');
    }
    Cow::Owned(escaped)
}

/// Join `argv` into a single command line.
pub fn make_cmdline<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| escape_arg(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
