//! Helpers shared by the session tests.

#![allow(dead_code)]

use std::io::{ErrorKind, Read};

use xpty::Pty;

/// Remove terminal escape sequences and carriage returns.
///
/// Handles CSI (`ESC [ ... final`), OSC (`ESC ] ... BEL` or `ESC ] ... ESC \`)
/// and two-byte escapes. ConPTY wraps even plain output in these.
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.next() {
                Some('[') => {
                    for c in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&c) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            },
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

/// Read until end of stream and return the stripped text.
pub fn read_all(pty: &dyn Pty) -> String {
    let mut output = Vec::new();
    let mut reader = pty;
    reader.read_to_end(&mut output).unwrap();
    strip_ansi(&String::from_utf8_lossy(&output))
}

/// Read until the stripped output contains `needle`, returning everything
/// read so far.
pub fn read_until(pty: &dyn Pty, needle: &str) -> String {
    let mut output = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let text = strip_ansi(&String::from_utf8_lossy(&output));
        if text.contains(needle) {
            return text;
        }
        match Pty::read(pty, &mut buf) {
            Ok(0) => panic!("end of stream before {needle:?}, got {text:?}"),
            Ok(n) => output.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => panic!("read failed: {e}"),
        }
    }
}

/// Non-empty trimmed lines.
pub fn lines(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

