//! Windows environment block construction.
//!
//! `CreateProcessW` with `CREATE_UNICODE_ENVIRONMENT` takes the environment
//! as one UTF-16 buffer: every `KEY=VALUE` entry followed by a NUL, and one
//! more NUL after the last entry. Keys are case-insensitive on Windows, so
//! duplicates are collapsed first, keeping the last occurrence.
//!
//! Pure code, built on every platform so it can be tested anywhere.

use std::collections::HashSet;

/// Remove case-insensitive duplicate keys, keeping the last occurrence of
/// each and the relative order of the survivors.
///
/// Windows keeps per-drive working directories in variables such as
/// `=C:=C:\work`; for entries starting with `=` the separator is the first
/// `=` after that one. Entries without a separator are kept as-is; empty
/// entries are dropped.
pub fn dedup_env_case_insensitive(env: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(env.len());
    let mut kept = Vec::with_capacity(env.len());

    for entry in env.iter().rev() {
        match separator(entry) {
            Some(index) => {
                if seen.insert(entry[..index].to_lowercase()) {
                    kept.push(entry.clone());
                }
            }
            None if !entry.is_empty() => kept.push(entry.clone()),
            None => {}
        }
    }

    kept.reverse();
    kept
}

/// Serialize entries into a double-NUL-terminated UTF-16 block.
pub fn build_env_block(env: &[String]) -> Vec<u16> {
    if env.is_empty() {
        return vec![0, 0];
    }

    let len = env.iter().map(|entry| entry.len() + 1).sum::<usize>() + 1;
    let mut block = Vec::with_capacity(len);
    for entry in env {
        block.extend(entry.encode_utf16());
        block.push(0);
    }
    block.push(0);
    block
}

/// Parse a double-NUL-terminated block back into entries.
///
/// # Safety
///
/// `block` must point to a valid environment block as produced by
/// `CreateEnvironmentBlock` or [`build_env_block`].
pub unsafe fn parse_env_block(block: *const u16) -> Vec<String> {
    let mut env = Vec::new();
    let mut cursor = block;
    loop {
        let mut len = 0;
        while *cursor.add(len) != 0 {
            len += 1;
        }
        if len == 0 {
            break;
        }
        let entry = std::slice::from_raw_parts(cursor, len);
        env.push(String::from_utf16_lossy(entry));
        cursor = cursor.add(len + 1);
    }
    env
}

fn separator(entry: &str) -> Option<usize> {
    if let Some(rest) = entry.strip_prefix('=') {
        rest.find('=').map(|index| index + 1)
    } else {
        entry.find('=')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dedup_keeps_last_case_insensitive() {
        let env = strings(&["Path=a", "HOME=h", "PATH=b", "path=c", "X=1"]);
        assert_eq!(
            dedup_env_case_insensitive(&env),
            strings(&["HOME=h", "path=c", "X=1"])
        );
    }

    #[test]
    fn test_dedup_handles_drive_variables() {
        let env = strings(&["=C:=C:\\old", "=D:=D:\\", "=C:=C:\\new", "=ExitCode=0"]);
        assert_eq!(
            dedup_env_case_insensitive(&env),
            strings(&["=D:=D:\\", "=C:=C:\\new", "=ExitCode=0"])
        );
    }

    #[test]
    fn test_dedup_keeps_bare_and_drops_empty() {
        let env = strings(&["A", "", "A", "B=1", "=weird"]);
        assert_eq!(
            dedup_env_case_insensitive(&env),
            strings(&["A", "A", "B=1", "=weird"])
        );
    }

    #[test]
    fn test_empty_block() {
        assert_eq!(build_env_block(&[]), vec![0, 0]);
    }

    #[test]
    fn test_block_layout() {
        let block = build_env_block(&strings(&["A=1", "BC=é"]));
        let expected: Vec<u16> = "A=1\0BC=é\0\0".encode_utf16().collect();
        assert_eq!(block, expected);
    }

    #[test]
    fn test_block_parses_back() {
        let env = strings(&["A=1", "=C:=C:\\", "LANG=日本語"]);
        let block = build_env_block(&env);
        assert_eq!(unsafe { parse_env_block(block.as_ptr()) }, env);

        let empty = build_env_block(&[]);
        assert!(unsafe { parse_env_block(empty.as_ptr()) }.is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn block_is_entries_joined_by_nul(
                env in prop::collection::vec("[A-Za-z_]{1,4}=[a-z0-9 =é]{0,6}", 1..6),
            ) {
                let block = build_env_block(&env);
                prop_assert_eq!(&block[block.len() - 2..], &[0, 0]);

                let text = String::from_utf16(&block).unwrap();
                let mut joined = env.join("\0");
                joined.push_str("\0\0");
                prop_assert_eq!(text, joined);
            }

            #[test]
            fn dedup_leaves_unique_keys(
                env in prop::collection::vec("[a-cA-C]=[0-9]", 0..12),
            ) {
                let deduped = dedup_env_case_insensitive(&env);
                let mut keys: Vec<_> = deduped.iter().map(|e| e[..1].to_lowercase()).collect();
                let before = keys.len();
                keys.sort();
                keys.dedup();
                prop_assert_eq!(before, keys.len());
                if let Some(last) = env.last() {
                    prop_assert_eq!(deduped.last(), Some(last));
                }
            }
        }
    }
}
