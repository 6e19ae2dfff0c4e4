//! Host filename convention and wildcard matching.

use crate::error::{OasisError, Result};
use crate::endian::{FNAME_LEN, FTYPE_LEN};

/// Space-padded 8-byte OASIS name/type pair, parsed from or rendered to a
/// host "NAME.TYPE" string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OasisName {
    pub name: [u8; FNAME_LEN],
    pub file_type: [u8; FTYPE_LEN],
}

impl OasisName {
    pub fn from_fields(name: &str, file_type: &str) -> Result<Self> {
        if name.len() > FNAME_LEN {
            return Err(OasisError::invalid_argument(format!(
                "name '{name}' exceeds {FNAME_LEN} characters"
            )));
        }
        if file_type.len() > FTYPE_LEN {
            return Err(OasisError::invalid_argument(format!(
                "type '{file_type}' exceeds {FTYPE_LEN} characters"
            )));
        }
        let mut n = [b' '; FNAME_LEN];
        let mut t = [b' '; FTYPE_LEN];
        for (i, c) in name.to_ascii_uppercase().bytes().enumerate() {
            n[i] = c;
        }
        for (i, c) in file_type.to_ascii_uppercase().bytes().enumerate() {
            t[i] = c;
        }
        Ok(OasisName {
            name: n,
            file_type: t,
        })
    }

    fn trimmed_name(&self) -> &str {
        std::str::from_utf8(&self.name)
            .unwrap_or("")
            .trim_end_matches(' ')
    }

    fn trimmed_type(&self) -> &str {
        std::str::from_utf8(&self.file_type)
            .unwrap_or("")
            .trim_end_matches(' ')
    }

    /// Composes "NAME.TYPE", preserving the trailing dot for an empty type
    /// so round-tripping through [`Self::from_host_string`] stays unambiguous.
    pub fn to_host_string(&self) -> String {
        let name = self.trimmed_name();
        let file_type = self.trimmed_type();
        if file_type.is_empty() {
            format!("{name}.")
        } else {
            format!("{name}.{file_type}")
        }
    }

    /// Parses a host "NAME.TYPE" string, lenient on case, ignoring a
    /// trailing `_FMT[_RL]` extended suffix when `strip_suffix` is set.
    pub fn from_host_string(input: &str) -> Result<Self> {
        let (base, _suffix) = split_extended_suffix(input);
        let (name, file_type) = match base.split_once('.') {
            Some((n, t)) => (n, t),
            None => (base, ""),
        };
        Self::from_fields(name, file_type)
    }
}

/// Splits an optional extended `_FMT[_RL]` suffix off a host filename.
/// `FMT` is one of R, A, S, D, I, K and `RL` (if present) is an integer
/// record length, e.g. "FOO.TXT_S_128" -> ("FOO.TXT", Some(("S", Some(128)))).
pub fn split_extended_suffix(input: &str) -> (&str, Option<(char, Option<u32>)>) {
    let mut parts = input.rsplitn(3, '_');
    let last = parts.next();
    let second_last = parts.next();
    let rest = parts.next();

    // Try RL then FMT: "<base>_FMT_RL"
    if let (Some(rl_str), Some(fmt_str), Some(base)) = (last, second_last, rest) {
        if fmt_str.len() == 1 {
            if let Some(fmt) = valid_format_char(fmt_str) {
                if let Ok(rl) = rl_str.parse::<u32>() {
                    return (base, Some((fmt, Some(rl))));
                }
            }
        }
    }

    // Try just "<base>_FMT"
    if let Some(pos) = input.rfind('_') {
        let (base, fmt_str) = (&input[..pos], &input[pos + 1..]);
        if let Some(fmt) = valid_format_char(fmt_str) {
            return (base, Some((fmt, None)));
        }
    }

    (input, None)
}

fn valid_format_char(s: &str) -> Option<char> {
    if s.len() != 1 {
        return None;
    }
    let c = s.chars().next().unwrap().to_ascii_uppercase();
    if matches!(c, 'R' | 'A' | 'S' | 'D' | 'I' | 'K') {
        Some(c)
    } else {
        None
    }
}

/// Matches a wildcard pattern (`?` = any single char, `*` = any sequence,
/// possibly empty) against a composed "NAME.TYPE" string. Case-insensitive.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_ascii_uppercase().chars().collect();
    let text: Vec<char> = text.to_ascii_uppercase().chars().collect();
    match_chars(&pattern, &text)
}

fn match_chars(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            // '*' matches any sequence, including empty.
            match_chars(&pattern[1..], text) || (!text.is_empty() && match_chars(pattern, &text[1..]))
        }
        Some('?') => !text.is_empty() && match_chars(&pattern[1..], &text[1..]),
        Some(c) => {
            !text.is_empty() && *c == text[0] && match_chars(&pattern[1..], &text[1..])
        }
    }
}
