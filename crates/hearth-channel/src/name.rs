//! Channel name rules.

/// Longest accepted channel name, in characters.
pub const MAX_NAME_LEN: usize = 64;

/// Returns `true` for 1 to [`MAX_NAME_LEN`] ASCII letters, digits, `-`, `_`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
