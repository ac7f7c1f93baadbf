//! POSIX shell quoting for commands synthesized by the tool mapper.

/// True when the token can be passed to a shell without quoting.
pub fn is_bare_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b'=' | b':' | b'@'))
}

/// Quotes a single token for a POSIX shell.
///
/// Bare tokens pass through untouched; everything else is wrapped in single
/// quotes with embedded `'` escaped as `'\''`.
pub fn shell_quote(token: &str) -> String {
    if is_bare_token(token) {
        return token.to_string();
    }
    format!("'{}'", token.replace('\'', "'\\''"))
}

/// Joins tokens into one command string, quoting each.
pub fn shell_join<I, S>(tokens: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tokens
        .into_iter()
        .map(|t| shell_quote(t.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
